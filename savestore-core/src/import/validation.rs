//! Bundle checks run before an import touches storage
//!
//! Four independent checks (format, version, integrity, size) each produce
//! errors and warnings. Any error rejects the bundle.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::chunk;
use crate::config::ImportConfig;
use crate::manager::{is_valid_data_type, CORE_DATA_TYPES, PLAYER_DATA, STATISTICS};

/// Per-type structural validator consulted during integrity checks and
/// right before each type is committed
pub trait DataValidator: Send + Sync {
    /// Problems found in `data`; empty when it is acceptable
    fn validate(&self, data_type: &str, data: &Value) -> Vec<String>;
}

/// Shape rules for the core save types
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralValidator;

const PLAYER_NUMBERS: [&str; 3] = ["ap", "tap", "maxHP"];
const PLAYER_ARRAYS: [&str; 2] = ["unlockedStages", "ownedItems"];
pub(crate) const STATISTIC_FIELDS: [&str; 3] = ["totalPlayTime", "totalGamesPlayed", "totalBubblesPopped"];

impl DataValidator for StructuralValidator {
    fn validate(&self, data_type: &str, data: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        if !CORE_DATA_TYPES.contains(&data_type) {
            return errors;
        }
        let Some(object) = data.as_object() else {
            errors.push(format!("{data_type} must be an object"));
            return errors;
        };

        match data_type {
            PLAYER_DATA => {
                for field in PLAYER_NUMBERS {
                    check_non_negative(object, field, &mut errors);
                }
                for field in PLAYER_ARRAYS {
                    if object.get(field).is_some_and(|v| !v.is_array()) {
                        errors.push(format!("{field} must be an array"));
                    }
                }
                match object.get("highScores") {
                    Some(Value::Object(scores)) => {
                        for (stage, score) in scores {
                            if !score.is_number() {
                                errors.push(format!("highScores.{stage} must be a number"));
                            }
                        }
                    }
                    Some(_) => errors.push("highScores must be an object".to_string()),
                    None => {}
                }
            }
            STATISTICS => {
                for field in STATISTIC_FIELDS {
                    check_non_negative(object, field, &mut errors);
                }
            }
            _ => {}
        }
        errors
    }
}

fn check_non_negative(object: &Map<String, Value>, field: &str, errors: &mut Vec<String>) {
    match object.get(field) {
        None => {}
        Some(value) => match value.as_f64() {
            Some(n) if n >= 0.0 => {}
            Some(_) => errors.push(format!("{field} must not be negative")),
            None => errors.push(format!("{field} must be a number")),
        },
    }
}

/// Errors and warnings from one check
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl CheckResult {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }
}

/// Aggregate of every check
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub checks: Vec<CheckResult>,
}

impl ValidationReport {
    fn from_checks(checks: Vec<CheckResult>) -> Self {
        let errors: Vec<String> = checks.iter().flat_map(|c| c.errors.iter().cloned()).collect();
        let warnings = checks.iter().flat_map(|c| c.warnings.iter().cloned()).collect();
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings,
            checks,
        }
    }
}

/// Types carried by a bundle: its `userData` object, or for legacy bundles
/// every top-level entry except `header` and `metadata`
pub fn user_data(bundle: &Value) -> Map<String, Value> {
    match bundle.get("userData") {
        Some(Value::Object(user_data)) => user_data.clone(),
        Some(_) => Map::new(),
        None => bundle
            .as_object()
            .map(|object| {
                object
                    .iter()
                    .filter(|(key, _)| key.as_str() != "header" && key.as_str() != "metadata")
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default(),
    }
}

/// `header.gameVersion` when present
pub fn bundle_version(bundle: &Value) -> Option<&str> {
    bundle.get("header")?.get("gameVersion")?.as_str()
}

/// Runs the bundle checks against one configuration
pub struct BundleValidator<'a> {
    pub config: &'a ImportConfig,
    pub game_version: &'a str,
    pub strict_version_check: bool,
    pub validator: Option<&'a dyn DataValidator>,
}

impl BundleValidator<'_> {
    pub fn validate(&self, bundle: &Value) -> ValidationReport {
        ValidationReport::from_checks(vec![
            self.check_format(bundle),
            self.check_version(bundle),
            self.check_integrity(bundle),
            self.check_size(bundle),
        ])
    }

    fn check_format(&self, bundle: &Value) -> CheckResult {
        let mut check = CheckResult::new("format");
        let Some(object) = bundle.as_object() else {
            check.errors.push("import data must be an object".to_string());
            return check;
        };

        match object.get("header") {
            Some(header) => {
                let format = header.get("format").and_then(Value::as_str);
                if format != Some(self.config.expected_format.as_str()) {
                    check
                        .warnings
                        .push(format!("unknown format: {}", format.unwrap_or("none")));
                }
            }
            None => check.warnings.push("no header information found".to_string()),
        }

        match object.get("userData") {
            Some(Value::Object(_)) => {}
            Some(_) => check.errors.push("userData must be an object".to_string()),
            None if object.contains_key(PLAYER_DATA) => check
                .warnings
                .push("legacy bundle without userData".to_string()),
            None => check.errors.push("no user data found in import".to_string()),
        }
        check
    }

    fn check_version(&self, bundle: &Value) -> CheckResult {
        let mut check = CheckResult::new("version");
        let Some(import_version) = bundle_version(bundle) else {
            return check;
        };
        let current = self.game_version;

        if self.strict_version_check {
            if import_version != current {
                check
                    .errors
                    .push(format!("version mismatch: {import_version} != {current}"));
            }
            return check;
        }

        match (major_version(import_version), major_version(current)) {
            (Some(imported), Some(ours)) if imported > ours => check
                .errors
                .push(format!("import version too new: {import_version} > {current}")),
            (Some(imported), Some(ours)) if imported < ours => check
                .warnings
                .push(format!("import version older: {import_version} < {current}")),
            (Some(_), Some(_)) => {}
            _ => check
                .warnings
                .push(format!("unrecognized version: {import_version}")),
        }
        check
    }

    fn check_integrity(&self, bundle: &Value) -> CheckResult {
        let mut check = CheckResult::new("integrity");
        if !bundle.is_object() {
            return check;
        }
        let user_data = user_data(bundle);

        if let Some(expected) = bundle
            .get("metadata")
            .and_then(|m| m.get("checksum"))
            .and_then(Value::as_str)
        {
            match chunk::checksum(&Value::Object(user_data.clone())) {
                Ok(actual) if actual == expected => {}
                Ok(_) => check.errors.push("checksum mismatch".to_string()),
                Err(e) => check.errors.push(format!("checksum failed: {e}")),
            }
        }

        for (data_type, data) in &user_data {
            if !is_valid_data_type(data_type) {
                check.errors.push(format!("invalid data type name '{data_type}'"));
                continue;
            }
            if let Some(validator) = self.validator {
                let problems = validator.validate(data_type, data);
                if !problems.is_empty() {
                    check
                        .errors
                        .push(format!("invalid {data_type}: {}", problems.join(", ")));
                }
            }
        }
        check
    }

    fn check_size(&self, bundle: &Value) -> CheckResult {
        let mut check = CheckResult::new("size");
        let size = match serde_json::to_vec(bundle) {
            Ok(bytes) => bytes.len(),
            Err(e) => {
                check.errors.push(format!("size check failed: {e}"));
                return check;
            }
        };

        if size > self.config.max_import_size {
            check.errors.push(format!(
                "import data too large: {size} > {}",
                self.config.max_import_size
            ));
        } else if size > self.config.size_warning_threshold {
            check.warnings.push(format!(
                "large import data: {:.2}MB",
                size as f64 / 1024.0 / 1024.0
            ));
        }
        check
    }
}

fn major_version(version: &str) -> Option<u64> {
    version.split('.').next()?.trim().parse().ok()
}
