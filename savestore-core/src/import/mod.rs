/*!
Import reconciliation.

An import runs `validate -> detect conflicts -> resolve -> commit`. Bundle
validation is the only hard gate: it runs before any read or write. Commit
writes the resolved types one by one through the [`DataManager`].

By default imports are best effort. A type that fails its final validation
or its write is skipped when partial imports are allowed; otherwise the
import stops there. With [`ImportConfig::atomic`] set, any failure restores
every type already committed by the same import.
*/

pub mod conflict;
pub mod resolve;
pub mod validation;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ImportConfig;
use crate::events::DataEvent;
use crate::manager::{DataManager, LoadOptions, SaveOptions};
use crate::observability::{self, MetricEvent};
use crate::{DataError, OperationTag, Result};

pub use conflict::{compare_data, ConflictKind, ConflictRecord, Recommendation, TypeConflicts};
pub use resolve::{
    merge_data, PreviewAction, ResolutionAction, ResolutionPreview, ResolutionStrategy, Selection, Selections,
};
pub use validation::{BundleValidator, DataValidator, StructuralValidator, ValidationReport};

/// Conflict count above which a preview warns
const MANY_CONFLICTS: usize = 10;

/// Per-call overrides
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Choices for [`ResolutionStrategy::Selective`]
    pub selections: Selections,
    pub allow_partial_import: Option<bool>,
    pub strict_version_check: Option<bool>,
    pub atomic: Option<bool>,
}

impl ImportOptions {
    pub fn select<S: Into<String>>(mut self, data_type: S, selection: Selection) -> Self {
        self.selections.insert(data_type.into(), selection);
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict_version_check = Some(true);
        self
    }

    pub fn atomic(mut self) -> Self {
        self.atomic = Some(true);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeImportResult {
    pub data_type: String,
    pub success: bool,
    /// Skipped after failing its final validation
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub import_id: String,
    pub success: bool,
    pub partial: bool,
    pub results: Vec<TypeImportResult>,
    pub imported_data_types: Vec<String>,
    pub failed_data_types: Vec<String>,
    /// Number of conflicting fields
    pub conflicts: usize,
    pub conflict_details: Vec<TypeConflicts>,
    pub conflict_resolution: ResolutionStrategy,
    pub validation: ValidationReport,
    pub duration_ms: u64,
    /// Duration went over the configured soft target
    pub exceeded_target: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportPreview {
    pub is_valid: bool,
    pub validation: ValidationReport,
    pub conflicts: Vec<TypeConflicts>,
    pub resolution_preview: ResolutionPreview,
    pub data_types: Vec<String>,
    /// Serialized `userData` size in bytes
    pub data_size: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastImport {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub partial: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportStatistics {
    pub total_imports: u64,
    pub successful_imports: u64,
    pub failed_imports: u64,
    pub partial_imports: u64,
    /// Mean over successful imports
    pub average_import_ms: u64,
    pub last_import: Option<LastImport>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportHistory {
    pub statistics: ImportStatistics,
    pub supported_resolutions: Vec<ResolutionStrategy>,
    pub config: ImportConfig,
}

/// Stored value of a type before the import touched it
#[derive(Debug, Clone)]
enum Prior {
    Absent,
    Present(Value),
    /// Load failed; the type cannot be restored
    Unreadable,
}

/// Validates, reconciles and commits import bundles
pub struct ImportManager {
    manager: Arc<DataManager>,
    config: ImportConfig,
    validator: Option<Arc<dyn DataValidator>>,
    statistics: Mutex<ImportStatistics>,
}

impl ImportManager {
    pub fn new(manager: Arc<DataManager>, config: ImportConfig) -> Self {
        Self {
            manager,
            config,
            validator: None,
            statistics: Mutex::new(ImportStatistics::default()),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn DataValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// Check a bundle without touching storage
    pub fn validate(&self, bundle: &Value, options: &ImportOptions) -> ValidationReport {
        BundleValidator {
            config: &self.config,
            game_version: &self.manager.config().game_version,
            strict_version_check: options
                .strict_version_check
                .unwrap_or(self.config.strict_version_check),
            validator: self.validator.as_deref(),
        }
        .validate(bundle)
    }

    /// Import `bundle`, resolving conflicts with `strategy`
    pub async fn import_data(
        &self,
        bundle: &Value,
        strategy: ResolutionStrategy,
        options: ImportOptions,
    ) -> Result<ImportOutcome> {
        let started = Instant::now();
        let import_id = Uuid::new_v4().to_string();
        observability::record(MetricEvent::Import);

        let validation = self.validate(bundle, &options);
        if !validation.is_valid {
            self.record(false, false, 0);
            let err = DataError::Validation {
                errors: validation.errors,
            }
            .tagged(OperationTag::ImportValidation, "import");
            warn!(import_id = %import_id, error = %err, "import rejected");
            return Err(err);
        }
        for warning in &validation.warnings {
            debug!(import_id = %import_id, warning = %warning, "import validation warning");
        }

        let user_data = validation::user_data(bundle);
        let (conflicts, priors) = self.detect_conflicts(&user_data).await;
        let resolved = resolve::resolve(strategy, &user_data, &conflicts, &options.selections);

        let outcome = self.commit(&import_id, resolved, &priors, &options).await;
        let duration = started.elapsed();
        let duration_ms = duration.as_millis() as u64;

        let results = match outcome {
            Ok(results) => results,
            Err(e) => {
                self.record(false, false, duration_ms);
                self.emit_completed(false, false, Vec::new(), duration_ms);
                let err = e.tagged(OperationTag::ImportExecution, "import");
                error!(import_id = %import_id, error = %err, "import aborted");
                return Err(err);
            }
        };

        let imported_data_types: Vec<String> = results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.data_type.clone())
            .collect();
        let failed_data_types: Vec<String> = results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.data_type.clone())
            .collect();
        let allow_partial = options
            .allow_partial_import
            .unwrap_or(self.config.allow_partial_import);
        let success = failed_data_types.is_empty();
        let partial = allow_partial && !failed_data_types.is_empty();

        let exceeded_target = duration > self.config.target_duration();
        if exceeded_target {
            warn!(
                import_id = %import_id,
                duration_ms,
                target_ms = self.config.target_duration_ms,
                "import exceeded its target duration"
            );
        }

        self.record(success, partial, duration_ms);
        self.emit_completed(success, partial, imported_data_types.clone(), duration_ms);
        info!(
            import_id = %import_id,
            strategy = %strategy,
            imported = imported_data_types.len(),
            failed = failed_data_types.len(),
            duration_ms,
            "import finished"
        );

        Ok(ImportOutcome {
            import_id,
            success,
            partial,
            results,
            imported_data_types,
            failed_data_types,
            conflicts: conflicts.iter().map(|c| c.conflicts.len()).sum(),
            conflict_details: conflicts,
            conflict_resolution: strategy,
            validation,
            duration_ms,
            exceeded_target,
        })
    }

    /// Everything [`import_data`](Self::import_data) would decide, without
    /// writing anything
    pub async fn preview_import(
        &self,
        bundle: &Value,
        strategy: ResolutionStrategy,
        options: &ImportOptions,
    ) -> Result<ImportPreview> {
        let validation = self.validate(bundle, options);
        let user_data = validation::user_data(bundle);
        let (conflicts, _) = self.detect_conflicts(&user_data).await;
        let resolution_preview = resolve::preview(strategy, &conflicts, &options.selections);
        let data_size = serde_json::to_vec(&Value::Object(user_data.clone()))?.len();

        Ok(ImportPreview {
            is_valid: validation.is_valid,
            warnings: self.preview_warnings(bundle, &conflicts),
            validation,
            resolution_preview,
            data_types: user_data.keys().cloned().collect(),
            data_size,
            conflicts,
        })
    }

    pub fn history(&self) -> ImportHistory {
        ImportHistory {
            statistics: self.lock_statistics().clone(),
            supported_resolutions: ResolutionStrategy::ALL.to_vec(),
            config: self.config.clone(),
        }
    }

    /// Load every imported type and compare it with the stored copy
    async fn detect_conflicts(&self, user_data: &Map<String, Value>) -> (Vec<TypeConflicts>, BTreeMap<String, Prior>) {
        let loads = user_data.keys().map(|data_type| async move {
            let prior = match self.manager.load(data_type, LoadOptions::uncached()).await {
                Ok(Value::Null) => Prior::Absent,
                Ok(value) => Prior::Present(value),
                Err(e) => {
                    warn!(data_type = %data_type, error = %e, "could not load stored data, assuming no conflict");
                    Prior::Unreadable
                }
            };
            (data_type.clone(), prior)
        });
        let priors: BTreeMap<String, Prior> = join_all(loads).await.into_iter().collect();

        let mut conflicts = Vec::new();
        for (data_type, imported) in user_data {
            let Some(Prior::Present(existing)) = priors.get(data_type) else {
                debug!(data_type = %data_type, "no stored data, no conflict");
                continue;
            };
            let records = conflict::compare_data(data_type, existing, imported);
            if !records.is_empty() {
                conflicts.push(TypeConflicts {
                    data_type: data_type.clone(),
                    existing: existing.clone(),
                    imported: imported.clone(),
                    conflicts: records,
                });
            }
        }
        (conflicts, priors)
    }

    async fn commit(
        &self,
        import_id: &str,
        resolved: Map<String, Value>,
        priors: &BTreeMap<String, Prior>,
        options: &ImportOptions,
    ) -> Result<Vec<TypeImportResult>> {
        let allow_partial = options
            .allow_partial_import
            .unwrap_or(self.config.allow_partial_import);
        let atomic = options.atomic.unwrap_or(self.config.atomic);

        let mut results = Vec::with_capacity(resolved.len());
        let mut committed: Vec<String> = Vec::new();

        for (data_type, data) in resolved {
            let failure = match self.final_check(&data_type, &data) {
                Err(e) => Some((e, true)),
                Ok(()) => self
                    .manager
                    .save(&data_type, data, SaveOptions::default())
                    .await
                    .err()
                    .map(|e| (e, false)),
            };

            let Some((err, skipped)) = failure else {
                debug!(import_id, data_type = %data_type, "type imported");
                committed.push(data_type.clone());
                results.push(TypeImportResult {
                    data_type,
                    success: true,
                    skipped: false,
                    error: None,
                });
                continue;
            };

            if atomic {
                warn!(import_id, data_type = %data_type, error = %err, committed = committed.len(), "rolling back import");
                self.rollback(import_id, &committed, priors).await;
                return Err(err);
            }
            if !allow_partial {
                return Err(err);
            }

            warn!(import_id, data_type = %data_type, error = %err, skipped, "type not imported");
            results.push(TypeImportResult {
                data_type,
                success: false,
                skipped,
                error: Some(err.to_string()),
            });
        }
        Ok(results)
    }

    /// Validator pass right before a type is written
    fn final_check(&self, data_type: &str, data: &Value) -> Result<()> {
        if !self.config.validate_before_import {
            return Ok(());
        }
        let Some(validator) = &self.validator else {
            return Ok(());
        };
        let problems = validator.validate(data_type, data);
        if problems.is_empty() {
            Ok(())
        } else {
            Err(DataError::Validation { errors: problems })
        }
    }

    /// Put every committed type back the way it was, newest first
    async fn rollback(&self, import_id: &str, committed: &[String], priors: &BTreeMap<String, Prior>) {
        for data_type in committed.iter().rev() {
            let restored = match priors.get(data_type) {
                Some(Prior::Present(value)) => self
                    .manager
                    .save(data_type, value.clone(), SaveOptions::default())
                    .await
                    .map(|_| ()),
                Some(Prior::Absent) => self.manager.delete(data_type).await.map(|_| ()),
                Some(Prior::Unreadable) | None => {
                    error!(import_id, data_type = %data_type, "cannot restore type, prior value unknown");
                    continue;
                }
            };
            match restored {
                Ok(()) => info!(import_id, data_type = %data_type, "import rolled back"),
                Err(e) => error!(import_id, data_type = %data_type, error = %e, "rollback failed"),
            }
        }
    }

    fn preview_warnings(&self, bundle: &Value, conflicts: &[TypeConflicts]) -> Vec<String> {
        let mut warnings = Vec::new();
        let total: usize = conflicts.iter().map(|c| c.conflicts.len()).sum();
        if total > MANY_CONFLICTS {
            warnings.push(format!("many conflicts detected ({total})"));
        }

        let critical = conflicts.iter().flat_map(|c| &c.conflicts).any(|record| {
            record.field == "ap" || record.field == "tap" || record.field.starts_with("highScores")
        });
        if critical {
            warnings.push("conflicts touch critical data (AP, TAP or high scores)".to_string());
        }

        let current = &self.manager.config().game_version;
        if let Some(version) = validation::bundle_version(bundle) {
            if version != current {
                warnings.push(format!("data from a different game version ({version} -> {current})"));
            }
        }
        warnings
    }

    fn emit_completed(&self, success: bool, partial: bool, data_types: Vec<String>, duration_ms: u64) {
        self.manager.events().emit(DataEvent::ImportCompleted {
            success,
            partial,
            data_types,
            duration_ms,
        });
    }

    fn record(&self, success: bool, partial: bool, duration_ms: u64) {
        let mut stats = self.lock_statistics();
        stats.total_imports += 1;
        if partial {
            stats.partial_imports += 1;
        }
        if success {
            stats.successful_imports += 1;
            let previous_total = stats.average_import_ms * (stats.successful_imports - 1);
            stats.average_import_ms = (previous_total + duration_ms) / stats.successful_imports;
        } else {
            stats.failed_imports += 1;
        }
        stats.last_import = Some(LastImport {
            timestamp: Utc::now(),
            success,
            partial,
            duration_ms,
        });
    }

    fn lock_statistics(&self) -> MutexGuard<'_, ImportStatistics> {
        self.statistics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
