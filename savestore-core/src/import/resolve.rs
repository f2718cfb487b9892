//! Conflict resolution strategies
//!
//! Every strategy is a pure function of the stored values, the imported
//! values and the detected conflicts. Nothing here touches storage.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::conflict::{ConflictKind, TypeConflicts, ENTIRE_OBJECT};
use super::validation::STATISTIC_FIELDS;
use crate::manager::{PLAYER_DATA, SETTINGS, STATISTICS};
use crate::{DataError, OperationTag};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStrategy {
    /// Type-aware merge: maxima for numbers, unions for arrays
    #[default]
    Merge,
    /// Imported data wins
    Overwrite,
    /// Stored data wins
    Keep,
    /// Per-type caller choice, merge when unspecified
    Selective,
}

impl ResolutionStrategy {
    pub const ALL: [ResolutionStrategy; 4] = [
        ResolutionStrategy::Merge,
        ResolutionStrategy::Overwrite,
        ResolutionStrategy::Keep,
        ResolutionStrategy::Selective,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::Merge => "merge",
            ResolutionStrategy::Overwrite => "overwrite",
            ResolutionStrategy::Keep => "keep",
            ResolutionStrategy::Selective => "selective",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| {
                DataError::ConflictResolution(format!("unknown conflict resolution strategy: {s}"))
                    .tagged(OperationTag::ConflictResolution, "import")
            })
    }
}

/// Per-type choice for [`ResolutionStrategy::Selective`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Selection {
    Keep,
    Import,
}

impl FromStr for Selection {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep" => Ok(Selection::Keep),
            "import" => Ok(Selection::Import),
            other => Err(DataError::ConflictResolution(format!("unknown selection: {other}"))
                .tagged(OperationTag::ConflictResolution, "import")),
        }
    }
}

pub type Selections = BTreeMap<String, Selection>;

/// Replace every conflicting type in `user_data` with its resolved value
pub fn resolve(
    strategy: ResolutionStrategy,
    user_data: &Map<String, Value>,
    conflicts: &[TypeConflicts],
    selections: &Selections,
) -> Map<String, Value> {
    let mut resolved = user_data.clone();
    for conflict in conflicts {
        let value = resolve_type(strategy, conflict, selections);
        resolved.insert(conflict.data_type.clone(), value);
    }
    resolved
}

fn resolve_type(strategy: ResolutionStrategy, conflict: &TypeConflicts, selections: &Selections) -> Value {
    match strategy {
        ResolutionStrategy::Merge => merge_data(&conflict.data_type, &conflict.existing, &conflict.imported),
        ResolutionStrategy::Overwrite => conflict.imported.clone(),
        ResolutionStrategy::Keep => conflict.existing.clone(),
        ResolutionStrategy::Selective => match selections.get(&conflict.data_type) {
            Some(Selection::Import) => conflict.imported.clone(),
            Some(Selection::Keep) => conflict.existing.clone(),
            None => merge_data(&conflict.data_type, &conflict.existing, &conflict.imported),
        },
    }
}

/// Type-aware merge of a stored record with an imported one
pub fn merge_data(data_type: &str, existing: &Value, imported: &Value) -> Value {
    let (Some(existing), Some(imported)) = (existing.as_object(), imported.as_object()) else {
        return imported.clone();
    };

    match data_type {
        PLAYER_DATA => Value::Object(merge_player_data(existing, imported)),
        SETTINGS => {
            let mut merged = existing.clone();
            for (key, value) in imported {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        STATISTICS => {
            let mut merged = with_new_fields(existing, imported);
            for field in STATISTIC_FIELDS {
                take_max(&mut merged, existing, imported, field);
            }
            Value::Object(merged)
        }
        _ => Value::Object(imported.clone()),
    }
}

fn merge_player_data(existing: &Map<String, Value>, imported: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = with_new_fields(existing, imported);

    for field in ["ap", "tap", "maxHP"] {
        take_max(&mut merged, existing, imported, field);
    }

    if let (Some(Value::Object(ours)), Some(Value::Object(theirs))) = (existing.get("highScores"), imported.get("highScores")) {
        let mut scores = ours.clone();
        for (stage, score) in theirs {
            take_max(&mut scores, ours, theirs, stage);
            scores.entry(stage.clone()).or_insert_with(|| score.clone());
        }
        merged.insert("highScores".to_string(), Value::Object(scores));
    }

    for field in ["unlockedStages", "ownedItems"] {
        if let (Some(Value::Array(ours)), Some(Value::Array(theirs))) = (existing.get(field), imported.get(field)) {
            let mut union = ours.clone();
            for item in theirs {
                if !union.contains(item) {
                    union.push(item.clone());
                }
            }
            merged.insert(field.to_string(), Value::Array(union));
        }
    }
    merged
}

/// Stored fields plus imported fields the stored record lacks
fn with_new_fields(existing: &Map<String, Value>, imported: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = existing.clone();
    for (key, value) in imported {
        if !merged.contains_key(key) {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

fn take_max(target: &mut Map<String, Value>, existing: &Map<String, Value>, imported: &Map<String, Value>, field: &str) {
    let (Some(ours), Some(theirs)) = (existing.get(field), imported.get(field)) else {
        return;
    };
    if let (Some(a), Some(b)) = (ours.as_f64(), theirs.as_f64()) {
        let winner = if b > a { theirs } else { ours };
        target.insert(field.to_string(), winner.clone());
    }
}

/// What resolving one conflict (or one whole type) would do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionAction {
    TakeMaximum,
    MergeArrays,
    TakeHigherScore,
    TakeImported,
    KeepExisting,
}

impl ResolutionAction {
    pub fn describe(&self) -> &'static str {
        match self {
            ResolutionAction::TakeMaximum => "take maximum value",
            ResolutionAction::MergeArrays => "merge arrays",
            ResolutionAction::TakeHigherScore => "take higher score",
            ResolutionAction::TakeImported => "use imported data",
            ResolutionAction::KeepExisting => "keep existing data",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewAction {
    pub data_type: String,
    /// `None` when the action covers the whole type
    pub field: Option<String>,
    pub action: ResolutionAction,
    pub existing: Option<Value>,
    pub imported: Option<Value>,
    /// Value the field (or type) would end up with
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionPreview {
    pub strategy: ResolutionStrategy,
    pub actions: Vec<PreviewAction>,
}

/// Actions a strategy would take, computed without side effects
pub fn preview(strategy: ResolutionStrategy, conflicts: &[TypeConflicts], selections: &Selections) -> ResolutionPreview {
    let mut actions = Vec::new();
    for conflict in conflicts {
        let resolved = resolve_type(strategy, conflict, selections);
        let whole = |action: ResolutionAction, warning: &str| PreviewAction {
            data_type: conflict.data_type.clone(),
            field: None,
            action,
            existing: None,
            imported: None,
            result: resolved.clone(),
            warning: Some(warning.to_string()),
        };

        let selection = match strategy {
            ResolutionStrategy::Selective => selections.get(&conflict.data_type).copied(),
            _ => None,
        };
        match (strategy, selection) {
            (ResolutionStrategy::Overwrite, _) | (_, Some(Selection::Import)) => {
                actions.push(whole(ResolutionAction::TakeImported, "existing data will be lost"));
            }
            (ResolutionStrategy::Keep, _) | (_, Some(Selection::Keep)) => {
                actions.push(whole(ResolutionAction::KeepExisting, "import data will be ignored"));
            }
            _ => {
                for record in &conflict.conflicts {
                    actions.push(PreviewAction {
                        data_type: conflict.data_type.clone(),
                        field: Some(record.field.clone()),
                        action: merge_action(record.kind),
                        existing: Some(record.existing_value.clone()),
                        imported: Some(record.imported_value.clone()),
                        result: field_value(&resolved, &record.field),
                        warning: None,
                    });
                }
            }
        }
    }
    ResolutionPreview { strategy, actions }
}

fn merge_action(kind: ConflictKind) -> ResolutionAction {
    match kind {
        ConflictKind::ValueConflict | ConflictKind::StatisticConflict => ResolutionAction::TakeMaximum,
        ConflictKind::ArrayConflict => ResolutionAction::MergeArrays,
        ConflictKind::ScoreConflict => ResolutionAction::TakeHigherScore,
        ConflictKind::SettingConflict | ConflictKind::DataConflict => ResolutionAction::TakeImported,
    }
}

/// Look up a conflict field (`a` or `a.b`) in a resolved record
fn field_value(resolved: &Value, field: &str) -> Value {
    if field == ENTIRE_OBJECT {
        return resolved.clone();
    }
    match field.split_once('.') {
        Some((parent, child)) => resolved.get(parent).and_then(|p| p.get(child)),
        None => resolved.get(field),
    }
    .cloned()
    .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::conflict::compare_data;
    use serde_json::json;

    fn conflicts_for(data_type: &str, existing: Value, imported: Value) -> TypeConflicts {
        TypeConflicts {
            data_type: data_type.to_string(),
            conflicts: compare_data(data_type, &existing, &imported),
            existing,
            imported,
        }
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("selective".parse::<ResolutionStrategy>().unwrap(), ResolutionStrategy::Selective);
        let err = "newest".parse::<ResolutionStrategy>().unwrap_err();
        assert!(matches!(err.root(), DataError::ConflictResolution(_)));
        assert_eq!(err.tag(), Some(OperationTag::ConflictResolution));
        assert!(err.to_string().starts_with("[CONFLICT_RESOLUTION_ERROR]"));

        let err = "maybe".parse::<Selection>().unwrap_err();
        assert_eq!(err.tag(), Some(OperationTag::ConflictResolution));
    }

    #[test]
    fn test_merge_player_data() {
        let merged = merge_data(
            "playerData",
            &json!({"ap": 100, "tap": 900, "maxHP": 3, "highScores": {"stage1": 500, "stage2": 10},
                    "unlockedStages": ["a", "b"], "ownedItems": []}),
            &json!({"ap": 150, "tap": 100, "maxHP": 5, "highScores": {"stage1": 300, "stage3": 70},
                    "unlockedStages": ["b", "c"], "ownedItems": ["hat"], "title": "champion"}),
        );

        assert_eq!(merged["ap"], json!(150));
        assert_eq!(merged["tap"], json!(900));
        assert_eq!(merged["maxHP"], json!(5));
        assert_eq!(merged["highScores"], json!({"stage1": 500, "stage2": 10, "stage3": 70}));
        assert_eq!(merged["unlockedStages"], json!(["a", "b", "c"]));
        assert_eq!(merged["ownedItems"], json!(["hat"]));
        assert_eq!(merged["title"], json!("champion"));
    }

    #[test]
    fn test_merge_settings_prefers_import() {
        let merged = merge_data("settings", &json!({"volume": 5, "lang": "ja"}), &json!({"volume": 2}));
        assert_eq!(merged, json!({"volume": 2, "lang": "ja"}));
    }

    #[test]
    fn test_merge_unknown_type_takes_import() {
        assert_eq!(merge_data("stageLog", &json!({"a": 1}), &json!({"b": 2})), json!({"b": 2}));
        assert_eq!(merge_data("playerData", &json!([1]), &json!({"ap": 1})), json!({"ap": 1}));
    }

    #[test]
    fn test_resolve_by_strategy() {
        let conflicts = vec![
            conflicts_for("settings", json!({"volume": 5}), json!({"volume": 2})),
            conflicts_for("statistics", json!({"totalPlayTime": 50}), json!({"totalPlayTime": 80})),
        ];
        let user_data: Map<String, Value> = serde_json::from_value(json!({
            "settings": {"volume": 2},
            "statistics": {"totalPlayTime": 80},
            "stageLog": [1, 2, 3]
        }))
        .unwrap();
        let none = Selections::new();

        let kept = resolve(ResolutionStrategy::Keep, &user_data, &conflicts, &none);
        assert_eq!(kept["settings"], json!({"volume": 5}));
        assert_eq!(kept["stageLog"], json!([1, 2, 3]));

        let overwritten = resolve(ResolutionStrategy::Overwrite, &user_data, &conflicts, &none);
        assert_eq!(overwritten, user_data);

        let selections = Selections::from([("settings".to_string(), Selection::Keep)]);
        let selective = resolve(ResolutionStrategy::Selective, &user_data, &conflicts, &selections);
        assert_eq!(selective["settings"], json!({"volume": 5}));
        assert_eq!(selective["statistics"], json!({"totalPlayTime": 80}));
    }

    #[test]
    fn test_preview_merge_results() {
        let conflicts = vec![conflicts_for(
            "playerData",
            json!({"ap": 100, "highScores": {"stage1": 500}}),
            json!({"ap": 150, "highScores": {"stage1": 300}}),
        )];

        let preview = preview(ResolutionStrategy::Merge, &conflicts, &Selections::new());
        assert_eq!(preview.actions.len(), 2);
        assert_eq!(preview.actions[0].field.as_deref(), Some("ap"));
        assert_eq!(preview.actions[0].action, ResolutionAction::TakeMaximum);
        assert_eq!(preview.actions[0].result, json!(150));
        assert_eq!(preview.actions[1].action, ResolutionAction::TakeHigherScore);
        assert_eq!(preview.actions[1].result, json!(500));
    }

    #[test]
    fn test_preview_whole_type_strategies() {
        let conflicts = vec![conflicts_for("settings", json!({"volume": 5}), json!({"volume": 2}))];

        let keep = preview(ResolutionStrategy::Keep, &conflicts, &Selections::new());
        assert_eq!(keep.actions.len(), 1);
        assert_eq!(keep.actions[0].action, ResolutionAction::KeepExisting);
        assert_eq!(keep.actions[0].result, json!({"volume": 5}));

        let selections = Selections::from([("settings".to_string(), Selection::Import)]);
        let selective = preview(ResolutionStrategy::Selective, &conflicts, &selections);
        assert_eq!(selective.actions[0].action, ResolutionAction::TakeImported);
        assert_eq!(selective.actions[0].warning.as_deref(), Some("existing data will be lost"));
    }
}
