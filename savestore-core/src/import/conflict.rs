//! Field-level comparison of stored data against imported data

use serde::Serialize;
use serde_json::{Map, Value};

use super::validation::STATISTIC_FIELDS;
use crate::manager::{PLAYER_DATA, SETTINGS, STATISTICS};

/// Field name used when a whole record is compared at once
pub const ENTIRE_OBJECT: &str = "entire_object";

const PLAYER_SCALARS: [&str; 3] = ["ap", "tap", "maxHP"];
const PLAYER_ARRAYS: [&str; 2] = ["unlockedStages", "ownedItems"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictKind {
    ValueConflict,
    ArrayConflict,
    ScoreConflict,
    SettingConflict,
    StatisticConflict,
    DataConflict,
}

/// Which side a statistic conflict should favour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Recommendation {
    Keep,
    Import,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub data_type: String,
    /// Field name, `highScores.<stage>` for scores, or [`ENTIRE_OBJECT`]
    pub field: String,
    pub existing_value: Value,
    pub imported_value: Value,
    pub kind: ConflictKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<Recommendation>,
}

/// Every conflict found for one data type, with both full values
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeConflicts {
    pub data_type: String,
    pub existing: Value,
    pub imported: Value,
    pub conflicts: Vec<ConflictRecord>,
}

/// Compare `existing` and `imported` with the comparator for `data_type`
pub fn compare_data(data_type: &str, existing: &Value, imported: &Value) -> Vec<ConflictRecord> {
    let conflict = |field: &str, existing: &Value, imported: &Value, kind: ConflictKind| ConflictRecord {
        data_type: data_type.to_string(),
        field: field.to_string(),
        existing_value: existing.clone(),
        imported_value: imported.clone(),
        kind,
        recommendation: None,
    };

    let (existing_map, imported_map) = match (existing.as_object(), imported.as_object()) {
        (Some(e), Some(i)) if matches!(data_type, PLAYER_DATA | SETTINGS | STATISTICS) => (e, i),
        _ => {
            // Serialized text, so key order counts as a difference
            return if existing.to_string() != imported.to_string() {
                vec![conflict(ENTIRE_OBJECT, existing, imported, ConflictKind::DataConflict)]
            } else {
                Vec::new()
            };
        }
    };

    let mut conflicts = Vec::new();
    let mut compare_shared = |field: &str, kind: ConflictKind| {
        if let (Some(e), Some(i)) = (existing_map.get(field), imported_map.get(field)) {
            if e != i {
                conflicts.push(conflict(field, e, i, kind));
            }
        }
    };

    match data_type {
        PLAYER_DATA => {
            for field in PLAYER_SCALARS {
                compare_shared(field, ConflictKind::ValueConflict);
            }
            for field in PLAYER_ARRAYS {
                compare_shared(field, ConflictKind::ArrayConflict);
            }
            compare_scores(existing_map, imported_map, &mut |stage, e, i| {
                conflicts.push(conflict(&format!("highScores.{stage}"), e, i, ConflictKind::ScoreConflict));
            });
        }
        SETTINGS => {
            for key in imported_map.keys() {
                compare_shared(key, ConflictKind::SettingConflict);
            }
        }
        _ => {
            for field in STATISTIC_FIELDS {
                compare_shared(field, ConflictKind::StatisticConflict);
            }
            for record in &mut conflicts {
                record.recommendation = Some(recommend(&record.existing_value, &record.imported_value));
            }
        }
    }
    conflicts
}

fn compare_scores<F>(existing: &Map<String, Value>, imported: &Map<String, Value>, on_conflict: &mut F)
where
    F: FnMut(&str, &Value, &Value),
{
    let (Some(Value::Object(ours)), Some(Value::Object(theirs))) = (existing.get("highScores"), imported.get("highScores"))
    else {
        return;
    };
    for (stage, score) in theirs {
        if let Some(current) = ours.get(stage) {
            if current != score {
                on_conflict(stage, current, score);
            }
        }
    }
}

fn recommend(existing: &Value, imported: &Value) -> Recommendation {
    match (existing.as_f64(), imported.as_f64()) {
        (Some(e), Some(i)) if e > i => Recommendation::Keep,
        (Some(_), None) => Recommendation::Keep,
        _ => Recommendation::Import,
    }
}
