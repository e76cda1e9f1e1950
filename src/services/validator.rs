//! Converts loosely-shaped generation output into a `ChapterContent`.
//!
//! Nothing returned by a backend reaches the timeline without passing
//! through [`validate`].

use crate::core::error::{StoryError, StoryResult};
use crate::core::model::ChapterContent;
use crate::core::stage::NarrativeStage;
use log::{debug, warn};
use serde_json::{json, Map, Value};

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json").trim_end_matches("```").trim().to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```").trim_end_matches("```").trim().to_string()
    } else {
        s.to_string()
    }
}

/// Response schema handed to backends that support structured output.
pub fn chapter_schema() -> Value {
    let stages: Vec<&str> = NarrativeStage::ALL.iter().map(|s| s.as_str()).collect();
    json!({
        "type": "OBJECT",
        "properties": {
            "text": { "type": "STRING" },
            "choices": { "type": "ARRAY", "items": { "type": "STRING" } },
            "newThemes": { "type": "ARRAY", "items": { "type": "STRING" } },
            "newCharacters": { "type": "ARRAY", "items": { "type": "STRING" } },
            "isEnding": { "type": "BOOLEAN" },
            "narrativeStage": { "type": "STRING", "enum": stages }
        },
        "required": ["text", "choices", "isEnding", "narrativeStage"]
    })
}

pub fn validate(raw: &str) -> StoryResult<ChapterContent> {
    let cleaned = strip_code_blocks(raw);
    let value: Value = serde_json::from_str(&cleaned)
        .map_err(|e| StoryError::malformed(format!("response is not valid JSON: {}", e)))?;
    let obj = value
        .as_object()
        .ok_or_else(|| StoryError::malformed("response is not a JSON object"))?;

    let text = match obj.get("text") {
        Some(Value::String(t)) if !t.trim().is_empty() => t.trim().to_string(),
        Some(Value::String(_)) => return Err(StoryError::malformed("chapter text is empty")),
        _ => return Err(StoryError::malformed("chapter text is missing")),
    };

    let is_ending = obj.get("isEnding").and_then(Value::as_bool).unwrap_or(false);

    let mut choices = match obj.get("choices") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect(),
        Some(_) => return Err(StoryError::malformed("choices is not an array")),
    };
    if is_ending {
        if !choices.is_empty() {
            debug!("Dropping {} choices offered on an ending", choices.len());
        }
        choices.clear();
    } else if choices.is_empty() {
        return Err(StoryError::malformed("a non-ending chapter offered no choices"));
    }

    let narrative_stage = parse_stage(obj);

    Ok(ChapterContent {
        text,
        choices,
        new_themes: string_list(obj, "newThemes"),
        new_characters: string_list(obj, "newCharacters"),
        is_ending,
        narrative_stage,
    })
}

fn parse_stage(obj: &Map<String, Value>) -> NarrativeStage {
    match obj.get("narrativeStage") {
        Some(Value::String(name)) => name.parse().unwrap_or_else(|_| {
            warn!(
                "Unknown narrative stage {:?}, using {}",
                name,
                NarrativeStage::FALLBACK
            );
            NarrativeStage::FALLBACK
        }),
        other => {
            warn!(
                "Missing narrative stage ({:?}), using {}",
                other,
                NarrativeStage::FALLBACK
            );
            NarrativeStage::FALLBACK
        }
    }
}

/// `obj[key]` if it is an array made only of strings, otherwise nothing.
fn string_list(obj: &Map<String, Value>, key: &str) -> Vec<String> {
    let Some(Value::Array(items)) = obj.get(key) else {
        return Vec::new();
    };
    let names: Option<Vec<String>> = items
        .iter()
        .map(|item| item.as_str().map(|s| s.trim().to_string()))
        .collect();
    match names {
        Some(names) => names.into_iter().filter(|s| !s.is_empty()).collect(),
        None => {
            debug!("Ignoring {} with non-string entries", key);
            Vec::new()
        }
    }
}
