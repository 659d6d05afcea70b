//! JSON config merging. Values present in the user's copy always win; the
//! incoming framework copy only contributes keys the user does not have.

use anyhow::{Context, Result};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergeMode {
    /// Only top-level keys are considered.
    Shallow,
    /// Objects are merged recursively.
    #[default]
    Deep,
}

pub fn merge_json(user: &Value, incoming: &Value, mode: MergeMode) -> Value {
    match (user, incoming) {
        (Value::Object(user_map), Value::Object(incoming_map)) => {
            Value::Object(merge_maps(user_map, incoming_map, mode))
        }
        _ => user.clone(),
    }
}

fn merge_maps(
    user: &Map<String, Value>,
    incoming: &Map<String, Value>,
    mode: MergeMode,
) -> Map<String, Value> {
    let mut merged = user.clone();
    for (key, incoming_value) in incoming {
        match merged.get_mut(key) {
            None => {
                merged.insert(key.clone(), incoming_value.clone());
            }
            Some(user_value) => {
                if mode == MergeMode::Deep {
                    if let (Value::Object(user_child), Value::Object(incoming_child)) =
                        (&*user_value, incoming_value)
                    {
                        *user_value = Value::Object(merge_maps(user_child, incoming_child, mode));
                    }
                }
            }
        }
    }
    merged
}

/// Merges two JSON documents, returning pretty-printed text with a trailing newline.
pub fn merge_config_text(user: &str, incoming: &str, mode: MergeMode) -> Result<String> {
    let user: Value = serde_json::from_str(user).context("user config is not valid JSON")?;
    let incoming: Value =
        serde_json::from_str(incoming).context("framework config is not valid JSON")?;
    let mut text = serde_json::to_string_pretty(&merge_json(&user, &incoming, mode))
        .context("failed to serialize merged config")?;
    text.push('\n');
    Ok(text)
}
