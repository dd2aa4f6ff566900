use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::PipelineError;

/// A flattened view of one decoded message, keyed by dot-joined field path.
pub type Row = Map<String, Value>;

/// The key field values identifying the entity a feature is computed for.
pub type Keys = BTreeMap<String, String>;

/// Flatten nested objects into dot-joined paths.
///
/// `{"a":{"b":1}}` becomes `{"a.b":1}`. Non-object values, including arrays, are kept as is.
pub fn flatten(row: Row) -> Row {
    let mut out = Map::with_capacity(row.len());
    flatten_into(&mut out, None, row);
    out
}

fn flatten_into(out: &mut Row, prefix: Option<&str>, row: Row) {
    for (key, val) in row {
        let path = match prefix {
            Some(prefix) => format!("{}.{}", prefix, key),
            None => key,
        };
        match val {
            Value::Object(nested) => flatten_into(out, Some(&path), nested),
            val => {
                out.insert(path, val);
            }
        }
    }
}

/// Parse the given JSON body as an object and flatten it into a row.
pub fn row_from_json(body: &[u8]) -> Result<Row, PipelineError> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(obj)) => Ok(flatten(obj)),
        Ok(other) => Err(PipelineError::Decode(format!("expected a JSON object, got {}", json_kind(&other)))),
        Err(err) => Err(PipelineError::Decode(err.to_string())),
    }
}

/// Extract the given key fields out of a flattened row, coercing each value into a string.
pub fn extract_keys(row: &Row, fields: &[String]) -> Result<Keys, PipelineError> {
    fields.iter().try_fold(Keys::new(), |mut acc, field| {
        let val = row.get(field).ok_or_else(|| PipelineError::MissingKey(field.clone()))?;
        acc.insert(field.clone(), key_string(val));
        Ok(acc)
    })
}

/// Coerce a row value into its key representation.
fn key_string(val: &Value) -> String {
    match val {
        Value::String(val) => val.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn json_kind(val: &Value) -> &'static str {
    match val {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
