//! Loads a workflow definition JSON file, substituting `$VAR`-prefixed
//! tokens from the environment at load time. A missing variable aborts
//! registration with a human-readable error rather than shipping a
//! half-substituted definition.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;

pub fn load(path: &std::path::Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading workflow definition {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("parsing workflow definition {}", path.display()))?;
    substitute(value)
}

fn substitute(value: Value) -> Result<Value> {
    match value {
        Value::String(s) => Ok(Value::String(substitute_string(&s)?)),
        Value::Array(items) => items
            .into_iter()
            .map(substitute)
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| substitute(v).map(|v| (k, v)))
            .collect::<Result<serde_json::Map<_, _>>>()
            .map(Value::Object),
        other => Ok(other),
    }
}

fn substitute_string(s: &str) -> Result<String> {
    if let Some(var_name) = s.strip_prefix('$') {
        if !var_name.is_empty() && var_name.chars().all(|c| c.is_ascii_uppercase() || c == '_') {
            return std::env::var(var_name)
                .map_err(|_| anyhow!("workflow definition references undefined variable ${var_name}"));
        }
    }
    Ok(s.to_string())
}
