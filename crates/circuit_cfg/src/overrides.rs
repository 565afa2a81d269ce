use crate::{CfgError, SimConfig};
use serde_yaml::Value;

/// One dotted-path config override, e.g. `run.seeds.conn=4321`.
#[derive(Debug, Clone, PartialEq)]
pub struct Override {
    pub path: String,
    pub value: Value,
}

impl Override {
    pub fn new(path: impl Into<String>, value: Value) -> Self {
        Override {
            path: path.into(),
            value,
        }
    }

    /// Parses `key=value`; the value side is read as YAML, so numbers,
    /// booleans and quoted strings all work.
    pub fn parse(text: &str) -> Result<Self, CfgError> {
        let (path, raw) = text
            .split_once('=')
            .ok_or_else(|| CfgError::MalformedOverride(text.to_string()))?;
        if path.trim().is_empty() {
            return Err(CfgError::MalformedOverride(text.to_string()));
        }
        let value: Value = serde_yaml::from_str(raw)?;
        Ok(Override {
            path: path.trim().to_string(),
            value,
        })
    }
}

/// Applies overrides through a YAML round-trip so the dotted paths follow
/// the serialized field names. Unknown paths are errors, as is a value
/// the config schema rejects.
pub fn apply_overrides(cfg: &SimConfig, overrides: &[Override]) -> Result<SimConfig, CfgError> {
    if overrides.is_empty() {
        return Ok(cfg.clone());
    }
    let mut root = serde_yaml::to_value(cfg)?;
    for entry in overrides {
        set_path(&mut root, &entry.path, entry.value.clone())?;
    }
    Ok(serde_yaml::from_value(root)?)
}

fn set_path(root: &mut Value, path: &str, value: Value) -> Result<(), CfgError> {
    let mut current = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let mapping = current
            .as_mapping_mut()
            .ok_or_else(|| CfgError::UnknownPath(path.to_string()))?;
        let key = Value::String(segment.to_string());
        let slot = mapping
            .get_mut(&key)
            .ok_or_else(|| CfgError::UnknownPath(path.to_string()))?;
        if segments.peek().is_none() {
            *slot = value;
            return Ok(());
        }
        current = slot;
    }
    Err(CfgError::UnknownPath(path.to_string()))
}
