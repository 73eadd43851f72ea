use super::{FlowNodeMapping, raw_records};
use crate::core::{JoinedVariable, RawVariable, ReconcileError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use serde_json::Value;
use std::io::Read;
use tracing::{Level, event};

/// Decides which variable records survive the name projection.
pub trait TextFilter: Send + Sync {
    fn matches(&self, record_key: &str) -> bool;
}

/// Keeps records keyed `<digits>:<name>` for one well-known variable name.
#[derive(Debug, Clone)]
pub struct SentinelNameFilter {
    name: String,
    pattern: Regex,
}

impl SentinelNameFilter {
    pub fn new(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(ReconcileError::Config(
                "variable name must not be empty".to_string(),
            ));
        }
        let pattern = Regex::new(&format!("^[0-9]+:{}$", regex::escape(name)))
            .map_err(|err| ReconcileError::Config(format!("variable name '{}': {}", name, err)))?;
        Ok(Self {
            name: name.to_string(),
            pattern,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl TextFilter for SentinelNameFilter {
    fn matches(&self, record_key: &str) -> bool {
        self.pattern.is_match(record_key)
    }
}

/// Reads a raw variable dump and keeps the records accepted by `filter`.
pub fn project_variables<R: Read>(reader: R, filter: &dyn TextFilter) -> Result<Vec<RawVariable>> {
    let mut kept = Vec::new();
    let mut scanned = 0usize;
    for record in raw_records(reader) {
        let record = record?;
        scanned += 1;
        let Some(key) = record.get("key").and_then(Value::as_str) else {
            continue;
        };
        if !filter.matches(key) {
            continue;
        }
        let variable: RawVariable = serde_json::from_value(record).map_err(|err| {
            ReconcileError::Malformed(format!("variable record #{}: {}", scanned, err))
        })?;
        kept.push(variable);
    }
    event!(Level::INFO, scanned, kept = kept.len(), "variables projected");
    Ok(kept)
}

/// Joins projected variables to the process instance owning their scope.
///
/// Variables whose scope is not in `mapping` belong to unaffected instances
/// and are dropped.
pub fn join_variables(
    variables: &[RawVariable],
    mapping: &FlowNodeMapping,
) -> Result<Vec<JoinedVariable>> {
    let mut joined = Vec::new();
    for variable in variables {
        let scope_key = variable.scope_key();
        let Some(&owner) = mapping.get(scope_key) else {
            continue;
        };
        let decoded = STANDARD.decode(variable.value.value.as_bytes()).map_err(|err| {
            ReconcileError::Malformed(format!(
                "variable '{}' value is not base64: {}",
                variable.key, err
            ))
        })?;
        joined.push(JoinedVariable {
            key: variable.key.clone(),
            variable_key: variable.value.key.clone(),
            process_instance_key: owner,
            flow_node_instance_key: scope_key.to_string(),
            value_base64: variable.value.value.clone(),
            value: String::from_utf8_lossy(&decoded).into_owned(),
        });
    }
    event!(
        Level::INFO,
        candidates = variables.len(),
        joined = joined.len(),
        "variables joined to affected instances"
    );
    Ok(joined)
}
