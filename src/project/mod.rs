//! Projections of the raw broker dumps onto affected process instances.
//!
//! - [`variables`] keeps variables with the sentinel name and joins them to
//!   their owning process instance.
//! - [`flow_nodes`] reduces flow-node records to `(key, processInstanceKey)`
//!   pairs and narrows them to affected instances in bounded batches.

pub mod flow_nodes;
pub mod variables;

pub use flow_nodes::{
    FlowNodeMapping, ReduceStats, narrow_batch, narrow_flow_nodes, reduce_flow_node,
    reduce_flow_nodes,
};
pub use variables::{SentinelNameFilter, TextFilter, join_variables, project_variables};

use crate::core::{ReconcileError, Result};
use serde_json::Value;
use std::io::Read;

/// Iterates the records of a dump stream.
///
/// The dump tool writes concatenated JSON documents. A document is either a
/// `{"data": [...]}` envelope, a bare array, or a single record; all three are
/// flattened into one record stream.
pub fn raw_records<R: Read>(reader: R) -> impl Iterator<Item = Result<Value>> {
    serde_json::Deserializer::from_reader(reader)
        .into_iter::<Value>()
        .flat_map(|document| -> Vec<Result<Value>> {
            match document {
                Err(err) => vec![Err(ReconcileError::Malformed(format!(
                    "dump stream: {}",
                    err
                )))],
                Ok(Value::Object(mut envelope)) if envelope.get("data").is_some_and(Value::is_array) => {
                    match envelope.remove("data") {
                        Some(Value::Array(records)) => records.into_iter().map(Ok).collect(),
                        _ => Vec::new(),
                    }
                }
                Ok(Value::Array(records)) => records.into_iter().map(Ok).collect(),
                Ok(record) => vec![Ok(record)],
            }
        })
}
