use super::raw_records;
use crate::checkpoint;
use crate::core::{EntityKey, FlowNodeRef, Result};
use rayon::prelude::*;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::path::Path;
use tracing::{Level, event};

/// Composite flow-node key -> owning process instance key.
pub type FlowNodeMapping = BTreeMap<String, EntityKey>;

const OWNER_POINTER: &str = "/value/elementRecord/processInstanceRecord/processInstanceKey";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReduceStats {
    pub kept: usize,
    pub skipped: usize,
}

/// Reduces one raw flow-node record to its key and owning instance.
///
/// Returns `None` when the record carries no usable key or owner.
pub fn reduce_flow_node(record: &Value) -> Option<FlowNodeRef> {
    let key = match record.get("key")? {
        Value::String(key) => key.clone(),
        Value::Number(key) => key.to_string(),
        _ => return None,
    };
    let owner = record.pointer(OWNER_POINTER)?.as_u64()?;
    Some(FlowNodeRef {
        key,
        process_instance_key: owner,
    })
}

/// Streams a raw flow-node dump into a JSON array of [`FlowNodeRef`] at `out`.
pub fn reduce_flow_nodes<R: Read>(reader: R, out: &Path) -> Result<ReduceStats> {
    let mut skipped = 0usize;
    let refs = raw_records(reader).filter_map(|record| match record {
        Ok(record) => match reduce_flow_node(&record) {
            Some(reduced) => Some(Ok(reduced)),
            None => {
                skipped += 1;
                event!(Level::DEBUG, record = %record, "flow node record without owner skipped");
                None
            }
        },
        Err(err) => Some(Err(err)),
    });
    let kept = checkpoint::write_json_seq(out, refs)?;
    event!(Level::INFO, kept, skipped, "flow node instances reduced");
    Ok(ReduceStats { kept, skipped })
}

/// Merges the refs of `batch` owned by an affected instance into `mapping`.
///
/// Membership is tested in parallel; the merge walks survivors in encounter
/// order and keeps the first owner seen for a composite key.
pub fn narrow_batch(
    batch: &[FlowNodeRef],
    affected: &HashSet<EntityKey>,
    mapping: &mut FlowNodeMapping,
) -> usize {
    let survivors: Vec<&FlowNodeRef> = batch
        .par_iter()
        .filter(|flow_node| affected.contains(&flow_node.process_instance_key))
        .collect();
    let retained = survivors.len();
    for flow_node in survivors {
        mapping
            .entry(flow_node.key.clone())
            .or_insert(flow_node.process_instance_key);
    }
    retained
}

/// Builds the mapping of flow nodes belonging to affected instances by
/// streaming the reduced file at `reduced` in batches of `batch_size`.
pub fn narrow_flow_nodes(
    reduced: &Path,
    affected: &HashSet<EntityKey>,
    batch_size: usize,
) -> Result<FlowNodeMapping> {
    let mut mapping = FlowNodeMapping::new();
    let mut batches = 0usize;
    let scanned = checkpoint::for_each_json_batch(reduced, batch_size, |batch: Vec<FlowNodeRef>| {
        batches += 1;
        let retained = narrow_batch(&batch, affected, &mut mapping);
        event!(
            Level::DEBUG,
            batch = batches,
            size = batch.len(),
            retained,
            "flow node batch narrowed"
        );
        Ok(())
    })?;
    event!(
        Level::INFO,
        scanned,
        batches,
        retained = mapping.len(),
        "flow node instances narrowed to affected instances"
    );
    Ok(mapping)
}
