use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ReconcileError, Result};

/// Key of one process instance as allocated by the broker.
pub type EntityKey = u64;

/// Inclusive interval of keys allocated while the broker was losing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LostRange {
    pub start: EntityKey,
    pub end: EntityKey,
}

impl LostRange {
    pub fn new(start: EntityKey, end: EntityKey) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, key: EntityKey) -> bool {
        self.start <= key && key <= self.end
    }
}

/// Validated, immutable set of lost ranges, sorted by start key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LostRanges {
    ranges: Vec<LostRange>,
}

impl LostRanges {
    /// Builds the set, rejecting inverted or overlapping intervals.
    pub fn new(mut ranges: Vec<LostRange>) -> Result<Self> {
        ranges.sort_by_key(|range| range.start);
        for range in &ranges {
            if range.start > range.end {
                return Err(ReconcileError::Config(format!(
                    "Lost range [{}, {}] has start after end",
                    range.start, range.end
                )));
            }
        }
        for pair in ranges.windows(2) {
            if pair[1].start <= pair[0].end {
                return Err(ReconcileError::Config(format!(
                    "Lost ranges [{}, {}] and [{}, {}] overlap",
                    pair[0].start, pair[0].end, pair[1].start, pair[1].end
                )));
            }
        }
        Ok(Self { ranges })
    }

    /// Key intervals lost on partitions 35..=50 during the August 2024 incident.
    pub fn incident_defaults() -> Self {
        const RANGES: [(EntityKey, EntityKey); 16] = [
            (78812994103625574, 78812994150953317),
            (81064793917882551, 81064793965226886),
            (83316593730761667, 83316593778317768),
            (85568393546200767, 85568393602626029),
            (87820193363336055, 87820193410897193),
            (90071993172277585, 90071993219787111),
            (92323792985885583, 92323793042216457),
            (94575592799336956, 94575592846901442),
            (96827392622659782, 96827392670183355),
            (99079192426623046, 99079192474176354),
            (101330992240725619, 101330992288155839),
            (103582792055011995, 103582792090054675),
            (105834591868049820, 105834591903161157),
            (108086391686847593, 108086391734299745),
            (110338191495794589, 110338191543347098),
            (112589991308498236, 112589991355937963),
        ];
        Self {
            ranges: RANGES
                .iter()
                .map(|&(start, end)| LostRange::new(start, end))
                .collect(),
        }
    }

    pub fn is_affected(&self, key: EntityKey) -> bool {
        self.ranges.iter().any(|range| range.contains(key))
    }

    pub fn ranges(&self) -> &[LostRange] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Flow-node instance reduced to its composite key and owning process instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowNodeRef {
    pub key: String,
    pub process_instance_key: EntityKey,
}

/// Variable record as dumped from the broker's `VARIABLES` column family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawVariable {
    /// `<scopeKey>:<name>`
    pub key: String,
    pub value: VariableValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Value>,
    /// Base64 encoded payload.
    pub value: String,
}

impl RawVariable {
    /// Scope key owning the variable: everything before the first `:`.
    pub fn scope_key(&self) -> &str {
        self.key.split(':').next().unwrap_or_default()
    }

    /// Variable name: everything after the first `:`.
    pub fn name(&self) -> Option<&str> {
        self.key.split_once(':').map(|(_, name)| name)
    }
}

/// A variable of an affected process instance, with its payload decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedVariable {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable_key: Option<Value>,
    pub process_instance_key: EntityKey,
    pub flow_node_instance_key: String,
    pub value_base64: String,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_bounds_are_inclusive() {
        let ranges = LostRanges::new(vec![LostRange::new(100, 200)]).unwrap();
        assert!(!ranges.is_affected(99));
        assert!(ranges.is_affected(100));
        assert!(ranges.is_affected(150));
        assert!(ranges.is_affected(200));
        assert!(!ranges.is_affected(201));
    }

    #[test]
    fn overlapping_ranges_are_rejected() {
        let err = LostRanges::new(vec![LostRange::new(10, 20), LostRange::new(20, 30)]);
        assert!(matches!(err, Err(ReconcileError::Config(_))));

        let err = LostRanges::new(vec![LostRange::new(30, 20)]);
        assert!(matches!(err, Err(ReconcileError::Config(_))));
    }

    #[test]
    fn incident_defaults_are_valid() {
        let defaults = LostRanges::incident_defaults();
        let revalidated = LostRanges::new(defaults.ranges().to_vec()).unwrap();
        assert_eq!(revalidated, defaults);
        assert!(defaults.is_affected(78812994103625574));
        assert!(defaults.is_affected(112589991355937963));
        assert!(!defaults.is_affected(78812994150953318));
    }

    #[test]
    fn variable_scope_and_name() {
        let var = RawVariable {
            key: "42:varName".to_string(),
            value: VariableValue {
                key: None,
                value: String::new(),
            },
        };
        assert_eq!(var.scope_key(), "42");
        assert_eq!(var.name(), Some("varName"));
    }
}
