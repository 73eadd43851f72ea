use serde_json::{Map, Value, json};
use std::cmp::Ordering;

/// Subset of the search DSL used against the list-view and related indices.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Term { field: String, value: Value },
    Terms { field: String, values: Vec<Value> },
    Range { field: String, bounds: RangeBounds },
    /// Conjunction of the inner queries.
    Bool(Vec<Query>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeBounds {
    pub gt: Option<Value>,
    pub gte: Option<Value>,
    pub lt: Option<Value>,
    pub lte: Option<Value>,
}

impl RangeBounds {
    pub fn gt(mut self, value: impl Into<Value>) -> Self {
        self.gt = Some(value.into());
        self
    }

    pub fn gte(mut self, value: impl Into<Value>) -> Self {
        self.gte = Some(value.into());
        self
    }

    pub fn lt(mut self, value: impl Into<Value>) -> Self {
        self.lt = Some(value.into());
        self
    }

    pub fn lte(mut self, value: impl Into<Value>) -> Self {
        self.lte = Some(value.into());
        self
    }
}

impl Query {
    pub fn term(field: &str, value: impl Into<Value>) -> Self {
        Self::Term {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn terms<I, V>(field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::Terms {
            field: field.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn range(field: &str, bounds: RangeBounds) -> Self {
        Self::Range {
            field: field.to_string(),
            bounds,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Term { field, value } => json!({ "term": { field: { "value": value } } }),
            Self::Terms { field, values } => json!({ "terms": { field: values } }),
            Self::Range { field, bounds } => {
                let mut spec = Map::new();
                for (op, bound) in [
                    ("gt", &bounds.gt),
                    ("gte", &bounds.gte),
                    ("lt", &bounds.lt),
                    ("lte", &bounds.lte),
                ] {
                    if let Some(bound) = bound {
                        spec.insert(op.to_string(), bound.clone());
                    }
                }
                json!({ "range": { field: spec } })
            }
            Self::Bool(must) => {
                let must: Vec<Value> = must.iter().map(Query::to_json).collect();
                json!({ "bool": { "must": must } })
            }
        }
    }

    /// Evaluates the query against a flat document source.
    ///
    /// Numbers compare numerically, strings lexicographically; date math such
    /// as `now-3M` is not understood and never matches.
    pub fn matches(&self, source: &Value) -> bool {
        match self {
            Self::Term { field, value } => source
                .get(field)
                .is_some_and(|actual| compare(actual, value) == Some(Ordering::Equal)),
            Self::Terms { field, values } => source.get(field).is_some_and(|actual| {
                values
                    .iter()
                    .any(|value| compare(actual, value) == Some(Ordering::Equal))
            }),
            Self::Range { field, bounds } => {
                let Some(actual) = source.get(field) else {
                    return false;
                };
                let check = |bound: &Option<Value>, accept: fn(Ordering) -> bool| {
                    bound
                        .as_ref()
                        .is_none_or(|bound| compare(actual, bound).is_some_and(accept))
                };
                check(&bounds.gt, Ordering::is_gt)
                    && check(&bounds.gte, Ordering::is_ge)
                    && check(&bounds.lt, Ordering::is_lt)
                    && check(&bounds.lte, Ordering::is_le)
            }
            Self::Bool(must) => must.iter().all(|query| query.matches(source)),
        }
    }
}

pub(crate) fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => match (l.as_u64(), r.as_u64()) {
            (Some(l), Some(r)) => Some(l.cmp(&r)),
            _ => l.as_f64()?.partial_cmp(&r.as_f64()?),
        },
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        _ => None,
    }
}
