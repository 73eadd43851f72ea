pub mod error;
pub mod types;

pub use error::{ReconcileError, Result};
pub use types::{
    EntityKey, FlowNodeRef, JoinedVariable, LostRange, LostRanges, RawVariable, VariableValue,
};
