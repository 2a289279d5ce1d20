//! The structured task descriptor: the one full-fidelity serialization
//! contract the producer and consumer share. A descriptor names a receiver,
//! an operation, and its arguments, all drawn from a closed set of value
//! types. Anything not representable here is unconstructible by type, so an
//! unsupported argument is a compile-time impossibility rather than a
//! submission-time surprise.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fanout::Interval;

/// A stable external reference to the receiver of an operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "kebab-case")]
pub enum TargetRef {
    /// A persisted entity: type name plus primary key.
    Entity { kind: String, key: String },
    /// A type-level receiver (the operation acts on the type itself).
    Type { kind: String },
    /// A literal value standing in as the receiver.
    Literal(Box<TaskValue>),
}

impl TargetRef {
    /// The entity kind this reference points at, if it points at one.
    pub fn kind(&self) -> Option<&str> {
        match self {
            Self::Entity { kind, .. } | Self::Type { kind } => Some(kind),
            Self::Literal(_) => None,
        }
    }
}

/// The closed set of argument values a task descriptor may carry. The
/// adjacent tagging keeps e.g. symbols distinct from strings and timestamps
/// distinct from their rendered form, so a descriptor round-trips exactly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "kebab-case")]
pub enum TaskValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// An enum-like name, kept distinct from ordinary strings.
    Symbol(String),
    Seq(Vec<TaskValue>),
    Map(BTreeMap<String, TaskValue>),
    Interval(Interval),
    Timestamp(DateTime<Utc>),
    Target(TargetRef),
}

impl From<bool> for TaskValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for TaskValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for TaskValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

/// One deferred invocation: run `op` against `target` with `args`. `extra`
/// carries unrecognized submission options through for the handler's use.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub target: TargetRef,
    pub op: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<TaskValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, TaskValue>,
}
