//! The YAML wrapper around a task descriptor as it travels through the
//! queue. The worker uses the version and kind fields to tell its own jobs
//! apart from anything else sharing the tubes.

use serde::{Deserialize, Serialize};

use super::descriptor::TaskDescriptor;

pub const ENVELOPE_VERSION: u32 = 1;
pub const ENVELOPE_KIND: &str = "task";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub v: u32,
    pub kind: String,
    pub code: TaskDescriptor,
    /// Application version tag of the producer, for version-mismatch routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appver: Option<String>,
    pub tube: String,
    /// Acknowledge before running, converting this job to at-most-once
    /// delivery.
    #[serde(default)]
    pub delete_first: bool,
}
