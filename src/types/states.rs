use serde::{Deserialize, Serialize};

/// Server-side job states, as reported by `stats-job`. The server is the
/// sole arbiter of these transitions; this client only observes them.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Ready,
    Delayed,
    Reserved,
    Buried,
}
