use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::envelope::{JobEnvelope, ENVELOPE_KIND, ENVELOPE_VERSION};

/// A server-assigned job identity. Opaque and unique while the job is queued
/// or leased. `JobId::SYNC` is the sentinel for jobs run synchronously
/// in-process, which never touch a server.
#[derive(
    Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize,
)]
pub struct JobId(pub u64);

impl JobId {
    pub const SYNC: JobId = JobId(0);
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The address of the queue server a job was leased from or enqueued on.
/// `Local` is the degenerate value for the synchronous fallback, rendered
/// `<none>` in logs.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum ServerAddr {
    Local,
    Tcp(String),
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Local => f.write_str("<none>"),
            Self::Tcp(addr) => f.write_str(addr),
        }
    }
}

/// One leased unit of work: the server that holds the lease, the identity it
/// assigned, and the raw payload bytes. Age and lease metadata are fetched
/// on demand via `stats-job` rather than cached here.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: JobId,
    pub server: ServerAddr,
    pub body: Bytes,
}

impl Job {
    pub fn new(id: JobId, server: ServerAddr, body: Bytes) -> Self {
        Self { id, server, body }
    }

    /// Parses the body as our job envelope. A body that fails to parse, or
    /// that carries an unknown version or kind, belongs to somebody else and
    /// is routed to the external handler instead.
    pub fn envelope(&self) -> Option<JobEnvelope> {
        serde_yaml::from_slice::<JobEnvelope>(&self.body)
            .ok()
            .filter(|e| e.v == ENVELOPE_VERSION && e.kind == ENVELOPE_KIND)
    }
}
