use serde::{Deserialize, Serialize};

use super::serialisable::BeanstalkSerialisable;
use super::states::JobState;
use crate::types::job::JobId;

/// A command sent by this client to the queue server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum QueueCommand {
    /// Places a job onto the currently `use`d tube. The job body follows the
    /// command line as a CRLF-terminated chunk of `n_bytes` bytes.
    ///
    /// On the wire: `put <pri> <delay> <ttr> <n_bytes>`
    Put {
        pri: u32,
        delay: u32,
        ttr: u32,
        n_bytes: u32,
    },
    /// Awaits a job from all the `watch`ed tubes, blocking until one appears.
    ///
    /// On the wire: `reserve`
    Reserve,
    /// As `reserve`, but after `timeout` seconds pass, a `TIMED_OUT` response
    /// is sent instead.
    ///
    /// On the wire: `reserve-with-timeout <seconds>`
    ReserveWithTimeout { timeout: u32 },
    /// Deletes a job reserved by this client. The terminal success
    /// disposition.
    ///
    /// On the wire: `delete <id>`
    Delete { id: u64 },
    /// Releases a job reserved by this client back to the ready (or delayed)
    /// state with a new priority and delay.
    ///
    /// On the wire: `release <id> <pri> <delay>`
    Release { id: u64, pri: u32, delay: u32 },
    /// Buries a job reserved by this client: the dead-letter state, requiring
    /// manual intervention to revive.
    ///
    /// On the wire: `bury <id> <pri>`
    Bury { id: u64, pri: u32 },
    /// Renews the TTR clock of a job reserved by this client.
    ///
    /// On the wire: `touch <id>`
    Touch { id: u64 },
    /// Adds a tube to this client's watchlist.
    ///
    /// On the wire: `watch <tube>`
    Watch { tube: String },
    /// Reverses the effect of `watch`. Fails with `NOT_IGNORED` if it would
    /// leave the watchlist empty.
    ///
    /// On the wire: `ignore <tube>`
    Ignore { tube: String },
    /// Selects the tube subsequent `put`s go to.
    ///
    /// On the wire: `use <tube>`
    Use { tube: String },
    /// Requests the stats record for a job in any state.
    ///
    /// On the wire: `stats-job <id>`
    StatsJob { id: u64 },
    /// Asks the server to close this connection.
    ///
    /// On the wire: `quit`
    Quit,
}

impl BeanstalkSerialisable for QueueCommand {
    fn serialise_beanstalk(&self) -> Vec<u8> {
        use QueueCommand::*;

        match self {
            Put {
                pri,
                delay,
                ttr,
                n_bytes,
            } => format!("put {pri} {delay} {ttr} {n_bytes}\r\n").into(),
            Reserve => b"reserve\r\n".to_vec(),
            ReserveWithTimeout { timeout } => {
                format!("reserve-with-timeout {timeout}\r\n").into()
            },
            Delete { id } => format!("delete {id}\r\n").into(),
            Release { id, pri, delay } => {
                format!("release {id} {pri} {delay}\r\n").into()
            },
            Bury { id, pri } => format!("bury {id} {pri}\r\n").into(),
            Touch { id } => format!("touch {id}\r\n").into(),
            Watch { tube } => format!("watch {tube}\r\n").into(),
            Ignore { tube } => format!("ignore {tube}\r\n").into(),
            Use { tube } => format!("use {tube}\r\n").into(),
            StatsJob { id } => format!("stats-job {id}\r\n").into(),
            Quit => b"quit\r\n".to_vec(),
        }
    }
}

/// All response lines the server may send to the commands above. Responses
/// carrying data (`RESERVED`, `OK`) name the chunk length; the caller reads
/// the chunk separately.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum QueueResponse {
    /// The server cannot handle a job due to memory pressure. Can be sent in
    /// response to any command.
    ///
    /// On the wire: `OUT_OF_MEMORY`
    OutOfMemory,
    /// Indicates a server bug. Can be sent in response to any command.
    ///
    /// On the wire: `INTERNAL_ERROR`
    InternalError,
    /// The server rejected our command line: a client bug or a desynced
    /// stream.
    ///
    /// On the wire: `BAD_FORMAT`
    BadFormat,
    /// The server didn't recognise our command.
    ///
    /// On the wire: `UNKNOWN_COMMAND`
    UnknownCommand,
    /// In response to a `put`: a job was created with the given ID.
    ///
    /// On the wire: `INSERTED <id>`
    Inserted { id: u64 },
    /// In response to a `put`: the job was created but immediately buried due
    /// to memory pressure.
    ///
    /// On the wire: `BURIED <id>`
    BuriedId { id: u64 },
    /// In response to a `release`: the job couldn't be released and was
    /// buried instead. In response to a `bury`: success.
    ///
    /// On the wire: `BURIED`
    Buried,
    /// In response to a `put`: the job body was not CRLF-terminated.
    ///
    /// On the wire: `EXPECTED_CRLF`
    ExpectedCrlf,
    /// In response to a `put`: the body exceeds the server's limit.
    ///
    /// On the wire: `JOB_TOO_BIG`
    JobTooBig,
    /// In response to a `put`: the server is not currently accepting jobs.
    ///
    /// On the wire: `DRAINING`
    Draining,
    /// In response to a `use`: the named tube is now selected.
    ///
    /// On the wire: `USING <tube>`
    Using { tube: String },
    /// In response to a `reserve`: a job already held by this client will
    /// exceed its TTR within the next second.
    ///
    /// On the wire: `DEADLINE_SOON`
    DeadlineSoon,
    /// In response to a `reserve-with-timeout`: the timeout expired with no
    /// job becoming available.
    ///
    /// On the wire: `TIMED_OUT`
    TimedOut,
    /// In response to a `reserve`: the ID and body length of the job just
    /// leased.
    ///
    /// On the wire: `RESERVED <id> <n_bytes>` plus data
    Reserved { id: u64, n_bytes: u32 },
    /// The job isn't known to the server, or isn't reserved by this client.
    /// At disposition call-sites this means the lease was already resolved.
    ///
    /// On the wire: `NOT_FOUND`
    NotFound,
    /// In response to a `delete`: success.
    ///
    /// On the wire: `DELETED`
    Deleted,
    /// In response to a `release`: success.
    ///
    /// On the wire: `RELEASED`
    Released,
    /// In response to a `touch`: success, the TTR clock was renewed.
    ///
    /// On the wire: `TOUCHED`
    Touched,
    /// In response to a `watch` or `ignore`: success, with the watchlist
    /// size.
    ///
    /// On the wire: `WATCHING <count>`
    Watching { count: u32 },
    /// In response to an `ignore`: refused, as it would leave the watchlist
    /// empty.
    ///
    /// On the wire: `NOT_IGNORED`
    NotIgnored,
    /// In response to a `stats-job`: success, followed by a YAML dictionary.
    ///
    /// On the wire: `OK <n_bytes>` plus data
    OkData { n_bytes: u32 },
}

/// The server's per-job diagnostic record. Must always be obtainable for a
/// leased job: when the server can't provide one, `JobStats::synthetic`
/// stands in.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    /// job ID
    pub id: u64,
    /// tube containing job
    #[serde(default)]
    pub tube: String,
    /// job state
    pub state: JobState,
    /// priority set by last put/release/bury
    pub pri: u32,

    /// time in seconds since creation
    pub age: u32,
    /// seconds remaining until ready
    pub delay: u32,
    /// allowed processing time in seconds
    pub ttr: u32,
    /// time until job returns to ready queue
    #[serde(rename = "time-left")]
    pub time_left: u32,

    /// earliest binlog file containing job
    #[serde(default)]
    pub file: u32,

    /// number of times job reserved
    pub reserves: u64,
    /// number of times job timed out
    pub timeouts: u64,
    /// number of times job released
    pub releases: u64,
    /// number of times job buried
    pub buries: u64,
    /// number of times job kicked
    pub kicks: u64,
}

impl JobStats {
    /// The best-effort placeholder record used when the server can't answer a
    /// `stats-job` (lease expired mid-flight, transport failure, or the
    /// synchronous no-broker mode).
    pub fn synthetic(id: JobId) -> Self {
        Self {
            id: id.0,
            tube: "default".to_string(),
            state: JobState::Reserved,
            pri: crate::enqueue::DEFAULT_PRI,
            age: 0,
            delay: 0,
            ttr: crate::enqueue::DEFAULT_TTR,
            time_left: 5000,
            file: 0,
            reserves: 0,
            timeouts: 0,
            releases: 0,
            buries: 0,
            kicks: 0,
        }
    }
}
