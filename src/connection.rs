//! The client side of the beanstalkd wire protocol: a single `Connection`
//! over any async byte stream, and a `QueuePool` that spreads work across
//! one or more servers. The pool is the production implementation of the
//! `Broker` contract the enqueuer and worker loop are written against.

use std::collections::HashMap;
use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{
    AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::QueueError;
use crate::line_reader::LineReader;
use crate::types::job::{Job, JobId, ServerAddr};
use crate::types::protocol::{JobStats, QueueCommand, QueueResponse};
use crate::types::serialisable::BeanstalkSerialisable;
use crate::util::bytes_to_human_str;

/// Multiplier applied to a job's previous delay each time it decays.
pub const DECAY_RATE: f64 = 1.3;
/// Once a decayed delay would exceed this many seconds, the job is buried
/// instead of released.
pub const DECAY_DELAY_CAP: u32 = 3600;

/// The queue-server contract the enqueuer and worker loop depend on. The
/// server behind it is the sole arbiter of lease exclusivity; this client
/// never locks anything itself. The loop holding a broker is spawned as a
/// task, hence the bounds.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Idempotent: establishes or revalidates sessions to the configured
    /// servers. Fails only if no session is open afterwards.
    async fn connect(&mut self) -> Result<(), QueueError>;

    /// Durably creates a job, returning its identity and the server that
    /// holds it.
    async fn put(
        &mut self,
        body: &[u8],
        pri: u32,
        delay: u32,
        ttr: u32,
        tube: &str,
    ) -> Result<(JobId, ServerAddr), QueueError>;

    /// Blocks until a job is leased from a watched tube, preferring the
    /// given server when a session to it is open.
    async fn reserve(
        &mut self,
        prefer: Option<&ServerAddr>,
    ) -> Result<Job, QueueError>;

    /// Terminal success: the job is removed from the server.
    async fn delete(&mut self, job: &Job) -> Result<(), QueueError>;

    /// Returns the job to the ready (or delayed) state for another attempt.
    async fn release(
        &mut self,
        job: &Job,
        pri: u32,
        delay: u32,
    ) -> Result<(), QueueError>;

    /// Dead-letters the job; it stays inspectable via `stats_job` but won't
    /// be delivered again without manual intervention.
    async fn bury(&mut self, job: &Job, pri: u32) -> Result<(), QueueError>;

    /// Diagnostic record for a leased job. Never fails mid-flight: when the
    /// server can't answer, a synthetic placeholder is returned instead.
    async fn stats_job(&mut self, job: &Job) -> JobStats;

    /// Adds a tube to the watchlist on every open session, and on sessions
    /// opened later.
    async fn watch(&mut self, tube: &str) -> Result<(), QueueError>;

    /// Best-effort session teardown.
    async fn close(&mut self) {}

    /// Quiet retry: re-releases the job with a geometrically growing delay,
    /// burying it once the delay would exceed `DECAY_DELAY_CAP`. Used for
    /// failures worth retrying without hammering the queue.
    async fn decay(&mut self, job: &Job) -> Result<(), QueueError> {
        let stats = self.stats_job(job).await;
        let new_delay =
            ((stats.delay.max(1) as f64) * DECAY_RATE).ceil() as u32;
        if new_delay > DECAY_DELAY_CAP {
            warn!(job = %job.id, "decay delay cap reached, burying");
            self.bury(job, stats.pri).await
        } else {
            self.release(job, stats.pri, new_delay).await
        }
    }
}

/// One session to one queue server, over any async byte stream (tests run
/// over an in-memory duplex). Tracks the currently `use`d tube so repeated
/// puts to the same tube skip the round-trip.
pub struct Connection<S: AsyncRead + AsyncWrite + Unpin + Send> {
    addr: ServerAddr,
    reader: LineReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    using: Option<String>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Connection<S> {
    pub fn new(stream: S, addr: ServerAddr) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self {
            addr,
            reader: r.into(),
            writer: w,
            using: None,
        }
    }

    pub fn addr(&self) -> &ServerAddr {
        &self.addr
    }

    async fn send(&mut self, cmd: &QueueCommand) -> Result<(), QueueError> {
        self.writer.write_all(&cmd.serialise_beanstalk()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_response(&mut self) -> Result<QueueResponse, QueueError> {
        let line = self.reader.read_line().await?.ok_or_else(|| {
            QueueError::Connection(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            ))
        })?;

        let resp =
            QueueResponse::try_from(&line as &[u8]).map_err(|e| {
                QueueError::Protocol(format!(
                    "{e}: {}",
                    bytes_to_human_str(&line)
                ))
            })?;

        // Responses the server may send to any command at all.
        match resp {
            QueueResponse::OutOfMemory => {
                Err(QueueError::Protocol("server out of memory".to_string()))
            },
            QueueResponse::InternalError => {
                Err(QueueError::Protocol("server internal error".to_string()))
            },
            QueueResponse::BadFormat | QueueResponse::UnknownCommand => Err(
                QueueError::Protocol("server rejected our command".to_string()),
            ),
            resp => Ok(resp),
        }
    }

    async fn read_chunk(&mut self, n_bytes: u32) -> Result<Bytes, QueueError> {
        self.reader.read_chunk(n_bytes as usize).await?.ok_or_else(|| {
            QueueError::Connection(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the connection mid-chunk",
            ))
        })
    }

    /// Selects the tube subsequent puts go to. Idempotent: a repeated use of
    /// the current tube is a no-op.
    pub async fn use_tube(&mut self, tube: &str) -> Result<(), QueueError> {
        if self.using.as_deref() == Some(tube) {
            return Ok(());
        }

        self.send(&QueueCommand::Use {
            tube: tube.to_string(),
        })
        .await?;

        match self.read_response().await? {
            QueueResponse::Using { tube: t } if t == tube => {
                self.using = Some(t);
                Ok(())
            },
            resp => Err(unexpected("use", resp)),
        }
    }

    pub async fn put(
        &mut self,
        body: &[u8],
        pri: u32,
        delay: u32,
        ttr: u32,
    ) -> Result<JobId, QueueError> {
        let n_bytes = u32::try_from(body.len()).map_err(|_| {
            QueueError::Protocol("job body too large".to_string())
        })?;

        self.writer
            .write_all(
                &QueueCommand::Put {
                    pri,
                    delay,
                    ttr,
                    n_bytes,
                }
                .serialise_beanstalk(),
            )
            .await?;
        self.writer.write_all(body).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;

        match self.read_response().await? {
            QueueResponse::Inserted { id } => Ok(JobId(id)),
            QueueResponse::BuriedId { id } => {
                // The job exists but the server buried it under memory
                // pressure. Count it as created.
                warn!(job = id, server = %self.addr, "job buried on insert");
                Ok(JobId(id))
            },
            QueueResponse::ExpectedCrlf => Err(QueueError::Protocol(
                "job body not CRLF-terminated".to_string(),
            )),
            QueueResponse::JobTooBig => {
                Err(QueueError::Protocol("job too big".to_string()))
            },
            QueueResponse::Draining => {
                Err(QueueError::Protocol("server is draining".to_string()))
            },
            resp => Err(unexpected("put", resp)),
        }
    }

    pub async fn reserve(&mut self) -> Result<Job, QueueError> {
        self.send(&QueueCommand::Reserve).await?;
        self.read_reserved("reserve").await
    }

    /// As `reserve`, returning None if the timeout passes with no job
    /// available.
    pub async fn reserve_with_timeout(
        &mut self,
        timeout: u32,
    ) -> Result<Option<Job>, QueueError> {
        self.send(&QueueCommand::ReserveWithTimeout { timeout })
            .await?;

        match self.read_response().await? {
            QueueResponse::TimedOut => Ok(None),
            QueueResponse::Reserved { id, n_bytes } => {
                let body = self.read_chunk(n_bytes).await?;
                Ok(Some(Job::new(JobId(id), self.addr.clone(), body)))
            },
            QueueResponse::DeadlineSoon => Err(QueueError::DeadlineSoon),
            resp => Err(unexpected("reserve-with-timeout", resp)),
        }
    }

    async fn read_reserved(
        &mut self,
        cmd: &'static str,
    ) -> Result<Job, QueueError> {
        match self.read_response().await? {
            QueueResponse::Reserved { id, n_bytes } => {
                let body = self.read_chunk(n_bytes).await?;
                Ok(Job::new(JobId(id), self.addr.clone(), body))
            },
            QueueResponse::DeadlineSoon => Err(QueueError::DeadlineSoon),
            resp => Err(unexpected(cmd, resp)),
        }
    }

    pub async fn delete(&mut self, id: JobId) -> Result<(), QueueError> {
        self.send(&QueueCommand::Delete { id: id.0 }).await?;

        match self.read_response().await? {
            QueueResponse::Deleted => Ok(()),
            QueueResponse::NotFound => {
                Err(QueueError::UnexpectedResponse("NOT_FOUND"))
            },
            resp => Err(unexpected("delete", resp)),
        }
    }

    pub async fn release(
        &mut self,
        id: JobId,
        pri: u32,
        delay: u32,
    ) -> Result<(), QueueError> {
        self.send(&QueueCommand::Release {
            id: id.0,
            pri,
            delay,
        })
        .await?;

        match self.read_response().await? {
            QueueResponse::Released => Ok(()),
            QueueResponse::Buried => {
                // The server couldn't grow its ready queue and buried the job
                // instead. It still exists, so don't fail the disposition.
                warn!(job = %id, server = %self.addr, "job buried on release");
                Ok(())
            },
            QueueResponse::NotFound => {
                Err(QueueError::UnexpectedResponse("NOT_FOUND"))
            },
            resp => Err(unexpected("release", resp)),
        }
    }

    pub async fn bury(
        &mut self,
        id: JobId,
        pri: u32,
    ) -> Result<(), QueueError> {
        self.send(&QueueCommand::Bury { id: id.0, pri }).await?;

        match self.read_response().await? {
            QueueResponse::Buried => Ok(()),
            QueueResponse::NotFound => {
                Err(QueueError::UnexpectedResponse("NOT_FOUND"))
            },
            resp => Err(unexpected("bury", resp)),
        }
    }

    /// Renews the TTR clock of a reserved job, extending the lease.
    pub async fn touch(&mut self, id: JobId) -> Result<(), QueueError> {
        self.send(&QueueCommand::Touch { id: id.0 }).await?;

        match self.read_response().await? {
            QueueResponse::Touched => Ok(()),
            QueueResponse::NotFound => {
                Err(QueueError::UnexpectedResponse("NOT_FOUND"))
            },
            resp => Err(unexpected("touch", resp)),
        }
    }

    /// Fetches a job's stats record, or None if the server no longer knows
    /// the job.
    pub async fn stats_job(
        &mut self,
        id: JobId,
    ) -> Result<Option<JobStats>, QueueError> {
        self.send(&QueueCommand::StatsJob { id: id.0 }).await?;

        match self.read_response().await? {
            QueueResponse::OkData { n_bytes } => {
                let data = self.read_chunk(n_bytes).await?;
                let stats = serde_yaml::from_slice(&data).map_err(|e| {
                    QueueError::Protocol(format!("bad stats payload: {e}"))
                })?;
                Ok(Some(stats))
            },
            QueueResponse::NotFound => Ok(None),
            resp => Err(unexpected("stats-job", resp)),
        }
    }

    pub async fn watch(&mut self, tube: &str) -> Result<u32, QueueError> {
        self.send(&QueueCommand::Watch {
            tube: tube.to_string(),
        })
        .await?;

        match self.read_response().await? {
            QueueResponse::Watching { count } => Ok(count),
            resp => Err(unexpected("watch", resp)),
        }
    }

    pub async fn ignore(&mut self, tube: &str) -> Result<u32, QueueError> {
        self.send(&QueueCommand::Ignore {
            tube: tube.to_string(),
        })
        .await?;

        match self.read_response().await? {
            QueueResponse::Watching { count } => Ok(count),
            QueueResponse::NotIgnored => {
                Err(QueueError::UnexpectedResponse("NOT_IGNORED"))
            },
            resp => Err(unexpected("ignore", resp)),
        }
    }

    /// Asks the server to close the session. No response is expected.
    pub async fn quit(&mut self) -> Result<(), QueueError> {
        self.send(&QueueCommand::Quit).await
    }
}

fn unexpected(cmd: &str, resp: QueueResponse) -> QueueError {
    QueueError::Protocol(format!("unexpected response to {cmd}: {resp:?}"))
}

/// A set of queue servers with lazily-opened sessions. Puts rotate across
/// open sessions; reserves go to the preferred (affinity) session when one
/// is named and open.
pub struct QueuePool {
    addrs: Vec<String>,
    conns: HashMap<String, Connection<TcpStream>>,
    watch_tubes: Vec<String>,
    cursor: usize,
}

impl QueuePool {
    pub fn new(addrs: Vec<String>) -> Self {
        Self {
            addrs,
            conns: HashMap::new(),
            watch_tubes: Vec::new(),
            cursor: 0,
        }
    }

    /// The next open session's address, advancing the rotation cursor.
    fn pick_addr(&mut self) -> Option<String> {
        if self.addrs.is_empty() {
            return None;
        }

        for i in 0..self.addrs.len() {
            let idx = (self.cursor + i) % self.addrs.len();
            let addr = &self.addrs[idx];
            if self.conns.contains_key(addr) {
                self.cursor = (idx + 1) % self.addrs.len();
                return Some(addr.clone());
            }
        }

        None
    }

    /// The session to reserve on: the preferred server if we hold an open
    /// session to it, otherwise the next session in rotation.
    fn pick_reserve_addr(
        &mut self,
        prefer: Option<&ServerAddr>,
    ) -> Option<String> {
        if let Some(ServerAddr::Tcp(addr)) = prefer {
            if self.conns.contains_key(addr) {
                return Some(addr.clone());
            }
        }
        self.pick_addr()
    }

    /// Drops a session after a transport or framing failure so `connect` can
    /// reopen it later.
    fn drop_session(&mut self, addr: &str, error: &QueueError) {
        if matches!(
            error,
            QueueError::Connection(_) | QueueError::Protocol(_)
        ) {
            debug!(%addr, %error, "dropping queue session");
            self.conns.remove(addr);
        }
    }

    fn no_sessions() -> QueueError {
        QueueError::Connection(io::Error::new(
            io::ErrorKind::NotConnected,
            "no queue server session is open",
        ))
    }
}

#[async_trait]
impl Broker for QueuePool {
    async fn connect(&mut self) -> Result<(), QueueError> {
        for addr in self.addrs.clone() {
            if self.conns.contains_key(&addr) {
                continue;
            }

            let stream = match TcpStream::connect(&addr).await {
                Ok(s) => s,
                Err(error) => {
                    warn!(%addr, %error, "failed to connect to queue server");
                    continue;
                },
            };
            if let Err(error) = stream.set_nodelay(true) {
                warn!(%addr, %error, "failed to set NODELAY");
            }

            let mut conn =
                Connection::new(stream, ServerAddr::Tcp(addr.clone()));

            // Fresh sessions watch everything the pool has been asked to.
            let mut ok = true;
            for tube in &self.watch_tubes {
                if let Err(error) = conn.watch(tube).await {
                    warn!(%addr, tube, %error, "failed to watch tube");
                    ok = false;
                    break;
                }
            }

            if ok {
                self.conns.insert(addr, conn);
            }
        }

        if self.conns.is_empty() {
            Err(Self::no_sessions())
        } else {
            Ok(())
        }
    }

    async fn put(
        &mut self,
        body: &[u8],
        pri: u32,
        delay: u32,
        ttr: u32,
        tube: &str,
    ) -> Result<(JobId, ServerAddr), QueueError> {
        let addr = self.pick_addr().ok_or_else(Self::no_sessions)?;
        let Some(conn) = self.conns.get_mut(&addr) else {
            return Err(Self::no_sessions());
        };

        let res = async {
            conn.use_tube(tube).await?;
            conn.put(body, pri, delay, ttr).await
        }
        .await;

        match res {
            Ok(id) => Ok((id, ServerAddr::Tcp(addr))),
            Err(error) => {
                self.drop_session(&addr, &error);
                Err(error)
            },
        }
    }

    async fn reserve(
        &mut self,
        prefer: Option<&ServerAddr>,
    ) -> Result<Job, QueueError> {
        let addr =
            self.pick_reserve_addr(prefer).ok_or_else(Self::no_sessions)?;
        let Some(conn) = self.conns.get_mut(&addr) else {
            return Err(Self::no_sessions());
        };

        match conn.reserve().await {
            Ok(job) => Ok(job),
            Err(error) => {
                self.drop_session(&addr, &error);
                Err(error)
            },
        }
    }

    async fn delete(&mut self, job: &Job) -> Result<(), QueueError> {
        let ServerAddr::Tcp(addr) = &job.server else {
            return Err(QueueError::UnexpectedResponse("job has no server"));
        };
        let Some(conn) = self.conns.get_mut(addr) else {
            // The session died, taking the lease with it.
            return Err(QueueError::UnexpectedResponse("session closed"));
        };
        conn.delete(job.id).await
    }

    async fn release(
        &mut self,
        job: &Job,
        pri: u32,
        delay: u32,
    ) -> Result<(), QueueError> {
        let ServerAddr::Tcp(addr) = &job.server else {
            return Err(QueueError::UnexpectedResponse("job has no server"));
        };
        let Some(conn) = self.conns.get_mut(addr) else {
            return Err(QueueError::UnexpectedResponse("session closed"));
        };
        conn.release(job.id, pri, delay).await
    }

    async fn bury(&mut self, job: &Job, pri: u32) -> Result<(), QueueError> {
        let ServerAddr::Tcp(addr) = &job.server else {
            return Err(QueueError::UnexpectedResponse("job has no server"));
        };
        let Some(conn) = self.conns.get_mut(addr) else {
            return Err(QueueError::UnexpectedResponse("session closed"));
        };
        conn.bury(job.id, pri).await
    }

    async fn stats_job(&mut self, job: &Job) -> JobStats {
        if let ServerAddr::Tcp(addr) = &job.server {
            if let Some(conn) = self.conns.get_mut(addr) {
                match conn.stats_job(job.id).await {
                    Ok(Some(stats)) => return stats,
                    Ok(None) => {
                        debug!(job = %job.id, "stats-job: job not found")
                    },
                    Err(error) => {
                        debug!(job = %job.id, %error, "stats-job failed");
                    },
                }
            }
        }
        JobStats::synthetic(job.id)
    }

    async fn watch(&mut self, tube: &str) -> Result<(), QueueError> {
        if !self.watch_tubes.iter().any(|t| t == tube) {
            self.watch_tubes.push(tube.to_string());
        }

        let mut failed = Vec::new();
        for (addr, conn) in self.conns.iter_mut() {
            if let Err(error) = conn.watch(tube).await {
                warn!(%addr, tube, %error, "failed to watch tube");
                failed.push(addr.clone());
            }
        }
        for addr in failed {
            self.conns.remove(&addr);
        }

        Ok(())
    }

    async fn close(&mut self) {
        for (_, mut conn) in self.conns.drain() {
            let _ = conn.quit().await;
        }
    }
}
