//! The worker loop: reserve a job, dispatch it through the registry, then
//! settle the lease with exactly one disposition. Job failures never kill
//! the loop; they decay the job (or whatever a custom error handler decides)
//! and the loop reserves again. Only configuration holes are fatal.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::connection::Broker;
use crate::enqueue::{Enqueuer, DEFAULT_PRI};
use crate::error::{QueueError, RunError, WorkerError};
use crate::types::descriptor::TaskDescriptor;
use crate::types::job::{Job, JobId, ServerAddr};
use crate::util::bytes_to_human_str;

/// How long the loop sleeps after a connect or reserve failure.
pub const DEFAULT_SLEEP_TIME: Duration = Duration::from_secs(60);
/// A reserve that returns a job faster than this suggests the server has
/// more work queued behind it.
pub const DEFAULT_BRIEF_RESERVE: Duration = Duration::from_millis(100);
/// A job whose entity is missing is retried until it reaches this age, then
/// dropped as permanently stale.
pub const DEFAULT_STALE_AFTER_SECS: u32 = 60;

/// How a handled job's lease is settled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// Delete: the work is done (or will never be doable).
    Ack,
    /// Return for another attempt at the given priority and delay.
    Release { pri: u32, delay: u32 },
    /// Dead-letter at the given priority.
    Bury { pri: u32 },
    /// Release with a geometrically growing delay, burying at the cap.
    Decay,
    /// Leave the lease to expire on its own TTR.
    Ignore,
}

impl Disposition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Release { .. } => "release",
            Self::Bury { .. } => "bury",
            Self::Decay => "decay",
            Self::Ignore => "ignore",
        }
    }
}

/// Maps a failed job to its disposition.
pub type ErrorHandler =
    Box<dyn Fn(&Job, &RunError) -> Disposition + Send + Sync>;
/// Runs before each reserve attempt (cache expiry, connection health, ...).
pub type ReserveHook = Box<dyn Fn() + Send + Sync>;
/// Vetoes dispatch of a decoded job; a vetoed job is released untouched.
pub type DispatchFilter =
    Box<dyn Fn(&Job, &TaskDescriptor) -> bool + Send + Sync>;
/// Runs once, after the main loop exits and before sessions close.
pub type ShutdownHook = Box<dyn FnOnce() + Send + Sync>;

/// Handles jobs whose bodies aren't task envelopes, typically enqueued by
/// some other producer sharing the tube.
#[async_trait]
pub trait ExternalHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), RunError>;
}

pub struct WorkerConfig {
    pub sleep_time: Duration,
    pub brief_reserve: Duration,
    pub stale_after_secs: u32,
    pub before_reserve: Vec<ReserveHook>,
    pub before_dispatch: Option<DispatchFilter>,
    pub on_shutdown: Option<ShutdownHook>,
    pub error_handler: Option<ErrorHandler>,
    pub external_handler: Option<Box<dyn ExternalHandler>>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sleep_time: DEFAULT_SLEEP_TIME,
            brief_reserve: DEFAULT_BRIEF_RESERVE,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            before_reserve: Vec::new(),
            before_dispatch: None,
            on_shutdown: None,
            error_handler: None,
            external_handler: None,
        }
    }
}

/// Tracks which server has been answering reserves quickly. A brief,
/// successful reserve keeps the next one on the same server so a backlog
/// drains with connection affinity; anything else drops the hint and the
/// pool rotates again.
pub struct ConnectionAffinity {
    hint: Option<ServerAddr>,
    brief: Duration,
}

impl ConnectionAffinity {
    pub fn new(brief: Duration) -> Self {
        Self { hint: None, brief }
    }

    pub fn observe(
        &mut self,
        server: &ServerAddr,
        elapsed: Duration,
        got_job: bool,
    ) {
        if got_job && elapsed < self.brief {
            self.hint = Some(server.clone());
        } else {
            self.hint = None;
        }
    }

    pub fn preferred(&self) -> Option<&ServerAddr> {
        self.hint.as_ref()
    }

    pub fn clear(&mut self) {
        self.hint = None;
    }
}

pub struct WorkerLoop {
    broker: Box<dyn Broker>,
    enqueuer: Enqueuer,
    config: WorkerConfig,
    affinity: ConnectionAffinity,
    cancel: CancellationToken,
}

impl WorkerLoop {
    pub fn new(
        broker: Option<Box<dyn Broker>>,
        enqueuer: Enqueuer,
        config: WorkerConfig,
        cancel: CancellationToken,
    ) -> Result<Self, WorkerError> {
        let broker = broker.ok_or(WorkerError::NoQueue)?;
        let affinity = ConnectionAffinity::new(config.brief_reserve);
        Ok(Self {
            broker,
            enqueuer,
            config,
            affinity,
            cancel,
        })
    }

    /// Runs until the cancellation token fires (or a fatal configuration
    /// error surfaces), then settles up and returns.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        self.startup().await;
        let mut result = Ok(());
        while let Some(job) = self.get_job().await {
            if let Err(error) = self.safe_dispatch(&job).await {
                result = Err(error);
                break;
            }
        }
        self.shutdown().await;
        result
    }

    #[instrument(name = "worker-startup", skip_all)]
    async fn startup(&mut self) {
        info!(
            pid = std::process::id(),
            appver = self.enqueuer.app_version(),
            "worker starting"
        );

        // Jobs tagged with an application version land in that version's
        // tube; this worker only handles jobs built for its own code.
        if let Some(appver) = self.enqueuer.app_version().map(str::to_string) {
            if let Err(error) = self.broker.watch(&appver).await {
                warn!(%error, tube = appver, "failed to watch version tube");
            }
        }
    }

    #[instrument(name = "worker-shutdown", skip_all)]
    async fn shutdown(&mut self) {
        if let Some(hook) = self.config.on_shutdown.take() {
            hook();
        }
        self.broker.close().await;
        info!("worker stopped");
    }

    /// Blocks until a job is leased or shutdown is requested. Transport
    /// failures back off for `sleep_time` rather than spinning.
    #[instrument(name = "worker-get-job", skip_all)]
    async fn get_job(&mut self) -> Option<Job> {
        let cancel = self.cancel.clone();
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            if let Err(error) = self.broker.connect().await {
                self.affinity.clear();
                warn!(%error, "cannot reach any queue server");
                if !self.backoff().await {
                    return None;
                }
                continue;
            }

            for hook in &self.config.before_reserve {
                hook();
            }

            let prefer = self.affinity.preferred().cloned();
            let started = Instant::now();
            let res = tokio::select! {
                res = self.broker.reserve(prefer.as_ref()) => res,
                _ = cancel.cancelled() => return None,
            };

            match res {
                Ok(job) => {
                    self.affinity.observe(
                        &job.server,
                        started.elapsed(),
                        true,
                    );
                    return Some(job);
                },
                Err(QueueError::DeadlineSoon) => {
                    // A lease we hold elsewhere is about to expire; reserve
                    // again immediately so the server can hand it back.
                    info!("deadline soon, retrying reserve");
                },
                Err(error) => {
                    self.affinity.clear();
                    warn!(%error, "reserve failed");
                    if !self.backoff().await {
                        return None;
                    }
                },
            }
        }
    }

    /// Returns false if shutdown was requested during the sleep.
    async fn backoff(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.config.sleep_time) => true,
            _ = self.cancel.cancelled() => false,
        }
    }

    /// Dispatches one leased job. Failures inside the job never propagate;
    /// every path ends in a disposition (or deliberately leaves the lease to
    /// its TTR). The only error out of here is the fatal configuration hole
    /// of a non-task job with no external handler.
    #[instrument(
        name = "worker-dispatch",
        skip_all,
        fields(job = %job.id, server = %job.server)
    )]
    async fn safe_dispatch(&mut self, job: &Job) -> Result<(), WorkerError> {
        let started = Instant::now();
        info!(body = %bytes_to_human_str(&job.body), "dispatching");

        let stats = self.broker.stats_job(job).await;
        debug!(?stats, "job stats");

        let res = match job.envelope() {
            Some(env) => {
                self.run_task_job(job, env.code, env.delete_first, stats.age)
                    .await;
                Ok(())
            },
            None => self.run_external(job).await,
        };

        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "dispatch finished"
        );
        res
    }

    async fn run_task_job(
        &mut self,
        job: &Job,
        desc: TaskDescriptor,
        delete_first: bool,
        age: u32,
    ) {
        if let Some(filter) = &self.config.before_dispatch {
            if !filter(job, &desc) {
                info!(op = desc.op, "dispatch vetoed, releasing");
                ignore_resolved(
                    self.broker.release(job, DEFAULT_PRI, 0).await,
                );
                return;
            }
        }

        if delete_first {
            // At-most-once: acknowledge before running. If the delete fails
            // the job isn't ours any more, so don't run it.
            if let Err(error) = self.broker.delete(job).await {
                warn!(%error, "delete-first failed, not running");
                return;
            }
        }

        match self.run_descriptor(job.id, desc).await {
            Ok(()) => {
                if !delete_first {
                    ignore_resolved(self.broker.delete(job).await);
                }
                info!("done");
            },
            Err(RunError::MissingEntity) => {
                // The entity may simply not have replicated yet; retry
                // quietly until the job is old enough to call stale.
                if age >= self.config.stale_after_secs {
                    info!(age, "entity still missing, dropping stale job");
                    ignore_resolved(self.broker.delete(job).await);
                } else {
                    info!(age, "entity missing, will retry");
                    ignore_resolved(self.broker.decay(job).await);
                }
            },
            Err(error) => self.handle_error(job, &error).await,
        }
    }

    async fn run_descriptor(
        &mut self,
        job_id: JobId,
        desc: TaskDescriptor,
    ) -> Result<(), RunError> {
        let registry = self.enqueuer.registry();
        let op = registry
            .resolve(&desc.op)
            .ok_or_else(|| RunError::UnknownOperation(desc.op.clone()))?;

        let mut ctx = crate::registry::RunContext {
            enqueuer: &mut self.enqueuer,
            job_id,
        };
        op.run(&mut ctx, &desc.target, &desc.args).await
    }

    async fn run_external(&mut self, job: &Job) -> Result<(), WorkerError> {
        let Some(handler) = &self.config.external_handler else {
            // Not ours and nobody claims it: a configuration hole, fatal to
            // this worker. Put the job back for whoever can run it.
            warn!("non-task job with no external handler configured");
            ignore_resolved(self.broker.release(job, DEFAULT_PRI, 0).await);
            return Err(WorkerError::NoExternalHandler);
        };

        match handler.handle(job).await {
            Ok(()) => {
                ignore_resolved(self.broker.delete(job).await);
                info!("external job done");
                Ok(())
            },
            Err(error) => {
                self.handle_error(job, &error).await;
                Ok(())
            },
        }
    }

    async fn handle_error(&mut self, job: &Job, error: &RunError) {
        let disposition = match &self.config.error_handler {
            Some(handler) => handler(job, error),
            None => Disposition::Decay,
        };
        warn!(%error, disposition = disposition.name(), "job failed");
        self.apply_disposition(job, disposition).await;
    }

    async fn apply_disposition(&mut self, job: &Job, d: Disposition) {
        match d {
            Disposition::Ack => {
                ignore_resolved(self.broker.delete(job).await)
            },
            Disposition::Release { pri, delay } => {
                ignore_resolved(self.broker.release(job, pri, delay).await)
            },
            Disposition::Bury { pri } => {
                ignore_resolved(self.broker.bury(job, pri).await)
            },
            Disposition::Decay => {
                ignore_resolved(self.broker.decay(job).await)
            },
            // The lease simply expires on its TTR.
            Disposition::Ignore => {},
        }
    }
}

/// Logs and swallows a disposition failure. A job that vanished under us
/// (NOT_FOUND) is routine: its TTR expired or another actor settled it.
fn ignore_resolved(res: Result<(), QueueError>) {
    match res {
        Ok(()) => {},
        Err(QueueError::UnexpectedResponse(what)) => {
            debug!(what, "job already resolved elsewhere");
        },
        Err(error) => {
            warn!(%error, "failed to settle job lease");
        },
    }
}
