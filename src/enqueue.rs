//! The producer side: builds task descriptors into enveloped jobs and hands
//! them to the queue, or runs them synchronously in-process when no queue is
//! configured. Bulk submissions go through `submit_each`, the fanout
//! splitter's entry point.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info};

use crate::connection::Broker;
use crate::error::{RunError, SubmitError};
use crate::fanout::{
    Interval, DEFAULT_FANOUT_DEGREE, FANOUT_STEP_OP,
};
use crate::registry::{OperationRegistry, RunContext};
use crate::types::descriptor::{TargetRef, TaskDescriptor, TaskValue};
use crate::types::envelope::{JobEnvelope, ENVELOPE_KIND, ENVELOPE_VERSION};
use crate::types::job::JobId;

pub const DEFAULT_PRI: u32 = 512;
pub const DEFAULT_DELAY: u32 = 0;
pub const DEFAULT_TTR: u32 = 120;
pub const DEFAULT_TUBE: &str = "default";

/// Anything that can be the receiver of a deferred operation. The capability
/// is explicit: a type opts in by producing a stable external reference to
/// itself, rather than every value growing a submission method. Receivers
/// are shared across await points inside operations, hence the bounds.
pub trait Submittable: Send + Sync {
    fn target_ref(&self) -> TargetRef;
}

impl Submittable for TargetRef {
    fn target_ref(&self) -> TargetRef {
        self.clone()
    }
}

impl Submittable for Interval {
    fn target_ref(&self) -> TargetRef {
        TargetRef::Literal(Box::new(TaskValue::Interval(*self)))
    }
}

impl Submittable for i64 {
    fn target_ref(&self) -> TargetRef {
        TargetRef::Literal(Box::new(TaskValue::Int(*self)))
    }
}

impl Submittable for str {
    fn target_ref(&self) -> TargetRef {
        TargetRef::Literal(Box::new(TaskValue::Str(self.to_string())))
    }
}

impl Submittable for String {
    fn target_ref(&self) -> TargetRef {
        TargetRef::Literal(Box::new(TaskValue::Str(self.clone())))
    }
}

/// Scheduling options for one submission. Unset fields fall back to the
/// defaults at submit time and are never forwarded into child job option
/// sets. Unrecognized keys ride through in `extra` for the handler's use.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EnqueueOptions {
    pub pri: Option<u32>,
    /// Uniform random jitter in `[0, fuzz]` added to the priority at submit
    /// time, decorrelating bursts of jobs created at the same instant.
    pub fuzz: Option<u32>,
    pub delay: Option<u32>,
    pub ttr: Option<u32>,
    pub tube: Option<String>,
    /// Maximum direct children per fanout split level.
    pub fanout_degree: Option<u64>,
    /// Priority jitter applied to split jobs (not leaves).
    pub fanout_fuzz: Option<u32>,
    /// Priority override for split jobs at every recursion level; leaves
    /// keep `pri`.
    pub fanout_pri: Option<u32>,
    /// Acknowledge before running: at-most-once delivery for this job.
    pub delete_first: bool,
    pub extra: BTreeMap<String, TaskValue>,
}

impl EnqueueOptions {
    pub fn with_pri(mut self, pri: u32) -> Self {
        self.pri = Some(pri);
        self
    }

    pub fn with_fuzz(mut self, fuzz: u32) -> Self {
        self.fuzz = Some(fuzz);
        self
    }

    pub fn with_delay(mut self, delay: u32) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_tube(mut self, tube: impl Into<String>) -> Self {
        self.tube = Some(tube.into());
        self
    }

    pub fn with_fanout_degree(mut self, degree: u64) -> Self {
        self.fanout_degree = Some(degree);
        self
    }

    pub fn with_fanout_pri(mut self, pri: u32) -> Self {
        self.fanout_pri = Some(pri);
        self
    }

    pub fn with_fanout_fuzz(mut self, fuzz: u32) -> Self {
        self.fanout_fuzz = Some(fuzz);
        self
    }

    /// The effective priority for this submission: the base priority plus
    /// jitter drawn from `[0, fuzz]`.
    pub(crate) fn resolved_pri(&self) -> u32 {
        let base = self.pri.unwrap_or(DEFAULT_PRI);
        match self.fuzz {
            Some(fuzz) if fuzz > 0 => {
                base.saturating_add(rand::rng().random_range(0..=fuzz))
            },
            _ => base,
        }
    }

    /// Renders only the explicitly-set options into a descriptor value, for
    /// carrying through a recursive fanout step. Unset options never appear,
    /// so nothing downstream has to distinguish "absent" from "null".
    pub(crate) fn to_value(&self) -> TaskValue {
        let mut m = self.extra.clone();
        if let Some(v) = self.pri {
            m.insert("pri".to_string(), TaskValue::Int(v as i64));
        }
        if let Some(v) = self.fuzz {
            m.insert("fuzz".to_string(), TaskValue::Int(v as i64));
        }
        if let Some(v) = self.delay {
            m.insert("delay".to_string(), TaskValue::Int(v as i64));
        }
        if let Some(v) = self.ttr {
            m.insert("ttr".to_string(), TaskValue::Int(v as i64));
        }
        if let Some(v) = &self.tube {
            m.insert("tube".to_string(), TaskValue::Str(v.clone()));
        }
        if let Some(v) = self.fanout_degree {
            m.insert("fanout_degree".to_string(), TaskValue::Int(v as i64));
        }
        if let Some(v) = self.fanout_fuzz {
            m.insert("fanout_fuzz".to_string(), TaskValue::Int(v as i64));
        }
        if let Some(v) = self.fanout_pri {
            m.insert("fanout_pri".to_string(), TaskValue::Int(v as i64));
        }
        if self.delete_first {
            m.insert("delete_first".to_string(), TaskValue::Bool(true));
        }
        TaskValue::Map(m)
    }

    pub(crate) fn from_value(value: &TaskValue) -> Result<Self, RunError> {
        fn bad(key: &str) -> RunError {
            RunError::BadDescriptor(format!("bad option value for {key}"))
        }

        fn as_u32(key: &str, v: &TaskValue) -> Result<u32, RunError> {
            match v {
                TaskValue::Int(n) => {
                    u32::try_from(*n).map_err(|_| bad(key))
                },
                _ => Err(bad(key)),
            }
        }

        fn as_u64(key: &str, v: &TaskValue) -> Result<u64, RunError> {
            match v {
                TaskValue::Int(n) => {
                    u64::try_from(*n).map_err(|_| bad(key))
                },
                _ => Err(bad(key)),
            }
        }

        let TaskValue::Map(m) = value else {
            return Err(RunError::BadDescriptor(
                "expected an option map".to_string(),
            ));
        };

        let mut opts = Self::default();
        for (k, v) in m {
            match k.as_str() {
                "pri" => opts.pri = Some(as_u32(k, v)?),
                "fuzz" => opts.fuzz = Some(as_u32(k, v)?),
                "delay" => opts.delay = Some(as_u32(k, v)?),
                "ttr" => opts.ttr = Some(as_u32(k, v)?),
                "tube" => match v {
                    TaskValue::Str(s) => opts.tube = Some(s.clone()),
                    _ => return Err(bad(k)),
                },
                "fanout_degree" => {
                    opts.fanout_degree = Some(as_u64(k, v)?)
                },
                "fanout_fuzz" => opts.fanout_fuzz = Some(as_u32(k, v)?),
                "fanout_pri" => opts.fanout_pri = Some(as_u32(k, v)?),
                "delete_first" => match v {
                    TaskValue::Bool(b) => opts.delete_first = *b,
                    _ => return Err(bad(k)),
                },
                _ => {
                    opts.extra.insert(k.clone(), v.clone());
                },
            }
        }
        Ok(opts)
    }
}

/// Builds task descriptors into jobs and enqueues them, or dispatches them
/// synchronously through the registry when no queue is configured.
pub struct Enqueuer {
    broker: Option<Box<dyn Broker>>,
    registry: Arc<OperationRegistry>,
    app_version: Option<String>,
}

impl Enqueuer {
    pub fn new(
        broker: Option<Box<dyn Broker>>,
        registry: Arc<OperationRegistry>,
        app_version: Option<String>,
    ) -> Self {
        Self {
            broker,
            registry,
            app_version,
        }
    }

    pub fn registry(&self) -> Arc<OperationRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn app_version(&self) -> Option<&str> {
        self.app_version.as_deref()
    }

    pub async fn submit(
        &mut self,
        target: &dyn Submittable,
        op: &str,
        args: Vec<TaskValue>,
    ) -> Result<JobId, SubmitError> {
        self.submit_with(target, op, EnqueueOptions::default(), args)
            .await
    }

    /// Builds the descriptor and envelope, resolves scheduling options
    /// against the defaults, and enqueues. With no queue configured, the
    /// descriptor is dispatched immediately in-process and the sentinel
    /// identity returned.
    pub async fn submit_with(
        &mut self,
        target: &dyn Submittable,
        op: &str,
        opts: EnqueueOptions,
        args: Vec<TaskValue>,
    ) -> Result<JobId, SubmitError> {
        let desc = TaskDescriptor {
            target: target.target_ref(),
            op: op.to_string(),
            args,
            extra: opts.extra.clone(),
        };

        let pri = opts.resolved_pri();
        let delay = opts.delay.unwrap_or(DEFAULT_DELAY);
        let ttr = opts.ttr.unwrap_or(DEFAULT_TTR);
        let tube = opts
            .tube
            .clone()
            .or_else(|| self.app_version.clone())
            .unwrap_or_else(|| DEFAULT_TUBE.to_string());

        let env = JobEnvelope {
            v: ENVELOPE_VERSION,
            kind: ENVELOPE_KIND.to_string(),
            code: desc,
            appver: self.app_version.clone(),
            tube: tube.clone(),
            delete_first: opts.delete_first,
        };

        // The one serialization step everything depends on. Failures here
        // surface before any enqueue attempt.
        let body = serde_yaml::to_string(&env)?;

        match &mut self.broker {
            Some(broker) => {
                broker.connect().await.map_err(SubmitError::Queue)?;
                let (id, server) = broker
                    .put(body.as_bytes(), pri, delay, ttr, &tube)
                    .await
                    .map_err(SubmitError::Queue)?;
                info!(
                    job = %id, %server, pri, tube, code = ?env.code, "put"
                );
                Ok(id)
            },
            None => {
                debug!(pri, code = ?env.code, "no queue configured, running synchronously");
                self.dispatch_local(env.code).await?;
                Ok(JobId::SYNC)
            },
        }
    }

    /// The fanout splitter (producer side). Schedules `op` against `target`
    /// once per element of `interval`: directly when the interval fits
    /// within the fanout degree, otherwise via split jobs that re-invoke the
    /// splitter on balanced sub-intervals. Returns the number of jobs
    /// enqueued at this level.
    pub async fn submit_each(
        &mut self,
        interval: Interval,
        target: &dyn Submittable,
        op: &str,
        opts: EnqueueOptions,
        extra: &[TaskValue],
    ) -> Result<u64, SubmitError> {
        let degree = opts.fanout_degree.unwrap_or(DEFAULT_FANOUT_DEGREE);
        if degree < 1 {
            return Err(SubmitError::InvalidFanout(degree));
        }

        let size = interval.size();
        if size == 0 {
            return Ok(0);
        }

        let tref = target.target_ref();

        if size <= degree {
            // Leaf level: one job per element, the index appended to the
            // argument list. Leaves keep the caller's pri and fuzz.
            for i in interval.iter() {
                let mut args = extra.to_vec();
                args.push(TaskValue::Int(i));
                self.submit_with(&tref, op, opts.clone(), args).await?;
            }
            return Ok(size);
        }

        // Split level: one job per balanced sub-interval, each re-invoking
        // the splitter with the original options. fanout_pri overrides pri
        // for split jobs at every level; fanout_fuzz jitters them.
        let split_opts = EnqueueOptions {
            pri: opts.fanout_pri.or(opts.pri),
            fuzz: opts.fanout_fuzz,
            delay: opts.delay,
            ttr: opts.ttr,
            tube: opts.tube.clone(),
            ..EnqueueOptions::default()
        };

        let groups = (size + degree - 1) / degree;
        let parts = interval.split_to(groups.min(degree));

        let n = parts.len() as u64;
        for part in parts {
            let args = vec![
                TaskValue::Target(tref.clone()),
                TaskValue::Symbol(op.to_string()),
                opts.to_value(),
                TaskValue::Seq(extra.to_vec()),
            ];
            self.submit_with(
                &part.target_ref(),
                FANOUT_STEP_OP,
                split_opts.clone(),
                args,
            )
            .await?;
        }

        Ok(n)
    }

    /// The synchronous fallback: resolve the operation and run it here and
    /// now, as the worker would.
    async fn dispatch_local(
        &mut self,
        desc: TaskDescriptor,
    ) -> Result<(), SubmitError> {
        let registry = Arc::clone(&self.registry);
        let op = registry.resolve(&desc.op).ok_or_else(|| {
            SubmitError::Sync(RunError::UnknownOperation(desc.op.clone()))
        })?;

        let mut ctx = RunContext {
            enqueuer: self,
            job_id: JobId::SYNC,
        };

        op.run(&mut ctx, &desc.target, &desc.args)
            .await
            .map_err(SubmitError::Sync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use crate::registry::FnOperation;
    use crate::test_broker::SharedBroker;

    /// Registers an operation recording the final (index) argument of every
    /// invocation, returning the shared record.
    fn recording_registry(op: &str) -> (Arc<OperationRegistry>, Arc<Mutex<Vec<i64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = OperationRegistry::new();
        let record = Arc::clone(&seen);
        registry.register(
            op,
            Arc::new(FnOperation::new(move |_, _, args| {
                match args.last() {
                    Some(TaskValue::Int(i)) => {
                        record.lock().unwrap().push(*i)
                    },
                    other => panic!("expected an index argument, got {other:?}"),
                }
                Ok(())
            })),
        );
        (Arc::new(registry), seen)
    }

    #[tokio::test]
    async fn test_sync_fallback() {
        let ran = Arc::new(Mutex::new(0));
        let mut registry = OperationRegistry::new();
        let counter = Arc::clone(&ran);
        registry.register(
            "bump",
            Arc::new(FnOperation::new(move |_, _, _| {
                *counter.lock().unwrap() += 1;
                Ok(())
            })),
        );

        let mut enq = Enqueuer::new(None, Arc::new(registry), None);
        let id = enq
            .submit(&TargetRef::Type { kind: "x".into() }, "bump", vec![])
            .await
            .unwrap();

        assert_eq!(id, JobId::SYNC);
        assert_eq!(*ran.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sync_unknown_operation() {
        let mut enq =
            Enqueuer::new(None, Arc::new(OperationRegistry::new()), None);
        let err = enq
            .submit(&TargetRef::Type { kind: "x".into() }, "nope", vec![])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SubmitError::Sync(RunError::UnknownOperation(_))
        ));
    }

    #[test]
    fn test_priority_jitter_bound() {
        let opts = EnqueueOptions::default().with_pri(100).with_fuzz(7);
        for _ in 0..200 {
            let pri = opts.resolved_pri();
            assert!((100..=107).contains(&pri), "pri {pri} out of bounds");
        }

        // No fuzz: exactly the base.
        let opts = EnqueueOptions::default().with_pri(100);
        assert_eq!(opts.resolved_pri(), 100);
        assert_eq!(EnqueueOptions::default().resolved_pri(), DEFAULT_PRI);
    }

    #[test]
    fn test_options_round_trip_set_keys_only() {
        let opts = EnqueueOptions::default()
            .with_pri(9)
            .with_fanout_degree(10)
            .with_fanout_pri(3);

        let TaskValue::Map(m) = opts.to_value() else {
            panic!("expected a map");
        };
        // Only the explicitly-set keys appear.
        assert_eq!(
            m.keys().collect::<Vec<_>>(),
            vec!["fanout_degree", "fanout_pri", "pri"],
        );

        let back = EnqueueOptions::from_value(&TaskValue::Map(m)).unwrap();
        assert_eq!(back, opts);
    }

    #[tokio::test]
    async fn test_fanout_coverage() {
        // For each size, the leaves must cover the interval exactly once.
        const F: u64 = 3;
        for n in [0u64, 1, F, F + 1, 2 * F, F * F + 1] {
            let (registry, seen) = recording_registry("visit");
            let mut enq = Enqueuer::new(None, registry, None);

            let interval = Interval::new(10, 10 + n as i64 - 1);
            let opts = EnqueueOptions::default().with_fanout_degree(F);
            enq.submit_each(
                interval,
                &TargetRef::Type { kind: "x".into() },
                "visit",
                opts,
                &[],
            )
            .await
            .unwrap();

            let mut got = seen.lock().unwrap().clone();
            got.sort();
            assert_eq!(
                got,
                interval.iter().collect::<Vec<i64>>(),
                "coverage mismatch for n={n}"
            );
        }
    }

    #[tokio::test]
    async fn test_fanout_extra_args_precede_index() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let mut registry = OperationRegistry::new();
        let record = Arc::clone(&hits);
        registry.register(
            "visit",
            Arc::new(FnOperation::new(move |_, _, args| {
                record.lock().unwrap().push(args.to_vec());
                Ok(())
            })),
        );

        let mut enq = Enqueuer::new(None, Arc::new(registry), None);
        enq.submit_each(
            Interval::new(1, 2),
            &TargetRef::Type { kind: "x".into() },
            "visit",
            EnqueueOptions::default(),
            &[TaskValue::from("ctx")],
        )
        .await
        .unwrap();

        assert_eq!(
            *hits.lock().unwrap(),
            vec![
                vec![TaskValue::from("ctx"), TaskValue::Int(1)],
                vec![TaskValue::from("ctx"), TaskValue::Int(2)],
            ],
        );
    }

    #[tokio::test]
    async fn test_fanout_runs_on_spawned_task() {
        // Submission futures cross task boundaries: the whole recursive
        // fanout (including the fanout-step op's boxed future) must be
        // spawnable.
        let (registry, seen) = recording_registry("visit");
        let handle = tokio::spawn(async move {
            let mut enq = Enqueuer::new(None, registry, None);
            enq.submit_each(
                Interval::new(1, 10),
                &TargetRef::Type { kind: "x".into() },
                "visit",
                EnqueueOptions::default().with_fanout_degree(3),
                &[],
            )
            .await
            .unwrap();
        });
        handle.await.unwrap();

        assert_eq!(seen.lock().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_fanout_invalid_degree() {
        let mut enq =
            Enqueuer::new(None, Arc::new(OperationRegistry::new()), None);
        let err = enq
            .submit_each(
                Interval::new(1, 5),
                &TargetRef::Type { kind: "x".into() },
                "visit",
                EnqueueOptions::default().with_fanout_degree(0),
                &[],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::InvalidFanout(0)));
    }

    #[tokio::test]
    async fn test_fanout_boundary_counts() {
        // size <= F: only direct leaf jobs. size > F: only split jobs, and
        // min(F, ceil(size / F)) of them.
        const F: u64 = 3;

        for (n, want_direct, want_split) in
            [(3i64, 3, 0), (4, 0, 2), (10, 0, 3)]
        {
            let shared = SharedBroker::new("q1:11300");
            let mut enq = Enqueuer::new(
                Some(Box::new(shared.clone())),
                Arc::new(OperationRegistry::new()),
                None,
            );

            enq.submit_each(
                Interval::new(1, n),
                &TargetRef::Type { kind: "x".into() },
                "visit",
                EnqueueOptions::default().with_fanout_degree(F),
                &[],
            )
            .await
            .unwrap();

            let ops = shared.put_ops();
            let direct = ops.iter().filter(|op| op == &"visit").count();
            let split =
                ops.iter().filter(|op| op == &FANOUT_STEP_OP).count();
            assert_eq!(direct, want_direct, "direct count for n={n}");
            assert_eq!(split, want_split, "split count for n={n}");
        }
    }

    #[tokio::test]
    async fn test_fanout_2500_scenario() {
        // Top level: exactly 3 split jobs sized 834/833/833.
        let shared = SharedBroker::new("q1:11300");
        let mut enq = Enqueuer::new(
            Some(Box::new(shared.clone())),
            Arc::new(OperationRegistry::new()),
            None,
        );

        let n = enq
            .submit_each(
                Interval::new(1, 2500),
                &TargetRef::Type { kind: "x".into() },
                "visit",
                EnqueueOptions::default(),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(
            shared.put_intervals(),
            vec![
                Interval::new(1, 834),
                Interval::new(835, 1667),
                Interval::new(1668, 2500),
            ],
        );

        // End to end in synchronous mode: recursion terminates with exactly
        // 2500 leaves.
        let (registry, seen) = recording_registry("visit");
        let mut enq = Enqueuer::new(None, registry, None);
        enq.submit_each(
            Interval::new(1, 2500),
            &TargetRef::Type { kind: "x".into() },
            "visit",
            EnqueueOptions::default(),
            &[],
        )
        .await
        .unwrap();

        let mut got = seen.lock().unwrap().clone();
        got.sort();
        assert_eq!(got, (1..=2500).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_fanout_pri_applies_to_split_jobs_only() {
        const F: u64 = 3;
        let shared = SharedBroker::new("q1:11300");
        let mut enq = Enqueuer::new(
            Some(Box::new(shared.clone())),
            Arc::new(OperationRegistry::new()),
            None,
        );

        let opts = EnqueueOptions::default()
            .with_pri(200)
            .with_fanout_degree(F)
            .with_fanout_pri(50);

        // Split level: every put carries fanout_pri.
        enq.submit_each(
            Interval::new(1, 10),
            &TargetRef::Type { kind: "x".into() },
            "visit",
            opts.clone(),
            &[],
        )
        .await
        .unwrap();
        assert_eq!(shared.put_pris(), vec![50, 50, 50]);

        // Leaf level: every put keeps the original pri.
        let shared = SharedBroker::new("q1:11300");
        let mut enq = Enqueuer::new(
            Some(Box::new(shared.clone())),
            Arc::new(OperationRegistry::new()),
            None,
        );
        enq.submit_each(
            Interval::new(1, 2),
            &TargetRef::Type { kind: "x".into() },
            "visit",
            opts,
            &[],
        )
        .await
        .unwrap();
        assert_eq!(shared.put_pris(), vec![200, 200]);
    }
}
