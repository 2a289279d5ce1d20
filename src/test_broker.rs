//! An in-memory `Broker` with a manually-advanced clock, for exercising the
//! enqueuer and worker loop without a real server. Leases, delays, TTR
//! expiry and burial follow the server's observable behaviour; everything
//! else (tube routing, priority ordering) is deliberately simplistic.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::connection::Broker;
use crate::error::QueueError;
use crate::fanout::Interval;
use crate::types::descriptor::{TargetRef, TaskValue};
use crate::types::envelope::JobEnvelope;
use crate::types::job::{Job, JobId, ServerAddr};
use crate::types::protocol::JobStats;
use crate::types::states::JobState;

#[derive(Clone, Debug)]
pub(crate) struct FakeJob {
    pub id: JobId,
    pub body: Bytes,
    pub pri: u32,
    pub ttr: u32,
    pub tube: String,
    pub created: u64,
    /// Not ready before this instant.
    pub delay_until: u64,
    /// The delay the job was last put or released with.
    pub last_delay: u32,
    pub reserved_until: Option<u64>,
    pub buried: bool,
    pub deleted: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Action {
    Put {
        pri: u32,
        delay: u32,
        ttr: u32,
        tube: String,
    },
    Reserve {
        prefer: Option<ServerAddr>,
    },
    Delete(JobId),
    Release {
        id: JobId,
        pri: u32,
        delay: u32,
    },
    Bury {
        id: JobId,
        pri: u32,
    },
}

pub(crate) struct TestBroker {
    addr: ServerAddr,
    now: u64,
    next_id: u64,
    pub jobs: Vec<FakeJob>,
    pub actions: Vec<Action>,
    /// When set, every stats record reports this age instead of the clock
    /// difference.
    pub age_override: Option<u32>,
    /// Simulated reserve latency.
    pub reserve_delay: Option<Duration>,
    /// Number of upcoming `connect` calls that fail.
    pub connect_failures: u32,
}

impl TestBroker {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: ServerAddr::Tcp(addr.to_string()),
            now: 1000,
            next_id: 1,
            jobs: Vec::new(),
            actions: Vec::new(),
            age_override: None,
            reserve_delay: None,
            connect_failures: 0,
        }
    }

    pub fn advance(&mut self, secs: u64) {
        self.now += secs;
    }

    pub fn put_sync(
        &mut self,
        body: &[u8],
        pri: u32,
        delay: u32,
        ttr: u32,
        tube: &str,
    ) -> JobId {
        let id = JobId(self.next_id);
        self.next_id += 1;

        self.actions.push(Action::Put {
            pri,
            delay,
            ttr,
            tube: tube.to_string(),
        });
        self.jobs.push(FakeJob {
            id,
            body: Bytes::copy_from_slice(body),
            pri,
            ttr,
            tube: tube.to_string(),
            created: self.now,
            delay_until: self.now + delay as u64,
            last_delay: delay,
            reserved_until: None,
            buried: false,
            deleted: false,
        });
        id
    }

    /// Leases the first ready job, if any. A lease that has outlived its TTR
    /// no longer protects the job.
    pub fn reserve_sync(&mut self) -> Option<Job> {
        let now = self.now;
        let addr = self.addr.clone();
        let job = self.jobs.iter_mut().find(|j| {
            !j.deleted
                && !j.buried
                && j.delay_until <= now
                && j.reserved_until.is_none_or(|until| until <= now)
        })?;

        job.reserved_until = Some(now + job.ttr as u64);
        Some(Job::new(job.id, addr, job.body.clone()))
    }

    fn job_mut(&mut self, id: JobId) -> Result<&mut FakeJob, QueueError> {
        self.jobs
            .iter_mut()
            .find(|j| j.id == id && !j.deleted)
            .ok_or(QueueError::UnexpectedResponse("NOT_FOUND"))
    }

    pub fn delete_sync(&mut self, id: JobId) -> Result<(), QueueError> {
        self.actions.push(Action::Delete(id));
        self.job_mut(id)?.deleted = true;
        Ok(())
    }

    pub fn release_sync(
        &mut self,
        id: JobId,
        pri: u32,
        delay: u32,
    ) -> Result<(), QueueError> {
        self.actions.push(Action::Release { id, pri, delay });
        let now = self.now;
        let job = self.job_mut(id)?;
        job.pri = pri;
        job.last_delay = delay;
        job.delay_until = now + delay as u64;
        job.reserved_until = None;
        Ok(())
    }

    pub fn bury_sync(&mut self, id: JobId, pri: u32) -> Result<(), QueueError> {
        self.actions.push(Action::Bury { id, pri });
        let job = self.job_mut(id)?;
        job.pri = pri;
        job.buried = true;
        job.reserved_until = None;
        Ok(())
    }

    pub fn stats_sync(&mut self, id: JobId) -> JobStats {
        let age_override = self.age_override;
        let now = self.now;
        let Ok(job) = self.job_mut(id) else {
            return JobStats::synthetic(id);
        };

        let state = if job.buried {
            JobState::Buried
        } else if job.reserved_until.is_some_and(|until| until > now) {
            JobState::Reserved
        } else if job.delay_until > now {
            JobState::Delayed
        } else {
            JobState::Ready
        };

        JobStats {
            id: id.0,
            tube: job.tube.clone(),
            state,
            pri: job.pri,
            age: age_override.unwrap_or((now - job.created) as u32),
            delay: job.last_delay,
            ttr: job.ttr,
            time_left: job
                .reserved_until
                .map_or(0, |until| until.saturating_sub(now) as u32),
            file: 0,
            reserves: 0,
            timeouts: 0,
            releases: 0,
            buries: 0,
            kicks: 0,
        }
    }
}

/// Cloneable handle over a shared `TestBroker`, so a test can hand one copy
/// to the code under test and keep another for inspection.
#[derive(Clone)]
pub(crate) struct SharedBroker(Arc<Mutex<TestBroker>>);

impl SharedBroker {
    pub fn new(addr: &str) -> Self {
        Self(Arc::new(Mutex::new(TestBroker::new(addr))))
    }

    pub fn lock(&self) -> MutexGuard<'_, TestBroker> {
        self.0.lock().unwrap()
    }

    fn put_envelopes(&self) -> Vec<JobEnvelope> {
        self.lock()
            .jobs
            .iter()
            .map(|j| {
                serde_yaml::from_slice(&j.body)
                    .expect("job body is not an envelope")
            })
            .collect()
    }

    /// Operation names of every job put so far, in insertion order.
    pub fn put_ops(&self) -> Vec<String> {
        self.put_envelopes()
            .into_iter()
            .map(|env| env.code.op)
            .collect()
    }

    /// Interval targets of every job put so far. Panics on a non-interval
    /// target.
    pub fn put_intervals(&self) -> Vec<Interval> {
        self.put_envelopes()
            .into_iter()
            .map(|env| match env.code.target {
                TargetRef::Literal(v) => match *v {
                    TaskValue::Interval(interval) => interval,
                    other => panic!("expected an interval, got {other:?}"),
                },
                other => panic!("expected a literal target, got {other:?}"),
            })
            .collect()
    }

    /// Priorities of every job put so far, in insertion order.
    pub fn put_pris(&self) -> Vec<u32> {
        self.lock()
            .actions
            .iter()
            .filter_map(|a| match a {
                Action::Put { pri, .. } => Some(*pri),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Broker for SharedBroker {
    async fn connect(&mut self) -> Result<(), QueueError> {
        let mut inner = self.lock();
        if inner.connect_failures > 0 {
            inner.connect_failures -= 1;
            return Err(QueueError::Connection(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "no route to queue server",
            )));
        }
        Ok(())
    }

    async fn put(
        &mut self,
        body: &[u8],
        pri: u32,
        delay: u32,
        ttr: u32,
        tube: &str,
    ) -> Result<(JobId, ServerAddr), QueueError> {
        let mut inner = self.lock();
        let id = inner.put_sync(body, pri, delay, ttr, tube);
        Ok((id, inner.addr.clone()))
    }

    async fn reserve(
        &mut self,
        prefer: Option<&ServerAddr>,
    ) -> Result<Job, QueueError> {
        let delay = {
            let mut inner = self.lock();
            inner.actions.push(Action::Reserve {
                prefer: prefer.cloned(),
            });
            inner.reserve_delay
        };
        // Simulated latency; the lock must not be held across the await.
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        loop {
            if let Some(job) = self.lock().reserve_sync() {
                return Ok(job);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn delete(&mut self, job: &Job) -> Result<(), QueueError> {
        self.lock().delete_sync(job.id)
    }

    async fn release(
        &mut self,
        job: &Job,
        pri: u32,
        delay: u32,
    ) -> Result<(), QueueError> {
        self.lock().release_sync(job.id, pri, delay)
    }

    async fn bury(&mut self, job: &Job, pri: u32) -> Result<(), QueueError> {
        self.lock().bury_sync(job.id, pri)
    }

    async fn stats_job(&mut self, job: &Job) -> JobStats {
        self.lock().stats_sync(job.id)
    }

    async fn watch(&mut self, _tube: &str) -> Result<(), QueueError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ttr_re_lease() {
        // A lease that outlives its TTR stops protecting the job: the next
        // reserve hands it out again.
        let shared = SharedBroker::new("q1:11300");
        let mut broker: Box<dyn Broker> = Box::new(shared.clone());

        shared.lock().put_sync(b"x", 512, 0, 30, "default");

        let job = broker.reserve(None).await.unwrap();
        assert_eq!(job.id, JobId(1));
        assert!(shared.lock().reserve_sync().is_none());

        shared.lock().advance(31);
        let again = broker.reserve(None).await.unwrap();
        assert_eq!(again.id, JobId(1));
    }

    #[tokio::test]
    async fn test_decay_grows_delay() {
        let shared = SharedBroker::new("q1:11300");
        let mut broker: Box<dyn Broker> = Box::new(shared.clone());

        shared.lock().put_sync(b"x", 512, 0, 120, "default");
        let job = broker.reserve(None).await.unwrap();

        // First decay: delay 0 is treated as 1, so ceil(1 * 1.3) = 2.
        broker.decay(&job).await.unwrap();
        assert_eq!(
            shared.lock().actions.last(),
            Some(&Action::Release {
                id: JobId(1),
                pri: 512,
                delay: 2
            })
        );

        // Decaying again compounds on the recorded delay. The release left
        // the job delayed, so move the clock past it first.
        shared.lock().advance(2);
        let job = broker.reserve(None).await.unwrap();
        broker.decay(&job).await.unwrap();
        assert_eq!(
            shared.lock().actions.last(),
            Some(&Action::Release {
                id: JobId(1),
                pri: 512,
                delay: 3
            })
        );
    }

    #[tokio::test]
    async fn test_decay_cap_buries() {
        let shared = SharedBroker::new("q1:11300");
        let mut broker: Box<dyn Broker> = Box::new(shared.clone());

        shared.lock().put_sync(b"x", 512, 0, 120, "default");
        let job = broker.reserve(None).await.unwrap();
        shared.lock().jobs[0].last_delay = 3000;

        // ceil(3000 * 1.3) = 3900 > 3600: buried, not released.
        broker.decay(&job).await.unwrap();
        assert_eq!(
            shared.lock().actions.last(),
            Some(&Action::Bury {
                id: JobId(1),
                pri: 512
            })
        );
        assert!(shared.lock().jobs[0].buried);
    }
}
