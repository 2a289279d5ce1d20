//! The registry of named operations: the worker resolves a descriptor's
//! operation name here and runs the match. This replaces textual code in job
//! bodies end-to-end; a job can only ever invoke an operation the process
//! registered at startup.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::enqueue::Enqueuer;
use crate::error::RunError;
use crate::fanout::{FanoutStepOp, FANOUT_STEP_OP};
use crate::types::descriptor::{TargetRef, TaskValue};
use crate::types::job::JobId;

/// What an operation gets to work with while running: the identity of the
/// job being dispatched and an enqueuer for re-submission (the fanout step
/// and event hooks both enqueue their children through this).
pub struct RunContext<'a> {
    pub enqueuer: &'a mut Enqueuer,
    pub job_id: JobId,
}

/// A named unit of deferred work. Implementations are registered once at
/// startup and resolved by descriptor operation name at dispatch time.
#[async_trait]
pub trait Operation: Send + Sync {
    async fn run(
        &self,
        ctx: &mut RunContext<'_>,
        target: &TargetRef,
        args: &[TaskValue],
    ) -> Result<(), RunError>;
}

type OpFn = Box<
    dyn Fn(
            &mut RunContext<'_>,
            &TargetRef,
            &[TaskValue],
        ) -> Result<(), RunError>
        + Send
        + Sync,
>;

/// Adapts a plain closure into an `Operation`, for handlers that don't need
/// to await anything.
pub struct FnOperation {
    f: OpFn,
}

impl FnOperation {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(
                &mut RunContext<'_>,
                &TargetRef,
                &[TaskValue],
            ) -> Result<(), RunError>
            + Send
            + Sync
            + 'static,
    {
        Self { f: Box::new(f) }
    }
}

#[async_trait]
impl Operation for FnOperation {
    async fn run(
        &self,
        ctx: &mut RunContext<'_>,
        target: &TargetRef,
        args: &[TaskValue],
    ) -> Result<(), RunError> {
        (self.f)(ctx, target, args)
    }
}

/// Operation name -> implementation. Built at startup, then shared immutably
/// between the enqueuer and the worker loop.
pub struct OperationRegistry {
    ops: HashMap<String, Arc<dyn Operation>>,
}

impl OperationRegistry {
    /// An empty registry apart from the built-in fanout step.
    pub fn new() -> Self {
        let mut r = Self {
            ops: HashMap::new(),
        };
        r.register(FANOUT_STEP_OP, Arc::new(FanoutStepOp));
        r
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        op: Arc<dyn Operation>,
    ) {
        self.ops.insert(name.into(), op);
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Operation>> {
        self.ops.get(name).map(Arc::clone)
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
