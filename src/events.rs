//! Entity lifecycle events and their subscriptions. Saving an entity emits a
//! single hooks job; the worker that picks it up fans it out to every
//! operation subscribed to that (entity kind, event) pair. Publishers stay
//! decoupled from how many subscribers exist, at the cost of one extra queue
//! hop per event.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::enqueue::Enqueuer;
use crate::error::{RunError, SubmitError};
use crate::registry::{Operation, RunContext};
use crate::types::descriptor::{TargetRef, TaskValue};
use crate::types::job::JobId;

/// The registry name of the built-in hooks-dispatch operation.
pub const EVENT_HOOKS_OP: &str = "event-hooks";

#[derive(
    Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EntityEvent {
    Created,
    Updated,
    /// Emitted on every save, whether it created or updated.
    Saved,
}

impl EntityEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Saved => "saved",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            "saved" => Some(Self::Saved),
            _ => None,
        }
    }
}

/// (entity kind, event) -> subscribed operation names. Built at startup
/// alongside the registry and shared immutably after that.
#[derive(Default)]
pub struct EventSubscriptions {
    subs: BTreeMap<(String, EntityEvent), Vec<String>>,
}

impl EventSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
        kind: impl Into<String>,
        event: EntityEvent,
        op: impl Into<String>,
    ) {
        self.subs
            .entry((kind.into(), event))
            .or_default()
            .push(op.into());
    }

    pub fn for_event(&self, kind: &str, event: EntityEvent) -> &[String] {
        self.subs
            .get(&(kind.to_string(), event))
            .map_or(&[], Vec::as_slice)
    }

    /// Publishes one event against a target. A single hooks job carries the
    /// event; dispatch to subscribers happens when it runs. Targets with no
    /// entity kind, and events nobody subscribed to, are dropped without a
    /// job.
    pub async fn notify(
        &self,
        enqueuer: &mut Enqueuer,
        target: &TargetRef,
        event: EntityEvent,
    ) -> Result<Option<JobId>, SubmitError> {
        let Some(kind) = target.kind() else {
            return Ok(None);
        };
        if self.for_event(kind, event).is_empty() {
            debug!(kind, event = event.name(), "no subscribers, not queueing");
            return Ok(None);
        }

        let id = enqueuer
            .submit(
                target,
                EVENT_HOOKS_OP,
                vec![TaskValue::Symbol(event.name().to_string())],
            )
            .await?;
        Ok(Some(id))
    }
}

/// The worker-side half: decodes the event name from a hooks job and invokes
/// every subscribed operation against the same target.
pub struct EventHooksOp {
    subs: Arc<EventSubscriptions>,
}

impl EventHooksOp {
    pub fn new(subs: Arc<EventSubscriptions>) -> Self {
        Self { subs }
    }
}

#[async_trait]
impl Operation for EventHooksOp {
    async fn run(
        &self,
        ctx: &mut RunContext<'_>,
        target: &TargetRef,
        args: &[TaskValue],
    ) -> Result<(), RunError> {
        let [TaskValue::Symbol(name)] = args else {
            return Err(RunError::BadDescriptor(
                "event hooks args must be a single event symbol".to_string(),
            ));
        };
        let event = EntityEvent::from_name(name).ok_or_else(|| {
            RunError::BadDescriptor(format!("unknown event {name}"))
        })?;
        let kind = target.kind().ok_or_else(|| {
            RunError::BadDescriptor(
                "event hooks target must name an entity kind".to_string(),
            )
        })?;

        for op in self.subs.for_event(kind, event) {
            ctx.enqueuer
                .submit(target, op, vec![])
                .await
                .map_err(|e| RunError::Failed(Box::new(e)))?;
        }
        Ok(())
    }
}
