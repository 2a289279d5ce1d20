//! Bulk-submission fanout: a contiguous integer interval is either expanded
//! into one leaf job per element, or partitioned into bounded groups whose
//! jobs re-invoke the splitter on their sub-interval. The result is a
//! recursion tree with branching factor at most `fanout_degree`, so a bulk
//! submission of N elements never performs more than `fanout_degree` direct
//! enqueues at any one level.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::enqueue::EnqueueOptions;
use crate::error::RunError;
use crate::registry::{Operation, RunContext};
use crate::types::descriptor::{TargetRef, TaskValue};

pub const DEFAULT_FANOUT_DEGREE: u64 = 1000;

/// The registry name of the built-in split-step operation.
pub const FANOUT_STEP_OP: &str = "fanout-step";

/// An ordered, contiguous, inclusive integer interval. Empty when
/// `last < first`. All splitting is by element count, never by numeric span.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize,
)]
pub struct Interval {
    pub first: i64,
    pub last: i64,
}

impl Interval {
    pub fn new(first: i64, last: i64) -> Self {
        Self { first, last }
    }

    pub fn size(&self) -> u64 {
        if self.last < self.first {
            0
        } else {
            (self.last - self.first) as u64 + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.last < self.first
    }

    pub fn iter(&self) -> impl Iterator<Item = i64> {
        self.first..=self.last
    }

    /// Consecutive sub-intervals of `n` elements each; the final one holds
    /// whatever remains.
    pub fn split_by(&self, n: u64) -> Vec<Interval> {
        assert!(n >= 1, "slice size must be at least 1");

        let mut out = Vec::new();
        let mut i = self.first;
        while i <= self.last {
            let j = i.saturating_add(n as i64 - 1).min(self.last);
            out.push(Interval::new(i, j));
            if j == self.last {
                break;
            }
            i = j + 1;
        }
        out
    }

    /// Balanced partition into at most `k` contiguous sub-intervals whose
    /// sizes differ by at most one, earlier sub-intervals taking the extra
    /// element. An interval smaller than `k` yields one sub-interval per
    /// element.
    pub fn split_to(&self, k: u64) -> Vec<Interval> {
        assert!(k >= 1, "partition count must be at least 1");

        let size = self.size();
        if size == 0 {
            return Vec::new();
        }

        let k = k.min(size);
        let base = size / k;
        let rem = size % k;

        let mut out = Vec::with_capacity(k as usize);
        let mut i = self.first;
        for part in 0..k {
            let len = base + if part < rem { 1 } else { 0 };
            let j = i + len as i64 - 1;
            out.push(Interval::new(i, j));
            i = j + 1;
        }
        out
    }
}

/// The worker-side half of the splitter: decodes a split job's arguments and
/// re-invokes `submit_each` on the sub-interval. Pre-registered in every
/// `OperationRegistry`.
pub(crate) struct FanoutStepOp;

#[async_trait]
impl Operation for FanoutStepOp {
    async fn run(
        &self,
        ctx: &mut RunContext<'_>,
        target: &TargetRef,
        args: &[TaskValue],
    ) -> Result<(), RunError> {
        let TargetRef::Literal(value) = target else {
            return Err(RunError::BadDescriptor(
                "fanout step target must be an interval literal".to_string(),
            ));
        };
        let TaskValue::Interval(interval) = value.as_ref() else {
            return Err(RunError::BadDescriptor(
                "fanout step target must be an interval literal".to_string(),
            ));
        };

        let [TaskValue::Target(rcv), TaskValue::Symbol(op), opts, TaskValue::Seq(extra)] =
            args
        else {
            return Err(RunError::BadDescriptor(
                "fanout step args must be (target, op, opts, extra)"
                    .to_string(),
            ));
        };

        let opts = EnqueueOptions::from_value(opts)?;

        ctx.enqueuer
            .submit_each(*interval, rcv, op, opts, extra)
            .await
            .map_err(|e| RunError::Failed(Box::new(e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(parts: &[Interval]) -> Vec<u64> {
        parts.iter().map(Interval::size).collect()
    }

    #[test]
    fn test_size() {
        assert_eq!(Interval::new(1, 1).size(), 1);
        assert_eq!(Interval::new(1, 10).size(), 10);
        assert_eq!(Interval::new(-5, 5).size(), 11);
        assert_eq!(Interval::new(1, 0).size(), 0);
        assert!(Interval::new(1, 0).is_empty());
    }

    #[test]
    fn test_split_by() {
        assert_eq!(
            Interval::new(1, 7).split_by(3),
            vec![
                Interval::new(1, 3),
                Interval::new(4, 6),
                Interval::new(7, 7),
            ],
        );
        assert_eq!(Interval::new(1, 3).split_by(10), vec![Interval::new(1, 3)]);
        assert_eq!(Interval::new(1, 0).split_by(3), vec![]);
    }

    #[test]
    fn test_split_to_balanced() {
        // 2500 into 3: earlier sub-intervals absorb the remainder.
        let parts = Interval::new(1, 2500).split_to(3);
        assert_eq!(sizes(&parts), vec![834, 833, 833]);
        assert_eq!(parts[0], Interval::new(1, 834));
        assert_eq!(parts[1], Interval::new(835, 1667));
        assert_eq!(parts[2], Interval::new(1668, 2500));

        // Partition count is capped by the element count.
        let parts = Interval::new(1, 2).split_to(5);
        assert_eq!(sizes(&parts), vec![1, 1]);

        assert_eq!(Interval::new(1, 0).split_to(3), vec![]);

        // Every element appears exactly once, in order.
        let parts = Interval::new(-3, 17).split_to(4);
        let all: Vec<i64> = parts.iter().flat_map(Interval::iter).collect();
        assert_eq!(all, (-3..=17).collect::<Vec<i64>>());
    }
}
