//! A beanstalkd-backed deferred-job layer: producers enqueue structured task
//! descriptors with scheduling attributes (priority, delay, TTR, tube), and
//! worker loops lease, run, and acknowledge them against one or more queue
//! servers. Bulk submissions are split recursively into bounded fanout trees
//! instead of enqueuing one job per element.

pub mod connection;
pub mod enqueue;
pub mod error;
pub mod events;
pub mod fanout;
pub mod line_reader;
pub mod parser;
pub mod registry;
#[cfg(test)]
pub(crate) mod test_broker;
pub mod types;
pub mod util;
pub mod worker;
