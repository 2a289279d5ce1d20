pub mod descriptor;
pub mod envelope;
pub mod job;
pub mod protocol;
pub mod serialisable;
pub mod states;
