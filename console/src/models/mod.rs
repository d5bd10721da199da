//! Persisted records

pub mod deployment;
pub mod task;
