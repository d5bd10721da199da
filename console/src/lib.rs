//! Provisioning Console Library
//!
//! Task orchestration, deployment-state tracking and schema management for
//! the provisioning console.

pub mod app;
pub mod db;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod storage;
pub mod utils;
