//! Deployment module

pub mod catalog;
pub mod executor;
pub mod fsm;
pub mod manager;
pub mod output;
