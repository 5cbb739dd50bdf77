//! netpoll-exporter library crate.
//!
//! Polls a cloud network-management API on three schedules and republishes
//! the results as Prometheus metrics.

pub mod api;
pub mod client;
pub mod collector;
pub mod config;
pub mod error;
pub mod inventory;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod scheduler;
pub mod tier;

pub use error::{Error, Result};
