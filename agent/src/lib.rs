//! Vigil agent library — exposes modules for integration testing.

#![cfg_attr(test, allow(clippy::expect_used))]

pub mod checkin;
pub mod collectors;
pub mod config;
pub mod dispatch;
pub mod exclusion;
pub mod platform;
pub mod ports;
pub mod proc_tree;
pub mod runner;
pub mod script;
pub mod sink;
#[doc(hidden)]
pub mod test_support;
pub mod transport;
