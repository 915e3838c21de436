//! Core module containing the test orchestration engine
//!
//! This module provides:
//! - Line queue between the device reader and the dispatcher
//! - Test case contract and the marker-accumulation state machine
//! - Dispatcher with explicit lifecycle and fail-fast policy
//! - Test notifications and the JSON-lines session log
//! - Line sources (serial, reader, child process)
//! - Build/flash step
//! - Runner wiring everything together

pub mod build;
pub mod dispatcher;
pub mod events;
pub mod line;
pub mod queue;
pub mod runner;
pub mod session_log;
pub mod source;
pub mod testcase;
