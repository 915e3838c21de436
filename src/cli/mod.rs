//! CLI Module
//!
//! Exit codes and results for automation

pub mod exit_codes;

pub use exit_codes::{exit_code_description, print_exit_codes, CliResult, ExitCodes};
