//! Core domain types
//!
//! This module contains the domain structures shared by the supervising agent
//! (which writes them) and the CLI (which reads them back from disk).

pub mod handle;
pub mod job;
pub mod run_dir;
