//! Simrun Core
//!
//! Core types shared by the simrun job supervisor and its command-line front end.
//!
//! This crate contains:
//! - Domain types: run directories, exit states, job outputs and handle records
//! - DTOs: the job description read from a run directory's `in.json`

pub mod domain;
pub mod dto;

pub use domain::run_dir::{RunDir, RunDirError};
