//! Data Transfer Objects
//!
//! Files exchanged with the external job runner that prepares a run directory.

pub mod job;
