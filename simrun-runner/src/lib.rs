//! simrun runner
//!
//! Supervises simulation jobs in their run directories:
//! - Drivers: start a job as a local process group or a container and hand
//!   back a handle that can be awaited and killed with a grace period
//! - MPI: `mpiexec` command lines and rank-0 single-writer coordination
//! - Agent: runs one run directory from `in.json` to `out.json`

pub mod agent;
pub mod config;
pub mod driver;
pub mod env;
pub mod error;
pub mod mpi;
pub mod scrape;

pub use agent::{JobAgent, RunMode, cancel_on_signal, process_alive};
pub use config::Config;
pub use error::{Result, RunnerError};
