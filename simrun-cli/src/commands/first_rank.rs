//! First-rank command handler
//!
//! Executed by every rank of an `mpiexec` job. Rank 0 runs the program, the
//! other ranks wait for its outcome, so single-writer steps (writing an
//! output file, post-processing) happen once per job.

use anyhow::Result;
use simrun_runner::mpi::{self, Communicator, FileCommunicator, SingleRank};
use std::path::Path;
use std::process::ExitCode;
use tracing::{error, info};

pub async fn handle_first_rank(dir: &Path, command: &[String]) -> Result<ExitCode> {
    let Some((program, args)) = command.split_first() else {
        anyhow::bail!("first-rank requires a program");
    };

    let comm: Box<dyn Communicator> = match FileCommunicator::from_env(dir)? {
        Some(comm) => Box::new(comm),
        None => Box::new(SingleRank),
    };
    info!(
        "Rank {}/{} running first-rank '{}'",
        comm.rank(),
        comm.size(),
        program
    );

    match mpi::run_on_first_rank(comm.as_ref(), program, args).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            error!("{}", e);
            Ok(ExitCode::from(mpi::ABORT_EXIT_CODE as u8))
        }
    }
}
