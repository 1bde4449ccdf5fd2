//! Configuration module
//!
//! Loads the runner configuration from the environment and applies the
//! global command line overrides on top. A malformed variable is an error
//! rather than a silent fallback to defaults.

use anyhow::{Context, Result};
use clap::Args;
use simrun_core::domain::job::Backend;
use simrun_runner::Config;
use std::time::Duration;
use tracing::debug;

/// Global flags overriding the environment
#[derive(Debug, Clone, Default, Args)]
pub struct Overrides {
    /// Backend used when in.json does not name one (local, docker)
    #[arg(long, global = true)]
    pub backend: Option<Backend>,

    /// MPI cores for run-background
    #[arg(long, global = true)]
    pub cores: Option<usize>,

    /// Seconds between SIGTERM and SIGKILL on cancel
    #[arg(long, global = true)]
    pub kill_grace: Option<u64>,

    /// Job wall clock limit in seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,
}

impl Overrides {
    /// Effective runner configuration
    pub fn load(&self) -> Result<Config> {
        self.load_from(|key| std::env::var(key).ok())
    }

    fn load_from<F>(&self, var: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Config::from_lookup(var).context("Invalid environment configuration")?;
        let config = self.apply(config);
        debug!("Effective configuration: {:?}", config);
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    fn apply(&self, mut config: Config) -> Config {
        if let Some(backend) = self.backend {
            config = config.with_backend(backend);
        }
        if let Some(cores) = self.cores {
            config = config.with_mpi_cores(cores);
        }
        if let Some(grace) = self.kill_grace {
            config = config.with_kill_grace(Duration::from_secs(grace));
        }
        if let Some(timeout) = self.timeout {
            config = config.with_job_timeout(Duration::from_secs(timeout));
        }
        config
    }
}
