//! Run directory layout
//!
//! A run directory holds everything belonging to one job:
//! - `in.json`: job description prepared by the job runner
//! - `out.json`: job result, written once when the job finishes
//! - `run.log`: combined stdout/stderr of the job
//! - `simrun.handle`: handle record while the job is live

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::domain::handle::HandleRecord;
use crate::domain::job::JobOutput;
use crate::dto::job::JobInput;

pub const INPUT_FILE: &str = "in.json";
pub const OUTPUT_FILE: &str = "out.json";
pub const LOG_FILE: &str = "run.log";
pub const HANDLE_FILE: &str = "simrun.handle";

/// Errors raised while reading or writing run directory files
#[derive(Debug, Error)]
pub enum RunDirError {
    #[error("run directory {0} does not exist")]
    Missing(PathBuf),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path}: invalid json: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path}: {message}")]
    Invalid { path: PathBuf, message: String },
}

pub type Result<T> = std::result::Result<T, RunDirError>;

/// A job's working directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDir {
    path: PathBuf,
}

impl RunDir {
    /// Wraps an existing directory
    ///
    /// The path is made absolute so it can be bind-mounted into containers
    /// at the same location.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(RunDirError::Missing(path.to_path_buf()));
        }
        let path = fs::canonicalize(path).map_err(|source| RunDirError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn input_path(&self) -> PathBuf {
        self.path.join(INPUT_FILE)
    }

    pub fn output_path(&self) -> PathBuf {
        self.path.join(OUTPUT_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.path.join(LOG_FILE)
    }

    pub fn handle_path(&self) -> PathBuf {
        self.path.join(HANDLE_FILE)
    }

    /// Reads and validates `in.json`
    pub fn read_input(&self) -> Result<JobInput> {
        let path = self.input_path();
        let input: JobInput = read_json(&path)?;
        input
            .validate()
            .map_err(|message| RunDirError::Invalid { path, message })?;
        Ok(input)
    }

    pub fn write_output(&self, output: &JobOutput) -> Result<()> {
        write_json_atomic(&self.output_path(), output)
    }

    /// Reads `out.json`, returning `None` while the job has not finished
    pub fn read_output(&self) -> Result<Option<JobOutput>> {
        read_json_opt(&self.output_path())
    }

    /// Removes a previous `out.json` so a rerun starts clean
    pub fn clear_output(&self) -> Result<()> {
        remove_if_exists(&self.output_path())
    }

    pub fn write_handle(&self, record: &HandleRecord) -> Result<()> {
        write_json_atomic(&self.handle_path(), record)
    }

    /// Creates the handle record unless one already exists
    ///
    /// Returns `false` when another record is present. The record is written
    /// to a private file and hard-linked into place, so the check and the
    /// write are one step and readers never see a partial record.
    pub fn create_handle(&self, record: &HandleRecord) -> Result<bool> {
        let path = self.handle_path();
        let tmp = self
            .path
            .join(format!(".{}.{}.tmp", HANDLE_FILE, std::process::id()));
        let bytes = serde_json::to_vec_pretty(record).map_err(|source| RunDirError::Json {
            path: path.clone(),
            source,
        })?;
        fs::write(&tmp, bytes).map_err(|source| RunDirError::Io {
            path: tmp.clone(),
            source,
        })?;
        let linked = fs::hard_link(&tmp, &path);
        remove_if_exists(&tmp)?;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(source) => Err(RunDirError::Io { path, source }),
        }
    }

    /// Removes the handle record only if it still equals `record`
    pub fn remove_handle_if(&self, record: &HandleRecord) -> Result<bool> {
        match self.read_handle()? {
            Some(current) if current == *record => {
                self.clear_handle()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn read_handle(&self) -> Result<Option<HandleRecord>> {
        read_json_opt(&self.handle_path())
    }

    /// Removes the handle record; a missing record is not an error
    pub fn clear_handle(&self) -> Result<()> {
        remove_if_exists(&self.handle_path())
    }

    /// Returns up to `max_lines` trailing lines of `run.log`
    pub fn log_tail(&self, max_lines: usize) -> Result<Vec<String>> {
        let path = self.log_path();
        let content = match fs::read(&path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(RunDirError::Io { path, source }),
        };
        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        Ok(lines[start..].iter().map(|l| l.to_string()).collect())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(|source| RunDirError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| RunDirError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    read_json(path).map(Some)
}

/// Writes to a sibling temp file then renames, so readers never see a partial file
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| RunDirError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)
        .and_then(|_| fs::rename(&tmp, path))
        .map_err(|source| RunDirError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(RunDirError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
