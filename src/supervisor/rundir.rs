//! Run directory and master pid file

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::error::{SupervisorError, SupervisorResult};

/// Pid file name inside the run directory
pub const PID_FILE: &str = "master.pid";

/// The master's run directory
#[derive(Debug)]
pub struct RunDir {
    path: PathBuf,
}

impl RunDir {
    /// Create the directory if needed.
    ///
    /// Fails if `path` exists and is not a directory.
    pub fn prepare(path: impl Into<PathBuf>) -> SupervisorResult<Self> {
        let path = path.into();

        match fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(SupervisorError::RunDirNotDirectory { path }),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(&path).map_err(|source| SupervisorError::RunDirCreate {
                    path: path.clone(),
                    source,
                })?;
                debug!(path = %path.display(), "Created run directory");
            }
            Err(source) => return Err(SupervisorError::RunDirCreate { path, source }),
        }

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Full path of the pid file
    pub fn pid_path(&self) -> PathBuf {
        self.path.join(PID_FILE)
    }

    /// Record `pid` as the running master
    pub fn write_pid(&self, pid: u32) -> SupervisorResult<()> {
        let path = self.pid_path();
        fs::write(&path, format!("{pid}\n")).map_err(|source| SupervisorError::PidFile { path, source })
    }

    /// Remove the pid file; a missing file is not an error
    pub fn remove_pid(&self) {
        let path = self.pid_path();
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove pid file");
            }
        }
    }
}

/// Read the master pid recorded in `run_dir`
pub fn read_master_pid(run_dir: &Path) -> SupervisorResult<i32> {
    let path = run_dir.join(PID_FILE);
    let content = fs::read_to_string(&path).map_err(|source| SupervisorError::PidFile {
        path: path.clone(),
        source,
    })?;

    content
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or(SupervisorError::InvalidPid { path, content })
}
