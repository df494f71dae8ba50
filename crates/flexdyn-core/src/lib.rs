//! Shared primitives for the flexdyn invocation controllers: the error
//! taxonomy and the filesystem operations every tool wrapper relies on
//! (unique working directories, atomic output relocation, non-emptiness
//! checks).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure of an invocation falls into exactly one of these
/// classes. Configuration and staging errors are raised before any
/// process is launched; execution and output-validation errors after.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("staging error: {0}")]
    Staging(String),

    #[error("execution error: {message}")]
    Execution {
        message: String,
        /// Exit status of the wrapped binary, when one was observed.
        status: Option<i32>,
    },

    #[error("output validation error: {0}")]
    OutputValidation(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn staging(msg: impl Into<String>) -> Self {
        Error::Staging(msg.into())
    }

    pub fn execution(msg: impl Into<String>, status: Option<i32>) -> Self {
        Error::Execution {
            message: msg.into(),
            status,
        }
    }

    pub fn output_validation(msg: impl Into<String>) -> Self {
        Error::OutputValidation(msg.into())
    }

    /// Exit status to propagate from the CLI. Execution errors carry
    /// the child's status when one exists; everything else maps to 1.
    pub fn exit_status(&self) -> i32 {
        match self {
            Error::Execution {
                status: Some(code), ..
            } => *code,
            _ => 1,
        }
    }
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .map_err(|e| Error::staging(format!("cannot create {}: {}", path.display(), e)))
}

static UNIQUE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Create a fresh, uniquely named directory under `parent`. The name
/// combines pid, timestamp and a process-local counter so concurrent
/// invocations never collide.
pub fn create_unique_dir(parent: &Path, prefix: &str) -> Result<PathBuf> {
    let n = UNIQUE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = format!(
        "{}_{}_{}_{}",
        prefix,
        std::process::id(),
        Utc::now().timestamp_micros(),
        n
    );
    let dir = parent.join(name);
    fs::create_dir_all(&dir)
        .map_err(|e| Error::staging(format!("cannot create {}: {}", dir.display(), e)))?;
    Ok(dir)
}

/// Existence plus non-zero length. The restart check and the
/// output-validation step both use this, never content checksums.
pub fn is_non_empty_file(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

/// Copy `src` into `dir` under `name`, reporting a staging error with
/// the source path on failure.
pub fn copy_into(src: &Path, dir: &Path, name: &str) -> Result<PathBuf> {
    if !src.is_file() {
        return Err(Error::staging(format!(
            "input file missing or unreadable: {}",
            src.display()
        )));
    }
    let dest = dir.join(name);
    fs::copy(src, &dest).map_err(|e| {
        Error::staging(format!(
            "cannot copy {} into {}: {}",
            src.display(),
            dir.display(),
            e
        ))
    })?;
    Ok(dest)
}

/// Relocate a produced artifact to its final destination atomically:
/// the destination path either holds the complete artifact or does not
/// exist. Bytes land in a hidden sibling temp file first, then a
/// rename publishes them.
pub fn relocate_atomic(artifact: &Path, dest: &Path) -> Result<()> {
    let bytes = fs::read(artifact).map_err(|e| {
        Error::output_validation(format!("cannot read artifact {}: {}", artifact.display(), e))
    })?;
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    let name = dest
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("artifact");
    let tmp = dest.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let write = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, dest)?;
        Ok(())
    })();
    if let Err(e) = write {
        let _ = fs::remove_file(&tmp);
        return Err(Error::output_validation(format!(
            "cannot relocate {} to {}: {}",
            artifact.display(),
            dest.display(),
            e
        )));
    }
    if let Some(parent) = dest.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Best-effort removal of a temporary directory. A cleanup failure is
/// logged, never escalated, so it cannot mask the primary error.
pub fn remove_dir_best_effort(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        if dir.exists() {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to remove working directory");
        }
    }
}
