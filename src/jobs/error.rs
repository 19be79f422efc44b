use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Failures surfaced by the jobs core.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The external command could not be spawned at all.
    ///
    /// This is distinct from a process that ran and exited nonzero: the
    /// tool was missing or not executable, so no exit code exists.
    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("i/o error at {}: {}", path.display(), source)]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// An id that does not name a single directory under the data roots.
    #[error("invalid job id `{0}`")]
    InvalidJobId(String),
}

impl PipelineError {
    pub fn io(path: &Path, source: io::Error) -> Self {
        PipelineError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
