use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Position in the stage state machine.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    Convert,
    Train,
    Done,
    PrecheckFailed,
    ConvertFailed,
    TrainFailed,
    Cancelled,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Stage::Init | Stage::Convert | Stage::Train)
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Stage::PrecheckFailed | Stage::ConvertFailed | Stage::TrainFailed | Stage::Cancelled
        )
    }
}

/// The persisted projection of a job, overwritten at every stage transition.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StatusRecord {
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl StatusRecord {
    pub fn running(stage: Stage, message: &str) -> Self {
        StatusRecord {
            stage,
            message: Some(message.to_string()),
            progress: Some(0),
            exit_code: None,
        }
    }

    pub fn terminal(stage: Stage, exit_code: i32) -> Self {
        StatusRecord {
            stage,
            message: None,
            progress: None,
            exit_code: Some(exit_code),
        }
    }
}

/// Result of reading a status file. Missing and unparseable files are
/// expected states, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusRead {
    Record(StatusRecord),
    Missing,
    Corrupt,
}

/// Atomically persist `record` at `path`.
///
/// The record is serialized to a sibling temp file and renamed over the
/// target, so a concurrent reader sees either the previous record or the new
/// one, never a partial write.
pub fn write_status(path: &Path, record: &StatusRecord) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec(record)?;
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    debug!(path = %path.display(), stage = ?record.stage, "status written");
    Ok(())
}

pub fn read_status(path: &Path) -> StatusRead {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(_) => return StatusRead::Missing,
    };
    match serde_json::from_slice(&bytes) {
        Ok(record) => StatusRead::Record(record),
        Err(_) => StatusRead::Corrupt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out/status.json");
        let record = StatusRecord::running(Stage::Convert, "Running COLMAP");
        write_status(&path, &record).unwrap();
        assert_eq!(read_status(&path), StatusRead::Record(record));
    }

    #[test]
    fn overwrite_replaces_previous_record() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("status.json");
        write_status(&path, &StatusRecord::running(Stage::Init, "starting")).unwrap();
        write_status(&path, &StatusRecord::terminal(Stage::Done, 0)).unwrap();
        match read_status(&path) {
            StatusRead::Record(r) => {
                assert_eq!(r.stage, Stage::Done);
                assert_eq!(r.exit_code, Some(0));
            }
            other => panic!("unexpected read: {other:?}"),
        }
        // No stray temp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn missing_file_is_a_sentinel() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(read_status(&tmp.path().join("nope.json")), StatusRead::Missing);
    }

    #[test]
    fn corrupt_file_is_a_sentinel() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("status.json");
        fs::write(&path, b"{\"stage\": \"conv").unwrap();
        assert_eq!(read_status(&path), StatusRead::Corrupt);
    }

    #[test]
    fn stage_serializes_snake_case() {
        let json = serde_json::to_string(&Stage::PrecheckFailed).unwrap();
        assert_eq!(json, "\"precheck_failed\"");
    }
}
