use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::Local;
use rand::Rng;

/// Base directories every job namespace hangs off.
#[derive(Clone, Debug)]
pub struct DataDirs {
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
}

/// The full filesystem namespace derived from one `job_id`.
///
/// Pure function of the job id and the configured base directories; building
/// it never touches the disk. [`JobLayout::ensure_dirs`] creates the
/// directories lazily and is safe to call repeatedly.
#[derive(Clone, Debug)]
pub struct JobLayout {
    pub job_id: String,
    /// `uploads/<job_id>`: the dataset root handed to the external tools.
    pub dataset_root: PathBuf,
    /// `uploads/<job_id>/input`: raw uploaded images.
    pub input_dir: PathBuf,
    /// `uploads/<job_id>/work`: scratch space.
    pub work_dir: PathBuf,
    /// `outputs/<job_id>`: training output tree.
    pub output_dir: PathBuf,
    /// `outputs/<job_id>/status.json`
    pub status_file: PathBuf,
    /// `outputs/<job_id>.zip`
    pub zip_path: PathBuf,
    /// `logs/<job_id>.log`: combined stdout/stderr across all stages.
    pub log_file: PathBuf,
}

impl JobLayout {
    pub fn new(dirs: &DataDirs, job_id: &str) -> Self {
        let dataset_root = dirs.upload_dir.join(job_id);
        let output_dir = dirs.output_dir.join(job_id);
        JobLayout {
            job_id: job_id.to_string(),
            input_dir: dataset_root.join("input"),
            work_dir: dataset_root.join("work"),
            status_file: output_dir.join("status.json"),
            zip_path: dirs.output_dir.join(format!("{job_id}.zip")),
            log_file: dirs.log_dir.join(format!("{job_id}.log")),
            dataset_root,
            output_dir,
        }
    }

    /// Create the namespace directories (with parents). Idempotent.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.input_dir)?;
        fs::create_dir_all(&self.work_dir)?;
        fs::create_dir_all(&self.output_dir)?;
        if let Some(parent) = self.log_file.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Canonical sparse-reconstruction directory the training stage expects.
    pub fn sparse_dir(&self) -> PathBuf {
        self.dataset_root.join("sparse")
    }

    /// `sparse/0`, the marker that a usable reconstruction exists.
    pub fn sparse_zero(&self) -> PathBuf {
        self.dataset_root.join("sparse").join("0")
    }

    /// Undistorted images produced by the conversion stage.
    pub fn undistorted_dir(&self) -> PathBuf {
        self.dataset_root.join("images")
    }
}

/// Restrict a caller-supplied job id to `[A-Za-z0-9_-]`.
///
/// Falls back to `"job"` when nothing survives, so the result is always a
/// usable directory name.
pub fn sanitize_job_id(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        "job".to_string()
    } else {
        cleaned
    }
}

/// Generate a fresh job id: `<prefix>-<timestamp>-<random hex>`.
///
/// The timestamp prefix makes lexicographic descending order a usable proxy
/// for recency when listing jobs.
pub fn make_job_id(prefix: &str) -> String {
    let ts = Local::now().format("%Y%m%d-%H%M%S");
    let suffix: u32 = rand::thread_rng().gen();
    format!("{prefix}-{ts}-{suffix:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dirs(base: &std::path::Path) -> DataDirs {
        DataDirs {
            upload_dir: base.join("uploads"),
            output_dir: base.join("outputs"),
            log_dir: base.join("logs"),
        }
    }

    #[test]
    fn layout_paths_follow_job_id() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = JobLayout::new(&dirs(tmp.path()), "scene_01");
        assert_eq!(layout.input_dir, tmp.path().join("uploads/scene_01/input"));
        assert_eq!(layout.status_file, tmp.path().join("outputs/scene_01/status.json"));
        assert_eq!(layout.zip_path, tmp.path().join("outputs/scene_01.zip"));
        assert_eq!(layout.log_file, tmp.path().join("logs/scene_01.log"));
        assert_eq!(layout.sparse_zero(), tmp.path().join("uploads/scene_01/sparse/0"));
    }

    #[test]
    fn ensure_dirs_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = JobLayout::new(&dirs(tmp.path()), "job-1");
        layout.ensure_dirs().unwrap();
        layout.ensure_dirs().unwrap();
        assert!(layout.input_dir.is_dir());
        assert!(layout.work_dir.is_dir());
        assert!(layout.output_dir.is_dir());
    }

    #[test]
    fn sanitize_strips_disallowed_characters() {
        assert_eq!(sanitize_job_id("my scene/01!"), "myscene01");
        assert_eq!(sanitize_job_id("a_b-C3"), "a_b-C3");
        assert_eq!(sanitize_job_id("../../etc"), "etc");
    }

    #[test]
    fn sanitize_falls_back_when_empty() {
        assert_eq!(sanitize_job_id(""), "job");
        assert_eq!(sanitize_job_id("/// "), "job");
    }

    #[test]
    fn generated_ids_are_filesystem_safe() {
        let id = make_job_id("recon");
        assert!(id.starts_with("recon-"));
        assert_eq!(id, sanitize_job_id(&id));
    }
}
