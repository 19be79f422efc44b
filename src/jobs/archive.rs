use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use super::error::PipelineError;

/// Package the whole `src_dir` tree into a deflate zip at `dest`.
///
/// Re-invoking for the same destination overwrites the previous archive. An
/// empty source tree produces an empty archive rather than an error; missing
/// results are diagnosed by the pipeline, not here.
pub fn zip_dir(src_dir: &Path, dest: &Path) -> Result<PathBuf, PipelineError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    }
    let file = File::create(dest).map_err(|e| PipelineError::io(dest, e))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    if src_dir.is_dir() {
        add_dir_recursive(&mut writer, src_dir, src_dir, options)?;
    }
    writer.finish()?;
    debug!(src = %src_dir.display(), dest = %dest.display(), "archive written");
    Ok(dest.to_path_buf())
}

fn add_dir_recursive(
    writer: &mut ZipWriter<File>,
    root: &Path,
    dir: &Path,
    options: SimpleFileOptions,
) -> Result<(), PipelineError> {
    let entries = fs::read_dir(dir).map_err(|e| PipelineError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| PipelineError::io(dir, e))?;
        let path = entry.path();
        // Entries come from walking root, so the prefix always strips.
        let rel = path.strip_prefix(root).unwrap_or(&path);
        let name = rel.to_string_lossy().replace('\\', "/");
        if path.is_dir() {
            writer.add_directory(name, options)?;
            add_dir_recursive(writer, root, &path, options)?;
        } else {
            writer.start_file(name, options)?;
            let mut f = File::open(&path).map_err(|e| PipelineError::io(&path, e))?;
            io::copy(&mut f, writer).map_err(|e| PipelineError::io(&path, e))?;
        }
    }
    Ok(())
}

/// Extract an uploaded dataset zip into `dest_dir`, preserving structure.
pub fn extract_zip(zip_path: &Path, dest_dir: &Path) -> Result<(), PipelineError> {
    fs::create_dir_all(dest_dir).map_err(|e| PipelineError::io(dest_dir, e))?;
    let file = File::open(zip_path).map_err(|e| PipelineError::io(zip_path, e))?;
    let mut archive = ZipArchive::new(file)?;
    archive.extract(dest_dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_tree_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("out");
        fs::create_dir_all(src.join("point_cloud/iteration_100")).unwrap();
        fs::write(src.join("cameras.json"), b"[]").unwrap();
        fs::write(src.join("point_cloud/iteration_100/point_cloud.ply"), b"ply").unwrap();

        let dest = tmp.path().join("out.zip");
        zip_dir(&src, &dest).unwrap();

        let unpacked = tmp.path().join("unpacked");
        extract_zip(&dest, &unpacked).unwrap();
        assert!(unpacked.join("cameras.json").is_file());
        assert!(unpacked
            .join("point_cloud/iteration_100/point_cloud.ply")
            .is_file());
    }

    #[test]
    fn empty_source_produces_empty_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("empty");
        fs::create_dir_all(&src).unwrap();
        let dest = tmp.path().join("empty.zip");
        zip_dir(&src, &dest).unwrap();
        let archive = ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        assert_eq!(archive.len(), 0);
    }

    #[test]
    fn rerun_overwrites_previous_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("out");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.txt"), b"one").unwrap();
        let dest = tmp.path().join("out.zip");
        zip_dir(&src, &dest).unwrap();

        fs::write(src.join("b.txt"), b"two").unwrap();
        zip_dir(&src, &dest).unwrap();
        let archive = ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
    }

    #[test]
    fn missing_source_still_yields_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("gone.zip");
        zip_dir(&tmp.path().join("does-not-exist"), &dest).unwrap();
        assert!(dest.is_file());
    }
}
