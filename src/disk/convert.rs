//! Conversion of raw images into hypervisor disk formats.

use super::Disk;
use crate::error::Result;
use crate::process::{Cmd, CommandRunner};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Convert `source` into `format` at `destination` and remove the raw file.
pub fn convert_image(
    source: &Path,
    destination: &Path,
    format: &str,
    runner: &dyn CommandRunner,
) -> Result<()> {
    info!("Converting {} to {}, format {}", source.display(), destination.display(), format);
    let cmd = if format == "vdi" {
        Cmd::new("VBoxManage")
            .arg("convertfromraw")
            .args(["-format", "VDI"])
            .arg_path(source)
            .arg_path(destination)
    } else {
        Cmd::new(crate::preflight::qemu_img())
            .args(["convert", "-O", format])
            .arg_path(source)
            .arg_path(destination)
    };
    cmd.error_msg("Failed to convert image").run(runner)?;
    fs::remove_file(source)?;
    Ok(())
}

/// `<destdir>/<file stem>.<format>`.
fn converted_name(source: &Path, destdir: &Path, format: &str) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "disk".to_string());
    destdir.join(format!("{stem}.{format}"))
}

impl Disk {
    /// Convert into `destdir` and return the resulting file.
    ///
    /// Preallocated disks are the user's own files and are returned
    /// untouched.
    pub fn convert(
        &mut self,
        destdir: &Path,
        format: &str,
        runner: &dyn CommandRunner,
    ) -> Result<PathBuf> {
        if self.preallocated {
            return Ok(self.filename.clone());
        }
        let destination = converted_name(&self.filename, destdir, format);
        convert_image(&self.filename, &destination, format, runner)?;
        self.filename = destination.clone();
        self.format_type = Some(format.to_string());
        Ok(destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;
    use tempfile::TempDir;

    #[test]
    fn test_convert_to_qcow2_removes_raw_source() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out");
        fs::create_dir(&out).unwrap();
        let mut disk = Disk::new(temp.path().join("disk0.img"), Some(64)).unwrap();
        fs::write(&disk.filename, b"raw").unwrap();
        let runner = RecordingRunner::new();

        let result = disk.convert(&out, "qcow2", &runner).unwrap();

        assert_eq!(result, out.join("disk0.qcow2"));
        assert_eq!(disk.filename, result);
        assert_eq!(disk.format_type.as_deref(), Some("qcow2"));
        assert!(!temp.path().join("disk0.img").exists());
        assert!(runner.calls()[0].contains("convert -O qcow2"));
    }

    #[test]
    fn test_convert_to_vdi_uses_vboxmanage() {
        let temp = TempDir::new().unwrap();
        let mut disk = Disk::new(temp.path().join("disk0.img"), Some(64)).unwrap();
        fs::write(&disk.filename, b"raw").unwrap();
        let runner = RecordingRunner::new();

        disk.convert(temp.path(), "vdi", &runner).unwrap();
        assert!(runner.calls()[0].starts_with("VBoxManage convertfromraw -format VDI"));
    }

    #[test]
    fn test_preallocated_disk_is_left_alone() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("mine.img");
        fs::File::create(&image).unwrap().set_len(1024 * 1024).unwrap();
        let mut disk = Disk::new(&image, None).unwrap();
        let runner = RecordingRunner::new();

        assert_eq!(disk.convert(temp.path(), "qcow2", &runner).unwrap(), image);
        assert!(image.exists());
        assert!(runner.calls().is_empty());
    }
}
