//! Partition tables and host mapper devices.
//!
//! `parted` writes the msdos label and partitions, `kpartx` exposes each
//! partition of the image as `/dev/mapper/<name>`. Teardown of those devices
//! is racy on busy hosts (udev still holding the nodes), so [`Disk::unmap`]
//! waits and retries before giving up.

use super::Disk;
use crate::error::{Error, Result};
use crate::process::{Cmd, CommandRunner};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

/// Delays and retry bound for [`Disk::unmap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnmapPolicy {
    /// Wait before the first attempt.
    pub settle: Duration,
    /// Retried attempts before the final one.
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for UnmapPolicy {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(3),
            attempts: 3,
            backoff: Duration::from_secs(3),
        }
    }
}

impl UnmapPolicy {
    /// No waiting at all; for hosts without udev races and for tests.
    pub fn immediate() -> Self {
        Self {
            settle: Duration::ZERO,
            attempts: 3,
            backoff: Duration::ZERO,
        }
    }
}

/// Mapper device names from `kpartx -av` output, in partition order.
pub fn parse_kpartx(output: &str) -> Vec<String> {
    let mut devices = Vec::new();
    for line in output.lines() {
        if line.is_empty() || line.starts_with("gpt:") || line.starts_with("dos:") {
            continue;
        }
        if line.starts_with("add") {
            match line.split_whitespace().nth(2) {
                Some(name) => devices.push(name.to_string()),
                None => error!("Malformed kpartx line: {}", line),
            }
            continue;
        }
        error!("Skipping unknown line in kpartx output ({})", line);
    }
    devices
}

impl Disk {
    /// Write an msdos label and one primary partition per layout entry.
    pub fn partition(&self, runner: &dyn CommandRunner) -> Result<()> {
        info!("Adding partition table to disk image: {}", self.filename.display());
        Cmd::new("parted")
            .arg("--script")
            .arg_path(&self.filename)
            .args(["mklabel", "msdos"])
            .error_msg("Failed to write partition table")
            .run(runner)?;

        for part in self.partitions() {
            let start = if part.begin() == 0 {
                "63s".to_string()
            } else {
                part.begin().to_string()
            };
            Cmd::new("parted")
                .args(["--script", "--"])
                .arg_path(&self.filename)
                .args(["mkpart", "primary", part.fstype().parted_fstype()])
                .arg(start)
                .arg(part.end().to_string())
                .error_msg("Failed to create partition")
                .run(runner)?;
        }
        Ok(())
    }

    /// Bind the image to mapper devices and record each partition's device.
    ///
    /// The caller registers the matching [`unmap`](Disk::unmap) before
    /// calling this, so a half-finished mapping is still torn down.
    pub fn map_partitions(&mut self, runner: &dyn CommandRunner) -> Result<()> {
        info!("Creating loop devices corresponding to the created partitions");
        let out = Cmd::new("kpartx")
            .arg("-av")
            .arg_path(&self.filename)
            .error_msg("Failed to map partitions")
            .run(runner)?;

        let devices = parse_kpartx(&out.stdout);
        if devices.len() < self.partitions().len() {
            warn!(
                "kpartx mapped {} devices for {} partitions of {}",
                devices.len(),
                self.partitions().len(),
                self.filename.display()
            );
        }
        for (part, name) in self.partitions_mut().iter_mut().zip(devices) {
            part.fs_mut().filename = Some(PathBuf::from("/dev/mapper").join(name));
        }
        Ok(())
    }

    /// Remove the mapper devices, retrying while they are still busy.
    ///
    /// A final attempt always follows the retry loop, even after one of
    /// the retries succeeded. Partition device paths are cleared whatever the outcome. With
    /// `ignore_fail` the last attempt's failure is only logged.
    pub fn unmap(
        &mut self,
        runner: &dyn CommandRunner,
        policy: &UnmapPolicy,
        ignore_fail: bool,
    ) -> Result<()> {
        let result = self.unmap_devices(runner, policy, ignore_fail);
        for part in self.partitions_mut() {
            part.fs_mut().filename = None;
        }
        result
    }

    fn unmap_devices(
        &self,
        runner: &dyn CommandRunner,
        policy: &UnmapPolicy,
        ignore_fail: bool,
    ) -> Result<()> {
        let kpartx = || Cmd::new("kpartx").arg("-d").arg_path(&self.filename);

        thread::sleep(policy.settle);
        for attempt in 1..=policy.attempts {
            match kpartx().run(runner) {
                Ok(_) => break,
                Err(e) => {
                    warn!(
                        "Unmapping {} failed (attempt {}/{}): {}",
                        self.filename.display(),
                        attempt,
                        policy.attempts,
                        e
                    );
                    thread::sleep(policy.backoff);
                }
            }
        }

        info!("Making one last attempt to unmap {}", self.filename.display());
        if ignore_fail {
            kpartx().allow_fail().run(runner)?;
            return Ok(());
        }
        kpartx().run(runner).map_err(|e| Error::Teardown {
            path: self.filename.clone(),
            attempts: policy.attempts + 1,
            source: Box::new(e),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::FsType;
    use crate::process::testing::RecordingRunner;
    use std::path::Path;
    use tempfile::TempDir;

    const KPARTX_OUTPUT: &str = "\
gpt: 0 slices
dos: 4 slices
add map loop0p1 (253:0): 0 1024000 linear /dev/loop0 63
add map loop0p2 (253:1): 0 2097152 linear /dev/loop0 1024063

add map loop0p3 (253:2): 0 4096000 linear /dev/loop0 3121215
";

    fn disk(temp: &TempDir) -> Disk {
        let mut disk = Disk::new(temp.path().join("disk0.img"), Some(8192)).unwrap();
        disk.add_part(0, 500, FsType::Ext4, Some("/")).unwrap();
        disk.add_part(500, 1024, FsType::Swap, None).unwrap();
        disk.add_part(1524, 2000, FsType::Ext4, Some("/var")).unwrap();
        disk
    }

    #[test]
    fn test_parse_kpartx_ignores_headers_and_blank_lines() {
        let devices = parse_kpartx(KPARTX_OUTPUT);
        assert_eq!(devices, vec!["loop0p1", "loop0p2", "loop0p3"]);
    }

    #[test]
    fn test_parse_kpartx_skips_unknown_lines() {
        assert_eq!(
            parse_kpartx("something odd\nadd map loop1p1 (253:3): 0 1 linear\n"),
            vec!["loop1p1"]
        );
    }

    #[test]
    fn test_partition_commands() {
        let temp = TempDir::new().unwrap();
        let disk = disk(&temp);
        let runner = RecordingRunner::new();
        disk.partition(&runner).unwrap();

        let img = disk.filename.display().to_string();
        assert_eq!(
            runner.calls(),
            vec![
                format!("parted --script {img} mklabel msdos"),
                format!("parted --script -- {img} mkpart primary ext2 63s 499"),
                format!("parted --script -- {img} mkpart primary linux-swap(new) 500 1523"),
                format!("parted --script -- {img} mkpart primary ext2 1524 3523"),
            ]
        );
    }

    #[test]
    fn test_map_partitions_assigns_devices_in_order() {
        let temp = TempDir::new().unwrap();
        let mut disk = disk(&temp);
        let runner = RecordingRunner::new();
        runner.respond("kpartx -av", KPARTX_OUTPUT);

        disk.map_partitions(&runner).unwrap();
        let names: Vec<_> = disk.partitions().iter().map(|p| p.filename()).collect();
        assert_eq!(
            names,
            vec![
                Some(Path::new("/dev/mapper/loop0p1")),
                Some(Path::new("/dev/mapper/loop0p2")),
                Some(Path::new("/dev/mapper/loop0p3")),
            ]
        );
    }

    #[test]
    fn test_unmap_retries_then_succeeds() {
        let temp = TempDir::new().unwrap();
        let mut disk = disk(&temp);
        let runner = RecordingRunner::new();
        runner.respond("kpartx -av", KPARTX_OUTPUT);
        runner.fail("kpartx -d", Some(2));

        disk.map_partitions(&runner).unwrap();
        disk.unmap(&runner, &UnmapPolicy::immediate(), false).unwrap();

        assert_eq!(runner.count("kpartx -d"), 4);
        assert!(disk.partitions().iter().all(|p| p.filename().is_none()));
    }

    #[test]
    fn test_unmap_success_still_makes_final_attempt() {
        let temp = TempDir::new().unwrap();
        let mut disk = disk(&temp);
        let runner = RecordingRunner::new();
        runner.respond("kpartx -av", KPARTX_OUTPUT);

        disk.map_partitions(&runner).unwrap();
        disk.unmap(&runner, &UnmapPolicy::immediate(), false).unwrap();

        assert_eq!(runner.count("kpartx -d"), 2);
    }

    #[test]
    fn test_unmap_gives_up_with_teardown_error() {
        let temp = TempDir::new().unwrap();
        let mut disk = disk(&temp);
        let runner = RecordingRunner::new();
        runner.respond("kpartx -av", KPARTX_OUTPUT);
        runner.fail("kpartx -d", None);

        disk.map_partitions(&runner).unwrap();
        let err = disk
            .unmap(&runner, &UnmapPolicy::immediate(), false)
            .unwrap_err();

        assert!(matches!(err, Error::Teardown { attempts: 4, .. }));
        assert_eq!(runner.count("kpartx -d"), 4);
        assert!(disk.partitions().iter().all(|p| p.filename().is_none()));
    }

    #[test]
    fn test_unmap_ignoring_failures() {
        let temp = TempDir::new().unwrap();
        let mut disk = disk(&temp);
        let runner = RecordingRunner::new();
        runner.fail("kpartx -d", None);

        disk.unmap(&runner, &UnmapPolicy::immediate(), true).unwrap();
        assert_eq!(runner.count("kpartx -d"), 4);
    }
}
