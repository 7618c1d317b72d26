//! Turning command-line size options or a partition file into a layout.
//!
//! A partition file has one `mountpoint size [device [filename]]` line per
//! partition; `root` and `swap` are recognised as mount points and a `---`
//! line starts the next disk. Filesystem-image hypervisors have no disks,
//! so there the separators are ignored.

use crate::context::Vm;
use crate::disk::{parse_size, Filesystem, FsType};
use crate::error::{Error, Result};
use crate::hypervisor::StorageKind;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One line of a partition file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartEntry {
    pub mntpnt: String,
    /// Megabytes.
    pub size: u64,
    pub device: Option<String>,
    pub filename: Option<PathBuf>,
}

impl PartEntry {
    fn fstype(&self, default_fs: FsType) -> FsType {
        if self.mntpnt == "swap" {
            FsType::Swap
        } else {
            default_fs
        }
    }

    fn mount_point(&self) -> Option<&str> {
        match self.mntpnt.as_str() {
            "root" => Some("/"),
            "swap" => None,
            other => Some(other),
        }
    }
}

/// Parse a partition file into per-disk entry lists.
pub fn parse_part_file(text: &str) -> Result<Vec<Vec<PartEntry>>> {
    let mut disks = vec![Vec::new()];
    for (lineno, line) in text.lines().enumerate() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [] => {}
            ["---", ..] => disks.push(Vec::new()),
            [mntpnt, size, rest @ ..] => {
                let entry = PartEntry {
                    mntpnt: mntpnt.to_string(),
                    size: parse_size(size)?,
                    device: rest.first().map(|d| d.to_string()),
                    filename: rest.get(1).map(PathBuf::from),
                };
                debug!("part: {}, size: {}", entry.mntpnt, entry.size);
                if let Some(disk) = disks.last_mut() {
                    disk.push(entry);
                }
            }
            [_] => {
                return Err(Error::config(format!(
                    "partition file line {}: expected 'mountpoint size'",
                    lineno + 1
                )))
            }
        }
    }
    Ok(disks)
}

/// Size options as given on the command line, in megabytes.
#[derive(Debug, Clone)]
pub struct DiskLayoutOptions {
    pub rootsize: u64,
    pub swapsize: u64,
    pub optsize: u64,
    /// Existing disk images or block devices to install onto.
    pub raw: Vec<PathBuf>,
    pub part: Option<PathBuf>,
}

impl Default for DiskLayoutOptions {
    fn default() -> Self {
        Self {
            rootsize: 4096,
            swapsize: 1024,
            optsize: 0,
            raw: Vec::new(),
            part: None,
        }
    }
}

impl DiskLayoutOptions {
    /// Populate the layout of `vm` for a hypervisor preferring `storage`.
    pub fn apply(&self, vm: &mut Vm, storage: StorageKind, default_fs: FsType) -> Result<()> {
        match (&self.part, storage) {
            (None, StorageKind::FsImage) => self.size_filesystems(vm, default_fs),
            (None, StorageKind::DiskImage) => self.size_disk(vm, default_fs),
            (Some(part), storage) => {
                let text = fs::read_to_string(part).map_err(|e| {
                    Error::config(format!("{} parsing --part option: {}", part.display(), e))
                })?;
                let disks = parse_part_file(&text)?;
                match storage {
                    StorageKind::FsImage => {
                        part_filesystems(vm, disks.into_iter().flatten(), default_fs);
                        Ok(())
                    }
                    StorageKind::DiskImage => self.part_disks(vm, &disks, default_fs),
                }
            }
        }
    }

    fn size_filesystems(&self, vm: &mut Vm, default_fs: FsType) -> Result<()> {
        vm.add_filesystem(Filesystem::new(default_fs, Some("/")).with_size(self.rootsize));
        if self.swapsize > 0 {
            vm.add_filesystem(Filesystem::new(FsType::Swap, None).with_size(self.swapsize));
        }
        if self.optsize > 0 {
            vm.add_filesystem(Filesystem::new(default_fs, Some("/opt")).with_size(self.optsize));
        }
        Ok(())
    }

    fn size_disk(&self, vm: &mut Vm, default_fs: FsType) -> Result<()> {
        if self.raw.is_empty() {
            let size = total_size([self.rootsize, self.swapsize, self.optsize])?;
            let filename = tmp_disk_name(&vm.workdir, 0);
            vm.add_disk(filename, Some(size))?;
        } else {
            for raw in &self.raw {
                vm.add_disk(raw, None)?;
            }
        }

        let disk = &mut vm.layout.disks[0];
        let mut offset = 0;
        disk.add_part(offset, self.rootsize, default_fs, Some("/"))?;
        offset = advance(offset, self.rootsize)?;
        if self.swapsize > 0 {
            disk.add_part(offset, self.swapsize, FsType::Swap, None)?;
            offset = advance(offset, self.swapsize)?;
        }
        if self.optsize > 0 {
            disk.add_part(offset, self.optsize, default_fs, Some("/opt"))?;
        }
        Ok(())
    }

    fn part_disks(&self, vm: &mut Vm, disks: &[Vec<PartEntry>], default_fs: FsType) -> Result<()> {
        for (index, entries) in disks.iter().enumerate() {
            let size = total_size(entries.iter().map(|e| e.size))?;
            debug!("disk #{} - size: {}", index, size);
            let disk = if self.raw.is_empty() {
                let filename = tmp_disk_name(&vm.workdir, index);
                let size = size
                    .checked_add(1)
                    .ok_or_else(|| Error::config(format!("disk #{index} is too large")))?;
                vm.add_disk(filename, Some(size))?
            } else {
                let raw = self.raw.get(index).ok_or_else(|| {
                    Error::config(format!(
                        "partition file describes disk {} but only {} --raw given",
                        index + 1,
                        self.raw.len()
                    ))
                })?;
                vm.add_disk(raw, None)?
            };

            let mut offset = 0;
            for entry in entries {
                disk.add_part(
                    offset,
                    entry.size,
                    entry.fstype(default_fs),
                    entry.mount_point(),
                )?;
                offset = advance(offset, entry.size)?;
            }
        }
        Ok(())
    }
}

fn part_filesystems(vm: &mut Vm, entries: impl Iterator<Item = PartEntry>, default_fs: FsType) {
    for entry in entries {
        let mut fs =
            Filesystem::new(entry.fstype(default_fs), entry.mount_point()).with_size(entry.size);
        if let Some(filename) = &entry.filename {
            fs = fs.with_filename(filename);
        }
        // A bare device column names the guest device outright.
        let named = entry.mntpnt == "root" || entry.mntpnt == "swap";
        if let (Some(device), None, false) = (&entry.device, &entry.filename, named) {
            fs = fs
                .with_devletter("")
                .with_device(device.as_str())
                .with_dummy(entry.size == 0);
        }
        vm.add_filesystem(fs);
    }
}

/// Sum of partition sizes in megabytes.
fn total_size(sizes: impl IntoIterator<Item = u64>) -> Result<u64> {
    sizes
        .into_iter()
        .try_fold(0u64, u64::checked_add)
        .ok_or_else(|| Error::config("partition sizes add up to more than any disk can hold"))
}

fn advance(offset: i64, size: u64) -> Result<i64> {
    i64::try_from(size)
        .ok()
        .and_then(|size| offset.checked_add(size))
        .ok_or_else(|| Error::config(format!("partition offset {offset}MB + {size}MB overflows")))
}

fn tmp_disk_name(workdir: &Path, index: usize) -> PathBuf {
    let mut name = workdir.join(format!("disk{index}.img"));
    while name.exists() {
        let stem = name
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        name = workdir.join(format!("{stem}_.img"));
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;
    use std::rc::Rc;
    use tempfile::TempDir;

    fn vm(temp: &TempDir) -> Vm {
        Vm::with_runner(temp.path(), Rc::new(RecordingRunner::new()))
    }

    fn layout(vm: &Vm) -> Vec<(i64, i64, FsType, Option<String>)> {
        vm.layout
            .disks
            .iter()
            .flat_map(|d| d.partitions())
            .map(|p| (p.begin(), p.end(), p.fstype(), p.mntpnt().map(str::to_string)))
            .collect()
    }

    #[test]
    fn test_default_sizes_on_one_disk() {
        let temp = TempDir::new().unwrap();
        let mut vm = vm(&temp);
        DiskLayoutOptions::default()
            .apply(&mut vm, StorageKind::DiskImage, FsType::Ext4)
            .unwrap();

        assert_eq!(vm.layout.disks.len(), 1);
        assert_eq!(vm.layout.disks[0].size, 5120);
        assert_eq!(vm.layout.disks[0].filename, temp.path().join("disk0.img"));
        let parts = layout(&vm);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].2, FsType::Ext4);
        assert_eq!(parts[0].3.as_deref(), Some("/"));
        assert_eq!(parts[1].2, FsType::Swap);
    }

    #[test]
    fn test_sizes_as_filesystem_images() {
        let temp = TempDir::new().unwrap();
        let mut vm = vm(&temp);
        let options = DiskLayoutOptions {
            optsize: 512,
            ..Default::default()
        };
        options.apply(&mut vm, StorageKind::FsImage, FsType::Ext3).unwrap();

        let summary: Vec<(FsType, Option<&str>, u64)> = vm
            .layout
            .filesystems
            .iter()
            .map(|fs| (fs.fstype, fs.mntpnt.as_deref(), fs.size))
            .collect();
        assert_eq!(
            summary,
            vec![
                (FsType::Ext3, Some("/"), 4096),
                (FsType::Swap, None, 1024),
                (FsType::Ext3, Some("/opt"), 512),
            ]
        );
        assert!(vm.layout.disks.is_empty());
    }

    #[test]
    fn test_parse_part_file() {
        let disks = parse_part_file("root 1000\nswap 256\n\n---\n/var 2G\n").unwrap();
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0][1].mntpnt, "swap");
        assert_eq!(disks[1][0].size, 2048);

        assert!(parse_part_file("root\n").is_err());
        assert!(parse_part_file("root big\n").is_err());
    }

    #[test]
    fn test_part_file_on_disk_images() {
        let temp = TempDir::new().unwrap();
        let part = temp.path().join("layout.part");
        fs::write(&part, "root 1000\nswap 256\n---\n/var 500\n").unwrap();
        let mut vm = vm(&temp);
        let options = DiskLayoutOptions {
            part: Some(part),
            ..Default::default()
        };
        options.apply(&mut vm, StorageKind::DiskImage, FsType::Ext4).unwrap();

        assert_eq!(vm.layout.disks.len(), 2);
        assert_eq!(vm.layout.disks[0].size, 1257);
        assert_eq!(vm.layout.disks[1].size, 501);
        assert_eq!(vm.layout.disks[1].filename, temp.path().join("disk1.img"));
        let parts = layout(&vm);
        assert_eq!(parts[0].3.as_deref(), Some("/"));
        assert_eq!(parts[1].2, FsType::Swap);
        assert_eq!(parts[2].3.as_deref(), Some("/var"));
    }

    #[test]
    fn test_part_file_sizes_overflowing_u64_are_rejected() {
        let temp = TempDir::new().unwrap();
        let part = temp.path().join("layout.part");
        fs::write(&part, "root 18446744073709551615\n/var 18446744073709551615\n").unwrap();
        let mut vm = vm(&temp);
        let options = DiskLayoutOptions {
            part: Some(part),
            ..Default::default()
        };

        assert!(matches!(
            options.apply(&mut vm, StorageKind::DiskImage, FsType::Ext4),
            Err(Error::Configuration(_))
        ));
        assert!(vm.layout.disks.is_empty());
    }

    #[test]
    fn test_size_options_overflowing_u64_are_rejected() {
        let temp = TempDir::new().unwrap();
        let mut vm = vm(&temp);
        let options = DiskLayoutOptions {
            rootsize: u64::MAX,
            ..Default::default()
        };

        assert!(matches!(
            options.apply(&mut vm, StorageKind::DiskImage, FsType::Ext4),
            Err(Error::Configuration(_))
        ));
        assert!(vm.layout.disks.is_empty());
    }

    #[test]
    fn test_part_file_with_missing_raw_disk() {
        let temp = TempDir::new().unwrap();
        let part = temp.path().join("layout.part");
        fs::write(&part, "root 100\n---\n/srv 100\n").unwrap();
        let raw = temp.path().join("raw.img");
        let file = fs::File::create(&raw).unwrap();
        file.set_len(200 * 1024 * 1024).unwrap();

        let mut vm = vm(&temp);
        let options = DiskLayoutOptions {
            raw: vec![raw],
            part: Some(part),
            ..Default::default()
        };
        assert!(matches!(
            options.apply(&mut vm, StorageKind::DiskImage, FsType::Ext4),
            Err(Error::Configuration(_))
        ));
        assert!(vm.layout.disks[0].preallocated);
    }

    #[test]
    fn test_part_file_as_filesystem_images() {
        let temp = TempDir::new().unwrap();
        let part = temp.path().join("layout.part");
        let existing = temp.path().join("home.img");
        fs::write(
            &part,
            format!("root 1000\nswap 128\n---\n/srv 0 xvdc\n/home 300 b1 {}\n", existing.display()),
        )
        .unwrap();
        let mut vm = vm(&temp);
        let options = DiskLayoutOptions {
            part: Some(part),
            ..Default::default()
        };
        options.apply(&mut vm, StorageKind::FsImage, FsType::Ext3).unwrap();

        let fss = &vm.layout.filesystems;
        assert_eq!(fss.len(), 4);
        assert_eq!(fss[0].mntpnt.as_deref(), Some("/"));
        assert_eq!(fss[1].fstype, FsType::Swap);
        assert_eq!(fss[2].suffix(), "xvdc");
        assert!(fss[2].dummy);
        assert_eq!(fss[3].filename.as_deref(), Some(existing.as_path()));
        assert!(!fss[3].dummy);
    }
}
