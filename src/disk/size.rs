//! Size strings and host size detection, in megabytes.

use crate::error::{Error, Result};
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

const MB: u64 = 1024 * 1024;

/// Parse a size the way `qemu-img` accepts it and return megabytes.
///
/// A bare number is megabytes; `K`, `M` and `G` suffixes are
/// case-insensitive. Kilobyte sizes round down.
pub fn parse_size(size: &str) -> Result<u64> {
    let size = size.trim();
    if let Ok(n) = size.parse::<u64>() {
        return Ok(n);
    }

    let invalid = || Error::config(format!("invalid size: {size}"));
    let Some(suffix) = size.chars().last() else {
        return Err(invalid());
    };
    let num: u64 = size[..size.len() - suffix.len_utf8()]
        .parse()
        .map_err(|_| invalid())?;

    match suffix.to_ascii_lowercase() {
        'g' => num
            .checked_mul(1024)
            .ok_or_else(|| Error::config(format!("size too large: {size}"))),
        'm' => Ok(num),
        'k' => Ok(num / 1024),
        _ => Err(invalid()),
    }
}

/// Size of an existing disk image or block device in megabytes.
///
/// Regular files report their length; block devices are asked for their
/// capacity. Anything else is [`Error::UnsupportedResource`].
pub fn detect_size(path: &Path) -> Result<u64> {
    let meta = fs::metadata(path)?;
    let file_type = meta.file_type();

    if file_type.is_file() {
        return Ok(meta.len() / MB);
    }
    if file_type.is_block_device() {
        return block_device_bytes(path).map(|bytes| bytes / MB);
    }

    Err(Error::UnsupportedResource(path.to_path_buf()))
}

#[cfg(target_os = "linux")]
fn block_device_bytes(path: &Path) -> Result<u64> {
    use std::os::fd::AsRawFd;

    // _IOR(0x12, 114, size_t)
    const BLKGETSIZE64: u64 = 0x8008_1272;

    let file = fs::File::open(path)?;
    let mut bytes: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes a single u64 through the pointer and the
    // descriptor stays open for the duration of the call.
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64 as _, &mut bytes as *mut u64) };
    if rc != 0 {
        return Err(Error::UnsupportedResource(path.to_path_buf()));
    }
    Ok(bytes)
}

#[cfg(not(target_os = "linux"))]
fn block_device_bytes(path: &Path) -> Result<u64> {
    Err(Error::UnsupportedResource(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use tempfile::TempDir;

    #[test]
    fn test_suffixless_counts_as_megabytes() {
        assert_eq!(parse_size("10").unwrap(), 10);
    }

    #[test]
    fn test_suffixes_are_case_insensitive() {
        for letter in ["K", "M", "G"] {
            assert_eq!(
                parse_size(&format!("1{letter}")).unwrap(),
                parse_size(&format!("1{}", letter.to_lowercase())).unwrap()
            );
        }
    }

    #[test]
    fn test_suffix_scaling() {
        assert_eq!(parse_size("10M").unwrap(), 10);
        assert_eq!(parse_size("1G").unwrap(), 1024);
        assert_eq!(parse_size("1024K").unwrap(), 1);
    }

    #[test]
    fn test_kilobytes_round_down() {
        assert_eq!(parse_size("1025K").unwrap(), 1);
        assert_eq!(parse_size("10250k").unwrap(), 10);
        assert_eq!(parse_size("10230k").unwrap(), 9);
    }

    #[test]
    fn test_invalid_sizes() {
        assert!(matches!(parse_size("lots"), Err(Error::Configuration(_))));
        assert!(parse_size("10T").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn test_gigabytes_overflowing_u64_are_rejected() {
        assert!(matches!(
            parse_size("99999999999999999G"),
            Err(Error::Configuration(_))
        ));
        assert_eq!(parse_size("17592186044415G").unwrap(), 17592186044415 * 1024);
    }

    #[test]
    fn test_detect_size_sparse_file() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("disk.img");
        let file = fs::File::create(&image).unwrap();
        file.set_len(2 * 1024 * MB).unwrap();

        assert_eq!(detect_size(&image).unwrap(), 2048);
    }

    #[test]
    fn test_detect_size_fifo_is_unsupported() {
        let temp = TempDir::new().unwrap();
        let fifo = temp.path().join("pipe");
        let c_path = CString::new(fifo.to_str().unwrap()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);

        assert!(matches!(
            detect_size(&fifo),
            Err(Error::UnsupportedResource(_))
        ));
    }
}
