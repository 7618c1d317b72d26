//! Preflight checks for build validation.
//!
//! Validates that the host system has the tools a VM build shells out to
//! before any image is allocated. This prevents half-built images and
//! dangling loop devices when a tool is missing halfway through.
//!
//! # Example
//!
//! ```rust
//! use vm_builder::preflight::{command_exists, check_required_tools};
//!
//! // Check a single command
//! if !command_exists("kpartx") {
//!     println!("kpartx not installed");
//! }
//!
//! // Check multiple tools
//! let tools = &[("parted", "parted"), ("kpartx", "kpartx")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use crate::error::{Error, Result};

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools every disk-image build needs.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("parted", "parted"),
    ("kpartx", "kpartx"),
    ("mkfs.ext4", "e2fsprogs"),
    ("mkswap", "util-linux"),
    ("blkid", "util-linux"),
    ("mount", "util-linux"),
    ("udevadm", "udev"),
];

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` listing the missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, package)| format!("{} (install: {})", tool, package))
        .collect();

    if !missing.is_empty() {
        return Err(Error::ToolNotFound(missing.join(", ")));
    }

    Ok(())
}

/// Check that all tools in [`REQUIRED_TOOLS`] plus an image tool are present.
pub fn check_host_tools() -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)?;
    if !command_exists("qemu-img") && !command_exists("kvm-img") {
        return Err(Error::ToolNotFound("qemu-img (install: qemu-utils)".into()));
    }
    Ok(())
}

/// The image tool to call: `kvm-img` where installed, else `qemu-img`.
pub fn qemu_img() -> String {
    ["kvm-img", "qemu-img"]
        .into_iter()
        .find_map(|name| which::which(name).ok())
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|| "qemu-img".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exists() {
        // 'ls' should exist on any Unix system
        assert!(command_exists("ls"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_success() {
        let tools = &[("ls", "coreutils"), ("cat", "coreutils")];
        assert!(check_required_tools(tools).is_ok());
    }

    #[test]
    fn test_check_required_tools_lists_missing() {
        let tools = &[("ls", "coreutils"), ("nonexistent_command_xyz", "fake-package")];
        match check_required_tools(tools) {
            Err(Error::ToolNotFound(msg)) => {
                assert_eq!(msg, "nonexistent_command_xyz (install: fake-package)")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_qemu_img_name() {
        assert!(qemu_img().ends_with("-img"));
    }
}
