//! Built-in plugins.
//!
//! Hypervisor plugins take part in the hypervisor scope, distro plugins in
//! the distro scope; see [`crate::builder`].

pub mod network;
pub mod postinst;

pub use network::NetworkPlugin;
pub use postinst::PostInstall;
