//! Virtual machine image builder.
//!
//! Builds a guest from a distro into disk or filesystem images for a
//! hypervisor. Two pieces do the heavy lifting:
//!
//! - **Storage layout** - disks, partitions and filesystem images are
//!   described and validated up front ([`disk`]), then created, mapped to
//!   host devices, formatted and mounted.
//! - **Lifecycle** - a build is a fixed sequence of phases ([`plugin::Hook`])
//!   dispatched to plugins, runtime callbacks and the owning distro or
//!   hypervisor ([`hooks`]). Every acquisition registers its release on a
//!   LIFO stack ([`cleanup`]) that is drained whenever a phase fails.
//!
//! # Architecture
//!
//! ```text
//! Builder ──────────────┐
//!     │                 │
//!     ├── distro scope:      distro plugins → callbacks → Distro
//!     └── hypervisor scope:  hypervisor plugins + Distro → callbacks → Hypervisor
//!                       │
//! Vm (shared context) ──┘
//!     ├── Layout (disks, partitions, filesystems)
//!     ├── Settings (typed, registered by components)
//!     └── CleanupStack
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use vm_builder::{builder::Builder, context::Vm, registry::Registry};
//!
//! let vm = Vm::new("/tmp/vmbuilder-work");
//! let mut builder = Builder::new(&Registry::with_builtins(), vm, "kvm", "rootfs")?;
//! builder.vm.settings.set("rootfs", "/srv/images/guest.tar.zst")?;
//! builder.run()?;
//! ```

pub mod builder;
pub mod cleanup;
pub mod config;
pub mod context;
pub mod devname;
pub mod disk;
pub mod distro;
pub mod error;
pub mod frontend;
pub mod hooks;
pub mod hypervisor;
pub mod plugin;
pub mod plugins;
pub mod preflight;
pub mod process;
pub mod registry;
pub mod settings;
pub mod workdir;

pub use error::{Error, Result};
