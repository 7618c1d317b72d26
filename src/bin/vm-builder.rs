//! vm-builder - build virtual machine images.
//!
//! Usage:
//!   vm-builder <hypervisor> <distro> [options]
//!   vm-builder --list
//!
//! Must run as root: it partitions, loop-mounts and maps images.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, info, warn};
use vm_builder::builder::Builder;
use vm_builder::config::{self, Config};
use vm_builder::context::Vm;
use vm_builder::disk::parse_size;
use vm_builder::frontend::DiskLayoutOptions;
use vm_builder::plugin::Hook;
use vm_builder::preflight;
use vm_builder::registry::Registry;
use vm_builder::settings::{Setting, Settings};
use vm_builder::workdir::{tmpfs_size, ScratchDir, TmpfsMount};

#[derive(Debug, Parser)]
#[command(name = "vm-builder", version, about = "Build virtual machine images")]
struct Cli {
    /// Hypervisor to build for (see --list).
    #[arg(required_unless_present = "list")]
    hypervisor: Option<String>,

    /// Distro to install (see --list).
    #[arg(required_unless_present = "list")]
    distro: Option<String>,

    /// Destination directory [default: <distro>-<hypervisor>].
    #[arg(short, long)]
    destdir: Option<PathBuf>,

    /// Additional config file to read.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use TMP as temporary working space for image generation.
    #[arg(short, long, default_value = "/tmp")]
    tmp: PathBuf,

    /// Use a tmpfs as the working directory, specifying its size or "-" for
    /// the 1 GB default.
    #[arg(long, value_name = "SIZE", conflicts_with = "only_chroot")]
    tmpfs: Option<String>,

    /// Remove the destination directory first if it exists.
    #[arg(short, long)]
    overwrite: bool,

    /// Only build the chroot; don't install it on disk images.
    #[arg(long)]
    only_chroot: bool,

    /// Use an existing chroot instead of bootstrapping one.
    #[arg(long, value_name = "CHROOT")]
    existing_chroot: Option<PathBuf>,

    /// Size of the root filesystem.
    #[arg(long, default_value = "4096", value_parser = size_arg)]
    rootsize: u64,

    /// Size of the swap partition.
    #[arg(long, default_value = "1024", value_parser = size_arg)]
    swapsize: u64,

    /// Size of the /opt filesystem. If not given, no /opt filesystem is created.
    #[arg(long, default_value = "0", value_parser = size_arg)]
    optsize: u64,

    /// Install onto this existing disk image or block device (repeatable).
    #[arg(long, value_name = "PATH")]
    raw: Vec<PathBuf>,

    /// Partition layout file: "mountpoint size [device [filename]]" lines,
    /// "---" between disks.
    #[arg(long, value_name = "PATH")]
    part: Option<PathBuf>,

    /// Set a setting (repeatable).
    #[arg(long = "set", value_name = "NAME=VALUE")]
    set: Vec<String>,

    /// Show debug information.
    #[arg(long)]
    debug: bool,

    /// Show progress information.
    #[arg(short, long)]
    verbose: bool,

    /// Only show errors.
    #[arg(short, long)]
    quiet: bool,

    /// List hypervisors, distros, plugins and their settings.
    #[arg(long)]
    list: bool,
}

fn size_arg(value: &str) -> std::result::Result<u64, String> {
    parse_size(value).map_err(|e| e.to_string())
}

fn init_logging(cli: &Cli) {
    let level = if cli.debug {
        "debug"
    } else if cli.quiet {
        "error"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(&cli);

    let registry = Registry::with_builtins();
    if cli.list {
        list(&registry)?;
        return Ok(ExitCode::SUCCESS);
    }
    let (Some(hypervisor), Some(distro)) = (cli.hypervisor.as_deref(), cli.distro.as_deref()) else {
        bail!("usage: vm-builder <hypervisor> <distro> [options]");
    };

    if unsafe { libc::geteuid() } != 0 {
        bail!("This program must be run as root (e.g. via sudo)");
    }
    preflight::check_host_tools().context("Host is missing required tools")?;

    let scratch = ScratchDir::new(&cli.tmp)
        .with_context(|| format!("Failed to create a working directory in {}", cli.tmp.display()))?;
    match build(&cli, &registry, hypervisor, distro, scratch.path()) {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) if is_user_error(&e) => {
            eprintln!("vm-builder: {e:#}");
            Ok(ExitCode::from(2))
        }
        Err(e) => Err(e),
    }
}

/// Bad input gets a one-line message and exit status 2, not a failure trace.
fn is_user_error(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        matches!(cause.downcast_ref::<vm_builder::Error>(), Some(err) if err.is_user_error())
    })
}

fn build(
    cli: &Cli,
    registry: &Registry,
    hypervisor: &str,
    distro: &str,
    workdir: &Path,
) -> Result<()> {
    let mut builder = Builder::new(registry, Vm::new(workdir), hypervisor, distro)?;
    let vm = &mut builder.vm;

    let mut paths = config::default_paths();
    paths.extend(cli.config.iter().cloned());
    Config::load(&paths)
        .context("Failed to read config files")?
        .apply(&mut vm.settings, &[distro, hypervisor])?;
    for assignment in &cli.set {
        let (name, value) = assignment
            .split_once('=')
            .with_context(|| format!("--set expects NAME=VALUE, got {assignment}"))?;
        vm.settings
            .set_fuzzy(name, value)
            .with_context(|| format!("Invalid --set {assignment}"))?;
    }

    let destdir = cli
        .destdir
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("{distro}-{hypervisor}")));
    if destdir.exists() {
        if !cli.overwrite {
            bail!(
                "Destination directory {} already exists (use --overwrite to replace it)",
                destdir.display()
            );
        }
        info!("Removing existing destination directory {}", destdir.display());
        fs::remove_dir_all(&destdir)
            .with_context(|| format!("Failed to remove {}", destdir.display()))?;
    }
    vm.destdir = destdir;

    register_fix_ownership(vm);

    let storage = builder.hypervisor().preferred_storage();
    let default_fs = builder.distro().preferred_filesystem();
    DiskLayoutOptions {
        rootsize: cli.rootsize,
        swapsize: cli.swapsize,
        optsize: cli.optsize,
        raw: cli.raw.clone(),
        part: cli.part.clone(),
    }
    .apply(&mut builder.vm, storage, default_fs)
    .context("Invalid disk layout")?;

    let bootstrapped_chroot = match &cli.existing_chroot {
        Some(existing) => {
            builder.vm.chroot_dir = existing.clone();
            None
        }
        None => {
            fs::create_dir_all(&builder.vm.chroot_dir)?;
            Some(builder.vm.chroot_dir.clone())
        }
    };
    let tmpfs = match (&cli.tmpfs, &bootstrapped_chroot) {
        (Some(size), Some(chroot)) => Some(TmpfsMount::mount(
            chroot,
            tmpfs_size(size)?,
            builder.vm.runner(),
        )?),
        _ => None,
    };

    if bootstrapped_chroot.is_some() {
        builder.build_chroot().context("Building the chroot failed")?;
    }
    if cli.only_chroot {
        println!("Chroot ready at {}", builder.vm.chroot_dir.display());
        return Ok(());
    }

    builder.install_os().context("Installing the guest failed")?;
    builder.finalise().context("Finalising the images failed")?;

    drop(tmpfs);
    if let Some(chroot) = bootstrapped_chroot {
        debug!("Removing {}", chroot.display());
        if let Err(e) = fs::remove_dir_all(&chroot) {
            warn!("Could not remove {}: {}", chroot.display(), e);
        }
    }

    for file in &builder.vm.result_files {
        println!("{}", file.display());
    }
    Ok(())
}

/// Hand result files back to the user who invoked sudo.
fn register_fix_ownership(vm: &mut Vm) {
    let (Ok(uid), Ok(gid)) = (std::env::var("SUDO_UID"), std::env::var("SUDO_GID")) else {
        return;
    };
    let (Ok(uid), Ok(gid)) = (uid.parse::<u32>(), gid.parse::<u32>()) else {
        warn!("Ignoring malformed SUDO_UID/SUDO_GID");
        return;
    };
    vm.register_hook(Hook::FixOwnership, move |_, path| {
        if let Some(path) = path {
            debug!("chown {}:{} {}", uid, gid, path.display());
            std::os::unix::fs::chown(path, Some(uid), Some(gid))?;
        }
        Ok(())
    });
}

fn list(registry: &Registry) -> Result<()> {
    println!("Hypervisors: {}", registry.hypervisor_names().join(" "));
    println!("Distros:     {}", registry.distro_names().join(" "));
    println!("Plugins:     {}", registry.plugin_names().join(" "));

    for name in registry.hypervisor_names() {
        let mut settings = Settings::new();
        registry.hypervisor(name, &mut settings)?;
        print_settings(&format!("Hypervisor {name}"), &settings);
    }
    for name in registry.distro_names() {
        let mut settings = Settings::new();
        registry.distro(name, &mut settings)?;
        print_settings(&format!("Distro {name}"), &settings);
    }
    let mut settings = Settings::new();
    registry.hypervisor_plugins(&mut settings)?;
    registry.distro_plugins(&mut settings)?;
    print_settings("Plugins", &settings);
    Ok(())
}

fn print_settings(title: &str, settings: &Settings) {
    let mut groups: BTreeMap<&str, Vec<&Setting>> = BTreeMap::new();
    for setting in settings.iter() {
        groups.entry(setting.group_name()).or_default().push(setting);
    }
    println!("\n{title}");
    for (group, members) in groups {
        println!("  {group}:");
        for setting in members {
            let default = setting
                .current()
                .map(|v| format!(" [default: {v}]"))
                .unwrap_or_default();
            println!(
                "    --set {}=<{}>  {}{}",
                setting.name(),
                setting.kind(),
                setting.help(),
                default
            );
        }
    }
}
