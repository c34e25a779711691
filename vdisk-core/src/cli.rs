//! CLI argument parsing for vdisk

use crate::lifecycle::DiskSelector;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "vdisk", version)]
#[command(about = "💽 vdisk - virtual disk image lifecycle manager")]
#[command(long_about = "💽 vdisk - virtual disk image lifecycle manager\n\n\
    Attach, format, mount, detach and grow disk image files, keeping track of\n\
    which image backs which device across runs.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Print one JSON object per line instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Debug logging on stderr (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file (default: $XDG_CONFIG_HOME/vdisk/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Tracking document location
    #[arg(long, global = true)]
    pub tracking_file: Option<PathBuf>,
}

/// Ways to name a disk without a mount point.
#[derive(Args, Debug, Clone, Default)]
pub struct IdentityArgs {
    /// Path of the image file
    #[arg(long)]
    pub path: Option<PathBuf>,

    /// Filesystem identifier (UUID)
    #[arg(long)]
    pub identifier: Option<String>,

    /// Block device name (e.g. sdd or /dev/loop3)
    #[arg(long)]
    pub device_name: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct SelectorArgs {
    #[command(flatten)]
    pub identity: IdentityArgs,

    /// Where the disk is mounted
    #[arg(long)]
    pub mount_point: Option<PathBuf>,
}

impl IdentityArgs {
    /// First given of path, identifier, device name.
    pub fn selector(&self) -> Option<DiskSelector> {
        if let Some(path) = &self.path {
            Some(DiskSelector::ByPath(path.clone()))
        } else if let Some(id) = &self.identifier {
            Some(DiskSelector::ByIdentifier(id.clone()))
        } else {
            self.device_name.as_deref().map(DiskSelector::device)
        }
    }
}

impl SelectorArgs {
    pub fn selector(&self) -> Option<DiskSelector> {
        self.identity.selector().or_else(|| {
            self.mount_point
                .as_ref()
                .map(|mp| DiskSelector::ByMountPoint(mp.clone()))
        })
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// 🔗 Attach an image file as a block device
    Attach {
        #[command(flatten)]
        target: SelectorArgs,
    },

    /// 🔌 Detach a disk (unmounts it first if needed)
    Detach {
        #[command(flatten)]
        target: SelectorArgs,
    },

    /// 📂 Mount a formatted disk (attaches a known image first if needed)
    Mount {
        #[command(flatten)]
        target: IdentityArgs,

        /// Directory to mount at
        #[arg(long)]
        mount_point: PathBuf,
    },

    /// 📤 Unmount a disk from every mount point
    #[command(alias = "unmount")]
    Umount {
        #[command(flatten)]
        target: SelectorArgs,
    },

    /// 🧱 Create a new filesystem (destroys existing data)
    Format {
        #[command(flatten)]
        target: SelectorArgs,

        /// Filesystem type (default from config, usually ext4)
        #[arg(long)]
        fs_type: Option<String>,

        /// Confirm that existing data may be destroyed
        #[arg(long)]
        yes: bool,
    },

    /// 🆕 Create, attach and format a new image
    Create {
        /// Path of the new image file
        #[arg(long)]
        path: PathBuf,

        /// Size, e.g. 512M, 2G, 1073741824
        #[arg(long, value_parser = parse_size)]
        size: u64,

        /// Filesystem type (default from config, usually ext4)
        #[arg(long)]
        fs_type: Option<String>,

        /// Mount the new disk here
        #[arg(long)]
        mount_point: Option<PathBuf>,
    },

    /// 🗑️ Delete a detached image file and forget it
    Delete {
        #[command(flatten)]
        target: SelectorArgs,

        /// Confirm deletion of the image file
        #[arg(long)]
        yes: bool,
    },

    /// 📏 Grow a mounted disk by migrating it to a larger image
    Resize {
        /// Mount point of the disk to grow
        #[arg(long)]
        mount_point: PathBuf,

        /// New size, e.g. 200M or 4G (raised to a safe minimum if too small)
        #[arg(long, value_parser = parse_size)]
        size: u64,
    },

    /// 🔍 Show the state of one disk, or every known disk with --all
    Status {
        #[command(flatten)]
        target: SelectorArgs,

        /// List every tracked disk and untracked dynamic disk
        #[arg(long)]
        all: bool,
    },
}

/// Parse a byte size. Suffixes are binary: K, M, G, T, with optional
/// `B` / `iB` (`100M` == `100MB` == `100MiB` == 104857600).
pub fn parse_size(input: &str) -> Result<u64, String> {
    let s = input.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    if digits.is_empty() {
        return Err(format!("invalid size '{}': expected a number", input));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size '{}': number too large", input))?;

    let unit = suffix.trim().to_ascii_uppercase();
    let shift = match unit.trim_end_matches("IB").trim_end_matches('B') {
        "" => 0,
        "K" => 10,
        "M" => 20,
        "G" => 30,
        "T" => 40,
        _ => return Err(format!("invalid size '{}': unknown unit '{}'", input, suffix.trim())),
    };
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| format!("invalid size '{}': too large", input))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sizes() {
        assert_eq!(parse_size("512"), Ok(512));
        assert_eq!(parse_size("100M"), Ok(100 << 20));
        assert_eq!(parse_size("100MB"), Ok(100 << 20));
        assert_eq!(parse_size("100MiB"), Ok(100 << 20));
        assert_eq!(parse_size("2g"), Ok(2 << 30));
        assert_eq!(parse_size("1T"), Ok(1 << 40));
        assert_eq!(parse_size("64 K"), Ok(64 << 10));
        assert_eq!(parse_size("10B"), Ok(10));
        assert!(parse_size("").is_err());
        assert!(parse_size("G").is_err());
        assert!(parse_size("12X").is_err());
        assert!(parse_size("99999999999999T").is_err());
    }

    #[test]
    fn selector_priority() {
        let cli = Cli::try_parse_from([
            "vdisk",
            "status",
            "--identifier",
            "u1",
            "--mount-point",
            "/mnt/a",
        ])
        .unwrap();
        match cli.command {
            Command::Status { target, all } => {
                assert!(!all);
                assert_eq!(target.selector(), Some(DiskSelector::ByIdentifier("u1".into())));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn device_names_drop_dev_prefix() {
        let cli =
            Cli::try_parse_from(["vdisk", "--json", "detach", "--device-name", "/dev/sdd"]).unwrap();
        assert!(cli.json);
        match cli.command {
            Command::Detach { target } => {
                assert_eq!(target.selector(), Some(DiskSelector::ByDeviceName("sdd".into())));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "vdisk",
            "create",
            "--path",
            "/srv/a.img",
            "--size",
            "100M",
            "--tracking-file",
            "/tmp/t.json",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.tracking_file, Some(PathBuf::from("/tmp/t.json")));
        match cli.command {
            Command::Create { size, .. } => assert_eq!(size, 100 << 20),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn umount_has_unmount_alias() {
        let cli = Cli::try_parse_from(["vdisk", "unmount", "--mount-point", "/mnt/a"]).unwrap();
        assert!(matches!(cli.command, Command::Umount { .. }));
    }
}
