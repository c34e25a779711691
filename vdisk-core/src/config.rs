//! Runtime configuration, threaded explicitly through every component.
//!
//! Precedence (lowest first): built-in defaults, TOML config file,
//! `VDISK_*` environment variables, command-line flags.

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use vdisk_hal::MountOptions;

pub const DEFAULT_DYNAMIC_DEVICE_PATTERN: &str = r"^(loop[0-9]+|sd[d-z][a-z]*)$";
pub const DEFAULT_FS_TYPE: &str = "ext4";
pub const DEFAULT_DETACH_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RESIZE_HEADROOM_PERCENT: u64 = 130;

pub const ENV_TRACKING_FILE: &str = "VDISK_TRACKING_FILE";
pub const ENV_DETACH_TIMEOUT: &str = "VDISK_DETACH_TIMEOUT_SECS";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub tracking_file: PathBuf,
    pub detach_timeout: Duration,
    pub default_fs_type: String,
    pub dynamic_device_pattern: Regex,
    /// Minimum resize target as a percentage of the data size.
    pub resize_headroom_percent: u64,
    /// Passed to mount(2) as the data string, e.g. `noatime`.
    pub mount_options: Option<String>,
    pub output: OutputMode,
    pub verbose: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    tracking_file: Option<PathBuf>,
    detach_timeout_secs: Option<u64>,
    default_fs_type: Option<String>,
    dynamic_device_pattern: Option<String>,
    resize_headroom_percent: Option<u64>,
    mount_options: Option<String>,
    output: Option<OutputMode>,
    verbose: Option<bool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tracking_file: default_tracking_file(),
            detach_timeout: Duration::from_secs(DEFAULT_DETACH_TIMEOUT_SECS),
            default_fs_type: DEFAULT_FS_TYPE.to_string(),
            dynamic_device_pattern: Regex::new(DEFAULT_DYNAMIC_DEVICE_PATTERN)
                .expect("default dynamic device pattern is valid"),
            resize_headroom_percent: DEFAULT_RESIZE_HEADROOM_PERCENT,
            mount_options: None,
            output: OutputMode::Text,
            verbose: false,
        }
    }
}

pub fn default_tracking_file() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("vdisk")
        .join("disk-tracking.json")
}

pub fn default_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("vdisk").join("config.toml"))
}

impl Config {
    /// Defaults, then the config file (explicit path must exist; the default
    /// location is optional), then the process environment.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        let file = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_file().filter(|p| p.exists()),
        };
        if let Some(path) = file {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            config
                .apply_toml(&content)
                .with_context(|| format!("Invalid config file: {}", path.display()))?;
        }

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_toml(&mut self, content: &str) -> Result<()> {
        let file: ConfigFile = toml::from_str(content)?;
        if let Some(path) = file.tracking_file {
            self.tracking_file = path;
        }
        if let Some(secs) = file.detach_timeout_secs {
            self.detach_timeout = Duration::from_secs(secs);
        }
        if let Some(fs_type) = file.default_fs_type {
            self.default_fs_type = fs_type;
        }
        if let Some(pattern) = file.dynamic_device_pattern {
            self.dynamic_device_pattern = Regex::new(&pattern)
                .with_context(|| format!("bad dynamic_device_pattern: {}", pattern))?;
        }
        if let Some(percent) = file.resize_headroom_percent {
            if percent < 100 {
                bail!("resize_headroom_percent must be >= 100, got {}", percent);
            }
            self.resize_headroom_percent = percent;
        }
        if let Some(options) = file.mount_options.filter(|o| !o.trim().is_empty()) {
            self.mount_options = Some(options);
        }
        if let Some(output) = file.output {
            self.output = output;
        }
        if let Some(verbose) = file.verbose {
            self.verbose = verbose;
        }
        Ok(())
    }

    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = get(ENV_TRACKING_FILE).filter(|v| !v.is_empty()) {
            self.tracking_file = PathBuf::from(path);
        }
        if let Some(secs) = get(ENV_DETACH_TIMEOUT).filter(|v| !v.is_empty()) {
            let secs: u64 = secs
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number of seconds", ENV_DETACH_TIMEOUT))?;
            self.detach_timeout = Duration::from_secs(secs);
        }
        Ok(())
    }

    pub fn with_tracking_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.tracking_file = path.into();
        self
    }

    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn mount_options(&self) -> MountOptions {
        match &self.mount_options {
            Some(options) => MountOptions::with_options(options.clone()),
            None => MountOptions::new(),
        }
    }

    /// Smallest safe resize target for `data_bytes` of payload (rounded up,
    /// clamped to `u64::MAX`).
    pub fn minimum_resize_bytes(&self, data_bytes: u64) -> u64 {
        let scaled = u128::from(data_bytes) * u128::from(self.resize_headroom_percent);
        u64::try_from(scaled.div_ceil(100)).unwrap_or(u64::MAX)
    }
}
