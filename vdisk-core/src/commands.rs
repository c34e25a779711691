//! Subcommand dispatch: call the manager, render the result.

use crate::cli::Command;
use crate::config::{Config, OutputMode};
use crate::errors::{DiskError, Result};
use crate::lifecycle::{DiskManager, LifecycleState};
use crate::output;
use std::io::Write;

/// Effective configuration: file and environment from `Config::load`, then
/// command-line flags on top. `--verbose` can only raise verbosity.
pub fn effective_config(cli: &crate::cli::Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(path) = &cli.tracking_file {
        config = config.with_tracking_file(path.clone());
    }
    if cli.json {
        config = config.with_output(OutputMode::Json);
    }
    let verbose = config.verbose || cli.verbose;
    Ok(config.with_verbose(verbose))
}

pub fn run(manager: &DiskManager, command: &Command, out: &mut dyn Write) -> Result<()> {
    let mode = manager.config().output;
    match command {
        Command::Attach { target } => {
            let selector = target.selector().ok_or_else(|| missing_selector("attach"))?;
            let outcome = manager.attach(&selector)?;
            output::write_outcome(out, mode, "attach", &outcome)
        }
        Command::Detach { target } => {
            let outcome = manager.detach(target.selector().as_ref())?;
            output::write_outcome(out, mode, "detach", &outcome)
        }
        Command::Mount {
            target,
            mount_point,
        } => {
            let outcome = manager.mount(target.selector().as_ref(), mount_point)?;
            output::write_outcome(out, mode, "mount", &outcome)
        }
        Command::Umount { target } => {
            let outcome = manager.unmount(target.selector().as_ref())?;
            output::write_outcome(out, mode, "umount", &outcome)
        }
        Command::Format {
            target,
            fs_type,
            yes,
        } => {
            let outcome = manager.format(target.selector().as_ref(), fs_type.as_deref(), *yes)?;
            output::write_outcome(out, mode, "format", &outcome)
        }
        Command::Create {
            path,
            size,
            fs_type,
            mount_point,
        } => {
            let status = manager.create(path, *size, fs_type.as_deref(), mount_point.as_deref())?;
            output::write_changed(out, mode, "create", &status)
        }
        Command::Delete { target, yes } => {
            let selector = target.selector().ok_or_else(|| missing_selector("delete"))?;
            let status = manager.delete(&selector, *yes)?;
            output::write_changed(out, mode, "delete", &status)
        }
        Command::Resize { mount_point, size } => {
            let report = manager.resize(mount_point, *size)?;
            output::write_resize(out, mode, &report)
        }
        Command::Status { target, all } => {
            if *all {
                let statuses = manager.status_all()?;
                output::write_statuses(out, mode, &statuses)
            } else {
                let status = manager.status(target.selector().as_ref())?;
                output::write_statuses(out, mode, std::slice::from_ref(&status))
            }
        }
    }
}

fn missing_selector(operation: &'static str) -> anyhow::Error {
    DiskError::invalid(
        operation,
        "no disk",
        LifecycleState::Absent,
        "pass --path, --identifier, --device-name or --mount-point",
    )
    .into()
}
