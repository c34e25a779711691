//! Result rendering: one human-readable line per disk, or one JSON object
//! per line with `--json`.

use crate::config::OutputMode;
use crate::errors::{exit_code, find_disk_error};
use crate::lifecycle::{DiskStatus, LifecycleState, Outcome};
use crate::resize::ResizeReport;
use anyhow::Result;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusLine<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    operation: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'static str>,
    path: Option<&'a Path>,
    identifier: Option<&'a str>,
    device: Option<&'a str>,
    mount_points: &'a [PathBuf],
    state: LifecycleState,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorLine<'a> {
    error: &'a str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    exit_code: u8,
}

fn status_line<'a>(
    status: &'a DiskStatus,
    operation: Option<&'a str>,
    result: Option<&'static str>,
) -> StatusLine<'a> {
    StatusLine {
        operation,
        result,
        path: status.path.as_deref(),
        identifier: status.identifier.as_deref(),
        device: status.device.as_deref(),
        mount_points: &status.mount_points,
        state: status.state,
    }
}

/// `path  state  device=..  id=..  mounts=..`
pub fn format_status(status: &DiskStatus) -> String {
    let path = status
        .path
        .as_deref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(unknown image)".to_string());
    let mounts = if status.mount_points.is_empty() {
        "-".to_string()
    } else {
        status
            .mount_points
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(",")
    };
    format!(
        "{}  {}  device={}  id={}  mounts={}",
        path,
        status.state,
        status.device.as_deref().unwrap_or("-"),
        status.identifier.as_deref().unwrap_or("-"),
        mounts
    )
}

pub fn write_statuses(out: &mut dyn Write, mode: OutputMode, statuses: &[DiskStatus]) -> Result<()> {
    match mode {
        OutputMode::Json => {
            for status in statuses {
                writeln!(out, "{}", serde_json::to_string(&status_line(status, None, None))?)?;
            }
        }
        OutputMode::Text => {
            if statuses.is_empty() {
                writeln!(out, "no disks")?;
            }
            for status in statuses {
                writeln!(out, "{}", format_status(status))?;
            }
        }
    }
    Ok(())
}

pub fn write_outcome(
    out: &mut dyn Write,
    mode: OutputMode,
    operation: &str,
    outcome: &Outcome,
) -> Result<()> {
    let result = if outcome.changed() {
        "changed"
    } else {
        "already-in-state"
    };
    match mode {
        OutputMode::Json => {
            let line = status_line(outcome.status(), Some(operation), Some(result));
            writeln!(out, "{}", serde_json::to_string(&line)?)?;
        }
        OutputMode::Text => {
            let prefix = if outcome.changed() {
                format!("{}: ok", operation)
            } else {
                format!("{}: nothing to do, already {}", operation, outcome.status().state)
            };
            writeln!(out, "{}\n  {}", prefix, format_status(outcome.status()))?;
        }
    }
    Ok(())
}

pub fn write_changed(
    out: &mut dyn Write,
    mode: OutputMode,
    operation: &str,
    status: &DiskStatus,
) -> Result<()> {
    write_outcome(out, mode, operation, &Outcome::Changed(status.clone()))
}

pub fn write_resize(out: &mut dyn Write, mode: OutputMode, report: &ResizeReport) -> Result<()> {
    match mode {
        OutputMode::Json => writeln!(out, "{}", serde_json::to_string(report)?)?,
        OutputMode::Text => {
            writeln!(out, "resize: ok")?;
            writeln!(out, "  image:       {}", report.image.display())?;
            writeln!(out, "  mounted at:  {}", report.mount_point.display())?;
            writeln!(out, "  backup:      {}", report.backup_path.display())?;
            writeln!(
                out,
                "  identifier:  {} -> {}",
                report.old_identifier.as_deref().unwrap_or("-"),
                report.new_identifier.as_deref().unwrap_or("-")
            )?;
            writeln!(
                out,
                "  size:        {} bytes (requested {}, data {})",
                report.target_bytes, report.requested_bytes, report.data_bytes
            )?;
            if report.size_substituted {
                writeln!(out, "  note:        requested size was below the safe minimum and was raised")?;
            }
            writeln!(out, "  files:       {}", report.file_count)?;
        }
    }
    Ok(())
}

/// Error report. Hints are shown in text mode only when a person is
/// watching; JSON always carries them.
pub fn write_error(
    out: &mut dyn Write,
    mode: OutputMode,
    err: &anyhow::Error,
    interactive: bool,
) -> Result<()> {
    let disk_error = find_disk_error(err);
    let hint = disk_error.and_then(|e| e.hint());
    match mode {
        OutputMode::Json => {
            let line = ErrorLine {
                error: disk_error.map(|e| e.kind().as_str()).unwrap_or("error"),
                message: format!("{:#}", err),
                hint,
                exit_code: exit_code(err),
            };
            writeln!(out, "{}", serde_json::to_string(&line)?)?;
        }
        OutputMode::Text => {
            writeln!(out, "error: {:#}", err)?;
            if interactive {
                if let Some(hint) = hint {
                    writeln!(out, "hint: {}", hint)?;
                }
            }
        }
    }
    Ok(())
}
