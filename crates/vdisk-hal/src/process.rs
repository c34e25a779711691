//! External command runner with explicit timeouts.
//!
//! Platform tools must not be allowed to hang the whole command; every call
//! carries a deadline and a timed-out child is killed, not retried.

use crate::{HalError, HalResult};
use std::io::Read;
use std::process::{Command, Output, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

pub(crate) fn map_command_err(program: &str, err: std::io::Error) -> HalError {
    if err.kind() == std::io::ErrorKind::NotFound {
        return HalError::CommandNotFound(program.to_string());
    }
    HalError::Io(err)
}

pub(crate) fn output_failed(program: &str, output: &Output) -> HalError {
    HalError::CommandFailed {
        program: program.to_string(),
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

/// Run `cmd` to completion, capturing stdout/stderr, killing it after `timeout`.
pub fn output_with_timeout(program: &str, cmd: &mut Command, timeout: Duration) -> HalResult<Output> {
    log::debug!("exec {:?} (timeout {}s)", cmd, timeout.as_secs());
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|e| map_command_err(program, e))?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    // Drain pipes concurrently to avoid deadlocks on large output.
    let stdout_handle = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut out) = stdout.take() {
            let _ = out.read_to_end(&mut buf);
        }
        buf
    });
    let stderr_handle = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut err) = stderr.take() {
            let _ = err.read_to_end(&mut buf);
        }
        buf
    });

    let status = match child.wait_timeout(timeout).map_err(HalError::Io)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            let _ = stdout_handle.join();
            let _ = stderr_handle.join();
            return Err(HalError::CommandTimeout {
                program: program.to_string(),
                timeout_secs: timeout.as_secs(),
            });
        }
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();
    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

/// Like [`output_with_timeout`] but fails on a non-zero exit and returns trimmed stdout.
pub fn stdout_with_timeout(program: &str, cmd: &mut Command, timeout: Duration) -> HalResult<String> {
    let output = output_with_timeout(program, cmd, timeout)?;
    if !output.status.success() {
        return Err(output_failed(program, &output));
    }
    Ok(String::from_utf8(output.stdout)?.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo hello"]);
        let out = stdout_with_timeout("sh", &mut cmd, Duration::from_secs(5)).unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn non_zero_exit_is_command_failed() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo boom >&2; exit 3"]);
        let err = stdout_with_timeout("sh", &mut cmd, Duration::from_secs(5)).unwrap_err();
        match err {
            HalError::CommandFailed { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn slow_command_times_out() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let err = output_with_timeout("sleep", &mut cmd, Duration::from_millis(100)).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn missing_program_is_reported() {
        let mut cmd = Command::new("vdisk-definitely-not-installed");
        let err = output_with_timeout("vdisk-definitely-not-installed", &mut cmd, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, HalError::CommandNotFound(_)));
    }
}
