use crate::lifecycle::LifecycleState;
use thiserror::Error;
use vdisk_hal::HalError;

pub type Result<T> = anyhow::Result<T>;

/// Caller-visible failure taxonomy. Everything else travels as plain
/// `anyhow` context and exits with the generic code.
#[derive(Error, Debug)]
pub enum DiskError {
    #[error("{operation}: no disk found for {subject}")]
    NotFound {
        operation: &'static str,
        subject: String,
    },

    #[error("{operation}: {subject} matches {} candidates: {}", .candidates.len(), .candidates.join(", "))]
    AmbiguousIdentity {
        operation: &'static str,
        subject: String,
        candidates: Vec<String>,
    },

    #[error("{operation}: {subject} is {state}; {reason}")]
    InvalidTransition {
        operation: &'static str,
        subject: String,
        state: LifecycleState,
        reason: String,
    },

    #[error("{operation}: {subject} has no filesystem")]
    NotFormatted {
        operation: &'static str,
        subject: String,
    },

    #[error("{operation}: {subject} would be destroyed and needs explicit confirmation")]
    ConfirmationRequired {
        operation: &'static str,
        subject: String,
    },

    #[error("{operation}: integrity check failed for {subject}: expected {expected} files, found {actual}")]
    IntegrityFailure {
        operation: &'static str,
        subject: String,
        expected: u64,
        actual: u64,
    },

    #[error("{operation}: {subject}: {source}")]
    ExternalToolFailure {
        operation: &'static str,
        subject: String,
        #[source]
        source: HalError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AmbiguousIdentity,
    InvalidTransition,
    IntegrityFailure,
    ExternalToolFailure,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not-found",
            ErrorKind::AmbiguousIdentity => "ambiguous-identity",
            ErrorKind::InvalidTransition => "invalid-transition",
            ErrorKind::IntegrityFailure => "integrity-failure",
            ErrorKind::ExternalToolFailure => "external-tool-failure",
        }
    }
}

pub const EXIT_GENERIC: u8 = 1;

impl DiskError {
    pub fn external(operation: &'static str, subject: impl ToString, source: HalError) -> Self {
        DiskError::ExternalToolFailure {
            operation,
            subject: subject.to_string(),
            source,
        }
    }

    pub fn not_found(operation: &'static str, subject: impl ToString) -> Self {
        DiskError::NotFound {
            operation,
            subject: subject.to_string(),
        }
    }

    pub fn invalid(
        operation: &'static str,
        subject: impl ToString,
        state: LifecycleState,
        reason: impl Into<String>,
    ) -> Self {
        DiskError::InvalidTransition {
            operation,
            subject: subject.to_string(),
            state,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DiskError::NotFound { .. } => ErrorKind::NotFound,
            DiskError::AmbiguousIdentity { .. } => ErrorKind::AmbiguousIdentity,
            DiskError::InvalidTransition { .. }
            | DiskError::NotFormatted { .. }
            | DiskError::ConfirmationRequired { .. } => ErrorKind::InvalidTransition,
            DiskError::IntegrityFailure { .. } => ErrorKind::IntegrityFailure,
            DiskError::ExternalToolFailure { .. } => ErrorKind::ExternalToolFailure,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            ErrorKind::NotFound => 2,
            ErrorKind::AmbiguousIdentity => 3,
            ErrorKind::InvalidTransition => 4,
            ErrorKind::IntegrityFailure => 5,
            ErrorKind::ExternalToolFailure => 6,
        }
    }

    /// One-line remediation shown in interactive mode.
    pub fn hint(&self) -> Option<String> {
        match self {
            DiskError::NotFound { .. } => {
                Some("check the path, or run `vdisk status --all` to list known disks".into())
            }
            DiskError::AmbiguousIdentity { .. } => {
                Some("pass --path, --identifier or --device-name to pick one disk".into())
            }
            DiskError::InvalidTransition { state, .. } => match state {
                LifecycleState::Mounted => Some("unmount it first with `vdisk umount`".into()),
                LifecycleState::Detached => Some("attach it first with `vdisk attach`".into()),
                LifecycleState::AttachedFormatted | LifecycleState::AttachedUnformatted => {
                    Some("detach it first with `vdisk detach`".into())
                }
                LifecycleState::Absent => None,
            },
            DiskError::NotFormatted { .. } => {
                Some("create a filesystem with `vdisk format --yes`".into())
            }
            DiskError::ConfirmationRequired { .. } => Some("re-run with --yes".into()),
            DiskError::IntegrityFailure { .. } => {
                Some("the original image is untouched and still mounted".into())
            }
            DiskError::ExternalToolFailure { source, .. } => match source {
                HalError::PermissionDenied => Some("run as root".into()),
                HalError::CommandNotFound(program) => {
                    Some(format!("install the package that provides `{}`", program))
                }
                HalError::DeviceBusy => Some("close processes using the disk and retry".into()),
                _ if source.is_timeout() => {
                    Some("raise detach_timeout_secs or VDISK_DETACH_TIMEOUT_SECS".into())
                }
                _ => None,
            },
        }
    }
}

/// Find the first `DiskError` anywhere in the context chain.
pub fn find_disk_error(err: &anyhow::Error) -> Option<&DiskError> {
    err.chain().find_map(|cause| cause.downcast_ref::<DiskError>())
}

pub fn exit_code(err: &anyhow::Error) -> u8 {
    find_disk_error(err)
        .map(DiskError::exit_code)
        .unwrap_or(EXIT_GENERIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn exit_codes_follow_kind() {
        assert_eq!(DiskError::not_found("attach", "path /x").exit_code(), 2);
        let ambiguous = DiskError::AmbiguousIdentity {
            operation: "attach",
            subject: "path /x".into(),
            candidates: vec!["sdd".into(), "sde".into()],
        };
        assert_eq!(ambiguous.exit_code(), 3);
        assert_eq!(
            ambiguous.to_string(),
            "attach: path /x matches 2 candidates: sdd, sde"
        );
        let confirm = DiskError::ConfirmationRequired {
            operation: "format",
            subject: "device sdd".into(),
        };
        assert_eq!(confirm.exit_code(), 4);
        assert_eq!(confirm.kind(), ErrorKind::InvalidTransition);
    }

    #[test]
    fn exit_code_survives_context() {
        let err: anyhow::Error = Err::<(), _>(DiskError::IntegrityFailure {
            operation: "resize",
            subject: "/mnt/data".into(),
            expected: 10,
            actual: 9,
        })
        .context("resize aborted")
        .unwrap_err();
        assert_eq!(exit_code(&err), 5);

        let plain = anyhow::anyhow!("something else");
        assert_eq!(exit_code(&plain), EXIT_GENERIC);
    }

    #[test]
    fn hints_point_at_remediation() {
        let err = DiskError::invalid("delete", "path /x", LifecycleState::Mounted, "detach first");
        assert!(err.hint().unwrap().contains("umount"));
        let err = DiskError::external(
            "detach",
            "path /x",
            HalError::CommandTimeout {
                program: "losetup".into(),
                timeout_secs: 30,
            },
        );
        assert_eq!(err.exit_code(), 6);
        assert!(err.hint().unwrap().contains("detach_timeout_secs"));
    }
}
