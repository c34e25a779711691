//! vdisk core: tracking store, lifecycle operations and resize orchestration
//! for virtual disk images.

pub mod cleanup;
pub mod cli;
pub mod commands;
pub mod config;
pub mod errors;
pub mod lifecycle;
pub mod logging;
pub mod output;
pub mod resize;
pub mod snapshot;
pub mod tracking;

pub use cleanup::CleanupRegistry;
pub use config::{Config, OutputMode};
pub use errors::{DiskError, ErrorKind, Result};
pub use lifecycle::{DiskManager, DiskSelector, DiskStatus, LifecycleState, Outcome};
pub use resize::ResizeReport;
pub use snapshot::{Discovery, SnapshotService};
pub use tracking::TrackingStore;
