//! vdisk Hardware Abstraction Layer (HAL).
//!
//! Everything that touches the outside world (loop devices, block-device
//! probing, mkfs, mount(2), bulk copies) goes through the traits in [`hal`],
//! so lifecycle workflows can run against [`FakeHal`] in tests.

pub mod error;
pub mod hal;
pub mod lsblk;
pub mod procfs;
pub mod process;

pub use error::{HalError, HalResult};
pub use hal::*;
