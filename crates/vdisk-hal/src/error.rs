pub use vdisk_error::{HalError, HalResult};
