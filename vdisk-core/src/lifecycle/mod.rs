//! Disk lifecycle: state model, identity resolution and the operations that
//! move a disk between states.

pub mod ops;
pub mod resolver;
pub mod selector;
pub mod state;

pub use ops::{DiskManager, Outcome};
pub use resolver::Resolver;
pub use selector::DiskSelector;
pub use state::{DiskStatus, Guard, LifecycleState, Rejection, Transition};
