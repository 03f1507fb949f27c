pub mod control;
pub mod executor;
pub mod layout;
pub mod link;
pub mod mapping;
pub mod memory;
pub mod resource;
pub mod stage;
pub mod task;

pub use executor::{DEFAULT_TIMEOUT_MS, DispatchOptions, DispatchReport, Executor};
pub use mapping::{DevMem, Mapping, PhysMapper};
pub use memory::DmaBuffer;
