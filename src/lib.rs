//! Host-side driver for the VideoCore IV QPUs.
//!
//! Programs, uniforms and input buffers are staged into one region of GPU memory obtained
//! from the firmware mailbox, placeholder addresses in the programs are patched to point at
//! their buffers, and the firmware is asked to run the tasks.

pub mod error;
pub mod gpu;
pub mod mbox;
pub mod utils;

pub use error::{QpuError, QpuResult};
pub use gpu::{DispatchOptions, DispatchReport, Executor};
pub use mbox::{Mailbox, VcioDevice};
