//! Command buffer orchestration.
//!
//! - [`CommandExecutionUnit`]: per-frame command buffer pools and batched submission
//! - [`MemoryObjectUploader`]: staged host to device copies with queue ownership transfer

pub mod execution_unit;
pub mod uploader;

pub use execution_unit::CommandExecutionUnit;
pub use uploader::MemoryObjectUploader;
