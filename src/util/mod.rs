//! Small numeric helpers shared by the allocators.

pub mod layout;
pub mod size;
