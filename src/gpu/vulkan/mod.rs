//! Vulkan backend via ash
//!
//! [`VulkanDevice`] owns one logical device created over a physical device
//! group, its queues and the surface, display and swapchain loaders.

mod device;
mod pipeline;

pub use device::{ShaderCode, VulkanDevice};
