//! Acceleration-structure build pipeline for a Vulkan ray-tracing renderer:
//! batched bottom-level builds with optional compaction, top-level build and
//! refit over packed instance arrays, and a registry owning the lifetime of
//! everything built for a scene.
//!
//! The builders are generic over [`context::DeviceContext`]; the
//! [`vulkan::VulkanContext`] backend drives a real device through
//! `VK_KHR_acceleration_structure`.

pub mod acceleration_structure;
pub mod context;
pub mod prelude;
pub mod vulkan;

#[cfg(test)]
pub(crate) mod fake;
