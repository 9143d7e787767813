// Backend module - Vulkan frame-execution core
//
// Design: Thin wrapper around ash with safety and ergonomics
// Performance: Zero-cost abstractions, explicit control

pub mod buffer;
pub mod command;
pub mod device;
pub mod image;
pub mod reclaim;
pub mod renderer;
pub mod surface;
pub mod swapchain;
pub mod tasks;
pub mod transition;

pub use buffer::{Buffer, Uploadable};
pub use command::CommandBuffer;
pub use device::VulkanDevice;
pub use image::{Image, ImageDesc};
pub use reclaim::RetiredResource;
pub use renderer::{QueueRole, Renderer, RendererDesc};
pub use swapchain::Swapchain;
pub use tasks::ExecutionPolicy;
