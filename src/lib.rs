// Kiln - per-window Vulkan frame-execution engine
//
// The core owns the hard parts of talking to the GPU: frames-in-flight
// synchronization, swapchain presentation lifecycle, deferred destruction of
// GPU resources, and the layout-transition table that produces correct
// barriers between GPU work items. Batching, descriptors, shaders and
// windowing live in consuming layers; they drive this crate through
// begin_frame/submit/present and the image/buffer primitives.

pub mod backend;
pub mod config;
pub mod registry;

pub use backend::{
    Buffer, CommandBuffer, ExecutionPolicy, Image, ImageDesc, QueueRole, Renderer, RendererDesc,
    RetiredResource, Uploadable, VulkanDevice,
};
pub use config::Config;
pub use registry::{Registry, RegistryId};
