// Buffers
//
// GPU-accessible memory through the shared allocator: host-visible buffers
// for staging/uniforms, device-local buffers fed by staged copies. Buffers
// have no Drop; owners route them through the reclaim queue (or
// `destroy_now` after a waited submission).

use anyhow::{bail, Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::command::submit_once;
use super::image::Image;
use super::reclaim::RetiredResource;
use super::VulkanDevice;

pub struct Buffer {
    pub buffer: vk::Buffer,
    allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    location: MemoryLocation,
}

impl Buffer {
    pub fn new(
        device: &VulkanDevice,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };
        let allocation = device.allocate(&AllocationCreateDesc {
            name: "buffer",
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .context("Failed to bind buffer memory")?;
        }

        Ok(Self {
            buffer,
            allocation: Some(allocation),
            size,
            usage,
            location,
        })
    }

    /// Host-visible transfer source pre-filled with `data`.
    pub fn staging(device: &VulkanDevice, data: &[u8]) -> Result<Self> {
        let mut buffer = Self::new(
            device,
            data.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        buffer.write(data)?;
        Ok(buffer)
    }

    /// Write into a host-visible buffer through its persistent mapping.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.len() as vk::DeviceSize > self.size {
            bail!(
                "Write of {} bytes exceeds buffer size {}",
                data.len(),
                self.size
            );
        }
        let allocation = self
            .allocation
            .as_ref()
            .context("Buffer has no allocation")?;
        let Some(ptr) = allocation.mapped_ptr() else {
            bail!("Buffer memory is not host-visible");
        };
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr() as *mut u8, data.len());
        }
        Ok(())
    }

    /// Whether the buffer lives in host-visible memory.
    pub fn is_host_visible(&self) -> bool {
        self.location != MemoryLocation::GpuOnly
    }

    /// Package the owned handles for deferred destruction.
    pub fn into_retired(mut self) -> RetiredResource {
        RetiredResource::Buffer {
            buffer: self.buffer,
            allocation: self.allocation.take(),
        }
    }

    /// Destroy immediately. Only valid when no submitted GPU work can still
    /// reference the buffer (e.g. after a waited one-shot submission).
    pub fn destroy_now(mut self, device: &VulkanDevice) -> Result<()> {
        unsafe { device.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            device.free_memory(allocation)?;
        }
        Ok(())
    }
}

/// GPU-side copy between buffers, waited to completion.
pub fn copy_buffer(
    device: &VulkanDevice,
    pool: vk::CommandPool,
    queue: vk::Queue,
    src: &Buffer,
    dst: &Buffer,
    size: vk::DeviceSize,
) -> Result<()> {
    submit_once(device, pool, queue, |cmd| {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe {
            device.device.cmd_copy_buffer(cmd, src.buffer, dst.buffer, &[region]);
        }
        Ok(())
    })
    .context("Buffer copy submission failed")
}

/// The closed set of resources callers can upload into.
pub enum Uploadable<'a> {
    Image(&'a mut Image),
    UniformBuffer(&'a mut Buffer),
    StorageBuffer(&'a mut Buffer),
}

/// Upload `data` into the target, dispatching per variant.
///
/// Host-visible buffers are written through their mapping; device-local ones
/// go through a staging copy. Images stage, copy and end shader-readable.
pub fn upload(
    device: &VulkanDevice,
    pool: vk::CommandPool,
    queue: vk::Queue,
    target: Uploadable<'_>,
    data: &[u8],
) -> Result<()> {
    match target {
        Uploadable::Image(image) => image.set_data(device, pool, queue, data),
        Uploadable::UniformBuffer(buffer) => {
            // Uniforms are rewritten every frame; keep them host-visible.
            buffer.write(data)
        }
        Uploadable::StorageBuffer(buffer) => {
            if buffer.is_host_visible() {
                buffer.write(data)
            } else {
                let staging = Buffer::staging(device, data)?;
                let result = copy_buffer(
                    device,
                    pool,
                    queue,
                    &staging,
                    buffer,
                    data.len() as vk::DeviceSize,
                );
                staging.destroy_now(device)?;
                result
            }
        }
    }
}
