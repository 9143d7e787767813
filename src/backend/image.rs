// General images
//
// Unlike swapchain images these own their memory through the allocator. The
// tracked `layout` field must always equal the true GPU-side layout; every
// path that changes the layout goes through the transition engine.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::buffer::Buffer;
use super::command::submit_once;
use super::reclaim::RetiredResource;
use super::transition;
use super::VulkanDevice;

pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    /// Request a full mip chain (generated on upload).
    pub mipmaps: bool,
    /// Create a linear-filtering sampler alongside the view.
    pub sampler: bool,
}

impl Default for ImageDesc {
    fn default() -> Self {
        Self {
            width: 1,
            height: 1,
            format: vk::Format::R8G8B8A8_UNORM,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            mipmaps: false,
            sampler: true,
        }
    }
}

pub struct Image {
    pub image: vk::Image,
    allocation: Option<Allocation>,
    pub view: vk::ImageView,
    pub sampler: Option<vk::Sampler>,
    pub layout: vk::ImageLayout,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub mip_levels: u32,
    usage: vk::ImageUsageFlags,
}

impl Image {
    pub fn new(device: &VulkanDevice, desc: &ImageDesc) -> Result<Self> {
        let mip_levels = if desc.mipmaps {
            transition::mip_level_count(desc.width, desc.height)
        } else {
            1
        };
        // Mip generation blits level N-1 into level N on the same image.
        let usage = if desc.mipmaps {
            desc.usage | vk::ImageUsageFlags::TRANSFER_SRC
        } else {
            desc.usage
        };

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(mip_levels)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .context("Failed to create image")?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let allocation = device.allocate(&AllocationCreateDesc {
            name: "image",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .context("Failed to bind image memory")?;
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: transition::aspect_mask(desc.format),
                base_mip_level: 0,
                level_count: mip_levels,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe { device.device.create_image_view(&view_info, None) }
            .context("Failed to create image view")?;

        let sampler = if desc.sampler {
            let max_anisotropy = device.properties.limits.max_sampler_anisotropy;
            let sampler_info = vk::SamplerCreateInfo::builder()
                .mag_filter(vk::Filter::LINEAR)
                .min_filter(vk::Filter::LINEAR)
                .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
                .address_mode_u(vk::SamplerAddressMode::REPEAT)
                .address_mode_v(vk::SamplerAddressMode::REPEAT)
                .address_mode_w(vk::SamplerAddressMode::REPEAT)
                .anisotropy_enable(true)
                .max_anisotropy(max_anisotropy)
                .min_lod(0.0)
                .max_lod(mip_levels as f32);
            Some(
                unsafe { device.device.create_sampler(&sampler_info, None) }
                    .context("Failed to create sampler")?,
            )
        } else {
            None
        };

        Ok(Self {
            image,
            allocation: Some(allocation),
            view,
            sampler,
            layout: vk::ImageLayout::UNDEFINED,
            format: desc.format,
            extent: vk::Extent2D {
                width: desc.width,
                height: desc.height,
            },
            mip_levels,
            usage: desc.usage,
        })
    }

    /// Depth attachment sized to the given extent, using the device's
    /// preferred depth format.
    pub fn depth(device: &VulkanDevice, extent: vk::Extent2D) -> Result<Self> {
        Self::new(
            device,
            &ImageDesc {
                width: extent.width,
                height: extent.height,
                format: device.find_depth_format()?,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                mipmaps: false,
                sampler: false,
            },
        )
    }

    /// Transition to `new_layout`, blocking until the barrier has executed.
    pub fn transition(
        &mut self,
        device: &VulkanDevice,
        pool: vk::CommandPool,
        queue: vk::Queue,
        new_layout: vk::ImageLayout,
    ) -> Result<()> {
        transition::transition_image(
            device,
            pool,
            queue,
            self.image,
            self.format,
            self.mip_levels,
            &mut self.layout,
            new_layout,
        )
    }

    /// Upload pixel data through a staging buffer.
    ///
    /// Ends in SHADER_READ_ONLY, generating the mip chain when one was
    /// requested at creation.
    pub fn set_data(
        &mut self,
        device: &VulkanDevice,
        pool: vk::CommandPool,
        queue: vk::Queue,
        data: &[u8],
    ) -> Result<()> {
        let staging = Buffer::staging(device, data)?;

        self.transition(device, pool, queue, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;

        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: transition::aspect_mask(self.format),
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: self.extent.width,
                height: self.extent.height,
                depth: 1,
            },
        };

        let image = self.image;
        let buffer = staging.buffer;
        submit_once(device, pool, queue, |cmd| {
            unsafe {
                device.device.cmd_copy_buffer_to_image(
                    cmd,
                    buffer,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
            Ok(())
        })
        .context("Image upload submission failed")?;

        if self.mip_levels > 1 {
            transition::generate_mipmaps(
                device,
                pool,
                queue,
                self.image,
                self.format,
                self.extent.width,
                self.extent.height,
                self.mip_levels,
                &mut self.layout,
            )?;
        } else {
            self.transition(device, pool, queue, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)?;
        }

        // The one-shot submissions above were waited on; the staging buffer
        // is no longer referenced by any GPU work.
        staging.destroy_now(device)?;

        Ok(())
    }

    /// Recreate at a new size. Returns the old handles for deferred
    /// reclamation; the new image starts UNDEFINED with no data.
    pub fn resize(
        &mut self,
        device: &VulkanDevice,
        width: u32,
        height: u32,
    ) -> Result<RetiredResource> {
        let replacement = Self::new(
            device,
            &ImageDesc {
                width,
                height,
                format: self.format,
                usage: self.usage,
                mipmaps: self.mip_levels > 1,
                sampler: self.sampler.is_some(),
            },
        )?;
        Ok(std::mem::replace(self, replacement).into_retired())
    }

    /// Package the owned handles for deferred destruction.
    pub fn into_retired(mut self) -> RetiredResource {
        RetiredResource::Image {
            image: self.image,
            view: self.view,
            sampler: self.sampler.take(),
            allocation: self.allocation.take(),
        }
    }
}
