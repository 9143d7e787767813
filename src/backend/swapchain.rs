// Swapchain - window presentation
//
// Owns the surface, the presentable images and one acquire semaphore per
// ring slot. Images are recreated wholesale on resize or out-of-date; the
// acquire semaphores are created exactly once at init and reused every
// cycle.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::command::submit_once;
use super::transition;
use super::VulkanDevice;

/// A presentation-owned image. Not allocated through the general allocator;
/// the swapchain owns the memory.
pub struct SwapchainImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
}

pub struct Swapchain {
    device: Arc<VulkanDevice>,
    surface_loader: ash::extensions::khr::Surface,
    surface: vk::SurfaceKHR,
    loader: ash::extensions::khr::Swapchain,
    swapchain: vk::SwapchainKHR,
    pub images: Vec<SwapchainImage>,
    pub format: vk::Format,
    color_space: vk::ColorSpaceKHR,
    pub extent: vk::Extent2D,
    /// One per ring slot, created once at init.
    acquire_semaphores: Vec<vk::Semaphore>,
    /// Pool for the init/resize layout transitions.
    command_pool: vk::CommandPool,
    current_image: u32,
    // Last known window state, used to recover from out-of-date results.
    width: u32,
    height: u32,
    vsync: bool,
    frames_in_flight: usize,
}

impl Swapchain {
    /// Query the surface, pick a colour format, create the per-slot acquire
    /// semaphores, then build the initial swapchain via `resize`.
    ///
    /// Takes ownership of the surface; it is destroyed last at teardown.
    pub fn new(
        device: Arc<VulkanDevice>,
        surface_loader: ash::extensions::khr::Surface,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
        vsync: bool,
        frames_in_flight: usize,
    ) -> Result<Self> {
        let formats = unsafe {
            surface_loader
                .get_physical_device_surface_formats(device.physical_device, surface)
        }?;
        let surface_format =
            choose_surface_format(&formats).context("No suitable surface format")?;

        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let mut acquire_semaphores = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            acquire_semaphores
                .push(unsafe { device.device.create_semaphore(&semaphore_info, None) }?);
        }

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create swapchain command pool")?;

        let loader = ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let mut swapchain = Self {
            device,
            surface_loader,
            surface,
            loader,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            format: surface_format.format,
            color_space: surface_format.color_space,
            extent: vk::Extent2D::default(),
            acquire_semaphores,
            command_pool,
            current_image: 0,
            width,
            height,
            vsync,
            frames_in_flight,
        };
        swapchain.resize(width, height, vsync, frames_in_flight)?;
        Ok(swapchain)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn current_image_index(&self) -> u32 {
        self.current_image
    }

    pub fn current_image(&self) -> &SwapchainImage {
        &self.images[self.current_image as usize]
    }

    pub fn current_image_mut(&mut self) -> &mut SwapchainImage {
        let index = self.current_image as usize;
        &mut self.images[index]
    }

    pub fn acquire_semaphore(&self, slot: usize) -> vk::Semaphore {
        self.acquire_semaphores[slot]
    }

    /// Recreate the swapchain for a new size/vsync setting.
    ///
    /// The old swapchain is handed to the new one's create info and only
    /// destroyed after the new one exists, so a resize never leaves the
    /// window without a presentable chain. Every image ends in PRESENT_SRC.
    /// No-op while minimized (zero size).
    pub fn resize(
        &mut self,
        width: u32,
        height: u32,
        vsync: bool,
        frames_in_flight: usize,
    ) -> Result<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        self.width = width;
        self.height = height;
        self.vsync = vsync;
        self.frames_in_flight = frames_in_flight;

        // Rebuilding ring-independent state must not race in-flight frames.
        self.device.wait_idle()?;

        let caps = unsafe {
            self.surface_loader.get_physical_device_surface_capabilities(
                self.device.physical_device,
                self.surface,
            )
        }?;
        let present_modes = unsafe {
            self.surface_loader.get_physical_device_surface_present_modes(
                self.device.physical_device,
                self.surface,
            )
        }?;

        let extent = choose_extent(&caps, width, height);
        let present_mode = choose_present_mode(&present_modes, vsync);
        let image_count = choose_image_count(&caps);

        log::info!(
            "Creating swapchain: {}x{}, {:?}, {} images",
            extent.width,
            extent.height,
            present_mode,
            image_count
        );

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(self.format)
            .image_color_space(self.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(self.swapchain);

        let new_swapchain = unsafe { self.loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        // The new chain exists; now the old one and its views can go.
        self.destroy_images();
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(self.swapchain, None) };
        }
        self.swapchain = new_swapchain;
        self.extent = extent;

        let images = unsafe { self.loader.get_swapchain_images(self.swapchain) }?;
        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = unsafe { self.device.device.create_image_view(&view_info, None) }
                .context("Failed to create swapchain image view")?;
            self.images.push(SwapchainImage {
                image,
                view,
                layout: vk::ImageLayout::UNDEFINED,
            });
        }

        // Every image starts its life presentable.
        let device = &self.device;
        let format = self.format;
        let targets: Vec<vk::Image> = self.images.iter().map(|i| i.image).collect();
        submit_once(device, self.command_pool, device.graphics_queue, |cmd| {
            for &image in &targets {
                transition::record_barrier(
                    &device.device,
                    cmd,
                    image,
                    format,
                    1,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::PRESENT_SRC_KHR,
                )?;
            }
            Ok(())
        })?;
        for image in &mut self.images {
            image.layout = vk::ImageLayout::PRESENT_SRC_KHR;
        }

        self.current_image = 0;
        Ok(())
    }

    /// Acquire the next presentable image, signalling the slot's acquire
    /// semaphore.
    ///
    /// An out-of-date or suboptimal result triggers a full resize with the
    /// last known window state before retrying. Any other failure is
    /// reported and leaves the previously acquired index in place.
    pub fn acquire_next_image(&mut self, slot: usize) -> Result<u32> {
        let mut resized = false;
        loop {
            let result = unsafe {
                self.loader.acquire_next_image(
                    self.swapchain,
                    u64::MAX,
                    self.acquire_semaphores[slot],
                    vk::Fence::null(),
                )
            };
            match result {
                Ok((index, false)) => {
                    self.current_image = index;
                    return Ok(index);
                }
                Ok((_, true)) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    if resized {
                        log::warn!("Swapchain still out of date after resize");
                        return Ok(self.current_image);
                    }
                    log::debug!("Swapchain out of date during acquire, resizing");
                    self.resize(self.width, self.height, self.vsync, self.frames_in_flight)?;
                    resized = true;
                }
                Err(vk::Result::ERROR_DEVICE_LOST) => {
                    return Err(anyhow::anyhow!("vkAcquireNextImageKHR: device lost"));
                }
                Err(e) => {
                    log::error!("vkAcquireNextImageKHR failed: {:?}", e);
                    debug_assert!(false, "vkAcquireNextImageKHR failed: {:?}", e);
                    return Ok(self.current_image);
                }
            }
        }
    }

    /// Present the current image. Returns `true` when the swapchain should
    /// be recreated (out of date or suboptimal).
    pub fn present(&self, queue: vk::Queue, wait_semaphores: &[vk::Semaphore]) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [self.current_image];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(queue, &present_info) };

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    fn destroy_images(&mut self) {
        for image in self.images.drain(..) {
            unsafe { self.device.device.destroy_image_view(image.view, None) };
        }
    }

    /// Tear everything down in dependency order: device idle, then the
    /// queues this engine submits on, then images, pool, semaphores,
    /// swapchain and finally the surface (swapchain and semaphores
    /// reference it).
    pub(crate) fn destroy(&mut self) {
        let _ = self.device.wait_idle();
        let _ = self.device.queue_wait_idle(self.device.graphics_queue);
        let _ = self.device.queue_wait_idle(self.device.present_queue());

        self.destroy_images();
        unsafe {
            self.device
                .device
                .destroy_command_pool(self.command_pool, None);
            for &semaphore in &self.acquire_semaphores {
                self.device.device.destroy_semaphore(semaphore, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                self.loader.destroy_swapchain(self.swapchain, None);
                self.swapchain = vk::SwapchainKHR::null();
            }
            self.surface_loader.destroy_surface(self.surface, None);
        }
        self.acquire_semaphores.clear();
    }
}

/// Prefer a canonical 8-bit BGRA/RGBA format, else the first available.
fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| f.format == vk::Format::B8G8R8A8_UNORM)
        .or_else(|| {
            formats
                .iter()
                .find(|f| f.format == vk::Format::R8G8B8A8_UNORM)
        })
        .or_else(|| formats.first())
        .copied()
}

/// Vsync maps to FIFO (always supported). Without vsync, prefer MAILBOX
/// (low latency, no tearing), then IMMEDIATE, then fall back to FIFO.
fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| modes.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Surface-decided extent when reported, else the requested size clamped to
/// the supported range.
fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum so acquire rarely blocks; clamped to the
/// supported maximum (0 means unbounded).
fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && count > caps.max_image_count {
        count = caps.max_image_count;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(f: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format: f,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn prefers_canonical_bgra_then_rgba() {
        let formats = [
            format(vk::Format::R5G6B5_UNORM_PACK16),
            format(vk::Format::R8G8B8A8_UNORM),
            format(vk::Format::B8G8R8A8_UNORM),
        ];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::B8G8R8A8_UNORM
        );

        let no_bgra = [
            format(vk::Format::R5G6B5_UNORM_PACK16),
            format(vk::Format::R8G8B8A8_UNORM),
        ];
        assert_eq!(
            choose_surface_format(&no_bgra).unwrap().format,
            vk::Format::R8G8B8A8_UNORM
        );

        let exotic = [format(vk::Format::R16G16B16A16_SFLOAT)];
        assert_eq!(
            choose_surface_format(&exotic).unwrap().format,
            vk::Format::R16G16B16A16_SFLOAT
        );

        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn vsync_selects_vertical_blank_mode() {
        let modes = [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
        assert_eq!(choose_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn no_vsync_prefers_mailbox_then_immediate() {
        let all = [
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO,
        ];
        assert_eq!(choose_present_mode(&all, false), vk::PresentModeKHR::MAILBOX);

        let no_mailbox = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&no_mailbox, false),
            vk::PresentModeKHR::IMMEDIATE
        );

        let fifo_only = [vk::PresentModeKHR::FIFO];
        assert_eq!(choose_present_mode(&fifo_only, false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn extent_honours_surface_decision() {
        let mut caps = vk::SurfaceCapabilitiesKHR::default();
        caps.current_extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let extent = choose_extent(&caps, 1920, 1080);
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn extent_falls_back_to_clamped_request() {
        let mut caps = vk::SurfaceCapabilitiesKHR::default();
        caps.current_extent = vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        };
        caps.min_image_extent = vk::Extent2D {
            width: 64,
            height: 64,
        };
        caps.max_image_extent = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        let extent = choose_extent(&caps, 1920, 32);
        assert_eq!((extent.width, extent.height), (1280, 64));
    }

    #[test]
    fn image_count_clamped_to_supported_max() {
        let mut caps = vk::SurfaceCapabilitiesKHR::default();
        caps.min_image_count = 2;
        caps.max_image_count = 0; // unbounded
        assert_eq!(choose_image_count(&caps), 3);

        caps.max_image_count = 2;
        assert_eq!(choose_image_count(&caps), 2);
    }
}
