// Surface creation from raw window handles
//
// The engine never talks to a windowing library directly; callers hand it
// the raw window/display handles and get a vk::SurfaceKHR back.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use super::VulkanDevice;

/// Create a presentation surface for a native window.
///
/// Dispatches on the handle variant at runtime so one binary covers Win32,
/// X11 and Wayland; the matching instance extension must have been enabled
/// (see `VulkanDevice::new`).
pub fn create_surface(
    device: &VulkanDevice,
    display: RawDisplayHandle,
    window: RawWindowHandle,
) -> Result<(ash::extensions::khr::Surface, vk::SurfaceKHR)> {
    let surface_loader = ash::extensions::khr::Surface::new(&device.entry, &device.instance);

    let surface = unsafe {
        match (display, window) {
            (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
                let hinstance =
                    handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
                let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
                let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                    .hinstance(hinstance)
                    .hwnd(hwnd);
                let loader =
                    ash::extensions::khr::Win32Surface::new(&device.entry, &device.instance);
                loader
                    .create_win32_surface(&create_info, None)
                    .context("vkCreateWin32SurfaceKHR failed")?
            }
            (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
                let dpy = display
                    .display
                    .map(|d| d.as_ptr())
                    .unwrap_or(std::ptr::null_mut());
                let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                    .dpy(dpy as *mut _)
                    .window(handle.window);
                let loader =
                    ash::extensions::khr::XlibSurface::new(&device.entry, &device.instance);
                loader
                    .create_xlib_surface(&create_info, None)
                    .context("vkCreateXlibSurfaceKHR failed")?
            }
            (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
                let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                    .display(display.display.as_ptr())
                    .surface(handle.surface.as_ptr());
                let loader =
                    ash::extensions::khr::WaylandSurface::new(&device.entry, &device.instance);
                loader
                    .create_wayland_surface(&create_info, None)
                    .context("vkCreateWaylandSurfaceKHR failed")?
            }
            _ => anyhow::bail!("Unsupported window handle type"),
        }
    };

    // Verify the GPU can present to this surface with the queue family the
    // engine submits on.
    let supported = unsafe {
        surface_loader.get_physical_device_surface_support(
            device.physical_device,
            device.graphics_queue_family,
            surface,
        )?
    };
    if !supported {
        unsafe { surface_loader.destroy_surface(surface, None) };
        anyhow::bail!("GPU doesn't support presenting to this surface");
    }

    Ok((surface_loader, surface))
}
