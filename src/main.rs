// Demo: clear-and-present through the kiln frame engine.
//
// Opens a winit window, builds one renderer instance and drives the frame
// loop: begin_frame -> record a clear on the acquired swapchain image ->
// submit -> present. Also uploads a small texture and retires it through the
// deferred-free path so the whole resource lifecycle is exercised.

use anyhow::{Context, Result};
use ash::vk;
use kiln_renderer::{
    Config, ExecutionPolicy, Image, ImageDesc, QueueRole, Registry, RegistryId, Renderer,
    RendererDesc, Uploadable, VulkanDevice,
};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

fn main() -> Result<()> {
    let config = Config::load();

    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    log::info!("Starting kiln demo");
    log::info!(
        "Window: {}x{}, vsync: {}, frames in flight: {}",
        config.window.width,
        config.window.height,
        config.graphics.vsync,
        config.frames_in_flight()
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

struct App {
    config: Config,
    window: Option<Arc<Window>>,
    renderers: Registry<Renderer>,
    renderer_id: Option<RegistryId>,
    frame_cmd: Option<kiln_renderer::CommandBuffer>,
    texture: Option<Image>,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            window: None,
            renderers: Registry::new(),
            renderer_id: None,
            frame_cmd: None,
            texture: None,
            frame_count: 0,
            last_fps_update: Instant::now(),
        }
    }

    fn init_renderer(&mut self, window: Arc<Window>) -> Result<()> {
        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let device = VulkanDevice::new(&self.config.window.title, enable_validation)?;

        let size = window.inner_size();
        let renderer = Renderer::new(
            device,
            window.display_handle().context("No display handle")?.as_raw(),
            window.window_handle().context("No window handle")?.as_raw(),
            &RendererDesc {
                width: size.width,
                height: size.height,
                vsync: self.config.graphics.vsync,
                frames_in_flight: self.config.frames_in_flight(),
            },
        )?;

        let frame_cmd = renderer.create_command_buffer()?;

        // A small checkerboard texture, uploaded through the staging path.
        let mut texture = renderer.create_image(&ImageDesc {
            width: 2,
            height: 2,
            ..Default::default()
        })?;
        let pixels: [u8; 16] = [
            255, 255, 255, 255, 30, 30, 30, 255, //
            30, 30, 30, 255, 255, 255, 255, 255,
        ];
        renderer.upload(Uploadable::Image(&mut texture), &pixels)?;

        self.renderer_id = Some(self.renderers.insert(renderer));
        self.frame_cmd = Some(frame_cmd);
        self.texture = Some(texture);
        self.window = Some(window);

        log::info!("Renderer initialized");
        Ok(())
    }

    fn draw(&mut self) -> Result<()> {
        let Some(id) = self.renderer_id else {
            return Ok(());
        };
        let Some(renderer) = self.renderers.get_mut(id) else {
            return Ok(());
        };
        let Some(cmd) = self.frame_cmd.as_ref() else {
            return Ok(());
        };

        if !renderer.begin_frame()? {
            return Ok(());
        }

        let raw = renderer.begin(cmd)?;

        renderer.record_swapchain_barrier(raw, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;

        let clear_color = vk::ClearColorValue {
            float32: self.config.graphics.clear_color,
        };
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        unsafe {
            renderer.device().device.cmd_clear_color_image(
                raw,
                renderer.current_swapchain_image(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear_color,
                &[range],
            );
        }

        renderer.record_swapchain_barrier(raw, vk::ImageLayout::PRESENT_SRC_KHR)?;

        renderer.end(cmd)?;
        renderer.submit(
            cmd,
            ExecutionPolicy::InOrder,
            QueueRole::Graphics,
            vk::PipelineStageFlags::TRANSFER,
            &[],
        )?;
        renderer.present()?;

        Ok(())
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        self.frame_count += 1;
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            if let Some(ref window) = self.window {
                window.set_title(&format!("{} - {:.0} FPS", self.config.window.title, fps));
            }
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_renderer(window) {
            log::error!("Failed to initialize renderer: {:#}", e);
            event_loop.exit();
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                if let Some(renderer) = self.renderer_id.and_then(|id| self.renderers.get_mut(id))
                {
                    let vsync = self.config.graphics.vsync;
                    if let Err(e) = renderer.on_resize(size.width, size.height, vsync) {
                        log::error!("Resize failed: {:#}", e);
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                if let Err(e) = self.draw() {
                    log::error!("Render error: {:#}", e);
                    event_loop.exit();
                    return;
                }
                self.update_fps();
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};
                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        // Route owned resources through the deferred-free path before the
        // renderer itself goes; its teardown drain releases them.
        if let Some(renderer) = self.renderer_id.and_then(|id| self.renderers.get(id)) {
            if let Some(texture) = self.texture.take() {
                renderer.free_image(texture);
            }
            if let Some(cmd) = self.frame_cmd.take() {
                renderer.free_command_buffer(cmd);
            }
        }
        if let Some(id) = self.renderer_id.take() {
            self.renderers.remove(id);
        }
    }
}
