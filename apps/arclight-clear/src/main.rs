//! Windowed clear-screen demo.
//!
//! Opens a window, builds a swapchain with a single-subpass render pass and
//! clears every frame to a slowly cycling color. Resizing recreates the
//! swapchain and its framebuffers.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p arclight-clear
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use std::sync::Arc;

use anyhow::{bail, Context};
use arclight_gpu::{
    ApplicationInfo, AttachmentType, CommandBuffer, CommandPool, Device, DeviceConfig, Fence,
    Instance, PresentStatus, QueueUsage, RenderPass, Semaphore, SubPass, SubmitSync, Surface,
    Swapchain, SwapchainConfig,
};
use ash::vk;
use raw_window_handle::HasDisplayHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;
const TITLE: &str = "Arclight Clear";

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting {TITLE}");

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = ClearApp::default();
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Color for `frame`, drifting around the hue circle.
fn cycle_color(frame: u64) -> [f32; 4] {
    let t = (frame % 10_000) as f32 * 0.01;
    let channel = |phase: f32| (t + phase).sin().mul_add(0.5, 0.5);
    [channel(0.0), channel(2.094), channel(4.189), 1.0]
}

#[derive(Default)]
struct ClearApp {
    state: Option<ClearState>,
    frame: u64,
}

impl ApplicationHandler for ClearApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }
        match ClearState::new(event_loop) {
            Ok(state) => self.state = Some(state),
            Err(e) => {
                error!("Failed to initialize: {e:#}");
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let Some(state) = self.state.as_mut() else {
            return;
        };

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested after {} frames", self.frame);
                self.state = None;
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = state.render_frame(self.frame) {
                    error!("Render error: {e:#}");
                    event_loop.exit();
                    return;
                }
                self.frame += 1;
                state.window.request_redraw();
            }
            WindowEvent::Resized(size) => {
                if let Err(e) = state.resize(size) {
                    error!("Resize error: {e:#}");
                    event_loop.exit();
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.window.request_redraw();
        }
    }
}

struct ClearState {
    // Field order is drop order.
    command: CommandBuffer,
    in_flight: Fence,
    image_available: Semaphore,
    /// One per swapchain image, since presentation holds it until the image returns.
    render_finished: Vec<Semaphore>,
    swapchain: Swapchain,
    render_pass: RenderPass,
    device: Arc<Device>,
    _surface: Arc<Surface>,
    _instance: Instance,
    window: Arc<Window>,
}

impl ClearState {
    fn new(event_loop: &ActiveEventLoop) -> anyhow::Result<Self> {
        let attributes = Window::default_attributes()
            .with_title(TITLE)
            .with_inner_size(PhysicalSize::new(WIDTH, HEIGHT));
        let window = Arc::new(event_loop.create_window(attributes)?);

        let mut instance = Instance::new()?;
        instance
            .set_application_info(ApplicationInfo::new("arclight-clear", 0, 1, 0))
            .enable_surface_extensions(window.display_handle()?.as_raw())?;
        instance.create(vk::InstanceCreateFlags::empty())?;

        // SAFETY: the window is stored in the returned state and dropped last.
        let surface = Arc::new(unsafe { Surface::from_window(&instance, window.as_ref()) }?);

        let device = Device::new(&instance, &DeviceConfig::new().with_swapchain())?;
        if !surface.supports_presentation(&device) {
            bail!("the graphics queue cannot present to this window");
        }

        let size = window.inner_size();
        let mut swapchain = Swapchain::new(
            &device,
            &surface,
            SwapchainConfig::new(size.width.max(1), size.height.max(1)),
        )?;

        let mut render_pass = RenderPass::new(&device, vk::SampleCountFlags::TYPE_1);
        let color = render_pass.add_attachment(
            AttachmentType::Color,
            swapchain.format(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::AttachmentLoadOp::CLEAR,
            vk::AttachmentStoreOp::STORE,
        )?;
        let mut subpass = SubPass::new();
        subpass.add_attachment(&color, None);
        render_pass.add_subpass(
            &mut subpass,
            vk::SubpassDescriptionFlags::empty(),
            vk::PipelineBindPoint::GRAPHICS,
        )?;
        render_pass.add_subpass_dependency(
            vk::SubpassDependency::default()
                .src_subpass(vk::SUBPASS_EXTERNAL)
                .dst_subpass(0)
                .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE),
        )?;
        render_pass.finalize()?;
        swapchain.create_framebuffers(&render_pass, &[])?;

        let pool = CommandPool::new(&device, QueueUsage::Graphics)?;
        let command = CommandBuffer::new(&pool)?;

        let mut state = Self {
            command,
            in_flight: Fence::new(&device, true)?,
            image_available: Semaphore::binary(&device)?,
            render_finished: Vec::new(),
            swapchain,
            render_pass,
            device,
            _surface: surface,
            _instance: instance,
            window,
        };
        state.match_image_count()?;

        info!(
            "Presenting {}x{} with {} images",
            state.swapchain.extent().width,
            state.swapchain.extent().height,
            state.swapchain.image_count()
        );
        Ok(state)
    }

    fn match_image_count(&mut self) -> anyhow::Result<()> {
        let wanted = self.swapchain.image_count();
        self.render_finished.truncate(wanted);
        while self.render_finished.len() < wanted {
            self.render_finished.push(Semaphore::binary(&self.device)?);
        }
        Ok(())
    }

    fn render_frame(&mut self, frame: u64) -> anyhow::Result<()> {
        let size = self.window.inner_size();
        if size.width == 0 || size.height == 0 {
            return Ok(());
        }

        self.in_flight.wait(None)?;
        self.command.reset()?;

        let status = self
            .swapchain
            .acquire_next_image(&self.image_available, None, None)?;
        if status == PresentStatus::Recreated {
            return self.match_image_count();
        }
        self.in_flight.reset()?;

        let framebuffer = self
            .swapchain
            .current_framebuffer()
            .context("swapchain has no framebuffers")?;
        let clear = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: cycle_color(frame),
            },
        }];
        self.command.begin_renderpass(
            &self.render_pass,
            framebuffer,
            self.swapchain.extent(),
            &clear,
        )?;
        self.command.end_renderpass()?;

        let render_finished = &self.render_finished[self.swapchain.current_image() as usize];
        self.command.submit_with(
            SubmitSync::new()
                .wait(
                    &self.image_available,
                    0,
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                )
                .signal(
                    render_finished,
                    0,
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                )
                .fence(&self.in_flight),
        )?;

        let status = self.swapchain.present_rendered_image(&[render_finished])?;
        if status == PresentStatus::Recreated {
            self.match_image_count()?;
        }
        Ok(())
    }

    fn resize(&mut self, size: PhysicalSize<u32>) -> anyhow::Result<()> {
        if size.width == 0 || size.height == 0 {
            return Ok(());
        }
        let config = self.swapchain.config().with_extent(size.width, size.height);
        self.swapchain.recreate_with(config)?;
        self.match_image_count()?;
        info!("Resized to {}x{}", size.width, size.height);
        Ok(())
    }
}

impl Drop for ClearState {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            warn!("Failed to wait idle: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn cycle_color_stays_in_range() {
        for frame in [0, 1, 157, 9_999, 10_000, u64::MAX] {
            let color = cycle_color(frame);
            assert!(color[..3].iter().all(|c| (0.0..=1.0).contains(c)));
            assert_relative_eq!(color[3], 1.0);
        }
    }

    #[test]
    fn cycle_color_wraps() {
        assert_eq!(cycle_color(3), cycle_color(10_003));
    }
}
