//! Interactive wireframe viewer for `.fdf` heightmaps.

mod camera;
mod config;
mod error;
mod frame;
mod grid;
mod mesh;
mod renderer;
mod vk_window;

use std::ops::ControlFlow;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use log::*;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, KeyEvent, MouseScrollDelta, WindowEvent};
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::keyboard::PhysicalKey;
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::window::{Window, WindowAttributes, WindowId};

use camera::{CameraInput, CameraState, UniformBufferObject};
use config::Config;
use error::LoadError;
use frame::FrameScheduler;
use mesh::load_mesh;
use renderer::VulkanRenderer;

//==================================================================================================
// SECTION: Constants & Type Aliases
//==================================================================================================

pub type Vec3 = nalgebra::Vector3<f32>;
pub type Vec4 = nalgebra::Vector4<f32>;
pub type Mat4 = nalgebra::Matrix4<f32>;
pub type Point3 = nalgebra::Point3<f32>;

//==================================================================================================
// SECTION: Winit Application Handler
//==================================================================================================

/// Window events in, camera state out. The frame loop pumps it once per frame.
struct Viewer {
    attributes: WindowAttributes,
    window: Option<Window>,
    camera: CameraState,
    close_requested: bool,
    window_error: Option<String>,
}

impl Viewer {
    fn new(config: &Config) -> Self {
        let attributes = Window::default_attributes()
            .with_title(format!("heightmap-viewer - {}", config.map.display()))
            .with_inner_size(PhysicalSize::new(config.width, config.height))
            .with_resizable(false);

        Self {
            attributes,
            window: None,
            camera: CameraState::new(config.camera_settings()),
            close_requested: false,
            window_error: None,
        }
    }

    /// Delivers pending events without blocking. `Break` once the window should close.
    fn poll(&mut self, event_loop: &mut EventLoop<()>) -> ControlFlow<(), UniformBufferObject> {
        if let PumpStatus::Exit(code) = event_loop.pump_app_events(Some(Duration::ZERO), self) {
            debug!("Event loop exited with code {}.", code);
            return ControlFlow::Break(());
        }
        if self.close_requested {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(self.camera.uniform())
        }
    }

    fn apply(&mut self, input: Option<CameraInput>) {
        if let Some(input) = input {
            trace!("Camera input: {:?}", input);
            self.camera.apply(input);
        }
    }
}

impl ApplicationHandler for Viewer {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        match event_loop.create_window(self.attributes.clone()) {
            Ok(window) => {
                info!("Window created.");
                self.window = Some(window);
            }
            Err(e) => {
                self.window_error = Some(e.to_string());
                self.close_requested = true;
            }
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested.");
                self.close_requested = true;
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(code),
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => self.apply(CameraInput::from_key(code)),
            WindowEvent::MouseWheel { delta, .. } => {
                let delta_y = match delta {
                    MouseScrollDelta::LineDelta(_, y) => y,
                    MouseScrollDelta::PixelDelta(position) => position.y as f32,
                };
                self.apply(CameraInput::from_scroll(delta_y));
            }
            _ => (),
        }
    }
}

//==================================================================================================
// SECTION: Main Application Entry Point
//==================================================================================================

fn run(config: &Config) -> Result<()> {
    // Map errors are reported before any window exists.
    let mesh = match load_mesh(&config.map, config.z_scale) {
        Ok(mesh) => mesh,
        Err(LoadError::Parse(e)) => bail!("{}:{}", config.map.display(), e),
        Err(e) => return Err(e.into()),
    };

    let mut event_loop = EventLoop::new().context("failed to create event loop")?;
    let mut viewer = Viewer::new(config);

    // The first pump delivers `resumed`, which creates the window.
    while viewer.window.is_none() {
        if viewer.poll(&mut event_loop).is_break() {
            return match viewer.window_error.take() {
                Some(e) => Err(anyhow!("failed to create window: {}", e)),
                None => Ok(()),
            };
        }
    }
    let window = viewer
        .window
        .as_ref()
        .ok_or_else(|| anyhow!("window disappeared before renderer creation"))?;

    let renderer = VulkanRenderer::create(window, config.validation(), &config.shader_dir)
        .context("failed to initialize Vulkan")?;
    let mut scheduler = FrameScheduler::new(renderer).context("failed to create frame slots")?;
    scheduler.import_mesh(&mesh)?;

    scheduler.run(|| viewer.poll(&mut event_loop))?;

    // Frame slots and the surface go before the window they were made for.
    drop(scheduler);
    drop(viewer);
    info!("Shutdown complete.");
    Ok(())
}

fn main() -> ExitCode {
    pretty_env_logger::init();

    let config = Config::from_args();
    info!("Starting heightmap-viewer on {}.", config.map.display());

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
