//! Window integration: the instance extensions a surface needs and the
//! surface itself, for the Linux windowing systems winit can hand us.

use std::ffi::CStr;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};

use crate::error::RenderError;

/// Instance extensions required to create a surface for `window`.
pub fn get_required_instance_extensions(
    window: &dyn HasWindowHandle,
) -> Result<&'static [&'static CStr], RenderError> {
    let handle = window
        .window_handle()
        .map_err(|e| RenderError::Window(format!("no window handle: {e}")))?;

    match handle.as_raw() {
        #[cfg(target_os = "linux")]
        RawWindowHandle::Wayland(_) => Ok(&[vk::KHR_SURFACE_NAME, vk::KHR_WAYLAND_SURFACE_NAME]),

        #[cfg(target_os = "linux")]
        RawWindowHandle::Xcb(_) => Ok(&[vk::KHR_SURFACE_NAME, vk::KHR_XCB_SURFACE_NAME]),

        #[cfg(target_os = "linux")]
        RawWindowHandle::Xlib(_) => Ok(&[vk::KHR_SURFACE_NAME, vk::KHR_XLIB_SURFACE_NAME]),

        other => Err(unsupported(&other)),
    }
}

/// Creates a surface for a window.
///
/// # Safety
///
/// The returned `SurfaceKHR` is only valid while `window` is, so the window
/// must outlive the surface.
pub unsafe fn create_surface<W>(
    instance: &ash::Instance,
    entry: &ash::Entry,
    window: &W,
) -> Result<vk::SurfaceKHR, RenderError>
where
    W: HasDisplayHandle + HasWindowHandle,
{
    let display = window
        .display_handle()
        .map_err(|e| RenderError::Window(format!("no display handle: {e}")))?
        .as_raw();
    let handle = window
        .window_handle()
        .map_err(|e| RenderError::Window(format!("no window handle: {e}")))?
        .as_raw();

    let surface = match (display, handle) {
        #[cfg(target_os = "linux")]
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(window)) => {
            let info = vk::WaylandSurfaceCreateInfoKHR::default()
                .display(display.display.as_ptr())
                .surface(window.surface.as_ptr());
            let loader = ash::khr::wayland_surface::Instance::new(entry, instance);
            // SAFETY: both pointers come from a live winit window.
            unsafe { loader.create_wayland_surface(&info, None)? }
        }

        #[cfg(target_os = "linux")]
        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(window)) => {
            let connection = display
                .connection
                .map_or(std::ptr::null_mut(), |connection| connection.as_ptr());
            let info = vk::XcbSurfaceCreateInfoKHR::default()
                .connection(connection)
                .window(window.window.get());
            let loader = ash::khr::xcb_surface::Instance::new(entry, instance);
            // SAFETY: the connection and window id come from a live winit window.
            unsafe { loader.create_xcb_surface(&info, None)? }
        }

        #[cfg(target_os = "linux")]
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(window)) => {
            let dpy = display
                .display
                .map_or(std::ptr::null_mut(), |display| display.as_ptr());
            let info = vk::XlibSurfaceCreateInfoKHR::default()
                .dpy(dpy.cast())
                .window(window.window);
            let loader = ash::khr::xlib_surface::Instance::new(entry, instance);
            // SAFETY: the display and window id come from a live winit window.
            unsafe { loader.create_xlib_surface(&info, None)? }
        }

        (_, other) => return Err(unsupported(&other)),
    };
    Ok(surface)
}

fn unsupported(handle: &RawWindowHandle) -> RenderError {
    RenderError::Window(format!("unsupported window system: {handle:?}"))
}
