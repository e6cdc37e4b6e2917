//! Instance, validation messenger, physical device and logical device.

use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};

use ash::{Device, Entry, Instance, vk};
use log::*;

use super::RendererData;
use super::swapchain::SwapchainSupport;
use crate::error::{RenderError, SuitabilityError};

const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";
const DEVICE_EXTENSIONS: &[&CStr] = &[c"VK_KHR_swapchain"];

#[derive(Copy, Clone, Debug)]
pub(super) struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilyIndices {
    pub fn get(
        surface_instance: &ash::khr::surface::Instance,
        instance: &Instance,
        data: &RendererData,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self, RenderError> {
        let properties =
            // SAFETY: `instance` and `physical_device` are valid.
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        let graphics = properties
            .iter()
            .position(|p| p.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|i| i as u32);

        let mut present = None;
        for index in 0..properties.len() as u32 {
            // SAFETY: `physical_device`, `index` and `data.surface` are valid.
            let supported = unsafe {
                surface_instance.get_physical_device_surface_support(
                    physical_device,
                    index,
                    data.surface,
                )?
            };
            if supported {
                present = Some(index);
                break;
            }
        }

        match (graphics, present) {
            (Some(graphics), Some(present)) => Ok(Self { graphics, present }),
            _ => Err(SuitabilityError::Static("Missing required queue families.").into()),
        }
    }
}

/// Creates the instance with `extensions` enabled, plus the debug messenger
/// when `validation` is requested and the layer is installed. Validation is
/// active exactly when `data.messenger` is non-null afterwards.
pub(super) fn create_instance(
    entry: &Entry,
    extensions: &[&CStr],
    validation: bool,
    data: &mut RendererData,
) -> Result<Instance, RenderError> {
    let app_name = c"heightmap-viewer";
    let application_info = vk::ApplicationInfo::default()
        .application_name(app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"No Engine")
        .engine_version(vk::make_api_version(0, 1, 0, 0))
        .api_version(vk::API_VERSION_1_1);

    // SAFETY: `CStr::from_ptr` relies on Vulkan providing NUL-terminated names.
    let available_layers = unsafe { entry.enumerate_instance_layer_properties()? }
        .iter()
        .map(|l| unsafe { CStr::from_ptr(l.layer_name.as_ptr()) }.to_owned())
        .collect::<Vec<CString>>();

    let validation = if validation
        && !available_layers
            .iter()
            .any(|layer| layer.as_c_str() == VALIDATION_LAYER_NAME)
    {
        warn!("Validation layer requested but not installed, continuing without it.");
        false
    } else {
        validation
    };

    let mut extension_ptrs: Vec<*const c_char> = extensions.iter().map(|e| e.as_ptr()).collect();
    if validation {
        extension_ptrs.push(ash::ext::debug_utils::NAME.as_ptr());
    }

    let layer_ptrs = if validation {
        vec![VALIDATION_LAYER_NAME.as_ptr()]
    } else {
        Vec::new()
    };

    let mut debug_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    let mut create_info = vk::InstanceCreateInfo::default()
        .application_info(&application_info)
        .enabled_layer_names(&layer_ptrs)
        .enabled_extension_names(&extension_ptrs);
    if validation {
        create_info = create_info.push_next(&mut debug_info);
    }

    // SAFETY: every pointer in `create_info` outlives this call.
    let instance = unsafe { entry.create_instance(&create_info, None)? };

    if validation {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, &instance);
        // SAFETY: `debug_info` is fully initialized and the instance is valid.
        match unsafe { debug_utils.create_debug_utils_messenger(&debug_info, None) } {
            Ok(messenger) => data.messenger = messenger,
            Err(e) => {
                // SAFETY: nothing else has been created from the instance yet.
                unsafe { instance.destroy_instance(None) };
                return Err(e.into());
            }
        }
    }

    info!(
        "Created Vulkan instance (validation {}).",
        if validation { "on" } else { "off" }
    );
    Ok(instance)
}

/// Routes validation messages into `log`.
extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    type_: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _: *mut c_void,
) -> vk::Bool32 {
    // SAFETY: Vulkan hands us a valid callback struct and NUL-terminated message.
    let callback_data = unsafe { &*data };
    let message = unsafe { CStr::from_ptr(callback_data.p_message).to_string_lossy() };

    if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        error!("({:?}) Validation Layer: {}", type_, message);
    } else if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        warn!("({:?}) Validation Layer: {}", type_, message);
    } else if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::INFO {
        debug!("({:?}) Validation Layer: {}", type_, message);
    } else {
        trace!("({:?}) Validation Layer: {}", type_, message);
    }
    vk::FALSE
}

/// Picks the first GPU that can draw wireframes to the window surface.
pub(super) fn pick_physical_device(
    surface_instance: &ash::khr::surface::Instance,
    instance: &Instance,
    data: &mut RendererData,
) -> Result<(), RenderError> {
    // SAFETY: the instance is valid.
    let physical_devices = unsafe { instance.enumerate_physical_devices()? };

    for physical_device in physical_devices {
        // SAFETY: `device_name` is a NUL-terminated string filled in by the driver.
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let device_name =
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()).to_string_lossy() };

        match check_physical_device(surface_instance, instance, data, physical_device) {
            Ok(()) => {
                info!("Selected physical device (`{}`).", device_name);
                data.physical_device = physical_device;
                return Ok(());
            }
            Err(error) => warn!("Skipping physical device (`{}`): {}", device_name, error),
        }
    }
    Err(RenderError::NoSuitableDevice)
}

fn check_physical_device(
    surface_instance: &ash::khr::surface::Instance,
    instance: &Instance,
    data: &RendererData,
    physical_device: vk::PhysicalDevice,
) -> Result<(), RenderError> {
    QueueFamilyIndices::get(surface_instance, instance, data, physical_device)?;
    check_physical_device_extensions(instance, physical_device)?;

    let support = SwapchainSupport::get(surface_instance, data, physical_device)?;
    if support.formats.is_empty() || support.present_modes.is_empty() {
        return Err(SuitabilityError::Static("Insufficient swapchain support.").into());
    }

    // SAFETY: the physical device handle comes from the instance.
    let features = unsafe { instance.get_physical_device_features(physical_device) };
    if features.fill_mode_non_solid != vk::TRUE {
        return Err(SuitabilityError::Static("Wireframe polygon mode not supported.").into());
    }
    Ok(())
}

fn check_physical_device_extensions(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<(), RenderError> {
    // SAFETY: extension names are NUL-terminated strings filled in by the driver.
    let available = unsafe { instance.enumerate_device_extension_properties(physical_device)? }
        .iter()
        .map(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) }.to_owned())
        .collect::<HashSet<CString>>();

    for &required in DEVICE_EXTENSIONS {
        if !available.contains(required) {
            return Err(SuitabilityError::Dynamic(format!(
                "Missing required device extension: {}",
                required.to_string_lossy()
            ))
            .into());
        }
    }
    Ok(())
}

pub(super) fn create_logical_device(
    surface_instance: &ash::khr::surface::Instance,
    instance: &Instance,
    data: &mut RendererData,
) -> Result<Device, RenderError> {
    let indices = QueueFamilyIndices::get(surface_instance, instance, data, data.physical_device)?;
    let unique_indices: HashSet<u32> = [indices.graphics, indices.present].into_iter().collect();

    let queue_priorities = &[1.0];
    let queue_infos = unique_indices
        .iter()
        .map(|&i| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(i)
                .queue_priorities(queue_priorities)
        })
        .collect::<Vec<_>>();

    let extension_ptrs: Vec<*const c_char> =
        DEVICE_EXTENSIONS.iter().map(|ext| ext.as_ptr()).collect();
    let features = vk::PhysicalDeviceFeatures::default().fill_mode_non_solid(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extension_ptrs)
        .enabled_features(&features);

    // SAFETY: the physical device was selected from this instance.
    let device = unsafe { instance.create_device(data.physical_device, &create_info, None)? };

    // SAFETY: one queue was requested from each family.
    unsafe {
        data.graphics_queue = device.get_device_queue(indices.graphics, 0);
        data.present_queue = device.get_device_queue(indices.present, 0);
    }
    data.graphics_family = indices.graphics;
    Ok(device)
}
