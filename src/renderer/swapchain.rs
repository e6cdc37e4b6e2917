//! Surface capabilities, swapchain and its image views.

use ash::{Device, Instance, vk};
use log::*;
use winit::window::Window;

use super::RendererData;
use super::device::QueueFamilyIndices;
use crate::error::RenderError;

#[derive(Clone, Debug)]
pub(super) struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    pub fn get(
        surface_instance: &ash::khr::surface::Instance,
        data: &RendererData,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self, RenderError> {
        // SAFETY: `physical_device` and `data.surface` belong to the same instance.
        unsafe {
            Ok(Self {
                capabilities: surface_instance
                    .get_physical_device_surface_capabilities(physical_device, data.surface)?,
                formats: surface_instance
                    .get_physical_device_surface_formats(physical_device, data.surface)?,
                present_modes: surface_instance
                    .get_physical_device_surface_present_modes(physical_device, data.surface)?,
            })
        }
    }
}

pub(super) fn create_swapchain(
    window: &Window,
    surface_instance: &ash::khr::surface::Instance,
    instance: &Instance,
    swapchain_device: &ash::khr::swapchain::Device,
    data: &mut RendererData,
) -> Result<(), RenderError> {
    let indices = QueueFamilyIndices::get(surface_instance, instance, data, data.physical_device)?;
    let support = SwapchainSupport::get(surface_instance, data, data.physical_device)?;

    let surface_format = get_swapchain_surface_format(&support.formats);
    let present_mode = get_swapchain_present_mode(&support.present_modes);
    let extent = get_swapchain_extent(window, support.capabilities);

    let mut image_count = support.capabilities.min_image_count + 1;
    if support.capabilities.max_image_count != 0
        && image_count > support.capabilities.max_image_count
    {
        image_count = support.capabilities.max_image_count;
    }

    let queue_family_indices = [indices.graphics, indices.present];
    let image_sharing_mode = if indices.graphics != indices.present {
        vk::SharingMode::CONCURRENT
    } else {
        vk::SharingMode::EXCLUSIVE
    };

    let mut info = vk::SwapchainCreateInfoKHR::default()
        .surface(data.surface)
        .min_image_count(image_count)
        .image_format(surface_format.format)
        .image_color_space(surface_format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        .image_sharing_mode(image_sharing_mode)
        .pre_transform(support.capabilities.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true);
    if image_sharing_mode == vk::SharingMode::CONCURRENT {
        info = info.queue_family_indices(&queue_family_indices);
    }

    // SAFETY: the surface, device and every pointer in `info` are valid.
    unsafe {
        data.swapchain = swapchain_device.create_swapchain(&info, None)?;
        data.swapchain_images = swapchain_device.get_swapchain_images(data.swapchain)?;
    }
    data.swapchain_format = surface_format.format;
    data.swapchain_extent = extent;

    info!(
        "Created swapchain ({} images, {}x{}, {:?}).",
        data.swapchain_images.len(),
        extent.width,
        extent.height,
        present_mode
    );
    Ok(())
}

fn get_swapchain_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .unwrap_or(formats[0])
}

fn get_swapchain_present_mode(present_modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    present_modes
        .iter()
        .copied()
        .find(|&m| m == vk::PresentModeKHR::MAILBOX)
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

fn get_swapchain_extent(window: &Window, capabilities: vk::SurfaceCapabilitiesKHR) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    let size = window.inner_size();
    vk::Extent2D {
        width: size.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: size.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

pub(super) fn create_swapchain_image_views(
    device: &Device,
    data: &mut RendererData,
) -> Result<(), RenderError> {
    data.swapchain_image_views = data
        .swapchain_images
        .iter()
        .map(|&image| {
            let subresource_range = vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1);
            let info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(data.swapchain_format)
                .subresource_range(subresource_range);
            // SAFETY: `image` belongs to the live swapchain.
            unsafe { device.create_image_view(&info, None) }
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(())
}
