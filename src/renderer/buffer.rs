//! Buffer allocation and host-visible uploads.

use std::mem::size_of_val;
use std::ptr::copy_nonoverlapping as memcpy;

use ash::{Device, Instance, vk};

use super::RendererData;
use crate::error::RenderError;

/// Host-visible and coherent, so CPU writes need neither staging nor flushes.
pub(super) const HOST_MEMORY: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// Creates a buffer and binds freshly allocated memory to it.
pub(super) fn create_buffer(
    instance: &Instance,
    device: &Device,
    data: &RendererData,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    properties: vk::MemoryPropertyFlags,
) -> Result<(vk::Buffer, vk::DeviceMemory), RenderError> {
    let buffer_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    // SAFETY: the device is valid and `buffer_info` is fully initialized.
    let buffer = unsafe { device.create_buffer(&buffer_info, None)? };

    match allocate_and_bind(instance, device, data, buffer, properties) {
        Ok(memory) => Ok((buffer, memory)),
        Err(e) => {
            // SAFETY: the buffer has no memory bound and is unused.
            unsafe { device.destroy_buffer(buffer, None) };
            Err(e)
        }
    }
}

fn allocate_and_bind(
    instance: &Instance,
    device: &Device,
    data: &RendererData,
    buffer: vk::Buffer,
    properties: vk::MemoryPropertyFlags,
) -> Result<vk::DeviceMemory, RenderError> {
    // SAFETY: `buffer` was just created on this device.
    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
    let memory_type_index =
        get_memory_type_index(instance, data.physical_device, properties, requirements)?;

    let alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    // SAFETY: the allocation matches the buffer's requirements. Memory that
    // fails to bind is freed before anything else can reference it.
    unsafe {
        let memory = device.allocate_memory(&alloc_info, None)?;
        if let Err(e) = device.bind_buffer_memory(buffer, memory, 0) {
            device.free_memory(memory, None);
            return Err(e.into());
        }
        Ok(memory)
    }
}

fn get_memory_type_index(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    required_properties: vk::MemoryPropertyFlags,
    requirements: vk::MemoryRequirements,
) -> Result<u32, RenderError> {
    // SAFETY: the physical device comes from this instance.
    let memory_properties =
        unsafe { instance.get_physical_device_memory_properties(physical_device) };

    (0..memory_properties.memory_type_count)
        .find(|&i| {
            let allowed = requirements.memory_type_bits & (1 << i) != 0;
            let flags = memory_properties.memory_types[i as usize].property_flags;
            allowed && flags.contains(required_properties)
        })
        .ok_or(RenderError::NoSuitableMemoryType)
}

/// Creates a host-visible buffer holding a copy of `items`.
pub(super) fn upload<T: Copy>(
    instance: &Instance,
    device: &Device,
    data: &RendererData,
    usage: vk::BufferUsageFlags,
    items: &[T],
) -> Result<(vk::Buffer, vk::DeviceMemory), RenderError> {
    let size = size_of_val(items) as vk::DeviceSize;
    let (buffer, memory) = create_buffer(instance, device, data, size, usage, HOST_MEMORY)?;

    // SAFETY: the mapping covers `size` bytes and `items` cannot overlap device
    // memory. A buffer that cannot be mapped is released unused.
    unsafe {
        match device.map_memory(memory, 0, size, vk::MemoryMapFlags::empty()) {
            Ok(dst) => {
                memcpy(items.as_ptr(), dst.cast(), items.len());
                device.unmap_memory(memory);
                Ok((buffer, memory))
            }
            Err(e) => {
                destroy_buffer(device, buffer, memory);
                Err(e.into())
            }
        }
    }
}

/// Destroys `buffer` and frees `memory`. Null handles are ignored.
///
/// # Safety
///
/// Neither handle may still be in use by the GPU or mapped.
pub(super) unsafe fn destroy_buffer(device: &Device, buffer: vk::Buffer, memory: vk::DeviceMemory) {
    // SAFETY: upheld by the caller; Vulkan accepts null handles here.
    unsafe {
        device.destroy_buffer(buffer, None);
        device.free_memory(memory, None);
    }
}
