//! Vulkan implementation of [`FrameBackend`].

mod buffer;
mod device;
mod pipeline;
mod swapchain;

use std::mem::{size_of, size_of_val};
use std::path::Path;
use std::ptr::{self, copy_nonoverlapping as memcpy};

use ash::{Device, Entry, Instance, vk};
use log::*;
use winit::window::Window;

use crate::camera::UniformBufferObject;
use crate::error::RenderError;
use crate::frame::FrameBackend;
use crate::mesh::Mesh;
use crate::vk_window::{create_surface, get_required_instance_extensions};

//==================================================================================================
// SECTION: Renderer State
//==================================================================================================

/// Handles shared by the whole renderer. Null handles are skipped on teardown.
#[derive(Clone, Debug, Default)]
struct RendererData {
    // Debug
    messenger: vk::DebugUtilsMessengerEXT,
    // Surface
    surface: vk::SurfaceKHR,
    // Physical Device / Logical Device
    physical_device: vk::PhysicalDevice,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    graphics_family: u32,
    // Swapchain
    swapchain_format: vk::Format,
    swapchain_extent: vk::Extent2D,
    swapchain: vk::SwapchainKHR,
    swapchain_images: Vec<vk::Image>,
    swapchain_image_views: Vec<vk::ImageView>,
    // Pipeline
    render_pass: vk::RenderPass,
    descriptor_set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    // Framebuffers
    framebuffers: Vec<vk::Framebuffer>,
    // Pools
    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,
    // Mesh
    vertex_buffer: vk::Buffer,
    vertex_buffer_memory: vk::DeviceMemory,
    index_buffer: vk::Buffer,
    index_buffer_memory: vk::DeviceMemory,
}

/// Per-image resources owned by one frame slot.
#[derive(Debug)]
pub struct VulkanSlot {
    fence: vk::Fence,
    command_buffer: vk::CommandBuffer,
    uniform_buffer: vk::Buffer,
    uniform_memory: vk::DeviceMemory,
    /// Persistent mapping of `uniform_memory`.
    uniform_mapped: *mut UniformBufferObject,
    descriptor_set: vk::DescriptorSet,
    render_done: vk::Semaphore,
}

impl VulkanSlot {
    /// A slot that owns nothing yet. Filled in one handle at a time.
    fn null() -> Self {
        Self {
            fence: vk::Fence::null(),
            command_buffer: vk::CommandBuffer::null(),
            uniform_buffer: vk::Buffer::null(),
            uniform_memory: vk::DeviceMemory::null(),
            uniform_mapped: ptr::null_mut(),
            descriptor_set: vk::DescriptorSet::null(),
            render_done: vk::Semaphore::null(),
        }
    }
}

pub struct VulkanRenderer {
    entry: Entry,
    instance: Instance,
    device: Device,
    surface_instance: ash::khr::surface::Instance,
    swapchain_device: ash::khr::swapchain::Device,
    data: RendererData,
}

//==================================================================================================
// SECTION: Creation
//==================================================================================================

impl VulkanRenderer {
    /// Brings up the device and every per-swapchain object. `validation`
    /// is a request: it is dropped with a warning if the layer is missing.
    ///
    /// Every object created before a failing step is destroyed again.
    pub fn create(window: &Window, validation: bool, shader_dir: &Path) -> Result<Self, RenderError> {
        // SAFETY: loading the Vulkan loader runs its library initializers.
        let entry = unsafe { Entry::load()? };
        let mut data = RendererData::default();

        let extensions = get_required_instance_extensions(window)?;
        let instance = device::create_instance(&entry, extensions, validation, &mut data)?;
        let surface_instance = ash::khr::surface::Instance::new(&entry, &instance);

        let device = match create_device(window, &entry, &instance, &surface_instance, &mut data) {
            Ok(device) => device,
            Err(e) => {
                // SAFETY: no device exists, so only instance-level objects are live.
                unsafe { destroy_instance_objects(&entry, &instance, &surface_instance, &mut data) };
                return Err(e);
            }
        };
        let swapchain_device = ash::khr::swapchain::Device::new(&instance, &device);

        // From here on `Drop` releases whatever was created if a later step fails.
        let mut renderer = Self {
            entry,
            instance,
            device,
            surface_instance,
            swapchain_device,
            data,
        };
        renderer.create_render_targets(window, shader_dir)?;
        Ok(renderer)
    }

    fn create_render_targets(&mut self, window: &Window, shader_dir: &Path) -> Result<(), RenderError> {
        let data = &mut self.data;
        swapchain::create_swapchain(
            window,
            &self.surface_instance,
            &self.instance,
            &self.swapchain_device,
            data,
        )?;
        swapchain::create_swapchain_image_views(&self.device, data)?;
        pipeline::create_render_pass(&self.device, data)?;
        pipeline::create_descriptor_set_layout(&self.device, data)?;
        pipeline::create_pipeline(&self.device, shader_dir, data)?;
        pipeline::create_framebuffers(&self.device, data)?;
        create_command_pool(&self.device, data)?;
        create_descriptor_pool(&self.device, data)?;
        Ok(())
    }

    /// Creates the slot's objects one by one, storing each handle as soon as
    /// it exists so a failure leaves `slot` fit for `destroy_slot`.
    fn fill_slot(&self, slot: &mut VulkanSlot) -> Result<(), RenderError> {
        let size = size_of::<UniformBufferObject>() as vk::DeviceSize;
        (slot.uniform_buffer, slot.uniform_memory) = buffer::create_buffer(
            &self.instance,
            &self.device,
            &self.data,
            size,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            buffer::HOST_MEMORY,
        )?;

        // SAFETY: every handle passed below was created on this device and
        // the mapping covers the whole uniform buffer.
        unsafe {
            slot.uniform_mapped = self
                .device
                .map_memory(slot.uniform_memory, 0, size, vk::MemoryMapFlags::empty())?
                .cast::<UniformBufferObject>();

            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(self.data.command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            slot.command_buffer = self.device.allocate_command_buffers(&alloc_info)?[0];

            let layouts = [self.data.descriptor_set_layout];
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(self.data.descriptor_pool)
                .set_layouts(&layouts);
            slot.descriptor_set = self.device.allocate_descriptor_sets(&alloc_info)?[0];

            let buffer_info = [vk::DescriptorBufferInfo::default()
                .buffer(slot.uniform_buffer)
                .offset(0)
                .range(size)];
            let ubo_write = vk::WriteDescriptorSet::default()
                .dst_set(slot.descriptor_set)
                .dst_binding(0)
                .dst_array_element(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&buffer_info);
            self.device.update_descriptor_sets(&[ubo_write], &[]);

            // Signaled, so the first wait on a fresh slot returns at once.
            let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
            slot.fence = self.device.create_fence(&fence_info, None)?;
            slot.render_done = self
                .device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?;
        }
        Ok(())
    }
}

/// Surface, physical device and logical device, in that order.
fn create_device(
    window: &Window,
    entry: &Entry,
    instance: &Instance,
    surface_instance: &ash::khr::surface::Instance,
    data: &mut RendererData,
) -> Result<Device, RenderError> {
    // SAFETY: the window outlives the renderer, which destroys the surface on drop.
    data.surface = unsafe { create_surface(instance, entry, window)? };
    device::pick_physical_device(surface_instance, instance, data)?;
    device::create_logical_device(surface_instance, instance, data)
}

/// Destroys the surface, the debug messenger and the instance, skipping null
/// handles and nulling them afterwards.
///
/// # Safety
///
/// Every object created from the instance other than these two must already
/// be destroyed.
unsafe fn destroy_instance_objects(
    entry: &Entry,
    instance: &Instance,
    surface_instance: &ash::khr::surface::Instance,
    data: &mut RendererData,
) {
    // SAFETY: upheld by the caller.
    unsafe {
        if data.surface != vk::SurfaceKHR::null() {
            surface_instance.destroy_surface(data.surface, None);
            data.surface = vk::SurfaceKHR::null();
        }
        if data.messenger != vk::DebugUtilsMessengerEXT::null() {
            let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);
            debug_utils.destroy_debug_utils_messenger(data.messenger, None);
            data.messenger = vk::DebugUtilsMessengerEXT::null();
        }
        instance.destroy_instance(None);
    }
}

fn create_command_pool(device: &Device, data: &mut RendererData) -> Result<(), RenderError> {
    let create_info = vk::CommandPoolCreateInfo::default()
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        .queue_family_index(data.graphics_family);
    // SAFETY: the graphics family index came from the selected device.
    data.command_pool = unsafe { device.create_command_pool(&create_info, None)? };
    Ok(())
}

/// One uniform-buffer descriptor set per swapchain image.
fn create_descriptor_pool(device: &Device, data: &mut RendererData) -> Result<(), RenderError> {
    let image_count = data.swapchain_images.len() as u32;
    let pool_sizes = [vk::DescriptorPoolSize::default()
        .ty(vk::DescriptorType::UNIFORM_BUFFER)
        .descriptor_count(image_count)];

    let create_info = vk::DescriptorPoolCreateInfo::default()
        .pool_sizes(&pool_sizes)
        .max_sets(image_count)
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);

    // SAFETY: the device is valid and `create_info` only borrows locals.
    data.descriptor_pool = unsafe { device.create_descriptor_pool(&create_info, None)? };
    Ok(())
}

//==================================================================================================
// SECTION: Frame Backend
//==================================================================================================

impl FrameBackend for VulkanRenderer {
    type Semaphore = vk::Semaphore;
    type Slot = VulkanSlot;

    fn image_count(&self) -> usize {
        self.data.swapchain_images.len()
    }

    fn create_semaphore(&mut self) -> Result<vk::Semaphore, RenderError> {
        // SAFETY: the device is valid.
        Ok(unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?
        })
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        // SAFETY: the scheduler only destroys semaphores after the device is idle.
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_slot(&mut self, image_index: usize) -> Result<VulkanSlot, RenderError> {
        let mut slot = VulkanSlot::null();
        match self.fill_slot(&mut slot) {
            Ok(()) => {
                debug!("Created frame slot {}.", image_index);
                Ok(slot)
            }
            Err(e) => {
                self.destroy_slot(slot);
                Err(e)
            }
        }
    }

    fn destroy_slot(&mut self, slot: VulkanSlot) {
        // SAFETY: the slot's last submission has completed (device idle), and
        // Vulkan ignores null handles in every call below except the unmap.
        unsafe {
            self.device.destroy_semaphore(slot.render_done, None);
            self.device.destroy_fence(slot.fence, None);
            if slot.descriptor_set != vk::DescriptorSet::null() {
                if let Err(e) = self
                    .device
                    .free_descriptor_sets(self.data.descriptor_pool, &[slot.descriptor_set])
                {
                    warn!("Failed to free descriptor set: {}", e);
                }
            }
            if slot.command_buffer != vk::CommandBuffer::null() {
                self.device
                    .free_command_buffers(self.data.command_pool, &[slot.command_buffer]);
            }
            if !slot.uniform_mapped.is_null() {
                self.device.unmap_memory(slot.uniform_memory);
            }
            buffer::destroy_buffer(&self.device, slot.uniform_buffer, slot.uniform_memory);
        }
    }

    fn import_mesh(&mut self, mesh: &Mesh) -> Result<(), RenderError> {
        if self.data.vertex_buffer != vk::Buffer::null() {
            return Err(RenderError::MeshAlreadyImported);
        }

        let (vertex_buffer, vertex_memory) = buffer::upload(
            &self.instance,
            &self.device,
            &self.data,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            mesh.vertices(),
        )?;
        self.data.vertex_buffer = vertex_buffer;
        self.data.vertex_buffer_memory = vertex_memory;

        let (index_buffer, index_memory) = buffer::upload(
            &self.instance,
            &self.device,
            &self.data,
            vk::BufferUsageFlags::INDEX_BUFFER,
            mesh.indices(),
        )?;
        self.data.index_buffer = index_buffer;
        self.data.index_buffer_memory = index_memory;

        debug!(
            "Uploaded mesh buffers ({} + {} bytes).",
            size_of_val(mesh.vertices()),
            size_of_val(mesh.indices())
        );
        Ok(())
    }

    fn acquire_next_image(&mut self, signal: &vk::Semaphore) -> Result<u32, RenderError> {
        // SAFETY: the swapchain is live and `signal` is unsignaled with no pending wait.
        let result = unsafe {
            self.swapchain_device.acquire_next_image(
                self.data.swapchain,
                u64::MAX,
                *signal,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((image_index, suboptimal)) => {
                if suboptimal {
                    debug!("Acquired image {} from a suboptimal swapchain.", image_index);
                }
                Ok(image_index)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(RenderError::SwapchainOutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    fn wait_for_slot(&mut self, slot: &VulkanSlot) -> Result<(), RenderError> {
        // SAFETY: the fence belongs to this device.
        unsafe { self.device.wait_for_fences(&[slot.fence], true, u64::MAX)? };
        Ok(())
    }

    fn write_uniform(
        &mut self,
        slot: &mut VulkanSlot,
        ubo: &UniformBufferObject,
    ) -> Result<(), RenderError> {
        // SAFETY: the mapping is live for the slot's lifetime and the GPU is
        // done reading it once the slot's fence has been waited on.
        unsafe { memcpy(ubo, slot.uniform_mapped, 1) };
        Ok(())
    }

    fn record(
        &mut self,
        slot: &VulkanSlot,
        image_index: u32,
        index_count: u32,
    ) -> Result<(), RenderError> {
        if self.data.vertex_buffer == vk::Buffer::null() {
            return Err(RenderError::MeshNotImported);
        }
        let framebuffer = *self
            .data
            .framebuffers
            .get(image_index as usize)
            .ok_or(RenderError::ImageIndexOutOfRange {
                index: image_index,
                slots: self.data.framebuffers.len(),
            })?;

        let command_buffer = slot.command_buffer;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        let clear_values = pipeline::clear_values();
        let render_area = vk::Rect2D::default()
            .offset(vk::Offset2D::default())
            .extent(self.data.swapchain_extent);
        let render_pass_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.data.render_pass)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(&clear_values);

        // SAFETY: the slot's fence has been waited on, so the command buffer is
        // not pending, and every bound object is live.
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
            self.device
                .begin_command_buffer(command_buffer, &begin_info)?;

            self.device.cmd_begin_render_pass(
                command_buffer,
                &render_pass_info,
                vk::SubpassContents::INLINE,
            );
            self.device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                self.data.pipeline,
            );
            self.device
                .cmd_bind_vertex_buffers(command_buffer, 0, &[self.data.vertex_buffer], &[0]);
            self.device.cmd_bind_index_buffer(
                command_buffer,
                self.data.index_buffer,
                0,
                vk::IndexType::UINT32,
            );
            self.device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                self.data.pipeline_layout,
                0,
                &[slot.descriptor_set],
                &[],
            );
            self.device
                .cmd_draw_indexed(command_buffer, index_count, 1, 0, 0, 0);
            self.device.cmd_end_render_pass(command_buffer);

            self.device.end_command_buffer(command_buffer)?;
        }
        Ok(())
    }

    fn submit(&mut self, slot: &VulkanSlot, wait: &vk::Semaphore) -> Result<(), RenderError> {
        let wait_semaphores = [*wait];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [slot.command_buffer];
        let signal_semaphores = [slot.render_done];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        // SAFETY: the fence was waited on before recording, so resetting it is valid.
        unsafe {
            self.device.reset_fences(&[slot.fence])?;
            self.device
                .queue_submit(self.data.graphics_queue, &[submit_info], slot.fence)?;
        }
        Ok(())
    }

    fn present(&mut self, slot: &VulkanSlot, image_index: u32) -> Result<(), RenderError> {
        let wait_semaphores = [slot.render_done];
        let swapchains = [self.data.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        // SAFETY: `image_index` was acquired from this swapchain.
        let result = unsafe {
            self.swapchain_device
                .queue_present(self.data.present_queue, &present_info)
        };

        match result {
            Ok(suboptimal) => {
                if suboptimal {
                    debug!("Presented image {} to a suboptimal swapchain.", image_index);
                }
                Ok(())
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(RenderError::SwapchainOutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    fn wait_idle(&mut self) -> Result<(), RenderError> {
        // SAFETY: the device is valid.
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

//==================================================================================================
// SECTION: Teardown
//==================================================================================================

impl Drop for VulkanRenderer {
    fn drop(&mut self) {
        let data = &mut self.data;

        // SAFETY: all work is finished after `device_wait_idle`, and every
        // handle is destroyed exactly once in reverse creation order.
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("Failed to wait for device idle during teardown: {}", e);
            }

            buffer::destroy_buffer(&self.device, data.index_buffer, data.index_buffer_memory);
            buffer::destroy_buffer(&self.device, data.vertex_buffer, data.vertex_buffer_memory);

            if data.descriptor_pool != vk::DescriptorPool::null() {
                self.device.destroy_descriptor_pool(data.descriptor_pool, None);
            }
            if data.command_pool != vk::CommandPool::null() {
                self.device.destroy_command_pool(data.command_pool, None);
            }
            for framebuffer in data.framebuffers.drain(..) {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            if data.pipeline != vk::Pipeline::null() {
                self.device.destroy_pipeline(data.pipeline, None);
            }
            if data.pipeline_layout != vk::PipelineLayout::null() {
                self.device.destroy_pipeline_layout(data.pipeline_layout, None);
            }
            if data.descriptor_set_layout != vk::DescriptorSetLayout::null() {
                self.device
                    .destroy_descriptor_set_layout(data.descriptor_set_layout, None);
            }
            if data.render_pass != vk::RenderPass::null() {
                self.device.destroy_render_pass(data.render_pass, None);
            }
            for view in data.swapchain_image_views.drain(..) {
                self.device.destroy_image_view(view, None);
            }
            if data.swapchain != vk::SwapchainKHR::null() {
                self.swapchain_device.destroy_swapchain(data.swapchain, None);
            }

            self.device.destroy_device(None);
            destroy_instance_objects(&self.entry, &self.instance, &self.surface_instance, data);
        }
        info!("Renderer destroyed.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unfilled_slot_holds_only_null_handles() {
        let slot = VulkanSlot::null();
        assert_eq!(slot.fence, vk::Fence::null());
        assert_eq!(slot.command_buffer, vk::CommandBuffer::null());
        assert_eq!(slot.uniform_buffer, vk::Buffer::null());
        assert_eq!(slot.uniform_memory, vk::DeviceMemory::null());
        assert!(slot.uniform_mapped.is_null());
        assert_eq!(slot.descriptor_set, vk::DescriptorSet::null());
        assert_eq!(slot.render_done, vk::Semaphore::null());
    }

    /// Needs a Vulkan loader: `cargo test -- --ignored`.
    #[test]
    #[ignore]
    fn instance_objects_are_released_without_a_device() {
        // SAFETY: loading the Vulkan loader runs its library initializers.
        let entry = unsafe { Entry::load() }.unwrap();
        let mut data = RendererData::default();
        let instance = device::create_instance(&entry, &[], true, &mut data).unwrap();
        let surface_instance = ash::khr::surface::Instance::new(&entry, &instance);

        // SAFETY: nothing but the optional messenger was created from the instance.
        unsafe { destroy_instance_objects(&entry, &instance, &surface_instance, &mut data) };
        assert_eq!(data.surface, vk::SurfaceKHR::null());
        assert_eq!(data.messenger, vk::DebugUtilsMessengerEXT::null());
    }
}
