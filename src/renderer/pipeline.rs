//! Render pass, descriptor layout, wireframe pipeline and framebuffers.
//!
//! The whole frame is a single subpass writing one color attachment. There is
//! no depth buffer: overlapping wireframe lines simply draw in index order.

use std::fs::File;
use std::mem::{offset_of, size_of};
use std::path::Path;
use std::slice;

use ash::{Device, vk};
use log::*;

use super::RendererData;
use crate::error::RenderError;
use crate::grid::Vertex;

/// Compiled stages, in pipeline order, as `build.rs` names them.
const SHADER_STAGES: [(vk::ShaderStageFlags, &str); 2] = [
    (vk::ShaderStageFlags::VERTEX, "heightmap.vert.spv"),
    (vk::ShaderStageFlags::FRAGMENT, "heightmap.frag.spv"),
];

/// Background cleared behind the wireframe.
const CLEAR_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

//==================================================================================================
// SECTION: Vertex Input
//==================================================================================================

impl Vertex {
    /// One interleaved binding, advanced per vertex.
    fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
    }

    /// `layout(location = 0) in vec3` and `layout(location = 1) in vec4`.
    fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 2] {
        let attribute = |location, format, offset: usize| {
            vk::VertexInputAttributeDescription::default()
                .binding(0)
                .location(location)
                .format(format)
                .offset(offset as u32)
        };
        [
            attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, pos)),
            attribute(1, vk::Format::R32G32B32A32_SFLOAT, offset_of!(Vertex, color)),
        ]
    }
}

pub(super) fn clear_values() -> [vk::ClearValue; 1] {
    [vk::ClearValue {
        color: vk::ClearColorValue {
            float32: CLEAR_COLOR,
        },
    }]
}

//==================================================================================================
// SECTION: Render Pass & Descriptor Layout
//==================================================================================================

/// The swapchain image, cleared on load and left ready for presentation.
fn color_attachment(format: vk::Format) -> vk::AttachmentDescription {
    vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
}

pub(super) fn create_render_pass(device: &Device, data: &mut RendererData) -> Result<(), RenderError> {
    let attachments = [color_attachment(data.swapchain_format)];
    let color_refs = [vk::AttachmentReference::default()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];

    let subpasses = [vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)];

    // The layout transition must wait for the acquire semaphore, which the
    // submission waits on at this same stage.
    let dependencies = [vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)];

    let create_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    // SAFETY: the device is valid and `create_info` only borrows locals.
    data.render_pass = unsafe { device.create_render_pass(&create_info, None)? };
    Ok(())
}

/// One uniform buffer at binding 0, read by the vertex stage.
pub(super) fn create_descriptor_set_layout(
    device: &Device,
    data: &mut RendererData,
) -> Result<(), RenderError> {
    let bindings = [vk::DescriptorSetLayoutBinding::default()
        .binding(0)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
        .descriptor_count(1)
        .stage_flags(vk::ShaderStageFlags::VERTEX)];
    let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);

    // SAFETY: the device is valid and `create_info` only borrows locals.
    data.descriptor_set_layout =
        unsafe { device.create_descriptor_set_layout(&create_info, None)? };
    Ok(())
}

//==================================================================================================
// SECTION: Fixed-Function State
//==================================================================================================

/// Rows are stitched with degenerate triangles, so restart indices never occur.
fn strip_input_assembly() -> vk::PipelineInputAssemblyStateCreateInfo<'static> {
    vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_STRIP)
        .primitive_restart_enable(false)
}

/// Edges only. Needs `fillModeNonSolid`, which device selection checks.
///
/// Strip winding alternates per triangle, so nothing is culled. Degenerate
/// triangles collapse to zero-length edges and leave no pixels.
fn wireframe_rasterization() -> vk::PipelineRasterizationStateCreateInfo<'static> {
    vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::LINE)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0)
}

/// Covers the whole swapchain image. The window is not resizable, so this is baked in.
fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport::default()
        .width(extent.width as f32)
        .height(extent.height as f32)
        .max_depth(1.0)
}

fn full_scissor(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D::default().extent(extent)
}

//==================================================================================================
// SECTION: Pipeline
//==================================================================================================

/// Loads every stage in [`SHADER_STAGES`] from `shader_dir`. Modules already
/// created are destroyed if a later one fails.
fn create_shader_modules(
    device: &Device,
    shader_dir: &Path,
) -> Result<Vec<vk::ShaderModule>, RenderError> {
    let mut modules = Vec::with_capacity(SHADER_STAGES.len());
    for (_, file_name) in SHADER_STAGES {
        match create_shader_module(device, &shader_dir.join(file_name)) {
            Ok(module) => modules.push(module),
            Err(e) => {
                destroy_shader_modules(device, &modules);
                return Err(e);
            }
        }
    }
    Ok(modules)
}

fn destroy_shader_modules(device: &Device, modules: &[vk::ShaderModule]) {
    for &module in modules {
        // SAFETY: modules are only referenced while a pipeline is being created.
        unsafe { device.destroy_shader_module(module, None) };
    }
}

fn create_shader_module(device: &Device, path: &Path) -> Result<vk::ShaderModule, RenderError> {
    let shader_error = |source| RenderError::Shader {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(shader_error)?;
    let code = ash::util::read_spv(&mut file).map_err(shader_error)?;
    let create_info = vk::ShaderModuleCreateInfo::default().code(&code);

    // SAFETY: `read_spv` yields correctly aligned SPIR-V words.
    Ok(unsafe { device.create_shader_module(&create_info, None)? })
}

/// Triangle strips rasterized as lines, with vertex colors and no depth test.
pub(super) fn create_pipeline(
    device: &Device,
    shader_dir: &Path,
    data: &mut RendererData,
) -> Result<(), RenderError> {
    let set_layouts = [data.descriptor_set_layout];
    let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
    // SAFETY: the descriptor set layout is live.
    data.pipeline_layout = unsafe { device.create_pipeline_layout(&layout_info, None)? };

    let modules = create_shader_modules(device, shader_dir)?;
    let stages = SHADER_STAGES
        .iter()
        .zip(&modules)
        .map(|(&(stage, _), &module)| {
            vk::PipelineShaderStageCreateInfo::default()
                .stage(stage)
                .module(module)
                .name(c"main")
        })
        .collect::<Vec<_>>();

    let bindings = [Vertex::binding_description()];
    let attributes = Vertex::attribute_descriptions();
    let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly_state = strip_input_assembly();
    let rasterization_state = wireframe_rasterization();

    let viewport = full_viewport(data.swapchain_extent);
    let scissor = full_scissor(data.swapchain_extent);
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewports(slice::from_ref(&viewport))
        .scissors(slice::from_ref(&scissor));

    let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    // Lines are opaque: written straight through, no blending.
    let blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA)];
    let color_blend_state =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input_state)
        .input_assembly_state(&input_assembly_state)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization_state)
        .multisample_state(&multisample_state)
        .color_blend_state(&color_blend_state)
        .layout(data.pipeline_layout)
        .render_pass(data.render_pass)
        .subpass(0);

    // SAFETY: every handle referenced by `pipeline_info` is live.
    let result = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    };
    destroy_shader_modules(device, &modules);

    data.pipeline = match result {
        Ok(pipelines) => pipelines[0],
        Err((pipelines, err)) => {
            for pipeline in pipelines {
                // SAFETY: a partially created pipeline is never used; null is ignored.
                unsafe { device.destroy_pipeline(pipeline, None) };
            }
            return Err(err.into());
        }
    };
    debug!("Created wireframe pipeline.");
    Ok(())
}

//==================================================================================================
// SECTION: Framebuffers
//==================================================================================================

/// One framebuffer per swapchain image view. Each is stored as soon as it
/// exists, so teardown also covers a partially built set.
pub(super) fn create_framebuffers(device: &Device, data: &mut RendererData) -> Result<(), RenderError> {
    data.framebuffers.reserve(data.swapchain_image_views.len());
    for &image_view in &data.swapchain_image_views {
        let attachments = [image_view];
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(data.render_pass)
            .attachments(&attachments)
            .width(data.swapchain_extent.width)
            .height(data.swapchain_extent.height)
            .layers(1);
        // SAFETY: the render pass and image view are live.
        let framebuffer = unsafe { device.create_framebuffer(&create_info, None)? };
        data.framebuffers.push(framebuffer);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_matches_shader_inputs() {
        let binding = Vertex::binding_description();
        assert_eq!(binding.stride as usize, size_of::<Vertex>());
        assert_eq!(binding.stride, 28);

        let [pos, color] = Vertex::attribute_descriptions();
        assert_eq!((pos.location, pos.offset), (0, 0));
        assert_eq!((color.location, color.offset), (1, 12));
        assert_eq!(pos.format, vk::Format::R32G32B32_SFLOAT);
        assert_eq!(color.format, vk::Format::R32G32B32A32_SFLOAT);
    }

    #[test]
    fn strips_draw_as_unculled_lines_without_restart() {
        let assembly = strip_input_assembly();
        assert_eq!(assembly.topology, vk::PrimitiveTopology::TRIANGLE_STRIP);
        assert_eq!(assembly.primitive_restart_enable, vk::FALSE);

        let raster = wireframe_rasterization();
        assert_eq!(raster.polygon_mode, vk::PolygonMode::LINE);
        assert_eq!(raster.cull_mode, vk::CullModeFlags::NONE);
        assert_eq!(raster.rasterizer_discard_enable, vk::FALSE);
        assert_eq!(raster.depth_bias_enable, vk::FALSE);
        assert_eq!(raster.line_width, 1.0);
    }

    #[test]
    fn viewport_and_scissor_cover_the_image() {
        let extent = vk::Extent2D {
            width: 640,
            height: 480,
        };

        let viewport = full_viewport(extent);
        assert_eq!((viewport.x, viewport.y), (0.0, 0.0));
        assert_eq!((viewport.width, viewport.height), (640.0, 480.0));
        assert_eq!((viewport.min_depth, viewport.max_depth), (0.0, 1.0));

        let scissor = full_scissor(extent);
        assert_eq!((scissor.offset.x, scissor.offset.y), (0, 0));
        assert_eq!(scissor.extent, extent);
    }

    #[test]
    fn color_attachment_is_cleared_and_presented() {
        let attachment = color_attachment(vk::Format::B8G8R8A8_SRGB);
        assert_eq!(attachment.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(attachment.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(attachment.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(attachment.initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(attachment.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }
}
