//! Render pass and donut pipeline creation

use std::ffi::CStr;
use std::mem::size_of;

use ash::vk;

use crate::render::{DefaultInstance, DefaultVertex, GlobalData};

const ENTRY_POINT: &[u8] = b"main\0";

pub(super) fn create_render_pass(
    device: &ash::Device,
    color_format: vk::Format,
    depth_format: vk::Format,
) -> Result<vk::RenderPass, vk::Result> {
    // The colour attachment is transitioned by explicit barriers before and
    // after the pass, so it stays in COLOR_ATTACHMENT_OPTIMAL here.
    let attachments = [
        vk::AttachmentDescription::builder()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .build(),
        vk::AttachmentDescription::builder()
            .format(depth_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::CLEAR)
            .stencil_store_op(vk::AttachmentStoreOp::STORE)
            .initial_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .build(),
    ];

    let color_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();
    let depth_ref = vk::AttachmentReference::builder()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(std::slice::from_ref(&color_ref))
        .depth_stencil_attachment(&depth_ref)
        .build();

    let info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(std::slice::from_ref(&subpass));

    unsafe { device.create_render_pass(&info, None) }
}

fn vertex_attributes() -> Vec<vk::VertexInputAttributeDescription> {
    let attr = |location: u32, binding: u32, format: vk::Format, offset: usize| vk::VertexInputAttributeDescription {
        location,
        binding,
        format,
        offset: offset as u32,
    };
    let vec4 = vk::Format::R32G32B32A32_SFLOAT;
    let f = size_of::<f32>();

    let mut attributes = vec![
        attr(0, 0, vk::Format::R32G32B32_SFLOAT, 0),
        attr(1, 0, vk::Format::R32G32B32_SFLOAT, 3 * f),
        attr(2, 0, vk::Format::R32G32_SFLOAT, 6 * f),
    ];
    // model and inverse model matrices, one column per location
    for column in 0..8 {
        attributes.push(attr(3 + column as u32, 1, vec4, column * 4 * f));
    }
    attributes.push(attr(11, 1, vk::Format::R32_UINT, 32 * f));
    attributes.push(attr(12, 1, vk::Format::R32_SFLOAT, 33 * f));
    attributes.push(attr(13, 1, vk::Format::R32_SFLOAT, 34 * f));
    attributes
}

pub(super) fn create_donut_pipeline(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    vertex_code: &[u32],
    fragment_code: &[u32],
) -> Result<(vk::PipelineLayout, vk::Pipeline), vk::Result> {
    let entry = CStr::from_bytes_with_nul(ENTRY_POINT).map_err(|_| vk::Result::ERROR_INITIALIZATION_FAILED)?;

    unsafe {
        let vertex_module =
            device.create_shader_module(&vk::ShaderModuleCreateInfo::builder().code(vertex_code), None)?;
        let fragment_module =
            match device.create_shader_module(&vk::ShaderModuleCreateInfo::builder().code(fragment_code), None) {
                Ok(module) => module,
                Err(err) => {
                    device.destroy_shader_module(vertex_module, None);
                    return Err(err);
                }
            };

        let stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex_module)
                .name(entry)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment_module)
                .name(entry)
                .build(),
        ];

        let bindings = [
            vk::VertexInputBindingDescription {
                binding: 0,
                stride: size_of::<DefaultVertex>() as u32,
                input_rate: vk::VertexInputRate::VERTEX,
            },
            vk::VertexInputBindingDescription {
                binding: 1,
                stride: size_of::<DefaultInstance>() as u32,
                input_rate: vk::VertexInputRate::INSTANCE,
            },
        ];
        let attributes = vertex_attributes();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_STRIP)
            .primitive_restart_enable(true);

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);

        let multisampling =
            vk::PipelineMultisampleStateCreateInfo::builder().rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS);

        let blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build();
        let color_blending =
            vk::PipelineColorBlendStateCreateInfo::builder().attachments(std::slice::from_ref(&blend_attachment));

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let push_range = vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX,
            offset: 0,
            size: size_of::<GlobalData>() as u32,
        };
        let layout_info = vk::PipelineLayoutCreateInfo::builder().push_constant_ranges(std::slice::from_ref(&push_range));
        let layout = match device.create_pipeline_layout(&layout_info, None) {
            Ok(layout) => layout,
            Err(err) => {
                device.destroy_shader_module(vertex_module, None);
                device.destroy_shader_module(fragment_module, None);
                return Err(err);
            }
        };

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0)
            .build();

        let result = device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None);

        device.destroy_shader_module(vertex_module, None);
        device.destroy_shader_module(fragment_module, None);

        match result {
            Ok(pipelines) => Ok((layout, pipelines[0])),
            Err((_, err)) => {
                device.destroy_pipeline_layout(layout, None);
                Err(err)
            }
        }
    }
}
