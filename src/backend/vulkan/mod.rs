//! Vulkan backend implementation using ash
//!
//! Headless: frames render into an offscreen colour target owned by the
//! backend. Uniform buffers are host visible and persistently mapped, so
//! `write_buffer` is a plain memory copy. Textures are uploaded through a
//! staging buffer and one-time command buffer.

use std::collections::HashMap;
use std::ffi::CStr;
use std::io::Cursor;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;

use crate::backend::traits::*;
use crate::backend::types::*;

const ENTRY_POINT: &CStr = c"main";
const COLOR_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
const PUSH_CONSTANT_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::VERTEX.as_raw() | vk::ShaderStageFlags::FRAGMENT.as_raw(),
);
const DESCRIPTOR_POOL_SIZE: u32 = 4096;

/// Vulkan backend implementation
pub struct VulkanBackend {
    _entry: Option<ash::Entry>,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    /// Instance and device are destroyed on drop only when the backend
    /// created them.
    owns_device: bool,
    graphics_queue: vk::Queue,
    allocator: Option<Allocator>,
    limits: vk::PhysicalDeviceLimits,

    // Offscreen target
    extent: vk::Extent2D,
    render_pass: vk::RenderPass,
    target: Option<VkImage>,
    framebuffer: vk::Framebuffer,

    // Frames in flight
    command_pool: vk::CommandPool,
    frames: Vec<FrameSlot>,
    frame_slot: usize,
    frame_index: u64,
    is_recording: bool,

    descriptor_pool: vk::DescriptorPool,

    // Resource storage
    shader_modules: HashMap<u64, vk::ShaderModule>,
    layouts: HashMap<u64, vk::DescriptorSetLayout>,
    sets: HashMap<u64, vk::DescriptorSet>,
    pipelines: HashMap<u64, VkPipeline>,
    buffers: HashMap<u64, VkBuffer>,
    textures: HashMap<u64, VkTexture>,
    next_id: u64,
}

struct FrameSlot {
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

struct VkBuffer {
    buffer: vk::Buffer,
    allocation: Allocation,
}

struct VkImage {
    image: vk::Image,
    view: vk::ImageView,
    allocation: Allocation,
}

struct VkTexture {
    image: VkImage,
    sampler: vk::Sampler,
}

struct VkPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl VulkanBackend {
    pub const DEFAULT_EXTENT: (u32, u32) = (1280, 720);

    /// Create an instance and device of its own and render offscreen.
    pub fn new_headless(frames_in_flight: usize) -> BackendResult<Self> {
        let (width, height) = Self::DEFAULT_EXTENT;
        Self::new_headless_with_extent(frames_in_flight, width, height)
    }

    pub fn new_headless_with_extent(
        frames_in_flight: usize,
        width: u32,
        height: u32,
    ) -> BackendResult<Self> {
        unsafe {
            let entry = ash::Entry::load()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let app_info = vk::ApplicationInfo {
                p_application_name: c"lumen".as_ptr(),
                application_version: vk::make_api_version(0, 0, 1, 0),
                p_engine_name: c"lumen-engine".as_ptr(),
                engine_version: vk::make_api_version(0, 0, 1, 0),
                api_version: vk::API_VERSION_1_2,
                ..Default::default()
            };
            let instance_info = vk::InstanceCreateInfo {
                p_application_info: &app_info,
                ..Default::default()
            };
            let instance = entry
                .create_instance(&instance_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let selected = instance
                .enumerate_physical_devices()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))
                .and_then(|devices| {
                    devices
                        .into_iter()
                        .find_map(|pd| Self::find_queue_family(&instance, pd).map(|q| (pd, q)))
                        .ok_or_else(|| {
                            BackendError::InitializationFailed("No suitable physical device".into())
                        })
                });
            let (physical_device, queue_family) = match selected {
                Ok(selected) => selected,
                Err(e) => {
                    instance.destroy_instance(None);
                    return Err(e);
                }
            };

            let queue_priorities = [1.0f32];
            let queue_info = vk::DeviceQueueCreateInfo {
                queue_family_index: queue_family,
                queue_count: 1,
                p_queue_priorities: queue_priorities.as_ptr(),
                ..Default::default()
            };
            let device_features = vk::PhysicalDeviceFeatures::default();
            let device_info = vk::DeviceCreateInfo {
                queue_create_info_count: 1,
                p_queue_create_infos: &queue_info,
                p_enabled_features: &device_features,
                ..Default::default()
            };
            let device = match instance.create_device(physical_device, &device_info, None) {
                Ok(device) => device,
                Err(e) => {
                    instance.destroy_instance(None);
                    return Err(BackendError::InitializationFailed(e.to_string()));
                }
            };

            let mut backend = match Self::from_device_with_extent(
                instance.clone(),
                physical_device,
                device.clone(),
                queue_family,
                frames_in_flight,
                width,
                height,
            ) {
                Ok(backend) => backend,
                Err(e) => {
                    device.destroy_device(None);
                    instance.destroy_instance(None);
                    return Err(e);
                }
            };
            backend._entry = Some(entry);
            backend.owns_device = true;
            Ok(backend)
        }
    }

    /// Render through a device created elsewhere. The caller keeps ownership
    /// of `instance` and `device` and must destroy them after the backend.
    pub fn from_device(
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queue_family: u32,
        frames_in_flight: usize,
    ) -> BackendResult<Self> {
        let (width, height) = Self::DEFAULT_EXTENT;
        Self::from_device_with_extent(
            instance,
            physical_device,
            device,
            queue_family,
            frames_in_flight,
            width,
            height,
        )
    }

    fn from_device_with_extent(
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queue_family: u32,
        frames_in_flight: usize,
        width: u32,
        height: u32,
    ) -> BackendResult<Self> {
        let frames_in_flight = frames_in_flight.max(1);
        unsafe {
            let properties = instance.get_physical_device_properties(physical_device);
            let graphics_queue = device.get_device_queue(queue_family, 0);

            let allocator = Allocator::new(&AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            })
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let pool_info = vk::CommandPoolCreateInfo {
                queue_family_index: queue_family,
                flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                ..Default::default()
            };
            let command_pool = device
                .create_command_pool(&pool_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let pool_sizes = [
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: DESCRIPTOR_POOL_SIZE,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    descriptor_count: DESCRIPTOR_POOL_SIZE * 4,
                },
            ];
            let descriptor_pool_info = vk::DescriptorPoolCreateInfo {
                pool_size_count: pool_sizes.len() as u32,
                p_pool_sizes: pool_sizes.as_ptr(),
                max_sets: DESCRIPTOR_POOL_SIZE,
                flags: vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
                ..Default::default()
            };
            let descriptor_pool = device
                .create_descriptor_pool(&descriptor_pool_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let render_pass = Self::create_render_pass(&device)?;

            let mut backend = Self {
                _entry: None,
                instance,
                physical_device,
                device,
                owns_device: false,
                graphics_queue,
                allocator: Some(allocator),
                limits: properties.limits,
                extent: vk::Extent2D {
                    width: width.max(1),
                    height: height.max(1),
                },
                render_pass,
                target: None,
                framebuffer: vk::Framebuffer::null(),
                command_pool,
                frames: Vec::with_capacity(frames_in_flight),
                frame_slot: 0,
                frame_index: 0,
                is_recording: false,
                descriptor_pool,
                shader_modules: HashMap::new(),
                layouts: HashMap::new(),
                sets: HashMap::new(),
                pipelines: HashMap::new(),
                buffers: HashMap::new(),
                textures: HashMap::new(),
                next_id: 1,
            };
            // From here on Drop cleans up whatever was created.
            backend.create_frames(frames_in_flight)?;
            backend.create_target()?;

            log::info!(
                "Vulkan backend created on '{}' ({} frames in flight)",
                CStr::from_ptr(properties.device_name.as_ptr()).to_string_lossy(),
                frames_in_flight
            );
            Ok(backend)
        }
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Command buffer of the frame being recorded.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.frames[self.frame_slot].command_buffer
    }

    /// Offscreen colour image the frames render into.
    pub fn target_image(&self) -> Option<vk::Image> {
        self.target.as_ref().map(|t| t.image)
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.extent.width, self.extent.height)
    }

    fn find_queue_family(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Option<u32> {
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        queue_families
            .iter()
            .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|index| index as u32)
    }

    fn next_handle(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn allocator(&mut self) -> BackendResult<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| BackendError::InitializationFailed("Allocator not available".into()))
    }

    fn create_render_pass(device: &ash::Device) -> BackendResult<vk::RenderPass> {
        let attachment = vk::AttachmentDescription {
            format: COLOR_FORMAT,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ..Default::default()
        };
        let attachment_ref = vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        };
        let subpass = vk::SubpassDescription {
            pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
            color_attachment_count: 1,
            p_color_attachments: &attachment_ref,
            ..Default::default()
        };
        let render_pass_info = vk::RenderPassCreateInfo {
            attachment_count: 1,
            p_attachments: &attachment,
            subpass_count: 1,
            p_subpasses: &subpass,
            ..Default::default()
        };
        unsafe {
            device
                .create_render_pass(&render_pass_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))
        }
    }

    fn create_frames(&mut self, count: usize) -> BackendResult<()> {
        unsafe {
            let alloc_info = vk::CommandBufferAllocateInfo {
                command_pool: self.command_pool,
                level: vk::CommandBufferLevel::PRIMARY,
                command_buffer_count: count as u32,
                ..Default::default()
            };
            let command_buffers = self
                .device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let fence_info = vk::FenceCreateInfo {
                flags: vk::FenceCreateFlags::SIGNALED,
                ..Default::default()
            };
            for command_buffer in command_buffers {
                let fence = self
                    .device
                    .create_fence(&fence_info, None)
                    .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
                self.frames.push(FrameSlot {
                    command_buffer,
                    fence,
                });
            }
        }
        Ok(())
    }

    fn create_target(&mut self) -> BackendResult<()> {
        let extent = self.extent;
        let image = self.create_image(
            "offscreen target",
            extent.width,
            extent.height,
            COLOR_FORMAT,
            TextureKind::D2,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
        )?;
        let attachments = [image.view];
        let framebuffer_info = vk::FramebufferCreateInfo {
            render_pass: self.render_pass,
            attachment_count: attachments.len() as u32,
            p_attachments: attachments.as_ptr(),
            width: extent.width,
            height: extent.height,
            layers: 1,
            ..Default::default()
        };
        let framebuffer = unsafe { self.device.create_framebuffer(&framebuffer_info, None) };
        self.target = Some(image);
        self.framebuffer =
            framebuffer.map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
        Ok(())
    }

    fn create_image(
        &mut self,
        name: &str,
        width: u32,
        height: u32,
        format: vk::Format,
        kind: TextureKind,
        usage: vk::ImageUsageFlags,
    ) -> BackendResult<VkImage> {
        let (layers, flags, view_type) = match kind {
            TextureKind::D2 => (1, vk::ImageCreateFlags::empty(), vk::ImageViewType::TYPE_2D),
            TextureKind::Cube => (
                6,
                vk::ImageCreateFlags::CUBE_COMPATIBLE,
                vk::ImageViewType::CUBE,
            ),
        };
        unsafe {
            let image_info = vk::ImageCreateInfo {
                flags,
                image_type: vk::ImageType::TYPE_2D,
                extent: vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                },
                mip_levels: 1,
                array_layers: layers,
                format,
                tiling: vk::ImageTiling::OPTIMAL,
                initial_layout: vk::ImageLayout::UNDEFINED,
                usage,
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                samples: vk::SampleCountFlags::TYPE_1,
                ..Default::default()
            };
            let image = self
                .device
                .create_image(&image_info, None)
                .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))?;
            let requirements = self.device.get_image_memory_requirements(image);

            let allocation = match self.allocator().and_then(|allocator| {
                allocator
                    .allocate(&AllocationCreateDesc {
                        name,
                        requirements,
                        location: MemoryLocation::GpuOnly,
                        linear: false,
                        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                    })
                    .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))
            }) {
                Ok(allocation) => allocation,
                Err(e) => {
                    self.device.destroy_image(image, None);
                    return Err(e);
                }
            };

            let view_info = vk::ImageViewCreateInfo {
                image,
                view_type,
                format,
                subresource_range: color_range(layers),
                ..Default::default()
            };
            let view = self
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .and_then(|()| self.device.create_image_view(&view_info, None));
            match view {
                Ok(view) => Ok(VkImage {
                    image,
                    view,
                    allocation,
                }),
                Err(e) => {
                    self.device.destroy_image(image, None);
                    if let Ok(allocator) = self.allocator() {
                        let _ = allocator.free(allocation);
                    }
                    Err(BackendError::TextureCreationFailed(e.to_string()))
                }
            }
        }
    }

    fn create_host_buffer(
        &mut self,
        name: &str,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> BackendResult<VkBuffer> {
        unsafe {
            let buffer_info = vk::BufferCreateInfo {
                size,
                usage,
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                ..Default::default()
            };
            let buffer = self
                .device
                .create_buffer(&buffer_info, None)
                .map_err(|e| BackendError::BufferCreationFailed(e.to_string()))?;
            let requirements = self.device.get_buffer_memory_requirements(buffer);

            let allocation = match self.allocator().and_then(|allocator| {
                allocator
                    .allocate(&AllocationCreateDesc {
                        name,
                        requirements,
                        location: MemoryLocation::CpuToGpu,
                        linear: true,
                        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                    })
                    .map_err(|e| BackendError::BufferCreationFailed(e.to_string()))
            }) {
                Ok(allocation) => allocation,
                Err(e) => {
                    self.device.destroy_buffer(buffer, None);
                    return Err(e);
                }
            };

            if let Err(e) =
                self.device
                    .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
            {
                self.device.destroy_buffer(buffer, None);
                if let Ok(allocator) = self.allocator() {
                    let _ = allocator.free(allocation);
                }
                return Err(BackendError::BufferCreationFailed(e.to_string()));
            }
            Ok(VkBuffer { buffer, allocation })
        }
    }

    fn free_buffer(&mut self, buffer: VkBuffer) {
        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
        }
        if let Ok(allocator) = self.allocator() {
            let _ = allocator.free(buffer.allocation);
        }
    }

    fn free_image(&mut self, image: VkImage) {
        unsafe {
            self.device.destroy_image_view(image.view, None);
            self.device.destroy_image(image.image, None);
        }
        if let Ok(allocator) = self.allocator() {
            let _ = allocator.free(image.allocation);
        }
    }

    /// Record `record` into a temporary command buffer and wait for it.
    fn submit_once(&self, record: impl FnOnce(vk::CommandBuffer)) -> BackendResult<()> {
        unsafe {
            let alloc_info = vk::CommandBufferAllocateInfo {
                command_pool: self.command_pool,
                level: vk::CommandBufferLevel::PRIMARY,
                command_buffer_count: 1,
                ..Default::default()
            };
            let cmd = self
                .device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))?[0];

            let begin_info = vk::CommandBufferBeginInfo {
                flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                ..Default::default()
            };
            let result = self
                .device
                .begin_command_buffer(cmd, &begin_info)
                .and_then(|()| {
                    record(cmd);
                    self.device.end_command_buffer(cmd)
                })
                .and_then(|()| {
                    let submit_info = vk::SubmitInfo {
                        command_buffer_count: 1,
                        p_command_buffers: &cmd,
                        ..Default::default()
                    };
                    self.device
                        .queue_submit(self.graphics_queue, &[submit_info], vk::Fence::null())
                })
                .and_then(|()| self.device.queue_wait_idle(self.graphics_queue));

            self.device.free_command_buffers(self.command_pool, &[cmd]);
            result.map_err(|e| match e {
                vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
                _ => BackendError::TextureCreationFailed(e.to_string()),
            })
        }
    }

    fn upload_pixels(&mut self, image: vk::Image, desc: &TextureDescriptor, pixels: &[u8]) -> BackendResult<()> {
        let layers = match desc.kind {
            TextureKind::D2 => 1,
            TextureKind::Cube => 6,
        };
        let mut staging = self.create_host_buffer(
            "texture staging",
            pixels.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
        )?;
        match staging.allocation.mapped_slice_mut() {
            Some(mapped) => mapped[..pixels.len()].copy_from_slice(pixels),
            None => {
                self.free_buffer(staging);
                return Err(BackendError::TextureCreationFailed(
                    "staging buffer is not host visible".into(),
                ));
            }
        }

        let device = self.device.clone();
        let staging_buffer = staging.buffer;
        let result = self.submit_once(|cmd| unsafe {
            let to_transfer = vk::ImageMemoryBarrier {
                src_access_mask: vk::AccessFlags::empty(),
                dst_access_mask: vk::AccessFlags::TRANSFER_WRITE,
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                image,
                subresource_range: color_range(layers),
                ..Default::default()
            };
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );

            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: layers,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: desc.width,
                    height: desc.height,
                    depth: 1,
                },
            };
            device.cmd_copy_buffer_to_image(
                cmd,
                staging_buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );

            let to_shader = vk::ImageMemoryBarrier {
                src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
                dst_access_mask: vk::AccessFlags::SHADER_READ,
                old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                image,
                subresource_range: color_range(layers),
                ..Default::default()
            };
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_shader],
            );
        });
        self.free_buffer(staging);
        result
    }

    fn convert_format(format: TextureFormat) -> vk::Format {
        match format {
            TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            TextureFormat::Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
        }
    }

    fn convert_vertex_format(format: VertexFormat) -> vk::Format {
        match format {
            VertexFormat::Float32 => vk::Format::R32_SFLOAT,
            VertexFormat::Float32x2 => vk::Format::R32G32_SFLOAT,
            VertexFormat::Float32x3 => vk::Format::R32G32B32_SFLOAT,
            VertexFormat::Float32x4 | VertexFormat::Matrix4 => vk::Format::R32G32B32A32_SFLOAT,
            VertexFormat::Int8 => vk::Format::R8_SINT,
            VertexFormat::Uint8 => vk::Format::R8_UINT,
            VertexFormat::Int16 => vk::Format::R16_SINT,
            VertexFormat::Uint16 => vk::Format::R16_UINT,
            VertexFormat::Int32 => vk::Format::R32_SINT,
            VertexFormat::Uint32 => vk::Format::R32_UINT,
        }
    }

    fn convert_stage(stage: ShaderStage) -> vk::ShaderStageFlags {
        match stage {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Geometry => vk::ShaderStageFlags::GEOMETRY,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }

    fn convert_visibility(visibility: ShaderStageFlags) -> vk::ShaderStageFlags {
        let mut stage_flags = vk::ShaderStageFlags::empty();
        if visibility.contains(ShaderStageFlags::VERTEX) {
            stage_flags |= vk::ShaderStageFlags::VERTEX;
        }
        if visibility.contains(ShaderStageFlags::GEOMETRY) {
            stage_flags |= vk::ShaderStageFlags::GEOMETRY;
        }
        if visibility.contains(ShaderStageFlags::FRAGMENT) {
            stage_flags |= vk::ShaderStageFlags::FRAGMENT;
        }
        if visibility.contains(ShaderStageFlags::COMPUTE) {
            stage_flags |= vk::ShaderStageFlags::COMPUTE;
        }
        stage_flags
    }

    /// Matrices occupy four consecutive locations.
    fn vertex_attributes(desc: &PipelineDescriptor) -> Vec<vk::VertexInputAttributeDescription> {
        let mut attributes = Vec::with_capacity(desc.attributes.len());
        for attribute in &desc.attributes {
            let columns = match attribute.format {
                VertexFormat::Matrix4 => 4,
                _ => 1,
            };
            for column in 0..columns {
                attributes.push(vk::VertexInputAttributeDescription {
                    location: attribute.location + column,
                    binding: 0,
                    format: Self::convert_vertex_format(attribute.format),
                    offset: attribute.offset + column * 16,
                });
            }
        }
        attributes
    }

    fn create_graphics_pipeline(
        &self,
        desc: &PipelineDescriptor,
        layout: vk::PipelineLayout,
    ) -> BackendResult<vk::Pipeline> {
        let mut stages = Vec::with_capacity(desc.stages.len());
        for (stage, module) in &desc.stages {
            let module = self
                .shader_modules
                .get(&module.0)
                .copied()
                .ok_or(BackendError::InvalidHandle("shader module"))?;
            stages.push(vk::PipelineShaderStageCreateInfo {
                stage: Self::convert_stage(*stage),
                module,
                p_name: ENTRY_POINT.as_ptr(),
                ..Default::default()
            });
        }

        let bindings = [vk::VertexInputBindingDescription {
            binding: 0,
            stride: desc.attribute_stride,
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        let attributes = Self::vertex_attributes(desc);
        let binding_count = if attributes.is_empty() { 0 } else { 1 };
        let vertex_input = vk::PipelineVertexInputStateCreateInfo {
            vertex_binding_description_count: binding_count,
            p_vertex_binding_descriptions: bindings.as_ptr(),
            vertex_attribute_description_count: attributes.len() as u32,
            p_vertex_attribute_descriptions: attributes.as_ptr(),
            ..Default::default()
        };
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            ..Default::default()
        };
        let viewport_state = vk::PipelineViewportStateCreateInfo {
            viewport_count: 1,
            scissor_count: 1,
            ..Default::default()
        };
        let rasterization = vk::PipelineRasterizationStateCreateInfo {
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: match desc.cull_mode {
                CullMode::None => vk::CullModeFlags::NONE,
                CullMode::Front => vk::CullModeFlags::FRONT,
                CullMode::Back => vk::CullModeFlags::BACK,
            },
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            line_width: 1.0,
            ..Default::default()
        };
        let multisample = vk::PipelineMultisampleStateCreateInfo {
            rasterization_samples: vk::SampleCountFlags::TYPE_1,
            ..Default::default()
        };
        let blend_attachment = vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::TRUE,
            src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
            dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ZERO,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: vk::ColorComponentFlags::RGBA,
        };
        let color_blend = vk::PipelineColorBlendStateCreateInfo {
            attachment_count: 1,
            p_attachments: &blend_attachment,
            ..Default::default()
        };
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo {
            dynamic_state_count: dynamic_states.len() as u32,
            p_dynamic_states: dynamic_states.as_ptr(),
            ..Default::default()
        };

        let pipeline_info = vk::GraphicsPipelineCreateInfo {
            stage_count: stages.len() as u32,
            p_stages: stages.as_ptr(),
            p_vertex_input_state: &vertex_input,
            p_input_assembly_state: &input_assembly,
            p_viewport_state: &viewport_state,
            p_rasterization_state: &rasterization,
            p_multisample_state: &multisample,
            p_color_blend_state: &color_blend,
            p_dynamic_state: &dynamic_state,
            layout,
            render_pass: self.render_pass,
            subpass: 0,
            ..Default::default()
        };

        unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map(|pipelines| pipelines[0])
                .map_err(|(_, e)| BackendError::PipelineCreationFailed(e.to_string()))
        }
    }
}

fn color_range(layers: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: layers,
    }
}

impl RenderBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan Backend (headless)"
    }

    fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    /// Device offset alignment, never below 256.
    fn min_uniform_alignment(&self) -> u64 {
        self.limits.min_uniform_buffer_offset_alignment.max(256)
    }

    fn max_push_constant_size(&self) -> u32 {
        self.limits.max_push_constants_size
    }

    fn begin_frame(&mut self) -> BackendResult<usize> {
        if self.frame_index > 0 {
            self.frame_slot = (self.frame_slot + 1) % self.frames.len();
        }
        self.frame_index += 1;
        let frame = &self.frames[self.frame_slot];

        unsafe {
            self.device
                .wait_for_fences(&[frame.fence], true, u64::MAX)
                .map_err(|e| match e {
                    vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
                    _ => BackendError::InitializationFailed(e.to_string()),
                })?;
            self.device
                .reset_fences(&[frame.fence])
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
            self.device
                .reset_command_buffer(frame.command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let begin_info = vk::CommandBufferBeginInfo {
                flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                ..Default::default()
            };
            self.device
                .begin_command_buffer(frame.command_buffer, &begin_info)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let clear_values = [vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 1.0],
                },
            }];
            let render_area = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.extent,
            };
            let pass_info = vk::RenderPassBeginInfo {
                render_pass: self.render_pass,
                framebuffer: self.framebuffer,
                render_area,
                clear_value_count: clear_values.len() as u32,
                p_clear_values: clear_values.as_ptr(),
                ..Default::default()
            };
            self.device.cmd_begin_render_pass(
                frame.command_buffer,
                &pass_info,
                vk::SubpassContents::INLINE,
            );

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: self.extent.width as f32,
                height: self.extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            self.device
                .cmd_set_viewport(frame.command_buffer, 0, &[viewport]);
            self.device
                .cmd_set_scissor(frame.command_buffer, 0, &[render_area]);
        }
        self.is_recording = true;
        log::trace!(
            "Vulkan: begin frame {} (slot {})",
            self.frame_index,
            self.frame_slot
        );
        Ok(self.frame_slot)
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        if !self.is_recording {
            return Ok(());
        }
        self.is_recording = false;
        let frame = &self.frames[self.frame_slot];
        unsafe {
            self.device.cmd_end_render_pass(frame.command_buffer);
            self.device
                .end_command_buffer(frame.command_buffer)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let command_buffers = [frame.command_buffer];
            let submit_info = vk::SubmitInfo {
                command_buffer_count: 1,
                p_command_buffers: command_buffers.as_ptr(),
                ..Default::default()
            };
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], frame.fence)
                .map_err(|e| match e {
                    vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
                    _ => BackendError::InitializationFailed(e.to_string()),
                })?;
        }
        Ok(())
    }

    fn current_frame_slot(&self) -> usize {
        self.frame_slot
    }

    fn create_shader_stage(
        &mut self,
        stage: ShaderStage,
        bytecode: &[u8],
    ) -> BackendResult<ShaderModuleHandle> {
        let code = ash::util::read_spv(&mut Cursor::new(bytecode))
            .map_err(|e| BackendError::ShaderCreationFailed(format!("{stage:?}: {e}")))?;
        let module_info = vk::ShaderModuleCreateInfo {
            code_size: code.len() * 4,
            p_code: code.as_ptr(),
            ..Default::default()
        };
        let module = unsafe {
            self.device
                .create_shader_module(&module_info, None)
                .map_err(|e| BackendError::ShaderCreationFailed(e.to_string()))?
        };
        let id = self.next_handle();
        self.shader_modules.insert(id, module);
        Ok(ShaderModuleHandle(id))
    }

    fn destroy_shader_stage(&mut self, module: ShaderModuleHandle) {
        if let Some(module) = self.shader_modules.remove(&module.0) {
            unsafe {
                self.device.destroy_shader_module(module, None);
            }
        }
    }

    fn create_binding_layout(
        &mut self,
        scope: ShaderScope,
        entries: &[BindingLayoutEntry],
    ) -> BackendResult<BindingLayoutHandle> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = entries
            .iter()
            .map(|e| vk::DescriptorSetLayoutBinding {
                binding: e.binding,
                descriptor_type: match e.ty {
                    BindingType::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
                    BindingType::Sampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                },
                descriptor_count: e.count,
                stage_flags: Self::convert_visibility(e.visibility),
                ..Default::default()
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo {
            binding_count: bindings.len() as u32,
            p_bindings: bindings.as_ptr(),
            ..Default::default()
        };
        let layout = unsafe {
            self.device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(|e| BackendError::LayoutCreationFailed(e.to_string()))?
        };
        log::trace!("Vulkan: {scope:?} layout with {} bindings", bindings.len());

        let id = self.next_handle();
        self.layouts.insert(id, layout);
        Ok(BindingLayoutHandle(id))
    }

    fn destroy_binding_layout(&mut self, layout: BindingLayoutHandle) {
        if let Some(layout) = self.layouts.remove(&layout.0) {
            unsafe {
                self.device.destroy_descriptor_set_layout(layout, None);
            }
        }
    }

    fn create_pipeline(&mut self, desc: &PipelineDescriptor) -> BackendResult<PipelineHandle> {
        let mut set_layouts = Vec::with_capacity(desc.binding_layouts.len());
        for handle in &desc.binding_layouts {
            let layout = self
                .layouts
                .get(&handle.0)
                .copied()
                .ok_or(BackendError::InvalidHandle("binding layout"))?;
            set_layouts.push(layout);
        }
        let push_ranges: Vec<vk::PushConstantRange> = desc
            .push_constant_ranges
            .iter()
            .map(|r| vk::PushConstantRange {
                stage_flags: PUSH_CONSTANT_STAGES,
                offset: r.offset,
                size: r.size,
            })
            .collect();

        let layout_info = vk::PipelineLayoutCreateInfo {
            set_layout_count: set_layouts.len() as u32,
            p_set_layouts: set_layouts.as_ptr(),
            push_constant_range_count: push_ranges.len() as u32,
            p_push_constant_ranges: push_ranges.as_ptr(),
            ..Default::default()
        };
        let layout = unsafe {
            self.device
                .create_pipeline_layout(&layout_info, None)
                .map_err(|e| BackendError::PipelineCreationFailed(e.to_string()))?
        };

        let pipeline = match self.create_graphics_pipeline(desc, layout) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                unsafe {
                    self.device.destroy_pipeline_layout(layout, None);
                }
                return Err(e);
            }
        };
        log::debug!("Vulkan: created pipeline {:?}", desc.label);

        let id = self.next_handle();
        self.pipelines.insert(id, VkPipeline { pipeline, layout });
        Ok(PipelineHandle(id))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        if let Some(pipeline) = self.pipelines.remove(&pipeline.0) {
            unsafe {
                self.device.destroy_pipeline(pipeline.pipeline, None);
                self.device.destroy_pipeline_layout(pipeline.layout, None);
            }
        }
    }

    fn create_uniform_buffer(&mut self, size: u64) -> BackendResult<BufferHandle> {
        let buffer =
            self.create_host_buffer("uniform buffer", size, vk::BufferUsageFlags::UNIFORM_BUFFER)?;
        let id = self.next_handle();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let vk_buffer = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or(BackendError::InvalidHandle("buffer"))?;
        let mapped = vk_buffer
            .allocation
            .mapped_slice_mut()
            .ok_or_else(|| BackendError::BufferCreationFailed("buffer is not mapped".into()))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > mapped.len() {
            return Err(BackendError::OutOfBounds {
                offset,
                size: data.len() as u64,
            });
        }
        mapped[start..end].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(vk_buffer) = self.buffers.remove(&buffer.0) {
            self.free_buffer(vk_buffer);
        }
    }

    fn create_texture(
        &mut self,
        desc: &TextureDescriptor,
        pixels: &[u8],
    ) -> BackendResult<TextureHandle> {
        if pixels.len() != desc.data_size() {
            return Err(BackendError::TextureCreationFailed(format!(
                "expected {} bytes of pixel data, got {}",
                desc.data_size(),
                pixels.len()
            )));
        }
        let image = self.create_image(
            desc.label.as_deref().unwrap_or("texture"),
            desc.width,
            desc.height,
            Self::convert_format(desc.format),
            desc.kind,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        )?;
        if let Err(e) = self.upload_pixels(image.image, desc, pixels) {
            self.free_image(image);
            return Err(e);
        }

        let sampler_info = vk::SamplerCreateInfo {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode_u: vk::SamplerAddressMode::REPEAT,
            address_mode_v: vk::SamplerAddressMode::REPEAT,
            address_mode_w: vk::SamplerAddressMode::REPEAT,
            max_lod: vk::LOD_CLAMP_NONE,
            border_color: vk::BorderColor::FLOAT_OPAQUE_BLACK,
            ..Default::default()
        };
        let sampler = match unsafe { self.device.create_sampler(&sampler_info, None) } {
            Ok(sampler) => sampler,
            Err(e) => {
                self.free_image(image);
                return Err(BackendError::TextureCreationFailed(e.to_string()));
            }
        };

        let id = self.next_handle();
        self.textures.insert(id, VkTexture { image, sampler });
        Ok(TextureHandle(id))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(texture) = self.textures.remove(&texture.0) {
            unsafe {
                self.device.destroy_sampler(texture.sampler, None);
            }
            self.free_image(texture.image);
        }
    }

    fn allocate_binding_set(
        &mut self,
        layout: BindingLayoutHandle,
        frame_slot: usize,
    ) -> BackendResult<BindingSetHandle> {
        let layout = self
            .layouts
            .get(&layout.0)
            .copied()
            .ok_or(BackendError::InvalidHandle("binding layout"))?;
        let alloc_info = vk::DescriptorSetAllocateInfo {
            descriptor_pool: self.descriptor_pool,
            descriptor_set_count: 1,
            p_set_layouts: &layout,
            ..Default::default()
        };
        let set = unsafe {
            self.device
                .allocate_descriptor_sets(&alloc_info)
                .map_err(|e| match e {
                    vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                        BackendError::OutOfMemory
                    }
                    _ => BackendError::BindingSetAllocationFailed(e.to_string()),
                })?[0]
        };
        log::trace!("Vulkan: allocated binding set for frame slot {frame_slot}");
        let id = self.next_handle();
        self.sets.insert(id, set);
        Ok(BindingSetHandle(id))
    }

    fn free_binding_set(&mut self, set: BindingSetHandle) {
        if let Some(set) = self.sets.remove(&set.0) {
            unsafe {
                let _ = self.device.free_descriptor_sets(self.descriptor_pool, &[set]);
            }
        }
    }

    fn write_binding(
        &mut self,
        set: BindingSetHandle,
        slot: BindingSlot,
        resource: BindingResource,
    ) -> BackendResult<()> {
        let dst_set = self
            .sets
            .get(&set.0)
            .copied()
            .ok_or(BackendError::InvalidHandle("binding set"))?;

        match resource {
            BindingResource::UniformBuffer {
                buffer,
                offset,
                size,
            } => {
                let buffer = self
                    .buffers
                    .get(&buffer.0)
                    .ok_or(BackendError::InvalidHandle("buffer"))?;
                let buffer_info = vk::DescriptorBufferInfo {
                    buffer: buffer.buffer,
                    offset,
                    range: size,
                };
                let write = vk::WriteDescriptorSet {
                    dst_set,
                    dst_binding: slot.binding,
                    dst_array_element: slot.array_element,
                    descriptor_count: 1,
                    descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                    p_buffer_info: &buffer_info,
                    ..Default::default()
                };
                unsafe { self.device.update_descriptor_sets(&[write], &[]) };
            }
            BindingResource::Texture(texture) => {
                let texture = self
                    .textures
                    .get(&texture.0)
                    .ok_or(BackendError::InvalidHandle("texture"))?;
                let image_info = vk::DescriptorImageInfo {
                    sampler: texture.sampler,
                    image_view: texture.image.view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                };
                let write = vk::WriteDescriptorSet {
                    dst_set,
                    dst_binding: slot.binding,
                    dst_array_element: slot.array_element,
                    descriptor_count: 1,
                    descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    p_image_info: &image_info,
                    ..Default::default()
                };
                unsafe { self.device.update_descriptor_sets(&[write], &[]) };
            }
        }
        Ok(())
    }

    fn bind_binding_set(&mut self, pipeline: PipelineHandle, scope: ShaderScope, set: BindingSetHandle) {
        let (Some(pipeline), Some(&set), Some(first_set)) = (
            self.pipelines.get(&pipeline.0),
            self.sets.get(&set.0),
            scope.set_index(),
        ) else {
            log::warn!("Vulkan: ignoring bind of {set:?} at {scope:?} scope");
            return;
        };
        if !self.is_recording {
            return;
        }
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.frames[self.frame_slot].command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.layout,
                first_set,
                &[set],
                &[],
            );
        }
    }

    fn bind_pipeline(&mut self, pipeline: PipelineHandle) {
        let Some(pipeline) = self.pipelines.get(&pipeline.0) else {
            log::warn!("Vulkan: bind of unknown pipeline {pipeline:?}");
            return;
        };
        if !self.is_recording {
            return;
        }
        unsafe {
            self.device.cmd_bind_pipeline(
                self.frames[self.frame_slot].command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.pipeline,
            );
        }
    }

    fn push_constants(&mut self, pipeline: PipelineHandle, offset: u32, data: &[u8]) {
        let Some(pipeline) = self.pipelines.get(&pipeline.0) else {
            log::warn!("Vulkan: push constants for unknown pipeline {pipeline:?}");
            return;
        };
        if !self.is_recording {
            return;
        }
        unsafe {
            self.device.cmd_push_constants(
                self.frames[self.frame_slot].command_buffer,
                pipeline.layout,
                PUSH_CONSTANT_STAGES,
                offset,
                data,
            );
        }
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        if !self.is_recording {
            return;
        }
        unsafe {
            self.device.cmd_draw(
                self.frames[self.frame_slot].command_buffer,
                vertex_count,
                instance_count,
                0,
                0,
            );
        }
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        unsafe {
            self.device.device_wait_idle().map_err(|e| match e {
                vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
                _ => BackendError::InitializationFailed(e.to_string()),
            })
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            let buffers: Vec<VkBuffer> = self.buffers.drain().map(|(_, b)| b).collect();
            for buffer in buffers {
                self.free_buffer(buffer);
            }
            let textures: Vec<VkTexture> = self.textures.drain().map(|(_, t)| t).collect();
            for texture in textures {
                self.device.destroy_sampler(texture.sampler, None);
                self.free_image(texture.image);
            }
            if self.framebuffer != vk::Framebuffer::null() {
                self.device.destroy_framebuffer(self.framebuffer, None);
            }
            if let Some(target) = self.target.take() {
                self.free_image(target);
            }
            // The allocator must go before the device.
            drop(self.allocator.take());

            for (_, pipeline) in self.pipelines.drain() {
                self.device.destroy_pipeline(pipeline.pipeline, None);
                self.device.destroy_pipeline_layout(pipeline.layout, None);
            }
            for (_, layout) in self.layouts.drain() {
                self.device.destroy_descriptor_set_layout(layout, None);
            }
            for (_, module) in self.shader_modules.drain() {
                self.device.destroy_shader_module(module, None);
            }
            self.sets.clear();
            self.device.destroy_descriptor_pool(self.descriptor_pool, None);

            for frame in self.frames.drain(..) {
                self.device.destroy_fence(frame.fence, None);
            }
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_render_pass(self.render_pass, None);

            if self.owns_device {
                self.device.destroy_device(None);
                self.instance.destroy_instance(None);
            }
        }
    }
}
