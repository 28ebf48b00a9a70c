use std::{
    ffi::CString,
    io::Cursor,
    ptr::NonNull,
    sync::{Arc, Weak},
};

use arrayvec::ArrayVec;
use ash::vk;
use gpu_alloc::{GpuAllocator, MemoryBlock, Request};
use gpu_alloc_ash::AshMemoryDevice;
use parking_lot::Mutex;

use gatling_types::{
    markers, BufferDesc, BufferHandle, BufferUsage, CommandBufferHandle, DeviceFeatures,
    DeviceLimits, Extent3d, FenceHandle, ImageDesc, ImageHandle, ImageUsage, MemoryProps,
    PipelineHandle, SamplerDesc, SamplerHandle, ShaderHandle,
};

use crate::{
    conv,
    instance::{Adapter, InstanceShared},
    reflect::{self, ShaderReflection},
    store::Store,
    DeviceError, MAX_BOUND_IMAGES, MAX_TIMESTAMP_QUERIES,
};

pub(crate) struct DeviceShared {
    pub raw: ash::Device,
    #[allow(dead_code)]
    pub instance: Arc<InstanceShared>,
    pub raw_queue: vk::Queue,
    #[allow(dead_code)]
    pub family_index: u32,
    pub limits: DeviceLimits,
    pub features: DeviceFeatures,
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        unsafe { self.raw.destroy_device(None) };
    }
}

pub(crate) struct Buffer {
    pub raw: vk::Buffer,
    pub block: MemoryBlock<vk::DeviceMemory>,
    pub size: u64,
    #[allow(dead_code)]
    pub usage: BufferUsage,
    pub props: MemoryProps,
}

pub(crate) struct Image {
    pub raw: vk::Image,
    pub view: vk::ImageView,
    pub block: MemoryBlock<vk::DeviceMemory>,
    pub extent: Extent3d,
    #[allow(dead_code)]
    pub usage: ImageUsage,
    /// Layout and access the image is currently known to be in. Mutated
    /// only from command recording (implicit transitions).
    pub layout: vk::ImageLayout,
    pub access: vk::AccessFlags,
}

pub(crate) struct Sampler {
    pub raw: vk::Sampler,
}

pub(crate) struct Shader {
    pub raw: vk::ShaderModule,
    pub reflection: Arc<ShaderReflection>,
}

pub(crate) struct Pipeline {
    pub raw: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub set_layout: vk::DescriptorSetLayout,
    pub pool: vk::DescriptorPool,
    pub set: vk::DescriptorSet,
    pub reflection: Arc<ShaderReflection>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum RecordState {
    Initial,
    Recording,
    Executable,
}

pub(crate) struct CommandBuffer {
    pub raw: vk::CommandBuffer,
    /// Non-owning: the command buffer must not keep its device alive.
    /// Submission verifies this still resolves.
    pub device: Weak<DeviceShared>,
    pub state: RecordState,
    pub bound_pipeline: Option<PipelineHandle>,
    /// Images bound by the latest `cmd_update_bindings`, with the layout
    /// and access the next dispatch requires them in.
    pub bound_images: ArrayVec<(ImageHandle, vk::ImageLayout, vk::AccessFlags), MAX_BOUND_IMAGES>,
}

pub(crate) struct Fence {
    pub raw: vk::Fence,
}

/// A logical compute device: owns its queue, command pool, query pool,
/// memory allocator and the stores bundle behind every resource handle.
pub struct Device {
    pub(crate) shared: Arc<DeviceShared>,
    pub(crate) mem_allocator: Mutex<GpuAllocator<vk::DeviceMemory>>,
    pub(crate) cmd_pool: vk::CommandPool,
    pub(crate) query_pool: vk::QueryPool,
    pub(crate) buffers: Store<markers::Buffer, Buffer>,
    pub(crate) images: Store<markers::Image, Image>,
    pub(crate) samplers: Store<markers::Sampler, Sampler>,
    pub(crate) shaders: Store<markers::Shader, Shader>,
    pub(crate) pipelines: Store<markers::Pipeline, Pipeline>,
    pub(crate) command_buffers: Store<markers::CommandBuffer, CommandBuffer>,
    pub(crate) fences: Store<markers::Fence, Fence>,
}

impl Device {
    pub(crate) fn open(adapter: &Adapter) -> Result<Self, DeviceError> {
        let instance = &adapter.shared.raw;

        let queue_priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(adapter.family_index)
            .queue_priorities(&queue_priorities);
        let queue_infos = [queue_info.build()];

        let enabled_features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(true)
            .shader_int16(true);

        let mut extension_ptrs = Vec::new();
        let mut shader_clock =
            vk::PhysicalDeviceShaderClockFeaturesKHR::builder().shader_subgroup_clock(true);
        let mut device_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_features(&enabled_features);
        if adapter.features.contains(DeviceFeatures::SHADER_CLOCK) {
            extension_ptrs.push(vk::KhrShaderClockFn::name().as_ptr());
            device_info = device_info.push_next(&mut shader_clock);
        }
        if adapter.features.contains(DeviceFeatures::DEBUG_PRINTF) {
            extension_ptrs.push(vk::KhrShaderNonSemanticInfoFn::name().as_ptr());
        }
        device_info = device_info.enabled_extension_names(&extension_ptrs);

        let raw = unsafe { instance.create_device(adapter.raw, &device_info, None) }?;
        let raw_queue = unsafe { raw.get_device_queue(adapter.family_index, 0) };

        let cmd_pool = unsafe {
            raw.create_command_pool(
                &vk::CommandPoolCreateInfo::builder()
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                    .queue_family_index(adapter.family_index),
                None,
            )
        }?;
        let query_pool = unsafe {
            raw.create_query_pool(
                &vk::QueryPoolCreateInfo::builder()
                    .query_type(vk::QueryType::TIMESTAMP)
                    .query_count(MAX_TIMESTAMP_QUERIES),
                None,
            )
        }?;

        let alloc_props = unsafe {
            gpu_alloc_ash::device_properties(instance, vk::API_VERSION_1_1, adapter.raw)
        }?;
        let mem_allocator = GpuAllocator::new(gpu_alloc::Config::i_am_prototyping(), alloc_props);

        let shared = Arc::new(DeviceShared {
            raw,
            instance: Arc::clone(&adapter.shared),
            raw_queue,
            family_index: adapter.family_index,
            limits: adapter.limits,
            features: adapter.features,
        });

        Ok(Self {
            shared,
            mem_allocator: Mutex::new(mem_allocator),
            cmd_pool,
            query_pool,
            buffers: Store::new("buffer"),
            images: Store::new("image"),
            samplers: Store::new("sampler"),
            shaders: Store::new("shader"),
            pipelines: Store::new("pipeline"),
            command_buffers: Store::new("command buffer"),
            fences: Store::new("fence"),
        })
    }

    pub fn features(&self) -> DeviceFeatures {
        self.shared.features
    }

    pub fn limits(&self) -> DeviceLimits {
        self.shared.limits
    }

    // ----- buffers -------------------------------------------------------

    pub fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<BufferHandle, DeviceError> {
        let raw = unsafe {
            self.shared.raw.create_buffer(
                &vk::BufferCreateInfo::builder()
                    .size(desc.size.max(4))
                    .usage(conv::buffer_usage(desc.usage))
                    .sharing_mode(vk::SharingMode::EXCLUSIVE),
                None,
            )
        }?;
        let requirements = unsafe { self.shared.raw.get_buffer_memory_requirements(raw) };
        let request = Request {
            size: requirements.size,
            align_mask: requirements.alignment.max(1) - 1,
            usage: conv::memory_usage(desc.memory),
            memory_types: requirements.memory_type_bits,
        };
        let block = match unsafe {
            self.mem_allocator
                .lock()
                .alloc(AshMemoryDevice::wrap(&self.shared.raw), request)
        } {
            Ok(block) => block,
            Err(e) => {
                unsafe { self.shared.raw.destroy_buffer(raw, None) };
                return Err(e.into());
            }
        };
        unsafe {
            self.shared
                .raw
                .bind_buffer_memory(raw, *block.memory(), block.offset())
        }?;
        if let Some(label) = desc.label {
            log::trace!("created buffer `{label}` ({} bytes)", desc.size);
        }
        Ok(self.buffers.insert(Buffer {
            raw,
            block,
            size: desc.size,
            usage: desc.usage,
            props: desc.memory,
        }))
    }

    pub fn destroy_buffer(&mut self, handle: BufferHandle) -> Result<(), DeviceError> {
        let buffer = self.buffers.remove(handle)?;
        unsafe {
            self.shared.raw.destroy_buffer(buffer.raw, None);
            self.mem_allocator
                .lock()
                .dealloc(AshMemoryDevice::wrap(&self.shared.raw), buffer.block);
        }
        Ok(())
    }

    /// Copy `data` into a host-visible buffer at `offset`.
    pub fn write_buffer(
        &mut self,
        handle: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let buffer = self.buffers.get_mut(handle)?;
        unsafe {
            buffer
                .block
                .write_bytes(AshMemoryDevice::wrap(&self.shared.raw), offset, data)
        }?;
        Ok(())
    }

    /// Copy out of a host-visible buffer at `offset`.
    pub fn read_buffer(
        &mut self,
        handle: BufferHandle,
        offset: u64,
        out: &mut [u8],
    ) -> Result<(), DeviceError> {
        let buffer = self.buffers.get_mut(handle)?;
        unsafe {
            buffer
                .block
                .read_bytes(AshMemoryDevice::wrap(&self.shared.raw), offset, out)
        }?;
        Ok(())
    }

    /// Map the whole buffer. Mapping is exclusive until
    /// [`Self::unmap_buffer`].
    pub fn map_buffer(&mut self, handle: BufferHandle) -> Result<NonNull<u8>, DeviceError> {
        let buffer = self.buffers.get_mut(handle)?;
        let size = buffer.size as usize;
        let ptr = unsafe {
            buffer
                .block
                .map(AshMemoryDevice::wrap(&self.shared.raw), 0, size)
        }?;
        Ok(ptr)
    }

    pub fn unmap_buffer(&mut self, handle: BufferHandle) -> Result<(), DeviceError> {
        let buffer = self.buffers.get_mut(handle)?;
        unsafe {
            buffer.block.unmap(AshMemoryDevice::wrap(&self.shared.raw));
        }
        Ok(())
    }

    pub fn flush_buffer(
        &mut self,
        handle: BufferHandle,
        offset: u64,
        size: u64,
    ) -> Result<(), DeviceError> {
        if let Some(range) = self.mapped_range(handle, offset, size)? {
            unsafe { self.shared.raw.flush_mapped_memory_ranges(&[range]) }?;
        }
        Ok(())
    }

    pub fn invalidate_buffer(
        &mut self,
        handle: BufferHandle,
        offset: u64,
        size: u64,
    ) -> Result<(), DeviceError> {
        if let Some(range) = self.mapped_range(handle, offset, size)? {
            unsafe { self.shared.raw.invalidate_mapped_memory_ranges(&[range]) }?;
        }
        Ok(())
    }

    /// Range rounded to the non-coherent atom size, or `None` when the
    /// memory is coherent and no flush is needed.
    fn mapped_range(
        &mut self,
        handle: BufferHandle,
        offset: u64,
        size: u64,
    ) -> Result<Option<vk::MappedMemoryRange>, DeviceError> {
        let atom = self.shared.limits.non_coherent_atom_size.max(1);
        let buffer = self.buffers.get(handle)?;
        if buffer.props.contains(MemoryProps::HOST_COHERENT) {
            return Ok(None);
        }
        let begin = (buffer.block.offset() + offset) / atom * atom;
        let end = (buffer.block.offset() + offset + size + atom - 1) / atom * atom;
        let end = end.min(buffer.block.offset() + buffer.block.size());
        Ok(Some(
            vk::MappedMemoryRange::builder()
                .memory(*buffer.block.memory())
                .offset(begin)
                .size(end - begin)
                .build(),
        ))
    }

    // ----- images and samplers ------------------------------------------

    pub fn create_image(&mut self, desc: &ImageDesc<'_>) -> Result<ImageHandle, DeviceError> {
        let is_3d = desc.extent.depth > 1;
        let tiling = conv::image_tiling(desc.usage);
        let format = conv::image_format(desc.format);
        let raw = unsafe {
            self.shared.raw.create_image(
                &vk::ImageCreateInfo::builder()
                    .image_type(if is_3d {
                        vk::ImageType::TYPE_3D
                    } else {
                        vk::ImageType::TYPE_2D
                    })
                    .format(format)
                    .extent(vk::Extent3D {
                        width: desc.extent.width,
                        height: desc.extent.height,
                        depth: desc.extent.depth.max(1),
                    })
                    .mip_levels(1)
                    .array_layers(1)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .tiling(tiling)
                    .usage(conv::image_usage(desc.usage))
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .initial_layout(vk::ImageLayout::UNDEFINED),
                None,
            )
        }?;
        let requirements = unsafe { self.shared.raw.get_image_memory_requirements(raw) };
        let usage = if tiling == vk::ImageTiling::LINEAR {
            gpu_alloc::UsageFlags::HOST_ACCESS | gpu_alloc::UsageFlags::DOWNLOAD
        } else {
            gpu_alloc::UsageFlags::FAST_DEVICE_ACCESS
        };
        let request = Request {
            size: requirements.size,
            align_mask: requirements.alignment.max(1) - 1,
            usage,
            memory_types: requirements.memory_type_bits,
        };
        let block = match unsafe {
            self.mem_allocator
                .lock()
                .alloc(AshMemoryDevice::wrap(&self.shared.raw), request)
        } {
            Ok(block) => block,
            Err(e) => {
                unsafe { self.shared.raw.destroy_image(raw, None) };
                return Err(e.into());
            }
        };
        unsafe {
            self.shared
                .raw
                .bind_image_memory(raw, *block.memory(), block.offset())
        }?;
        let view = unsafe {
            self.shared.raw.create_image_view(
                &vk::ImageViewCreateInfo::builder()
                    .image(raw)
                    .view_type(if is_3d {
                        vk::ImageViewType::TYPE_3D
                    } else {
                        vk::ImageViewType::TYPE_2D
                    })
                    .format(format)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    }),
                None,
            )
        }?;
        if let Some(label) = desc.label {
            log::trace!(
                "created image `{label}` ({}x{}x{})",
                desc.extent.width,
                desc.extent.height,
                desc.extent.depth
            );
        }
        Ok(self.images.insert(Image {
            raw,
            view,
            block,
            extent: desc.extent,
            usage: desc.usage,
            layout: vk::ImageLayout::UNDEFINED,
            access: vk::AccessFlags::empty(),
        }))
    }

    pub fn destroy_image(&mut self, handle: ImageHandle) -> Result<(), DeviceError> {
        let image = self.images.remove(handle)?;
        unsafe {
            self.shared.raw.destroy_image_view(image.view, None);
            self.shared.raw.destroy_image(image.raw, None);
            self.mem_allocator
                .lock()
                .dealloc(AshMemoryDevice::wrap(&self.shared.raw), image.block);
        }
        Ok(())
    }

    pub fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerHandle, DeviceError> {
        // Any clamp-to-black axis selects the transparent-black border;
        // the address modes themselves stay per-axis.
        let anisotropy = desc
            .anisotropy
            .filter(|_| self.shared.features.contains(DeviceFeatures::SAMPLER_ANISOTROPY));
        let raw = unsafe {
            self.shared.raw.create_sampler(
                &vk::SamplerCreateInfo::builder()
                    .mag_filter(conv::filter(desc.mag_filter))
                    .min_filter(conv::filter(desc.min_filter))
                    .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
                    .address_mode_u(conv::address_mode(desc.address_u))
                    .address_mode_v(conv::address_mode(desc.address_v))
                    .address_mode_w(conv::address_mode(desc.address_w))
                    .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK)
                    .anisotropy_enable(anisotropy.is_some())
                    .max_anisotropy(anisotropy.unwrap_or(1.0))
                    .min_lod(0.0)
                    .max_lod(vk::LOD_CLAMP_NONE),
                None,
            )
        }?;
        Ok(self.samplers.insert(Sampler { raw }))
    }

    pub fn destroy_sampler(&mut self, handle: SamplerHandle) -> Result<(), DeviceError> {
        let sampler = self.samplers.remove(handle)?;
        unsafe { self.shared.raw.destroy_sampler(sampler.raw, None) };
        Ok(())
    }

    // ----- shaders and pipelines ----------------------------------------

    pub fn create_shader(&mut self, spirv: &[u8]) -> Result<ShaderHandle, DeviceError> {
        let reflection = Arc::new(reflect::reflect_spirv(spirv)?);
        let words = ash::util::read_spv(&mut Cursor::new(spirv))
            .map_err(|e| DeviceError::InvalidSpirv(e.to_string()))?;
        let raw = unsafe {
            self.shared
                .raw
                .create_shader_module(&vk::ShaderModuleCreateInfo::builder().code(&words), None)
        }?;
        Ok(self.shaders.insert(Shader { raw, reflection }))
    }

    pub fn destroy_shader(&mut self, handle: ShaderHandle) -> Result<(), DeviceError> {
        let shader = self.shaders.remove(handle)?;
        unsafe { self.shared.raw.destroy_shader_module(shader.raw, None) };
        Ok(())
    }

    pub fn shader_reflection(&self, handle: ShaderHandle) -> Result<&ShaderReflection, DeviceError> {
        Ok(&self.shaders.get(handle)?.reflection)
    }

    /// Build a compute pipeline from a shader: descriptor-set layout and
    /// pool from the reflected bindings, a descriptor set, and a pipeline
    /// layout with one push-constant range sized from the reflected
    /// block. All five objects are owned by the pipeline.
    pub fn create_pipeline(&mut self, shader: ShaderHandle) -> Result<PipelineHandle, DeviceError> {
        let (module, reflection) = {
            let shader = self.shaders.get(shader)?;
            (shader.raw, Arc::clone(&shader.reflection))
        };
        if reflection.push_constant_size > self.shared.limits.max_push_constant_size {
            return Err(DeviceError::LimitReached(
                "reflected push-constant block exceeds the device limit",
            ));
        }
        let device = &self.shared.raw;

        let dsl_bindings: Vec<vk::DescriptorSetLayoutBinding> = reflection
            .bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(conv::descriptor_type(b.kind))
                    .descriptor_count(b.count)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
                    .build()
            })
            .collect();
        let set_layout = unsafe {
            device.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::builder().bindings(&dsl_bindings),
                None,
            )
        }?;

        let mut pool_sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for binding in &reflection.bindings {
            let ty = conv::descriptor_type(binding.kind);
            match pool_sizes.iter_mut().find(|s| s.ty == ty) {
                Some(size) => size.descriptor_count += binding.count,
                None => pool_sizes.push(vk::DescriptorPoolSize {
                    ty,
                    descriptor_count: binding.count,
                }),
            }
        }
        if pool_sizes.is_empty() {
            pool_sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 1,
            });
        }
        let pool = unsafe {
            device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::builder()
                    .max_sets(1)
                    .pool_sizes(&pool_sizes),
                None,
            )
        }?;
        let set_layouts = [set_layout];
        let set = unsafe {
            device.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::builder()
                    .descriptor_pool(pool)
                    .set_layouts(&set_layouts),
            )
        }?[0];

        let push_ranges = [vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(reflection.push_constant_size.max(4))
            .build()];
        let mut layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        if reflection.push_constant_size > 0 {
            layout_info = layout_info.push_constant_ranges(&push_ranges);
        }
        let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }?;

        let entry_point = CString::new("main").unwrap();
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entry_point);
        let create_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage.build())
            .layout(layout);
        let raw = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[create_info.build()], None)
        }
        .map_err(|(_, e)| e)?[0];

        Ok(self.pipelines.insert(Pipeline {
            raw,
            layout,
            set_layout,
            pool,
            set,
            reflection,
        }))
    }

    pub fn destroy_pipeline(&mut self, handle: PipelineHandle) -> Result<(), DeviceError> {
        let pipeline = self.pipelines.remove(handle)?;
        release_pipeline(&self.shared.raw, pipeline);
        Ok(())
    }

    // ----- command buffers, fences and submission -----------------------

    pub fn create_command_buffer(&mut self) -> Result<CommandBufferHandle, DeviceError> {
        let raw = unsafe {
            self.shared.raw.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::builder()
                    .command_pool(self.cmd_pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1),
            )
        }?[0];
        Ok(self.command_buffers.insert(CommandBuffer {
            raw,
            device: Arc::downgrade(&self.shared),
            state: RecordState::Initial,
            bound_pipeline: None,
            bound_images: ArrayVec::new(),
        }))
    }

    pub fn destroy_command_buffer(
        &mut self,
        handle: CommandBufferHandle,
    ) -> Result<(), DeviceError> {
        let cb = self.command_buffers.remove(handle)?;
        unsafe { self.shared.raw.free_command_buffers(self.cmd_pool, &[cb.raw]) };
        Ok(())
    }

    pub fn create_fence(&mut self) -> Result<FenceHandle, DeviceError> {
        let raw = unsafe {
            self.shared
                .raw
                .create_fence(&vk::FenceCreateInfo::builder(), None)
        }?;
        Ok(self.fences.insert(Fence { raw }))
    }

    pub fn destroy_fence(&mut self, handle: FenceHandle) -> Result<(), DeviceError> {
        let fence = self.fences.remove(handle)?;
        unsafe { self.shared.raw.destroy_fence(fence.raw, None) };
        Ok(())
    }

    /// Submit one recorded command buffer; `fence` is signalled strictly
    /// after the GPU drained every command in it.
    pub fn submit(
        &mut self,
        cmd: CommandBufferHandle,
        fence: FenceHandle,
    ) -> Result<(), DeviceError> {
        let cb = self.command_buffers.get(cmd)?;
        let owner = cb.device.upgrade().ok_or(DeviceError::WrongDevice)?;
        if !Arc::ptr_eq(&owner, &self.shared) {
            return Err(DeviceError::WrongDevice);
        }
        if cb.state != RecordState::Executable {
            return Err(DeviceError::RecordState("submit of an unrecorded buffer"));
        }
        let fence_raw = self.fences.get(fence)?.raw;

        let command_buffers = [cb.raw];
        let submit = vk::SubmitInfo::builder().command_buffers(&command_buffers);
        profiling::scope!("vkQueueSubmit");
        unsafe {
            self.shared
                .raw
                .queue_submit(self.shared.raw_queue, &[submit.build()], fence_raw)
        }?;
        Ok(())
    }

    /// Block until the fence signals. A timeout return is treated as a
    /// spurious wakeup and waited again.
    pub fn wait_fence(&self, fence: FenceHandle) -> Result<(), DeviceError> {
        let raw = self.fences.get(fence)?.raw;
        loop {
            match unsafe {
                self.shared
                    .raw
                    .wait_for_fences(&[raw], true, 1_000_000_000)
            } {
                Ok(()) => return Ok(()),
                Err(vk::Result::TIMEOUT) => {
                    log::trace!("fence wait timed out, waiting again");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn reset_fence(&mut self, fence: FenceHandle) -> Result<(), DeviceError> {
        let raw = self.fences.get(fence)?.raw;
        unsafe { self.shared.raw.reset_fences(&[raw]) }?;
        Ok(())
    }
}

pub(crate) fn release_pipeline(device: &ash::Device, pipeline: Pipeline) {
    unsafe {
        device.destroy_pipeline(pipeline.raw, None);
        device.destroy_pipeline_layout(pipeline.layout, None);
        // Destroying the pool frees the set.
        device.destroy_descriptor_pool(pipeline.pool, None);
        device.destroy_descriptor_set_layout(pipeline.set_layout, None);
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let device = &self.shared.raw;
        let leaked = self.buffers.len()
            + self.images.len()
            + self.samplers.len()
            + self.shaders.len()
            + self.pipelines.len();
        if leaked > 0 {
            log::debug!("device dropped with {leaked} live resources, reclaiming");
        }

        // The host model is cooperative; nothing can be in flight when
        // the owner lets go of the device, but the driver disagrees loudly
        // if we free in the wrong order, so: resources, pools, allocator.
        unsafe {
            let _ = device.device_wait_idle();

            let mut allocator = self.mem_allocator.lock();
            for buffer in self.buffers.drain_all() {
                device.destroy_buffer(buffer.raw, None);
                allocator.dealloc(AshMemoryDevice::wrap(device), buffer.block);
            }
            for image in self.images.drain_all() {
                device.destroy_image_view(image.view, None);
                device.destroy_image(image.raw, None);
                allocator.dealloc(AshMemoryDevice::wrap(device), image.block);
            }
            for sampler in self.samplers.drain_all() {
                device.destroy_sampler(sampler.raw, None);
            }
            for shader in self.shaders.drain_all() {
                device.destroy_shader_module(shader.raw, None);
            }
            for pipeline in self.pipelines.drain_all() {
                release_pipeline(device, pipeline);
            }
            for fence in self.fences.drain_all() {
                device.destroy_fence(fence.raw, None);
            }
            let raw_cbs: Vec<vk::CommandBuffer> = self
                .command_buffers
                .drain_all()
                .into_iter()
                .map(|cb| cb.raw)
                .collect();
            if !raw_cbs.is_empty() {
                device.free_command_buffers(self.cmd_pool, &raw_cbs);
            }
            device.destroy_command_pool(self.cmd_pool, None);
            device.destroy_query_pool(self.query_pool, None);
            allocator.cleanup(AshMemoryDevice::wrap(device));
        }
    }
}
