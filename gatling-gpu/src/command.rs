//! Command recording.
//!
//! All recording goes through the owning device, referencing the command
//! buffer by handle. Descriptor updates are a merge walk over the
//! pipeline's reflected bindings (sorted at reflection time) and the
//! caller's slots (sorted into bounded scratch here). Image layout
//! transitions are implicit: binding an image records the layout the next
//! dispatch needs, and the dispatch emits barriers for whatever differs
//! from the tracked state.

use arrayvec::ArrayVec;
use ash::vk;

use gatling_types::{
    markers, Bindings, BufferHandle, CommandBufferHandle, ImageHandle, PipelineHandle,
};

use crate::{
    conv,
    device::{CommandBuffer, Device, Image, RecordState},
    reflect::BindingKind,
    store::Store,
    DeviceError, MAX_BOUND_IMAGES, MAX_DESCRIPTOR_WRITES, MAX_TIMESTAMP_QUERIES,
};

/// Borrow the command buffer through its store field only, so the rest of
/// the device stays accessible while it is held.
fn recording(
    store: &mut Store<markers::CommandBuffer, CommandBuffer>,
    cmd: CommandBufferHandle,
) -> Result<&mut CommandBuffer, DeviceError> {
    let cb = store.get_mut(cmd)?;
    if cb.state != RecordState::Recording {
        return Err(DeviceError::RecordState("command issued outside begin/end"));
    }
    Ok(cb)
}

const FULL_COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

/// Scratch description of one descriptor write; the raw write structs are
/// assembled only after the info arrays stop growing, so the pointers
/// they embed stay valid.
struct PendingWrite {
    binding: u32,
    index: u32,
    ty: vk::DescriptorType,
    buffer_info: Option<usize>,
    image_info: Option<usize>,
}

impl Device {
    pub fn begin_commands(&mut self, cmd: CommandBufferHandle) -> Result<(), DeviceError> {
        let cb = self.command_buffers.get_mut(cmd)?;
        if cb.state == RecordState::Recording {
            return Err(DeviceError::RecordState("begin on a recording buffer"));
        }
        unsafe {
            self.shared
                .raw
                .reset_command_buffer(cb.raw, vk::CommandBufferResetFlags::empty())?;
            self.shared.raw.begin_command_buffer(
                cb.raw,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
        }
        cb.state = RecordState::Recording;
        cb.bound_pipeline = None;
        cb.bound_images.clear();
        Ok(())
    }

    pub fn end_commands(&mut self, cmd: CommandBufferHandle) -> Result<(), DeviceError> {
        let cb = recording(&mut self.command_buffers, cmd)?;
        unsafe { self.shared.raw.end_command_buffer(cb.raw) }?;
        cb.state = RecordState::Executable;
        Ok(())
    }

    pub fn cmd_bind_pipeline(
        &mut self,
        cmd: CommandBufferHandle,
        pipeline: PipelineHandle,
    ) -> Result<(), DeviceError> {
        let raw_pipeline = self.pipelines.get(pipeline)?.raw;
        let cb = recording(&mut self.command_buffers, cmd)?;
        unsafe {
            self.shared
                .raw
                .cmd_bind_pipeline(cb.raw, vk::PipelineBindPoint::COMPUTE, raw_pipeline)
        };
        cb.bound_pipeline = Some(pipeline);
        Ok(())
    }

    /// Match the caller's slots against the bound pipeline's reflected
    /// bindings and write the pipeline's descriptor set. Every reflected
    /// slot must be supplied; anything missing or misaligned is a
    /// `BindingMismatch`.
    pub fn cmd_update_bindings(
        &mut self,
        cmd: CommandBufferHandle,
        bindings: &Bindings<'_>,
    ) -> Result<(), DeviceError> {
        let min_align = self.shared.limits.min_storage_buffer_offset_alignment.max(1);
        let cb = self.command_buffers.get_mut(cmd)?;
        if cb.state != RecordState::Recording {
            return Err(DeviceError::RecordState(
                "command issued outside begin/end",
            ));
        }
        let pipeline_handle = cb
            .bound_pipeline
            .ok_or(DeviceError::RecordState("update_bindings without a pipeline"))?;
        let pipeline = self.pipelines.get(pipeline_handle)?;

        let mut buffer_slots: ArrayVec<_, MAX_DESCRIPTOR_WRITES> = ArrayVec::new();
        buffer_slots
            .try_extend_from_slice(bindings.buffers)
            .map_err(|_| DeviceError::LimitReached("MAX_DESCRIPTOR_WRITES"))?;
        buffer_slots.sort_unstable_by_key(|s| (s.binding, s.index));
        let mut image_slots: ArrayVec<_, MAX_DESCRIPTOR_WRITES> = ArrayVec::new();
        image_slots
            .try_extend_from_slice(bindings.images)
            .map_err(|_| DeviceError::LimitReached("MAX_DESCRIPTOR_WRITES"))?;
        image_slots.sort_unstable_by_key(|s| (s.binding, s.index));
        let mut sampler_slots: ArrayVec<_, MAX_DESCRIPTOR_WRITES> = ArrayVec::new();
        sampler_slots
            .try_extend_from_slice(bindings.samplers)
            .map_err(|_| DeviceError::LimitReached("MAX_DESCRIPTOR_WRITES"))?;
        sampler_slots.sort_unstable_by_key(|s| (s.binding, s.index));

        let mut buffer_infos: ArrayVec<vk::DescriptorBufferInfo, MAX_DESCRIPTOR_WRITES> =
            ArrayVec::new();
        let mut image_infos: ArrayVec<vk::DescriptorImageInfo, MAX_DESCRIPTOR_WRITES> =
            ArrayVec::new();
        let mut pending: ArrayVec<PendingWrite, MAX_DESCRIPTOR_WRITES> = ArrayVec::new();
        cb.bound_images.clear();

        let (mut bc, mut ic, mut sc) = (0usize, 0usize, 0usize);
        for reflected in &pipeline.reflection.bindings {
            for index in 0..reflected.count {
                let key = (reflected.binding, index);
                let ty = conv::descriptor_type(reflected.kind);
                let mut write = PendingWrite {
                    binding: reflected.binding,
                    index,
                    ty,
                    buffer_info: None,
                    image_info: None,
                };
                match reflected.kind {
                    BindingKind::UniformBuffer | BindingKind::StorageBuffer => {
                        while bc < buffer_slots.len()
                            && (buffer_slots[bc].binding, buffer_slots[bc].index) < key
                        {
                            bc += 1;
                        }
                        let slot = buffer_slots
                            .get(bc)
                            .filter(|s| (s.binding, s.index) == key)
                            .ok_or(DeviceError::BindingMismatch {
                                binding: reflected.binding,
                                index,
                                reason: "no buffer supplied for this slot",
                            })?;
                        if reflected.kind == BindingKind::StorageBuffer
                            && slot.offset % min_align != 0
                        {
                            return Err(DeviceError::BindingMismatch {
                                binding: reflected.binding,
                                index,
                                reason: "offset violates the storage-buffer alignment",
                            });
                        }
                        let buffer = self.buffers.get(slot.buffer)?;
                        if slot.offset + slot.size > buffer.size {
                            return Err(DeviceError::BindingMismatch {
                                binding: reflected.binding,
                                index,
                                reason: "bound range exceeds the buffer",
                            });
                        }
                        buffer_infos
                            .try_push(vk::DescriptorBufferInfo {
                                buffer: buffer.raw,
                                offset: slot.offset,
                                range: if slot.size == 0 {
                                    vk::WHOLE_SIZE
                                } else {
                                    slot.size
                                },
                            })
                            .map_err(|_| DeviceError::LimitReached("MAX_DESCRIPTOR_WRITES"))?;
                        write.buffer_info = Some(buffer_infos.len() - 1);
                    }
                    BindingKind::SampledImage | BindingKind::StorageImage => {
                        while ic < image_slots.len()
                            && (image_slots[ic].binding, image_slots[ic].index) < key
                        {
                            ic += 1;
                        }
                        let slot = image_slots
                            .get(ic)
                            .filter(|s| (s.binding, s.index) == key)
                            .ok_or(DeviceError::BindingMismatch {
                                binding: reflected.binding,
                                index,
                                reason: "no image supplied for this slot",
                            })?;
                        let image = self.images.get(slot.image)?;
                        let layout = conv::required_image_layout(reflected.kind);
                        image_infos
                            .try_push(vk::DescriptorImageInfo {
                                sampler: vk::Sampler::null(),
                                image_view: image.view,
                                image_layout: layout,
                            })
                            .map_err(|_| DeviceError::LimitReached("MAX_DESCRIPTOR_WRITES"))?;
                        cb.bound_images
                            .try_push((
                                slot.image,
                                layout,
                                conv::required_image_access(reflected.kind, reflected.writable),
                            ))
                            .map_err(|_| DeviceError::LimitReached("MAX_BOUND_IMAGES"))?;
                        write.image_info = Some(image_infos.len() - 1);
                    }
                    BindingKind::Sampler => {
                        while sc < sampler_slots.len()
                            && (sampler_slots[sc].binding, sampler_slots[sc].index) < key
                        {
                            sc += 1;
                        }
                        let slot = sampler_slots
                            .get(sc)
                            .filter(|s| (s.binding, s.index) == key)
                            .ok_or(DeviceError::BindingMismatch {
                                binding: reflected.binding,
                                index,
                                reason: "no sampler supplied for this slot",
                            })?;
                        let sampler = self.samplers.get(slot.sampler)?;
                        image_infos
                            .try_push(vk::DescriptorImageInfo {
                                sampler: sampler.raw,
                                image_view: vk::ImageView::null(),
                                image_layout: vk::ImageLayout::UNDEFINED,
                            })
                            .map_err(|_| DeviceError::LimitReached("MAX_DESCRIPTOR_WRITES"))?;
                        write.image_info = Some(image_infos.len() - 1);
                    }
                }
                pending.try_push(write).map_err(|_| DeviceError::LimitReached("MAX_DESCRIPTOR_WRITES"))?;
            }
        }

        let mut writes: ArrayVec<vk::WriteDescriptorSet, MAX_DESCRIPTOR_WRITES> = ArrayVec::new();
        for w in &pending {
            let mut builder = vk::WriteDescriptorSet::builder()
                .dst_set(pipeline.set)
                .dst_binding(w.binding)
                .dst_array_element(w.index)
                .descriptor_type(w.ty);
            if let Some(i) = w.buffer_info {
                builder = builder.buffer_info(std::slice::from_ref(&buffer_infos[i]));
            }
            if let Some(i) = w.image_info {
                builder = builder.image_info(std::slice::from_ref(&image_infos[i]));
            }
            writes.push(builder.build());
        }

        unsafe {
            self.shared.raw.update_descriptor_sets(&writes, &[]);
            self.shared.raw.cmd_bind_descriptor_sets(
                cb.raw,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.layout,
                0,
                &[pipeline.set],
                &[],
            );
        }
        Ok(())
    }

    pub fn cmd_push_constants(
        &mut self,
        cmd: CommandBufferHandle,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let cb = self.command_buffers.get_mut(cmd)?;
        if cb.state != RecordState::Recording {
            return Err(DeviceError::RecordState(
                "command issued outside begin/end",
            ));
        }
        let pipeline_handle = cb
            .bound_pipeline
            .ok_or(DeviceError::RecordState("push_constants without a pipeline"))?;
        let pipeline = self.pipelines.get(pipeline_handle)?;
        if data.len() as u32 > pipeline.reflection.push_constant_size || data.len() % 4 != 0 {
            return Err(DeviceError::RecordState(
                "push-constant data does not fit the reflected block",
            ));
        }
        unsafe {
            self.shared.raw.cmd_push_constants(
                cb.raw,
                pipeline.layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                data,
            )
        };
        Ok(())
    }

    pub fn cmd_copy_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) -> Result<(), DeviceError> {
        let src_raw = self.buffers.get(src)?.raw;
        let dst_raw = self.buffers.get(dst)?.raw;
        let cb = recording(&mut self.command_buffers, cmd)?;
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        unsafe {
            self.shared
                .raw
                .cmd_copy_buffer(cb.raw, src_raw, dst_raw, &[region])
        };
        Ok(())
    }

    /// Copy a tightly packed buffer region into the whole image. The
    /// destination is transitioned to `TRANSFER_DST_OPTIMAL` implicitly.
    pub fn cmd_copy_buffer_to_image(
        &mut self,
        cmd: CommandBufferHandle,
        src: BufferHandle,
        src_offset: u64,
        dst: ImageHandle,
    ) -> Result<(), DeviceError> {
        let src_raw = self.buffers.get(src)?.raw;
        let cb = self.command_buffers.get_mut(cmd)?;
        if cb.state != RecordState::Recording {
            return Err(DeviceError::RecordState(
                "command issued outside begin/end",
            ));
        }
        let image = self.images.get_mut(dst)?;
        transition_image(
            &self.shared.raw,
            cb.raw,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        );
        let region = vk::BufferImageCopy {
            buffer_offset: src_offset,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: vk::Extent3D {
                width: image.extent.width,
                height: image.extent.height,
                depth: image.extent.depth.max(1),
            },
        };
        unsafe {
            self.shared.raw.cmd_copy_buffer_to_image(
                cb.raw,
                src_raw,
                image.raw,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            )
        };
        Ok(())
    }

    /// Full memory barrier between everything recorded before and after;
    /// the coarse hammer for transfer→dispatch and dispatch→readback
    /// edges.
    pub fn cmd_pipeline_barrier(&mut self, cmd: CommandBufferHandle) -> Result<(), DeviceError> {
        let cb = recording(&mut self.command_buffers, cmd)?;
        let barrier = vk::MemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE);
        unsafe {
            self.shared.raw.cmd_pipeline_barrier(
                cb.raw,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[barrier.build()],
                &[],
                &[],
            )
        };
        Ok(())
    }

    /// Record the dispatch, preceded by implicit layout transitions for
    /// every image the latest `cmd_update_bindings` bound: sampled images
    /// must be in `SHADER_READ_ONLY_OPTIMAL`, storage images in
    /// `GENERAL`. Tracked layout and access are updated so back-to-back
    /// dispatches need no caller barriers.
    pub fn cmd_dispatch(
        &mut self,
        cmd: CommandBufferHandle,
        x: u32,
        y: u32,
        z: u32,
    ) -> Result<(), DeviceError> {
        let cb = self.command_buffers.get_mut(cmd)?;
        if cb.state != RecordState::Recording {
            return Err(DeviceError::RecordState(
                "command issued outside begin/end",
            ));
        }
        if cb.bound_pipeline.is_none() {
            return Err(DeviceError::RecordState("dispatch without a pipeline"));
        }

        let mut barriers: ArrayVec<vk::ImageMemoryBarrier, MAX_BOUND_IMAGES> = ArrayVec::new();
        for (handle, layout, access) in cb.bound_images.iter().copied() {
            let image = self.images.get_mut(handle)?;
            if image.layout == layout && image.access == access {
                continue;
            }
            barriers.push(
                vk::ImageMemoryBarrier::builder()
                    .src_access_mask(image.access)
                    .dst_access_mask(access)
                    .old_layout(image.layout)
                    .new_layout(layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image.raw)
                    .subresource_range(FULL_COLOR_RANGE)
                    .build(),
            );
            image.layout = layout;
            image.access = access;
        }
        unsafe {
            if !barriers.is_empty() {
                self.shared.raw.cmd_pipeline_barrier(
                    cb.raw,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &barriers,
                );
            }
            self.shared.raw.cmd_dispatch(cb.raw, x, y, z);
        }
        Ok(())
    }

    // ----- timestamps ----------------------------------------------------

    pub fn cmd_reset_timestamps(
        &mut self,
        cmd: CommandBufferHandle,
        first: u32,
        count: u32,
    ) -> Result<(), DeviceError> {
        if first.saturating_add(count) > MAX_TIMESTAMP_QUERIES {
            return Err(DeviceError::LimitReached("MAX_TIMESTAMP_QUERIES"));
        }
        let query_pool = self.query_pool;
        let cb = recording(&mut self.command_buffers, cmd)?;
        unsafe {
            self.shared
                .raw
                .cmd_reset_query_pool(cb.raw, query_pool, first, count)
        };
        Ok(())
    }

    pub fn cmd_write_timestamp(
        &mut self,
        cmd: CommandBufferHandle,
        query: u32,
    ) -> Result<(), DeviceError> {
        if query >= MAX_TIMESTAMP_QUERIES {
            return Err(DeviceError::LimitReached("MAX_TIMESTAMP_QUERIES"));
        }
        let query_pool = self.query_pool;
        let cb = recording(&mut self.command_buffers, cmd)?;
        unsafe {
            self.shared.raw.cmd_write_timestamp(
                cb.raw,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                query_pool,
                query,
            )
        };
        Ok(())
    }

    /// Resolve `count` timestamps into `dst` as 64-bit ticks, waiting for
    /// availability on the GPU timeline.
    pub fn cmd_copy_timestamps(
        &mut self,
        cmd: CommandBufferHandle,
        first: u32,
        count: u32,
        dst: BufferHandle,
        dst_offset: u64,
    ) -> Result<(), DeviceError> {
        if first.saturating_add(count) > MAX_TIMESTAMP_QUERIES {
            return Err(DeviceError::LimitReached("MAX_TIMESTAMP_QUERIES"));
        }
        let dst_raw = self.buffers.get(dst)?.raw;
        let query_pool = self.query_pool;
        let cb = recording(&mut self.command_buffers, cmd)?;
        unsafe {
            self.shared.raw.cmd_copy_query_pool_results(
                cb.raw,
                query_pool,
                first,
                count,
                dst_raw,
                dst_offset,
                std::mem::size_of::<u64>() as u64,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )
        };
        Ok(())
    }
}

fn transition_image(
    device: &ash::Device,
    cb: vk::CommandBuffer,
    image: &mut Image,
    layout: vk::ImageLayout,
    access: vk::AccessFlags,
    dst_stage: vk::PipelineStageFlags,
) {
    if image.layout == layout && image.access == access {
        return;
    }
    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(image.access)
        .dst_access_mask(access)
        .old_layout(image.layout)
        .new_layout(layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image.raw)
        .subresource_range(FULL_COLOR_RANGE)
        .build();
    unsafe {
        device.cmd_pipeline_barrier(
            cb,
            vk::PipelineStageFlags::ALL_COMMANDS,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        )
    };
    image.layout = layout;
    image.access = access;
}
