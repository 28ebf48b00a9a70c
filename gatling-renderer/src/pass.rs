//! The per-frame render pass.
//!
//! One frame is: diff the registry's change versions, invalidate the
//! progressive accumulator if anything moved, rebuild whichever caches
//! the changes touched, resolve the camera, record and submit a single
//! dispatch, wait, map the output and optionally encode to sRGB on the
//! CPU.

use bytemuck::{Pod, Zeroable};
use gatling_gpu::{Device, DeviceError};
use gatling_trace::HitInfo;
use gatling_types::{
    Bindings, BufferBinding, BufferDesc, BufferHandle, BufferUsage, CommandBufferHandle,
    FenceHandle, MemoryProps,
};
use glam::{Mat4, Vec3};

use crate::{
    gamma::linear_to_srgb,
    geometry::GeometryCache,
    material::MaterialCompiler,
    scene::{CameraDesc, ChangeVersions, SceneRegistry},
    shader_cache::ShaderCache,
    AovId, RenderError, RenderStage, NUM_THREADS_X, NUM_THREADS_Y,
};

/// Bytes per queued path segment (ray state, throughput, RNG state).
const PATH_SEGMENT_SIZE: u64 = 48;
/// Bytes of atomic counters at the head of each queue buffer.
const QUEUE_HEADER_SIZE: u64 = 16;

/// The push-constant block, mirrored by the kernel. Kept to four 16-byte
/// rows plus the background colour.
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct PushConstants {
    camera_origin: [f32; 3],
    vfov: f32,
    camera_forward: [f32; 3],
    sample_offset: u32,
    camera_up: [f32; 3],
    spp: u32,
    image_width: u32,
    image_height: u32,
    max_bounces: u32,
    rr_bounce_offset: u32,
    rr_inv_min_term_prob: f32,
    max_sample_value: f32,
    dome_light_enabled: u32,
    _pad: u32,
    background_color: [f32; 4],
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PassState {
    Idle,
    Invalidating,
    RebuildingShaders,
    RebuildingGeometry,
    Dispatched,
    Resolved,
}

/// The render-pass orchestrator. Owns the caches and per-frame GPU
/// objects; dropping it before submission cancels the pending pass (a
/// dispatch in flight is not cancellable).
pub struct RenderPass {
    state: PassState,
    shader_cache: ShaderCache,
    geometry: Option<GeometryCache>,
    last_versions: Option<ChangeVersions>,
    sample_offset: u32,
    output_buffer: Option<(BufferHandle, u64)>,
    path_queue: Option<(BufferHandle, u64)>,
    hit_queue: Option<(BufferHandle, u64)>,
    cmd: Option<CommandBufferHandle>,
    fence: Option<FenceHandle>,
}

impl RenderPass {
    pub fn new() -> Self {
        Self {
            state: PassState::Idle,
            shader_cache: ShaderCache::new(),
            geometry: None,
            last_versions: None,
            sample_offset: 0,
            output_buffer: None,
            path_queue: None,
            hit_queue: None,
            cmd: None,
            fence: None,
        }
    }

    pub fn state(&self) -> PassState {
        self.state
    }

    /// Accumulated sample count of the progressive framebuffer.
    pub fn sample_offset(&self) -> u32 {
        self.sample_offset
    }

    fn set_state(&mut self, state: PassState) {
        log::trace!("render pass {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Render one frame into `output` (RGBA32F, `width * height * 4`
    /// floats). Any step failure leaves the previously committed caches
    /// in place and the pass back in `Idle`.
    pub fn render_frame(
        &mut self,
        device: &mut Device,
        registry: &SceneRegistry,
        compiler: &dyn MaterialCompiler,
        aov: AovId,
        output: &mut [f32],
    ) -> Result<(), RenderError> {
        profiling::scope!("render_frame");
        let result = self.render_frame_inner(device, registry, compiler, aov, output);
        if result.is_err() {
            self.set_state(PassState::Idle);
        }
        result
    }

    fn render_frame_inner(
        &mut self,
        device: &mut Device,
        registry: &SceneRegistry,
        compiler: &dyn MaterialCompiler,
        aov: AovId,
        output: &mut [f32],
    ) -> Result<(), RenderError> {
        let settings = *registry.settings();
        let (width, height) = (settings.image_width, settings.image_height);
        let expected = (width * height * 4) as usize;
        if output.len() != expected {
            return Err(RenderError::OutputSizeMismatch {
                got: output.len(),
                expected,
            });
        }

        // 1. Invalidation: any changed counter restarts progressive
        // accumulation, observable by this very dispatch through
        // `sample_offset == 0`.
        self.set_state(PassState::Invalidating);
        let versions = registry.versions();
        let invalidated = self.last_versions != Some(versions);
        if invalidated {
            self.sample_offset = 0;
        }
        let geometry_dirty = self.geometry.is_none()
            || self.last_versions.map_or(true, |last| {
                last.scene_state != versions.scene_state
                    || last.visibility != versions.visibility
            });

        // 2. Shader cache.
        self.set_state(PassState::RebuildingShaders);
        let kernel = self.shader_cache.obtain(device, compiler, registry, aov)?;

        // 3. Geometry cache: built fresh, committed on success, the old
        // cache destroyed afterwards.
        if geometry_dirty {
            self.set_state(PassState::RebuildingGeometry);
            let fresh = GeometryCache::build(device, registry)?;
            if let Some(old) = self.geometry.take() {
                old.destroy(device)?;
            }
            self.geometry = Some(fresh);
        }
        self.last_versions = Some(versions);

        // 4. Frame-sized buffers.
        let pixel_count = u64::from(width) * u64::from(height);
        let output_size = pixel_count * 16;
        let output_buffer = self.ensure_buffer(
            device,
            Slot::Output,
            output_size,
            BufferUsage::STORAGE,
            MemoryProps::HOST_VISIBLE | MemoryProps::HOST_CACHED,
        )?;
        let path_queue = self.ensure_buffer(
            device,
            Slot::PathQueue,
            QUEUE_HEADER_SIZE + pixel_count * PATH_SEGMENT_SIZE,
            BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
            MemoryProps::DEVICE_LOCAL,
        )?;
        let hit_queue = self.ensure_buffer(
            device,
            Slot::HitQueue,
            QUEUE_HEADER_SIZE + pixel_count * std::mem::size_of::<HitInfo>() as u64,
            BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
            MemoryProps::DEVICE_LOCAL,
        )?;
        if self.cmd.is_none() {
            self.cmd = Some(device.create_command_buffer()?);
        }
        if self.fence.is_none() {
            self.fence = Some(device.create_fence()?);
        }
        let cmd = self.cmd.unwrap();
        let fence = self.fence.unwrap();

        // 5. Record and submit the dispatch.
        let geometry = self.geometry.as_ref().expect("rebuilt above");
        let push = push_constants(registry.camera(), &settings, self.sample_offset);
        let mut dispatch = || -> Result<(), DeviceError> {
            device.begin_commands(cmd)?;
            device.cmd_bind_pipeline(cmd, kernel.pipeline)?;
            let whole = |binding: u32, buffer: BufferHandle| BufferBinding {
                binding,
                index: 0,
                buffer,
                offset: 0,
                size: 0,
            };
            let buffers = [
                whole(0, output_buffer),
                whole(1, path_queue),
                whole(2, geometry.node_buffer),
                whole(3, geometry.face_buffer),
                whole(4, geometry.vertex_buffer),
                whole(5, geometry.material_buffer),
                whole(6, hit_queue),
            ];
            device.cmd_update_bindings(
                cmd,
                &Bindings {
                    buffers: &buffers,
                    ..Default::default()
                },
            )?;
            device.cmd_push_constants(cmd, bytemuck::bytes_of(&push))?;
            device.cmd_dispatch(
                cmd,
                width.div_ceil(NUM_THREADS_X),
                height.div_ceil(NUM_THREADS_Y),
                1,
            )?;
            device.end_commands(cmd)?;
            device.submit(cmd, fence)
        };
        dispatch().map_err(|e| RenderError::step(RenderStage::Dispatch, e))?;
        self.set_state(PassState::Dispatched);

        // 6. Resolve: wait, map, convert.
        device
            .wait_fence(fence)
            .and_then(|()| device.reset_fence(fence))
            .map_err(|e| RenderError::step(RenderStage::Resolve, e))?;
        self.set_state(PassState::Resolved);

        device
            .invalidate_buffer(output_buffer, 0, output_size)
            .and_then(|()| {
                device.read_buffer(output_buffer, 0, bytemuck::cast_slice_mut(output))
            })
            .map_err(|e| RenderError::step(RenderStage::Resolve, e))?;
        if settings.output_srgb {
            for rgba in output.chunks_exact_mut(4) {
                for channel in &mut rgba[..3] {
                    *channel = linear_to_srgb(channel.clamp(0.0, 1.0));
                }
            }
        }

        self.sample_offset += settings.spp;
        self.set_state(PassState::Idle);
        Ok(())
    }

    fn ensure_buffer(
        &mut self,
        device: &mut Device,
        slot: Slot,
        size: u64,
        usage: BufferUsage,
        memory: MemoryProps,
    ) -> Result<BufferHandle, RenderError> {
        let entry = match slot {
            Slot::Output => &mut self.output_buffer,
            Slot::PathQueue => &mut self.path_queue,
            Slot::HitQueue => &mut self.hit_queue,
        };
        if let Some((handle, current)) = *entry {
            if current >= size {
                return Ok(handle);
            }
            *entry = None;
            device.destroy_buffer(handle)?;
        }
        let handle = device.create_buffer(&BufferDesc {
            label: Some(slot.label()),
            size,
            usage,
            memory,
        })?;
        let entry = match slot {
            Slot::Output => &mut self.output_buffer,
            Slot::PathQueue => &mut self.path_queue,
            Slot::HitQueue => &mut self.hit_queue,
        };
        *entry = Some((handle, size));
        Ok(handle)
    }

    /// Tear down every GPU object the pass owns. Explicit, like all
    /// destruction in the device layer.
    pub fn destroy(&mut self, device: &mut Device) -> Result<(), DeviceError> {
        self.shader_cache.clear(device)?;
        if let Some(geometry) = self.geometry.take() {
            geometry.destroy(device)?;
        }
        for entry in [
            self.output_buffer.take(),
            self.path_queue.take(),
            self.hit_queue.take(),
        ]
        .into_iter()
        .flatten()
        {
            device.destroy_buffer(entry.0)?;
        }
        if let Some(cmd) = self.cmd.take() {
            device.destroy_command_buffer(cmd)?;
        }
        if let Some(fence) = self.fence.take() {
            device.destroy_fence(fence)?;
        }
        Ok(())
    }
}

impl Default for RenderPass {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Copy, Clone)]
enum Slot {
    Output,
    PathQueue,
    HitQueue,
}

impl Slot {
    fn label(self) -> &'static str {
        match self {
            Slot::Output => "output pixels",
            Slot::PathQueue => "path segment queue",
            Slot::HitQueue => "hit info queue",
        }
    }
}

/// Derive the render camera from the world transform: the three
/// canonical points through the matrix give position and basis, the
/// physical lens gives the field of view.
fn resolve_camera(camera: &CameraDesc) -> (Vec3, Vec3, Vec3, f32) {
    let transform: Mat4 = camera.transform;
    let origin = transform.transform_point3(Vec3::ZERO);
    let forward = (transform.transform_point3(Vec3::NEG_Z) - origin).normalize_or_zero();
    let up = (transform.transform_point3(Vec3::Y) - origin).normalize_or_zero();
    let vfov = 2.0 * (camera.aperture / (2.0 * camera.focal_length)).atan();
    (origin, forward, up, vfov)
}

fn push_constants(
    camera: &CameraDesc,
    settings: &crate::scene::RenderSettings,
    sample_offset: u32,
) -> PushConstants {
    let (origin, forward, up, vfov) = resolve_camera(camera);
    PushConstants {
        camera_origin: origin.to_array(),
        vfov,
        camera_forward: forward.to_array(),
        sample_offset,
        camera_up: up.to_array(),
        spp: settings.spp,
        image_width: settings.image_width,
        image_height: settings.image_height,
        max_bounces: settings.max_bounces,
        rr_bounce_offset: settings.rr_bounce_offset,
        rr_inv_min_term_prob: settings.rr_inv_min_term_prob,
        max_sample_value: settings.max_sample_value,
        dome_light_enabled: u32::from(settings.dome_light_enabled),
        _pad: 0,
        background_color: settings.background_color,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_constant_block_layout() {
        // Mirrored by the kernel; four 16-byte rows plus one for the
        // background colour.
        assert_eq!(std::mem::size_of::<PushConstants>(), 96);
    }

    #[test]
    fn camera_basis_from_transform() {
        let camera = CameraDesc {
            transform: Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)),
            focal_length: 50.0,
            aperture: 24.0,
        };
        let (origin, forward, up, vfov) = resolve_camera(&camera);
        assert_eq!(origin, Vec3::new(1.0, 2.0, 3.0));
        assert!((forward - Vec3::NEG_Z).length() < 1.0e-6);
        assert!((up - Vec3::Y).length() < 1.0e-6);
        let expected = 2.0 * (24.0f32 / 100.0).atan();
        assert!((vfov - expected).abs() < 1.0e-6);
    }
}
