/*! Render-pass orchestration.
 *
 *  The renderer sits between a scene registry (fed by whatever delegate
 *  hosts us) and the compute device: it watches the registry's change
 *  versions, rebuilds the shader and geometry caches that those changes
 *  invalidate, and drives one path-tracing dispatch per frame. Material
 *  translation is an external collaborator behind [`MaterialCompiler`];
 *  this crate only keys and caches its output.
 */

mod gamma;
mod geometry;
mod material;
mod pass;
mod scene;
mod shader_cache;

pub use gamma::{linear_to_srgb, srgb_to_linear};
pub use geometry::GeometryCache;
pub use material::{material_set_digest, MaterialCompileError, MaterialCompiler, ShaderRequest};
pub use pass::{PassState, RenderPass};
pub use scene::{CameraDesc, ChangeVersions, Mesh, MeshInstance, RenderSettings, SceneRegistry};
pub use shader_cache::{ShaderCache, ShaderCacheEntry, ShaderCacheKey};

use thiserror::Error;

/// Workgroup width of the path-tracing kernel.
pub const NUM_THREADS_X: u32 = 8;
/// Workgroup height of the path-tracing kernel.
pub const NUM_THREADS_Y: u32 = 8;

/// Arbitrary output variable the kernel routes into the output buffer.
/// The discriminant is the `AOV_ID` define the kernel is compiled with.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AovId {
    Color = 0,
    Normal = 1,
    Depth = 2,
    Barycentrics = 3,
    TexCoords = 4,
    Bounces = 5,
    ClockCycles = 6,
}

bitflags::bitflags! {
    /// Feature permutations a kernel can be compiled with; part of the
    /// shader-cache key.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct RenderFeatures: u32 {
        const DEPTH_OF_FIELD = 1 << 0;
        const FILTER_IMPORTANCE_SAMPLING = 1 << 1;
        const NEXT_EVENT_ESTIMATION = 1 << 2;
        const PROGRESSIVE_ACCUMULATION = 1 << 3;
        const DOME_LIGHT_CAMERA_VISIBLE = 1 << 4;
    }
}

/// Stage names surfaced by [`RenderError::StepFailed`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RenderStage {
    ShaderCache,
    GeometryCache,
    Dispatch,
    Resolve,
}

#[derive(Debug, Error)]
pub enum RenderError {
    /// A frame step failed; the previously committed caches are intact.
    #[error("render step {stage:?} failed: {source}")]
    StepFailed {
        stage: RenderStage,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error(transparent)]
    Gpu(#[from] gatling_gpu::DeviceError),

    #[error("material compilation failed and no cached kernel exists")]
    MaterialCompile(#[source] MaterialCompileError),

    #[error("output slice holds {got} floats, frame needs {expected}")]
    OutputSizeMismatch { got: usize, expected: usize },
}

impl RenderError {
    pub(crate) fn step(
        stage: RenderStage,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::StepFailed {
            stage,
            source: Box::new(source),
        }
    }
}
