//! Invalidation-driven cache of compiled kernels and their pipelines.

use gatling_gpu::{Device, DeviceError};
use gatling_types::{PipelineHandle, ShaderHandle};
use rustc_hash::FxHashMap;

use crate::{
    material::{material_set_digest, MaterialCompiler, ShaderRequest},
    scene::SceneRegistry,
    AovId, RenderError, RenderFeatures, RenderStage, NUM_THREADS_X, NUM_THREADS_Y,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ShaderCacheKey {
    pub aov: AovId,
    pub features: RenderFeatures,
    pub material_digest: u64,
}

#[derive(Debug, Copy, Clone)]
pub struct ShaderCacheEntry {
    pub shader: ShaderHandle,
    pub pipeline: PipelineHandle,
}

/// Kernels keyed by `(AOV, feature flags, material-set digest)`. A miss
/// compiles through the collaborator and builds the pipeline; a compile
/// failure falls back to the diffuse kernel once and otherwise leaves the
/// cache untouched, so earlier entries keep rendering.
#[derive(Debug, Default)]
pub struct ShaderCache {
    entries: FxHashMap<ShaderCacheKey, ShaderCacheEntry>,
}

impl ShaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn obtain(
        &mut self,
        device: &mut Device,
        compiler: &dyn MaterialCompiler,
        registry: &SceneRegistry,
        aov: AovId,
    ) -> Result<ShaderCacheEntry, RenderError> {
        let settings = registry.settings();
        let key = ShaderCacheKey {
            aov,
            features: settings.feature_flags(),
            material_digest: material_set_digest(registry.materials()),
        };
        if let Some(entry) = self.entries.get(&key) {
            return Ok(*entry);
        }

        let defines = [
            ("AOV_ID", (aov as u32).to_string()),
            ("NUM_THREADS_X", NUM_THREADS_X.to_string()),
            ("NUM_THREADS_Y", NUM_THREADS_Y.to_string()),
            ("MAX_STACK_SIZE", gatling_trace::MAX_STACK_SIZE.to_string()),
            ("POSTPONE_RATIO", format!("{:.3}", gatling_trace::POSTPONE_RATIO)),
            (
                "TRIANGLE_POSTPONING",
                u32::from(settings.triangle_postponing).to_string(),
            ),
            (
                "NEXT_EVENT_ESTIMATION",
                u32::from(settings.next_event_estimation).to_string(),
            ),
        ];
        let mut request = ShaderRequest {
            aov,
            features: key.features,
            materials: registry.materials(),
            material_digest: key.material_digest,
            defines: &defines,
            diffuse_fallback: false,
        };

        let spirv = match compiler.compile(&request) {
            Ok(spirv) => spirv,
            Err(first) => {
                // Keep whatever was cached before; degrade this request to
                // the diffuse kernel instead of taking the frame down.
                log::warn!("material compilation failed ({first}), retrying with diffuse fallback");
                request.diffuse_fallback = true;
                compiler
                    .compile(&request)
                    .map_err(RenderError::MaterialCompile)?
            }
        };

        let shader = device
            .create_shader(&spirv)
            .map_err(|e| RenderError::step(RenderStage::ShaderCache, e))?;
        let pipeline = match device.create_pipeline(shader) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                let _ = device.destroy_shader(shader);
                return Err(RenderError::step(RenderStage::ShaderCache, e));
            }
        };
        let entry = ShaderCacheEntry { shader, pipeline };
        self.entries.insert(key, entry);
        log::debug!(
            "shader cache now holds {} kernels (added {:?})",
            self.entries.len(),
            key
        );
        Ok(entry)
    }

    /// Drop every cached kernel, destroying the GPU objects.
    pub fn clear(&mut self, device: &mut Device) -> Result<(), DeviceError> {
        for (_, entry) in self.entries.drain() {
            device.destroy_pipeline(entry.pipeline)?;
            device.destroy_shader(entry.shader)?;
        }
        Ok(())
    }
}
