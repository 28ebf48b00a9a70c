//! The material-compiler collaborator boundary.
//!
//! Material translation (MaterialX → MDL → kernel source → SPIR-V) lives
//! outside this repository; the renderer only describes what it needs
//! compiled and caches the result by the request's identity.

use std::hash::Hasher;

use gatling_gsd::Material;
use rustc_hash::FxHasher;
use thiserror::Error;

use crate::{AovId, RenderFeatures};

#[derive(Debug, Clone, Error)]
#[error("material compilation failed: {0}")]
pub struct MaterialCompileError(pub String);

/// One compile request. `defines` carries the constants the orchestrator
/// injects (`AOV_ID`, `NUM_THREADS_X/Y`, `MAX_STACK_SIZE`,
/// `POSTPONE_RATIO`, feature switches); `diffuse_fallback` asks for the
/// degraded kernel that shades every material as plain diffuse base
/// colour, used when the full set fails to translate.
#[derive(Debug, Clone)]
pub struct ShaderRequest<'a> {
    pub aov: AovId,
    pub features: RenderFeatures,
    pub materials: &'a [Material],
    pub material_digest: u64,
    pub defines: &'a [(&'static str, String)],
    pub diffuse_fallback: bool,
}

/// Collaborator contract: a pure function from the request to a SPIR-V
/// blob. Two requests with equal digests, AOV, features and defines must
/// yield byte-identical output, which is what lets the shader cache key
/// on the request instead of the blob.
pub trait MaterialCompiler {
    fn compile(&self, request: &ShaderRequest<'_>) -> Result<Vec<u8>, MaterialCompileError>;
}

/// Order-sensitive digest of the material table, used in the shader-cache
/// key.
pub fn material_set_digest(materials: &[Material]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(bytemuck::cast_slice(materials));
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_tracks_content_and_order() {
        let a = Material::new([1.0, 0.0, 0.0], [0.0; 3]);
        let b = Material::new([0.0, 1.0, 0.0], [0.0; 3]);
        assert_eq!(material_set_digest(&[a, b]), material_set_digest(&[a, b]));
        assert_ne!(material_set_digest(&[a, b]), material_set_digest(&[b, a]));
        assert_ne!(material_set_digest(&[a]), material_set_digest(&[a, a]));
    }
}
