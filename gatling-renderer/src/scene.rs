//! The scene registry: everything the delegate hands us, plus the change
//! versions the orchestrator diffs each frame.

use std::sync::Arc;

use gatling_gsd::{Material, Vertex};
use glam::{Affine3A, Mat4};

/// Immutable mesh data as baked by the delegate.
#[derive(Debug, Clone)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub faces: Vec<[u32; 3]>,
}

/// One placed mesh: shared geometry, a 3×4 object-to-world transform and
/// the material every face of this instance uses.
#[derive(Debug, Clone)]
pub struct MeshInstance {
    pub mesh: Arc<Mesh>,
    pub transform: Affine3A,
    pub material_index: u32,
    pub visible: bool,
}

/// Physical camera description; the render basis is derived from the
/// world transform at frame time.
#[derive(Debug, Clone, Copy)]
pub struct CameraDesc {
    pub transform: Mat4,
    /// Focal length, in the same unit as `aperture`.
    pub focal_length: f32,
    /// Vertical film aperture; `vfov = 2·atan(aperture / (2·focal))`.
    pub aperture: f32,
}

impl Default for CameraDesc {
    fn default() -> Self {
        Self {
            transform: Mat4::IDENTITY,
            focal_length: 50.0,
            aperture: 24.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderSettings {
    pub image_width: u32,
    pub image_height: u32,
    pub spp: u32,
    pub max_bounces: u32,
    /// Bounce index from which Russian roulette may terminate paths.
    pub rr_bounce_offset: u32,
    /// Inverse of the minimum path-survival probability.
    pub rr_inv_min_term_prob: f32,
    /// Clamp for per-sample radiance, to tame fireflies.
    pub max_sample_value: f32,
    pub background_color: [f32; 4],
    pub next_event_estimation: bool,
    pub progressive_accumulation: bool,
    pub depth_of_field: bool,
    pub filter_importance_sampling: bool,
    pub dome_light_enabled: bool,
    pub dome_light_camera_visible: bool,
    pub triangle_postponing: bool,
    /// Apply the sRGB curve on the CPU after mapping the output.
    pub output_srgb: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            image_width: 1200,
            image_height: 1200,
            spp: 4,
            max_bounces: 7,
            rr_bounce_offset: 3,
            rr_inv_min_term_prob: 1.0 / 0.1,
            max_sample_value: 10.0,
            background_color: [0.0, 0.0, 0.0, 1.0],
            next_event_estimation: true,
            progressive_accumulation: true,
            depth_of_field: false,
            filter_importance_sampling: true,
            dome_light_enabled: false,
            dome_light_camera_visible: false,
            triangle_postponing: false,
            output_srgb: false,
        }
    }
}

impl RenderSettings {
    pub(crate) fn feature_flags(&self) -> crate::RenderFeatures {
        use crate::RenderFeatures as F;
        let mut flags = F::empty();
        flags.set(F::DEPTH_OF_FIELD, self.depth_of_field);
        flags.set(F::FILTER_IMPORTANCE_SAMPLING, self.filter_importance_sampling);
        flags.set(F::NEXT_EVENT_ESTIMATION, self.next_event_estimation);
        flags.set(F::PROGRESSIVE_ACCUMULATION, self.progressive_accumulation);
        flags.set(F::DOME_LIGHT_CAMERA_VISIBLE, self.dome_light_camera_visible);
        flags
    }
}

/// The four change counters the orchestrator reads each frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ChangeVersions {
    pub scene_state: u64,
    pub sprim_index: u64,
    pub render_settings: u64,
    pub visibility: u64,
}

/// Mutable scene state. Every mutator bumps the counter whose consumers
/// must react, which is the whole invalidation protocol: the render pass
/// never watches individual objects.
#[derive(Debug, Default)]
pub struct SceneRegistry {
    instances: Vec<MeshInstance>,
    materials: Vec<Material>,
    camera: CameraDesc,
    settings: RenderSettings,
    versions: ChangeVersions,
}

impl SceneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn versions(&self) -> ChangeVersions {
        self.versions
    }

    pub fn instances(&self) -> &[MeshInstance] {
        &self.instances
    }

    pub fn materials(&self) -> &[Material] {
        &self.materials
    }

    pub fn camera(&self) -> &CameraDesc {
        &self.camera
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    pub fn add_instance(&mut self, instance: MeshInstance) -> usize {
        self.instances.push(instance);
        self.versions.scene_state += 1;
        self.instances.len() - 1
    }

    pub fn set_instance_transform(&mut self, index: usize, transform: Affine3A) {
        self.instances[index].transform = transform;
        self.versions.scene_state += 1;
    }

    pub fn set_instance_visible(&mut self, index: usize, visible: bool) {
        if self.instances[index].visible != visible {
            self.instances[index].visible = visible;
            self.versions.visibility += 1;
        }
    }

    pub fn set_materials(&mut self, materials: Vec<Material>) {
        self.materials = materials;
        self.versions.scene_state += 1;
    }

    pub fn set_camera(&mut self, camera: CameraDesc) {
        self.camera = camera;
        self.versions.sprim_index += 1;
    }

    pub fn set_settings(&mut self, settings: RenderSettings) {
        if self.settings != settings {
            self.settings = settings;
            self.versions.render_settings += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutators_bump_the_right_counters() {
        let mut registry = SceneRegistry::new();
        let before = registry.versions();

        registry.set_camera(CameraDesc::default());
        assert_eq!(registry.versions().sprim_index, before.sprim_index + 1);
        assert_eq!(registry.versions().scene_state, before.scene_state);

        let index = registry.add_instance(MeshInstance {
            mesh: Arc::new(Mesh {
                vertices: Vec::new(),
                faces: Vec::new(),
            }),
            transform: Affine3A::IDENTITY,
            material_index: 0,
            visible: true,
        });
        assert_eq!(registry.versions().scene_state, before.scene_state + 1);

        registry.set_instance_visible(index, false);
        assert_eq!(registry.versions().visibility, before.visibility + 1);
        // Setting the same visibility again is not a change.
        registry.set_instance_visible(index, false);
        assert_eq!(registry.versions().visibility, before.visibility + 1);

        let mut settings = *registry.settings();
        settings.spp += 1;
        registry.set_settings(settings);
        assert_eq!(
            registry.versions().render_settings,
            before.render_settings + 1
        );
    }
}
