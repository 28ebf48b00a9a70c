//! `gp` — the gatling scene preprocessor.
//!
//! Reads a triangle mesh, builds the SBVH → wide BVH → CWBVH chain,
//! frames a default camera around the scene and writes a `.gsd` file the
//! renderer (and the traversal kernel) consume directly.

use std::path::Path;

use anyhow::{bail, Context};
use argh::FromArgs;
use gatling_bvh::{
    build_bvh, collapse, compress, BuildError, BvhBuildParams, CollapseParams, CwbvhScene,
};
use gatling_gsd::{write_scene_file, Aabb, Camera, Face, Material, Scene, Vertex};
use gatling_trace::{CwbvhView, Ray};
use glam::Vec3;
use rustc_hash::FxHashMap;

/// Default horizontal field of view of the auto-framed camera (70°).
const AUTO_HFOV: f32 = 1.221_730_5;

/// How many times the builder retries with a doubled spatial reservation
/// before giving up.
const RESERVE_RETRIES: u32 = 3;

#[derive(FromArgs)]
/// Preprocess a triangle mesh into a gatling scene (.gsd) file.
struct Args {
    /// input mesh file (wavefront OBJ)
    #[argh(positional)]
    input: String,

    /// output scene file
    #[argh(positional)]
    output: String,

    /// rendered image width in pixels
    #[argh(option, default = "1200")]
    image_width: u32,

    /// rendered image height in pixels
    #[argh(option, default = "1200")]
    image_height: u32,

    /// BVH quality weight for faces inside the camera frustum
    #[argh(option, default = "1.0")]
    sr_front: f32,

    /// BVH quality weight for faces behind the camera
    #[argh(option, default = "1.0")]
    sr_back: f32,

    /// BVH quality weight for faces outside the camera frustum
    #[argh(option, default = "1.0")]
    sr_outside_frustum: f32,
}

struct MeshData {
    vertices: Vec<Vertex>,
    faces: Vec<Face>,
    materials: Vec<Material>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args: Args = argh::from_env();

    let mesh = load_obj(&args)
        .with_context(|| format!("failed to import `{}`", args.input))?;
    log::info!(
        "imported {} faces, {} vertices, {} materials",
        mesh.faces.len(),
        mesh.vertices.len(),
        mesh.materials.len()
    );
    if mesh.faces.is_empty() {
        bail!("`{}` contains no triangles", args.input);
    }

    let scene_aabb = mesh
        .vertices
        .iter()
        .fold(Aabb::EMPTY, |mut acc, v| {
            acc.grow(Vec3::from(v.pos));
            acc
        });
    let camera = frame_camera(&scene_aabb);
    let weights = frustum_weights(&args, &camera, &mesh);

    // Build with an automatic retry ladder: spatial splits may blow the
    // duplicate reservation on pathological inputs, and a doubled
    // reservation is cheaper than a worse tree.
    let mut params = BvhBuildParams {
        face_weights: Some(&weights),
        ..Default::default()
    };
    let bvh = loop {
        match build_bvh(&mesh.faces, &mesh.vertices, &params) {
            Ok(bvh) => break bvh,
            Err(BuildError::ReservationExceeded { needed, reserved })
                if params.spatial_reserve_factor
                    < BvhBuildParams::default().spatial_reserve_factor
                        * (1 << RESERVE_RETRIES) as f32 =>
            {
                log::warn!(
                    "spatial reservation exceeded ({needed} > {reserved}), \
                     retrying with a doubled reserve factor"
                );
                params.spatial_reserve_factor *= 2.0;
            }
            Err(e) => return Err(e).context("BVH construction failed"),
        }
    };
    log::info!(
        "built binary BVH: {} nodes over {} faces",
        bvh.nodes.len(),
        bvh.faces.len()
    );

    let wide = collapse(&bvh, &CollapseParams::default());
    let compressed = compress(&wide, &bvh.faces).context("CWBVH compression failed")?;
    log::info!("compressed to {} CWBVH nodes", compressed.nodes.len());

    verify_traversal(&compressed, &mesh.vertices, &scene_aabb, &camera)?;

    let scene = Scene {
        image_width: args.image_width,
        image_height: args.image_height,
        aabb: scene_aabb,
        camera,
        nodes: compressed.nodes,
        faces: compressed.faces,
        vertices: mesh.vertices,
        materials: mesh.materials,
    };
    write_scene_file(Path::new(&args.output), &scene)
        .with_context(|| format!("failed to write `{}`", args.output))?;
    log::info!("wrote `{}`", args.output);
    Ok(())
}

/// Import a wavefront OBJ: fan-triangulate polygons, synthesise flat
/// normals where the file has none, and lift the MTL set into the 32-byte
/// material records.
fn load_obj(args: &Args) -> anyhow::Result<MeshData> {
    let mut obj = obj::Obj::load(&args.input)?;
    if let Err(e) = obj.load_mtls() {
        log::warn!("material libraries failed to load, using defaults: {e}");
    }
    let data = &obj.data;

    let mut materials = Vec::new();
    let mut material_indices: FxHashMap<String, u32> = FxHashMap::default();
    let mut vertex_cache: FxHashMap<(usize, Option<usize>, Option<usize>), u32> =
        FxHashMap::default();
    let mut vertices = Vec::new();
    let mut faces = Vec::new();

    for object in &data.objects {
        for group in &object.groups {
            let material_index = match &group.material {
                Some(material) => {
                    let (name, record) = match material {
                        obj::ObjMaterial::Ref(name) => (name.clone(), Material::new(DEFAULT_BASE_COLOR, [0.0; 3])),
                        obj::ObjMaterial::Mtl(m) => (
                            m.name.clone(),
                            Material::new(
                                m.kd.unwrap_or(DEFAULT_BASE_COLOR),
                                m.ke.unwrap_or([0.0; 3]),
                            ),
                        ),
                    };
                    *material_indices.entry(name).or_insert_with(|| {
                        materials.push(record);
                        materials.len() as u32 - 1
                    })
                }
                None => *material_indices.entry(String::new()).or_insert_with(|| {
                    materials.push(Material::new(DEFAULT_BASE_COLOR, [0.0; 3]));
                    materials.len() as u32 - 1
                }),
            };

            for poly in &group.polys {
                let tuples = &poly.0;
                if tuples.len() < 3 {
                    continue;
                }
                for i in 1..tuples.len() - 1 {
                    let corners = [tuples[0], tuples[i], tuples[i + 1]];
                    let indices = if corners.iter().all(|t| t.2.is_some()) {
                        corners.map(|t| {
                            *vertex_cache.entry((t.0, t.1, t.2)).or_insert_with(|| {
                                vertices.push(make_vertex(data, t, None));
                                vertices.len() as u32 - 1
                            })
                        })
                    } else {
                        // No authored normals: emit fresh vertices with the
                        // face normal, uncached since the normal is
                        // per-face.
                        let normal = face_normal(data, corners);
                        corners.map(|t| {
                            vertices.push(make_vertex(data, t, Some(normal)));
                            vertices.len() as u32 - 1
                        })
                    };
                    faces.push(Face {
                        indices,
                        material: material_index,
                    });
                }
            }
        }
    }

    if materials.is_empty() {
        materials.push(Material::new(DEFAULT_BASE_COLOR, [0.0; 3]));
    }
    Ok(MeshData {
        vertices,
        faces,
        materials,
    })
}

const DEFAULT_BASE_COLOR: [f32; 3] = [0.8, 0.8, 0.8];

fn make_vertex(data: &obj::ObjData, tuple: obj::IndexTuple, normal: Option<Vec3>) -> Vertex {
    let pos = data.position[tuple.0];
    let (u, v) = tuple
        .1
        .map(|t| (data.texture[t][0], data.texture[t][1]))
        .unwrap_or((0.0, 0.0));
    let norm = normal
        .map(|n| n.to_array())
        .or_else(|| tuple.2.map(|n| data.normal[n]))
        .unwrap_or([0.0, 0.0, 1.0]);
    Vertex { pos, u, norm, v }
}

fn face_normal(data: &obj::ObjData, corners: [obj::IndexTuple; 3]) -> Vec3 {
    let [a, b, c] = corners.map(|t| Vec3::from(data.position[t.0]));
    (b - a).cross(c - a).normalize_or_zero()
}

/// Frame the whole scene: camera on the +Z side of the bounding box,
/// looking down −Z, far enough back that the box fits the default fov.
fn frame_camera(aabb: &Aabb) -> Camera {
    if aabb.is_empty() {
        return Camera::default();
    }
    let center = aabb.center();
    let radius = (aabb.extent().length() * 0.5).max(1.0e-3);
    let distance = radius / (AUTO_HFOV * 0.5).tan() + radius;
    Camera {
        origin: center + Vec3::Z * distance,
        forward: Vec3::NEG_Z,
        up: Vec3::Y,
        hfov: AUTO_HFOV,
    }
}

/// The `--sr-*` flags as per-face SAH weights: each face is classified
/// against the framed camera (inside the frustum, behind the camera, or
/// outside the frustum) and weighted accordingly, biasing tree quality
/// toward what the camera will actually see.
fn frustum_weights(args: &Args, camera: &Camera, mesh: &MeshData) -> Vec<f32> {
    let right = camera.forward.cross(camera.up).normalize_or_zero();
    let half_w_slope = (camera.hfov * 0.5).tan();
    let half_h_slope = half_w_slope * args.image_height as f32 / args.image_width.max(1) as f32;

    mesh.faces
        .iter()
        .map(|face| {
            let centroid = face
                .indices
                .iter()
                .map(|&i| Vec3::from(mesh.vertices[i as usize].pos))
                .sum::<Vec3>()
                / 3.0;
            let v = centroid - camera.origin;
            let depth = v.dot(camera.forward);
            if depth <= 0.0 {
                return args.sr_back.max(0.0);
            }
            let x = v.dot(right).abs();
            let y = v.dot(camera.up).abs();
            if x <= depth * half_w_slope && y <= depth * half_h_slope {
                args.sr_front.max(0.0)
            } else {
                args.sr_outside_frustum.max(0.0)
            }
        })
        .collect()
}

/// Cheap smoke test before writing: a handful of rays from the framed
/// camera through the fresh CWBVH must not fault, and the scene centre
/// ray must hit whenever the box has volume.
fn verify_traversal(
    compressed: &CwbvhScene,
    vertices: &[Vertex],
    aabb: &Aabb,
    camera: &Camera,
) -> anyhow::Result<()> {
    let view = CwbvhView::new(&compressed.nodes, &compressed.faces, vertices);
    let to_center = (aabb.center() - camera.origin).normalize_or_zero();
    let ray = Ray {
        origin: camera.origin,
        dir: if to_center == Vec3::ZERO {
            camera.forward
        } else {
            to_center
        },
        t_max: 1.0e30,
    };
    view.find_hit_closest(&ray)
        .map_err(|e| anyhow::anyhow!("traversal self-check failed: {e}"))?;
    Ok(())
}
