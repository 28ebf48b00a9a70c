//! End-to-end traversal checks against brute force, through the full
//! build → collapse → compress → serialise → reload pipeline.

use gatling_bvh::{build_bvh, collapse, compress, BvhBuildParams, CollapseParams};
use gatling_gsd::{read_scene, write_scene, Camera, Face, Scene, Vertex};
use gatling_trace::{
    intersect_triangle, BallotPostpone, CwbvhView, Hit, HitInfo, Ray, FACE_INDEX_MISS,
    POSTPONE_RATIO,
};
use glam::Vec3;
use nanorand::{Rng, WyRand};

fn triangle_scene() -> (Vec<Face>, Vec<Vertex>) {
    let vertices = vec![
        Vertex {
            pos: [0.0, 0.0, 0.0],
            u: 0.0,
            norm: [0.0, 0.0, 1.0],
            v: 0.0,
        },
        Vertex {
            pos: [1.0, 0.0, 0.0],
            u: 1.0,
            norm: [0.0, 0.0, 1.0],
            v: 0.0,
        },
        Vertex {
            pos: [0.0, 1.0, 0.0],
            u: 0.0,
            norm: [0.0, 0.0, 1.0],
            v: 1.0,
        },
    ];
    let faces = vec![Face {
        indices: [0, 1, 2],
        material: 0,
    }];
    (faces, vertices)
}

/// Build with the same doubling retry ladder the preprocessor uses (three
/// doublings of the default reservation), so dense random soups cannot
/// fail the suite on reservation pressure.
fn build_with_retries(faces: &[Face], vertices: &[Vertex]) -> gatling_bvh::Bvh {
    let mut params = BvhBuildParams::default();
    loop {
        match build_bvh(faces, vertices, &params) {
            Ok(bvh) => return bvh,
            Err(gatling_bvh::BuildError::ReservationExceeded { .. })
                if params.spatial_reserve_factor
                    < BvhBuildParams::default().spatial_reserve_factor * 8.0 =>
            {
                params.spatial_reserve_factor *= 2.0;
            }
            Err(e) => panic!("build failed: {e}"),
        }
    }
}

fn compressed(faces: &[Face], vertices: &[Vertex]) -> (Vec<gatling_gsd::CwbvhNode>, Vec<Face>) {
    let bvh = build_with_retries(faces, vertices);
    let wide = collapse(&bvh, &CollapseParams::default());
    let scene = compress(&wide, &bvh.faces).unwrap();
    (scene.nodes, scene.faces)
}

fn brute_force(ray: &Ray, faces: &[Face], vertices: &[Vertex]) -> Option<Hit> {
    let mut best: Option<Hit> = None;
    let mut t_max = ray.t_max;
    for (index, face) in faces.iter().enumerate() {
        let p0 = Vec3::from(vertices[face.indices[0] as usize].pos);
        let p1 = Vec3::from(vertices[face.indices[1] as usize].pos);
        let p2 = Vec3::from(vertices[face.indices[2] as usize].pos);
        if let Some((t, u, v)) = intersect_triangle(ray.origin, ray.dir, p0, p1, p2, t_max) {
            best = Some(Hit {
                t,
                u,
                v,
                face_index: index as u32,
            });
            t_max = t;
        }
    }
    best
}

#[test]
fn single_triangle_closest_hit() {
    let (faces, vertices) = triangle_scene();
    let (nodes, faces) = compressed(&faces, &vertices);
    let view = CwbvhView::new(&nodes, &faces, &vertices);

    let ray = Ray {
        origin: Vec3::new(0.25, 0.25, -1.0),
        dir: Vec3::new(0.0, 0.0, 1.0),
        t_max: 1.0e9,
    };
    let hit = view.find_hit_closest(&ray).unwrap().expect("must hit");
    assert!((hit.t - 1.0).abs() < 1.0e-5);
    assert!((hit.u - 0.25).abs() < 1.0e-5);
    assert!((hit.v - 0.25).abs() < 1.0e-5);
    assert_eq!(hit.face_index, 0);
    assert!(view.find_hit_any(&ray).unwrap());
}

#[test]
fn single_triangle_miss() {
    let (faces, vertices) = triangle_scene();
    let (nodes, faces) = compressed(&faces, &vertices);
    let view = CwbvhView::new(&nodes, &faces, &vertices);

    let ray = Ray {
        origin: Vec3::new(-1.0, -1.0, -1.0),
        dir: Vec3::new(1.0, 0.0, 0.0),
        t_max: 1.0e9,
    };
    let hit = view.find_hit_closest(&ray).unwrap();
    assert_eq!(hit, None);
    assert_eq!(HitInfo::from(hit).face_index, FACE_INDEX_MISS);
    assert!(!view.find_hit_any(&ray).unwrap());
}

fn random_soup(count: usize, seed: u64) -> (Vec<Face>, Vec<Vertex>) {
    let mut rng = WyRand::new_seed(seed);
    let mut unit = move || rng.generate::<u32>() as f32 / u32::MAX as f32;
    let mut vertices = Vec::new();
    let mut faces = Vec::new();
    for _ in 0..count {
        let base = vertices.len() as u32;
        let anchor = Vec3::new(unit(), unit(), unit());
        for _ in 0..3 {
            let p = anchor + (Vec3::new(unit(), unit(), unit()) - 0.5) * 0.08;
            vertices.push(Vertex {
                pos: p.to_array(),
                u: 0.0,
                norm: [0.0, 0.0, 1.0],
                v: 0.0,
            });
        }
        faces.push(Face {
            indices: [base, base + 1, base + 2],
            material: 0,
        });
    }
    (faces, vertices)
}

fn random_rays(count: usize, seed: u64) -> Vec<Ray> {
    let mut rng = WyRand::new_seed(seed);
    let mut unit = move || rng.generate::<u32>() as f32 / u32::MAX as f32;
    (0..count)
        .map(|_| {
            let origin = Vec3::new(unit(), unit(), unit()) * 2.0 - 0.5;
            let dir = (Vec3::new(unit(), unit(), unit()) - 0.5).normalize_or_zero();
            Ray {
                origin,
                dir: if dir == Vec3::ZERO { Vec3::Z } else { dir },
                t_max: 1.0e9,
            }
        })
        .collect()
}

/// 10 000 random triangles through the whole preprocessor pipeline plus a
/// file round-trip; the reloaded CWBVH must agree with brute force over
/// the reloaded geometry for 1 000 rays.
#[test]
fn cwbvh_round_trip_matches_brute_force() {
    let (faces, vertices) = random_soup(10_000, 42);
    let bvh = build_with_retries(&faces, &vertices);
    let wide = collapse(&bvh, &CollapseParams::default());
    let compressed = compress(&wide, &bvh.faces).unwrap();

    let scene = Scene {
        image_width: 16,
        image_height: 16,
        aabb: bvh.aabb,
        camera: Camera::default(),
        nodes: compressed.nodes,
        faces: compressed.faces,
        vertices: vertices.clone(),
        materials: Vec::new(),
    };
    let mut bytes = Vec::new();
    write_scene(&mut bytes, &scene).unwrap();
    let reloaded = read_scene(&bytes).unwrap();

    let view = CwbvhView::new(&reloaded.nodes, &reloaded.faces, &reloaded.vertices);
    for ray in random_rays(1_000, 1337) {
        let traversed = view.find_hit_closest(&ray).unwrap();
        let reference = brute_force(&ray, &reloaded.faces, &reloaded.vertices);
        match (traversed, reference) {
            (None, None) => {}
            (Some(got), Some(want)) => {
                let tolerance = 1.0e-4 * want.t.max(1.0);
                assert!(
                    (got.t - want.t).abs() <= tolerance,
                    "t mismatch: {} vs {}",
                    got.t,
                    want.t
                );
                // Spatial splits may duplicate a face in the buffer, so
                // compare the face records rather than raw indices.
                assert_eq!(
                    reloaded.faces[got.face_index as usize],
                    reloaded.faces[want.face_index as usize]
                );
            }
            (got, want) => panic!("hit disagreement: {got:?} vs {want:?}"),
        }
    }
}

/// Postponement must not change results, only the order of deferred
/// work. The fake ballot dips below the threshold on a fixed cadence.
#[test]
fn postponement_is_result_invariant() {
    let (faces, vertices) = random_soup(2_000, 7);
    let (nodes, faces) = compressed(&faces, &vertices);
    let view = CwbvhView::new(&nodes, &faces, &vertices);

    for (ray_index, ray) in random_rays(200, 99).into_iter().enumerate() {
        let plain = view.find_hit_closest(&ray).unwrap();

        let mut calls = ray_index as u32;
        let ballot = move || {
            calls = calls.wrapping_add(1);
            // 32 lanes at start, periodically starved below the ratio.
            if calls % 3 == 0 {
                2
            } else {
                32
            }
        };
        let mut postpone = BallotPostpone::new(ballot, POSTPONE_RATIO);
        let postponed = view.find_hit_closest_with(&ray, &mut postpone).unwrap();

        match (plain, postponed) {
            (None, None) => {}
            (Some(a), Some(b)) => {
                assert_eq!(a.t, b.t, "ray {ray_index} diverged in t");
                assert_eq!(a.u, b.u, "ray {ray_index} diverged in u");
                assert_eq!(a.v, b.v, "ray {ray_index} diverged in v");
                // A duplicated face may be reported through either copy;
                // the face itself must be the same one.
                assert_eq!(
                    faces[a.face_index as usize], faces[b.face_index as usize],
                    "ray {ray_index} hit different faces"
                );
            }
            (a, b) => panic!("ray {ray_index} diverged: {a:?} vs {b:?}"),
        }
    }
}
