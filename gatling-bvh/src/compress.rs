use gatling_gsd::{Aabb, CwbvhNode, Face};
use glam::Vec3;

use crate::{
    collapse::{WideBvh, WideChild, WideChildKind, WIDE_ARITY},
    CompressError,
};

/// A compressed scene fragment: the 80-byte node array plus the face
/// buffer reordered so that every node's leaf faces form one contiguous
/// run starting at that node's `face_base`.
#[derive(Debug, Clone)]
pub struct CwbvhScene {
    pub nodes: Vec<CwbvhNode>,
    pub faces: Vec<Face>,
}

/// `2^(e - 127)` for a stored exponent byte.
fn exp2i(e: u8) -> f32 {
    f32::from_bits(u32::from(e) << 23)
}

/// Smallest exponent byte whose scale covers `extent / 255` — the
/// `ceil(log2(extent / 255))` rule, with a verification step so rounding
/// in `log2` can never produce clipping bounds.
fn quant_exponent(extent: f32) -> u8 {
    if !(extent > 0.0) {
        return 1;
    }
    let mut e = ((extent / 255.0).log2().ceil() as i32 + 127).clamp(1, 254);
    while e < 254 && 255.0 * exp2i(e as u8) < extent {
        e += 1;
    }
    e as u8
}

/// Quantise one bound, rounding toward −∞, and step down if float
/// rounding in the division left the decoded plane above the input.
fn quantize_lo(value: f32, anchor: f32, scale: f32, inv_scale: f32) -> u8 {
    let mut q = (((value - anchor) * inv_scale).floor()).clamp(0.0, 255.0) as i32;
    while q > 0 && anchor + q as f32 * scale > value {
        q -= 1;
    }
    q as u8
}

/// Quantise one bound, rounding toward +∞.
fn quantize_hi(value: f32, anchor: f32, scale: f32, inv_scale: f32) -> u8 {
    let mut q = (((value - anchor) * inv_scale).ceil()).clamp(0.0, 255.0) as i32;
    while q < 255 && anchor + q as f32 * scale < value {
        q += 1;
    }
    q as u8
}

/// Direction a slot "points at": per axis, +1 when the slot bit is set
/// (x = bit 2, y = bit 1, z = bit 0). The traversal derives its octant
/// word with the same bit layout, which is what makes
/// `bit_index = 24 + (slot ^ oct_inv)` pop children near-to-far.
fn slot_direction(slot: usize) -> Vec3 {
    Vec3::new(
        if slot & 0b100 != 0 { 1.0 } else { -1.0 },
        if slot & 0b010 != 0 { 1.0 } else { -1.0 },
        if slot & 0b001 != 0 { 1.0 } else { -1.0 },
    )
}

/// Greedy assignment of children to the eight slots, maximising the
/// alignment between each child's centroid offset and its slot direction.
/// A suboptimal assignment only costs traversal order, never correctness.
fn assign_slots(children: &[WideChild], node_center: Vec3) -> [Option<usize>; WIDE_ARITY] {
    let mut slots: [Option<usize>; WIDE_ARITY] = [None; WIDE_ARITY];
    let mut child_done = [false; WIDE_ARITY];
    for _ in 0..children.len() {
        let mut best: Option<(usize, usize, f32)> = None;
        for (c, child) in children.iter().enumerate() {
            if child_done[c] {
                continue;
            }
            let offset = child.aabb.center() - node_center;
            for (s, slot) in slots.iter().enumerate() {
                if slot.is_some() {
                    continue;
                }
                let rating = offset.dot(slot_direction(s));
                if best.map_or(true, |(_, _, r)| rating > r) {
                    best = Some((c, s, rating));
                }
            }
        }
        let (c, s, _) = best.unwrap();
        slots[s] = Some(c);
        child_done[c] = true;
    }
    slots
}

/// Quantise a wide BVH into CWBVH nodes, reordering `faces` on the way.
/// The root lands at node 0 and interior children of a node are allocated
/// contiguously from its `child_base`, in slot order.
pub fn compress(wide: &WideBvh, faces: &[Face]) -> Result<CwbvhScene, CompressError> {
    profiling::scope!("compress_bvh");

    let mut out_nodes = vec![CwbvhNode::EMPTY; wide.nodes.len()];
    let mut out_faces = Vec::with_capacity(faces.len());
    // (wide index, output index); output slots are reserved before the
    // task is pushed so parents can store child_base up front.
    let mut tasks = vec![(0u32, 0u32)];
    let mut next_node = 1u32;

    while let Some((wide_index, out_index)) = tasks.pop() {
        let node = &wide.nodes[wide_index as usize];
        let total_faces: u32 = node
            .children
            .iter()
            .map(|c| match c.kind {
                WideChildKind::Leaf { face_count, .. } => face_count,
                WideChildKind::Interior(_) => 0,
            })
            .sum();
        if total_faces > 24 {
            return Err(CompressError::NodeFacesExceeded { count: total_faces });
        }

        let anchor = node.aabb.min;
        let extent = node.aabb.extent();
        let e = [
            quant_exponent(extent.x),
            quant_exponent(extent.y),
            quant_exponent(extent.z),
        ];
        let scale = Vec3::new(exp2i(e[0]), exp2i(e[1]), exp2i(e[2]));
        let inv_scale = scale.recip();

        let mut out = CwbvhNode::EMPTY;
        out.p = anchor.to_array();
        out.e = e;
        out.child_base = next_node;
        out.face_base = out_faces.len() as u32;

        let slots = assign_slots(&node.children, node.aabb.center());
        let mut interior_rank = 0u32;
        let mut face_offset = 0u32;
        for (slot, assigned) in slots.iter().enumerate() {
            let Some(child_index) = *assigned else {
                continue;
            };
            let child = &node.children[child_index];

            let (half, lane) = (slot / 4, slot % 4);
            out.q_lo_x[half][lane] = quantize_lo(child.aabb.min.x, anchor.x, scale.x, inv_scale.x);
            out.q_lo_y[half][lane] = quantize_lo(child.aabb.min.y, anchor.y, scale.y, inv_scale.y);
            out.q_lo_z[half][lane] = quantize_lo(child.aabb.min.z, anchor.z, scale.z, inv_scale.z);
            out.q_hi_x[half][lane] = quantize_hi(child.aabb.max.x, anchor.x, scale.x, inv_scale.x);
            out.q_hi_y[half][lane] = quantize_hi(child.aabb.max.y, anchor.y, scale.y, inv_scale.y);
            out.q_hi_z[half][lane] = quantize_hi(child.aabb.max.z, anchor.z, scale.z, inv_scale.z);

            match child.kind {
                WideChildKind::Interior(wide_child) => {
                    out.imask |= 1 << slot;
                    out.meta[half][lane] = CwbvhNode::meta_interior(slot as u32);
                    tasks.push((wide_child, out.child_base + interior_rank));
                    interior_rank += 1;
                }
                WideChildKind::Leaf {
                    face_index,
                    face_count,
                } => {
                    if face_count > 3 {
                        return Err(CompressError::LeafTooLarge { count: face_count });
                    }
                    debug_assert!(face_count > 0, "leaf children are never empty");
                    out.meta[half][lane] = CwbvhNode::meta_leaf(face_offset, face_count);
                    out_faces.extend_from_slice(
                        &faces[face_index as usize..(face_index + face_count) as usize],
                    );
                    face_offset += face_count;
                }
            }
        }
        next_node += interior_rank;
        out_nodes[out_index as usize] = out;
    }

    debug_assert_eq!(next_node as usize, out_nodes.len());
    Ok(CwbvhScene {
        nodes: out_nodes,
        faces: out_faces,
    })
}

/// Decode the box of one child slot; used by tests and debugging tools.
pub fn decode_child_aabb(node: &CwbvhNode, slot: usize) -> Aabb {
    let (half, lane) = (slot / 4, slot % 4);
    let p = Vec3::from(node.p);
    let scale = Vec3::new(exp2i(node.e[0]), exp2i(node.e[1]), exp2i(node.e[2]));
    let lo = Vec3::new(
        f32::from(node.q_lo_x[half][lane]),
        f32::from(node.q_lo_y[half][lane]),
        f32::from(node.q_lo_z[half][lane]),
    );
    let hi = Vec3::new(
        f32::from(node.q_hi_x[half][lane]),
        f32::from(node.q_hi_y[half][lane]),
        f32::from(node.q_hi_z[half][lane]),
    );
    Aabb::new(p + lo * scale, p + hi * scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::{build_bvh, BvhBuildParams},
        collapse::{collapse, CollapseParams},
    };
    use gatling_gsd::Vertex;
    use nanorand::{Rng, WyRand};

    fn random_scene(count: usize, seed: u64) -> (Vec<Face>, Vec<Vertex>) {
        let mut rng = WyRand::new_seed(seed);
        let mut unit = move || rng.generate::<u32>() as f32 / u32::MAX as f32;
        let mut vertices = Vec::new();
        let mut faces = Vec::new();
        for _ in 0..count {
            let base = vertices.len() as u32;
            let origin = Vec3::new(unit(), unit(), unit());
            for _ in 0..3 {
                let p = origin + Vec3::new(unit(), unit(), unit()) * 0.1;
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

    #[test]
    fn exponent_covers_extent() {
        for extent in [0.0, 1.0e-7, 0.5, 1.0, 255.0, 10_000.0] {
            let e = quant_exponent(extent);
            assert!(255.0 * exp2i(e) >= extent, "extent {extent} exponent {e}");
        }
    }

    #[test]
    fn decoded_child_boxes_contain_the_inputs() {
        let (faces, vertices) = random_scene(256, 7);
        let params = BvhBuildParams {
            spatial_reserve_factor: 4.0,
            ..Default::default()
        };
        let bvh = build_bvh(&faces, &vertices, &params).unwrap();
        let wide = collapse(&bvh, &CollapseParams::default());
        let scene = compress(&wide, &bvh.faces).unwrap();

        // Walk compressed and wide trees in lockstep. Slot assignment is
        // deterministic, so replaying it recovers which wide child landed
        // in which slot.
        let mut stack = vec![(0usize, 0usize)];
        let mut visited = 0usize;
        while let Some((wide_index, out_index)) = stack.pop() {
            visited += 1;
            let wide_node = &wide.nodes[wide_index];
            let out = &scene.nodes[out_index];
            let slots = assign_slots(&wide_node.children, wide_node.aabb.center());
            let mut interior_rank = 0u32;
            for (slot, assigned) in slots.iter().enumerate() {
                let Some(child_index) = *assigned else {
                    assert_eq!(out.meta[slot / 4][slot % 4], 0);
                    continue;
                };
                let child = &wide_node.children[child_index];
                let decoded = decode_child_aabb(out, slot);
                assert!(
                    decoded.contains(&child.aabb),
                    "slot {slot} of node {out_index} clips its child"
                );
                if let WideChildKind::Interior(wide_child) = child.kind {
                    assert_ne!(out.imask & (1 << slot), 0);
                    stack.push((
                        wide_child as usize,
                        (out.child_base + interior_rank) as usize,
                    ));
                    interior_rank += 1;
                } else {
                    assert_eq!(out.imask & (1 << slot), 0);
                }
            }
        }
        assert_eq!(visited, wide.nodes.len());
    }

    #[test]
    fn face_runs_are_contiguous_per_node() {
        let (faces, vertices) = random_scene(200, 13);
        let params = BvhBuildParams {
            spatial_reserve_factor: 4.0,
            ..Default::default()
        };
        let bvh = build_bvh(&faces, &vertices, &params).unwrap();
        let wide = collapse(&bvh, &CollapseParams::default());
        let scene = compress(&wide, &bvh.faces).unwrap();
        assert_eq!(scene.faces.len(), bvh.faces.len());

        for node in &scene.nodes {
            let mut covered = 0u32;
            for slot in 0..WIDE_ARITY {
                let meta = node.meta[slot / 4][slot % 4];
                if meta == 0 || node.imask & (1 << slot) != 0 {
                    continue;
                }
                let offset = u32::from(meta & 0x1F);
                let count = (meta >> 5).count_ones();
                assert!(count >= 1 && count <= 3);
                assert_eq!(offset, covered, "leaf runs must be contiguous");
                covered += count;
                assert!(
                    (node.face_base + covered) as usize <= scene.faces.len(),
                    "face run escapes the buffer"
                );
            }
        }
    }
}
