use arrayvec::ArrayVec;
use gatling_gsd::Aabb;

use crate::builder::{Bvh, BvhNode};

/// Maximum child count of a wide node.
pub const WIDE_ARITY: usize = 8;

#[derive(Debug, Clone)]
pub struct CollapseParams {
    /// Largest face count a wide leaf child may carry. The CWBVH encoding
    /// caps this at 3.
    pub max_leaf_size: u32,
    pub node_traversal_cost: f32,
    pub face_intersection_cost: f32,
}

impl Default for CollapseParams {
    fn default() -> Self {
        Self {
            max_leaf_size: 3,
            node_traversal_cost: 1.0,
            face_intersection_cost: 0.3,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WideChildKind {
    /// Index of another wide node.
    Interior(u32),
    /// A contiguous run of the face buffer.
    Leaf { face_index: u32, face_count: u32 },
}

#[derive(Debug, Copy, Clone)]
pub struct WideChild {
    pub aabb: Aabb,
    pub kind: WideChildKind,
}

#[derive(Debug, Clone, Default)]
pub struct WideBvhNode {
    pub aabb: Aabb,
    pub children: ArrayVec<WideChild, WIDE_ARITY>,
}

#[derive(Debug, Clone)]
pub struct WideBvh {
    pub nodes: Vec<WideBvhNode>,
    pub aabb: Aabb,
}

/// One entry of the in-flight child set while a wide node is being formed:
/// either a binary subtree that stays interior, or a face run that has
/// been absorbed into a leaf.
#[derive(Debug, Copy, Clone)]
enum Slot {
    Subtree(u32),
    Leaf {
        aabb: Aabb,
        face_index: u32,
        face_count: u32,
    },
}

/// Merge a binary BVH into a wide BVH with up to eight children per
/// interior node.
///
/// Children are gathered by repeatedly expanding the candidate with the
/// largest surface area (the subtree most worth skipping a traversal step
/// for) while the slot budget allows. A whole subtree is absorbed into a
/// single leaf when its faces fit `max_leaf_size` and the SAH metric
/// `node_traversal_cost + Σ faces · face_intersection_cost` favours the
/// flat run over keeping the subtree.
pub fn collapse(bvh: &Bvh, params: &CollapseParams) -> WideBvh {
    profiling::scope!("collapse_bvh");

    let max_leaf = params.max_leaf_size.max(1);
    let mut nodes = vec![WideBvhNode::default()];
    // (binary node, wide node being filled)
    let mut tasks = vec![(0u32, 0u32)];

    while let Some((binary_index, wide_index)) = tasks.pop() {
        let root = &bvh.nodes[binary_index as usize];
        let mut slots: Vec<Slot> = Vec::with_capacity(WIDE_ARITY);
        slots.push(resolve_slot(bvh, params, binary_index));

        loop {
            let used: u32 = slots.iter().map(|s| slot_usage(bvh, s, max_leaf)).sum();
            // Expand the widest interior candidate that still fits.
            let candidate = slots
                .iter()
                .enumerate()
                .filter_map(|(i, slot)| match slot {
                    Slot::Subtree(n) if !bvh.nodes[*n as usize].is_leaf() => {
                        Some((i, *n, bvh.nodes[*n as usize].aabb.surface_area()))
                    }
                    _ => None,
                })
                .max_by(|a, b| a.2.total_cmp(&b.2));
            let Some((slot_index, node_index, _)) = candidate else {
                break;
            };
            let node = &bvh.nodes[node_index as usize];
            let children = [node.child_index, node.child_index + 1];
            let expanded: u32 = children
                .iter()
                .map(|&c| slot_usage(bvh, &resolve_slot(bvh, params, c), max_leaf))
                .sum();
            if used - 1 + expanded > WIDE_ARITY as u32 {
                break;
            }
            slots.swap_remove(slot_index);
            for child in children {
                slots.push(resolve_slot(bvh, params, child));
            }
        }

        let mut wide = WideBvhNode {
            aabb: root.aabb,
            children: ArrayVec::new(),
        };
        for slot in slots {
            match slot {
                Slot::Subtree(n) => {
                    let node = &bvh.nodes[n as usize];
                    if node.is_leaf() {
                        push_leaf_chunks(&mut wide, node, max_leaf);
                    } else {
                        let child_wide = nodes.len() as u32;
                        nodes.push(WideBvhNode::default());
                        tasks.push((n, child_wide));
                        wide.children.push(WideChild {
                            aabb: node.aabb,
                            kind: WideChildKind::Interior(child_wide),
                        });
                    }
                }
                Slot::Leaf {
                    aabb,
                    face_index,
                    face_count,
                } => {
                    let mut offset = 0;
                    while offset < face_count {
                        let count = (face_count - offset).min(max_leaf);
                        wide.children.push(WideChild {
                            aabb,
                            kind: WideChildKind::Leaf {
                                face_index: face_index + offset,
                                face_count: count,
                            },
                        });
                        offset += count;
                    }
                }
            }
        }
        nodes[wide_index as usize] = wide;
    }

    WideBvh {
        nodes,
        aabb: bvh.aabb,
    }
}

/// Decide what a binary node contributes: itself, or — when its whole
/// subtree is small and the SAH favours it — a single absorbed face run.
fn resolve_slot(bvh: &Bvh, params: &CollapseParams, index: u32) -> Slot {
    let node = &bvh.nodes[index as usize];
    if node.is_leaf() {
        return Slot::Subtree(index);
    }
    let Some((face_index, face_count)) = subtree_face_run(bvh, index, params.max_leaf_size) else {
        return Slot::Subtree(index);
    };
    let leaf_cost = face_count as f32 * params.face_intersection_cost;
    if leaf_cost <= subtree_cost(bvh, index, params) {
        Slot::Leaf {
            aabb: node.aabb,
            face_index,
            face_count,
        }
    } else {
        Slot::Subtree(index)
    }
}

fn slot_usage(bvh: &Bvh, slot: &Slot, max_leaf: u32) -> u32 {
    let chunks = |count: u32| count.div_ceil(max_leaf);
    match slot {
        Slot::Subtree(n) => {
            let node = &bvh.nodes[*n as usize];
            if node.is_leaf() {
                chunks(node.face_count)
            } else {
                1
            }
        }
        Slot::Leaf { face_count, .. } => chunks(*face_count),
    }
}

fn push_leaf_chunks(wide: &mut WideBvhNode, node: &BvhNode, max_leaf: u32) {
    let mut offset = 0;
    while offset < node.face_count {
        let count = (node.face_count - offset).min(max_leaf);
        wide.children.push(WideChild {
            aabb: node.aabb,
            kind: WideChildKind::Leaf {
                face_index: node.face_index + offset,
                face_count: count,
            },
        });
        offset += count;
    }
}

/// The contiguous face run covered by a subtree, if it is small enough to
/// absorb. The builder emits descendant leaves depth-first, so the run is
/// contiguous whenever it exists; this walks and verifies rather than
/// assuming.
fn subtree_face_run(bvh: &Bvh, index: u32, max_faces: u32) -> Option<(u32, u32)> {
    let mut stack = vec![index];
    let mut lo = u32::MAX;
    let mut hi = 0u32;
    let mut total = 0u32;
    while let Some(i) = stack.pop() {
        let node = &bvh.nodes[i as usize];
        if node.is_leaf() {
            lo = lo.min(node.face_index);
            hi = hi.max(node.face_index + node.face_count);
            total += node.face_count;
            if total > max_faces {
                return None;
            }
        } else {
            stack.push(node.child_index);
            stack.push(node.child_index + 1);
        }
    }
    (hi - lo == total).then_some((lo, total))
}

fn subtree_cost(bvh: &Bvh, index: u32, params: &CollapseParams) -> f32 {
    let node = &bvh.nodes[index as usize];
    if node.is_leaf() {
        return node.face_count as f32 * params.face_intersection_cost;
    }
    let area = node.aabb.surface_area().max(f32::MIN_POSITIVE);
    let mut cost = params.node_traversal_cost;
    for child in [node.child_index, node.child_index + 1] {
        let child_node = &bvh.nodes[child as usize];
        cost += child_node.aabb.surface_area() / area * subtree_cost(bvh, child, params);
    }
    cost
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build_bvh, BvhBuildParams};
    use gatling_gsd::{Face, Vertex};

    fn grid_scene(n: usize) -> (Vec<Face>, Vec<Vertex>) {
        let mut vertices = Vec::new();
        let mut faces = Vec::new();
        for i in 0..n {
            for j in 0..n {
                let base = vertices.len() as u32;
                let (x, y) = (i as f32, j as f32);
                for pos in [
                    [x, y, 0.0],
                    [x + 0.9, y, 0.0],
                    [x, y + 0.9, (i + j) as f32 * 0.01],
                ] {
                    vertices.push(Vertex {
                        pos,
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
        }
        (faces, vertices)
    }

    fn face_coverage(wide: &WideBvh, expected: usize) {
        let mut seen = vec![false; expected];
        let mut stack = vec![0u32];
        while let Some(i) = stack.pop() {
            let node = &wide.nodes[i as usize];
            assert!(node.children.len() <= WIDE_ARITY);
            for child in &node.children {
                match child.kind {
                    WideChildKind::Interior(c) => stack.push(c),
                    WideChildKind::Leaf {
                        face_index,
                        face_count,
                    } => {
                        assert!(face_count > 0, "leaf children must not be empty");
                        for f in face_index..face_index + face_count {
                            assert!(!seen[f as usize], "face referenced twice");
                            seen[f as usize] = true;
                        }
                    }
                }
            }
        }
        assert!(seen.into_iter().all(|s| s), "every face must be reachable");
    }

    #[test]
    fn collapses_a_grid() {
        let (faces, vertices) = grid_scene(8);
        let bvh = build_bvh(&faces, &vertices, &BvhBuildParams::default()).unwrap();
        let wide = collapse(&bvh, &CollapseParams::default());
        face_coverage(&wide, bvh.faces.len());
        for node in &wide.nodes {
            for child in &node.children {
                if let WideChildKind::Leaf { face_count, .. } = child.kind {
                    assert!(face_count <= 3);
                }
            }
        }
    }

    #[test]
    fn single_leaf_root() {
        let (faces, vertices) = grid_scene(1);
        let bvh = build_bvh(&faces, &vertices, &BvhBuildParams::default()).unwrap();
        let wide = collapse(&bvh, &CollapseParams::default());
        assert_eq!(wide.nodes.len(), 1);
        face_coverage(&wide, 1);
    }
}
