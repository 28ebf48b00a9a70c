/*! Ray traversal against the compressed wide BVH.
 *
 *  This is the host-side rendition of the GPU traversal kernel: the same
 *  two-tuple group scheme, quantised slab tests and Möller–Trumbore
 *  triangle test, over the exact node and face records the kernel reads.
 *  The preprocessor uses it to validate freshly built scenes, and the
 *  test suite uses it as the reference the shader must agree with.
 *
 *  Traversal keeps two groups: a *node group* `(child base, hit bits in
 *  the top byte | imask in the low byte)` and a *face group* `(face base,
 *  hit bits in the low 24 bits)`. The most-significant set bit selects the
 *  next piece of work; XOR-ing slot indices with the ray-octant inverse
 *  makes that selection near-to-far.
 */

use arrayvec::ArrayVec;
use bytemuck::{Pod, Zeroable};
use gatling_gsd::{CwbvhNode, Face, Vertex};
use glam::Vec3;
use thiserror::Error;

/// Traversal stack bound. Overflow is a fatal traversal error; it takes a
/// tree deeper than this many pushed groups, which the builder never
/// produces for sane scenes.
pub const MAX_STACK_SIZE: usize = 32;

/// Determinant cutoff below which a triangle is treated as edge-on.
pub const TRI_EPS: f32 = 1.0e-9;

/// Default occupancy ratio below which cooperative traversal postpones
/// face groups.
pub const POSTPONE_RATIO: f32 = 0.2;

/// Sentinel face index reported for a miss in the GPU hit record.
pub const FACE_INDEX_MISS: u32 = 0xFFFF_FFFF;

#[derive(Debug, Copy, Clone)]
pub struct Ray {
    pub origin: Vec3,
    pub dir: Vec3,
    pub t_max: f32,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Hit {
    pub t: f32,
    /// Barycentric weight of the face's second vertex.
    pub u: f32,
    /// Barycentric weight of the face's third vertex.
    pub v: f32,
    pub face_index: u32,
}

/// The hit record as the kernel writes it into the hit-info queue.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct HitInfo {
    pub t: f32,
    pub u: f32,
    pub v: f32,
    pub face_index: u32,
}

impl HitInfo {
    pub const MISS: Self = Self {
        t: f32::MAX,
        u: 0.0,
        v: 0.0,
        face_index: FACE_INDEX_MISS,
    };
}

impl From<Option<Hit>> for HitInfo {
    fn from(hit: Option<Hit>) -> Self {
        match hit {
            Some(hit) => Self {
                t: hit.t,
                u: hit.u,
                v: hit.v,
                face_index: hit.face_index,
            },
            None => Self::MISS,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TraversalError {
    #[error("traversal stack overflowed its {MAX_STACK_SIZE}-entry bound")]
    StackOverflow,
}

/// Whether traversal keeps going once a hit is recorded. The closest-hit
/// and any-hit queries are the two instantiations of one kernel.
pub trait TraversalMode {
    const CONTINUE_AFTER_HIT: bool;
}

/// Shrink `t_max` on every hit and keep searching.
pub enum ClosestHit {}
impl TraversalMode for ClosestHit {
    const CONTINUE_AFTER_HIT: bool = true;
}

/// Return on the first hit.
pub enum AnyHit {}
impl TraversalMode for AnyHit {
    const CONTINUE_AFTER_HIT: bool = false;
}

/// Compile-time seam for triangle postponement. With [`NeverPostpone`]
/// the branch monomorphises away entirely, which is also the fallback for
/// targets without wave-ballot primitives.
pub trait Postpone {
    const ENABLED: bool;
    fn should_postpone(&mut self) -> bool;
}

#[derive(Debug, Default)]
pub struct NeverPostpone;

impl Postpone for NeverPostpone {
    const ENABLED: bool = false;
    fn should_postpone(&mut self) -> bool {
        false
    }
}

/// Postpone face groups while the cooperating wavefront's active-lane
/// count sits below `ratio` times its value at traversal start. The
/// ballot must eventually report recovered occupancy, as a real wavefront
/// does once lanes reconverge on node work.
pub struct BallotPostpone<F> {
    ballot: F,
    threshold: u32,
}

impl<F: FnMut() -> u32> BallotPostpone<F> {
    pub fn new(mut ballot: F, ratio: f32) -> Self {
        let initial = ballot();
        Self {
            ballot,
            threshold: (ratio * initial as f32).ceil() as u32,
        }
    }
}

impl<F: FnMut() -> u32> Postpone for BallotPostpone<F> {
    const ENABLED: bool = true;
    fn should_postpone(&mut self) -> bool {
        (self.ballot)() < self.threshold
    }
}

/// Möller–Trumbore, with near-edge-on determinants culled and the hit
/// window open at zero. Returns `(t, u, v)`.
pub fn intersect_triangle(
    origin: Vec3,
    dir: Vec3,
    p0: Vec3,
    p1: Vec3,
    p2: Vec3,
    t_max: f32,
) -> Option<(f32, f32, f32)> {
    let e1 = p1 - p0;
    let e2 = p2 - p0;
    let pvec = dir.cross(e2);
    let det = e1.dot(pvec);
    if det.abs() < TRI_EPS {
        return None;
    }
    let inv_det = 1.0 / det;
    let tvec = origin - p0;
    let u = tvec.dot(pvec) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let qvec = tvec.cross(e1);
    let v = dir.dot(qvec) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(qvec) * inv_det;
    (t > 0.0 && t < t_max).then_some((t, u, v))
}

/// A borrowed view over the three arrays traversal reads.
#[derive(Debug, Copy, Clone)]
pub struct CwbvhView<'a> {
    pub nodes: &'a [CwbvhNode],
    pub faces: &'a [Face],
    pub vertices: &'a [Vertex],
}

impl<'a> CwbvhView<'a> {
    pub fn new(nodes: &'a [CwbvhNode], faces: &'a [Face], vertices: &'a [Vertex]) -> Self {
        Self {
            nodes,
            faces,
            vertices,
        }
    }

    pub fn find_hit_closest(&self, ray: &Ray) -> Result<Option<Hit>, TraversalError> {
        self.traverse::<ClosestHit, _>(ray, &mut NeverPostpone)
    }

    pub fn find_hit_any(&self, ray: &Ray) -> Result<bool, TraversalError> {
        Ok(self.traverse::<AnyHit, _>(ray, &mut NeverPostpone)?.is_some())
    }

    /// Closest-hit query under a cooperative postponement heuristic.
    /// Results are identical to [`Self::find_hit_closest`]; only the
    /// order of deferred triangle work differs.
    pub fn find_hit_closest_with<P: Postpone>(
        &self,
        ray: &Ray,
        postpone: &mut P,
    ) -> Result<Option<Hit>, TraversalError> {
        self.traverse::<ClosestHit, P>(ray, postpone)
    }

    pub fn find_hit_any_with<P: Postpone>(
        &self,
        ray: &Ray,
        postpone: &mut P,
    ) -> Result<bool, TraversalError> {
        Ok(self.traverse::<AnyHit, P>(ray, postpone)?.is_some())
    }

    fn traverse<M: TraversalMode, P: Postpone>(
        &self,
        ray: &Ray,
        postpone: &mut P,
    ) -> Result<Option<Hit>, TraversalError> {
        if self.nodes.is_empty() {
            return Ok(None);
        }

        let mut t_max = ray.t_max;
        let mut best: Option<Hit> = None;
        // Zero direction components would turn the slab test into
        // 0 × ∞ = NaN; nudge them to a signed epsilon so the reciprocal
        // stays finite and the slab degenerates into a plane test.
        let dir = Vec3::new(fix_dir(ray.dir.x), fix_dir(ray.dir.y), fix_dir(ray.dir.z));
        let idir = dir.recip();
        let oct = (u32::from(dir.x < 0.0) << 2)
            | (u32::from(dir.y < 0.0) << 1)
            | u32::from(dir.z < 0.0);
        let oct_inv = 7 - oct;
        let oct_inv4 = oct_inv * 0x0101_0101;

        let mut stack: ArrayVec<(u32, u32), MAX_STACK_SIZE> = ArrayVec::new();
        // Seed: one synthetic hit bit; the slot decode collapses to node 0
        // because the low (imask) bits are all clear.
        let mut node_group = (0u32, 0x8000_0000u32);

        loop {
            let mut face_group;
            if node_group.1 & 0xFF00_0000 != 0 {
                let child_bit = 31 - (node_group.1 & 0xFF00_0000).leading_zeros();
                node_group.1 &= !(1 << child_bit);
                if node_group.1 & 0xFF00_0000 != 0 {
                    stack
                        .try_push(node_group)
                        .map_err(|_| TraversalError::StackOverflow)?;
                }
                let slot = (child_bit - 24) ^ (oct_inv & 7);
                let rel = (node_group.1 & 0xFF & ((1u32 << slot) - 1)).count_ones();
                let node = &self.nodes[(node_group.0 + rel) as usize];
                let hitmask = intersect_node(node, ray.origin, dir, idir, oct_inv4, t_max);
                node_group = (
                    node.child_base,
                    (hitmask & 0xFF00_0000) | u32::from(node.imask),
                );
                face_group = (node.face_base, hitmask & 0x00FF_FFFF);
            } else {
                face_group = node_group;
                node_group = (0, 0);
            }

            // Postpone divergent triangle work while the wavefront is
            // under-occupied, unless this group is the only work left.
            let has_other_work = node_group.1 & 0xFF00_0000 != 0 || !stack.is_empty();
            if P::ENABLED && face_group.1 != 0 && has_other_work && postpone.should_postpone() {
                stack
                    .try_push(face_group)
                    .map_err(|_| TraversalError::StackOverflow)?;
            } else {
                while face_group.1 != 0 {
                    let bit = 31 - face_group.1.leading_zeros();
                    face_group.1 &= !(1 << bit);
                    let face_index = face_group.0 + bit;
                    let face = &self.faces[face_index as usize];
                    let p0 = Vec3::from(self.vertices[face.indices[0] as usize].pos);
                    let p1 = Vec3::from(self.vertices[face.indices[1] as usize].pos);
                    let p2 = Vec3::from(self.vertices[face.indices[2] as usize].pos);
                    if let Some((t, u, v)) =
                        intersect_triangle(ray.origin, ray.dir, p0, p1, p2, t_max)
                    {
                        best = Some(Hit {
                            t,
                            u,
                            v,
                            face_index,
                        });
                        if !M::CONTINUE_AFTER_HIT {
                            return Ok(best);
                        }
                        t_max = t;
                    }
                }
            }

            if node_group.1 & 0xFF00_0000 == 0 {
                match stack.pop() {
                    Some(group) => node_group = group,
                    None => break,
                }
            }
        }
        Ok(best)
    }
}

/// `2^(e - 127)` for a stored exponent byte.
fn exp2i(e: u8) -> f32 {
    f32::from_bits(u32::from(e) << 23)
}

const DIR_EPS: f32 = 1.0e-20;

fn fix_dir(d: f32) -> f32 {
    if d.abs() > DIR_EPS {
        d
    } else if d.is_sign_negative() {
        -DIR_EPS
    } else {
        DIR_EPS
    }
}

/// Test all eight children of one node, in two 4-wide passes mirroring
/// the field layout. Returns the 32-bit hitmask: interior hits in the top
/// byte at `24 + (slot ^ oct_inv)`, leaf hits as unary face runs in the
/// low 24 bits.
fn intersect_node(
    node: &CwbvhNode,
    origin: Vec3,
    dir: Vec3,
    idir: Vec3,
    oct_inv4: u32,
    t_max: f32,
) -> u32 {
    let p = Vec3::from(node.p);
    let adj_idir = Vec3::new(
        exp2i(node.e[0]) * idir.x,
        exp2i(node.e[1]) * idir.y,
        exp2i(node.e[2]) * idir.z,
    );
    let origin_term = (p - origin) * idir;

    let mut hitmask = 0u32;
    for half in 0..2 {
        let meta4 = u32::from_le_bytes(node.meta[half]);
        if meta4 == 0 {
            continue;
        }
        let is_inner4 = (meta4 & (meta4 << 1)) & 0x1010_1010;
        let inner_mask4 = ((is_inner4 >> 4) & 0x0101_0101) * 0xFF;
        let bit_index4 = (meta4 ^ (oct_inv4 & inner_mask4)) & 0x1F1F_1F1F;
        let child_bits4 = (meta4 >> 5) & 0x0707_0707;

        for lane in 0..4 {
            if (meta4 >> (lane * 8)) & 0xFF == 0 {
                continue;
            }
            // The direction sign picks which quantised plane is the entry
            // one per axis, so swapped slabs come for free.
            let (qx_near, qx_far) = if dir.x < 0.0 {
                (node.q_hi_x[half][lane], node.q_lo_x[half][lane])
            } else {
                (node.q_lo_x[half][lane], node.q_hi_x[half][lane])
            };
            let (qy_near, qy_far) = if dir.y < 0.0 {
                (node.q_hi_y[half][lane], node.q_lo_y[half][lane])
            } else {
                (node.q_lo_y[half][lane], node.q_hi_y[half][lane])
            };
            let (qz_near, qz_far) = if dir.z < 0.0 {
                (node.q_hi_z[half][lane], node.q_lo_z[half][lane])
            } else {
                (node.q_lo_z[half][lane], node.q_hi_z[half][lane])
            };
            let t_near = Vec3::new(
                f32::from(qx_near),
                f32::from(qy_near),
                f32::from(qz_near),
            ) * adj_idir
                + origin_term;
            let t_far = Vec3::new(f32::from(qx_far), f32::from(qy_far), f32::from(qz_far))
                * adj_idir
                + origin_term;

            let t_min = t_near.max_element().max(0.0);
            let t_max_child = t_far.min_element().min(t_max);
            if t_min <= t_max_child {
                let child_bits = (child_bits4 >> (lane * 8)) & 0xFF;
                let bit_index = (bit_index4 >> (lane * 8)) & 0xFF;
                hitmask |= child_bits << bit_index;
            }
        }
    }
    hitmask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_info_layout() {
        assert_eq!(std::mem::size_of::<HitInfo>(), 16);
        assert_eq!(HitInfo::from(None).face_index, FACE_INDEX_MISS);
    }

    #[test]
    fn triangle_hit_barycentrics() {
        let hit = intersect_triangle(
            Vec3::new(0.25, 0.25, -1.0),
            Vec3::Z,
            Vec3::ZERO,
            Vec3::X,
            Vec3::Y,
            1.0e9,
        )
        .unwrap();
        assert!((hit.0 - 1.0).abs() < 1.0e-6);
        assert!((hit.1 - 0.25).abs() < 1.0e-6);
        assert!((hit.2 - 0.25).abs() < 1.0e-6);
    }

    #[test]
    fn triangle_window_is_open_at_zero() {
        // Origin on the triangle plane: t = 0 is not a hit.
        assert!(intersect_triangle(
            Vec3::new(0.25, 0.25, 0.0),
            Vec3::Z,
            Vec3::ZERO,
            Vec3::X,
            Vec3::Y,
            1.0e9,
        )
        .is_none());
    }

    #[test]
    fn edge_on_triangle_is_culled() {
        assert!(intersect_triangle(
            Vec3::new(0.5, -1.0, 0.0),
            Vec3::Y,
            Vec3::ZERO,
            Vec3::X,
            Vec3::new(2.0, 0.0, 0.0),
            1.0e9,
        )
        .is_none());
    }

    #[test]
    fn empty_view_misses() {
        let view = CwbvhView::new(&[], &[], &[]);
        let ray = Ray {
            origin: Vec3::ZERO,
            dir: Vec3::Z,
            t_max: 1.0e9,
        };
        assert_eq!(view.find_hit_closest(&ray).unwrap(), None);
        assert!(!view.find_hit_any(&ray).unwrap());
    }
}
