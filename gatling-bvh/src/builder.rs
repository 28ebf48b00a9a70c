use arrayvec::ArrayVec;
use gatling_gsd::{Aabb, Face, Vertex};
use glam::Vec3;

use crate::BuildError;

/// Cost charged for stepping through one interior node, in the same units
/// as `face_intersection_cost`.
const NODE_TRAVERSAL_COST: f32 = 1.0;

/// Floor for the adaptive object-binning schedule.
const MIN_OBJECT_BINS: u32 = 8;

/// How object-split candidate planes are generated.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BinningMode {
    /// `object_bin_count` bins at every depth.
    Fixed,
    /// Bin count halves every two levels, floored at eight.
    Adaptive,
}

#[derive(Debug, Clone)]
pub struct BvhBuildParams<'a> {
    /// Granularity of the initial face scan. Results do not depend on it;
    /// it exists so a parallel build can adopt the same batching.
    pub face_batch_size: u32,
    pub leaf_max_face_count: u32,
    pub face_intersection_cost: f32,
    pub object_binning_mode: BinningMode,
    /// Below this face count object splits use an exact sweep over sorted
    /// centroids instead of binning.
    pub object_binning_threshold: u32,
    pub object_bin_count: u32,
    pub spatial_bin_count: u32,
    /// The work buffer is reserved at `input_face_count` times this
    /// factor; spatial-split duplication beyond the reservation fails the
    /// build before anything overflows.
    pub spatial_reserve_factor: f32,
    /// Spatial splits are only attempted when the object split's child
    /// overlap area exceeds this fraction of the root surface area.
    pub spatial_split_alpha: f32,
    /// Optional per-face SAH cost multipliers, e.g. frustum-quality
    /// weights from the preprocessor. Must match the face count.
    pub face_weights: Option<&'a [f32]>,
}

impl Default for BvhBuildParams<'_> {
    fn default() -> Self {
        Self {
            face_batch_size: 1024,
            leaf_max_face_count: 3,
            face_intersection_cost: 1.2,
            object_binning_mode: BinningMode::Adaptive,
            object_binning_threshold: 1024,
            object_bin_count: 16,
            spatial_bin_count: 32,
            spatial_reserve_factor: 1.3,
            spatial_split_alpha: 1.0e-5,
            face_weights: None,
        }
    }
}

/// One binary-BVH node. Interior nodes have `face_count == 0` and their
/// children at `child_index` and `child_index + 1`; leaves reference
/// `face_count` entries of [`Bvh::faces`] starting at `face_index`.
#[derive(Debug, Copy, Clone)]
pub struct BvhNode {
    pub aabb: Aabb,
    pub child_index: u32,
    pub face_index: u32,
    pub face_count: u32,
}

impl BvhNode {
    pub fn is_leaf(&self) -> bool {
        self.face_count > 0
    }
}

/// A binary BVH over a reorganised (and possibly duplicated) face buffer.
#[derive(Debug, Clone)]
pub struct Bvh {
    pub nodes: Vec<BvhNode>,
    pub faces: Vec<Face>,
    pub aabb: Aabb,
}

/// One face reference in flight during construction. Spatial splits may
/// duplicate an item with mutually chopped boxes; `aabb` is therefore the
/// box of the face *fragment* this item stands for.
#[derive(Debug, Copy, Clone)]
struct WorkItem {
    aabb: Aabb,
    centroid: Vec3,
    face: u32,
    weight: f32,
}

const DUMMY_ITEM: WorkItem = WorkItem {
    aabb: Aabb::EMPTY,
    centroid: Vec3::ZERO,
    face: 0,
    weight: 0.0,
};

#[derive(Debug, Copy, Clone)]
struct Task {
    node: u32,
    start: usize,
    end: usize,
    /// Exclusive end of the buffer region this task may grow into.
    limit: usize,
    depth: u32,
}

#[derive(Debug, Copy, Clone, Default)]
struct ObjectBin {
    aabb: Aabb,
    count: u32,
    weight: f32,
}

#[derive(Debug, Copy, Clone, Default)]
struct SpatialBin {
    aabb: Aabb,
    enter: u32,
    exit: u32,
    enter_weight: f32,
    exit_weight: f32,
}

#[derive(Debug, Copy, Clone)]
enum ObjectSplitKind {
    /// Partition by bin index below `split_bin` along the binning line
    /// described by `(origin, inv_width)`.
    Binned {
        split_bin: usize,
        origin: f32,
        inv_width: f32,
        bin_count: usize,
    },
    /// First `index` items after sorting by centroid along the axis.
    Sweep { index: usize },
}

#[derive(Debug, Copy, Clone)]
struct ObjectSplit {
    axis: usize,
    cost: f32,
    left_aabb: Aabb,
    right_aabb: Aabb,
    kind: ObjectSplitKind,
}

#[derive(Debug, Copy, Clone)]
struct SpatialSplit {
    axis: usize,
    cost: f32,
    plane: f32,
}

struct Builder<'a> {
    faces: &'a [Face],
    vertices: &'a [Vertex],
    params: &'a BvhBuildParams<'a>,
    /// Work buffer, fully initialised to `reserve` items up front so
    /// regions can slide freely inside their slack.
    items: Vec<WorkItem>,
    live_items: usize,
    nodes: Vec<BvhNode>,
    out_faces: Vec<Face>,
    root_area: f32,
    // Scratch buffers reused across tasks.
    object_bins: Vec<ObjectBin>,
    spatial_bins: Vec<SpatialBin>,
    suffix: Vec<(Aabb, f32)>,
    left_scratch: Vec<WorkItem>,
    right_scratch: Vec<WorkItem>,
}

/// Build a binary BVH over `faces`. The returned tree references a
/// reorganised face buffer; faces that were degenerate (repeated indices
/// or a zero-extent box on all three axes) are dropped with a warning.
pub fn build_bvh(
    faces: &[Face],
    vertices: &[Vertex],
    params: &BvhBuildParams<'_>,
) -> Result<Bvh, BuildError> {
    profiling::scope!("build_bvh");

    if let Some(weights) = params.face_weights {
        if weights.len() != faces.len() {
            return Err(BuildError::WeightCountMismatch {
                got: weights.len(),
                expected: faces.len(),
            });
        }
    }

    let reserve = ((faces.len() as f64 * f64::from(params.spatial_reserve_factor.max(1.0)))
        .ceil() as usize)
        .max(faces.len());

    let mut items = Vec::with_capacity(reserve);
    let mut dropped = 0usize;
    let batch = params.face_batch_size.max(1) as usize;
    // Batched so that a parallel build can later take one chunk per task
    // without changing the output.
    for (chunk_index, chunk) in faces.chunks(batch).enumerate() {
        for (offset, face) in chunk.iter().enumerate() {
            let index = (chunk_index * batch + offset) as u32;
            let aabb = face_aabb(face, vertices);
            if face.is_degenerate() || aabb.extent() == Vec3::ZERO {
                dropped += 1;
                continue;
            }
            items.push(WorkItem {
                aabb,
                centroid: aabb.center(),
                face: index,
                weight: params
                    .face_weights
                    .map_or(1.0, |w| w[index as usize].max(0.0)),
            });
        }
    }
    if dropped > 0 {
        log::warn!("dropped {dropped} degenerate faces during BVH construction");
    }
    if items.is_empty() {
        return Err(BuildError::NoUsableFaces { dropped });
    }

    let count = items.len();
    items.resize(reserve, DUMMY_ITEM);
    let aabb = items[..count]
        .iter()
        .fold(Aabb::EMPTY, |acc, item| acc.union(&item.aabb));

    let mut builder = Builder {
        faces,
        vertices,
        params,
        items,
        live_items: count,
        nodes: Vec::with_capacity(2 * count),
        out_faces: Vec::with_capacity(reserve),
        root_area: aabb.surface_area().max(f32::MIN_POSITIVE),
        object_bins: vec![ObjectBin::default(); params.object_bin_count.max(2) as usize],
        spatial_bins: vec![SpatialBin::default(); params.spatial_bin_count.max(2) as usize],
        suffix: Vec::new(),
        left_scratch: Vec::new(),
        right_scratch: Vec::new(),
    };

    builder.nodes.push(BvhNode {
        aabb,
        child_index: 0,
        face_index: 0,
        face_count: 0,
    });
    let mut tasks = vec![Task {
        node: 0,
        start: 0,
        end: count,
        limit: reserve,
        depth: 0,
    }];
    while let Some(task) = tasks.pop() {
        builder.process(task, &mut tasks)?;
    }

    let Builder {
        nodes, out_faces, ..
    } = builder;
    Ok(Bvh {
        nodes,
        faces: out_faces,
        aabb,
    })
}

fn face_aabb(face: &Face, vertices: &[Vertex]) -> Aabb {
    Aabb::from_points(
        face.indices
            .iter()
            .map(|&i| Vec3::from(vertices[i as usize].pos)),
    )
}

fn largest_axis(extent: Vec3) -> usize {
    if extent.x >= extent.y && extent.x >= extent.z {
        0
    } else if extent.y >= extent.z {
        1
    } else {
        2
    }
}

fn partition_in_place<F: Fn(&WorkItem) -> bool>(items: &mut [WorkItem], pred: F) -> usize {
    let mut i = 0;
    let mut j = items.len();
    while i < j {
        if pred(&items[i]) {
            i += 1;
        } else {
            j -= 1;
            items.swap(i, j);
        }
    }
    i
}

fn union_of(items: &[WorkItem]) -> Aabb {
    items
        .iter()
        .fold(Aabb::EMPTY, |acc, item| acc.union(&item.aabb))
}

/// Clip the triangle to the slab `lo <= p[axis] <= hi` and return the
/// bounding box of the clipped polygon. Infinite bounds skip that plane.
fn clip_triangle_to_slab(verts: [Vec3; 3], axis: usize, lo: f32, hi: f32) -> Aabb {
    let mut poly: ArrayVec<Vec3, 8> = verts.into_iter().collect();
    let mut scratch: ArrayVec<Vec3, 8> = ArrayVec::new();
    for (value, keep_below) in [(lo, false), (hi, true)] {
        if !value.is_finite() {
            continue;
        }
        scratch.clear();
        for i in 0..poly.len() {
            let a = poly[i];
            let b = poly[(i + 1) % poly.len()];
            let da = if keep_below { a[axis] - value } else { value - a[axis] };
            let db = if keep_below { b[axis] - value } else { value - b[axis] };
            if da <= 0.0 {
                scratch.push(a);
            }
            if (da < 0.0) != (db < 0.0) && da != db {
                let t = da / (da - db);
                scratch.push(a + (b - a) * t);
            }
        }
        std::mem::swap(&mut poly, &mut scratch);
        if poly.is_empty() {
            return Aabb::EMPTY;
        }
    }
    Aabb::from_points(poly.iter().copied())
}

impl Builder<'_> {
    fn process(&mut self, task: Task, tasks: &mut Vec<Task>) -> Result<(), BuildError> {
        let count = task.end - task.start;
        let node_area = self.nodes[task.node as usize]
            .aabb
            .surface_area()
            .max(f32::MIN_POSITIVE);
        let node_aabb = self.nodes[task.node as usize].aabb;
        let weight_sum: f32 = self.items[task.start..task.end]
            .iter()
            .map(|i| i.weight)
            .sum();
        let leaf_cost = weight_sum * self.params.face_intersection_cost;

        let within_leaf_budget = count <= self.params.leaf_max_face_count.max(1) as usize;
        if count <= 1 {
            self.emit_leaf(task);
            return Ok(());
        }

        let object = self.find_object_split(&task, node_area);

        let spatial = match &object {
            Some(object) => {
                let overlap = object.left_aabb.intersection(&object.right_aabb);
                if !overlap.is_empty()
                    && overlap.surface_area() / self.root_area > self.params.spatial_split_alpha
                {
                    self.find_spatial_split(&task, node_aabb, node_area)
                } else {
                    None
                }
            }
            None => None,
        };

        let object_cost = object.as_ref().map_or(f32::INFINITY, |o| o.cost);
        let spatial_cost = spatial.as_ref().map_or(f32::INFINITY, |s| s.cost);

        if within_leaf_budget && object_cost.min(spatial_cost) >= leaf_cost {
            self.emit_leaf(task);
            return Ok(());
        }

        if spatial_cost < object_cost {
            self.apply_spatial_split(task, spatial.unwrap(), tasks)
        } else if let Some(object) = object {
            self.apply_object_split(task, object, tasks);
            Ok(())
        } else {
            // All centroids coincide; a median split keeps the recursion
            // terminating.
            self.apply_median_split(task, tasks);
            Ok(())
        }
    }

    fn emit_leaf(&mut self, task: Task) {
        let faces = self.faces;
        let node = &mut self.nodes[task.node as usize];
        node.face_index = self.out_faces.len() as u32;
        node.face_count = (task.end - task.start) as u32;
        let items = &self.items[task.start..task.end];
        self.out_faces
            .extend(items.iter().map(|item| faces[item.face as usize]));
    }

    fn effective_object_bins(&self, depth: u32) -> usize {
        let configured = self.params.object_bin_count.max(2);
        match self.params.object_binning_mode {
            BinningMode::Fixed => configured as usize,
            BinningMode::Adaptive => {
                (configured >> (depth / 2)).max(MIN_OBJECT_BINS.min(configured)) as usize
            }
        }
    }

    fn find_object_split(&mut self, task: &Task, node_area: f32) -> Option<ObjectSplit> {
        if task.end - task.start <= self.params.object_binning_threshold as usize {
            self.find_object_split_sweep(task, node_area)
        } else {
            self.find_object_split_binned(task, node_area)
        }
    }

    fn find_object_split_sweep(&mut self, task: &Task, node_area: f32) -> Option<ObjectSplit> {
        let count = task.end - task.start;
        let ci = self.params.face_intersection_cost;
        let mut best: Option<ObjectSplit> = None;

        for axis in 0..3 {
            let items = &mut self.items[task.start..task.end];
            items.sort_unstable_by(|a, b| a.centroid[axis].total_cmp(&b.centroid[axis]));

            self.suffix.clear();
            self.suffix.resize(count + 1, (Aabb::EMPTY, 0.0));
            let items = &self.items[task.start..task.end];
            for i in (0..count).rev() {
                let (aabb, weight) = self.suffix[i + 1];
                self.suffix[i] = (aabb.union(&items[i].aabb), weight + items[i].weight);
            }

            let mut prefix = Aabb::EMPTY;
            let mut prefix_weight = 0.0f32;
            for i in 1..count {
                prefix = prefix.union(&items[i - 1].aabb);
                prefix_weight += items[i - 1].weight;
                let (right_aabb, right_weight) = self.suffix[i];
                let cost = NODE_TRAVERSAL_COST
                    + (prefix.surface_area() * prefix_weight
                        + right_aabb.surface_area() * right_weight)
                        * ci
                        / node_area;
                if best.as_ref().map_or(true, |b| cost < b.cost) {
                    best = Some(ObjectSplit {
                        axis,
                        cost,
                        left_aabb: prefix,
                        right_aabb,
                        kind: ObjectSplitKind::Sweep { index: i },
                    });
                }
            }
        }
        best
    }

    fn find_object_split_binned(&mut self, task: &Task, node_area: f32) -> Option<ObjectSplit> {
        let ci = self.params.face_intersection_cost;
        let count = task.end - task.start;
        let bin_count = self.effective_object_bins(task.depth);
        let centroid_bounds = self.items[task.start..task.end]
            .iter()
            .fold(Aabb::EMPTY, |mut acc, item| {
                acc.grow(item.centroid);
                acc
            });
        let mut best: Option<ObjectSplit> = None;

        for axis in 0..3 {
            let origin = centroid_bounds.min[axis];
            let extent = centroid_bounds.max[axis] - origin;
            if !(extent > 0.0) {
                continue;
            }
            let inv_width = bin_count as f32 / extent;

            {
                let bins = &mut self.object_bins[..bin_count];
                bins.fill(ObjectBin::default());
                for item in &self.items[task.start..task.end] {
                    let bin = (((item.centroid[axis] - origin) * inv_width) as usize)
                        .min(bin_count - 1);
                    bins[bin].aabb = bins[bin].aabb.union(&item.aabb);
                    bins[bin].count += 1;
                    bins[bin].weight += item.weight;
                }
            }

            self.suffix.clear();
            self.suffix.resize(bin_count + 1, (Aabb::EMPTY, 0.0));
            for b in (0..bin_count).rev() {
                let (aabb, weight) = self.suffix[b + 1];
                self.suffix[b] = (
                    aabb.union(&self.object_bins[b].aabb),
                    weight + self.object_bins[b].weight,
                );
            }

            let mut prefix = Aabb::EMPTY;
            let mut prefix_weight = 0.0f32;
            let mut prefix_count = 0u32;
            for b in 1..bin_count {
                let bin = self.object_bins[b - 1];
                prefix = prefix.union(&bin.aabb);
                prefix_weight += bin.weight;
                prefix_count += bin.count;
                if prefix_count == 0 || prefix_count as usize == count {
                    continue;
                }
                let (right_aabb, right_weight) = self.suffix[b];
                let cost = NODE_TRAVERSAL_COST
                    + (prefix.surface_area() * prefix_weight
                        + right_aabb.surface_area() * right_weight)
                        * ci
                        / node_area;
                if best.as_ref().map_or(true, |s| cost < s.cost) {
                    best = Some(ObjectSplit {
                        axis,
                        cost,
                        left_aabb: prefix,
                        right_aabb,
                        kind: ObjectSplitKind::Binned {
                            split_bin: b,
                            origin,
                            inv_width,
                            bin_count,
                        },
                    });
                }
            }
        }
        best
    }

    fn find_spatial_split(
        &mut self,
        task: &Task,
        node_aabb: Aabb,
        node_area: f32,
    ) -> Option<SpatialSplit> {
        let ci = self.params.face_intersection_cost;
        let count = task.end - task.start;
        let bin_count = self.params.spatial_bin_count.max(2) as usize;
        let mut best: Option<SpatialSplit> = None;

        for axis in 0..3 {
            let origin = node_aabb.min[axis];
            let extent = node_aabb.max[axis] - origin;
            if !(extent > 0.0) {
                continue;
            }
            let width = extent / bin_count as f32;
            let inv_width = 1.0 / width;

            self.spatial_bins[..bin_count].fill(SpatialBin::default());
            for item_index in task.start..task.end {
                let item = self.items[item_index];
                let first = (((item.aabb.min[axis] - origin) * inv_width) as usize)
                    .min(bin_count - 1);
                let last = (((item.aabb.max[axis] - origin) * inv_width) as usize)
                    .min(bin_count - 1)
                    .max(first);
                if first == last {
                    let bin = &mut self.spatial_bins[first];
                    bin.aabb = bin.aabb.union(&item.aabb);
                } else {
                    let verts = self.face_vertices(item.face);
                    for b in first..=last {
                        let lo = origin + b as f32 * width;
                        let hi = origin + (b + 1) as f32 * width;
                        let clipped =
                            clip_triangle_to_slab(verts, axis, lo, hi).intersection(&item.aabb);
                        if !clipped.is_empty() {
                            let bin = &mut self.spatial_bins[b];
                            bin.aabb = bin.aabb.union(&clipped);
                        }
                    }
                }
                self.spatial_bins[first].enter += 1;
                self.spatial_bins[first].enter_weight += item.weight;
                self.spatial_bins[last].exit += 1;
                self.spatial_bins[last].exit_weight += item.weight;
            }

            self.suffix.clear();
            self.suffix.resize(bin_count + 1, (Aabb::EMPTY, 0.0));
            for b in (0..bin_count).rev() {
                let (aabb, weight) = self.suffix[b + 1];
                self.suffix[b] = (
                    aabb.union(&self.spatial_bins[b].aabb),
                    weight + self.spatial_bins[b].exit_weight,
                );
            }

            let mut prefix = Aabb::EMPTY;
            let mut prefix_weight = 0.0f32;
            let mut prefix_count = 0u32;
            let mut exit_prefix = 0u32;
            for b in 1..bin_count {
                let bin = self.spatial_bins[b - 1];
                prefix = prefix.union(&bin.aabb);
                prefix_weight += bin.enter_weight;
                prefix_count += bin.enter;
                exit_prefix += bin.exit;
                let right_count = count as u32 - exit_prefix;
                if prefix_count == 0 || right_count == 0 {
                    continue;
                }
                let (right_aabb, right_weight) = self.suffix[b];
                let cost = NODE_TRAVERSAL_COST
                    + (prefix.surface_area() * prefix_weight
                        + right_aabb.surface_area() * right_weight)
                        * ci
                        / node_area;
                if best.as_ref().map_or(true, |s| cost < s.cost) {
                    best = Some(SpatialSplit {
                        axis,
                        cost,
                        plane: origin + b as f32 * width,
                    });
                }
            }
        }
        best
    }

    fn face_vertices(&self, face: u32) -> [Vec3; 3] {
        let face = &self.faces[face as usize];
        [
            Vec3::from(self.vertices[face.indices[0] as usize].pos),
            Vec3::from(self.vertices[face.indices[1] as usize].pos),
            Vec3::from(self.vertices[face.indices[2] as usize].pos),
        ]
    }

    /// Split the task's region at `mid`, handing each child a share of the
    /// slack proportional to its item count. Items `[start, mid)` stay
    /// put; items `[mid, end)` move to the start of the right child's
    /// region. Child boxes are recomputed from the actual partition so
    /// they are always exact.
    fn push_children(&mut self, task: Task, mid: usize, tasks: &mut Vec<Task>) {
        let left_count = mid - task.start;
        let right_count = task.end - mid;
        debug_assert!(left_count > 0 && right_count > 0);

        let left_aabb = union_of(&self.items[task.start..mid]);
        let right_aabb = union_of(&self.items[mid..task.end]);

        let slack = task.limit - task.start - (left_count + right_count);
        let left_limit = task.start + left_count + slack * left_count / (left_count + right_count);
        let right_start = left_limit;
        self.items.copy_within(mid..task.end, right_start);

        let left_node = self.nodes.len() as u32;
        self.nodes[task.node as usize].child_index = left_node;
        self.nodes.push(BvhNode {
            aabb: left_aabb,
            child_index: 0,
            face_index: 0,
            face_count: 0,
        });
        self.nodes.push(BvhNode {
            aabb: right_aabb,
            child_index: 0,
            face_index: 0,
            face_count: 0,
        });
        tasks.push(Task {
            node: left_node,
            start: task.start,
            end: mid,
            limit: left_limit,
            depth: task.depth + 1,
        });
        tasks.push(Task {
            node: left_node + 1,
            start: right_start,
            end: right_start + right_count,
            limit: task.limit,
            depth: task.depth + 1,
        });
    }

    fn apply_object_split(&mut self, task: Task, split: ObjectSplit, tasks: &mut Vec<Task>) {
        let axis = split.axis;
        let items = &mut self.items[task.start..task.end];
        let mid_rel = match split.kind {
            ObjectSplitKind::Sweep { index } => {
                items.sort_unstable_by(|a, b| a.centroid[axis].total_cmp(&b.centroid[axis]));
                index
            }
            ObjectSplitKind::Binned {
                split_bin,
                origin,
                inv_width,
                bin_count,
            } => partition_in_place(items, |item| {
                ((((item.centroid[axis] - origin) * inv_width) as usize).min(bin_count - 1))
                    < split_bin
            }),
        };
        if mid_rel == 0 || mid_rel == items.len() {
            self.apply_median_split(task, tasks);
            return;
        }
        self.push_children(task, task.start + mid_rel, tasks);
    }

    fn apply_median_split(&mut self, task: Task, tasks: &mut Vec<Task>) {
        let axis = largest_axis(self.nodes[task.node as usize].aabb.extent());
        let items = &mut self.items[task.start..task.end];
        items.sort_unstable_by(|a, b| a.centroid[axis].total_cmp(&b.centroid[axis]));
        let mid_rel = items.len() / 2;
        self.push_children(task, task.start + mid_rel, tasks);
    }

    fn apply_spatial_split(
        &mut self,
        task: Task,
        split: SpatialSplit,
        tasks: &mut Vec<Task>,
    ) -> Result<(), BuildError> {
        let axis = split.axis;
        let plane = split.plane;
        self.left_scratch.clear();
        self.right_scratch.clear();

        for item_index in task.start..task.end {
            let item = self.items[item_index];
            if item.aabb.max[axis] <= plane {
                self.left_scratch.push(item);
            } else if item.aabb.min[axis] >= plane {
                self.right_scratch.push(item);
            } else {
                // Straddler: duplicate the reference, chopping each copy's
                // box at the plane. The intersection keeps any chop
                // inherited from an ancestor split.
                let verts = self.face_vertices(item.face);
                let left_part = clip_triangle_to_slab(verts, axis, f32::NEG_INFINITY, plane)
                    .intersection(&item.aabb);
                let right_part = clip_triangle_to_slab(verts, axis, plane, f32::INFINITY)
                    .intersection(&item.aabb);
                if left_part.is_empty() && right_part.is_empty() {
                    // Clipping collapsed on a sliver box; never lose the
                    // reference.
                    self.left_scratch.push(item);
                    continue;
                }
                if !left_part.is_empty() {
                    self.left_scratch.push(WorkItem {
                        aabb: left_part,
                        centroid: left_part.center(),
                        ..item
                    });
                }
                if !right_part.is_empty() {
                    self.right_scratch.push(WorkItem {
                        aabb: right_part,
                        centroid: right_part.center(),
                        ..item
                    });
                }
            }
        }

        let left_count = self.left_scratch.len();
        let right_count = self.right_scratch.len();
        if left_count == 0 || right_count == 0 {
            // The binned estimate promised both sides but the exact
            // partition disagreed; fall back to an object-style split.
            self.apply_median_split(task, tasks);
            return Ok(());
        }

        let region = task.limit - task.start;
        if left_count + right_count > region {
            let growth = left_count + right_count - (task.end - task.start);
            if self.live_items + growth > self.items.len() {
                return Err(BuildError::ReservationExceeded {
                    needed: self.live_items + growth,
                    reserved: self.items.len(),
                });
            }
            // The total budget still has room but this region's share of
            // the slack is spent; split without duplicating instead.
            self.apply_median_split(task, tasks);
            return Ok(());
        }
        self.live_items += left_count + right_count - (task.end - task.start);

        let slack = region - (left_count + right_count);
        let left_limit = task.start + left_count + slack * left_count / (left_count + right_count);
        let right_start = left_limit;
        self.items[task.start..task.start + left_count].copy_from_slice(&self.left_scratch);
        self.items[right_start..right_start + right_count].copy_from_slice(&self.right_scratch);

        let left_aabb = union_of(&self.left_scratch);
        let right_aabb = union_of(&self.right_scratch);
        let left_node = self.nodes.len() as u32;
        self.nodes[task.node as usize].child_index = left_node;
        self.nodes.push(BvhNode {
            aabb: left_aabb,
            child_index: 0,
            face_index: 0,
            face_count: 0,
        });
        self.nodes.push(BvhNode {
            aabb: right_aabb,
            child_index: 0,
            face_index: 0,
            face_count: 0,
        });
        tasks.push(Task {
            node: left_node,
            start: task.start,
            end: task.start + left_count,
            limit: left_limit,
            depth: task.depth + 1,
        });
        tasks.push(Task {
            node: left_node + 1,
            start: right_start,
            end: right_start + right_count,
            limit: task.limit,
            depth: task.depth + 1,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad_vertices() -> Vec<Vertex> {
        [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [1.0, 1.0, 0.0],
            [2.0, 0.0, 1.0],
            [3.0, 1.0, 1.0],
        ]
        .into_iter()
        .map(|pos| Vertex {
            pos,
            u: 0.0,
            norm: [0.0, 0.0, 1.0],
            v: 0.0,
        })
        .collect()
    }

    fn check_tree(bvh: &Bvh) {
        let mut stack = vec![0u32];
        let mut reachable_faces = 0usize;
        while let Some(index) = stack.pop() {
            let node = bvh.nodes[index as usize];
            if node.is_leaf() {
                let end = node.face_index + node.face_count;
                assert!(end as usize <= bvh.faces.len());
                reachable_faces += node.face_count as usize;
            } else {
                for child in [node.child_index, node.child_index + 1] {
                    // A child box never grows its parent.
                    let parent = bvh.nodes[index as usize].aabb;
                    let union = parent.union(&bvh.nodes[child as usize].aabb);
                    assert!(union.surface_area() <= parent.surface_area() * 1.0001);
                    stack.push(child);
                }
            }
        }
        assert_eq!(reachable_faces, bvh.faces.len());
    }

    #[test]
    fn builds_a_leaf_for_few_faces() {
        let vertices = quad_vertices();
        let faces = [Face {
            indices: [0, 1, 2],
            material: 0,
        }];
        let bvh = build_bvh(&faces, &vertices, &BvhBuildParams::default()).unwrap();
        assert_eq!(bvh.nodes.len(), 1);
        assert!(bvh.nodes[0].is_leaf());
        assert_eq!(bvh.faces.len(), 1);
    }

    #[test]
    fn drops_degenerate_faces() {
        let vertices = quad_vertices();
        let faces = [
            Face {
                indices: [0, 1, 2],
                material: 0,
            },
            Face {
                indices: [1, 1, 2],
                material: 0,
            },
        ];
        let bvh = build_bvh(&faces, &vertices, &BvhBuildParams::default()).unwrap();
        assert_eq!(bvh.faces.len(), 1);
    }

    #[test]
    fn all_degenerate_is_an_error() {
        let vertices = quad_vertices();
        let faces = [Face {
            indices: [3, 3, 3],
            material: 0,
        }];
        assert!(matches!(
            build_bvh(&faces, &vertices, &BvhBuildParams::default()),
            Err(BuildError::NoUsableFaces { dropped: 1 })
        ));
    }

    #[test]
    fn splits_many_faces_and_keeps_leaves_small() {
        let mut vertices = Vec::new();
        let mut faces = Vec::new();
        for i in 0..14 {
            for j in 0..14 {
                let base = vertices.len() as u32;
                let (x, y) = (i as f32, j as f32);
                for pos in [
                    [x, y, 0.0],
                    [x + 0.8, y, 0.1],
                    [x, y + 0.8, (i * j) as f32 * 0.01],
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
        let params = BvhBuildParams {
            leaf_max_face_count: 3,
            ..Default::default()
        };
        let bvh = build_bvh(&faces, &vertices, &params).unwrap();
        check_tree(&bvh);
        for node in &bvh.nodes {
            if node.is_leaf() {
                assert!(node.face_count <= 3);
            }
        }
    }

    #[test]
    fn weight_table_length_is_checked() {
        let vertices = quad_vertices();
        let faces = [Face {
            indices: [0, 1, 2],
            material: 0,
        }];
        let weights = [1.0, 2.0];
        let params = BvhBuildParams {
            face_weights: Some(&weights),
            ..Default::default()
        };
        assert!(matches!(
            build_bvh(&faces, &vertices, &params),
            Err(BuildError::WeightCountMismatch { got: 2, expected: 1 })
        ));
    }

    #[test]
    fn clip_keeps_the_slab() {
        let verts = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(4.0, 0.0, 0.0),
            Vec3::new(0.0, 4.0, 0.0),
        ];
        let clipped = clip_triangle_to_slab(verts, 0, 1.0, 2.0);
        assert!((clipped.min.x - 1.0).abs() < 1.0e-6);
        assert!((clipped.max.x - 2.0).abs() < 1.0e-6);
        // y range at x = 1 is [0, 3].
        assert!((clipped.max.y - 3.0).abs() < 1.0e-6);
    }
}
