/*! Bounding-volume hierarchy construction for the gatling preprocessor.
 *
 *  The pipeline runs in three stages, each with its own module:
 *
 *  1. [`builder`] — top-down SAH construction of a binary BVH, with
 *     object splits (binned or exact-sweep) and SBVH spatial splits.
 *  2. [`collapse`] — merging the binary tree into a wide BVH with up to
 *     eight children per interior node.
 *  3. [`compress`] — quantising the wide BVH into the 80-byte
 *     [`CwbvhNode`](gatling_gsd::CwbvhNode) records the traversal kernel
 *     and the scene file consume.
 *
 *  Nodes are arena-allocated and referenced by `u32` index throughout;
 *  there are no pointer graphs to chase or serialise.
 */

mod builder;
mod collapse;
mod compress;

pub use builder::{build_bvh, BinningMode, Bvh, BvhBuildParams, BvhNode};
pub use collapse::{collapse, CollapseParams, WideBvh, WideBvhNode, WideChild, WideChildKind};
pub use compress::{compress, CwbvhScene};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    /// Spatial splitting needed more face duplicates than the reservation
    /// allows. The caller may retry with a larger
    /// `spatial_reserve_factor`.
    #[error(
        "spatial splits exceeded the face reservation ({needed} needed, {reserved} reserved)"
    )]
    ReservationExceeded { needed: usize, reserved: usize },

    /// All input faces were degenerate or empty.
    #[error("no usable faces in input ({dropped} dropped as degenerate)")]
    NoUsableFaces { dropped: usize },

    /// `face_weights` was supplied with a length different from the face
    /// count.
    #[error("face weight table has {got} entries for {expected} faces")]
    WeightCountMismatch { got: usize, expected: usize },
}

#[derive(Debug, Error)]
pub enum CompressError {
    /// A wide-BVH leaf carries more faces than the 3-bit unary meta
    /// encoding can express.
    #[error("wide-BVH leaf holds {count} faces, the CWBVH encoding allows at most 3")]
    LeafTooLarge { count: u32 },

    /// A single node's leaf children reference more than the 24 faces the
    /// hitmask can address.
    #[error("wide-BVH node references {count} faces, the CWBVH hitmask allows at most 24")]
    NodeFacesExceeded { count: u32 },
}
