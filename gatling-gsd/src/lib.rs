/*! The gatling scene-data (`.gsd`) format.
 *
 *  A scene file is one contiguous blob: a fixed 256-byte header followed by
 *  four tightly packed buffers in order — CWBVH nodes, faces, vertices,
 *  materials. Buffer offsets recorded in the header point past the header
 *  and are monotonically non-overlapping; the last buffer ends exactly at
 *  the file length. All records are the same POD structs the GPU kernel
 *  consumes, so reading a scene is a handful of validated memcpys.
 */

// The wire format is little-endian, and the buffer payloads are written as
// raw casts of the in-memory records.
#[cfg(target_endian = "big")]
compile_error!("the gsd format is little-endian; big-endian hosts are not supported");

mod reader;
mod types;
mod writer;

pub use reader::{read_scene, read_scene_file};
pub use types::{
    Aabb, Camera, CwbvhNode, Face, Material, Scene, Vertex, CWBVH_NODE_SIZE, FACE_SIZE,
    HEADER_SIZE, MATERIAL_SIZE, VERTEX_SIZE,
};
pub use writer::{write_scene, write_scene_file};

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SceneIoError {
    #[error("scene {op} failed for `{path}`")]
    Io {
        path: PathBuf,
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt scene file: {reason}")]
    Corrupt { reason: String },
}

impl SceneIoError {
    pub(crate) fn io(path: &Path, op: &'static str, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            op,
            source,
        }
    }

    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Self::Corrupt {
            reason: reason.into(),
        }
    }
}
