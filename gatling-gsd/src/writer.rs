use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use crate::{
    types::{Scene, CWBVH_NODE_SIZE, FACE_SIZE, HEADER_SIZE, MATERIAL_SIZE, VERTEX_SIZE},
    SceneIoError,
};

struct HeaderCursor {
    bytes: [u8; HEADER_SIZE],
    at: usize,
}

impl HeaderCursor {
    fn new() -> Self {
        Self {
            bytes: [0; HEADER_SIZE],
            at: 0,
        }
    }

    fn put_u32(&mut self, v: u32) {
        self.bytes[self.at..self.at + 4].copy_from_slice(&v.to_le_bytes());
        self.at += 4;
    }

    fn put_u64(&mut self, v: u64) {
        self.bytes[self.at..self.at + 8].copy_from_slice(&v.to_le_bytes());
        self.at += 8;
    }

    fn put_f32(&mut self, v: f32) {
        self.bytes[self.at..self.at + 4].copy_from_slice(&v.to_le_bytes());
        self.at += 4;
    }

    fn put_vec3(&mut self, v: glam::Vec3) {
        self.put_f32(v.x);
        self.put_f32(v.y);
        self.put_f32(v.z);
    }
}

/// Serialise `scene` into the 256-byte header followed by the node, face,
/// vertex and material buffers. Offsets are assigned back-to-back so the
/// resulting file satisfies the contiguity invariant by construction.
pub fn write_scene<W: Write>(mut w: W, scene: &Scene) -> std::io::Result<()> {
    let node_size = (scene.nodes.len() * CWBVH_NODE_SIZE) as u64;
    let face_size = (scene.faces.len() * FACE_SIZE) as u64;
    let vertex_size = (scene.vertices.len() * VERTEX_SIZE) as u64;
    let material_size = (scene.materials.len() * MATERIAL_SIZE) as u64;

    let node_offset = HEADER_SIZE as u64;
    let face_offset = node_offset + node_size;
    let vertex_offset = face_offset + face_size;
    let material_offset = vertex_offset + vertex_size;

    let mut header = HeaderCursor::new();
    header.put_u32(scene.image_width);
    header.put_u32(scene.image_height);
    header.put_u64(node_offset);
    header.put_u64(node_size);
    header.put_u64(face_offset);
    header.put_u64(face_size);
    header.put_u64(vertex_offset);
    header.put_u64(vertex_size);
    header.put_u64(material_offset);
    header.put_u64(material_size);
    header.put_vec3(scene.aabb.min);
    header.put_vec3(scene.aabb.max);
    header.put_vec3(scene.camera.origin);
    header.put_vec3(scene.camera.forward);
    header.put_vec3(scene.camera.up);
    header.put_f32(scene.camera.hfov);
    debug_assert_eq!(header.at, 136);
    // The remaining 120 bytes stay reserved (zero).

    w.write_all(&header.bytes)?;
    w.write_all(bytemuck::cast_slice(&scene.nodes))?;
    w.write_all(bytemuck::cast_slice(&scene.faces))?;
    w.write_all(bytemuck::cast_slice(&scene.vertices))?;
    w.write_all(bytemuck::cast_slice(&scene.materials))?;
    w.flush()
}

/// Write `scene` to `path`, reporting the path and failing operation on
/// error.
pub fn write_scene_file(path: &Path, scene: &Scene) -> Result<(), SceneIoError> {
    let file = File::create(path).map_err(|e| SceneIoError::io(path, "create", e))?;
    write_scene(BufWriter::new(file), scene).map_err(|e| SceneIoError::io(path, "write", e))
}
