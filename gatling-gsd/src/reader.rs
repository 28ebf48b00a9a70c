use std::{fs, path::Path};

use bytemuck::Pod;
use glam::Vec3;

use crate::{
    types::{
        Aabb, Camera, Scene, CWBVH_NODE_SIZE, FACE_SIZE, HEADER_SIZE, MATERIAL_SIZE, VERTEX_SIZE,
    },
    SceneIoError,
};

struct HeaderCursor<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> HeaderCursor<'a> {
    fn take_u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(self.bytes[self.at..self.at + 4].try_into().unwrap());
        self.at += 4;
        v
    }

    fn take_u64(&mut self) -> u64 {
        let v = u64::from_le_bytes(self.bytes[self.at..self.at + 8].try_into().unwrap());
        self.at += 8;
        v
    }

    fn take_f32(&mut self) -> f32 {
        f32::from_bits(self.take_u32())
    }

    fn take_vec3(&mut self) -> Vec3 {
        Vec3::new(self.take_f32(), self.take_f32(), self.take_f32())
    }
}

fn buffer<T: Pod>(
    bytes: &[u8],
    offset: u64,
    size: u64,
    stride: usize,
    what: &str,
) -> Result<Vec<T>, SceneIoError> {
    if size % stride as u64 != 0 {
        return Err(SceneIoError::corrupt(format!(
            "{what} buffer size {size} is not a multiple of the {stride}-byte record"
        )));
    }
    let end = offset
        .checked_add(size)
        .filter(|&end| end <= bytes.len() as u64)
        .ok_or_else(|| {
            SceneIoError::corrupt(format!("{what} buffer [{offset}, +{size}) exceeds file length"))
        })?;
    // pod_collect_to_vec copes with the byte slice being unaligned for T.
    Ok(bytemuck::allocation::pod_collect_to_vec(
        &bytes[offset as usize..end as usize],
    ))
}

/// Parse a scene from an in-memory file image, validating the header
/// before touching any buffer: the node buffer must start right after the
/// header, the four buffers must be contiguous, each buffer size must be
/// an exact multiple of its record stride, and the material buffer must
/// end exactly at the file length.
pub fn read_scene(bytes: &[u8]) -> Result<Scene, SceneIoError> {
    if bytes.len() < HEADER_SIZE {
        return Err(SceneIoError::corrupt(format!(
            "file is {} bytes, smaller than the {HEADER_SIZE}-byte header",
            bytes.len()
        )));
    }

    let mut header = HeaderCursor { bytes, at: 0 };
    let image_width = header.take_u32();
    let image_height = header.take_u32();
    let node_offset = header.take_u64();
    let node_size = header.take_u64();
    let face_offset = header.take_u64();
    let face_size = header.take_u64();
    let vertex_offset = header.take_u64();
    let vertex_size = header.take_u64();
    let material_offset = header.take_u64();
    let material_size = header.take_u64();
    let aabb = Aabb::new(header.take_vec3(), header.take_vec3());
    let camera = Camera {
        origin: header.take_vec3(),
        forward: header.take_vec3(),
        up: header.take_vec3(),
        hfov: header.take_f32(),
    };

    if node_offset != HEADER_SIZE as u64 {
        return Err(SceneIoError::corrupt(format!(
            "node buffer starts at {node_offset}, expected {HEADER_SIZE}"
        )));
    }
    let chain = [
        (node_offset, node_size, face_offset, "node/face"),
        (face_offset, face_size, vertex_offset, "face/vertex"),
        (vertex_offset, vertex_size, material_offset, "vertex/material"),
        (material_offset, material_size, bytes.len() as u64, "material/eof"),
    ];
    for (offset, size, next, what) in chain {
        if offset.checked_add(size) != Some(next) {
            return Err(SceneIoError::corrupt(format!(
                "{what} boundary mismatch: {offset} + {size} != {next}"
            )));
        }
    }

    Ok(Scene {
        image_width,
        image_height,
        aabb,
        camera,
        nodes: buffer(bytes, node_offset, node_size, CWBVH_NODE_SIZE, "node")?,
        faces: buffer(bytes, face_offset, face_size, FACE_SIZE, "face")?,
        vertices: buffer(bytes, vertex_offset, vertex_size, VERTEX_SIZE, "vertex")?,
        materials: buffer(bytes, material_offset, material_size, MATERIAL_SIZE, "material")?,
    })
}

/// Read and validate the scene file at `path`.
pub fn read_scene_file(path: &Path) -> Result<Scene, SceneIoError> {
    let bytes = fs::read(path).map_err(|e| SceneIoError::io(path, "read", e))?;
    read_scene(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        types::{CwbvhNode, Face, Material, Vertex},
        write_scene,
    };

    fn sample_scene() -> Scene {
        Scene {
            image_width: 800,
            image_height: 600,
            aabb: Aabb::new(Vec3::ZERO, Vec3::ONE),
            camera: Camera {
                origin: Vec3::new(0.5, 0.5, -2.0),
                forward: Vec3::Z,
                up: Vec3::Y,
                hfov: 1.2,
            },
            nodes: vec![CwbvhNode::EMPTY; 3],
            faces: vec![
                Face {
                    indices: [0, 1, 2],
                    material: 0,
                },
                Face {
                    indices: [2, 1, 3],
                    material: 1,
                },
            ],
            vertices: vec![
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
                Vertex {
                    pos: [1.0, 1.0, 0.0],
                    u: 1.0,
                    norm: [0.0, 0.0, 1.0],
                    v: 1.0,
                },
            ],
            materials: vec![
                Material::new([0.8, 0.8, 0.8], [0.0; 3]),
                Material::new([0.2, 0.4, 0.9], [1.0, 1.0, 1.0]),
            ],
        }
    }

    fn encoded(scene: &Scene) -> Vec<u8> {
        let mut bytes = Vec::new();
        write_scene(&mut bytes, scene).unwrap();
        bytes
    }

    #[test]
    fn round_trip_is_byte_exact() {
        let scene = sample_scene();
        let bytes = encoded(&scene);
        let back = read_scene(&bytes).unwrap();

        assert_eq!(back.image_width, scene.image_width);
        assert_eq!(back.image_height, scene.image_height);
        assert_eq!(back.camera, scene.camera);
        assert_eq!(back.aabb, scene.aabb);
        assert_eq!(
            bytemuck::cast_slice::<_, u8>(&back.vertices),
            bytemuck::cast_slice::<_, u8>(&scene.vertices)
        );
        assert_eq!(
            bytemuck::cast_slice::<_, u8>(&back.faces),
            bytemuck::cast_slice::<_, u8>(&scene.faces)
        );
        assert_eq!(back.nodes, scene.nodes);
        assert_eq!(back.materials, scene.materials);
    }

    #[test]
    fn header_offsets_are_contiguous() {
        let scene = sample_scene();
        let bytes = encoded(&scene);

        let u64_at = |off: usize| u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
        let (node_off, node_size) = (u64_at(8), u64_at(16));
        let (face_off, face_size) = (u64_at(24), u64_at(32));
        let (vertex_off, vertex_size) = (u64_at(40), u64_at(48));
        let (material_off, material_size) = (u64_at(56), u64_at(64));

        assert_eq!(node_off, 256);
        assert_eq!(node_off + node_size, face_off);
        assert_eq!(face_off + face_size, vertex_off);
        assert_eq!(vertex_off + vertex_size, material_off);
        assert_eq!(material_off + material_size, bytes.len() as u64);
        // Reserved tail of the header is zero.
        assert!(bytes[136..256].iter().all(|&b| b == 0));
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let scene = sample_scene();
        let bytes = encoded(&scene);
        let err = read_scene(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, SceneIoError::Corrupt { .. }));
    }

    #[test]
    fn misaligned_node_size_is_rejected() {
        let scene = sample_scene();
        let mut bytes = encoded(&scene);
        // Grow the node buffer size by one byte; the chain check fires first
        // on the face boundary.
        let node_size = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
        bytes[16..24].copy_from_slice(&(node_size + 1).to_le_bytes());
        assert!(matches!(
            read_scene(&bytes).unwrap_err(),
            SceneIoError::Corrupt { .. }
        ));
    }
}
