//! The geometry cache: visible scene geometry baked, accelerated and
//! resident on the device.

use gatling_bvh::{build_bvh, collapse, compress, BvhBuildParams, CollapseParams};
use gatling_gsd::{Aabb, Face, Vertex};
use gatling_gpu::{Device, DeviceError};
use gatling_types::{BufferDesc, BufferHandle, BufferUsage, MemoryProps};
use glam::Vec3;

use crate::{scene::SceneRegistry, RenderError, RenderStage};

/// GPU-resident scene geometry: the CWBVH node array plus the face,
/// vertex and material tables the kernel binds at slots 2–5. Rebuilt as a
/// whole on any scene-state or visibility change; never patched.
#[derive(Debug)]
pub struct GeometryCache {
    pub node_buffer: BufferHandle,
    pub face_buffer: BufferHandle,
    pub vertex_buffer: BufferHandle,
    pub material_buffer: BufferHandle,
    pub node_count: u32,
    pub face_count: u32,
    pub vertex_count: u32,
    pub aabb: Aabb,
}

struct Baked {
    faces: Vec<Face>,
    vertices: Vec<Vertex>,
}

/// Flatten every visible instance into world space. Normals go through
/// the inverse-transpose so non-uniform scales keep them perpendicular.
fn bake(registry: &SceneRegistry) -> Baked {
    let mut faces = Vec::new();
    let mut vertices = Vec::new();
    for instance in registry.instances() {
        if !instance.visible {
            continue;
        }
        let base = vertices.len() as u32;
        let normal_matrix = instance.transform.matrix3.inverse().transpose();
        for vertex in &instance.mesh.vertices {
            let pos = instance.transform.transform_point3(Vec3::from(vertex.pos));
            let norm = normal_matrix
                .mul_vec3(Vec3::from(vertex.norm))
                .normalize_or_zero();
            vertices.push(Vertex {
                pos: pos.to_array(),
                u: vertex.u,
                norm: norm.to_array(),
                v: vertex.v,
            });
        }
        for face in &instance.mesh.faces {
            faces.push(Face {
                indices: [base + face[0], base + face[1], base + face[2]],
                material: instance.material_index,
            });
        }
    }
    Baked { faces, vertices }
}

impl GeometryCache {
    /// Bake, build the CWBVH and upload everything through one staging
    /// copy. The cache is committed as a whole; on any failure the device
    /// is left without the partial buffers.
    pub fn build(device: &mut Device, registry: &SceneRegistry) -> Result<Self, RenderError> {
        profiling::scope!("geometry_cache_build");

        let baked = bake(registry);
        let (nodes, faces, aabb) = if baked.faces.is_empty() {
            (Vec::new(), Vec::new(), Aabb::EMPTY)
        } else {
            let bvh = build_bvh(&baked.faces, &baked.vertices, &BvhBuildParams::default())
                .map_err(|e| RenderError::step(RenderStage::GeometryCache, e))?;
            let wide = collapse(&bvh, &CollapseParams::default());
            let compressed = compress(&wide, &bvh.faces)
                .map_err(|e| RenderError::step(RenderStage::GeometryCache, e))?;
            (compressed.nodes, compressed.faces, bvh.aabb)
        };

        let node_bytes: &[u8] = bytemuck::cast_slice(&nodes);
        let face_bytes: &[u8] = bytemuck::cast_slice(&faces);
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&baked.vertices);
        let material_bytes: &[u8] = bytemuck::cast_slice(registry.materials());
        let segments = [node_bytes, face_bytes, vertex_bytes, material_bytes];

        let mut staging_size = 0u64;
        let mut offsets = [0u64; 4];
        for (i, segment) in segments.iter().enumerate() {
            offsets[i] = staging_size;
            // Keep each segment 16-byte aligned inside the staging buffer.
            staging_size += (segment.len() as u64 + 15) & !15;
        }

        let mut created: Vec<BufferHandle> = Vec::with_capacity(5);
        let result = (|| -> Result<[BufferHandle; 4], DeviceError> {
            let staging = device.create_buffer(&BufferDesc {
                label: Some("geometry staging"),
                size: staging_size.max(16),
                usage: BufferUsage::TRANSFER_SRC,
                memory: MemoryProps::HOST_VISIBLE | MemoryProps::HOST_COHERENT,
            })?;
            created.push(staging);

            let labels = ["cwbvh nodes", "faces", "vertices", "materials"];
            let mut handles = [staging; 4];
            for i in 0..4 {
                if !segments[i].is_empty() {
                    device.write_buffer(staging, offsets[i], segments[i])?;
                }
                handles[i] = device.create_buffer(&BufferDesc {
                    label: Some(labels[i]),
                    size: (segments[i].len() as u64).max(16),
                    usage: BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
                    memory: MemoryProps::DEVICE_LOCAL,
                })?;
                created.push(handles[i]);
            }

            let cmd = device.create_command_buffer()?;
            let fence = device.create_fence()?;
            device.begin_commands(cmd)?;
            for i in 0..4 {
                if !segments[i].is_empty() {
                    device.cmd_copy_buffer(
                        cmd,
                        staging,
                        offsets[i],
                        handles[i],
                        0,
                        segments[i].len() as u64,
                    )?;
                }
            }
            device.cmd_pipeline_barrier(cmd)?;
            device.end_commands(cmd)?;
            device.submit(cmd, fence)?;
            device.wait_fence(fence)?;
            device.destroy_fence(fence)?;
            device.destroy_command_buffer(cmd)?;
            Ok(handles)
        })();

        let handles = match result {
            Ok(handles) => handles,
            Err(e) => {
                // Commit as a whole or not at all.
                for handle in created {
                    let _ = device.destroy_buffer(handle);
                }
                return Err(e.into());
            }
        };
        let staging = created[0];
        device.destroy_buffer(staging)?;

        log::debug!(
            "geometry cache: {} nodes, {} faces, {} vertices",
            nodes.len(),
            faces.len(),
            baked.vertices.len()
        );
        Ok(Self {
            node_buffer: handles[0],
            face_buffer: handles[1],
            vertex_buffer: handles[2],
            material_buffer: handles[3],
            node_count: nodes.len() as u32,
            face_count: faces.len() as u32,
            vertex_count: baked.vertices.len() as u32,
            aabb,
        })
    }

    pub fn destroy(self, device: &mut Device) -> Result<(), DeviceError> {
        device.destroy_buffer(self.node_buffer)?;
        device.destroy_buffer(self.face_buffer)?;
        device.destroy_buffer(self.vertex_buffer)?;
        device.destroy_buffer(self.material_buffer)?;
        Ok(())
    }
}
