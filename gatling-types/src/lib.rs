/*! Common types shared between the gatling device layer, the renderer and
 *  the preprocessor. This crate is deliberately free of any Vulkan types so
 *  that scene tooling can depend on it without pulling in a driver stack.
 */

use std::{fmt, hash::Hash, hash::Hasher, marker::PhantomData};

/// Number of low bits of a raw handle holding the slot index.
const HANDLE_INDEX_BITS: u64 = 32;
/// Number of bits above the slot index holding the slot generation.
const HANDLE_GENERATION_BITS: u64 = 30;

const HANDLE_INDEX_MASK: u64 = (1 << HANDLE_INDEX_BITS) - 1;
const HANDLE_GENERATION_MASK: u64 = (1 << HANDLE_GENERATION_BITS) - 1;

/// Largest generation value a handle can carry before wrapping.
pub const MAX_HANDLE_GENERATION: u32 = HANDLE_GENERATION_MASK as u32;

/// An opaque, versioned reference to a device-owned resource.
///
/// The 64-bit payload packs a 32-bit slot index and a 30-bit generation
/// (two bits are spare). The marker type `M` ties a handle to one resource
/// kind, so a `Handle<markers::Buffer>` cannot be passed where a
/// `Handle<markers::Image>` is expected. Handles are plain data: copying or
/// keeping one past `destroy` is safe and merely yields a stale-handle error
/// on the next lookup.
#[repr(transparent)]
pub struct Handle<M> {
    raw: u64,
    _kind: PhantomData<fn(M) -> M>,
}

impl<M> Handle<M> {
    /// Combine a slot index and generation into a handle.
    pub fn from_parts(index: u32, generation: u32) -> Self {
        Self {
            raw: u64::from(index)
                | (u64::from(generation) & HANDLE_GENERATION_MASK) << HANDLE_INDEX_BITS,
            _kind: PhantomData,
        }
    }

    /// Reconstruct a handle from its raw transport representation.
    pub fn from_raw(raw: u64) -> Self {
        Self {
            raw,
            _kind: PhantomData,
        }
    }

    /// The raw 64-bit representation, for FFI or serialisation.
    pub fn into_raw(self) -> u64 {
        self.raw
    }

    /// Slot index inside the owning store.
    pub fn index(&self) -> u32 {
        (self.raw & HANDLE_INDEX_MASK) as u32
    }

    /// Generation the slot had when this handle was issued.
    pub fn generation(&self) -> u32 {
        ((self.raw >> HANDLE_INDEX_BITS) & HANDLE_GENERATION_MASK) as u32
    }
}

impl<M> Clone for Handle<M> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<M> Copy for Handle<M> {}

impl<M> PartialEq for Handle<M> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}
impl<M> Eq for Handle<M> {}

impl<M> Hash for Handle<M> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<M> fmt::Debug for Handle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Handle<{}>({}, gen {})",
            std::any::type_name::<M>().rsplit("::").next().unwrap_or("?"),
            self.index(),
            self.generation()
        )
    }
}

/// Marker types distinguishing the resource kinds at the type level.
pub mod markers {
    #[derive(Debug)]
    pub enum Buffer {}
    #[derive(Debug)]
    pub enum Image {}
    #[derive(Debug)]
    pub enum Sampler {}
    #[derive(Debug)]
    pub enum Shader {}
    #[derive(Debug)]
    pub enum Pipeline {}
    #[derive(Debug)]
    pub enum CommandBuffer {}
    #[derive(Debug)]
    pub enum Fence {}
}

pub type BufferHandle = Handle<markers::Buffer>;
pub type ImageHandle = Handle<markers::Image>;
pub type SamplerHandle = Handle<markers::Sampler>;
pub type ShaderHandle = Handle<markers::Shader>;
pub type PipelineHandle = Handle<markers::Pipeline>;
pub type CommandBufferHandle = Handle<markers::CommandBuffer>;
pub type FenceHandle = Handle<markers::Fence>;

bitflags::bitflags! {
    /// How a buffer is going to be used by the device.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const STORAGE = 1 << 2;
        const UNIFORM = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Requested memory properties for a buffer or image allocation.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct MemoryProps: u32 {
        const DEVICE_LOCAL = 1 << 0;
        const HOST_VISIBLE = 1 << 1;
        const HOST_COHERENT = 1 << 2;
        const HOST_CACHED = 1 << 3;
    }
}

bitflags::bitflags! {
    /// How an image is going to be used by the device. Tiling is derived
    /// from this set: images only ever touched by transfers are linear,
    /// everything else is optimal.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const SAMPLED = 1 << 2;
        const STORAGE = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Capabilities reported by (and requestable from) an adapter.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct DeviceFeatures: u32 {
        const SAMPLER_ANISOTROPY = 1 << 0;
        const SHADER_INT16 = 1 << 1;
        const ACCELERATION_STRUCTURE = 1 << 2;
        const RAY_TRACING_PIPELINE = 1 << 3;
        const SHADER_CLOCK = 1 << 4;
        const DEBUG_PRINTF = 1 << 5;
        const TIMESTAMPS = 1 << 6;
    }
}

impl DeviceFeatures {
    /// The set a device must support for `Device::open` to succeed.
    pub const MINIMUM: Self = Self::SAMPLER_ANISOTROPY.union(Self::SHADER_INT16);
}

/// Texel formats the device layer exposes. The renderer only needs a small,
/// fixed palette; anything fancier lives behind the material compiler.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    R8Unorm,
    Rgba8Unorm,
    Rgba8Srgb,
    R32Float,
    Rgba32Float,
}

/// Dimensions of a 1-layer 2D or 3D image. `depth == 1` selects 2D.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Extent3d {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// Per-axis sampler addressing. `ClampToBlack` resolves to a
/// transparent-black border at the driver level.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBlack,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone)]
pub struct BufferDesc<'a> {
    pub label: Option<&'a str>,
    pub size: u64,
    pub usage: BufferUsage,
    pub memory: MemoryProps,
}

#[derive(Debug, Clone)]
pub struct ImageDesc<'a> {
    pub label: Option<&'a str>,
    pub extent: Extent3d,
    pub format: ImageFormat,
    pub usage: ImageUsage,
}

#[derive(Debug, Clone, Default)]
pub struct SamplerDesc {
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub anisotropy: Option<f32>,
}

/// A buffer attachment for one `(binding, index)` slot of the bound
/// pipeline. `size == 0` binds the whole remaining range.
#[derive(Debug, Copy, Clone)]
pub struct BufferBinding {
    pub binding: u32,
    pub index: u32,
    pub buffer: BufferHandle,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Copy, Clone)]
pub struct ImageBinding {
    pub binding: u32,
    pub index: u32,
    pub image: ImageHandle,
}

#[derive(Debug, Copy, Clone)]
pub struct SamplerBinding {
    pub binding: u32,
    pub index: u32,
    pub sampler: SamplerHandle,
}

/// Everything a dispatch needs bound, in caller-supplied order. The device
/// layer matches these slots against the pipeline's reflected bindings.
#[derive(Debug, Copy, Clone, Default)]
pub struct Bindings<'a> {
    pub buffers: &'a [BufferBinding],
    pub images: &'a [ImageBinding],
    pub samplers: &'a [SamplerBinding],
}

/// Limits mirrored from the adapter at device-open time.
#[derive(Debug, Copy, Clone)]
pub struct DeviceLimits {
    pub min_storage_buffer_offset_alignment: u64,
    pub max_push_constant_size: u32,
    pub max_compute_workgroup_invocations: u32,
    pub non_coherent_atom_size: u64,
    pub timestamp_period_ns: f32,
}

/// Static description of an adapter, for enumeration UIs and logs.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor_id: u32,
    pub device_id: u32,
    pub features: DeviceFeatures,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_packs_and_unpacks() {
        let h = BufferHandle::from_parts(0xDEAD_BEEF, 12345);
        assert_eq!(h.index(), 0xDEAD_BEEF);
        assert_eq!(h.generation(), 12345);
        assert_eq!(BufferHandle::from_raw(h.into_raw()), h);
    }

    #[test]
    fn handle_generation_wraps_at_30_bits() {
        let h = FenceHandle::from_parts(7, MAX_HANDLE_GENERATION + 3);
        assert_eq!(h.generation(), 2);
        assert_eq!(h.index(), 7);
    }
}
