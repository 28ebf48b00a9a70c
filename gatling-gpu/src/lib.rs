/*! Vulkan compute-device abstraction.
 *
 *  Everything the renderer touches on the GPU goes through [`Device`]:
 *  resources are created through it and referred to by the typed,
 *  generation-tagged handles of `gatling-types`, command recording and
 *  submission are methods on it, and its stores-bundle is the only
 *  mutable GPU state in the process — there are no globals.
 *
 *  The host model is single-threaded cooperative per device: stores are
 *  not synchronised and all recording happens from one logical scheduler.
 *  Only `wait_fence` and the mapping entry points block.
 */

mod command;
mod conv;
mod device;
mod instance;
mod reflect;
mod store;

pub use device::Device;
pub use instance::{Adapter, Instance};
pub use reflect::{BindingKind, ReflectedBinding, ShaderReflection};
pub use store::InvalidHandle;

use ash::vk;
use thiserror::Error;

/// Bound on descriptor writes prepared for one `cmd_update_bindings`
/// call. The scratch space is preallocated at this size.
pub const MAX_DESCRIPTOR_WRITES: usize = 32;

/// Bound on images bound to one dispatch, and therefore on implicit
/// layout transitions emitted per dispatch.
pub const MAX_BOUND_IMAGES: usize = 16;

/// Entries in the device's timestamp query pool.
pub const MAX_TIMESTAMP_QUERIES: u32 = 64;

#[derive(Debug, Error)]
pub enum DeviceError {
    /// The adapter is missing part of the minimum feature set. Fatal for
    /// the session; surfaced at startup.
    #[error("unsupported hardware: {0}")]
    UnsupportedHardware(String),

    #[error(transparent)]
    InvalidHandle(#[from] InvalidHandle),

    /// The caller-supplied bindings do not match the pipeline's reflected
    /// layout. Indicates a programmer error on the calling side.
    #[error("binding {binding}[{index}] mismatch: {reason}")]
    BindingMismatch {
        binding: u32,
        index: u32,
        reason: &'static str,
    },

    /// One of the documented `MAX_*` bounds was exceeded.
    #[error("hardcoded limit reached: {0}")]
    LimitReached(&'static str),

    #[error("vulkan loader failed: {0}")]
    Loader(String),

    #[error("vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),

    #[error("device memory allocation failed: {0}")]
    Allocation(#[from] gpu_alloc::AllocationError),

    #[error("mapping device memory failed: {0}")]
    Map(#[from] gpu_alloc::MapError),

    #[error("invalid SPIR-V module: {0}")]
    InvalidSpirv(String),

    /// The command buffer's device reference no longer resolves, or it
    /// belongs to a different device.
    #[error("command buffer is not backed by this device")]
    WrongDevice,

    /// Recording operation issued outside the begin/end bracket, or a
    /// dispatch without a bound pipeline.
    #[error("invalid command recording state: {0}")]
    RecordState(&'static str),
}
