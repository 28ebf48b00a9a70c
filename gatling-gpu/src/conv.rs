//! Declarative translations from the crate-level types to driver flags.

use ash::vk;
use gatling_types::{
    AddressMode, BufferUsage, FilterMode, ImageFormat, ImageUsage, MemoryProps,
};

use crate::reflect::BindingKind;

pub(crate) fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    if usage.contains(BufferUsage::TRANSFER_SRC) {
        flags |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::TRANSFER_DST) {
        flags |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    if usage.contains(BufferUsage::STORAGE) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    flags
}

pub(crate) fn image_usage(usage: ImageUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    if usage.contains(ImageUsage::TRANSFER_SRC) {
        flags |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(ImageUsage::TRANSFER_DST) {
        flags |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    if usage.contains(ImageUsage::SAMPLED) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(ImageUsage::STORAGE) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    flags
}

/// Images only ever touched by transfers are linear staging surfaces;
/// anything shader-visible is optimal.
pub(crate) fn image_tiling(usage: ImageUsage) -> vk::ImageTiling {
    if usage.intersects(ImageUsage::SAMPLED | ImageUsage::STORAGE) {
        vk::ImageTiling::OPTIMAL
    } else {
        vk::ImageTiling::LINEAR
    }
}

pub(crate) fn memory_usage(props: MemoryProps) -> gpu_alloc::UsageFlags {
    let mut flags = gpu_alloc::UsageFlags::empty();
    if props.contains(MemoryProps::DEVICE_LOCAL) {
        flags |= gpu_alloc::UsageFlags::FAST_DEVICE_ACCESS;
    }
    if props.contains(MemoryProps::HOST_VISIBLE) {
        flags |= gpu_alloc::UsageFlags::HOST_ACCESS | gpu_alloc::UsageFlags::UPLOAD;
    }
    if props.contains(MemoryProps::HOST_CACHED) {
        flags |= gpu_alloc::UsageFlags::HOST_ACCESS | gpu_alloc::UsageFlags::DOWNLOAD;
    }
    flags
}

pub(crate) fn image_format(format: ImageFormat) -> vk::Format {
    match format {
        ImageFormat::R8Unorm => vk::Format::R8_UNORM,
        ImageFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        ImageFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        ImageFormat::R32Float => vk::Format::R32_SFLOAT,
        ImageFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
    }
}

pub(crate) fn address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::ClampToBlack => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    }
}

pub(crate) fn filter(mode: FilterMode) -> vk::Filter {
    match mode {
        FilterMode::Nearest => vk::Filter::NEAREST,
        FilterMode::Linear => vk::Filter::LINEAR,
    }
}

pub(crate) fn descriptor_type(kind: BindingKind) -> vk::DescriptorType {
    match kind {
        BindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        BindingKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        BindingKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
        BindingKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        BindingKind::Sampler => vk::DescriptorType::SAMPLER,
    }
}

/// Layout an image must be in when bound through a descriptor of the
/// given kind.
pub(crate) fn required_image_layout(kind: BindingKind) -> vk::ImageLayout {
    match kind {
        BindingKind::StorageImage => vk::ImageLayout::GENERAL,
        _ => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    }
}

/// Access mask matching [`required_image_layout`], reflecting writability.
pub(crate) fn required_image_access(kind: BindingKind, writable: bool) -> vk::AccessFlags {
    match kind {
        BindingKind::StorageImage if writable => {
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE
        }
        _ => vk::AccessFlags::SHADER_READ,
    }
}
