//! SPIR-V reflection through the naga front end.
//!
//! The shader cache derives descriptor-set layouts from the compiled
//! kernel instead of trusting the caller: every resource-class global in
//! the module becomes one [`ReflectedBinding`], and the push-constant
//! block's span sizes the pipeline layout's single push range.

use naga::front::spv;

use crate::DeviceError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BindingKind {
    UniformBuffer,
    StorageBuffer,
    SampledImage,
    StorageImage,
    Sampler,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReflectedBinding {
    pub binding: u32,
    pub count: u32,
    pub kind: BindingKind,
    pub writable: bool,
}

#[derive(Debug, Clone)]
pub struct ShaderReflection {
    /// Sorted by binding slot, so binding updates are a merge walk.
    pub bindings: Vec<ReflectedBinding>,
    pub push_constant_size: u32,
    pub workgroup_size: [u32; 3],
}

pub(crate) fn reflect_spirv(spirv: &[u8]) -> Result<ShaderReflection, DeviceError> {
    let module = spv::parse_u8_slice(spirv, &spv::Options::default())
        .map_err(|e| DeviceError::InvalidSpirv(e.to_string()))?;

    let mut bindings = Vec::new();
    let mut push_constant_size = 0u32;

    for (_, var) in module.global_variables.iter() {
        let ty = &module.types[var.ty];
        match var.space {
            naga::AddressSpace::PushConstant => {
                push_constant_size = ty.inner.size(module.to_ctx());
            }
            naga::AddressSpace::Uniform
            | naga::AddressSpace::Storage { .. }
            | naga::AddressSpace::Handle => {
                let Some(ref resource) = var.binding else {
                    continue;
                };
                if resource.group != 0 {
                    return Err(DeviceError::InvalidSpirv(format!(
                        "binding {} uses descriptor set {}, only set 0 is supported",
                        resource.binding, resource.group
                    )));
                }
                let (inner, count) = match ty.inner {
                    naga::TypeInner::BindingArray { base, size } => {
                        let count = match size {
                            naga::ArraySize::Constant(n) => n.get(),
                            naga::ArraySize::Dynamic => {
                                return Err(DeviceError::InvalidSpirv(format!(
                                    "binding {} is an unsized binding array",
                                    resource.binding
                                )))
                            }
                        };
                        (&module.types[base].inner, count)
                    }
                    ref inner => (inner, 1),
                };
                let (kind, writable) = classify(&var.space, inner, resource.binding)?;
                bindings.push(ReflectedBinding {
                    binding: resource.binding,
                    count,
                    kind,
                    writable,
                });
            }
            _ => {}
        }
    }

    bindings.sort_unstable_by_key(|b| b.binding);
    let workgroup_size = module
        .entry_points
        .first()
        .map(|ep| ep.workgroup_size)
        .unwrap_or([1, 1, 1]);

    Ok(ShaderReflection {
        bindings,
        push_constant_size,
        workgroup_size,
    })
}

fn classify(
    space: &naga::AddressSpace,
    inner: &naga::TypeInner,
    binding: u32,
) -> Result<(BindingKind, bool), DeviceError> {
    match *space {
        naga::AddressSpace::Uniform => Ok((BindingKind::UniformBuffer, false)),
        naga::AddressSpace::Storage { access } => Ok((
            BindingKind::StorageBuffer,
            access.contains(naga::StorageAccess::STORE),
        )),
        naga::AddressSpace::Handle => match *inner {
            naga::TypeInner::Image { class, .. } => match class {
                naga::ImageClass::Sampled { .. } | naga::ImageClass::Depth { .. } => {
                    Ok((BindingKind::SampledImage, false))
                }
                naga::ImageClass::Storage { access, .. } => Ok((
                    BindingKind::StorageImage,
                    access.contains(naga::StorageAccess::STORE),
                )),
            },
            naga::TypeInner::Sampler { .. } => Ok((BindingKind::Sampler, false)),
            _ => Err(DeviceError::InvalidSpirv(format!(
                "binding {binding} has an unsupported handle type"
            ))),
        },
        _ => unreachable!("filtered by the caller"),
    }
}
