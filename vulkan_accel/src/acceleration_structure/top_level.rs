use log::debug;

use crate::{
    acceleration_structure::{
        geometry::BuildRange, AccelerationStructure, BuildFlags, ScratchBuffer,
    },
    context::{
        BuildDescription, BuildMode, DeviceAddress, DeviceContext, GeometryDescription,
        MemoryAccess, PipelineStage, StructureLevel,
    },
    prelude::{AccelResult, ConfigurationError},
};

pub const IDENTITY_TRANSFORM: [[f32; 4]; 4] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// One entry of the instance array a TLAS is built over. Transient: packed
/// into a device-side buffer immediately before the build and not retained.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct InstanceRecord {
    /// Device address of the BLAS this instance references.
    pub blas_address: DeviceAddress,
    /// Row-major world transform; the fourth row is ignored (the hardware
    /// consumes a 3x4 matrix).
    pub transform: [[f32; 4]; 4],
    /// Application-defined index surfaced to hit shaders; low 24 bits.
    pub custom_index: u32,
    /// An instance is hit only when `ray_mask & mask != 0`.
    pub mask: u8,
    /// Hit-group offset into the shader binding table; low 24 bits.
    pub shader_group_offset: u32,
}

impl InstanceRecord {
    pub fn new(blas_address: DeviceAddress, transform: [[f32; 4]; 4]) -> Self {
        Self {
            blas_address,
            transform,
            custom_index: 0,
            mask: 0xFF,
            shader_group_offset: 0,
        }
    }

    pub fn with_custom_index(mut self, custom_index: u32) -> Self {
        self.custom_index = custom_index;
        self
    }

    pub fn with_mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_shader_group_offset(mut self, shader_group_offset: u32) -> Self {
        self.shader_group_offset = shader_group_offset;
        self
    }
}

/// The top-level acceleration structure, plus the sizing state a refit needs
/// to validate against.
pub struct Tlas<C: DeviceContext> {
    structure: AccelerationStructure<C>,
    instance_count: u32,
    flags: BuildFlags,
}

impl<C: DeviceContext> std::fmt::Debug for Tlas<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tlas")
            .field("structure", &self.structure)
            .field("instance_count", &self.instance_count)
            .field("flags", &self.flags)
            .finish()
    }
}

impl<C: DeviceContext> Tlas<C> {
    /// The opaque handle to bind into the ray-tracing descriptor set.
    #[inline]
    pub fn handle(&self) -> &C::Structure {
        self.structure.handle()
    }

    #[inline]
    pub fn device_address(&self) -> DeviceAddress {
        self.structure.device_address()
    }

    #[inline]
    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    #[inline]
    pub fn flags(&self) -> BuildFlags {
        self.flags
    }

    pub fn destroy(self, ctx: &C) {
        self.structure.destroy(ctx);
    }
}

/// Builds and refits the single top-level structure. TLAS builds are always
/// one-shot: there is exactly one top-level structure, so no batching.
pub struct TlasBuilder<'a, C: DeviceContext> {
    ctx: &'a C,
}

impl<'a, C: DeviceContext> TlasBuilder<'a, C> {
    pub fn new(ctx: &'a C) -> Self {
        Self { ctx }
    }

    /// Fresh build: uploads the packed instance array, sizes and allocates
    /// the structure, and builds it in one submission. The transient instance
    /// buffer is destroyed once the submission has been waited on.
    pub fn build(
        &self,
        instances: &[InstanceRecord],
        flags: BuildFlags,
        scratch: &mut ScratchBuffer<C>,
    ) -> AccelResult<Tlas<C>> {
        let count = instances.len() as u32;
        debug!("building top-level acceleration structure over {count} instances");

        let mut cmd = self.ctx.begin_one_shot_commands()?;
        let (instance_buffer, instance_address) =
            match self.ctx.record_instance_upload(&mut cmd, instances) {
                Ok(upload) => upload,
                Err(err) => {
                    self.ctx.discard_commands(cmd);
                    return Err(err);
                }
            };

        // The staged instance copy must land before the build reads it.
        self.ctx.record_barrier(
            &mut cmd,
            PipelineStage::Transfer,
            PipelineStage::AccelerationStructureBuild,
            MemoryAccess::TransferWrite,
            MemoryAccess::AccelerationStructureWrite,
        );

        let desc = BuildDescription {
            level: StructureLevel::TopLevel,
            mode: BuildMode::Build,
            flags,
            geometry: GeometryDescription::Instances {
                address: instance_address,
                count,
            },
        };

        let structure = match self.record_fresh_build(&mut cmd, &desc, count, scratch) {
            Ok(structure) => structure,
            Err(err) => {
                self.ctx.discard_commands(cmd);
                self.ctx.destroy_buffer(instance_buffer);
                return Err(err);
            }
        };

        if let Err(err) = self.ctx.submit_and_wait(cmd) {
            self.ctx.destroy_buffer(instance_buffer);
            structure.destroy(self.ctx);
            return Err(err);
        }

        self.ctx.destroy_buffer(instance_buffer);

        Ok(Tlas {
            structure,
            instance_count: count,
            flags,
        })
    }

    /// Full replace with no dangling window: the new structure is built
    /// first, and the superseded one is destroyed only after the build
    /// submission has completed. A failed rebuild leaves `tlas` untouched
    /// and still valid.
    pub fn rebuild(
        &self,
        tlas: &mut Tlas<C>,
        instances: &[InstanceRecord],
        flags: BuildFlags,
        scratch: &mut ScratchBuffer<C>,
    ) -> AccelResult<()> {
        let fresh = self.build(instances, flags, scratch)?;
        let superseded = std::mem::replace(tlas, fresh);
        superseded.destroy(self.ctx);
        Ok(())
    }

    /// In-place refit from a new instance array. The structure is reused
    /// unchanged (same handle, same device address, no reallocation); only
    /// its content is updated. Requires a prior build with the allow-update
    /// flag and an identical instance count - both are checked before any
    /// command is recorded.
    pub fn refit(
        &self,
        tlas: &mut Tlas<C>,
        instances: &[InstanceRecord],
        scratch: &mut ScratchBuffer<C>,
    ) -> AccelResult<()> {
        if !tlas.flags.allow_update() {
            return Err(ConfigurationError::RefitWithoutAllowUpdate.into());
        }

        let count = instances.len() as u32;
        if count != tlas.instance_count {
            return Err(ConfigurationError::RefitCountMismatch {
                expected: tlas.instance_count,
                actual: count,
            }
            .into());
        }

        debug!("refitting top-level acceleration structure over {count} instances");

        let mut cmd = self.ctx.begin_one_shot_commands()?;
        let (instance_buffer, instance_address) =
            match self.ctx.record_instance_upload(&mut cmd, instances) {
                Ok(upload) => upload,
                Err(err) => {
                    self.ctx.discard_commands(cmd);
                    return Err(err);
                }
            };

        self.ctx.record_barrier(
            &mut cmd,
            PipelineStage::Transfer,
            PipelineStage::AccelerationStructureBuild,
            MemoryAccess::TransferWrite,
            MemoryAccess::AccelerationStructureWrite,
        );

        let desc = BuildDescription {
            level: StructureLevel::TopLevel,
            mode: BuildMode::Update,
            flags: tlas.flags,
            geometry: GeometryDescription::Instances {
                address: instance_address,
                count,
            },
        };

        let prepared = self
            .ctx
            .query_build_sizes(&desc, &[count])
            .and_then(|sizes| scratch.ensure(self.ctx, sizes.update_scratch_size));
        let scratch_address = match prepared {
            Ok(scratch_address) => scratch_address,
            Err(err) => {
                self.ctx.discard_commands(cmd);
                self.ctx.destroy_buffer(instance_buffer);
                return Err(err);
            }
        };

        self.ctx.record_build(
            &mut cmd,
            &desc,
            Some(tlas.structure.handle()),
            tlas.structure.handle(),
            scratch_address,
            &[BuildRange::full(count)],
        );

        let outcome = self.ctx.submit_and_wait(cmd);
        self.ctx.destroy_buffer(instance_buffer);
        outcome
    }

    fn record_fresh_build(
        &self,
        cmd: &mut C::Cmd,
        desc: &BuildDescription<'_>,
        count: u32,
        scratch: &mut ScratchBuffer<C>,
    ) -> AccelResult<AccelerationStructure<C>> {
        let sizes = self.ctx.query_build_sizes(desc, &[count])?;
        let structure =
            AccelerationStructure::create(self.ctx, StructureLevel::TopLevel, sizes.structure_size)?;

        let scratch_address = match scratch.ensure(self.ctx, sizes.build_scratch_size) {
            Ok(address) => address,
            Err(err) => {
                structure.destroy(self.ctx);
                return Err(err);
            }
        };

        self.ctx.record_build(
            cmd,
            desc,
            None,
            structure.handle(),
            scratch_address,
            &[BuildRange::full(count)],
        );

        Ok(structure)
    }
}
