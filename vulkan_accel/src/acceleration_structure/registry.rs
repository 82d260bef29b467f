use log::debug;

use crate::{
    acceleration_structure::{
        bottom_level::{BlasBuilder, BlasSet, DEFAULT_BATCH_CEILING},
        geometry::GeometryInput,
        top_level::{InstanceRecord, Tlas, TlasBuilder},
        BuildFlags, ScratchBuffer,
    },
    context::{DeviceAddress, DeviceContext},
    prelude::{AccelResult, ConfigurationError},
};

/// Owns every acceleration structure of one scene: the ordered BLAS set, the
/// TLAS built over it, and the scratch buffer the builds share. Everything
/// created through the registry is released through [`destroy_all`].
///
/// [`destroy_all`]: AccelerationStructureRegistry::destroy_all
pub struct AccelerationStructureRegistry<C: DeviceContext> {
    blases: BlasSet<C>,
    tlas: Option<Tlas<C>>,
    scratch: ScratchBuffer<C>,
    batch_ceiling: u64,
}

impl<C: DeviceContext> Default for AccelerationStructureRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: DeviceContext> AccelerationStructureRegistry<C> {
    pub fn new() -> Self {
        Self {
            blases: BlasSet::empty(),
            tlas: None,
            scratch: ScratchBuffer::new(),
            batch_ceiling: DEFAULT_BATCH_CEILING,
        }
    }

    pub fn with_batch_ceiling(batch_ceiling: u64) -> Self {
        Self {
            batch_ceiling,
            ..Self::new()
        }
    }

    /// Builds one BLAS per geometry input and installs the set, replacing
    /// whatever was installed before. The previous set and the TLAS built
    /// over it (which holds its device addresses) are destroyed only after
    /// the new set is complete; on failure the registry is left unchanged.
    pub fn build_blases(
        &mut self,
        ctx: &C,
        inputs: &[GeometryInput],
        flags: BuildFlags,
    ) -> AccelResult<()> {
        let fresh = BlasBuilder::with_batch_ceiling(ctx, self.batch_ceiling).build_all(
            inputs,
            flags,
            &mut self.scratch,
        )?;

        if let Some(tlas) = self.tlas.take() {
            debug!("discarding top-level structure referencing the replaced set");
            tlas.destroy(ctx);
        }
        let superseded = std::mem::replace(&mut self.blases, fresh);
        superseded.destroy(ctx);

        Ok(())
    }

    #[inline]
    pub fn blas_count(&self) -> usize {
        self.blases.len()
    }

    /// Device address of BLAS `index`, for packing into an instance record.
    /// Indices follow the geometry-input order of the installing build call.
    pub fn blas_device_address(&self, index: usize) -> AccelResult<DeviceAddress> {
        self.blases.device_address(index)
    }

    #[inline]
    pub fn blases(&self) -> &BlasSet<C> {
        &self.blases
    }

    /// Builds the TLAS over `instances`. When one is already installed this
    /// is a full rebuild with no dangling window: the old structure is
    /// destroyed only after the new one is complete, and a failure leaves the
    /// old one installed and valid.
    pub fn build_tlas(
        &mut self,
        ctx: &C,
        instances: &[InstanceRecord],
        flags: BuildFlags,
    ) -> AccelResult<()> {
        let builder = TlasBuilder::new(ctx);
        match self.tlas.as_mut() {
            Some(tlas) => builder.rebuild(tlas, instances, flags, &mut self.scratch),
            None => {
                self.tlas = Some(builder.build(instances, flags, &mut self.scratch)?);
                Ok(())
            }
        }
    }

    /// Refits the installed TLAS in place from a new instance array; the
    /// handle and device address are preserved. Fails without touching the
    /// device when no TLAS is installed, when it was not built with the
    /// allow-update flag, or when the instance count differs.
    pub fn refit_tlas(&mut self, ctx: &C, instances: &[InstanceRecord]) -> AccelResult<()> {
        let Some(tlas) = self.tlas.as_mut() else {
            return Err(ConfigurationError::TlasNotBuilt.into());
        };

        TlasBuilder::new(ctx).refit(tlas, instances, &mut self.scratch)
    }

    /// The installed TLAS, ready to bind into a ray-tracing descriptor set.
    pub fn tlas(&self) -> AccelResult<&Tlas<C>> {
        let Some(tlas) = self.tlas.as_ref() else {
            return Err(ConfigurationError::TlasNotBuilt.into());
        };

        Ok(tlas)
    }

    /// Releases every structure, backing buffer and the shared scratch.
    /// Idempotent: the registry is reusable (and destroyable) afterwards.
    pub fn destroy_all(&mut self, ctx: &C) {
        if let Some(tlas) = self.tlas.take() {
            tlas.destroy(ctx);
        }

        let blases = std::mem::take(&mut self.blases);
        blases.destroy(ctx);

        self.scratch.destroy(ctx);
    }
}
