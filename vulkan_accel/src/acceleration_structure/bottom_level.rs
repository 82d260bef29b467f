use std::ops::Range;

use log::{debug, trace};

use crate::{
    acceleration_structure::{
        geometry::GeometryInput, AccelerationStructure, BuildFlags, ScratchBuffer,
    },
    context::{
        BuildDescription, BuildMode, BuildSizes, DeviceAddress, DeviceContext,
        GeometryDescription, MemoryAccess, PipelineStage, StructureLevel,
    },
    prelude::{AccelResult, ConfigurationError},
};

/// Cumulative structure bytes allowed per batch. Compaction holds both the
/// uncompacted and the compacted structure of every batch member alive at
/// once, so the ceiling bounds the transient doubling of device memory.
pub const DEFAULT_BATCH_CEILING: u64 = 256_000_000;

/// Splits the inputs into contiguous batches whose cumulative structure size
/// stays under `ceiling`. A batch closes with the member that reaches the
/// ceiling, so a single input larger than the ceiling still forms its own
/// one-member batch. Scheduling only: batching never changes what gets built.
pub fn plan_batches(structure_sizes: &[u64], ceiling: u64) -> Vec<Range<usize>> {
    let mut batches = Vec::new();

    let mut start = 0usize;
    let mut batch_size = 0u64;
    for (idx, size) in structure_sizes.iter().enumerate() {
        batch_size += size;
        if batch_size >= ceiling || idx == structure_sizes.len() - 1 {
            batches.push(start..idx + 1);
            start = idx + 1;
            batch_size = 0;
        }
    }

    batches
}

/// Transient per-input record, alive only for the duration of one
/// [`BlasBuilder::build_all`] call. `replaced` tags the pre-compaction
/// structure from the moment the compacted copy is recorded until the copy
/// submission has been waited on and the original can be destroyed.
struct PendingBuild<'a, C: DeviceContext> {
    input: &'a GeometryInput,
    flags: BuildFlags,
    sizes: BuildSizes,
    structure: Option<AccelerationStructure<C>>,
    replaced: Option<AccelerationStructure<C>>,
}

impl<'a, C: DeviceContext> PendingBuild<'a, C> {
    fn description(&self) -> BuildDescription<'a> {
        BuildDescription {
            level: StructureLevel::BottomLevel,
            mode: BuildMode::Build,
            flags: self.flags,
            geometry: GeometryDescription::Triangles(self.input.geometries()),
        }
    }
}

/// The compacted-size queries of one batch, recorded but not yet read back.
/// Resolving is the second blocking wait of the compaction protocol, distinct
/// from the submission wait that preceded it.
pub(crate) struct PendingCompaction<'a, C: DeviceContext> {
    pool: &'a C::QueryPool,
    count: u32,
}

impl<'a, C: DeviceContext> PendingCompaction<'a, C> {
    pub(crate) fn new(pool: &'a C::QueryPool, count: u32) -> Self {
        Self { pool, count }
    }

    pub(crate) fn resolve(self, ctx: &C) -> AccelResult<Vec<u64>> {
        ctx.read_compacted_sizes_blocking(self.pool, self.count)
    }
}

/// Ordered set of bottom-level structures; index `i` corresponds to geometry
/// input `i` of the build call that produced it. Instances reference their
/// BLAS by this index, so the order is load-bearing.
pub struct BlasSet<C: DeviceContext> {
    structures: Vec<AccelerationStructure<C>>,
}

impl<C: DeviceContext> std::fmt::Debug for BlasSet<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlasSet")
            .field("structures", &self.structures)
            .finish()
    }
}

impl<C: DeviceContext> Default for BlasSet<C> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<C: DeviceContext> BlasSet<C> {
    pub fn empty() -> Self {
        Self {
            structures: Vec::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.structures.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.structures.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&AccelerationStructure<C>> {
        self.structures.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AccelerationStructure<C>> {
        self.structures.iter()
    }

    pub fn device_address(&self, index: usize) -> AccelResult<DeviceAddress> {
        match self.structures.get(index) {
            Some(blas) => Ok(blas.device_address()),
            None => Err(crate::prelude::AccelError::OutOfRange {
                index,
                len: self.structures.len(),
            }),
        }
    }

    pub fn destroy(mut self, ctx: &C) {
        for blas in self.structures.drain(..) {
            blas.destroy(ctx);
        }
    }
}

/// Builds one bottom-level acceleration structure per geometry input, in
/// input order, batched under a device-memory ceiling, with optional
/// all-or-nothing compaction.
pub struct BlasBuilder<'a, C: DeviceContext> {
    ctx: &'a C,
    batch_ceiling: u64,
}

impl<'a, C: DeviceContext> BlasBuilder<'a, C> {
    pub fn new(ctx: &'a C) -> Self {
        Self {
            ctx,
            batch_ceiling: DEFAULT_BATCH_CEILING,
        }
    }

    pub fn with_batch_ceiling(ctx: &'a C, batch_ceiling: u64) -> Self {
        Self { ctx, batch_ceiling }
    }

    /// Builds every input into a ready-to-trace BLAS.
    ///
    /// On success the returned set is index-aligned with `inputs` and every
    /// intermediate (pre-compaction) structure has already been destroyed.
    /// On failure nothing is retained: every structure and buffer created by
    /// this call has been destroyed before the error is returned. The shared
    /// scratch stays with the caller so the following TLAS build can reuse
    /// it; release it once all builds of the scene are done.
    pub fn build_all(
        &self,
        inputs: &[GeometryInput],
        flags: BuildFlags,
        scratch: &mut ScratchBuffer<C>,
    ) -> AccelResult<BlasSet<C>> {
        if inputs.is_empty() {
            return Err(ConfigurationError::EmptyInputs.into());
        }

        debug!("building {} bottom-level acceleration structures", inputs.len());

        // Size pass. Nothing is allocated until every input has been
        // validated and sized and the compaction policy has been checked.
        let mut pending = Vec::with_capacity(inputs.len());
        let mut total_structure_size = 0u64;
        let mut max_scratch_size = 0u64;
        let mut compaction_requests = 0usize;
        for (idx, input) in inputs.iter().enumerate() {
            input.validate(idx)?;

            let merged = input.flags().merged(&flags);
            let build = PendingBuild::<C> {
                input,
                flags: merged,
                sizes: BuildSizes::default(),
                structure: None,
                replaced: None,
            };
            let sizes = self
                .ctx
                .query_build_sizes(&build.description(), &input.max_primitive_counts())?;

            trace!(
                "input {idx}: structure {} bytes, scratch {} bytes",
                sizes.structure_size,
                sizes.build_scratch_size
            );

            total_structure_size += sizes.structure_size;
            max_scratch_size = max_scratch_size.max(sizes.build_scratch_size);
            if merged.allow_compaction() {
                compaction_requests += 1;
            }

            pending.push(PendingBuild { sizes, ..build });
        }

        if compaction_requests != 0 && compaction_requests != inputs.len() {
            return Err(ConfigurationError::MixedCompaction {
                requested: compaction_requests,
                total: inputs.len(),
            }
            .into());
        }

        debug!(
            "total structure size {total_structure_size} bytes, shared scratch {max_scratch_size} bytes"
        );

        let scratch_address = scratch.ensure(self.ctx, max_scratch_size)?;

        let query_pool = match compaction_requests {
            0 => None,
            _ => Some(self.ctx.create_query_pool(inputs.len() as u32)?),
        };

        let result = self.build_batches(&mut pending, scratch_address, query_pool.as_ref());

        if let Some(pool) = query_pool {
            self.ctx.destroy_query_pool(pool);
        }

        match result {
            Ok(()) => {
                if compaction_requests != 0 {
                    let compacted_total: u64 =
                        pending.iter().map(|p| p.sizes.structure_size).sum();
                    debug!(
                        "compaction shrank {total_structure_size} bytes to {compacted_total} bytes"
                    );
                }

                let structures = pending
                    .into_iter()
                    .map(|p| p.structure.expect("every batch member was built"))
                    .collect();
                Ok(BlasSet { structures })
            }
            Err(err) => {
                // No partial set survives: whatever a failed batch left
                // behind is torn down before the error surfaces.
                for build in pending.iter_mut() {
                    if let Some(structure) = build.structure.take() {
                        structure.destroy(self.ctx);
                    }
                    if let Some(structure) = build.replaced.take() {
                        structure.destroy(self.ctx);
                    }
                }
                Err(err)
            }
        }
    }

    fn build_batches(
        &self,
        pending: &mut [PendingBuild<'_, C>],
        scratch_address: u64,
        query_pool: Option<&C::QueryPool>,
    ) -> AccelResult<()> {
        let sizes = pending
            .iter()
            .map(|p| p.sizes.structure_size)
            .collect::<Vec<u64>>();

        for batch in plan_batches(&sizes, self.batch_ceiling) {
            trace!("batch {}..{}", batch.start, batch.end);
            self.build_batch(pending, batch.clone(), scratch_address, query_pool)?;

            if let Some(pool) = query_pool {
                self.compact_batch(pending, batch, pool)?;
            }
        }

        Ok(())
    }

    /// One submission: for every batch member, create the destination
    /// structure and record its build. All builds share one scratch region
    /// byte-for-byte, so a build-to-build memory barrier separates each build
    /// from the next one in the same submission.
    fn build_batch(
        &self,
        pending: &mut [PendingBuild<'_, C>],
        batch: Range<usize>,
        scratch_address: u64,
        query_pool: Option<&C::QueryPool>,
    ) -> AccelResult<()> {
        let mut cmd = self.ctx.begin_one_shot_commands()?;

        if let Some(pool) = query_pool {
            self.ctx.reset_query_pool(pool, batch.len() as u32);
        }

        match self.record_batch(&mut cmd, pending, batch, scratch_address, query_pool) {
            Ok(()) => self.ctx.submit_and_wait(cmd),
            Err(err) => {
                self.ctx.discard_commands(cmd);
                Err(err)
            }
        }
    }

    fn record_batch(
        &self,
        cmd: &mut C::Cmd,
        pending: &mut [PendingBuild<'_, C>],
        batch: Range<usize>,
        scratch_address: u64,
        query_pool: Option<&C::QueryPool>,
    ) -> AccelResult<()> {
        let mut query_index = 0u32;
        for idx in batch {
            let build = &pending[idx];
            let structure = AccelerationStructure::create(
                self.ctx,
                StructureLevel::BottomLevel,
                build.sizes.structure_size,
            )?;

            self.ctx.record_build(
                cmd,
                &build.description(),
                None,
                structure.handle(),
                scratch_address,
                build.input.ranges(),
            );
            self.ctx.record_barrier(
                cmd,
                PipelineStage::AccelerationStructureBuild,
                PipelineStage::AccelerationStructureBuild,
                MemoryAccess::AccelerationStructureWrite,
                MemoryAccess::AccelerationStructureRead,
            );

            if let Some(pool) = query_pool {
                self.ctx
                    .record_compacted_size_query(cmd, structure.handle(), pool, query_index);
                query_index += 1;
            }

            pending[idx].structure = Some(structure);
        }

        Ok(())
    }

    /// Second phase of the build-then-compact protocol: read the queried
    /// compacted sizes back (blocking), copy every member into a structure of
    /// its true footprint, and destroy the originals only once the copy
    /// submission has completed.
    fn compact_batch(
        &self,
        pending: &mut [PendingBuild<'_, C>],
        batch: Range<usize>,
        query_pool: &C::QueryPool,
    ) -> AccelResult<()> {
        let compacted_sizes =
            PendingCompaction::<C>::new(query_pool, batch.len() as u32).resolve(self.ctx)?;

        let mut cmd = self.ctx.begin_one_shot_commands()?;
        if let Err(err) =
            self.record_compactions(&mut cmd, pending, batch.clone(), &compacted_sizes)
        {
            self.ctx.discard_commands(cmd);
            return Err(err);
        }

        self.ctx.submit_and_wait(cmd)?;

        for idx in batch {
            if let Some(original) = pending[idx].replaced.take() {
                original.destroy(self.ctx);
            }
        }

        Ok(())
    }

    fn record_compactions(
        &self,
        cmd: &mut C::Cmd,
        pending: &mut [PendingBuild<'_, C>],
        batch: Range<usize>,
        compacted_sizes: &[u64],
    ) -> AccelResult<()> {
        for (slot, idx) in batch.enumerate() {
            let compacted_size = compacted_sizes[slot];
            debug_assert!(compacted_size <= pending[idx].sizes.structure_size);

            let compacted = AccelerationStructure::create(
                self.ctx,
                StructureLevel::BottomLevel,
                compacted_size,
            )?;
            let dst_handle = *compacted.handle();
            let original = pending[idx]
                .structure
                .replace(compacted)
                .expect("batch member was built before compaction");

            self.ctx
                .record_compact_copy(cmd, original.handle(), &dst_handle);

            pending[idx].sizes.structure_size = compacted_size;
            pending[idx].replaced = Some(original);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        acceleration_structure::BuildFlag,
        fake::{Event, FakeDevice},
        prelude::AccelError,
    };

    fn input(prims: u32, flags: BuildFlags) -> GeometryInput {
        GeometryInput::triangles(0x10_000, 12, prims * 3, 0x20_000, prims * 3, flags)
    }

    fn fast_trace() -> BuildFlags {
        BuildFlags::from(&[BuildFlag::PreferFastTrace])
    }

    fn compacting() -> BuildFlags {
        BuildFlags::from(&[BuildFlag::PreferFastTrace, BuildFlag::AllowCompaction])
    }

    #[test]
    fn plan_batches_groups_under_the_ceiling() {
        let batches = plan_batches(&[100, 100, 100, 100, 100], 250);
        assert_eq!(batches, vec![0..3, 3..5]);
    }

    #[test]
    fn plan_batches_gives_an_oversized_input_its_own_batch() {
        let batches = plan_batches(&[1_000, 10, 10], 250);
        assert_eq!(batches, vec![0..1, 1..3]);
    }

    #[test]
    fn plan_batches_covers_every_index_in_order() {
        let sizes = [5u64, 80, 3, 200, 1, 1, 90];
        let batches = plan_batches(&sizes, 100);

        let mut covered = Vec::new();
        for batch in &batches {
            covered.extend(batch.clone());
        }
        assert_eq!(covered, (0..sizes.len()).collect::<Vec<_>>());
    }

    #[test]
    fn plan_batches_with_unbounded_ceiling_is_one_batch() {
        let batches = plan_batches(&[100, 100, 100], u64::MAX);
        assert_eq!(batches, vec![0..3]);
    }

    #[test]
    fn single_triangle_build() {
        let _ = env_logger::builder().is_test(true).try_init();

        let device = FakeDevice::new();
        let mut scratch = ScratchBuffer::new();

        let inputs = [input(1, BuildFlags::empty())];
        let set = BlasBuilder::new(&device)
            .build_all(&inputs, fast_trace(), &mut scratch)
            .unwrap();

        assert_eq!(set.len(), 1);
        let blas = set.get(0).unwrap();
        let expected = device.query_build_sizes(
            &BuildDescription {
                level: StructureLevel::BottomLevel,
                mode: BuildMode::Build,
                flags: fast_trace(),
                geometry: GeometryDescription::Triangles(inputs[0].geometries()),
            },
            &[1],
        );
        assert_eq!(blas.size(), expected.unwrap().structure_size);
        assert_ne!(blas.device_address(), 0);

        // One submission, no compaction machinery.
        assert_eq!(device.submission_count(), 1);
        assert_eq!(device.query_read_count(), 0);

        set.destroy(&device);
        scratch.destroy(&device);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_structures(), 0);
    }

    #[test]
    fn builds_are_separated_by_scratch_barriers() {
        let device = FakeDevice::new();
        let mut scratch = ScratchBuffer::new();

        let inputs = [input(1, BuildFlags::empty()), input(2, BuildFlags::empty())];
        let set = BlasBuilder::new(&device)
            .build_all(&inputs, fast_trace(), &mut scratch)
            .unwrap();

        let submissions = device.submissions();
        assert_eq!(submissions.len(), 1);
        let kinds: Vec<&Event> = submissions[0].iter().collect();
        assert!(matches!(kinds[0], Event::Build { .. }));
        assert!(matches!(kinds[1], Event::Barrier { .. }));
        assert!(matches!(kinds[2], Event::Build { .. }));
        assert!(matches!(kinds[3], Event::Barrier { .. }));

        set.destroy(&device);
        scratch.destroy(&device);
    }

    #[test]
    fn scratch_is_sized_to_the_maximum_requirement_not_the_sum() {
        let device = FakeDevice::new();
        let mut scratch = ScratchBuffer::new();

        let inputs = [
            input(1, BuildFlags::empty()),
            input(100, BuildFlags::empty()),
            input(10, BuildFlags::empty()),
        ];
        let set = BlasBuilder::new(&device)
            .build_all(&inputs, fast_trace(), &mut scratch)
            .unwrap();

        let largest = device
            .query_build_sizes(
                &BuildDescription {
                    level: StructureLevel::BottomLevel,
                    mode: BuildMode::Build,
                    flags: fast_trace(),
                    geometry: GeometryDescription::Triangles(inputs[1].geometries()),
                },
                &[100],
            )
            .unwrap();
        assert_eq!(scratch.capacity(), largest.build_scratch_size);

        // Every build in the batch received the same scratch address.
        let addresses: Vec<u64> = device.submissions()[0]
            .iter()
            .filter_map(|e| match e {
                Event::Build { scratch, .. } => Some(*scratch),
                _ => None,
            })
            .collect();
        assert_eq!(addresses.len(), 3);
        assert!(addresses.windows(2).all(|w| w[0] == w[1]));

        set.destroy(&device);
        scratch.destroy(&device);
    }

    #[test]
    fn index_order_is_preserved() {
        let device = FakeDevice::new();
        let mut scratch = ScratchBuffer::new();

        let inputs = [
            input(7, BuildFlags::empty()),
            input(1, BuildFlags::empty()),
            input(31, BuildFlags::empty()),
        ];
        let set = BlasBuilder::new(&device)
            .build_all(&inputs, fast_trace(), &mut scratch)
            .unwrap();

        assert_eq!(set.len(), inputs.len());
        for (idx, inp) in inputs.iter().enumerate() {
            let expected = device
                .query_build_sizes(
                    &BuildDescription {
                        level: StructureLevel::BottomLevel,
                        mode: BuildMode::Build,
                        flags: fast_trace(),
                        geometry: GeometryDescription::Triangles(inp.geometries()),
                    },
                    &inp.max_primitive_counts(),
                )
                .unwrap();
            assert_eq!(set.get(idx).unwrap().size(), expected.structure_size);
        }

        set.destroy(&device);
        scratch.destroy(&device);
    }

    #[test]
    fn batching_does_not_change_per_index_output() {
        let inputs = [
            input(3, BuildFlags::empty()),
            input(9, BuildFlags::empty()),
            input(2, BuildFlags::empty()),
            input(40, BuildFlags::empty()),
        ];

        let tight_device = FakeDevice::new();
        let mut tight_scratch = ScratchBuffer::new();
        let tight = BlasBuilder::with_batch_ceiling(&tight_device, 1)
            .build_all(&inputs, fast_trace(), &mut tight_scratch)
            .unwrap();
        // Ceiling of one byte forces one batch per input.
        assert_eq!(tight_device.submission_count(), inputs.len());

        let loose_device = FakeDevice::new();
        let mut loose_scratch = ScratchBuffer::new();
        let loose = BlasBuilder::with_batch_ceiling(&loose_device, u64::MAX)
            .build_all(&inputs, fast_trace(), &mut loose_scratch)
            .unwrap();
        assert_eq!(loose_device.submission_count(), 1);

        for idx in 0..inputs.len() {
            assert_eq!(
                tight.get(idx).unwrap().size(),
                loose.get(idx).unwrap().size()
            );
        }

        tight.destroy(&tight_device);
        tight_scratch.destroy(&tight_device);
        loose.destroy(&loose_device);
        loose_scratch.destroy(&loose_device);
    }

    #[test]
    fn compaction_shrinks_and_destroys_the_originals() {
        let device = FakeDevice::new();
        let mut scratch = ScratchBuffer::new();

        let inputs = [input(8, compacting()), input(16, compacting())];
        let originals: Vec<u64> = inputs
            .iter()
            .map(|inp| {
                device
                    .query_build_sizes(
                        &BuildDescription {
                            level: StructureLevel::BottomLevel,
                            mode: BuildMode::Build,
                            flags: compacting(),
                            geometry: GeometryDescription::Triangles(inp.geometries()),
                        },
                        &inp.max_primitive_counts(),
                    )
                    .unwrap()
                    .structure_size
            })
            .collect();

        let set = BlasBuilder::new(&device)
            .build_all(&inputs, BuildFlags::empty(), &mut scratch)
            .unwrap();

        for (idx, original) in originals.iter().enumerate() {
            assert!(set.get(idx).unwrap().size() <= *original);
        }

        // One batch: one build submission, one compact-copy submission,
        // exactly one query readback.
        assert_eq!(device.submission_count(), 2);
        assert_eq!(device.query_read_count(), 1);

        // Only the two compacted structures are still alive.
        assert_eq!(device.live_structures(), 2);
        assert_eq!(device.destroyed_structure_count(), 2);

        set.destroy(&device);
        scratch.destroy(&device);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_structures(), 0);
    }

    #[test]
    fn compaction_reads_queries_once_per_batch() {
        let device = FakeDevice::new();
        let mut scratch = ScratchBuffer::new();

        let inputs = [
            input(8, compacting()),
            input(8, compacting()),
            input(8, compacting()),
        ];
        let set = BlasBuilder::with_batch_ceiling(&device, 1)
            .build_all(&inputs, BuildFlags::empty(), &mut scratch)
            .unwrap();

        // One batch per input, each with its own build + compact submissions
        // and its own readback.
        assert_eq!(device.submission_count(), 6);
        assert_eq!(device.query_read_count(), 3);

        set.destroy(&device);
        scratch.destroy(&device);
    }

    #[test]
    fn mixed_compaction_is_rejected_before_any_work() {
        let device = FakeDevice::new();
        let mut scratch = ScratchBuffer::new();

        let inputs = [input(1, compacting()), input(1, BuildFlags::empty())];
        let err = BlasBuilder::new(&device)
            .build_all(&inputs, BuildFlags::empty(), &mut scratch)
            .unwrap_err();

        assert!(matches!(
            err,
            AccelError::Configuration(ConfigurationError::MixedCompaction { requested: 1, total: 2 })
        ));
        assert_eq!(device.submission_count(), 0);
        assert_eq!(device.allocation_count(), 0);
    }

    #[test]
    fn empty_inputs_are_rejected() {
        let device = FakeDevice::new();
        let mut scratch = ScratchBuffer::new();

        let err = BlasBuilder::new(&device)
            .build_all(&[], fast_trace(), &mut scratch)
            .unwrap_err();
        assert!(matches!(
            err,
            AccelError::Configuration(ConfigurationError::EmptyInputs)
        ));
    }

    #[test]
    fn zero_primitive_input_is_rejected_before_allocation() {
        let device = FakeDevice::new();
        let mut scratch = ScratchBuffer::new();

        let inputs = [GeometryInput::triangles(
            0x10_000,
            12,
            3,
            0x20_000,
            0,
            BuildFlags::empty(),
        )];
        let err = BlasBuilder::new(&device)
            .build_all(&inputs, fast_trace(), &mut scratch)
            .unwrap_err();

        assert!(matches!(
            err,
            AccelError::Configuration(ConfigurationError::ZeroPrimitives { input: 0 })
        ));
        assert_eq!(device.allocation_count(), 0);
        assert_eq!(device.submission_count(), 0);
    }

    #[test]
    fn allocation_failure_tears_down_everything() {
        let device = FakeDevice::new();
        let mut scratch = ScratchBuffer::new();

        let inputs = [
            input(4, BuildFlags::empty()),
            input(4, BuildFlags::empty()),
            input(4, BuildFlags::empty()),
        ];
        // Scratch plus the first structure buffer succeed, the second
        // structure buffer fails mid-batch.
        device.fail_after_allocations(2);

        let err = BlasBuilder::new(&device)
            .build_all(&inputs, fast_trace(), &mut scratch)
            .unwrap_err();
        assert!(matches!(err, AccelError::ResourceExhaustion(_)));

        // The half-recorded command buffer was discarded, not abandoned.
        assert_eq!(device.open_command_count(), 0);

        scratch.destroy(&device);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_structures(), 0);
    }

    #[test]
    fn out_of_range_lookup_fails() {
        let device = FakeDevice::new();
        let mut scratch = ScratchBuffer::new();

        let inputs = [input(1, BuildFlags::empty())];
        let set = BlasBuilder::new(&device)
            .build_all(&inputs, fast_trace(), &mut scratch)
            .unwrap();

        assert!(set.device_address(0).is_ok());
        assert!(matches!(
            set.device_address(1),
            Err(AccelError::OutOfRange { index: 1, len: 1 })
        ));

        set.destroy(&device);
        scratch.destroy(&device);
    }
}
