//! In-memory device used by the unit tests: tracks resource liveness,
//! records every command into a per-submission event log, and models build
//! sizes deterministically so size-related properties can be asserted
//! without a GPU.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
};

use crate::{
    acceleration_structure::top_level::InstanceRecord,
    context::{
        BufferKind, BuildDescription, BuildMode, BuildSizes, DeviceAddress, DeviceContext,
        GeometryDescription, MemoryAccess, PipelineStage, StructureLevel,
    },
    prelude::{AccelError, AccelResult},
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) struct FakeBuffer(u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) struct FakeStructure(u64);

pub(crate) struct FakeQueryPool {
    id: u64,
}

#[derive(Default)]
pub(crate) struct FakeCmd {
    events: Vec<Event>,
    staging: Vec<FakeBuffer>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event {
    Build {
        level: StructureLevel,
        mode: BuildMode,
        dst: FakeStructure,
        src: Option<FakeStructure>,
        scratch: DeviceAddress,
        primitive_counts: Vec<u32>,
    },
    Barrier {
        src_stage: PipelineStage,
        dst_stage: PipelineStage,
        src_access: MemoryAccess,
        dst_access: MemoryAccess,
    },
    CompactCopy {
        src: FakeStructure,
        dst: FakeStructure,
    },
    CompactedSizeQuery {
        pool: u64,
        structure: FakeStructure,
        index: u32,
    },
    InstanceUpload {
        buffer: FakeBuffer,
        count: u32,
    },
}

struct BufferInfo {
    size: u64,
    #[allow(dead_code)]
    kind: BufferKind,
}

struct StructureInfo {
    #[allow(dead_code)]
    level: StructureLevel,
    size: u64,
    address: DeviceAddress,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    buffers: HashMap<FakeBuffer, BufferInfo>,
    structures: HashMap<FakeStructure, StructureInfo>,
    pools: HashMap<u64, Vec<Option<u64>>>,
    submissions: Vec<Vec<Event>>,
    allocations: usize,
    query_reads: usize,
    destroyed_structures: usize,
    open_commands: usize,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

pub(crate) struct FakeDevice {
    inner: RefCell<Inner>,
    allocation_budget: Cell<Option<usize>>,
}

/// Deterministic stand-in for the hardware size query. Independent of build
/// flags so the same description always reports the same sizes.
fn model_sizes(desc: &BuildDescription<'_>, max_primitive_counts: &[u32]) -> BuildSizes {
    match desc.geometry {
        GeometryDescription::Triangles(_) => {
            let prims: u64 = max_primitive_counts.iter().map(|c| *c as u64).sum();
            BuildSizes {
                structure_size: 256 + 64 * prims,
                build_scratch_size: 128 + 32 * prims,
                update_scratch_size: 64 + 16 * prims,
            }
        }
        GeometryDescription::Instances { count, .. } => BuildSizes {
            structure_size: 512 + 96 * count as u64,
            build_scratch_size: 256 + 16 * count as u64,
            update_scratch_size: 128 + 8 * count as u64,
        },
    }
}

fn model_compacted(size: u64) -> u64 {
    size / 2 + 16
}

impl FakeDevice {
    pub(crate) fn new() -> Self {
        Self {
            inner: RefCell::new(Inner::default()),
            allocation_budget: Cell::new(None),
        }
    }

    /// After `n` further successful buffer allocations, every allocation
    /// fails with `ResourceExhaustion`.
    pub(crate) fn fail_after_allocations(&self, n: usize) {
        self.allocation_budget.set(Some(n));
    }

    pub(crate) fn submissions(&self) -> Vec<Vec<Event>> {
        self.inner.borrow().submissions.clone()
    }

    pub(crate) fn submission_count(&self) -> usize {
        self.inner.borrow().submissions.len()
    }

    pub(crate) fn allocation_count(&self) -> usize {
        self.inner.borrow().allocations
    }

    pub(crate) fn query_read_count(&self) -> usize {
        self.inner.borrow().query_reads
    }

    pub(crate) fn live_buffers(&self) -> usize {
        self.inner.borrow().buffers.len()
    }

    pub(crate) fn live_structures(&self) -> usize {
        self.inner.borrow().structures.len()
    }

    pub(crate) fn destroyed_structure_count(&self) -> usize {
        self.inner.borrow().destroyed_structures
    }

    /// Command buffers begun but neither submitted nor discarded.
    pub(crate) fn open_command_count(&self) -> usize {
        self.inner.borrow().open_commands
    }
}

impl DeviceContext for FakeDevice {
    type Buffer = FakeBuffer;
    type Structure = FakeStructure;
    type QueryPool = FakeQueryPool;
    type Cmd = FakeCmd;

    fn allocate_buffer(&self, size: u64, kind: BufferKind) -> AccelResult<Self::Buffer> {
        match self.allocation_budget.get() {
            Some(0) => {
                return Err(AccelError::ResourceExhaustion(String::from(
                    "allocation budget exhausted",
                )))
            }
            Some(n) => self.allocation_budget.set(Some(n - 1)),
            None => {}
        }

        let mut inner = self.inner.borrow_mut();
        let buffer = FakeBuffer(inner.next_id());
        inner.buffers.insert(buffer, BufferInfo { size, kind });
        inner.allocations += 1;
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: Self::Buffer) {
        let removed = self.inner.borrow_mut().buffers.remove(&buffer);
        assert!(removed.is_some(), "destroying dead buffer {buffer:?}");
    }

    fn buffer_device_address(&self, buffer: &Self::Buffer) -> DeviceAddress {
        assert!(self.inner.borrow().buffers.contains_key(buffer));
        0x1000 * buffer.0
    }

    fn begin_one_shot_commands(&self) -> AccelResult<Self::Cmd> {
        self.inner.borrow_mut().open_commands += 1;
        Ok(FakeCmd::default())
    }

    fn submit_and_wait(&self, cmd: Self::Cmd) -> AccelResult<()> {
        {
            let mut inner = self.inner.borrow_mut();

            // Executing the submission makes the queried compacted sizes
            // available; they cannot be read back before this point.
            for event in &cmd.events {
                if let Event::CompactedSizeQuery {
                    pool,
                    structure,
                    index,
                } = event
                {
                    let size = model_compacted(inner.structures[structure].size);
                    let results = inner.pools.get_mut(pool).expect("pool is alive");
                    results[*index as usize] = Some(size);
                }
            }

            inner.submissions.push(cmd.events);
            inner.open_commands -= 1;
        }

        // Staging copies have executed; release their buffers.
        for staging in cmd.staging {
            self.destroy_buffer(staging);
        }

        Ok(())
    }

    fn discard_commands(&self, cmd: Self::Cmd) {
        self.inner.borrow_mut().open_commands -= 1;
        for staging in cmd.staging {
            self.destroy_buffer(staging);
        }
    }

    fn query_build_sizes(
        &self,
        desc: &BuildDescription<'_>,
        max_primitive_counts: &[u32],
    ) -> AccelResult<BuildSizes> {
        Ok(model_sizes(desc, max_primitive_counts))
    }

    fn create_structure(
        &self,
        level: StructureLevel,
        size: u64,
        backing: &Self::Buffer,
    ) -> AccelResult<Self::Structure> {
        let mut inner = self.inner.borrow_mut();
        assert!(
            inner.buffers.contains_key(backing),
            "structure backed by dead buffer"
        );
        assert!(size <= inner.buffers[backing].size);

        let structure = FakeStructure(inner.next_id());
        let address = 0xAA00_0000 + structure.0 * 0x40;
        inner.structures.insert(
            structure,
            StructureInfo {
                level,
                size,
                address,
            },
        );
        Ok(structure)
    }

    fn destroy_structure(&self, structure: Self::Structure) {
        let mut inner = self.inner.borrow_mut();
        let removed = inner.structures.remove(&structure);
        assert!(removed.is_some(), "destroying dead structure {structure:?}");
        inner.destroyed_structures += 1;
    }

    fn structure_device_address(&self, structure: &Self::Structure) -> DeviceAddress {
        self.inner.borrow().structures[structure].address
    }

    fn record_build(
        &self,
        cmd: &mut Self::Cmd,
        desc: &BuildDescription<'_>,
        src: Option<&Self::Structure>,
        dst: &Self::Structure,
        scratch: DeviceAddress,
        ranges: &[crate::acceleration_structure::geometry::BuildRange],
    ) {
        cmd.events.push(Event::Build {
            level: desc.level,
            mode: desc.mode,
            dst: *dst,
            src: src.copied(),
            scratch,
            primitive_counts: ranges.iter().map(|r| r.primitive_count).collect(),
        });
    }

    fn record_barrier(
        &self,
        cmd: &mut Self::Cmd,
        src_stage: PipelineStage,
        dst_stage: PipelineStage,
        src_access: MemoryAccess,
        dst_access: MemoryAccess,
    ) {
        cmd.events.push(Event::Barrier {
            src_stage,
            dst_stage,
            src_access,
            dst_access,
        });
    }

    fn record_compact_copy(
        &self,
        cmd: &mut Self::Cmd,
        src: &Self::Structure,
        dst: &Self::Structure,
    ) {
        cmd.events.push(Event::CompactCopy {
            src: *src,
            dst: *dst,
        });
    }

    fn create_query_pool(&self, count: u32) -> AccelResult<Self::QueryPool> {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id();
        inner.pools.insert(id, vec![None; count as usize]);
        Ok(FakeQueryPool { id })
    }

    fn destroy_query_pool(&self, pool: Self::QueryPool) {
        let removed = self.inner.borrow_mut().pools.remove(&pool.id);
        assert!(removed.is_some(), "destroying dead query pool");
    }

    fn reset_query_pool(&self, pool: &Self::QueryPool, count: u32) {
        let mut inner = self.inner.borrow_mut();
        let results = inner.pools.get_mut(&pool.id).expect("pool is alive");
        for slot in results.iter_mut().take(count as usize) {
            *slot = None;
        }
    }

    fn record_compacted_size_query(
        &self,
        cmd: &mut Self::Cmd,
        structure: &Self::Structure,
        pool: &Self::QueryPool,
        index: u32,
    ) {
        cmd.events.push(Event::CompactedSizeQuery {
            pool: pool.id,
            structure: *structure,
            index,
        });
    }

    fn read_compacted_sizes_blocking(
        &self,
        pool: &Self::QueryPool,
        count: u32,
    ) -> AccelResult<Vec<u64>> {
        let mut inner = self.inner.borrow_mut();
        inner.query_reads += 1;

        let results = &inner.pools[&pool.id];
        results
            .iter()
            .take(count as usize)
            .map(|slot| {
                slot.ok_or(AccelError::Device(
                    -1,
                    Some(String::from("compacted size query never executed")),
                ))
            })
            .collect()
    }

    fn record_instance_upload(
        &self,
        cmd: &mut Self::Cmd,
        instances: &[InstanceRecord],
    ) -> AccelResult<(Self::Buffer, DeviceAddress)> {
        // 64 bytes per packed instance, matching the hardware layout. The
        // staged copy travels with the command buffer, like the backend's
        // host-visible staging allocation.
        let size = 64 * instances.len().max(1) as u64;
        let staging = self.allocate_buffer(size, BufferKind::InstanceInput)?;
        let buffer = match self.allocate_buffer(size, BufferKind::InstanceInput) {
            Ok(buffer) => buffer,
            Err(err) => {
                self.destroy_buffer(staging);
                return Err(err);
            }
        };

        cmd.staging.push(staging);
        let address = self.buffer_device_address(&buffer);
        cmd.events.push(Event::InstanceUpload {
            buffer,
            count: instances.len() as u32,
        });
        Ok((buffer, address))
    }
}
