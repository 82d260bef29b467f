use crate::{
    acceleration_structure::{
        geometry::{BuildRange, TriangleGeometry},
        BuildFlags,
    },
    prelude::AccelResult,
};

/// Raw GPU-visible pointer-equivalent, as handed to build commands and
/// shaders. See VkDeviceAddress.
pub type DeviceAddress = u64;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StructureLevel {
    BottomLevel,
    TopLevel,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BuildMode {
    /// Build the structure content from scratch.
    Build,
    /// Refit an existing structure in place; requires the allow-update flag
    /// on the original build and unchanged topology.
    Update,
}

/// The buffer roles this pipeline allocates. The backend maps each role to
/// the usage and memory flags the API requires for it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BufferKind {
    /// Backing storage for a BLAS or TLAS.
    AccelerationStorage,
    /// Builder working space, reused across builds within one call.
    Scratch,
    /// Device-local destination of the staged instance-array upload.
    InstanceInput,
}

/// The pipeline stages this pipeline synchronizes between.
/// Represents the relevant subset of VkPipelineStageFlagBits.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PipelineStage {
    Transfer,
    AccelerationStructureBuild,
}

/// Represents the relevant subset of VkAccessFlagBits.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryAccess {
    TransferWrite,
    AccelerationStructureRead,
    AccelerationStructureWrite,
}

/// Hardware-reported size requirements for one build.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct BuildSizes {
    /// Bytes of backing storage the built structure needs.
    pub structure_size: u64,
    /// Bytes of scratch the builder needs for a full build.
    pub build_scratch_size: u64,
    /// Bytes of scratch the builder needs for an update (refit).
    pub update_scratch_size: u64,
}

/// What a structure is built over: per-object triangle geometry for a BLAS,
/// or a device-side instance array for a TLAS.
#[derive(Debug, Copy, Clone)]
pub enum GeometryDescription<'a> {
    Triangles(&'a [TriangleGeometry]),
    Instances { address: DeviceAddress, count: u32 },
}

/// Everything the backend needs to size or record one build, short of the
/// destination structure and scratch address which are bound at record time.
#[derive(Debug, Copy, Clone)]
pub struct BuildDescription<'a> {
    pub level: StructureLevel,
    pub mode: BuildMode,
    pub flags: BuildFlags,
    pub geometry: GeometryDescription<'a>,
}

/// The device-side collaborator surface of the build pipeline.
///
/// Everything the builders do to the GPU goes through this trait: buffer and
/// structure lifetime, one-shot command recording with blocking submission,
/// size queries, and the compacted-size query protocol. The associated handle
/// types keep the backend's handles opaque to the builders, so a test double
/// can stand in for the device without touching the build logic.
///
/// Single logical thread: implementations are driven from one thread per
/// context and need no internal synchronization beyond what the API demands.
pub trait DeviceContext {
    type Buffer: Copy + Eq + std::fmt::Debug;
    type Structure: Copy + Eq + std::fmt::Debug;
    type QueryPool;
    type Cmd;

    fn allocate_buffer(&self, size: u64, kind: BufferKind) -> AccelResult<Self::Buffer>;
    fn destroy_buffer(&self, buffer: Self::Buffer);
    fn buffer_device_address(&self, buffer: &Self::Buffer) -> DeviceAddress;

    fn begin_one_shot_commands(&self) -> AccelResult<Self::Cmd>;
    /// Submits the recorded commands and blocks until the queue has executed
    /// them. This is the only synchronization point between CPU and GPU
    /// besides [`DeviceContext::read_compacted_sizes_blocking`].
    fn submit_and_wait(&self, cmd: Self::Cmd) -> AccelResult<()>;
    /// Releases a recorded but never submitted command buffer together with
    /// any staging allocations it carries. Every `Cmd` must end in exactly
    /// one [`DeviceContext::submit_and_wait`] or
    /// [`DeviceContext::discard_commands`] call.
    fn discard_commands(&self, cmd: Self::Cmd);

    /// One `max_primitive_counts` entry per geometry in the description.
    fn query_build_sizes(
        &self,
        desc: &BuildDescription<'_>,
        max_primitive_counts: &[u32],
    ) -> AccelResult<BuildSizes>;

    /// Creates the opaque structure object inside `backing`. The backing
    /// buffer must stay alive for as long as the structure handle does.
    fn create_structure(
        &self,
        level: StructureLevel,
        size: u64,
        backing: &Self::Buffer,
    ) -> AccelResult<Self::Structure>;
    fn destroy_structure(&self, structure: Self::Structure);
    fn structure_device_address(&self, structure: &Self::Structure) -> DeviceAddress;

    fn record_build(
        &self,
        cmd: &mut Self::Cmd,
        desc: &BuildDescription<'_>,
        src: Option<&Self::Structure>,
        dst: &Self::Structure,
        scratch: DeviceAddress,
        ranges: &[BuildRange],
    );
    fn record_barrier(
        &self,
        cmd: &mut Self::Cmd,
        src_stage: PipelineStage,
        dst_stage: PipelineStage,
        src_access: MemoryAccess,
        dst_access: MemoryAccess,
    );
    fn record_compact_copy(&self, cmd: &mut Self::Cmd, src: &Self::Structure, dst: &Self::Structure);

    fn create_query_pool(&self, count: u32) -> AccelResult<Self::QueryPool>;
    fn destroy_query_pool(&self, pool: Self::QueryPool);
    fn reset_query_pool(&self, pool: &Self::QueryPool, count: u32);
    fn record_compacted_size_query(
        &self,
        cmd: &mut Self::Cmd,
        structure: &Self::Structure,
        pool: &Self::QueryPool,
        index: u32,
    );
    /// Blocks until the first `count` query results are available. Results
    /// are mandatory: waiting forever here means the device is lost, which is
    /// outside this crate's contract.
    fn read_compacted_sizes_blocking(
        &self,
        pool: &Self::QueryPool,
        count: u32,
    ) -> AccelResult<Vec<u64>>;

    /// Records a staged host-to-device copy of the packed instance array into
    /// `cmd` and returns the device-local destination buffer plus its
    /// address. The copy has only happened once `cmd` has been submitted and
    /// waited on; a transfer-to-build barrier must separate it from the build
    /// that reads it. The returned buffer is owned by the caller.
    fn record_instance_upload(
        &self,
        cmd: &mut Self::Cmd,
        instances: &[crate::acceleration_structure::top_level::InstanceRecord],
    ) -> AccelResult<(Self::Buffer, DeviceAddress)>;
}
