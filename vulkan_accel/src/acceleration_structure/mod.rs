use crate::{
    context::{BufferKind, DeviceAddress, DeviceContext, StructureLevel},
    prelude::AccelResult,
};

pub mod bottom_level;
pub mod geometry;
pub mod registry;
pub mod top_level;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BuildFlag {
    PreferFastTrace,
    PreferFastBuild,
    AllowCompaction,
    AllowUpdate,
    LowMemory,
}

/// Represents VkBuildAccelerationStructureFlagBitsKHR.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct BuildFlags {
    prefer_fast_trace: bool,
    prefer_fast_build: bool,
    allow_compaction: bool,
    allow_update: bool,
    low_memory: bool,
}

impl BuildFlags {
    pub fn from(flags: &[BuildFlag]) -> Self {
        Self {
            prefer_fast_trace: flags.contains(&BuildFlag::PreferFastTrace),
            prefer_fast_build: flags.contains(&BuildFlag::PreferFastBuild),
            allow_compaction: flags.contains(&BuildFlag::AllowCompaction),
            allow_update: flags.contains(&BuildFlag::AllowUpdate),
            low_memory: flags.contains(&BuildFlag::LowMemory),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Per-input flags are combined with the flags of the whole build call,
    /// the union taking effect.
    pub fn merged(&self, other: &Self) -> Self {
        Self {
            prefer_fast_trace: self.prefer_fast_trace || other.prefer_fast_trace,
            prefer_fast_build: self.prefer_fast_build || other.prefer_fast_build,
            allow_compaction: self.allow_compaction || other.allow_compaction,
            allow_update: self.allow_update || other.allow_update,
            low_memory: self.low_memory || other.low_memory,
        }
    }

    #[inline]
    pub fn prefer_fast_trace(&self) -> bool {
        self.prefer_fast_trace
    }

    #[inline]
    pub fn prefer_fast_build(&self) -> bool {
        self.prefer_fast_build
    }

    #[inline]
    pub fn allow_compaction(&self) -> bool {
        self.allow_compaction
    }

    #[inline]
    pub fn allow_update(&self) -> bool {
        self.allow_update
    }

    #[inline]
    pub fn low_memory(&self) -> bool {
        self.low_memory
    }

    pub(crate) fn ash_flags(&self) -> ash::vk::BuildAccelerationStructureFlagsKHR {
        type AshFlags = ash::vk::BuildAccelerationStructureFlagsKHR;

        let mut flags = AshFlags::empty();
        if self.prefer_fast_trace {
            flags |= AshFlags::PREFER_FAST_TRACE;
        }
        if self.prefer_fast_build {
            flags |= AshFlags::PREFER_FAST_BUILD;
        }
        if self.allow_compaction {
            flags |= AshFlags::ALLOW_COMPACTION;
        }
        if self.allow_update {
            flags |= AshFlags::ALLOW_UPDATE;
        }
        if self.low_memory {
            flags |= AshFlags::LOW_MEMORY;
        }

        flags
    }
}

/// One acceleration structure and the buffer backing it, owned as a unit.
///
/// The backing buffer must outlive the opaque structure handle, so the two
/// are only ever destroyed together through [`AccelerationStructure::destroy`];
/// there is no way to drop one without the other.
pub struct AccelerationStructure<C: DeviceContext> {
    structure: C::Structure,
    buffer: C::Buffer,
    size: u64,
    device_address: DeviceAddress,
}

impl<C: DeviceContext> std::fmt::Debug for AccelerationStructure<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelerationStructure")
            .field("structure", &self.structure)
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .field("device_address", &self.device_address)
            .finish()
    }
}

impl<C: DeviceContext> AccelerationStructure<C> {
    /// Allocates the backing buffer and creates the structure object inside
    /// it. The structure is created with its final shape and size but holds
    /// no content until a build command targeting it has executed.
    pub fn create(ctx: &C, level: StructureLevel, size: u64) -> AccelResult<Self> {
        let buffer = ctx.allocate_buffer(size, BufferKind::AccelerationStorage)?;

        let structure = match ctx.create_structure(level, size, &buffer) {
            Ok(structure) => structure,
            Err(err) => {
                ctx.destroy_buffer(buffer);
                return Err(err);
            }
        };

        let device_address = ctx.structure_device_address(&structure);

        Ok(Self {
            structure,
            buffer,
            size,
            device_address,
        })
    }

    #[inline]
    pub fn handle(&self) -> &C::Structure {
        &self.structure
    }

    #[inline]
    pub fn buffer(&self) -> &C::Buffer {
        &self.buffer
    }

    /// Size in bytes of the backing buffer.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn device_address(&self) -> DeviceAddress {
        self.device_address
    }

    pub fn destroy(self, ctx: &C) {
        ctx.destroy_structure(self.structure);
        ctx.destroy_buffer(self.buffer);
    }
}

/// Builder working space shared by every build within one call.
///
/// Grow-only: `ensure` reallocates when the requirement exceeds the current
/// capacity and reuses the existing buffer otherwise, so one scratch buffer
/// can serve a whole BLAS batch and then the TLAS build before being
/// released. The owner must not let unrelated GPU work touch the buffer while
/// a build call is in flight.
pub struct ScratchBuffer<C: DeviceContext> {
    buffer: Option<C::Buffer>,
    capacity: u64,
    address: DeviceAddress,
}

impl<C: DeviceContext> Default for ScratchBuffer<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: DeviceContext> ScratchBuffer<C> {
    pub fn new() -> Self {
        Self {
            buffer: None,
            capacity: 0,
            address: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the device address of a scratch region of at least `size`
    /// bytes, reallocating if the current buffer is too small.
    pub fn ensure(&mut self, ctx: &C, size: u64) -> AccelResult<DeviceAddress> {
        if self.buffer.is_none() || self.capacity < size {
            if let Some(old) = self.buffer.take() {
                ctx.destroy_buffer(old);
            }

            let buffer = ctx.allocate_buffer(size, BufferKind::Scratch)?;
            self.address = ctx.buffer_device_address(&buffer);
            self.capacity = size;
            self.buffer = Some(buffer);
        }

        Ok(self.address)
    }

    pub fn destroy(&mut self, ctx: &C) {
        if let Some(buffer) = self.buffer.take() {
            ctx.destroy_buffer(buffer);
        }
        self.capacity = 0;
        self.address = 0;
    }
}
