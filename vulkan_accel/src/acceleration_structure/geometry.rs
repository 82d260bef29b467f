use smallvec::SmallVec;

use crate::{
    acceleration_structure::BuildFlags,
    context::DeviceAddress,
    prelude::{AccelResult, ConfigurationError},
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VertexIndexing {
    None,
    UInt16,
    UInt32,
}

impl VertexIndexing {
    pub fn size(&self) -> u64 {
        match self {
            VertexIndexing::None => 0u64,
            VertexIndexing::UInt16 => 2u64,
            VertexIndexing::UInt32 => 4u64,
        }
    }

    pub(crate) fn ash_index_type(&self) -> ash::vk::IndexType {
        match self {
            VertexIndexing::None => ash::vk::IndexType::NONE_KHR,
            VertexIndexing::UInt16 => ash::vk::IndexType::UINT16,
            VertexIndexing::UInt32 => ash::vk::IndexType::UINT32,
        }
    }
}

/// In-memory format of the vertex position attribute.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VertexFormat {
    R32G32B32Sfloat,
    R32G32B32A32Sfloat,
}

impl VertexFormat {
    /// Bytes occupied by one position attribute; the stride may be larger
    /// when user data follows each vertex.
    pub fn size(&self) -> u64 {
        match self {
            VertexFormat::R32G32B32Sfloat => 4u64 * 3,
            VertexFormat::R32G32B32A32Sfloat => 4u64 * 4,
        }
    }

    pub(crate) fn ash_format(&self) -> ash::vk::Format {
        match self {
            VertexFormat::R32G32B32Sfloat => ash::vk::Format::R32G32B32_SFLOAT,
            VertexFormat::R32G32B32A32Sfloat => ash::vk::Format::R32G32B32A32_SFLOAT,
        }
    }
}

/// One triangle-mesh geometry descriptor: raw device addresses of the vertex
/// and index buffers plus their layout. The referenced buffers are owned by
/// the geometry source and must stay valid for the duration of the build call
/// that reads them.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TriangleGeometry {
    vertex_address: DeviceAddress,
    vertex_stride: u64,
    vertex_count: u32,
    vertex_format: VertexFormat,
    indexing: VertexIndexing,
    index_address: DeviceAddress,
    index_count: u32,
    opaque: bool,
}

impl TriangleGeometry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vertex_address: DeviceAddress,
        vertex_stride: u64,
        vertex_count: u32,
        vertex_format: VertexFormat,
        indexing: VertexIndexing,
        index_address: DeviceAddress,
        index_count: u32,
        opaque: bool,
    ) -> Self {
        Self {
            vertex_address,
            vertex_stride,
            vertex_count,
            vertex_format,
            indexing,
            index_address,
            index_count,
            opaque,
        }
    }

    #[inline]
    pub fn vertex_address(&self) -> DeviceAddress {
        self.vertex_address
    }

    #[inline]
    pub fn vertex_stride(&self) -> u64 {
        self.vertex_stride
    }

    #[inline]
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    #[inline]
    pub fn vertex_format(&self) -> VertexFormat {
        self.vertex_format
    }

    #[inline]
    pub fn indexing(&self) -> VertexIndexing {
        self.indexing
    }

    #[inline]
    pub fn index_address(&self) -> DeviceAddress {
        self.index_address
    }

    #[inline]
    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    #[inline]
    pub fn opaque(&self) -> bool {
        self.opaque
    }
}

/// Represents VkAccelerationStructureBuildRangeInfoKHR.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct BuildRange {
    pub primitive_count: u32,
    pub primitive_offset: u32,
    pub first_vertex: u32,
    pub transform_offset: u32,
}

impl BuildRange {
    /// The whole buffer, starting at primitive zero.
    pub fn full(primitive_count: u32) -> Self {
        Self {
            primitive_count,
            ..Default::default()
        }
    }
}

/// Per-object build input: one or more triangle geometries with matching
/// build ranges, plus flags specific to this object. Immutable once
/// constructed; the builder borrows it read-only for the duration of one
/// build call.
#[derive(Debug, Clone)]
pub struct GeometryInput {
    geometries: SmallVec<[TriangleGeometry; 1]>,
    ranges: SmallVec<[BuildRange; 1]>,
    flags: BuildFlags,
}

impl GeometryInput {
    pub fn new(
        geometries: impl IntoIterator<Item = TriangleGeometry>,
        ranges: impl IntoIterator<Item = BuildRange>,
        flags: BuildFlags,
    ) -> Self {
        Self {
            geometries: geometries.into_iter().collect(),
            ranges: ranges.into_iter().collect(),
            flags,
        }
    }

    /// Adapter for the common one-mesh case: position-only `vec3` vertices
    /// and `u32` indices, opaque triangles, the whole index buffer in one
    /// build range. This is the shape a loaded model arrives in.
    pub fn triangles(
        vertex_address: DeviceAddress,
        vertex_stride: u64,
        vertex_count: u32,
        index_address: DeviceAddress,
        index_count: u32,
        flags: BuildFlags,
    ) -> Self {
        let geometry = TriangleGeometry::new(
            vertex_address,
            vertex_stride,
            vertex_count,
            VertexFormat::R32G32B32Sfloat,
            VertexIndexing::UInt32,
            index_address,
            index_count,
            true,
        );

        Self::new([geometry], [BuildRange::full(index_count / 3)], flags)
    }

    #[inline]
    pub fn geometries(&self) -> &[TriangleGeometry] {
        self.geometries.as_slice()
    }

    #[inline]
    pub fn ranges(&self) -> &[BuildRange] {
        self.ranges.as_slice()
    }

    #[inline]
    pub fn flags(&self) -> BuildFlags {
        self.flags
    }

    pub(crate) fn max_primitive_counts(&self) -> SmallVec<[u32; 4]> {
        self.ranges.iter().map(|r| r.primitive_count).collect()
    }

    /// Checked by the builder before anything is allocated or recorded.
    pub(crate) fn validate(&self, input_index: usize) -> AccelResult<()> {
        if self.geometries.is_empty() {
            return Err(ConfigurationError::EmptyGeometry { input: input_index }.into());
        }

        if self.geometries.len() != self.ranges.len() {
            return Err(ConfigurationError::RangeCountMismatch {
                input: input_index,
                geometries: self.geometries.len(),
                ranges: self.ranges.len(),
            }
            .into());
        }

        if self.ranges.iter().any(|r| r.primitive_count == 0) {
            return Err(ConfigurationError::ZeroPrimitives { input: input_index }.into());
        }

        Ok(())
    }
}
