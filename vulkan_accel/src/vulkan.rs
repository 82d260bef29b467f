//! ash-backed [`DeviceContext`] implementation over the
//! `VK_KHR_acceleration_structure` extension.

use ash::vk;
use log::{trace, warn};

use crate::{
    acceleration_structure::{geometry::BuildRange, top_level::InstanceRecord},
    context::{
        BufferKind, BuildDescription, BuildMode, BuildSizes, DeviceAddress, DeviceContext,
        GeometryDescription, MemoryAccess, PipelineStage, StructureLevel,
    },
    prelude::{AccelError, AccelResult},
};

fn map_vk(err: vk::Result, what: &str) -> AccelError {
    match err {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            AccelError::ResourceExhaustion(format!("{what}: {err}"))
        }
        _ => AccelError::Device(err.as_raw(), Some(String::from(what))),
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// A `VkBuffer` bound to its own dedicated allocation, plus the device
/// address resolved (and for scratch buffers, aligned) at allocation time.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BoundBuffer {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    address: DeviceAddress,
}

/// One-time-submit command buffer plus the staging buffers whose content it
/// reads; the staging allocations are released together with the command
/// buffer once the submission has been waited on.
pub struct OneShotCommands {
    command_buffer: vk::CommandBuffer,
    staging: Vec<(vk::Buffer, vk::DeviceMemory)>,
}

/// Everything the build pipeline needs from a ready Vulkan device. The caller
/// keeps ownership of instance and device; the context owns only the command
/// pool it creates for its one-shot submissions.
///
/// Requires `VK_KHR_acceleration_structure` (with its buffer-device-address
/// dependency) enabled on the device.
pub struct VulkanContext {
    device: ash::Device,
    accel_fns: ash::khr::acceleration_structure::Device,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    scratch_alignment: u64,
}

impl VulkanContext {
    /// `scratch_alignment` is
    /// `minAccelerationStructureScratchOffsetAlignment` from
    /// `VkPhysicalDeviceAccelerationStructurePropertiesKHR`.
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queue: vk::Queue,
        queue_family_index: u32,
        scratch_alignment: u64,
    ) -> AccelResult<Self> {
        let accel_fns = ash::khr::acceleration_structure::Device::new(instance, &device);
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(queue_family_index);
        let command_pool = unsafe {
            device
                .create_command_pool(&pool_info, None)
                .map_err(|err| map_vk(err, "command pool creation"))?
        };

        Ok(Self {
            device,
            accel_fns,
            queue,
            command_pool,
            memory_properties,
            scratch_alignment: scratch_alignment.max(1),
        })
    }

    /// Destroys the context's command pool. Call once all buffers and
    /// structures allocated through the context have been destroyed.
    pub fn release(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
        }
        self.command_pool = vk::CommandPool::null();
    }

    fn find_memory_type(
        &self,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> AccelResult<u32> {
        let count = self.memory_properties.memory_type_count as usize;
        for (index, memory_type) in self.memory_properties.memory_types[..count]
            .iter()
            .enumerate()
        {
            if (type_bits & (1u32 << index)) != 0
                && memory_type.property_flags.contains(properties)
            {
                return Ok(index as u32);
            }
        }

        Err(AccelError::ResourceExhaustion(format!(
            "no memory type matches bits {type_bits:#x} with {properties:?}"
        )))
    }

    fn create_bound_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> AccelResult<(vk::Buffer, vk::DeviceMemory)> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size.max(1))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe {
            self.device
                .create_buffer(&buffer_info, None)
                .map_err(|err| map_vk(err, "buffer creation"))?
        };

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let memory_type = match self.find_memory_type(requirements.memory_type_bits, properties) {
            Ok(memory_type) => memory_type,
            Err(err) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        let mut flags_info = vk::MemoryAllocateFlagsInfo::default()
            .flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let needs_address = usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);
        let mut alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        if needs_address {
            alloc_info = alloc_info.push_next(&mut flags_info);
        }

        let memory = match unsafe { self.device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(map_vk(err, "buffer memory allocation"));
            }
        };

        if let Err(err) = unsafe { self.device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                self.device.destroy_buffer(buffer, None);
                self.device.free_memory(memory, None);
            }
            return Err(map_vk(err, "buffer memory bind"));
        }

        Ok((buffer, memory))
    }

    /// Frees the command buffer and the staging allocations it reads,
    /// whether or not the commands were ever submitted.
    fn dispose_commands(&self, cmd: &OneShotCommands) {
        unsafe {
            self.device
                .free_command_buffers(self.command_pool, &[cmd.command_buffer]);
            for (buffer, memory) in &cmd.staging {
                self.device.destroy_buffer(*buffer, None);
                self.device.free_memory(*memory, None);
            }
        }
    }

    fn raw_device_address(&self, buffer: vk::Buffer) -> DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
        unsafe { self.device.get_buffer_device_address(&info) }
    }

    fn ash_geometries<'a>(
        &self,
        desc: &BuildDescription<'a>,
    ) -> Vec<vk::AccelerationStructureGeometryKHR<'a>> {
        match desc.geometry {
            GeometryDescription::Triangles(geometries) => geometries
                .iter()
                .map(|geometry| {
                    let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                        .vertex_format(geometry.vertex_format().ash_format())
                        .vertex_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: geometry.vertex_address(),
                        })
                        .vertex_stride(geometry.vertex_stride())
                        .max_vertex(geometry.vertex_count().saturating_sub(1))
                        .index_type(geometry.indexing().ash_index_type())
                        .index_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: geometry.index_address(),
                        });

                    let flags = match geometry.opaque() {
                        true => vk::GeometryFlagsKHR::OPAQUE,
                        false => vk::GeometryFlagsKHR::empty(),
                    };

                    vk::AccelerationStructureGeometryKHR::default()
                        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                        .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                        .flags(flags)
                })
                .collect(),
            GeometryDescription::Instances { address, .. } => {
                let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: address,
                    });

                vec![vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { instances })]
            }
        }
    }
}

fn ash_level(level: StructureLevel) -> vk::AccelerationStructureTypeKHR {
    match level {
        StructureLevel::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        StructureLevel::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

fn ash_mode(mode: BuildMode) -> vk::BuildAccelerationStructureModeKHR {
    match mode {
        BuildMode::Build => vk::BuildAccelerationStructureModeKHR::BUILD,
        BuildMode::Update => vk::BuildAccelerationStructureModeKHR::UPDATE,
    }
}

fn ash_stage(stage: PipelineStage) -> vk::PipelineStageFlags {
    match stage {
        PipelineStage::Transfer => vk::PipelineStageFlags::TRANSFER,
        PipelineStage::AccelerationStructureBuild => {
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR
        }
    }
}

fn ash_access(access: MemoryAccess) -> vk::AccessFlags {
    match access {
        MemoryAccess::TransferWrite => vk::AccessFlags::TRANSFER_WRITE,
        MemoryAccess::AccelerationStructureRead => {
            vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
        }
        MemoryAccess::AccelerationStructureWrite => {
            vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR
        }
    }
}

/// Hardware layout of one TLAS instance entry.
fn pack_instance(record: &InstanceRecord) -> vk::AccelerationStructureInstanceKHR {
    // First three rows of the row-major transform.
    let mut matrix = [0.0f32; 12];
    for (row, chunk) in record.transform.iter().take(3).zip(matrix.chunks_exact_mut(4)) {
        chunk.copy_from_slice(row);
    }

    vk::AccelerationStructureInstanceKHR {
        transform: vk::TransformMatrixKHR { matrix },
        instance_custom_index_and_mask: vk::Packed24_8::new(record.custom_index, record.mask),
        instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
            record.shader_group_offset,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE
                .as_raw()
                .try_into()
                .unwrap_or(0),
        ),
        acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
            device_handle: record.blas_address,
        },
    }
}

impl DeviceContext for VulkanContext {
    type Buffer = BoundBuffer;
    type Structure = vk::AccelerationStructureKHR;
    type QueryPool = vk::QueryPool;
    type Cmd = OneShotCommands;

    fn allocate_buffer(&self, size: u64, kind: BufferKind) -> AccelResult<Self::Buffer> {
        let usage = match kind {
            BufferKind::AccelerationStorage => {
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            }
            BufferKind::Scratch => {
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            }
            BufferKind::InstanceInput => {
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                    | vk::BufferUsageFlags::TRANSFER_DST
            }
        };

        // Scratch addresses must honor the device's scratch offset alignment,
        // so over-allocate and align the address itself.
        let padded_size = match kind {
            BufferKind::Scratch => size + self.scratch_alignment,
            _ => size,
        };

        let (buffer, memory) = self.create_bound_buffer(
            padded_size,
            usage,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        let raw_address = self.raw_device_address(buffer);
        let address = match kind {
            BufferKind::Scratch => align_up(raw_address, self.scratch_alignment),
            _ => raw_address,
        };

        trace!("allocated {kind:?} buffer of {padded_size} bytes at {address:#x}");

        Ok(BoundBuffer {
            buffer,
            memory,
            address,
        })
    }

    fn destroy_buffer(&self, buffer: Self::Buffer) {
        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
            self.device.free_memory(buffer.memory, None);
        }
    }

    fn buffer_device_address(&self, buffer: &Self::Buffer) -> DeviceAddress {
        buffer.address
    }

    fn begin_one_shot_commands(&self) -> AccelResult<Self::Cmd> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .map_err(|err| map_vk(err, "command buffer allocation"))?[0]
        };

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if let Err(err) = unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) }
        {
            unsafe {
                self.device
                    .free_command_buffers(self.command_pool, &[command_buffer]);
            }
            return Err(map_vk(err, "command buffer begin"));
        }

        Ok(OneShotCommands {
            command_buffer,
            staging: Vec::new(),
        })
    }

    fn submit_and_wait(&self, cmd: Self::Cmd) -> AccelResult<()> {
        if let Err(err) = unsafe { self.device.end_command_buffer(cmd.command_buffer) } {
            self.dispose_commands(&cmd);
            return Err(map_vk(err, "command buffer end"));
        }

        let fence = match unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default(), None)
        } {
            Ok(fence) => fence,
            Err(err) => {
                self.dispose_commands(&cmd);
                return Err(map_vk(err, "fence creation"));
            }
        };

        let command_buffers = [cmd.command_buffer];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        let outcome = match unsafe {
            self.device.queue_submit(self.queue, &[submit_info], fence)
        } {
            Ok(()) => unsafe {
                self.device
                    .wait_for_fences(&[fence], true, u64::MAX)
                    .map_err(|err| map_vk(err, "fence wait"))
            },
            Err(err) => Err(map_vk(err, "queue submission")),
        };

        unsafe {
            self.device.destroy_fence(fence, None);
        }
        self.dispose_commands(&cmd);
        outcome
    }

    fn discard_commands(&self, cmd: Self::Cmd) {
        self.dispose_commands(&cmd);
    }

    fn query_build_sizes(
        &self,
        desc: &BuildDescription<'_>,
        max_primitive_counts: &[u32],
    ) -> AccelResult<BuildSizes> {
        let geometries = self.ash_geometries(desc);
        let info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(ash_level(desc.level))
            .mode(ash_mode(desc.mode))
            .flags(desc.flags.ash_flags())
            .geometries(&geometries);

        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.accel_fns.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &info,
                max_primitive_counts,
                &mut sizes,
            );
        }

        Ok(BuildSizes {
            structure_size: sizes.acceleration_structure_size,
            build_scratch_size: sizes.build_scratch_size,
            update_scratch_size: sizes.update_scratch_size,
        })
    }

    fn create_structure(
        &self,
        level: StructureLevel,
        size: u64,
        backing: &Self::Buffer,
    ) -> AccelResult<Self::Structure> {
        let info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(backing.buffer)
            .offset(0)
            .size(size)
            .ty(ash_level(level));

        unsafe {
            self.accel_fns
                .create_acceleration_structure(&info, None)
                .map_err(|err| map_vk(err, "acceleration structure creation"))
        }
    }

    fn destroy_structure(&self, structure: Self::Structure) {
        unsafe {
            self.accel_fns.destroy_acceleration_structure(structure, None);
        }
    }

    fn structure_device_address(&self, structure: &Self::Structure) -> DeviceAddress {
        let info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
            .acceleration_structure(*structure);
        unsafe {
            self.accel_fns
                .get_acceleration_structure_device_address(&info)
        }
    }

    fn record_build(
        &self,
        cmd: &mut Self::Cmd,
        desc: &BuildDescription<'_>,
        src: Option<&Self::Structure>,
        dst: &Self::Structure,
        scratch: DeviceAddress,
        ranges: &[BuildRange],
    ) {
        let geometries = self.ash_geometries(desc);
        let mut info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(ash_level(desc.level))
            .mode(ash_mode(desc.mode))
            .flags(desc.flags.ash_flags())
            .geometries(&geometries)
            .dst_acceleration_structure(*dst)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch,
            });
        if let Some(src) = src {
            info = info.src_acceleration_structure(*src);
        }

        let range_infos: Vec<vk::AccelerationStructureBuildRangeInfoKHR> = ranges
            .iter()
            .map(|range| {
                vk::AccelerationStructureBuildRangeInfoKHR::default()
                    .primitive_count(range.primitive_count)
                    .primitive_offset(range.primitive_offset)
                    .first_vertex(range.first_vertex)
                    .transform_offset(range.transform_offset)
            })
            .collect();

        unsafe {
            self.accel_fns.cmd_build_acceleration_structures(
                cmd.command_buffer,
                &[info],
                &[range_infos.as_slice()],
            );
        }
    }

    fn record_barrier(
        &self,
        cmd: &mut Self::Cmd,
        src_stage: PipelineStage,
        dst_stage: PipelineStage,
        src_access: MemoryAccess,
        dst_access: MemoryAccess,
    ) {
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(ash_access(src_access))
            .dst_access_mask(ash_access(dst_access));

        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd.command_buffer,
                ash_stage(src_stage),
                ash_stage(dst_stage),
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
    }

    fn record_compact_copy(&self, cmd: &mut Self::Cmd, src: &Self::Structure, dst: &Self::Structure) {
        let info = vk::CopyAccelerationStructureInfoKHR::default()
            .src(*src)
            .dst(*dst)
            .mode(vk::CopyAccelerationStructureModeKHR::COMPACT);

        unsafe {
            self.accel_fns
                .cmd_copy_acceleration_structure(cmd.command_buffer, &info);
        }
    }

    fn create_query_pool(&self, count: u32) -> AccelResult<Self::QueryPool> {
        let info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
            .query_count(count);

        unsafe {
            self.device
                .create_query_pool(&info, None)
                .map_err(|err| map_vk(err, "query pool creation"))
        }
    }

    fn destroy_query_pool(&self, pool: Self::QueryPool) {
        unsafe {
            self.device.destroy_query_pool(pool, None);
        }
    }

    fn reset_query_pool(&self, pool: &Self::QueryPool, count: u32) {
        unsafe {
            self.device.reset_query_pool(*pool, 0, count);
        }
    }

    fn record_compacted_size_query(
        &self,
        cmd: &mut Self::Cmd,
        structure: &Self::Structure,
        pool: &Self::QueryPool,
        index: u32,
    ) {
        unsafe {
            self.accel_fns.cmd_write_acceleration_structures_properties(
                cmd.command_buffer,
                &[*structure],
                vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                *pool,
                index,
            );
        }
    }

    fn read_compacted_sizes_blocking(
        &self,
        pool: &Self::QueryPool,
        count: u32,
    ) -> AccelResult<Vec<u64>> {
        let mut results = vec![0u64; count as usize];
        unsafe {
            self.device
                .get_query_pool_results(
                    *pool,
                    0,
                    &mut results,
                    vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
                )
                .map_err(|err| map_vk(err, "compacted size readback"))?;
        }

        Ok(results)
    }

    fn record_instance_upload(
        &self,
        cmd: &mut Self::Cmd,
        instances: &[InstanceRecord],
    ) -> AccelResult<(Self::Buffer, DeviceAddress)> {
        let packed: Vec<vk::AccelerationStructureInstanceKHR> =
            instances.iter().map(pack_instance).collect();
        let size = (packed.len().max(1)
            * std::mem::size_of::<vk::AccelerationStructureInstanceKHR>())
            as u64;

        let (staging, staging_memory) = self.create_bound_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let mapped = unsafe {
            self.device
                .map_memory(staging_memory, 0, size, vk::MemoryMapFlags::empty())
        };
        match mapped {
            Ok(ptr) => unsafe {
                std::ptr::copy_nonoverlapping(
                    packed.as_ptr(),
                    ptr as *mut vk::AccelerationStructureInstanceKHR,
                    packed.len(),
                );
                self.device.unmap_memory(staging_memory);
            },
            Err(err) => {
                unsafe {
                    self.device.destroy_buffer(staging, None);
                    self.device.free_memory(staging_memory, None);
                }
                return Err(map_vk(err, "staging buffer map"));
            }
        }

        let destination = match self.allocate_buffer(size, BufferKind::InstanceInput) {
            Ok(destination) => destination,
            Err(err) => {
                unsafe {
                    self.device.destroy_buffer(staging, None);
                    self.device.free_memory(staging_memory, None);
                }
                return Err(err);
            }
        };

        let region = vk::BufferCopy::default().size(size);
        unsafe {
            self.device
                .cmd_copy_buffer(cmd.command_buffer, staging, destination.buffer, &[region]);
        }

        cmd.staging.push((staging, staging_memory));

        Ok((destination, destination.address))
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        if self.command_pool != vk::CommandPool::null() {
            warn!("vulkan context dropped without release(); leaking the command pool");
        }
    }
}
