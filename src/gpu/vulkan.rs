//! Vulkan implementation of the [`Device`] seam, over `ash`.

use std::{ops::Range, ptr::NonNull};

use ash::vk;

use crate::{
    error::{MappingError, OutOfMemory},
    gpu::device::{Device, MemoryProperties, MemoryPropertyFlags, MemoryRequirements, MemoryTypeInfo},
};

impl From<vk::Result> for OutOfMemory {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => OutOfMemory::Host,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => OutOfMemory::Device,
            other => panic!("unexpected driver error: {:?}", other),
        }
    }
}

impl From<vk::Result> for MappingError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => OutOfMemory::Host.into(),
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => OutOfMemory::Device.into(),
            vk::Result::ERROR_MEMORY_MAP_FAILED => MappingError::MappingFailed,
            other => panic!("unexpected driver error: {:?}", other),
        }
    }
}

fn convert_flags(flags: vk::MemoryPropertyFlags) -> MemoryPropertyFlags {
    MemoryPropertyFlags::from_bits_truncate(flags.as_raw())
}

/// Vulkan logical device plus the memory topology of its physical device.
pub struct VulkanDevice {
    device: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanDevice {
    /// Wrap a logical device, querying memory properties from
    /// `physical_device`.
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
    ) -> Self {
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        VulkanDevice {
            device,
            memory_properties,
        }
    }

    /// The wrapped `ash` device.
    pub fn raw(&self) -> &ash::Device {
        &self.device
    }
}

impl Device for VulkanDevice {
    type Memory = vk::DeviceMemory;
    type Buffer = vk::Buffer;
    type Image = vk::Image;

    fn memory_properties(&self) -> MemoryProperties {
        let type_count = self.memory_properties.memory_type_count as usize;
        let heap_count = self.memory_properties.memory_heap_count as usize;

        MemoryProperties {
            types: self.memory_properties.memory_types[..type_count]
                .iter()
                .map(|ty| MemoryTypeInfo {
                    properties: convert_flags(ty.property_flags),
                    heap_index: ty.heap_index,
                })
                .collect(),
            heaps: self.memory_properties.memory_heaps[..heap_count]
                .iter()
                .map(|heap| heap.size)
                .collect(),
        }
    }

    unsafe fn allocate(&self, type_index: u32, size: u64) -> Result<vk::DeviceMemory, OutOfMemory> {
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(type_index);
        self.device
            .allocate_memory(&info, None)
            .map_err(Into::into)
    }

    unsafe fn free(&self, memory: vk::DeviceMemory) {
        self.device.free_memory(memory, None);
    }

    unsafe fn map(
        &self,
        memory: &vk::DeviceMemory,
        range: Range<u64>,
    ) -> Result<NonNull<u8>, MappingError> {
        let ptr = self
            .device
            .map_memory(
                *memory,
                range.start,
                range.end - range.start,
                vk::MemoryMapFlags::empty(),
            )
            .map_err(MappingError::from)?;
        debug_assert!(!ptr.is_null());
        Ok(NonNull::new_unchecked(ptr as *mut u8))
    }

    unsafe fn unmap(&self, memory: &vk::DeviceMemory) {
        self.device.unmap_memory(*memory);
    }

    unsafe fn flush(&self, memory: &vk::DeviceMemory, range: Range<u64>) -> Result<(), OutOfMemory> {
        let mapped_range = vk::MappedMemoryRange::default()
            .memory(*memory)
            .offset(range.start)
            .size(range.end - range.start);
        self.device
            .flush_mapped_memory_ranges(&[mapped_range])
            .map_err(Into::into)
    }

    unsafe fn invalidate(
        &self,
        memory: &vk::DeviceMemory,
        range: Range<u64>,
    ) -> Result<(), OutOfMemory> {
        let mapped_range = vk::MappedMemoryRange::default()
            .memory(*memory)
            .offset(range.start)
            .size(range.end - range.start);
        self.device
            .invalidate_mapped_memory_ranges(&[mapped_range])
            .map_err(Into::into)
    }

    fn buffer_requirements(&self, buffer: &vk::Buffer) -> MemoryRequirements {
        let requirements = unsafe { self.device.get_buffer_memory_requirements(*buffer) };
        MemoryRequirements {
            size: requirements.size,
            alignment: requirements.alignment,
            type_mask: requirements.memory_type_bits,
        }
    }

    fn image_requirements(&self, image: &vk::Image) -> MemoryRequirements {
        let requirements = unsafe { self.device.get_image_memory_requirements(*image) };
        MemoryRequirements {
            size: requirements.size,
            alignment: requirements.alignment,
            type_mask: requirements.memory_type_bits,
        }
    }
}
