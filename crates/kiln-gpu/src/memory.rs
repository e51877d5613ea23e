//! GPU memory management.
//!
//! The allocator is created once after the logical device and shut down
//! explicitly before the device is destroyed. Every buffer or image it hands
//! out keeps its allocation in an `Option` that is taken on release, so a
//! second free is a no-op.

use crate::error::{GpuError, Result};
use ash::vk;
use bitflags::bitflags;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::{AllocationError, MemoryLocation};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Memory usage class requested for an allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryUsage {
    /// Device-local, never touched by the host.
    GpuOnly,
    /// Host-visible, written sequentially by the host and read by the device.
    CpuToGpu,
    /// Host-visible, written by the device and read back by the host.
    GpuToCpu,
    /// Device-local unless host access is requested through flags.
    AutoPreferDevice,
    /// Host-visible; random access selects read-back memory.
    AutoPreferHost,
}

bitflags! {
    /// Creation flags refining a [`MemoryUsage`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AllocationFlags: u32 {
        /// Keep the allocation persistently mapped.
        const MAPPED = 1 << 0;
        /// Host writes sequentially (memcpy-style).
        const HOST_ACCESS_SEQUENTIAL_WRITE = 1 << 1;
        /// Host reads and writes in arbitrary order.
        const HOST_ACCESS_RANDOM = 1 << 2;
        /// Give the resource its own device memory block.
        const DEDICATED = 1 << 3;
    }
}

impl AllocationFlags {
    const fn wants_host_access(self) -> bool {
        self.intersects(
            Self::MAPPED
                .union(Self::HOST_ACCESS_SEQUENTIAL_WRITE)
                .union(Self::HOST_ACCESS_RANDOM),
        )
    }
}

/// Description of one allocation request.
#[derive(Clone, Copy, Debug)]
pub struct AllocationDesc<'a> {
    pub name: &'a str,
    pub usage: MemoryUsage,
    pub flags: AllocationFlags,
}

impl<'a> AllocationDesc<'a> {
    /// Device-local memory.
    pub const fn gpu_only(name: &'a str) -> Self {
        Self {
            name,
            usage: MemoryUsage::GpuOnly,
            flags: AllocationFlags::empty(),
        }
    }

    /// Persistently mapped upload memory.
    pub const fn staging(name: &'a str) -> Self {
        Self {
            name,
            usage: MemoryUsage::CpuToGpu,
            flags: AllocationFlags::MAPPED,
        }
    }

    /// Host-readable download memory.
    pub const fn readback(name: &'a str) -> Self {
        Self {
            name,
            usage: MemoryUsage::GpuToCpu,
            flags: AllocationFlags::MAPPED.union(AllocationFlags::HOST_ACCESS_RANDOM),
        }
    }
}

/// Map a usage class and flags onto a gpu-allocator memory location.
pub const fn resolve_location(usage: MemoryUsage, flags: AllocationFlags) -> MemoryLocation {
    match usage {
        MemoryUsage::GpuOnly => MemoryLocation::GpuOnly,
        MemoryUsage::CpuToGpu => MemoryLocation::CpuToGpu,
        MemoryUsage::GpuToCpu => MemoryLocation::GpuToCpu,
        MemoryUsage::AutoPreferDevice => {
            if flags.wants_host_access() {
                MemoryLocation::CpuToGpu
            } else {
                MemoryLocation::GpuOnly
            }
        }
        MemoryUsage::AutoPreferHost => {
            if flags.contains(AllocationFlags::HOST_ACCESS_RANDOM) {
                MemoryLocation::GpuToCpu
            } else {
                MemoryLocation::CpuToGpu
            }
        }
    }
}

/// Translate an allocator failure, keeping out-of-memory distinct from a bad request.
pub(crate) fn allocation_error(err: AllocationError, name: &str, size: u64) -> GpuError {
    match err {
        AllocationError::OutOfMemory => GpuError::OutOfDeviceMemory {
            name: name.to_string(),
            size,
        },
        AllocationError::NoCompatibleMemoryTypeFound
        | AllocationError::InvalidAllocationCreateDesc => {
            GpuError::InvalidDescription(format!("'{name}': {err}"))
        }
        other => GpuError::Other(format!("Allocation of '{name}' failed: {other}")),
    }
}

/// Translate a native failure, keeping out-of-memory distinct from other codes.
pub(crate) fn native_error(err: vk::Result, name: &str, size: u64) -> GpuError {
    match err {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            GpuError::OutOfDeviceMemory {
                name: name.to_string(),
                size,
            }
        }
        other => {
            tracing::error!(resource = name, "native call failed: {other}");
            GpuError::Vulkan(other)
        }
    }
}

/// Return memory whose bind failed. A failed free is logged; the bind error
/// is the one reported.
fn free_unbound(allocator: &mut Allocator, allocation: Allocation, name: &str) {
    if let Err(e) = allocator.free(allocation) {
        tracing::warn!(resource = name, "leaked memory after failed bind: {e}");
    }
}

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| allocation_error(e, "allocator", 0))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
        })
    }

    /// Returns true until [`Self::shutdown`] has run.
    pub const fn is_active(&self) -> bool {
        self.allocator.is_some()
    }

    fn inner(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator has been shut down".to_string()))
    }

    /// Create a buffer and bind fresh memory to it.
    pub fn allocate_buffer(
        &mut self,
        create_info: &vk::BufferCreateInfo<'_>,
        desc: &AllocationDesc<'_>,
    ) -> Result<GpuBuffer> {
        if create_info.size == 0 {
            return Err(GpuError::InvalidDescription(format!(
                "buffer '{}' has zero size",
                desc.name
            )));
        }
        let location = resolve_location(desc.usage, desc.flags);
        let device = Arc::clone(&self.device);
        let allocator = self.inner()?;

        let buffer = unsafe { device.create_buffer(create_info, None) }
            .map_err(|e| native_error(e, desc.name, create_info.size))?;
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let allocation_scheme = if desc.flags.contains(AllocationFlags::DEDICATED) {
            AllocationScheme::DedicatedBuffer(buffer)
        } else {
            AllocationScheme::GpuAllocatorManaged
        };

        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name: desc.name,
            requirements,
            location,
            linear: true,
            allocation_scheme,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(allocation_error(e, desc.name, requirements.size));
            }
        };

        if let Err(e) =
            unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }
        {
            free_unbound(allocator, allocation, desc.name);
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(native_error(e, desc.name, requirements.size));
        }

        tracing::debug!(
            name = desc.name,
            size = create_info.size,
            ?location,
            "allocated buffer"
        );

        Ok(GpuBuffer {
            buffer,
            allocation: Some(allocation),
            size: create_info.size,
            location,
        })
    }

    /// Release a buffer's memory and destroy its handle. A second call is a no-op.
    pub fn free_buffer(&mut self, buffer: &mut GpuBuffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            let name = allocation.name().unwrap_or("unnamed").to_string();
            self.inner()?
                .free(allocation)
                .map_err(|e| allocation_error(e, &name, buffer.size))?;
            tracing::debug!(name, size = buffer.size, "freed buffer");
        }

        if buffer.buffer != vk::Buffer::null() {
            unsafe {
                self.device.destroy_buffer(buffer.buffer, None);
            }
            buffer.buffer = vk::Buffer::null();
        }

        Ok(())
    }

    /// Create an image and bind fresh memory to it.
    pub fn allocate_image(
        &mut self,
        create_info: &vk::ImageCreateInfo<'_>,
        desc: &AllocationDesc<'_>,
    ) -> Result<GpuImage> {
        let extent = create_info.extent;
        if extent.width == 0 || extent.height == 0 || extent.depth == 0 {
            return Err(GpuError::InvalidDescription(format!(
                "image '{}' has zero extent {}x{}x{}",
                desc.name, extent.width, extent.height, extent.depth
            )));
        }
        let location = resolve_location(desc.usage, desc.flags);
        let device = Arc::clone(&self.device);
        let allocator = self.inner()?;

        let image = unsafe { device.create_image(create_info, None) }
            .map_err(|e| native_error(e, desc.name, 0))?;
        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let allocation_scheme = if desc.flags.contains(AllocationFlags::DEDICATED) {
            AllocationScheme::DedicatedImage(image)
        } else {
            AllocationScheme::GpuAllocatorManaged
        };

        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name: desc.name,
            requirements,
            location,
            linear: create_info.tiling == vk::ImageTiling::LINEAR,
            allocation_scheme,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(allocation_error(e, desc.name, requirements.size));
            }
        };

        if let Err(e) =
            unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset()) }
        {
            free_unbound(allocator, allocation, desc.name);
            unsafe { device.destroy_image(image, None) };
            return Err(native_error(e, desc.name, requirements.size));
        }

        tracing::debug!(
            name = desc.name,
            size = requirements.size,
            width = extent.width,
            height = extent.height,
            ?location,
            "allocated image"
        );

        Ok(GpuImage {
            image,
            allocation: Some(allocation),
            format: create_info.format,
            extent,
        })
    }

    /// Release an image's memory and destroy its handle. A second call is a no-op.
    pub fn free_image(&mut self, image: &mut GpuImage) -> Result<()> {
        if let Some(allocation) = image.allocation.take() {
            let name = allocation.name().unwrap_or("unnamed").to_string();
            let size = allocation.size();
            self.inner()?
                .free(allocation)
                .map_err(|e| allocation_error(e, &name, size))?;
            tracing::debug!(name, size, "freed image");
        }

        if image.image != vk::Image::null() {
            unsafe {
                self.device.destroy_image(image.image, None);
            }
            image.image = vk::Image::null();
        }

        Ok(())
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed. Any remaining
    /// allocations are reported as leaks. Calling it again does nothing.
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            tracing::debug!("shutting down device memory allocator");
            drop(allocator);
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A GPU buffer with its allocation.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
    pub location: MemoryLocation,
}

impl GpuBuffer {
    /// Returns true if the host can write the buffer through a mapping.
    pub fn is_host_visible(&self) -> bool {
        self.allocation
            .as_ref()
            .is_some_and(|a| a.mapped_ptr().is_some())
    }

    /// Borrow the buffer's host mapping.
    pub fn map(&mut self) -> Result<MappedRange<'_>> {
        let size = usize::try_from(self.size)
            .map_err(|_| GpuError::InvalidState("Buffer exceeds host address space".into()))?;
        let allocation = self
            .allocation
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Buffer has been released".to_string()))?;
        let bytes = allocation
            .mapped_slice_mut()
            .ok_or_else(|| GpuError::InvalidState("Buffer is not host visible".to_string()))?;
        let len = size.min(bytes.len());
        Ok(MappedRange {
            bytes: &mut bytes[..len],
        })
    }

    /// Write raw bytes to the buffer at the given offset (must be host-visible).
    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let mut mapped = self.map()?;
        write_bytes_at(&mut mapped, offset, data)
    }

    /// Write typed data at the start of the buffer (must be host-visible).
    pub fn write<T: bytemuck::Pod>(&mut self, data: &[T]) -> Result<()> {
        self.write_bytes(0, bytemuck::cast_slice(data))
    }
}

/// Host view of a mapped allocation. Dropping the guard ends host access.
pub struct MappedRange<'a> {
    bytes: &'a mut [u8],
}

impl Deref for MappedRange<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

impl DerefMut for MappedRange<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.bytes
    }
}

impl Drop for MappedRange<'_> {
    fn drop(&mut self) {
        // Host-visible blocks stay persistently mapped by the allocator and
        // are host coherent, so ending access needs no flush.
        tracing::trace!(len = self.bytes.len(), "host mapping released");
    }
}

/// Copy `src` into `dst` at `offset`, rejecting writes that would run past the end.
pub fn write_bytes_at(dst: &mut [u8], offset: u64, src: &[u8]) -> Result<()> {
    let start = usize::try_from(offset)
        .map_err(|_| GpuError::InvalidState(format!("Offset {offset} out of range")))?;
    let end = start
        .checked_add(src.len())
        .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
    if end > dst.len() {
        return Err(GpuError::InvalidState(format!(
            "Write of {} bytes at offset {offset} exceeds buffer of {} bytes",
            src.len(),
            dst.len()
        )));
    }
    dst[start..end].copy_from_slice(src);
    Ok(())
}

/// A GPU image with its allocation.
pub struct GpuImage {
    pub image: vk::Image,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_usages_resolve_directly() {
        let none = AllocationFlags::empty();
        assert_eq!(resolve_location(MemoryUsage::GpuOnly, none), MemoryLocation::GpuOnly);
        assert_eq!(resolve_location(MemoryUsage::CpuToGpu, none), MemoryLocation::CpuToGpu);
        assert_eq!(resolve_location(MemoryUsage::GpuToCpu, none), MemoryLocation::GpuToCpu);
        // Explicit classes ignore host flags.
        assert_eq!(
            resolve_location(MemoryUsage::GpuOnly, AllocationFlags::MAPPED),
            MemoryLocation::GpuOnly
        );
    }

    #[test]
    fn auto_prefer_device_moves_to_host_when_host_access_is_requested() {
        assert_eq!(
            resolve_location(MemoryUsage::AutoPreferDevice, AllocationFlags::empty()),
            MemoryLocation::GpuOnly
        );
        assert_eq!(
            resolve_location(MemoryUsage::AutoPreferDevice, AllocationFlags::DEDICATED),
            MemoryLocation::GpuOnly
        );
        for flags in [
            AllocationFlags::MAPPED,
            AllocationFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
            AllocationFlags::HOST_ACCESS_RANDOM,
        ] {
            assert_eq!(
                resolve_location(MemoryUsage::AutoPreferDevice, flags),
                MemoryLocation::CpuToGpu
            );
        }
    }

    #[test]
    fn auto_prefer_host_reads_back_on_random_access() {
        assert_eq!(
            resolve_location(MemoryUsage::AutoPreferHost, AllocationFlags::empty()),
            MemoryLocation::CpuToGpu
        );
        assert_eq!(
            resolve_location(
                MemoryUsage::AutoPreferHost,
                AllocationFlags::HOST_ACCESS_RANDOM | AllocationFlags::MAPPED
            ),
            MemoryLocation::GpuToCpu
        );
    }

    #[test]
    fn allocator_errors_keep_out_of_memory_separate() {
        let oom = allocation_error(AllocationError::OutOfMemory, "vertices", 64);
        assert!(matches!(
            oom,
            GpuError::OutOfDeviceMemory { ref name, size: 64 } if name == "vertices"
        ));

        let bad = allocation_error(AllocationError::NoCompatibleMemoryTypeFound, "vertices", 64);
        assert!(matches!(bad, GpuError::InvalidDescription(_)));

        let native = native_error(vk::Result::ERROR_OUT_OF_HOST_MEMORY, "image", 0);
        assert!(native.is_out_of_memory());
        assert!(matches!(
            native_error(vk::Result::ERROR_DEVICE_LOST, "image", 0),
            GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST)
        ));
    }

    #[test]
    fn write_bytes_at_checks_range() {
        let mut dst = [0u8; 8];
        write_bytes_at(&mut dst, 2, &[1, 2, 3]).unwrap();
        assert_eq!(dst, [0, 0, 1, 2, 3, 0, 0, 0]);

        write_bytes_at(&mut dst, 5, &[9, 9, 9]).unwrap();
        assert_eq!(&dst[5..], &[9, 9, 9]);

        assert!(matches!(
            write_bytes_at(&mut dst, 6, &[1, 2, 3]),
            Err(GpuError::InvalidState(_))
        ));
        assert!(write_bytes_at(&mut dst, u64::MAX, &[1]).is_err());
    }
}
