//! Buffers with staged upload and recreation.
//!
//! A buffer created with initial data lives in device-local memory and is
//! filled through a temporary staging buffer and a one-shot copy. A buffer
//! created without data (or with `host_visible`) is persistently mapped and
//! written directly.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::memory::{write_bytes_at, AllocationDesc, AllocationFlags, GpuBuffer, MemoryUsage};
use ash::vk;

/// What a buffer is bound as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Vertex,
    Index,
    Uniform,
    Storage,
}

impl BufferKind {
    /// Usage flags for this kind. Every buffer may be a copy source or target.
    pub fn usage(self) -> vk::BufferUsageFlags {
        let kind = match self {
            Self::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            Self::Index => vk::BufferUsageFlags::INDEX_BUFFER,
            Self::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            Self::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
        };
        kind | vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST
    }

    /// Descriptor range limit that applies to this kind, if any.
    pub fn range_limit(self, gpu: &GpuContext) -> Option<u64> {
        let caps = gpu.capabilities();
        match self {
            Self::Uniform => Some(caps.max_uniform_buffer_range),
            Self::Storage => Some(caps.max_storage_buffer_range),
            Self::Vertex | Self::Index => None,
        }
    }
}

/// Where a buffer's memory lives. Fixed at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Placement {
    /// Filled through staging copies.
    DeviceLocal,
    /// Written through the host mapping.
    HostVisible,
}

/// Construction parameters for a [`Buffer`].
#[derive(Clone, Debug, Default)]
pub struct BufferProperties<'a> {
    pub name: String,
    /// Initial contents, copied at construction.
    pub data: Option<&'a [u8]>,
    /// Size in bytes. Zero means `data.len()`.
    pub size: u64,
    /// Number of elements. Zero is treated as one.
    pub count: u32,
    /// Keep the allocation mapped for the buffer's lifetime.
    pub always_mapped: bool,
    /// Allocate host-visible memory even when initial data is given.
    pub host_visible: bool,
}

impl<'a> BufferProperties<'a> {
    /// Properties for an empty host-visible buffer.
    pub fn sized(name: impl Into<String>, size: u64, count: u32) -> Self {
        Self {
            name: name.into(),
            size,
            count,
            ..Default::default()
        }
    }

    /// Properties for a buffer initialised from `data`.
    pub fn with_data(name: impl Into<String>, data: &'a [u8], count: u32) -> Self {
        Self {
            name: name.into(),
            data: Some(data),
            size: data.len() as u64,
            count,
            ..Default::default()
        }
    }

    /// Request host-visible memory.
    #[must_use]
    pub const fn host_visible(mut self, host_visible: bool) -> Self {
        self.host_visible = host_visible;
        self
    }

    /// Request a persistent mapping.
    #[must_use]
    pub const fn always_mapped(mut self, always_mapped: bool) -> Self {
        self.always_mapped = always_mapped;
        self
    }

    /// Copy of these properties without the borrowed initial data.
    pub fn detached(&self) -> BufferProperties<'static> {
        BufferProperties {
            name: self.name.clone(),
            data: None,
            size: self.size,
            count: self.count,
            always_mapped: self.always_mapped,
            host_visible: self.host_visible,
        }
    }

    /// Placement chosen for these properties.
    pub const fn placement(&self) -> Placement {
        if self.data.is_some() && !self.host_visible {
            Placement::DeviceLocal
        } else {
            Placement::HostVisible
        }
    }

    /// Fill in defaults and check the description against the data.
    fn normalized(mut self) -> Result<Self> {
        if self.size == 0 {
            self.size = self.data.map_or(0, |d| d.len() as u64);
        }
        self.count = self.count.max(1);
        if self.size == 0 {
            return Err(GpuError::InvalidDescription(format!(
                "buffer '{}' has zero size",
                self.name
            )));
        }
        if let Some(data) = self.data {
            if data.len() as u64 > self.size {
                return Err(GpuError::InvalidDescription(format!(
                    "buffer '{}': {} bytes of data exceed size {}",
                    self.name,
                    data.len(),
                    self.size
                )));
            }
        }
        Ok(self)
    }
}

/// Fit `size` bytes of `count` elements into `max` bytes.
///
/// The element stride `size / count` is kept; `count` drops to the number of
/// whole elements that fit and `size` follows it.
pub fn clamp_to_range(size: u64, count: u32, max: u64) -> Result<(u64, u32)> {
    if size <= max {
        return Ok((size, count));
    }
    let count = count.max(1);
    let stride = size / u64::from(count);
    if stride == 0 || stride > max {
        return Err(GpuError::InvalidDescription(format!(
            "element of {stride} bytes exceeds range limit {max}"
        )));
    }
    let fitted = u32::try_from(max / stride).unwrap_or(u32::MAX).min(count);
    Ok((u64::from(fitted) * stride, fitted))
}

/// Allocation request for a placement.
fn allocation_desc(name: &str, placement: Placement, always_mapped: bool) -> AllocationDesc<'_> {
    match placement {
        Placement::DeviceLocal => AllocationDesc {
            name,
            usage: MemoryUsage::AutoPreferDevice,
            flags: AllocationFlags::empty(),
        },
        Placement::HostVisible => {
            let mut flags = AllocationFlags::HOST_ACCESS_SEQUENTIAL_WRITE;
            if always_mapped {
                flags |= AllocationFlags::MAPPED;
            }
            AllocationDesc {
                name,
                usage: MemoryUsage::AutoPreferDevice,
                flags,
            }
        }
    }
}

/// A GPU buffer that remembers how it was built.
pub struct Buffer {
    kind: BufferKind,
    placement: Placement,
    properties: BufferProperties<'static>,
    inner: GpuBuffer,
}

impl Buffer {
    /// Create a buffer, uploading `properties.data` if present.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn new(
        gpu: &GpuContext,
        kind: BufferKind,
        properties: BufferProperties<'_>,
    ) -> Result<Self> {
        let mut properties = properties.normalized()?;

        if let Some(max) = kind.range_limit(gpu) {
            let (size, count) = clamp_to_range(properties.size, properties.count, max)?;
            if size != properties.size {
                tracing::warn!(
                    name = %properties.name,
                    requested = properties.size,
                    clamped = size,
                    count,
                    "buffer clamped to descriptor range limit"
                );
                properties.size = size;
                properties.count = count;
            }
        }

        let placement = properties.placement();
        let data = properties.data;
        let properties = properties.detached();
        let inner = allocate(gpu, kind, placement, &properties)?;

        let mut buffer = Self {
            kind,
            placement,
            properties,
            inner,
        };

        if let Some(data) = data {
            // Clamping may have shortened the buffer below the data length
            let len = data.len().min(usize::try_from(buffer.size()).unwrap_or(usize::MAX));
            if let Err(e) = buffer.set_data(gpu, &data[..len], 0) {
                buffer.destroy(gpu);
                return Err(e);
            }
        }

        Ok(buffer)
    }

    /// Create a buffer holding a slice of plain values.
    pub fn from_slice<T: bytemuck::Pod>(
        gpu: &GpuContext,
        kind: BufferKind,
        name: impl Into<String>,
        values: &[T],
    ) -> Result<Self> {
        let count = u32::try_from(values.len())
            .map_err(|_| GpuError::InvalidDescription("too many elements".to_string()))?;
        Self::new(
            gpu,
            kind,
            BufferProperties::with_data(name, bytemuck::cast_slice(values), count),
        )
    }

    /// Write `bytes` at `offset`.
    ///
    /// Host-visible buffers are written through their mapping. Device-local
    /// buffers receive a staged partial copy that has completed on return.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn set_data(&mut self, gpu: &GpuContext, bytes: &[u8], offset: u64) -> Result<()> {
        let end = offset.checked_add(bytes.len() as u64);
        if end.map_or(true, |end| end > self.size()) {
            return Err(GpuError::InvalidState(format!(
                "write of {} bytes at offset {offset} exceeds '{}' ({} bytes)",
                bytes.len(),
                self.properties.name,
                self.size()
            )));
        }
        if bytes.is_empty() {
            return Ok(());
        }

        match self.placement {
            Placement::HostVisible => {
                let mut mapped = self.inner.map()?;
                write_bytes_at(&mut mapped, offset, bytes)
            }
            Placement::DeviceLocal => self.upload_staged(gpu, bytes, offset),
        }
    }

    fn upload_staged(&self, gpu: &GpuContext, bytes: &[u8], offset: u64) -> Result<()> {
        let staging_name = format!("{} (staging)", self.properties.name);
        let create_info = vk::BufferCreateInfo::default()
            .size(bytes.len() as u64)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let mut staging = gpu
            .allocator()
            .lock()
            .allocate_buffer(&create_info, &AllocationDesc::staging(&staging_name))?;

        let result = staging.write_bytes(0, bytes).and_then(|()| {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: offset,
                size: bytes.len() as u64,
            };
            let (src, dst) = (staging.buffer, self.inner.buffer);
            gpu.execute_immediate(|cmd| unsafe {
                let device = gpu.device();
                device.cmd_copy_buffer(cmd, src, dst, &[region]);
                let to_readers = vk::MemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(vk::AccessFlags::MEMORY_READ);
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::DependencyFlags::empty(),
                    &[to_readers],
                    &[],
                    &[],
                );
            })
        });

        gpu.allocator().lock().free_buffer(&mut staging)?;
        result
    }

    /// Copy the buffer's contents back to the host.
    pub fn read_back(&mut self, gpu: &GpuContext) -> Result<Vec<u8>> {
        if self.placement == Placement::HostVisible {
            return Ok(self.inner.map()?.to_vec());
        }

        let download_name = format!("{} (readback)", self.properties.name);
        let create_info = vk::BufferCreateInfo::default()
            .size(self.size())
            .usage(vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let mut download = gpu
            .allocator()
            .lock()
            .allocate_buffer(&create_info, &AllocationDesc::readback(&download_name))?;

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: self.size(),
        };
        let (src, dst) = (self.inner.buffer, download.buffer);
        let result = gpu
            .execute_immediate(|cmd| unsafe {
                let device = gpu.device();
                device.cmd_copy_buffer(cmd, src, dst, &[region]);
                let to_host = vk::MemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(vk::AccessFlags::HOST_READ);
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::HOST,
                    vk::DependencyFlags::empty(),
                    &[to_host],
                    &[],
                    &[],
                );
            })
            .and_then(|()| Ok(download.map()?.to_vec()));

        gpu.allocator().lock().free_buffer(&mut download)?;
        result
    }

    /// Rebuild the handle and memory from the stored properties.
    ///
    /// Contents are not preserved.
    pub fn recreate(&mut self, gpu: &GpuContext) -> Result<()> {
        gpu.allocator().lock().free_buffer(&mut self.inner)?;
        self.inner = allocate(gpu, self.kind, self.placement, &self.properties)?;
        tracing::debug!(name = %self.properties.name, "buffer recreated");
        Ok(())
    }

    /// Release the buffer. Further calls do nothing.
    pub fn destroy(&mut self, gpu: &GpuContext) {
        if let Err(e) = gpu.allocator().lock().free_buffer(&mut self.inner) {
            tracing::error!(name = %self.properties.name, "failed to free buffer: {e}");
        }
    }

    /// Size in bytes.
    pub const fn size(&self) -> u64 {
        self.properties.size
    }

    /// Number of elements.
    pub const fn count(&self) -> u32 {
        self.properties.count
    }

    /// Buffer kind.
    pub const fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Memory placement.
    pub const fn placement(&self) -> Placement {
        self.placement
    }

    /// Debug name.
    pub fn name(&self) -> &str {
        &self.properties.name
    }

    /// Native handle. Null after [`Self::destroy`].
    pub const fn handle(&self) -> vk::Buffer {
        self.inner.buffer
    }

    /// Descriptor covering the whole buffer.
    pub const fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.inner.buffer,
            offset: 0,
            range: self.properties.size,
        }
    }
}

fn allocate(
    gpu: &GpuContext,
    kind: BufferKind,
    placement: Placement,
    properties: &BufferProperties<'_>,
) -> Result<GpuBuffer> {
    let create_info = vk::BufferCreateInfo::default()
        .size(properties.size)
        .usage(kind.usage())
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let desc = allocation_desc(&properties.name, placement, properties.always_mapped);
    gpu.allocator().lock().allocate_buffer(&create_info, &desc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::resolve_location;
    use gpu_allocator::MemoryLocation;

    #[test]
    fn clamp_keeps_small_buffers() {
        assert_eq!(clamp_to_range(1024, 4, 65_536).unwrap(), (1024, 4));
        assert_eq!(clamp_to_range(65_536, 1, 65_536).unwrap(), (65_536, 1));
    }

    #[test]
    fn clamp_scales_size_and_count_together() {
        let (size, count) = clamp_to_range(100_000, 1_000, 65_536).unwrap();
        assert_eq!((size, count), (65_500, 655));
        assert_eq!(size / u64::from(count), 100);
        assert!(size <= 65_536);
    }

    #[test]
    fn clamp_rejects_oversized_element() {
        assert!(matches!(
            clamp_to_range(131_072, 1, 65_536),
            Err(GpuError::InvalidDescription(_))
        ));
        // Zero count behaves like a single element.
        assert!(clamp_to_range(131_072, 0, 65_536).is_err());
    }

    #[test]
    fn placement_follows_data_and_host_flag() {
        let data = [0u8; 16];
        assert_eq!(
            BufferProperties::with_data("v", &data, 1).placement(),
            Placement::DeviceLocal
        );
        assert_eq!(
            BufferProperties::with_data("v", &data, 1)
                .host_visible(true)
                .placement(),
            Placement::HostVisible
        );
        assert_eq!(
            BufferProperties::sized("u", 64, 1).placement(),
            Placement::HostVisible
        );
    }

    #[test]
    fn placements_resolve_to_expected_memory() {
        let device = allocation_desc("v", Placement::DeviceLocal, false);
        assert_eq!(
            resolve_location(device.usage, device.flags),
            MemoryLocation::GpuOnly
        );
        for mapped in [false, true] {
            let host = allocation_desc("u", Placement::HostVisible, mapped);
            assert_eq!(
                resolve_location(host.usage, host.flags),
                MemoryLocation::CpuToGpu
            );
        }
    }

    #[test]
    fn normalization_fills_defaults_and_rejects_bad_sizes() {
        let data = [1u8; 32];
        let props = BufferProperties {
            name: "v".into(),
            data: Some(&data),
            ..Default::default()
        }
        .normalized()
        .unwrap();
        assert_eq!((props.size, props.count), (32, 1));

        assert!(BufferProperties::sized("empty", 0, 1).normalized().is_err());

        let too_much = BufferProperties {
            size: 16,
            ..BufferProperties::with_data("v", &data, 1)
        };
        assert!(matches!(
            too_much.normalized(),
            Err(GpuError::InvalidDescription(_))
        ));
    }

    #[test]
    fn detached_properties_drop_data() {
        let data = [7u8; 8];
        let props = BufferProperties::with_data("v", &data, 2).always_mapped(true);
        let stored = props.detached();
        assert!(stored.data.is_none());
        assert_eq!(stored.size, 8);
        assert_eq!(stored.count, 2);
        assert!(stored.always_mapped);
    }

    #[test]
    fn kinds_are_copyable() {
        for kind in [
            BufferKind::Vertex,
            BufferKind::Index,
            BufferKind::Uniform,
            BufferKind::Storage,
        ] {
            assert!(kind.usage().contains(vk::BufferUsageFlags::TRANSFER_DST));
        }
        assert!(BufferKind::Index
            .usage()
            .contains(vk::BufferUsageFlags::INDEX_BUFFER));
    }
}
