//! Named pipeline registry with native pipeline caches persisted to disk.

use crate::error::{GpuError, Result};
use crate::pipeline::{GraphicsPipeline, PipelineProperties};
use ash::vk;
use hashbrown::HashMap;
use kiln_core::Handle;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::{Path, PathBuf};

/// Stable hash of everything that changes the compiled pipeline.
///
/// Extent is excluded: viewport and scissor are dynamic.
pub fn properties_hash(props: &PipelineProperties) -> u64 {
    let mut hasher = DefaultHasher::new();
    props.name.hash(&mut hasher);
    props.vertex_shader.hash(&mut hasher);
    props.fragment_shader.hash(&mut hasher);
    for binding in &props.vertex_bindings {
        (binding.binding, binding.stride, binding.input_rate.as_raw()).hash(&mut hasher);
    }
    for attribute in &props.vertex_attributes {
        (attribute.location, attribute.format.as_raw(), attribute.offset).hash(&mut hasher);
    }
    (
        props.topology.as_raw(),
        props.polygon_mode.as_raw(),
        props.cull_mode.as_raw(),
        props.front_face.as_raw(),
        props.depth_test,
        props.depth_write,
        props.depth_compare.as_raw(),
        props.blend,
    )
        .hash(&mut hasher);
    hasher.finish()
}

/// File a cache for `key` with properties hash `hash` is stored in.
pub fn cache_file(dir: &Path, key: &str, hash: u64) -> PathBuf {
    dir.join(format!("{key}-{hash:016x}.bin"))
}

struct CacheEntry {
    pipeline: Option<Handle<GraphicsPipeline>>,
    native: vk::PipelineCache,
    hash: u64,
}

/// Registry of pipelines by key.
#[derive(Default)]
pub struct PipelineCache {
    directory: Option<PathBuf>,
    entries: HashMap<String, CacheEntry>,
}

impl PipelineCache {
    /// Cache kept in memory only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache seeded from and saved to `dir`.
    pub fn with_directory(dir: impl Into<PathBuf>) -> Self {
        Self {
            directory: Some(dir.into()),
            entries: HashMap::new(),
        }
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    /// Native cache for `key`, created on first use.
    ///
    /// When a directory is configured, a previously saved blob for the same
    /// properties hash seeds the new cache.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn native(
        &mut self,
        device: &ash::Device,
        key: &str,
        props: &PipelineProperties,
    ) -> Result<vk::PipelineCache> {
        let hash = properties_hash(props);
        if let Some(entry) = self.entries.get(key) {
            if entry.hash == hash && entry.native != vk::PipelineCache::null() {
                return Ok(entry.native);
            }
        }

        let initial = self
            .directory
            .as_deref()
            .map(|dir| cache_file(dir, key, hash))
            .and_then(|path| match std::fs::read(&path) {
                Ok(bytes) => {
                    tracing::debug!(
                        path = %path.display(),
                        bytes = bytes.len(),
                        "pipeline cache loaded"
                    );
                    Some(bytes)
                }
                Err(_) => None,
            })
            .unwrap_or_default();

        let info = vk::PipelineCacheCreateInfo::default().initial_data(&initial);
        let native = match device.create_pipeline_cache(&info, None) {
            Ok(cache) => cache,
            // Drivers may reject stale blobs; start empty instead.
            Err(e) if !initial.is_empty() => {
                tracing::warn!(key, "discarding pipeline cache blob: {e}");
                device.create_pipeline_cache(&vk::PipelineCacheCreateInfo::default(), None)?
            }
            Err(e) => return Err(e.into()),
        };

        let previous = self.entries.insert(
            key.to_owned(),
            CacheEntry {
                pipeline: None,
                native,
                hash,
            },
        );
        if let Some(old) = previous {
            if old.native != vk::PipelineCache::null() {
                device.destroy_pipeline_cache(old.native, None);
            }
            self.entries
                .entry(key.to_owned())
                .and_modify(|entry| entry.pipeline = old.pipeline);
        }
        Ok(native)
    }

    /// Record the pipeline built for `key`.
    pub fn register(&mut self, key: &str, pipeline: Handle<GraphicsPipeline>) {
        self.entries
            .entry(key.to_owned())
            .or_insert_with(|| CacheEntry {
                pipeline: None,
                native: vk::PipelineCache::null(),
                hash: 0,
            })
            .pipeline = Some(pipeline);
    }

    /// Pipeline registered under `key`.
    pub fn get(&self, key: &str) -> Result<Handle<GraphicsPipeline>> {
        self.entries
            .get(key)
            .and_then(|entry| entry.pipeline)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("pipeline '{key}'")))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.get(key).is_some_and(|entry| entry.pipeline.is_some())
    }

    /// Registered keys paired with their pipelines.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Handle<GraphicsPipeline>)> {
        self.entries
            .iter()
            .filter_map(|(key, entry)| entry.pipeline.map(|handle| (key.as_str(), handle)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write every native cache to the configured directory.
    ///
    /// I/O failures are logged and skipped.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn save(&self, device: &ash::Device) -> Result<()> {
        let Some(dir) = self.directory.as_deref() else {
            return Ok(());
        };
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::warn!(dir = %dir.display(), "cannot create pipeline cache directory: {e}");
            return Ok(());
        }
        for (key, entry) in &self.entries {
            if entry.native == vk::PipelineCache::null() {
                continue;
            }
            let data = device.get_pipeline_cache_data(entry.native)?;
            let path = cache_file(dir, key, entry.hash);
            match std::fs::write(&path, &data) {
                Ok(()) => tracing::debug!(
                    path = %path.display(),
                    bytes = data.len(),
                    "pipeline cache saved"
                ),
                Err(e) => tracing::warn!(path = %path.display(), "pipeline cache not saved: {e}"),
            }
        }
        Ok(())
    }

    /// Save, then destroy every native cache and forget all keys.
    ///
    /// # Safety
    /// No pipeline build may be in progress.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        if let Err(e) = self.save(device) {
            tracing::warn!("pipeline caches not saved: {e}");
        }
        for (_, entry) in self.entries.drain() {
            if entry.native != vk::PipelineCache::null() {
                device.destroy_pipeline_cache(entry.native, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::Arena;

    fn props(name: &str) -> PipelineProperties {
        PipelineProperties::new(name, vec![0x0723_0203, 1], vec![0x0723_0203, 2])
    }

    #[test]
    fn hash_ignores_extent() {
        let a = props("quad");
        let b = props("quad").with_extent(kiln_core::Extent::new(1920, 1080));
        assert_eq!(properties_hash(&a), properties_hash(&b));

        let c = props("quad").with_topology(vk::PrimitiveTopology::LINE_LIST);
        assert_ne!(properties_hash(&a), properties_hash(&c));
    }

    #[test]
    fn cache_files_are_keyed_by_name_and_hash() {
        let path = cache_file(Path::new("cache"), "line", 0xabc);
        assert_eq!(path, Path::new("cache").join("line-0000000000000abc.bin"));
    }

    #[test]
    fn registry_lookup() {
        let mut arena: Arena<GraphicsPipeline> = Arena::new();
        let handle = arena.insert(GraphicsPipeline::unbuilt(props("quad")));
        let mut cache = PipelineCache::new();
        assert!(cache.is_empty());
        assert!(matches!(cache.get("quad"), Err(GpuError::ResourceNotFound(_))));

        cache.register("quad", handle);
        assert!(cache.contains("quad"));
        assert_eq!(cache.get("quad").ok(), Some(handle));
        assert_eq!(cache.len(), 1);
        assert!(!cache.contains("line"));
    }
}
