//! Per-slot GPU timing and pipeline statistics queries.

use crate::error::Result;
use ash::vk;

/// Counters collected by one pipeline statistics query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStatistics {
    pub input_assembly_vertices: u64,
    pub input_assembly_primitives: u64,
    pub vertex_shader_invocations: u64,
    pub clipping_invocations: u64,
    pub clipping_primitives: u64,
    pub fragment_shader_invocations: u64,
    pub compute_shader_invocations: u64,
}

impl PipelineStatistics {
    /// Counters requested from the query pool, in result order.
    pub const FLAGS: vk::QueryPipelineStatisticFlags = vk::QueryPipelineStatisticFlags::from_raw(
        vk::QueryPipelineStatisticFlags::INPUT_ASSEMBLY_VERTICES.as_raw()
            | vk::QueryPipelineStatisticFlags::INPUT_ASSEMBLY_PRIMITIVES.as_raw()
            | vk::QueryPipelineStatisticFlags::VERTEX_SHADER_INVOCATIONS.as_raw()
            | vk::QueryPipelineStatisticFlags::CLIPPING_INVOCATIONS.as_raw()
            | vk::QueryPipelineStatisticFlags::CLIPPING_PRIMITIVES.as_raw()
            | vk::QueryPipelineStatisticFlags::FRAGMENT_SHADER_INVOCATIONS.as_raw()
            | vk::QueryPipelineStatisticFlags::COMPUTE_SHADER_INVOCATIONS.as_raw(),
    );

    /// Build from raw query results. Vulkan orders them by flag bit.
    pub const fn from_counters(counters: [u64; 7]) -> Self {
        Self {
            input_assembly_vertices: counters[0],
            input_assembly_primitives: counters[1],
            vertex_shader_invocations: counters[2],
            clipping_invocations: counters[3],
            clipping_primitives: counters[4],
            fragment_shader_invocations: counters[5],
            compute_shader_invocations: counters[6],
        }
    }
}

/// GPU-side measurements for one completed frame slot.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameStatistics {
    /// Time between the first and last command of the slot, in milliseconds.
    pub gpu_time_ms: f64,
    /// Present when the device supports pipeline statistics.
    pub pipeline: Option<PipelineStatistics>,
}

/// Convert a timestamp pair to milliseconds.
pub fn elapsed_ms(start: u64, end: u64, timestamp_period_ns: f32) -> f64 {
    end.wrapping_sub(start) as f64 * f64::from(timestamp_period_ns) / 1_000_000.0
}

/// Query pools sized for a set of frame slots.
pub struct FrameQueries {
    timestamps: vk::QueryPool,
    statistics: Option<vk::QueryPool>,
    slots: u32,
    timestamp_period: f32,
}

impl FrameQueries {
    /// Create pools for `slots` frame slots.
    ///
    /// # Safety
    /// The device must be valid and, when `with_statistics` is set, have the
    /// pipeline statistics feature enabled.
    pub unsafe fn new(
        device: &ash::Device,
        slots: u32,
        timestamp_period: f32,
        with_statistics: bool,
    ) -> Result<Self> {
        let timestamp_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(slots * 2);
        let timestamps = device.create_query_pool(&timestamp_info, None)?;

        let statistics = if with_statistics {
            let info = vk::QueryPoolCreateInfo::default()
                .query_type(vk::QueryType::PIPELINE_STATISTICS)
                .query_count(slots)
                .pipeline_statistics(PipelineStatistics::FLAGS);
            match device.create_query_pool(&info, None) {
                Ok(pool) => Some(pool),
                Err(e) => {
                    device.destroy_query_pool(timestamps, None);
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        Ok(Self {
            timestamps,
            statistics,
            slots,
            timestamp_period,
        })
    }

    /// Reset the slot's queries and open its measurements.
    ///
    /// # Safety
    /// `cmd` must be recording outside a render pass.
    pub unsafe fn begin(&self, device: &ash::Device, cmd: vk::CommandBuffer, slot: u32) {
        device.cmd_reset_query_pool(cmd, self.timestamps, slot * 2, 2);
        if let Some(pool) = self.statistics {
            device.cmd_reset_query_pool(cmd, pool, slot, 1);
            device.cmd_begin_query(cmd, pool, slot, vk::QueryControlFlags::empty());
        }
        device.cmd_write_timestamp(
            cmd,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            self.timestamps,
            slot * 2,
        );
    }

    /// Close the slot's measurements.
    ///
    /// # Safety
    /// `cmd` must be recording outside a render pass, after [`Self::begin`].
    pub unsafe fn end(&self, device: &ash::Device, cmd: vk::CommandBuffer, slot: u32) {
        if let Some(pool) = self.statistics {
            device.cmd_end_query(cmd, pool, slot);
        }
        device.cmd_write_timestamp(
            cmd,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            self.timestamps,
            slot * 2 + 1,
        );
    }

    /// Read a slot's results. Call only after the slot's fence has signaled.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn read(&self, device: &ash::Device, slot: u32) -> Result<FrameStatistics> {
        let mut stamps = [0u64; 2];
        device.get_query_pool_results(
            self.timestamps,
            slot * 2,
            &mut stamps,
            vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
        )?;

        let pipeline = match self.statistics {
            Some(pool) => {
                let mut counters = [[0u64; 7]; 1];
                device.get_query_pool_results(
                    pool,
                    slot,
                    &mut counters,
                    vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
                )?;
                Some(PipelineStatistics::from_counters(counters[0]))
            }
            None => None,
        };

        Ok(FrameStatistics {
            gpu_time_ms: elapsed_ms(stamps[0], stamps[1], self.timestamp_period),
            pipeline,
        })
    }

    /// Number of slots covered.
    pub const fn slots(&self) -> u32 {
        self.slots
    }

    /// Destroy the pools.
    ///
    /// # Safety
    /// No submitted work may reference the pools.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        if self.timestamps != vk::QueryPool::null() {
            device.destroy_query_pool(self.timestamps, None);
            self.timestamps = vk::QueryPool::null();
        }
        if let Some(pool) = self.statistics.take() {
            device.destroy_query_pool(pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn timestamps_convert_to_milliseconds() {
        assert_relative_eq!(elapsed_ms(1_000, 2_001_000, 1.0), 2.0);
        assert_relative_eq!(elapsed_ms(0, 1_000_000, 0.5), 0.5);
    }

    #[test]
    fn counters_follow_flag_order() {
        let stats = PipelineStatistics::from_counters([6, 2, 6, 2, 2, 1200, 0]);
        assert_eq!(stats.input_assembly_vertices, 6);
        assert_eq!(stats.fragment_shader_invocations, 1200);
        assert_eq!(stats.compute_shader_invocations, 0);
        assert_eq!(PipelineStatistics::FLAGS.as_raw().count_ones(), 7);
    }
}
