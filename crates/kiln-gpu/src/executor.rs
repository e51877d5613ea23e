//! Per-frame command execution.
//!
//! A [`CommandExecutor`] rotates through a small ring of frame slots. Each slot
//! owns one command buffer and one fence; a slot is only re-recorded once the
//! fence from its previous submission has signaled. The slot bookkeeping lives
//! in [`FrameSlots`], which has no device dependency.

use crate::command::{begin_command_buffer, end_command_buffer, CommandPool};
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::query::{FrameQueries, FrameStatistics};
use crate::sync::{reset_fence, wait_for_all, wait_for_fence, SlotSync};
use ash::vk;
use kiln_core::constants::MAX_FRAMES_IN_FLIGHT;
use std::sync::Arc;

/// Recording state of an executor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutorState {
    /// Nothing recorded yet, or slots were just rebuilt.
    Idle,
    /// The current slot's command buffer is open.
    Recording,
    /// The last slot was submitted; the next `begin` moves on.
    Submitted,
}

/// Result of starting a frame on a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotAcquire {
    /// Slot now recording.
    pub index: usize,
    /// The slot has an outstanding submission whose fence must be waited on.
    pub wait_for_fence: bool,
}

/// Slot rotation and begin/submit alternation.
#[derive(Clone, Debug)]
pub struct FrameSlots {
    current: usize,
    state: ExecutorState,
    armed: Vec<bool>,
    submissions: u64,
}

impl FrameSlots {
    /// Create `count` slots, clamped to `1..=MAX_FRAMES_IN_FLIGHT`.
    pub fn new(count: usize) -> Self {
        Self {
            current: 0,
            state: ExecutorState::Idle,
            armed: vec![false; count.clamp(1, MAX_FRAMES_IN_FLIGHT)],
            submissions: 0,
        }
    }

    /// Start recording on the current slot.
    pub fn begin(&mut self) -> Result<SlotAcquire> {
        if self.state == ExecutorState::Recording {
            return Err(GpuError::InvalidState(format!(
                "begin() called while slot {} is recording",
                self.current
            )));
        }
        let wait_for_fence = std::mem::take(&mut self.armed[self.current]);
        self.state = ExecutorState::Recording;
        Ok(SlotAcquire {
            index: self.current,
            wait_for_fence,
        })
    }

    /// Mark the current slot submitted and advance. Returns the submitted slot.
    pub fn submit(&mut self) -> Result<usize> {
        if self.state != ExecutorState::Recording {
            return Err(GpuError::InvalidState(format!(
                "submit called in state {:?}",
                self.state
            )));
        }
        let submitted = self.current;
        self.armed[submitted] = true;
        self.current = (self.current + 1) % self.armed.len();
        self.state = ExecutorState::Submitted;
        self.submissions += 1;
        Ok(submitted)
    }

    /// Drop the current recording without submitting. The slot stays current.
    pub fn cancel(&mut self) -> Result<()> {
        if self.state != ExecutorState::Recording {
            return Err(GpuError::InvalidState(format!(
                "cancel called in state {:?}",
                self.state
            )));
        }
        self.state = ExecutorState::Idle;
        Ok(())
    }

    /// Undo a [`begin`](Self::begin) whose recording never opened.
    ///
    /// The slot returns to idle and keeps the outstanding submission it had
    /// before, so the next begin waits on its fence again.
    pub fn rollback(&mut self, acquire: SlotAcquire) -> Result<()> {
        if self.state != ExecutorState::Recording || acquire.index != self.current {
            return Err(GpuError::InvalidState(format!(
                "rollback of slot {} in state {:?}",
                acquire.index, self.state
            )));
        }
        self.armed[acquire.index] |= acquire.wait_for_fence;
        self.state = ExecutorState::Idle;
        Ok(())
    }

    /// Resize the ring after every outstanding fence has been waited on.
    pub fn force_recreation(&mut self, count: usize) -> Result<()> {
        if self.state == ExecutorState::Recording {
            return Err(GpuError::InvalidState(
                "cannot rebuild frame slots while recording".to_string(),
            ));
        }
        let count = count.clamp(1, MAX_FRAMES_IN_FLIGHT);
        self.armed = vec![false; count];
        self.current %= count;
        self.state = ExecutorState::Idle;
        Ok(())
    }

    /// Slots with a submission whose fence has not been observed.
    pub fn in_flight(&self) -> impl Iterator<Item = usize> + '_ {
        self.armed
            .iter()
            .enumerate()
            .filter_map(|(index, &armed)| armed.then_some(index))
    }

    /// Forget all outstanding submissions (after a device-wide wait).
    pub fn mark_all_complete(&mut self) {
        self.armed.fill(false);
    }

    /// Current slot index.
    pub const fn current(&self) -> usize {
        self.current
    }

    /// Recording state.
    pub const fn state(&self) -> ExecutorState {
        self.state
    }

    /// Number of slots.
    pub fn count(&self) -> usize {
        self.armed.len()
    }

    /// Total submissions since creation.
    pub const fn submissions(&self) -> u64 {
        self.submissions
    }
}

/// Executor configuration.
#[derive(Clone, Copy, Debug)]
pub struct CommandExecutorProperties {
    /// Slot count. `None` follows the swapchain image count.
    pub count: Option<usize>,
    /// Allocate primary command buffers (secondary otherwise).
    pub is_primary: bool,
    /// Create per-slot acquire/present semaphores.
    pub owned_by_swapchain: bool,
    /// Record GPU timing and pipeline statistics per slot.
    pub record_stats: bool,
}

impl Default for CommandExecutorProperties {
    fn default() -> Self {
        Self {
            count: None,
            is_primary: true,
            owned_by_swapchain: true,
            record_stats: false,
        }
    }
}

impl CommandExecutorProperties {
    /// Slot count for a swapchain with `image_count` images.
    pub fn slot_count(&self, image_count: usize) -> usize {
        self.count
            .unwrap_or(image_count)
            .clamp(1, MAX_FRAMES_IN_FLIGHT)
    }
}

/// Semaphores attached to one submission.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubmitSync<'a> {
    pub wait: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal: &'a [vk::Semaphore],
}

/// Multi-buffered command recording and submission.
pub struct CommandExecutor {
    device: Arc<ash::Device>,
    queue: vk::Queue,
    pool: CommandPool,
    properties: CommandExecutorProperties,
    slots: FrameSlots,
    command_buffers: Vec<vk::CommandBuffer>,
    sync: Vec<SlotSync>,
    queries: Option<FrameQueries>,
    stats_supported: (bool, bool),
    timestamp_period: f32,
    last_stats: Option<FrameStatistics>,
}

impl CommandExecutor {
    /// Create an executor for a swapchain with `image_count` images.
    pub fn new(
        gpu: &GpuContext,
        image_count: usize,
        properties: CommandExecutorProperties,
    ) -> Result<Self> {
        let device = gpu.device_arc();
        let pool = unsafe {
            CommandPool::new(
                &device,
                gpu.graphics_queue_family(),
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )
        }?;
        let caps = gpu.capabilities();

        let mut executor = Self {
            device,
            queue: gpu.graphics_queue(),
            pool,
            properties,
            slots: FrameSlots::new(properties.slot_count(image_count)),
            command_buffers: Vec::new(),
            sync: Vec::new(),
            queries: None,
            stats_supported: (caps.supports_timestamps, caps.supports_pipeline_statistics),
            timestamp_period: caps.timestamp_period,
            last_stats: None,
        };
        if let Err(e) = executor.build_slots() {
            executor.destroy();
            return Err(e);
        }

        tracing::debug!(
            slots = executor.slots.count(),
            record_stats = properties.record_stats,
            "command executor created"
        );
        Ok(executor)
    }

    fn build_slots(&mut self) -> Result<()> {
        let count = self.slots.count();
        let level = if self.properties.is_primary {
            vk::CommandBufferLevel::PRIMARY
        } else {
            vk::CommandBufferLevel::SECONDARY
        };
        let slot_count = u32::try_from(count).unwrap_or(1);

        unsafe {
            self.command_buffers =
                self.pool
                    .allocate_command_buffers(&self.device, level, slot_count)?;
            for _ in 0..count {
                self.sync
                    .push(SlotSync::new(&self.device, self.properties.owned_by_swapchain)?);
            }
            let (timestamps, statistics) = self.stats_supported;
            if self.properties.record_stats && self.properties.is_primary && timestamps {
                self.queries = Some(FrameQueries::new(
                    &self.device,
                    slot_count,
                    self.timestamp_period,
                    statistics,
                )?);
            }
        }
        Ok(())
    }

    fn release_slots(&mut self) {
        unsafe {
            self.pool
                .free_command_buffers(&self.device, &self.command_buffers);
            for sync in &mut self.sync {
                sync.destroy(&self.device);
            }
            if let Some(mut queries) = self.queries.take() {
                queries.destroy(&self.device);
            }
        }
        self.command_buffers.clear();
        self.sync.clear();
    }

    fn all_fences(&self) -> Vec<vk::Fence> {
        self.sync
            .iter()
            .map(|s| s.fence)
            .filter(|&f| f != vk::Fence::null())
            .collect()
    }

    /// Open the current slot's command buffer.
    ///
    /// Blocks until the slot's previous submission has finished.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn begin(&mut self) -> Result<vk::CommandBuffer> {
        let acquire = self.slots.begin()?;
        match self.open_slot(acquire) {
            Ok(cmd) => Ok(cmd),
            Err(e) => {
                tracing::warn!(slot = acquire.index, "frame begin failed: {e}");
                self.slots.rollback(acquire)?;
                Err(e)
            }
        }
    }

    fn open_slot(&mut self, acquire: SlotAcquire) -> Result<vk::CommandBuffer> {
        let slot = acquire.index;
        let cmd = self.command_buffers[slot];
        let fence = self.sync[slot].fence;

        unsafe {
            wait_for_fence(&self.device, fence, u64::MAX)?;

            if acquire.wait_for_fence {
                if let Some(queries) = &self.queries {
                    match queries.read(&self.device, slot as u32) {
                        Ok(stats) => self.last_stats = Some(stats),
                        Err(e) => tracing::warn!(slot, "frame statistics unavailable: {e}"),
                    }
                }
            }

            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            begin_command_buffer(
                &self.device,
                cmd,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            )?;

            if let Some(queries) = &self.queries {
                queries.begin(&self.device, cmd, slot as u32);
            }
        }

        Ok(cmd)
    }

    /// Close and submit the current slot, then advance.
    ///
    /// Swapchain-owned executors wait on the slot's acquire semaphore and
    /// signal its render-complete semaphore.
    pub fn submit_and_end(&mut self) -> Result<()> {
        if self.properties.owned_by_swapchain {
            let slot = &self.sync[self.slots.current()];
            let wait = [slot.image_acquired];
            let signal = [slot.render_complete];
            let stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
            self.submit_and_end_with(SubmitSync {
                wait: &wait,
                wait_stages: &stages,
                signal: &signal,
            })
        } else {
            self.submit_and_end_with(SubmitSync::default())
        }
    }

    /// Close and submit the current slot with explicit semaphores, then advance.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn submit_and_end_with(&mut self, sync: SubmitSync<'_>) -> Result<()> {
        if self.slots.state() != ExecutorState::Recording {
            return Err(GpuError::InvalidState(
                "submit_and_end() without begin()".to_string(),
            ));
        }
        let slot = self.slots.current();
        let cmd = self.command_buffers[slot];
        let fence = self.sync[slot].fence;

        unsafe {
            if let Some(queries) = &self.queries {
                queries.end(&self.device, cmd, slot as u32);
            }
            end_command_buffer(&self.device, cmd)?;
            reset_fence(&self.device, fence)?;

            let command_buffers = [cmd];
            let submit_info = vk::SubmitInfo::default()
                .command_buffers(&command_buffers)
                .wait_semaphores(sync.wait)
                .wait_dst_stage_mask(sync.wait_stages)
                .signal_semaphores(sync.signal);
            self.device
                .queue_submit(self.queue, &[submit_info], fence)
                .map_err(|e| {
                    tracing::error!(slot, "frame submission failed: {e}");
                    GpuError::from(e)
                })?;
        }

        self.slots.submit()?;
        Ok(())
    }

    /// Close the current recording without submitting it.
    ///
    /// Used when the frame cannot be presented (e.g. the swapchain went out of
    /// date after `begin`). The slot's fence stays signaled.
    pub fn abandon(&mut self) -> Result<()> {
        let cmd = self.current_buffer()?;
        let slot = self.slots.current();
        unsafe {
            if let Some(queries) = &self.queries {
                queries.end(&self.device, cmd, slot as u32);
            }
            end_command_buffer(&self.device, cmd)?;
        }
        self.slots.cancel()
    }

    /// Rebuild command buffers and fences for a new slot count.
    ///
    /// Waits for every outstanding submission first.
    pub fn force_recreation(&mut self, image_count: usize) -> Result<()> {
        unsafe { wait_for_all(&self.device, &self.all_fences()) }?;
        let count = self.properties.slot_count(image_count);
        self.slots.force_recreation(count)?;
        self.release_slots();
        self.last_stats = None;
        self.build_slots()?;
        tracing::debug!(slots = count, "command executor recreated");
        Ok(())
    }

    /// Command buffer of the slot being recorded.
    pub fn current_buffer(&self) -> Result<vk::CommandBuffer> {
        if self.slots.state() != ExecutorState::Recording {
            return Err(GpuError::InvalidState("executor is not recording".into()));
        }
        Ok(self.command_buffers[self.slots.current()])
    }

    /// Acquire semaphore of the current slot (null for non-swapchain executors).
    pub fn image_acquired(&self) -> vk::Semaphore {
        self.sync[self.slots.current()].image_acquired
    }

    /// Render-complete semaphore of the most recently submitted slot.
    pub fn render_complete(&self) -> vk::Semaphore {
        let count = self.slots.count();
        let last = (self.slots.current() + count - 1) % count;
        self.sync[last].render_complete
    }

    /// Index of the current slot.
    pub const fn current_slot(&self) -> usize {
        self.slots.current()
    }

    /// Number of slots.
    pub fn slot_count(&self) -> usize {
        self.slots.count()
    }

    /// Recording state.
    pub const fn state(&self) -> ExecutorState {
        self.slots.state()
    }

    /// Properties the executor was built with.
    pub const fn properties(&self) -> &CommandExecutorProperties {
        &self.properties
    }

    /// Statistics of the most recently completed slot, when recorded.
    pub const fn frame_statistics(&self) -> Option<FrameStatistics> {
        self.last_stats
    }

    /// Wait for all slots, then release every resource. Further calls do nothing.
    pub fn destroy(&mut self) {
        if let Err(e) = unsafe { wait_for_all(&self.device, &self.all_fences()) } {
            tracing::error!("waiting for frame slots failed: {e}");
        }
        self.slots.mark_all_complete();
        self.release_slots();
        unsafe { self.pool.destroy(&self.device) };
    }
}

/// Record and run a one-shot command buffer, blocking until it finishes.
pub fn execute_immediate<F>(gpu: &GpuContext, f: F) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer),
{
    gpu.execute_immediate(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_and_submit_alternate() {
        let mut slots = FrameSlots::new(3);
        assert_eq!(slots.state(), ExecutorState::Idle);
        assert!(slots.submit().is_err());

        let first = slots.begin().unwrap();
        assert_eq!(first.index, 0);
        assert!(!first.wait_for_fence);
        assert!(matches!(slots.begin(), Err(GpuError::InvalidState(_))));

        assert_eq!(slots.submit().unwrap(), 0);
        assert!(slots.submit().is_err());
        assert_eq!(slots.state(), ExecutorState::Submitted);
        assert_eq!(slots.current(), 1);
    }

    #[test]
    fn slot_is_not_reused_before_its_fence() {
        let mut slots = FrameSlots::new(3);
        let mut seen = Vec::new();
        for _ in 0..7 {
            let acquire = slots.begin().unwrap();
            // Every in-flight submission other than this slot's own stays armed.
            assert!(slots.in_flight().all(|i| i != acquire.index));
            seen.push((acquire.index, acquire.wait_for_fence));
            slots.submit().unwrap();
        }
        assert_eq!(
            seen,
            vec![
                (0, false),
                (1, false),
                (2, false),
                (0, true),
                (1, true),
                (2, true),
                (0, true),
            ]
        );
        assert_eq!(slots.submissions(), 7);
    }

    #[test]
    fn failed_begin_rolls_back_to_idle() {
        let mut slots = FrameSlots::new(1);
        slots.begin().unwrap();
        slots.submit().unwrap();

        let acquire = slots.begin().unwrap();
        assert!(acquire.wait_for_fence);
        slots.rollback(acquire).unwrap();
        assert_eq!(slots.state(), ExecutorState::Idle);
        assert_eq!(slots.in_flight().collect::<Vec<_>>(), vec![0]);

        // The retry still waits on the outstanding fence.
        let retry = slots.begin().unwrap();
        assert_eq!(retry, acquire);
        slots.rollback(retry).unwrap();
        assert!(slots.rollback(retry).is_err());
        assert_eq!(slots.in_flight().count(), 1);
    }

    #[test]
    fn slot_count_is_capped() {
        assert_eq!(FrameSlots::new(8).count(), MAX_FRAMES_IN_FLIGHT);
        assert_eq!(FrameSlots::new(0).count(), 1);

        let props = CommandExecutorProperties::default();
        assert_eq!(props.slot_count(2), 2);
        assert_eq!(props.slot_count(5), MAX_FRAMES_IN_FLIGHT);

        let fixed = CommandExecutorProperties {
            count: Some(2),
            ..Default::default()
        };
        assert_eq!(fixed.slot_count(5), 2);
    }

    #[test]
    fn recreation_keeps_index_in_range() {
        let mut slots = FrameSlots::new(3);
        for _ in 0..2 {
            slots.begin().unwrap();
            slots.submit().unwrap();
        }
        assert_eq!(slots.current(), 2);

        slots.force_recreation(2).unwrap();
        assert_eq!(slots.count(), 2);
        assert_eq!(slots.current(), 0);
        assert_eq!(slots.state(), ExecutorState::Idle);
        assert_eq!(slots.in_flight().count(), 0);

        slots.begin().unwrap();
        assert!(slots.force_recreation(3).is_err());
    }

    #[test]
    fn cancelled_frame_reuses_slot() {
        let mut slots = FrameSlots::new(2);
        let acquire = slots.begin().unwrap();
        slots.cancel().unwrap();
        assert!(slots.cancel().is_err());

        let retry = slots.begin().unwrap();
        assert_eq!(retry.index, acquire.index);
        assert!(!retry.wait_for_fence);
        assert_eq!(slots.submissions(), 0);
    }
}
