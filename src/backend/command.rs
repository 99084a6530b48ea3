// Command pools and command buffers
//
// CommandBuffer wraps a vk::CommandBuffer together with its recording state
// and pending semaphore waits. CommandPool is an arena: freed slots keep
// their Vulkan handle and are reset and handed out again.

use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::{BackendError, BackendResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Ready,
    Recording,
    InRenderPass,
    RecordingEnded,
    Submitted,
    /// Slot returned to the pool's free list
    NotAllocated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferOp {
    Begin,
    BeginRenderPass,
    EndRenderPass,
    End,
    Submit,
    Reset,
    /// Commands valid inside or outside a render pass (binds, copies, push constants)
    Record,
    /// Commands valid only inside a render pass
    Draw,
}

impl CommandBufferState {
    /// Next state after `op`, or an error if the table has no such edge.
    pub fn apply(self, op: CommandBufferOp) -> BackendResult<Self> {
        use CommandBufferOp as Op;
        use CommandBufferState as S;

        let next = match (self, op) {
            (S::Ready, Op::Begin) => S::Recording,
            (S::Recording, Op::BeginRenderPass) => S::InRenderPass,
            (S::InRenderPass, Op::EndRenderPass) => S::Recording,
            (S::Recording, Op::End) => S::RecordingEnded,
            (S::RecordingEnded, Op::Submit) => S::Submitted,
            (S::Recording | S::InRenderPass, Op::Record) => self,
            (S::InRenderPass, Op::Draw) => self,
            (S::NotAllocated, Op::Reset) => {
                return Err(BackendError::InvalidCommandBufferState { op, state: self })
            }
            (_, Op::Reset) => S::Ready,
            _ => return Err(BackendError::InvalidCommandBufferState { op, state: self }),
        };
        Ok(next)
    }
}

/// Usage flags for `begin`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BeginFlags {
    pub single_use: bool,
    pub render_pass_continue: bool,
    pub simultaneous_use: bool,
}

impl BeginFlags {
    pub fn single_use() -> Self {
        Self {
            single_use: true,
            ..Default::default()
        }
    }

    pub fn to_vk(self) -> vk::CommandBufferUsageFlags {
        let mut flags = vk::CommandBufferUsageFlags::empty();
        if self.single_use {
            flags |= vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT;
        }
        if self.render_pass_continue {
            flags |= vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE;
        }
        if self.simultaneous_use {
            flags |= vk::CommandBufferUsageFlags::SIMULTANEOUS_USE;
        }
        flags
    }
}

pub struct CommandBuffer {
    handle: vk::CommandBuffer,
    primary: bool,
    state: CommandBufferState,
    pending_waits: Vec<(vk::PipelineStageFlags, vk::Semaphore)>,
    submitted_waits: Vec<(vk::PipelineStageFlags, vk::Semaphore)>,
}

impl CommandBuffer {
    pub(crate) fn from_raw(handle: vk::CommandBuffer, primary: bool) -> Self {
        Self {
            handle,
            primary,
            state: CommandBufferState::Ready,
            pending_waits: Vec::new(),
            submitted_waits: Vec::new(),
        }
    }

    /// Allocate one buffer directly from `pool`.
    pub fn allocate(device: &ash::Device, pool: vk::CommandPool, primary: bool) -> BackendResult<Self> {
        let level = if primary {
            vk::CommandBufferLevel::PRIMARY
        } else {
            vk::CommandBufferLevel::SECONDARY
        };
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(1);

        let buffers = unsafe { device.allocate_command_buffers(&alloc_info) }?;
        Ok(Self::from_raw(buffers[0], primary))
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    #[inline]
    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    #[inline]
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn pending_waits(&self) -> &[(vk::PipelineStageFlags, vk::Semaphore)] {
        &self.pending_waits
    }

    pub fn submitted_waits(&self) -> &[(vk::PipelineStageFlags, vk::Semaphore)] {
        &self.submitted_waits
    }

    fn transition(&mut self, op: CommandBufferOp) -> BackendResult<()> {
        self.state = self.state.apply(op)?;
        Ok(())
    }

    /// Handle for recording, validated against the current state.
    pub fn recording_handle(&self, op: CommandBufferOp) -> BackendResult<vk::CommandBuffer> {
        self.state.apply(op)?;
        Ok(self.handle)
    }

    pub fn begin(&mut self, device: &ash::Device, flags: BeginFlags) -> BackendResult<()> {
        self.state.apply(CommandBufferOp::Begin)?;
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(flags.to_vk());
        unsafe { device.begin_command_buffer(self.handle, &begin_info) }?;
        self.transition(CommandBufferOp::Begin)
    }

    pub fn begin_render_pass(
        &mut self,
        device: &ash::Device,
        begin_info: &vk::RenderPassBeginInfo,
    ) -> BackendResult<()> {
        self.state.apply(CommandBufferOp::BeginRenderPass)?;
        unsafe { device.cmd_begin_render_pass(self.handle, begin_info, vk::SubpassContents::INLINE) };
        self.transition(CommandBufferOp::BeginRenderPass)
    }

    pub fn end_render_pass(&mut self, device: &ash::Device) -> BackendResult<()> {
        self.state.apply(CommandBufferOp::EndRenderPass)?;
        unsafe { device.cmd_end_render_pass(self.handle) };
        self.transition(CommandBufferOp::EndRenderPass)
    }

    pub fn end(&mut self, device: &ash::Device) -> BackendResult<()> {
        self.state.apply(CommandBufferOp::End)?;
        unsafe { device.end_command_buffer(self.handle) }?;
        self.transition(CommandBufferOp::End)
    }

    pub fn reset(&mut self, device: &ash::Device) -> BackendResult<()> {
        self.state.apply(CommandBufferOp::Reset)?;
        unsafe { device.reset_command_buffer(self.handle, vk::CommandBufferResetFlags::empty()) }?;
        self.transition(CommandBufferOp::Reset)
    }

    /// Queue a semaphore the next submission must wait on at `stage`.
    pub fn add_wait_semaphore(&mut self, stage: vk::PipelineStageFlags, semaphore: vk::Semaphore) {
        self.pending_waits.push((stage, semaphore));
    }

    /// Move pending waits to the submitted list. Called once per submission.
    pub fn update_submitted(&mut self) {
        self.submitted_waits.clear();
        self.submitted_waits.append(&mut self.pending_waits);
    }

    /// Submit to `queue`, consuming the pending waits.
    pub fn submit(
        &mut self,
        device: &ash::Device,
        queue: vk::Queue,
        signal_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> BackendResult<()> {
        self.state.apply(CommandBufferOp::Submit)?;

        let (stages, waits): (Vec<_>, Vec<_>) = self.pending_waits.iter().copied().unzip();
        let command_buffers = [self.handle];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&waits)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(signal_semaphores);

        unsafe { device.queue_submit(queue, &[submit_info.build()], fence) }?;

        self.transition(CommandBufferOp::Submit)?;
        self.update_submitted();
        Ok(())
    }

    /// Release the Vulkan handle back to `pool`.
    pub fn free(self, device: &ash::Device, pool: vk::CommandPool) {
        unsafe { device.free_command_buffers(pool, &[self.handle]) };
    }
}

/// Identifies a buffer inside a `CommandPool`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandBufferId(usize);

/// Command pool arena with free-list recycling
pub struct CommandPool {
    device: Arc<VulkanDevice>,
    pool: vk::CommandPool,
    slots: Vec<CommandBuffer>,
    free_slots: Vec<usize>,
}

impl CommandPool {
    pub fn new(device: Arc<VulkanDevice>, queue_family: u32) -> BackendResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            // RESET: Allow individual buffer reset
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }?;
        log::debug!("Command pool created for queue family {}", queue_family);

        Ok(Self {
            device,
            pool,
            slots: Vec::new(),
            free_slots: Vec::new(),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Hand out a buffer in state Ready, recycling a freed slot of the same level first.
    pub fn allocate(&mut self, primary: bool) -> BackendResult<CommandBufferId> {
        if let Some(position) = self
            .free_slots
            .iter()
            .position(|&slot| self.slots[slot].primary == primary)
        {
            let slot = self.free_slots.swap_remove(position);
            let buffer = &mut self.slots[slot];
            unsafe {
                self.device
                    .device
                    .reset_command_buffer(buffer.handle, vk::CommandBufferResetFlags::empty())
            }?;
            buffer.state = CommandBufferState::Ready;
            buffer.pending_waits.clear();
            buffer.submitted_waits.clear();
            return Ok(CommandBufferId(slot));
        }

        let buffer = CommandBuffer::allocate(&self.device.device, self.pool, primary)?;
        self.slots.push(buffer);
        Ok(CommandBufferId(self.slots.len() - 1))
    }

    pub fn get(&self, id: CommandBufferId) -> &CommandBuffer {
        &self.slots[id.0]
    }

    pub fn get_mut(&mut self, id: CommandBufferId) -> &mut CommandBuffer {
        &mut self.slots[id.0]
    }

    /// Return a buffer to the free list. Its handle stays allocated for reuse.
    pub fn free(&mut self, id: CommandBufferId) {
        let buffer = &mut self.slots[id.0];
        if buffer.state == CommandBufferState::NotAllocated {
            return;
        }
        buffer.state = CommandBufferState::NotAllocated;
        self.free_slots.push(id.0);
    }

    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free_slots.len()
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            // Also frees every buffer allocated from it
            self.device.device.destroy_command_pool(self.pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use CommandBufferOp as Op;
    use CommandBufferState as S;

    #[test]
    fn test_full_cycle_follows_table() {
        let mut state = S::Ready;
        for op in [
            Op::Begin,
            Op::BeginRenderPass,
            Op::Draw,
            Op::EndRenderPass,
            Op::Record,
            Op::End,
            Op::Submit,
            Op::Reset,
        ] {
            state = state.apply(op).unwrap();
        }
        assert_eq!(state, S::Ready);
    }

    #[test]
    fn test_end_before_begin_rejected() {
        let err = S::Ready.apply(Op::End).unwrap_err();
        assert!(matches!(
            err,
            BackendError::InvalidCommandBufferState { op: Op::End, state: S::Ready }
        ));
    }

    #[test]
    fn test_render_pass_before_begin_rejected() {
        assert!(S::Ready.apply(Op::BeginRenderPass).is_err());
        assert!(S::Submitted.apply(Op::BeginRenderPass).is_err());
    }

    #[test]
    fn test_draw_outside_render_pass_rejected() {
        assert!(S::Recording.apply(Op::Draw).is_err());
        assert!(S::Ready.apply(Op::Record).is_err());
        assert_eq!(S::InRenderPass.apply(Op::Record).unwrap(), S::InRenderPass);
    }

    #[test]
    fn test_end_inside_render_pass_rejected() {
        assert!(S::InRenderPass.apply(Op::End).is_err());
        assert!(S::Recording.apply(Op::Submit).is_err());
        assert!(S::Submitted.apply(Op::Begin).is_err());
    }

    #[test]
    fn test_reset_from_any_allocated_state() {
        for state in [S::Ready, S::Recording, S::InRenderPass, S::RecordingEnded, S::Submitted] {
            assert_eq!(state.apply(Op::Reset).unwrap(), S::Ready);
        }
        assert!(S::NotAllocated.apply(Op::Reset).is_err());
        assert!(S::NotAllocated.apply(Op::Begin).is_err());
    }

    #[test]
    fn test_begin_flags_are_independent() {
        assert_eq!(BeginFlags::default().to_vk(), vk::CommandBufferUsageFlags::empty());
        assert_eq!(
            BeginFlags::single_use().to_vk(),
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        );
        let all = BeginFlags {
            single_use: true,
            render_pass_continue: true,
            simultaneous_use: true,
        };
        assert_eq!(
            all.to_vk(),
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
                | vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE
                | vk::CommandBufferUsageFlags::SIMULTANEOUS_USE
        );
    }

    #[test]
    fn test_wait_list_consumed_once() {
        let mut cmd = CommandBuffer::from_raw(vk::CommandBuffer::null(), true);
        let sem = vk::Semaphore::from_raw(7);
        cmd.add_wait_semaphore(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT, sem);
        assert_eq!(cmd.pending_waits().len(), 1);

        cmd.update_submitted();
        assert!(cmd.pending_waits().is_empty());
        assert_eq!(
            cmd.submitted_waits(),
            &[(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT, sem)]
        );

        // A submission with nothing pending clears the previous list
        cmd.update_submitted();
        assert!(cmd.submitted_waits().is_empty());
    }

    #[test]
    fn test_recording_handle_checks_state() {
        let cmd = CommandBuffer::from_raw(vk::CommandBuffer::from_raw(42), true);
        assert!(cmd.recording_handle(Op::Record).is_err());
        assert_eq!(cmd.state(), S::Ready);
    }
}
