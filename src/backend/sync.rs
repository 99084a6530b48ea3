// Synchronization primitives
//
// Fences for GPU->CPU handoff, semaphores for GPU->GPU ordering.
// Fences track their own state so waiting on an already signaled fence
// costs no API call.

use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::BackendResult;

/// GPU-only ordering token. Never waited on from the CPU.
pub struct Semaphore {
    device: Arc<VulkanDevice>,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    pub fn new(device: Arc<VulkanDevice>) -> BackendResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe { device.device.create_semaphore(&create_info, None) }?;
        Ok(Self { device, semaphore })
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    NotReady,
    Signaled,
}

/// CPU-visible completion signal for submitted GPU work.
pub struct Fence {
    device: Arc<VulkanDevice>,
    fence: vk::Fence,
    state: FenceState,
}

impl Fence {
    /// `signaled = true` starts the fence signaled so the first wait on it
    /// returns immediately.
    pub fn new(device: Arc<VulkanDevice>, signaled: bool) -> BackendResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::builder().flags(flags);
        let fence = unsafe { device.device.create_fence(&create_info, None) }?;

        let state = if signaled {
            FenceState::Signaled
        } else {
            FenceState::NotReady
        };
        Ok(Self { device, fence, state })
    }

    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    #[inline]
    pub fn state(&self) -> FenceState {
        self.state
    }

    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.state == FenceState::Signaled
    }

    /// Block until the fence is signaled or `timeout` nanoseconds pass.
    ///
    /// Returns `Ok(false)` on timeout. The caller decides whether to retry.
    pub fn wait(&mut self, timeout: u64) -> BackendResult<bool> {
        if self.state == FenceState::Signaled {
            return Ok(true);
        }

        match unsafe { self.device.device.wait_for_fences(&[self.fence], true, timeout) } {
            Ok(()) => {
                self.state = FenceState::Signaled;
                Ok(true)
            }
            Err(vk::Result::TIMEOUT) => {
                log::warn!("Fence wait timed out after {} ns", timeout);
                Ok(false)
            }
            Err(e) => {
                log::error!("Fence wait failed: {:?}", e);
                Err(e.into())
            }
        }
    }

    /// Return the fence to NotReady. No-op when it already is.
    pub fn reset(&mut self) -> BackendResult<()> {
        if self.state == FenceState::NotReady {
            return Ok(());
        }

        unsafe { self.device.device.reset_fences(&[self.fence]) }?;
        self.state = FenceState::NotReady;
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_fence(self.fence, None);
        }
    }
}

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: Semaphore,
    pub render_complete: Semaphore,
    pub in_flight_fence: Fence,
}

impl FrameSync {
    pub fn new(device: &Arc<VulkanDevice>) -> BackendResult<Self> {
        Ok(Self {
            image_available: Semaphore::new(device.clone())?,
            render_complete: Semaphore::new(device.clone())?,
            // Start signaled so frame 0 does not wait on work never submitted
            in_flight_fence: Fence::new(device.clone(), true)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_objects_are_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Semaphore>();
        assert_send::<Fence>();
        assert_send::<FrameSync>();
    }
}
