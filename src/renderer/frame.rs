// Frame bookkeeping that does not touch the GPU
//
// The renderer keeps three small pieces of state between ticks: the latched
// resize request, which ring slot last used each swapchain image, and heap
// blocks waiting for the frames that may still read them to retire.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// What `prepare_frame` should do this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameGate {
    Proceed,
    /// Mid-recreation or zero extent
    Skip,
    Recreate { width: u32, height: u32 },
}

/// Coalesces resize notifications into at most one recreation per tick.
///
/// Only the last extent matters. A zero extent stays latched (minimized
/// window) until a positive one replaces it.
#[derive(Debug, Default)]
pub struct ResizeLatch {
    pending: Option<(u32, u32)>,
    recreating: bool,
}

impl ResizeLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latch(&mut self, width: u32, height: u32) {
        self.pending = Some((width, height));
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_recreating(&self) -> bool {
        self.recreating
    }

    /// Read once at the top of `prepare_frame`.
    ///
    /// Returning `Recreate` consumes the latch and marks a recreation in
    /// progress until `finish_recreate`.
    pub fn gate(&mut self) -> FrameGate {
        if self.recreating {
            return FrameGate::Skip;
        }
        match self.pending {
            None => FrameGate::Proceed,
            Some((0, _)) | Some((_, 0)) => FrameGate::Skip,
            Some((width, height)) => {
                self.pending = None;
                self.recreating = true;
                FrameGate::Recreate { width, height }
            }
        }
    }

    pub fn finish_recreate(&mut self) {
        self.recreating = false;
    }
}

/// Which ring slot's fence guards each swapchain image.
///
/// Images are not acquired in ring order, and there can be more images than
/// slots, so an image may still be in use by a slot other than the current one.
#[derive(Debug, Default)]
pub struct ImageFenceTable {
    guards: Vec<Option<usize>>,
}

impl ImageFenceTable {
    pub fn new(image_count: usize) -> Self {
        Self {
            guards: vec![None; image_count],
        }
    }

    /// Forget every guard, e.g. after the swapchain was rebuilt.
    pub fn reset(&mut self, image_count: usize) {
        self.guards.clear();
        self.guards.resize(image_count, None);
    }

    pub fn guard(&self, image_index: u32) -> Option<usize> {
        self.guards.get(image_index as usize).copied().flatten()
    }

    /// Hand `image_index` to `slot`, returning the slot that guarded it before.
    pub fn assign(&mut self, image_index: u32, slot: usize) -> Option<usize> {
        let index = image_index as usize;
        if index >= self.guards.len() {
            self.guards.resize(index + 1, None);
        }
        self.guards[index].replace(slot)
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

/// Items released once every frame that could reference them has completed.
///
/// Items are tagged with the number of frames submitted when the release was
/// requested. The frame being prepared at that moment may also use them, so
/// an item tagged `n` is retired once frame `n` is known complete, which is
/// when frame `n + frames_in_flight` is being prepared.
///
/// An item can be pending at most once. Its slot may be handed out again
/// after it retires, so a second queued release would free the new owner.
#[derive(Debug)]
pub struct DeferredFrees<T> {
    frames_in_flight: u64,
    pending: VecDeque<(u64, T)>,
    queued: HashSet<T>,
}

impl<T: Copy + Eq + Hash> DeferredFrees<T> {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            frames_in_flight: frames_in_flight.max(1) as u64,
            pending: VecDeque::new(),
            queued: HashSet::new(),
        }
    }

    /// Queue `item` for release. Returns `false` if it is already queued.
    pub fn defer(&mut self, frames_submitted: u64, item: T) -> bool {
        if !self.queued.insert(item) {
            return false;
        }
        self.pending.push_back((frames_submitted, item));
        true
    }

    pub fn contains(&self, item: &T) -> bool {
        self.queued.contains(item)
    }

    /// Call after waiting on the ring fence for the frame numbered `frames_submitted`.
    pub fn retire(&mut self, frames_submitted: u64) -> Vec<T> {
        let mut retired = Vec::new();
        while let Some((tag, _)) = self.pending.front() {
            if tag + self.frames_in_flight > frames_submitted {
                break;
            }
            if let Some((_, item)) = self.pending.pop_front() {
                self.queued.remove(&item);
                retired.push(item);
            }
        }
        retired
    }

    /// Release everything; only valid once the device is idle.
    pub fn flush(&mut self) -> Vec<T> {
        self.queued.clear();
        self.pending.drain(..).map(|(_, item)| item).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resizes_coalesce_to_final_extent() {
        let mut latch = ResizeLatch::new();
        for i in 1..=10 {
            latch.latch(100 * i, 50 * i);
        }

        let mut recreations = Vec::new();
        for _ in 0..5 {
            match latch.gate() {
                FrameGate::Recreate { width, height } => {
                    recreations.push((width, height));
                    latch.finish_recreate();
                }
                FrameGate::Proceed | FrameGate::Skip => {}
            }
        }

        assert_eq!(recreations, vec![(1000, 500)]);
        assert_eq!(latch.gate(), FrameGate::Proceed);
    }

    #[test]
    fn test_minimize_then_restore() {
        let mut latch = ResizeLatch::new();
        let mut recreations = 0;

        latch.latch(0, 0);
        for _ in 0..4 {
            assert_eq!(latch.gate(), FrameGate::Skip);
            assert!(latch.is_pending());
        }

        latch.latch(0, 0);
        latch.latch(1024, 768);
        match latch.gate() {
            FrameGate::Recreate { width, height } => {
                assert_eq!((width, height), (1024, 768));
                recreations += 1;
                latch.finish_recreate();
            }
            other => panic!("expected recreation, got {:?}", other),
        }

        assert_eq!(latch.gate(), FrameGate::Proceed);
        assert_eq!(recreations, 1);
    }

    #[test]
    fn test_skip_while_recreating() {
        let mut latch = ResizeLatch::new();
        latch.latch(800, 600);
        assert!(matches!(latch.gate(), FrameGate::Recreate { .. }));

        latch.latch(640, 480);
        assert!(latch.is_recreating());
        assert_eq!(latch.gate(), FrameGate::Skip);

        latch.finish_recreate();
        assert_eq!(
            latch.gate(),
            FrameGate::Recreate {
                width: 640,
                height: 480
            }
        );
    }

    #[test]
    fn test_image_fence_table() {
        let mut table = ImageFenceTable::new(3);
        assert_eq!(table.guard(1), None);
        assert_eq!(table.assign(1, 0), None);
        assert_eq!(table.guard(1), Some(0));
        assert_eq!(table.assign(1, 1), Some(0));
        assert_eq!(table.guard(7), None);

        table.reset(4);
        assert_eq!(table.len(), 4);
        assert_eq!(table.guard(1), None);
    }

    #[test]
    fn test_deferred_frees_wait_for_frames_in_flight() {
        let mut frees = DeferredFrees::new(2);
        frees.defer(5, "mesh-a");
        frees.defer(6, "mesh-b");

        assert!(frees.retire(5).is_empty());
        assert!(frees.retire(6).is_empty());
        assert_eq!(frees.retire(7), vec!["mesh-a"]);
        assert_eq!(frees.retire(8), vec!["mesh-b"]);
        assert!(frees.is_empty());
    }

    #[test]
    fn test_deferred_frees_flush() {
        let mut frees = DeferredFrees::new(3);
        frees.defer(0, 1u32);
        frees.defer(1, 2u32);
        assert_eq!(frees.len(), 2);
        assert_eq!(frees.flush(), vec![1, 2]);
        assert!(frees.retire(100).is_empty());
    }

    #[test]
    fn test_repeat_defer_is_rejected() {
        let mut frees = DeferredFrees::new(2);
        assert!(frees.defer(0, 7u32));
        assert!(!frees.defer(1, 7u32));
        assert!(frees.contains(&7));
        assert_eq!(frees.len(), 1);

        assert_eq!(frees.retire(2), vec![7]);
        assert!(!frees.contains(&7));
        // Slot 7 is reused by a new owner; nothing stale is left to free it
        assert!(frees.retire(3).is_empty());
        assert!(frees.defer(3, 7u32));
    }

    #[test]
    fn test_stale_release_never_frees_reused_block() {
        use crate::backend::heap::BlockAllocator;

        let mut heap = BlockAllocator::new("vertex", 256, 4);
        let mut frees = DeferredFrees::new(2);
        let (first, _) = heap.allocate(4, 4).unwrap();

        assert!(frees.defer(0, first));
        assert!(!frees.defer(1, first));
        for index in frees.retire(2) {
            heap.free(index).unwrap();
        }

        let (second, block) = heap.allocate(4, 4).unwrap();
        assert_eq!(second, first);
        for index in frees.retire(3) {
            heap.free(index).unwrap();
        }
        assert_eq!(heap.get(second), Some(block));
    }

    // CPU-side model of the fence protocol: a fence is either signaled,
    // submitted (the GPU will signal it) or reset with nothing submitted.
    // Waiting on the last kind would block forever.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum SimFence {
        Signaled,
        Submitted,
        Reset,
    }

    struct SimRenderer {
        fences: Vec<SimFence>,
        images: ImageFenceTable,
        frame: usize,
        waits: Vec<usize>,
    }

    impl SimRenderer {
        fn new(frames_in_flight: usize, image_count: usize) -> Self {
            Self {
                fences: vec![SimFence::Signaled; frames_in_flight],
                images: ImageFenceTable::new(image_count),
                frame: 0,
                waits: Vec::new(),
            }
        }

        fn wait(&mut self, slot: usize) {
            match self.fences[slot] {
                SimFence::Reset => panic!("deadlock: waiting on unsubmitted fence {}", slot),
                SimFence::Submitted => {
                    self.waits.push(slot);
                    self.fences[slot] = SimFence::Signaled;
                }
                SimFence::Signaled => {}
            }
        }

        fn tick(&mut self, image_index: u32) {
            let slot = self.frame % self.fences.len();
            // prepare_frame
            self.wait(slot);
            // frame
            if let Some(guard) = self.images.guard(image_index) {
                self.wait(guard);
            }
            self.images.assign(image_index, slot);
            self.fences[slot] = SimFence::Reset;
            self.fences[slot] = SimFence::Submitted;
            self.frame += 1;
        }
    }

    #[test]
    fn test_third_frame_waits_only_for_first() {
        let mut sim = SimRenderer::new(2, 3);
        sim.tick(0);
        sim.tick(1);
        assert!(sim.waits.is_empty());

        sim.tick(2);
        assert_eq!(sim.waits, vec![0]);
    }

    #[test]
    fn test_out_of_order_images_never_deadlock() {
        let acquisition = [0, 1, 1, 2, 0, 0, 2, 1, 2, 2, 0, 1];
        let mut sim = SimRenderer::new(2, 3);
        for &image in &acquisition {
            sim.tick(image);
        }
        assert_eq!(sim.frame, acquisition.len());
    }

    #[test]
    fn test_image_guarded_by_other_slot_is_waited() {
        let mut sim = SimRenderer::new(2, 2);
        sim.tick(0); // slot 0 renders image 0
        sim.tick(0); // slot 1 gets image 0 back while slot 0 may still run
        assert_eq!(sim.waits, vec![0]);
        assert_eq!(sim.images.guard(0), Some(1));
    }
}
