//! Deferred resource reclamation for multi-frame-in-flight rendering.
//!
//! With several frames in flight a resource cannot be destroyed the moment
//! the CPU stops referencing it; an earlier frame's command buffer may still
//! read it on the GPU. [`DeferredQueue`] parks retired values together with
//! the frame number they were retired on and releases them once enough
//! frames have passed for every in-flight reference to have drained.

use std::collections::VecDeque;

/// Frame-tagged holding queue for retired values.
///
/// Values are queued with the frame number current at retirement and only
/// handed back once `frames_in_flight` further frames have completed. The
/// queue never destroys anything itself; [`DeferredQueue::drain_completed`]
/// returns the matured values and the caller decides how to free them.
pub struct DeferredQueue<T> {
    pending: VecDeque<(u64, T)>,
    frames_in_flight: usize,
}

impl<T> DeferredQueue<T> {
    /// Create a queue that holds values for `frames_in_flight` frames
    /// before releasing them.
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frames_in_flight,
        }
    }

    /// Park a value until `frames_in_flight` frames after `frame_number`
    /// have passed.
    pub fn retire(&mut self, value: T, frame_number: u64) {
        self.pending.push_back((frame_number, value));
    }

    /// Return every value whose retirement frame is old enough that no
    /// in-flight frame can still reference it.
    ///
    /// Call once per frame with the current frame number, before recording.
    pub fn drain_completed(&mut self, current_frame_number: u64) -> Vec<T> {
        let cutoff = current_frame_number.saturating_sub(self.frames_in_flight as u64);

        // Queue order is FIFO and frame numbers are non-decreasing, so only
        // a prefix can mature.
        let mature = self
            .pending
            .iter()
            .take_while(|(queued, _)| *queued < cutoff)
            .count();

        self.pending.drain(..mature).map(|(_, value)| value).collect()
    }

    /// Return everything still pending regardless of age.
    ///
    /// For shutdown, after `device_wait_idle()` has made every value safe
    /// to free.
    pub fn flush(&mut self) -> Vec<T> {
        self.pending.drain(..).map(|(_, value)| value).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// Update the hold duration, for swapchain rebuilds that change the
    /// frame-in-flight count. Already-queued values keep their original
    /// retirement frames and are re-judged against the new duration.
    pub fn set_frames_in_flight(&mut self, frames_in_flight: usize) {
        self.frames_in_flight = frames_in_flight;
    }
}

impl<T> Default for DeferredQueue<T> {
    fn default() -> Self {
        Self::new(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_are_held_for_the_full_window() {
        let mut queue = DeferredQueue::new(2);
        queue.retire("mesh", 10);

        assert!(queue.drain_completed(10).is_empty());
        assert!(queue.drain_completed(11).is_empty());
        assert!(queue.drain_completed(12).is_empty());
        assert_eq!(queue.drain_completed(13), vec!["mesh"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn maturation_preserves_retirement_order() {
        let mut queue = DeferredQueue::new(1);
        queue.retire(1u32, 5);
        queue.retire(2u32, 5);
        queue.retire(3u32, 6);

        assert_eq!(queue.drain_completed(7), vec![1, 2]);
        assert_eq!(queue.drain_completed(8), vec![3]);
    }

    #[test]
    fn early_frames_never_underflow() {
        let mut queue = DeferredQueue::new(3);
        queue.retire("first", 0);

        assert!(queue.drain_completed(0).is_empty());
        assert!(queue.drain_completed(2).is_empty());
        assert_eq!(queue.drain_completed(4), vec!["first"]);
    }

    #[test]
    fn flush_ignores_maturity() {
        let mut queue = DeferredQueue::new(8);
        queue.retire(1u32, 100);
        queue.retire(2u32, 101);

        assert_eq!(queue.flush(), vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn shrinking_the_window_matures_old_values_sooner() {
        let mut queue = DeferredQueue::new(10);
        queue.retire("texture", 20);

        assert!(queue.drain_completed(24).is_empty());
        queue.set_frames_in_flight(2);
        assert_eq!(queue.drain_completed(24), vec!["texture"]);
    }

    #[test]
    fn len_tracks_pending_values() {
        let mut queue = DeferredQueue::new(2);
        assert_eq!(queue.len(), 0);

        queue.retire('a', 1);
        queue.retire('b', 2);
        assert_eq!(queue.len(), 2);

        queue.drain_completed(4);
        assert_eq!(queue.len(), 1);
    }
}
