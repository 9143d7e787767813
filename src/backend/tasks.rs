// Per-frame task bookkeeping
//
// Each ring slot tracks which fences the CPU must wait on before reusing the
// slot and which semaphores order GPU work within the frame. Semaphores live
// in two buckets: "chained" (consumed by the next in-order submission) and
// "frame end" (only waited on at present time).

use std::collections::VecDeque;

use ash::vk;
use parking_lot::Mutex;

/// How a submission relates to its siblings within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPolicy {
    /// Waits on the previous in-order submission and chains its own finished
    /// semaphore into the next one's wait set.
    InOrder,
    /// Frame-synchronized only: runs concurrently with siblings, completion
    /// checked at present time.
    Parallel,
    /// Waits on the previous in-order submission but does not chain its own
    /// signal; successors won't order against it until present.
    ParallelWaitForPrevious,
}

impl ExecutionPolicy {
    pub fn waits_on_previous(self) -> bool {
        matches!(self, Self::InOrder | Self::ParallelWaitForPrevious)
    }

    pub fn chains_signal(self) -> bool {
        matches!(self, Self::InOrder)
    }
}

#[derive(Default)]
struct SlotTasks {
    fences: Vec<vk::Fence>,
    chained: VecDeque<vk::Semaphore>,
    frame_end: Vec<vk::Semaphore>,
}

/// Wait/signal bookkeeping for every ring slot.
///
/// One slot-independent lock serializes all mutation: command buffers for a
/// frame may be produced from multiple passes before submission.
pub struct TaskManager {
    slots: Mutex<Vec<SlotTasks>>,
}

impl TaskManager {
    pub fn new(frames_in_flight: usize) -> Self {
        let mut slots = Vec::with_capacity(frames_in_flight);
        slots.resize_with(frames_in_flight, SlotTasks::default);
        Self {
            slots: Mutex::new(slots),
        }
    }

    /// Register a submitted command buffer's fence and finished semaphore,
    /// routed by policy.
    pub fn add_command_buffer(
        &self,
        slot: usize,
        fence: vk::Fence,
        finished: vk::Semaphore,
        policy: ExecutionPolicy,
    ) {
        let mut slots = self.slots.lock();
        let tasks = &mut slots[slot];
        tasks.fences.push(fence);
        if policy.chains_signal() {
            tasks.chained.push_back(finished);
        } else {
            tasks.frame_end.push(finished);
        }
    }

    /// Seed a wait-only semaphore (the swapchain's acquire semaphore) into
    /// the chained bucket so the first in-order submission waits on it.
    pub fn add_wait_semaphore(&self, slot: usize, semaphore: vk::Semaphore) {
        self.slots.lock()[slot].chained.push_back(semaphore);
    }

    /// Pop the next chained semaphore, FIFO. `None` once exhausted.
    pub fn next_chained(&self, slot: usize) -> Option<vk::Semaphore> {
        self.slots.lock()[slot].chained.pop_front()
    }

    /// Remove one semaphore from the slot, wherever it is registered.
    /// Returns whether it was present.
    pub fn remove_semaphore(&self, slot: usize, semaphore: vk::Semaphore) -> bool {
        let mut slots = self.slots.lock();
        let tasks = &mut slots[slot];
        let mut found = false;
        if let Some(pos) = tasks.chained.iter().position(|&s| s == semaphore) {
            tasks.chained.remove(pos);
            found = true;
        }
        if let Some(pos) = tasks.frame_end.iter().position(|&s| s == semaphore) {
            tasks.frame_end.swap_remove(pos);
            found = true;
        }
        found
    }

    /// Remove one fence from the slot.
    pub fn remove_fence(&self, slot: usize, fence: vk::Fence) {
        self.slots.lock()[slot].fences.retain(|&f| f != fence);
    }

    /// Purge fences and semaphores from every slot. Used when an owning
    /// command buffer is destroyed outside the per-frame cycle, so no slot
    /// keeps a dangling reference.
    pub fn remove_from_all(&self, fences: &[vk::Fence], semaphores: &[vk::Semaphore]) {
        let mut slots = self.slots.lock();
        for tasks in slots.iter_mut() {
            tasks.fences.retain(|f| !fences.contains(f));
            tasks.chained.retain(|s| !semaphores.contains(s));
            tasks.frame_end.retain(|s| !semaphores.contains(s));
        }
    }

    /// Fences the CPU must wait on before reusing the slot.
    pub fn fences(&self, slot: usize) -> Vec<vk::Fence> {
        self.slots.lock()[slot].fences.clone()
    }

    /// Union of chained and frame-end semaphores, for present-time waiting.
    pub fn semaphores(&self, slot: usize) -> Vec<vk::Semaphore> {
        let slots = self.slots.lock();
        let tasks = &slots[slot];
        tasks
            .chained
            .iter()
            .chain(tasks.frame_end.iter())
            .copied()
            .collect()
    }

    pub fn contains_semaphore(&self, slot: usize, semaphore: vk::Semaphore) -> bool {
        let slots = self.slots.lock();
        let tasks = &slots[slot];
        tasks.chained.contains(&semaphore) || tasks.frame_end.contains(&semaphore)
    }

    /// Clear the slot's fence list after the CPU wait has completed.
    pub fn reset_fences(&self, slot: usize) {
        self.slots.lock()[slot].fences.clear();
    }

    /// Clear the slot's semaphore bookkeeping after presenting.
    pub fn reset_semaphores(&self, slot: usize) {
        let mut slots = self.slots.lock();
        slots[slot].chained.clear();
        slots[slot].frame_end.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn sem(raw: u64) -> vk::Semaphore {
        vk::Semaphore::from_raw(raw)
    }

    fn fence(raw: u64) -> vk::Fence {
        vk::Fence::from_raw(raw)
    }

    #[test]
    fn in_order_chains_fifo() {
        let tasks = TaskManager::new(2);
        tasks.add_command_buffer(0, fence(1), sem(10), ExecutionPolicy::InOrder);
        tasks.add_command_buffer(0, fence(2), sem(20), ExecutionPolicy::InOrder);

        assert_eq!(tasks.next_chained(0), Some(sem(10)));
        assert_eq!(tasks.next_chained(0), Some(sem(20)));
        assert_eq!(tasks.next_chained(0), None);
    }

    #[test]
    fn parallel_only_synchronizes_at_frame_end() {
        let tasks = TaskManager::new(2);
        tasks.add_command_buffer(0, fence(1), sem(10), ExecutionPolicy::Parallel);

        assert_eq!(tasks.next_chained(0), None);
        assert_eq!(tasks.semaphores(0), vec![sem(10)]);
    }

    #[test]
    fn semaphore_union_covers_both_buckets() {
        let tasks = TaskManager::new(2);
        tasks.add_wait_semaphore(0, sem(1));
        tasks.add_command_buffer(0, fence(1), sem(10), ExecutionPolicy::InOrder);
        tasks.add_command_buffer(0, fence(2), sem(20), ExecutionPolicy::Parallel);

        let mut all = tasks.semaphores(0);
        all.sort_by_key(|s| s.as_raw());
        assert_eq!(all, vec![sem(1), sem(10), sem(20)]);
    }

    // framesInFlight = 2, CB1 then CB2 submitted InOrder in the same frame:
    // CB2's wait set is exactly CB1's finished semaphore (plus explicit
    // wait-on entries), and the acquire semaphore is never handed out twice.
    #[test]
    fn second_in_order_submission_waits_on_first() {
        let tasks = TaskManager::new(2);
        let acquire = sem(1);
        tasks.add_wait_semaphore(0, acquire);

        // CB1 submits: consumes the acquire semaphore, chains its own.
        assert_eq!(tasks.next_chained(0), Some(acquire));
        tasks.add_command_buffer(0, fence(1), sem(10), ExecutionPolicy::InOrder);

        // CB2 submits with an explicit wait on another buffer.
        let explicit = sem(99);
        tasks.add_command_buffer(0, fence(2), explicit, ExecutionPolicy::Parallel);
        assert!(tasks.remove_semaphore(0, explicit));
        let chained = tasks.next_chained(0);
        assert_eq!(chained, Some(sem(10)));
        assert_ne!(chained, Some(acquire));

        // Nothing left to chain; the acquire semaphore was consumed once.
        assert_eq!(tasks.next_chained(0), None);
    }

    #[test]
    fn remove_from_all_purges_every_slot() {
        let tasks = TaskManager::new(3);
        for slot in 0..3 {
            tasks.add_command_buffer(slot, fence(7), sem(70), ExecutionPolicy::InOrder);
            tasks.add_command_buffer(slot, fence(8), sem(80), ExecutionPolicy::Parallel);
        }

        tasks.remove_from_all(&[fence(7), fence(8)], &[sem(70), sem(80)]);

        for slot in 0..3 {
            assert!(tasks.fences(slot).is_empty());
            assert!(tasks.semaphores(slot).is_empty());
            assert_eq!(tasks.next_chained(slot), None);
        }
    }

    #[test]
    fn resets_are_scoped_to_one_slot() {
        let tasks = TaskManager::new(2);
        tasks.add_command_buffer(0, fence(1), sem(10), ExecutionPolicy::InOrder);
        tasks.add_command_buffer(1, fence(2), sem(20), ExecutionPolicy::InOrder);

        tasks.reset_fences(0);
        tasks.reset_semaphores(0);

        assert!(tasks.fences(0).is_empty());
        assert!(tasks.semaphores(0).is_empty());
        assert_eq!(tasks.fences(1), vec![fence(2)]);
        assert_eq!(tasks.semaphores(1), vec![sem(20)]);
    }

    #[test]
    fn policy_flags() {
        assert!(ExecutionPolicy::InOrder.waits_on_previous());
        assert!(ExecutionPolicy::InOrder.chains_signal());
        assert!(!ExecutionPolicy::Parallel.waits_on_previous());
        assert!(!ExecutionPolicy::Parallel.chains_signal());
        assert!(ExecutionPolicy::ParallelWaitForPrevious.waits_on_previous());
        assert!(!ExecutionPolicy::ParallelWaitForPrevious.chains_signal());
    }
}
