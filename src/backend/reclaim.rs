// Deferred resource reclamation
//
// Destroying a GPU resource the moment its owner goes away is a
// use-after-free on the GPU timeline: submitted work may still reference it.
// Owners instead retire a tagged handle bundle stamped with the monotonic
// frame number; the bundle is released only once a later slot-fence wait has
// proven that frame complete. Draining is explicit, never eager.

use std::collections::VecDeque;

use ash::vk;
use gpu_allocator::vulkan::Allocation;

/// Handles released together once the GPU is provably done with them.
pub enum RetiredResource {
    Buffer {
        buffer: vk::Buffer,
        allocation: Option<Allocation>,
    },
    Image {
        image: vk::Image,
        view: vk::ImageView,
        sampler: Option<vk::Sampler>,
        allocation: Option<Allocation>,
    },
    ImageView {
        view: vk::ImageView,
    },
    Sampler {
        sampler: vk::Sampler,
    },
    CommandBuffers {
        pool: vk::CommandPool,
        fences: Vec<vk::Fence>,
        semaphores: Vec<vk::Semaphore>,
    },
}

struct Entry {
    retired_at: u64,
    resource: RetiredResource,
}

/// FIFO of retired resources, drained against the frame counter.
pub struct ReclaimQueue {
    entries: VecDeque<Entry>,
    frames_in_flight: u64,
}

impl ReclaimQueue {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            frames_in_flight: frames_in_flight as u64,
        }
    }

    /// Retire a resource last used no later than frame `frame`.
    pub fn push(&mut self, frame: u64, resource: RetiredResource) {
        self.entries.push_back(Entry {
            retired_at: frame,
            resource,
        });
    }

    /// Pop every entry whose frame has been proven complete.
    ///
    /// A resource retired during frame F was last referenced by work fenced
    /// in F's ring slot; that fence is waited on when the ring returns to the
    /// slot, i.e. at the start of frame F + frames_in_flight. Entries are
    /// ordered, so draining stops at the first one still in flight.
    pub fn drain_completed(&mut self, frame: u64) -> Vec<RetiredResource> {
        let mut out = Vec::new();
        while self
            .entries
            .front()
            .is_some_and(|e| e.retired_at + self.frames_in_flight <= frame)
        {
            if let Some(entry) = self.entries.pop_front() {
                out.push(entry.resource);
            }
        }
        out
    }

    /// Pop everything, regardless of frame. Only valid after a device idle.
    pub fn drain_all(&mut self) -> Vec<RetiredResource> {
        self.entries.drain(..).map(|e| e.resource).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn buffer(raw: u64) -> RetiredResource {
        RetiredResource::Buffer {
            buffer: vk::Buffer::from_raw(raw),
            allocation: None,
        }
    }

    #[test]
    fn nothing_drains_while_the_frame_may_be_in_flight() {
        let mut queue = ReclaimQueue::new(2);
        queue.push(5, buffer(1));

        assert!(queue.drain_completed(5).is_empty());
        assert!(queue.drain_completed(6).is_empty());
        assert_eq!(queue.drain_completed(7).len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn second_drain_without_new_entries_does_nothing() {
        let mut queue = ReclaimQueue::new(2);
        queue.push(0, buffer(1));
        queue.push(0, buffer(2));

        assert_eq!(queue.drain_completed(10).len(), 2);
        assert!(queue.drain_completed(10).is_empty());
        assert!(queue.drain_completed(11).is_empty());
    }

    #[test]
    fn drain_stops_at_first_in_flight_entry() {
        let mut queue = ReclaimQueue::new(2);
        queue.push(0, buffer(1));
        queue.push(1, buffer(2));
        queue.push(4, buffer(3));

        let drained = queue.drain_completed(3);
        assert_eq!(drained.len(), 2);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn teardown_drain_returns_everything() {
        let mut queue = ReclaimQueue::new(3);
        queue.push(0, buffer(1));
        queue.push(9, buffer(2));

        assert_eq!(queue.drain_all().len(), 2);
        assert!(queue.is_empty());
    }
}
