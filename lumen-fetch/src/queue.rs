//! Priority / normal dispatch queues.
//!
//! Producers append; workers drain priority-first. The priority queue is
//! re-checked on every dequeue, so a high-priority request enqueued in the
//! middle of a drain is served before the remaining normal ones.
//!
//! The queues themselves are not synchronised; the pipeline keeps them
//! behind the same mutex as its wake condvar.

use std::collections::VecDeque;

use crate::request::{AcceptFilter, Priority, RequestId, ResourceKey};

/// Work item handed to a worker. Listeners stay in the registry.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub id: RequestId,
    pub key: ResourceKey,
    pub accept: AcceptFilter,
    pub priority: Priority,
}

/// The two FIFO queues.
#[derive(Debug, Default)]
pub struct DispatchQueues {
    priority: VecDeque<QueuedRequest>,
    normal: VecDeque<QueuedRequest>,
}

impl DispatchQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the queue matching `request.priority`. O(1).
    pub fn enqueue(&mut self, request: QueuedRequest) {
        match request.priority {
            Priority::High => self.priority.push_back(request),
            Priority::Normal => self.normal.push_back(request),
        }
    }

    /// Head of the priority queue, else head of the normal queue.
    pub fn dequeue(&mut self) -> Option<QueuedRequest> {
        self.priority
            .pop_front()
            .or_else(|| self.normal.pop_front())
    }

    /// Move the normal-priority request `id` to the back of the priority queue.
    ///
    /// Returns `false` if it is not waiting in the normal queue.
    pub fn promote(&mut self, id: RequestId) -> bool {
        let Some(index) = self.normal.iter().position(|r| r.id == id) else {
            return false;
        };
        match self.normal.remove(index) {
            Some(mut request) => {
                request.priority = Priority::High;
                self.priority.push_back(request);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.priority.len() + self.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.priority.is_empty() && self.normal.is_empty()
    }

    pub fn priority_len(&self) -> usize {
        self.priority.len()
    }

    pub fn normal_len(&self) -> usize {
        self.normal.len()
    }

    /// Remove every queued request, priority first.
    pub fn clear(&mut self) -> Vec<QueuedRequest> {
        self.priority
            .drain(..)
            .chain(self.normal.drain(..))
            .collect()
    }
}
