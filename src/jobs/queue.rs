//! Priority queues of pending job ids.

use std::collections::VecDeque;

use serde::Serialize;

use crate::jobs::model::{JobId, Priority};

/// One FIFO per priority class. VIP is always drained first.
#[derive(Debug, Default)]
pub struct PriorityQueues {
    vip: VecDeque<JobId>,
    normal: VecDeque<JobId>,
}

/// Queue depths per class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    pub vip: usize,
    pub normal: usize,
}

impl QueueDepths {
    pub fn total(&self) -> usize {
        self.vip + self.normal
    }
}

impl PriorityQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn class_mut(&mut self, priority: Priority) -> &mut VecDeque<JobId> {
        match priority {
            Priority::Vip => &mut self.vip,
            Priority::Normal => &mut self.normal,
        }
    }

    /// Append to the tail of the job's class.
    pub fn push_back(&mut self, id: JobId, priority: Priority) {
        self.class_mut(priority).push_back(id);
    }

    /// Put a job back at the head of its class (reassignment keeps its turn).
    pub fn push_front(&mut self, id: JobId, priority: Priority) {
        self.class_mut(priority).push_front(id);
    }

    pub fn front(&self, priority: Priority) -> Option<JobId> {
        match priority {
            Priority::Vip => self.vip.front().copied(),
            Priority::Normal => self.normal.front().copied(),
        }
    }

    pub fn pop_front(&mut self, priority: Priority) -> Option<JobId> {
        self.class_mut(priority).pop_front()
    }

    /// Remove a job from whichever class holds it.
    pub fn remove(&mut self, id: JobId) -> bool {
        for queue in [&mut self.vip, &mut self.normal] {
            if let Some(pos) = queue.iter().position(|queued| *queued == id) {
                queue.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.vip.contains(&id) || self.normal.contains(&id)
    }

    pub fn depths(&self) -> QueueDepths {
        QueueDepths {
            vip: self.vip.len(),
            normal: self.normal.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.vip.len() + self.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn fifo_within_class() {
        let mut q = PriorityQueues::new();
        let ids: Vec<_> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            q.push_back(*id, Priority::Normal);
        }
        let drained: Vec<_> = std::iter::from_fn(|| q.pop_front(Priority::Normal)).collect();
        assert_eq!(drained, ids);
    }

    #[test]
    fn remove_and_depths() {
        let mut q = PriorityQueues::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        q.push_back(a, Priority::Vip);
        q.push_back(b, Priority::Normal);
        assert_eq!(q.depths(), QueueDepths { vip: 1, normal: 1 });

        assert!(q.remove(b));
        assert!(!q.remove(b));
        assert!(!q.contains(b));
        assert_eq!(q.len(), 1);

        let c = Uuid::new_v4();
        q.push_front(c, Priority::Vip);
        assert_eq!(q.front(Priority::Vip), Some(c));
    }
}
