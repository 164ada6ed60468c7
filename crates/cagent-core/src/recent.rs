//! Fixed-capacity ring of recent terminal events

use crate::ContainerStateChanged;
use cagent_runtime::ContainerId;

/// The most recent terminal events, oldest overwritten first
#[derive(Debug)]
pub struct RecentExits {
    slots: Vec<Option<ContainerStateChanged>>,
    next: usize,
}

impl RecentExits {
    /// Ring holding up to `capacity` events (at least one)
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
            next: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn push(&mut self, exit: ContainerStateChanged) {
        self.slots[self.next] = Some(exit);
        self.next = (self.next + 1) % self.slots.len();
    }

    /// Newest entry for `id`
    pub fn find(&self, id: &ContainerId) -> Option<&ContainerStateChanged> {
        let n = self.slots.len();
        (1..=n)
            .map(|back| (self.next + n - back) % n)
            .filter_map(|i| self.slots[i].as_ref())
            .find(|exit| exit.container.id == *id)
    }
}
