//! The transaction intent log: per-writer staging of dirty page containers.
//!
//! Entries are keyed by in-memory reference identity, not by file key, since
//! file keys are unset until commit. The log key handed to a reference is its
//! insertion index, scoped by the log's generation so keys from a rotated-out
//! log never resolve against a newer one.

use tracing::trace;

use crate::page::{LogKey, Page, PageRef};

/// A complete read view paired with the dirty write view of one page.
///
/// For indirect, root, and uber pages the two views start as clones of the
/// same state. For record leaves the complete view is the fully combined
/// page while the write view holds what the configured versioning strategy
/// will persist.
#[derive(Debug, Clone)]
pub struct PageContainer {
    /// The fully reconstructed page, serving reads.
    pub complete: Page,
    /// The dirty view the commit will persist.
    pub modified: Page,
}

impl PageContainer {
    /// A container whose write view equals its read view.
    pub fn mirrored(page: Page) -> Self {
        Self {
            complete: page.clone(),
            modified: page,
        }
    }
}

/// The staging area of one write transaction.
#[derive(Debug)]
pub struct IntentLog {
    generation: u64,
    entries: Vec<Option<PageContainer>>,
}

impl IntentLog {
    /// An empty log with the given generation.
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            entries: Vec::new(),
        }
    }

    /// Generation stamped onto every log key this log assigns.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of staged containers (including taken slots).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing was ever staged.
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_none())
    }

    /// Stages a container for `reference`, assigning its log key. O(1).
    pub fn put(&mut self, reference: &mut PageRef, container: PageContainer) -> LogKey {
        let key = LogKey {
            generation: self.generation,
            index: self.entries.len(),
        };
        self.entries.push(Some(container));
        reference.set_log_key(key);
        trace!(
            generation = key.generation,
            index = key.index,
            "til.put"
        );
        key
    }

    /// Key the next [`Self::push`] will occupy. Lets a caller stamp a
    /// reference it is already borrowing before appending the container.
    pub fn next_key(&self) -> LogKey {
        LogKey {
            generation: self.generation,
            index: self.entries.len(),
        }
    }

    /// Appends a container whose reference was stamped via
    /// [`Self::next_key`].
    pub fn push(&mut self, container: PageContainer) -> LogKey {
        let key = self.next_key();
        self.entries.push(Some(container));
        key
    }

    /// Puts a container taken for persistence back into its slot, so
    /// concurrent lookups keep resolving while a background commit runs.
    pub fn restore(&mut self, key: LogKey, container: PageContainer) {
        if key.generation == self.generation {
            if let Some(slot) = self.entries.get_mut(key.index) {
                *slot = Some(container);
            }
        }
    }

    /// Resolves a reference against this log.
    pub fn get(&self, reference: &PageRef) -> Option<&PageContainer> {
        let key = reference.log_key()?;
        self.get_by_key(key)
    }

    /// Resolves a reference against this log, mutably.
    pub fn get_mut(&mut self, reference: &PageRef) -> Option<&mut PageContainer> {
        let key = reference.log_key()?;
        self.get_by_key_mut(key)
    }

    /// Looks up a container by log key, checking the generation.
    pub fn get_by_key(&self, key: LogKey) -> Option<&PageContainer> {
        if key.generation != self.generation {
            return None;
        }
        self.entries.get(key.index)?.as_ref()
    }

    /// Looks up a container by log key, mutably.
    pub fn get_by_key_mut(&mut self, key: LogKey) -> Option<&mut PageContainer> {
        if key.generation != self.generation {
            return None;
        }
        self.entries.get_mut(key.index)?.as_mut()
    }

    /// Removes and returns a container; used by the commit traversal, which
    /// visits every entry exactly once.
    pub fn take(&mut self, key: LogKey) -> Option<PageContainer> {
        if key.generation != self.generation {
            return None;
        }
        self.entries.get_mut(key.index)?.take()
    }

    /// Iterates staged containers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &PageContainer)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|c| (i, c)))
    }

    /// Iterates staged containers mutably in insertion order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut PageContainer)> {
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(i, e)| e.as_mut().map(|c| (i, c)))
    }

    /// Drops every staged container.
    pub fn clear(&mut self) {
        trace!(entries = self.entries.len(), "til.clear");
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::IndirectPage;

    fn container() -> PageContainer {
        PageContainer::mirrored(Page::Indirect(IndirectPage::empty()))
    }

    #[test]
    fn put_assigns_insertion_ordered_keys() {
        let mut log = IntentLog::new(1);
        let mut a = PageRef::unset();
        let mut b = PageRef::unset();
        let ka = log.put(&mut a, container());
        let kb = log.put(&mut b, container());
        assert_eq!(ka.index, 0);
        assert_eq!(kb.index, 1);
        assert_eq!(a.log_key(), Some(ka));
        assert!(log.get(&a).is_some());
        assert!(log.get(&b).is_some());

        let order: Vec<usize> = log.iter().map(|(i, _)| i).collect();
        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    fn stale_generation_keys_do_not_resolve() {
        let mut old = IntentLog::new(1);
        let mut reference = PageRef::unset();
        old.put(&mut reference, container());

        let fresh = IntentLog::new(2);
        assert!(fresh.get(&reference).is_none());
        assert!(old.get(&reference).is_some());
    }

    #[test]
    fn take_empties_the_slot_once() {
        let mut log = IntentLog::new(1);
        let mut reference = PageRef::unset();
        let key = log.put(&mut reference, container());
        assert!(log.take(key).is_some());
        assert!(log.take(key).is_none());
        assert!(log.is_empty());
    }
}
