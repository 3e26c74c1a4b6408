//! Access-ordered key map
//!
//! An intrusive doubly-linked list threaded through a slot vector, indexed by
//! an `FxHashMap`. The head is the most recently used entry, the tail the
//! least recently used one. Lookups that refresh recency only relink nodes and
//! never allocate.

use crate::{GroupingKey, LaneIndex};
use rustc_hash::FxHashMap;

type SlotId = usize;

#[derive(Debug)]
struct Node {
    key: GroupingKey,
    lane: LaneIndex,
    prev: Option<SlotId>,
    next: Option<SlotId>,
}

/// Map from grouping key to lane, ordered by last access
#[derive(Debug, Default)]
pub(crate) struct AccessOrder {
    /// Node storage; `None` marks a free slot
    slots: Vec<Option<Node>>,

    /// Reusable slot ids
    free: Vec<SlotId>,

    /// Key to slot lookup
    index: FxHashMap<GroupingKey, SlotId>,

    /// Most recently used
    head: Option<SlotId>,

    /// Least recently used
    tail: Option<SlotId>,
}

impl AccessOrder {
    /// Create an empty map with room for `capacity` entries
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            index: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
            head: None,
            tail: None,
        }
    }

    /// Number of live entries
    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    /// Look up `key` and mark it most recently used
    pub(crate) fn get_refresh(&mut self, key: GroupingKey) -> Option<LaneIndex> {
        let id = *self.index.get(&key)?;
        self.unlink(id);
        self.push_front(id);
        self.node(id).map(|node| node.lane)
    }

    /// Look up `key` without touching its recency
    pub(crate) fn peek(&self, key: GroupingKey) -> Option<LaneIndex> {
        let id = *self.index.get(&key)?;
        self.node(id).map(|node| node.lane)
    }

    /// Insert `key` as the most recently used entry.
    ///
    /// An existing entry for `key` is replaced and its previous lane returned.
    pub(crate) fn insert(&mut self, key: GroupingKey, lane: LaneIndex) -> Option<LaneIndex> {
        if let Some(&id) = self.index.get(&key) {
            let previous = self.node_mut(id).map(|node| std::mem::replace(&mut node.lane, lane));
            self.unlink(id);
            self.push_front(id);
            return previous;
        }

        let node = Node {
            key,
            lane,
            prev: None,
            next: None,
        };
        let id = match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(node);
                id
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };

        self.index.insert(key, id);
        self.push_front(id);
        None
    }

    /// Remove and return the least recently used entry
    pub(crate) fn pop_lru(&mut self) -> Option<(GroupingKey, LaneIndex)> {
        let id = self.tail?;
        self.unlink(id);
        let node = self.slots[id].take()?;
        self.free.push(id);
        self.index.remove(&node.key);
        Some((node.key, node.lane))
    }

    /// Remove every entry
    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
    }

    /// Entries from most to least recently used
    pub(crate) fn iter(&self) -> Iter<'_> {
        Iter {
            map: self,
            cursor: self.head,
        }
    }

    fn node(&self, id: SlotId) -> Option<&Node> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: SlotId) -> Option<&mut Node> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    fn unlink(&mut self, id: SlotId) {
        let (prev, next) = match self.node(id) {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(node) = self.node_mut(p) {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(node) = self.node_mut(id) {
            node.prev = None;
            node.next = None;
        }
    }

    fn push_front(&mut self, id: SlotId) {
        let old_head = self.head;
        if let Some(node) = self.node_mut(id) {
            node.prev = None;
            node.next = old_head;
        }
        match old_head {
            Some(h) => {
                if let Some(node) = self.node_mut(h) {
                    node.prev = Some(id);
                }
            }
            None => self.tail = Some(id),
        }
        self.head = Some(id);
    }
}

#[cfg(test)]
impl AccessOrder {
    fn new() -> Self {
        Self::default()
    }

    fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn contains(&self, key: GroupingKey) -> bool {
        self.index.contains_key(&key)
    }

    fn peek_lru(&self) -> Option<GroupingKey> {
        self.tail.and_then(|id| self.node(id)).map(|node| node.key)
    }
}

/// Iterator over `(key, lane)` pairs from most to least recently used
pub(crate) struct Iter<'a> {
    map: &'a AccessOrder,
    cursor: Option<SlotId>,
}

impl Iterator for Iter<'_> {
    type Item = (GroupingKey, LaneIndex);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.map.node(self.cursor?)?;
        self.cursor = node.next;
        Some((node.key, node.lane))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(map: &AccessOrder) -> Vec<GroupingKey> {
        map.iter().map(|(key, _)| key).collect()
    }

    #[test]
    fn test_insert_and_peek() {
        let mut map = AccessOrder::new();
        assert!(map.is_empty());

        assert_eq!(map.insert(7, 1), None);
        assert_eq!(map.insert(8, 2), None);

        assert_eq!(map.len(), 2);
        assert_eq!(map.peek(7), Some(1));
        assert_eq!(map.peek(8), Some(2));
        assert_eq!(map.peek(9), None);
    }

    #[test]
    fn test_recency_order() {
        let mut map = AccessOrder::new();
        map.insert(1, 0);
        map.insert(2, 0);
        map.insert(3, 0);
        assert_eq!(keys(&map), vec![3, 2, 1]);

        // Refresh moves to the front
        assert_eq!(map.get_refresh(1), Some(0));
        assert_eq!(keys(&map), vec![1, 3, 2]);

        // Peek does not
        map.peek(2);
        assert_eq!(map.peek_lru(), Some(2));
    }

    #[test]
    fn test_pop_lru() {
        let mut map = AccessOrder::new();
        map.insert(1, 10);
        map.insert(2, 20);
        map.insert(3, 30);
        map.get_refresh(1);

        assert_eq!(map.pop_lru(), Some((2, 20)));
        assert_eq!(map.pop_lru(), Some((3, 30)));
        assert_eq!(map.pop_lru(), Some((1, 10)));
        assert_eq!(map.pop_lru(), None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_slot_reuse() {
        let mut map = AccessOrder::with_capacity(2);
        map.insert(1, 0);
        map.insert(2, 1);
        map.pop_lru();
        map.insert(3, 2);

        // Freed slot is recycled instead of growing storage
        assert_eq!(map.slots.len(), 2);
        assert_eq!(keys(&map), vec![3, 2]);
        assert!(!map.contains(1));
    }

    #[test]
    fn test_insert_existing_replaces_and_refreshes() {
        let mut map = AccessOrder::new();
        map.insert(1, 0);
        map.insert(2, 1);

        assert_eq!(map.insert(1, 4), Some(0));
        assert_eq!(map.len(), 2);
        assert_eq!(map.peek(1), Some(4));
        assert_eq!(keys(&map), vec![1, 2]);
    }

    #[test]
    fn test_single_entry_unlink() {
        let mut map = AccessOrder::new();
        map.insert(5, 3);
        assert_eq!(map.get_refresh(5), Some(3));
        assert_eq!(map.peek_lru(), Some(5));
        assert_eq!(map.pop_lru(), Some((5, 3)));
        assert_eq!(map.head, None);
        assert_eq!(map.tail, None);
    }

    #[test]
    fn test_clear() {
        let mut map = AccessOrder::new();
        for key in 0..10 {
            map.insert(key, key as LaneIndex % 3);
        }
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.iter().count(), 0);
        assert_eq!(map.pop_lru(), None);
    }
}
