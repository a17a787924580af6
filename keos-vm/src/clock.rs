//! A circular queue for the one-bit clock.
//!
//! `ClockQueue<K, V>` keeps its entries in insertion order and lets the
//! caller look at the entry under the clock hand ([`ClockQueue::front`]),
//! give it a second chance by moving it behind every other entry
//! ([`ClockQueue::rotate`]), or take it out. Entries can also be removed by
//! key from anywhere in the queue, which is what happens when a resident page
//! is destroyed.
//!
//! # Example
//! ```
//! use keos_vm::clock::ClockQueue;
//!
//! let mut clock: ClockQueue<u32, &str> = ClockQueue::new();
//! clock.push_back(1, "one");
//! clock.push_back(2, "two");
//!
//! // Entry 1 was referenced: give it a second chance.
//! clock.rotate();
//! assert_eq!(clock.front().map(|(k, _)| *k), Some(2));
//! assert_eq!(clock.remove(&2), Some("two"));
//! assert_eq!(clock.keys(), [1]);
//! ```
use alloc::{collections::BTreeMap, vec::Vec};

struct Node<K: Clone, V> {
    v: V,
    prev: Option<K>,
    next: Option<K>,
}

/// A keyed queue with O(log n) removal of arbitrary entries.
pub struct ClockQueue<K: Ord + Clone, V> {
    inner: BTreeMap<K, Node<K, V>>,

    // Clock order
    head: Option<K>,
    tail: Option<K>,
}

impl<K: Ord + Clone, V> Default for ClockQueue<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, V> ClockQueue<K, V> {
    // Link the node of key behind the current tail.
    fn attach(&mut self, k: K) {
        let ptail = self.tail.replace(k.clone());
        if let Some(last) = ptail.as_ref().and_then(|tail| self.inner.get_mut(tail)) {
            last.next = Some(k.clone());
        } else {
            self.head = Some(k.clone());
        }
        if let Some(node) = self.inner.get_mut(&k) {
            node.prev = ptail;
            node.next = None;
        }
    }

    // Unlink a node whose neighbors are prev and next.
    fn detach(&mut self, prev: Option<K>, next: Option<K>) {
        if let Some(node) = next.as_ref().and_then(|next| self.inner.get_mut(next)) {
            node.prev = prev.clone();
        } else {
            self.tail = prev.clone();
        }

        if let Some(node) = prev.as_ref().and_then(|prev| self.inner.get_mut(prev)) {
            node.next = next;
        } else {
            self.head = next;
        }
    }

    /// Makes a new, empty `ClockQueue`.
    pub const fn new() -> Self {
        Self {
            inner: BTreeMap::new(),
            head: None,
            tail: None,
        }
    }

    /// Number of entries in the queue.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the queue holds no entry.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Inserts `v` at the back of the queue.
    ///
    /// If the key was present, the old value is replaced and returned, and the
    /// entry moves to the back.
    pub fn push_back(&mut self, k: K, v: V) -> Option<V> {
        let old = self.remove(&k);
        self.inner.insert(
            k.clone(),
            Node {
                v,
                prev: None,
                next: None,
            },
        );
        self.attach(k);
        old
    }

    /// Returns the entry under the clock hand.
    pub fn front(&self) -> Option<(&K, &V)> {
        let head = self.head.as_ref()?;
        self.inner.get_key_value(head).map(|(k, node)| (k, &node.v))
    }

    /// Moves the entry under the clock hand to the back of the queue.
    pub fn rotate(&mut self) {
        if let Some(head) = self.head.clone() {
            if let Some(node) = self.inner.get_mut(&head) {
                let (prev, next) = (node.prev.take(), node.next.take());
                self.detach(prev, next);
                self.attach(head);
            }
        }
    }

    /// Returns a reference to the value of `k`, without moving the clock hand.
    pub fn get(&self, k: &K) -> Option<&V> {
        self.inner.get(k).map(|node| &node.v)
    }

    /// Returns a mutable reference to the value of `k`.
    pub fn get_mut(&mut self, k: &K) -> Option<&mut V> {
        self.inner.get_mut(k).map(|node| &mut node.v)
    }

    /// Removes a key from the queue, returning the stored value if the
    /// key was previously in the queue.
    pub fn remove(&mut self, k: &K) -> Option<V> {
        let mut node = self.inner.remove(k)?;
        self.detach(node.prev.take(), node.next.take());
        Some(node.v)
    }

    /// Keys in clock order, starting from the clock hand.
    pub fn keys(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.inner.len());
        let mut cursor = self.head.clone();
        while let Some(k) = cursor {
            cursor = self.inner.get(&k).and_then(|node| node.next.clone());
            keys.push(k);
        }
        keys
    }
}
