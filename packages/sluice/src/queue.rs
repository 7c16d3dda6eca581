//! Queue with positionally reserved nested sub-queues.
//!
//! A [`NestedQueue`] is a sequence of slots, each holding either an element or a nested queue.
//! Nested queues are reserved at the tail with [`NestedQueue::add_nested`] and can be filled
//! later, out of call order, while keeping their position: [`NestedQueue::remove_first`] flattens
//! the tree depth-first and will not return anything past a nested queue which is still empty
//! and open.
//!
//! This is what lets a channel deliver values in call order even when some of them are produced
//! with a delay: the delayed value reserves its slot immediately and fills it when it arrives.
//!
//! ```rust
//! use sluice::queue::NestedQueue;
//!
//! let mut queue = NestedQueue::new();
//! queue.add("a").unwrap();
//! let reserved = queue.add_nested().unwrap();
//! queue.add("c").unwrap();
//! queue.close();
//!
//! // "a" is ready, but "c" waits behind the reserved slot
//! assert_eq!(queue.remove_first(), Some("a"));
//! assert_eq!(queue.remove_first(), None);
//!
//! let mut nested = queue.nested(reserved).unwrap();
//! nested.add("b").unwrap();
//! nested.close();
//!
//! let mut out = Vec::new();
//! queue.move_to(&mut out);
//! assert_eq!(out, ["b", "c"]);
//! ```

use crate::error::QueueError;
use std::collections::VecDeque;

// nodes live in an index arena owned by the root. freed indices are reused, with a generation
// counter so stale QueueIds are detected instead of aliasing a newer queue.
const ROOT: usize = 0;

/// Queue of `E` supporting nested sub-queues.
///
/// Not itself concurrent; a channel keeps one behind its mutex.
#[derive(Debug)]
pub struct NestedQueue<E> {
    nodes: Vec<Node<E>>,
    free: Vec<usize>,
    // total number of elements, across all nested queues
    len: usize,
}

#[derive(Debug)]
struct Node<E> {
    slots: VecDeque<Slot<E>>,
    closed: bool,
    live: bool,
    generation: u32,
}

#[derive(Debug)]
enum Slot<E> {
    Elem(E),
    Nested(QueueId),
}

/// Handle to a nested queue within a [`NestedQueue`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct QueueId {
    idx: usize,
    generation: u32,
}

// what removal would find when looking into a queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Probe {
    // an element is available
    Ready,
    // nothing is available yet, but may become so
    Blocked,
    // empty and closed; the slot can be discarded
    Drained,
}

impl<E> Node<E> {
    fn new(generation: u32) -> Self {
        Node { slots: VecDeque::new(), closed: false, live: true, generation }
    }
}

impl<E> Default for NestedQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> NestedQueue<E> {
    /// Construct empty and open
    pub fn new() -> Self {
        NestedQueue { nodes: vec![Node::new(0)], free: Vec::new(), len: 0 }
    }

    /// Number of elements in this queue, including all nested queues
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether this queue and all its nested queues hold no elements
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether [`remove_first`](Self::remove_first) would return an element
    pub fn has_available(&self) -> bool {
        self.probe(ROOT) == Probe::Ready
    }

    /// Whether this queue was closed
    pub fn is_closed(&self) -> bool {
        self.nodes[ROOT].closed
    }

    /// Append an element
    pub fn add(&mut self, elem: E) -> Result<(), QueueError> {
        self.add_in(ROOT, elem)
    }

    /// Append all elements of an iterator
    ///
    /// Fails without adding anything if the queue is closed.
    pub fn add_all<I>(&mut self, elems: I) -> Result<(), QueueError>
    where
        I: IntoIterator<Item = E>,
    {
        self.add_all_in(ROOT, elems)
    }

    /// Reserve a nested queue at the current tail
    pub fn add_nested(&mut self) -> Result<QueueId, QueueError> {
        self.add_nested_in(ROOT)
    }

    /// Close this queue to further additions
    ///
    /// Idempotent. Removal is still possible.
    pub fn close(&mut self) {
        self.nodes[ROOT].closed = true;
    }

    /// Access a nested queue by id
    pub fn nested(&mut self, id: QueueId) -> Result<Nested<'_, E>, QueueError> {
        self.check(id)?;
        Ok(Nested { queue: self, idx: id.idx })
    }

    /// Remove the first available element
    ///
    /// Nested queues are flattened depth-first. Returns `None` if the queue is empty, or if the
    /// first slot is a nested queue which is empty and still open.
    pub fn remove_first(&mut self) -> Option<E> {
        let elem = self.remove_first_in(ROOT);
        if elem.is_some() {
            self.len -= 1;
        }
        elem
    }

    /// Move all currently available elements, in order, into `out`
    ///
    /// Returns the number of elements moved.
    pub fn move_to<C>(&mut self, out: &mut C) -> usize
    where
        C: Extend<E>,
    {
        let mut moved = 0;
        while let Some(elem) = self.remove_first() {
            out.extend(Some(elem));
            moved += 1;
        }
        moved
    }

    /// Remove all elements and nested queues
    ///
    /// Ids of removed nested queues become stale. Whether the queue is closed is unchanged.
    pub fn clear(&mut self) {
        self.nodes[ROOT].slots.clear();
        for idx in 1..self.nodes.len() {
            if self.nodes[idx].live {
                self.free_node(idx);
            }
        }
        self.len = 0;
    }

    fn check(&self, id: QueueId) -> Result<(), QueueError> {
        match self.nodes.get(id.idx) {
            Some(node) if node.live && node.generation == id.generation => Ok(()),
            _ => Err(QueueError::Removed),
        }
    }

    fn add_in(&mut self, idx: usize, elem: E) -> Result<(), QueueError> {
        let node = &mut self.nodes[idx];
        if node.closed {
            return Err(QueueError::Closed);
        }
        node.slots.push_back(Slot::Elem(elem));
        self.len += 1;
        Ok(())
    }

    fn add_all_in<I>(&mut self, idx: usize, elems: I) -> Result<(), QueueError>
    where
        I: IntoIterator<Item = E>,
    {
        let node = &mut self.nodes[idx];
        if node.closed {
            return Err(QueueError::Closed);
        }
        let before = node.slots.len();
        node.slots.extend(elems.into_iter().map(Slot::Elem));
        self.len += node.slots.len() - before;
        Ok(())
    }

    fn add_nested_in(&mut self, idx: usize) -> Result<QueueId, QueueError> {
        if self.nodes[idx].closed {
            return Err(QueueError::Closed);
        }
        let child = self.alloc_node();
        self.nodes[idx].slots.push_back(Slot::Nested(child));
        Ok(child)
    }

    fn alloc_node(&mut self) -> QueueId {
        if let Some(idx) = self.free.pop() {
            let node = &mut self.nodes[idx];
            debug_assert!(!node.live);
            debug_assert!(node.slots.is_empty());
            node.live = true;
            node.closed = false;
            QueueId { idx, generation: node.generation }
        } else {
            self.nodes.push(Node::new(0));
            QueueId { idx: self.nodes.len() - 1, generation: 0 }
        }
    }

    fn free_node(&mut self, idx: usize) {
        debug_assert_ne!(idx, ROOT);
        let node = &mut self.nodes[idx];
        node.slots.clear();
        node.live = false;
        node.generation = node.generation.wrapping_add(1);
        self.free.push(idx);
    }

    // depth-first removal within the node at idx. does not maintain self.len.
    fn remove_first_in(&mut self, idx: usize) -> Option<E> {
        loop {
            let child = match self.nodes[idx].slots.front()? {
                &Slot::Elem(_) => {
                    return match self.nodes[idx].slots.pop_front() {
                        Some(Slot::Elem(elem)) => Some(elem),
                        _ => unreachable!("front slot changed (internal bug)"),
                    };
                }
                &Slot::Nested(child) => child,
            };
            if let Some(elem) = self.remove_first_in(child.idx) {
                return Some(elem);
            }
            let child_node = &self.nodes[child.idx];
            if child_node.closed && child_node.slots.is_empty() {
                // drained: discard the slot and move on to the next sibling
                self.nodes[idx].slots.pop_front();
                self.free_node(child.idx);
            } else {
                return None;
            }
        }
    }

    fn probe(&self, idx: usize) -> Probe {
        let node = &self.nodes[idx];
        for slot in &node.slots {
            match slot {
                &Slot::Elem(_) => return Probe::Ready,
                &Slot::Nested(child) => match self.probe(child.idx) {
                    Probe::Drained => continue,
                    probe => return probe,
                },
            }
        }
        if node.closed {
            Probe::Drained
        } else {
            Probe::Blocked
        }
    }
}

/// Mutable view of a nested queue, see [`NestedQueue::nested`].
pub struct Nested<'a, E> {
    queue: &'a mut NestedQueue<E>,
    idx: usize,
}

impl<'a, E> Nested<'a, E> {
    /// Append an element to the nested queue
    pub fn add(&mut self, elem: E) -> Result<(), QueueError> {
        self.queue.add_in(self.idx, elem)
    }

    /// Append all elements of an iterator to the nested queue
    pub fn add_all<I>(&mut self, elems: I) -> Result<(), QueueError>
    where
        I: IntoIterator<Item = E>,
    {
        self.queue.add_all_in(self.idx, elems)
    }

    /// Reserve a queue nested within this one
    pub fn add_nested(&mut self) -> Result<QueueId, QueueError> {
        self.queue.add_nested_in(self.idx)
    }

    /// Close the nested queue to further additions; idempotent
    pub fn close(&mut self) {
        self.queue.nodes[self.idx].closed = true;
    }

    /// Whether the nested queue was closed
    pub fn is_closed(&self) -> bool {
        self.queue.nodes[self.idx].closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, seq::SliceRandom};
    use rand_pcg::Pcg32;

    #[test]
    fn reserved_slot_keeps_call_order() {
        let mut queue = NestedQueue::new();
        queue.add('a').unwrap();
        let nested = queue.add_nested().unwrap();
        queue.nested(nested).unwrap().add('b').unwrap();
        queue.add('c').unwrap();
        queue.close();
        queue.nested(nested).unwrap().close();
        let mut out = Vec::new();
        assert_eq!(queue.move_to(&mut out), 3);
        assert_eq!(out, ['a', 'b', 'c']);
        assert!(queue.is_empty());
    }

    #[test]
    fn open_empty_nested_blocks() {
        let mut queue = NestedQueue::new();
        let nested = queue.add_nested().unwrap();
        queue.add(2).unwrap();
        assert_eq!(queue.len(), 1);
        assert!(!queue.has_available());
        assert_eq!(queue.remove_first(), None);

        queue.nested(nested).unwrap().add(1).unwrap();
        assert!(queue.has_available());
        assert_eq!(queue.remove_first(), Some(1));
        // still open, so 2 stays behind it
        assert_eq!(queue.remove_first(), None);

        queue.nested(nested).unwrap().close();
        assert_eq!(queue.remove_first(), Some(2));
        assert_eq!(queue.remove_first(), None);
        assert_eq!(queue.nested(nested).err(), Some(QueueError::Removed));
    }

    #[test]
    fn closed_rejects_additions() {
        let mut queue = NestedQueue::new();
        let nested = queue.add_nested().unwrap();
        queue.close();
        queue.close();
        assert!(queue.is_closed());
        assert_eq!(queue.add(1), Err(QueueError::Closed));
        assert_eq!(queue.add_all(vec![1, 2]), Err(QueueError::Closed));
        assert_eq!(queue.add_nested(), Err(QueueError::Closed));

        // nested queue of a closed parent is still open
        let mut view = queue.nested(nested).unwrap();
        view.add(1).unwrap();
        view.close();
        view.close();
        assert!(view.is_closed());
        assert_eq!(view.add(2), Err(QueueError::Closed));
        assert_eq!(queue.remove_first(), Some(1));
    }

    #[test]
    fn deep_nesting_flattens_depth_first() {
        let mut queue = NestedQueue::new();
        let outer = queue.add_nested().unwrap();
        queue.add(5).unwrap();
        let inner = {
            let mut view = queue.nested(outer).unwrap();
            view.add(1).unwrap();
            let inner = view.add_nested().unwrap();
            view.add(4).unwrap();
            view.close();
            inner
        };
        {
            let mut view = queue.nested(inner).unwrap();
            view.add_all(vec![2, 3]).unwrap();
            view.close();
        }
        let mut out = Vec::new();
        queue.move_to(&mut out);
        assert_eq!(out, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn clear_invalidates_nested() {
        let mut queue = NestedQueue::new();
        queue.add(1).unwrap();
        let nested = queue.add_nested().unwrap();
        queue.nested(nested).unwrap().add(2).unwrap();
        assert_eq!(queue.len(), 2);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.nested(nested).err(), Some(QueueError::Removed));
        assert_eq!(queue.remove_first(), None);

        // freed indices are reused without aliasing the stale id
        let reused = queue.add_nested().unwrap();
        assert_eq!(reused.idx, nested.idx);
        assert_ne!(reused, nested);
        assert!(queue.nested(nested).is_err());
        assert!(queue.nested(reused).is_ok());
    }

    // stochastic test: values reserved in call order and landed in random order always come out
    // in call order.
    #[test]
    fn random_landing_order() {
        for seed in 0..50 {
            let mut rng = Pcg32::seed_from_u64(seed);
            let mut queue = NestedQueue::new();
            let mut reserved = Vec::new();
            let mut out = Vec::new();
            let count = rng.gen_range(1..200);
            for i in 0..count {
                if rng.gen_bool(0.5) {
                    queue.add(i).unwrap();
                } else {
                    reserved.push((queue.add_nested().unwrap(), i));
                }
                if rng.gen_bool(0.1) {
                    queue.move_to(&mut out);
                }
            }
            queue.close();
            reserved.shuffle(&mut rng);
            for (id, i) in reserved {
                let mut view = queue.nested(id).unwrap();
                view.add(i).unwrap();
                view.close();
                if rng.gen_bool(0.3) {
                    queue.move_to(&mut out);
                }
            }
            queue.move_to(&mut out);
            assert_eq!(out, (0..count).collect::<Vec<_>>(), "seed {}", seed);
            assert!(queue.is_empty());
        }
    }
}
