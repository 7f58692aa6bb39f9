//! Open/closed bookkeeping for graph searches: a fixed-capacity node pool
//! hash-bucketed by polygon reference, and a binary min-heap keyed on total
//! cost.

use bevy::prelude::Vec3;
use bitflags::bitflags;

use crate::mesh::PolyRef;

pub type NodeIndex = u16;

const NULL_INDEX: NodeIndex = NodeIndex::MAX;

/// Crossing-side states a single polygon can be reached through; one node
/// per `(reference, state)` pair.
pub const MAX_STATES_PER_NODE: u8 = 4;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u8 {
        const OPEN = 0x01;
        const CLOSED = 0x02;
        /// The path from the parent is not a link walk (raycast shortcut).
        const PARENT_DETACHED = 0x04;
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub position: Vec3,
    /// Accumulated cost from the search start.
    pub cost: f32,
    /// Cost plus heuristic; the heap key.
    pub total: f32,
    pub parent: Option<NodeIndex>,
    pub state: u8,
    pub flags: NodeFlags,
    pub reference: PolyRef,
}

impl Node {
    fn new(reference: PolyRef, state: u8) -> Self {
        Self {
            position: Vec3::ZERO,
            cost: 0.0,
            total: 0.0,
            parent: None,
            state,
            flags: NodeFlags::empty(),
            reference,
        }
    }
}

/// Finalizing bit-mix over the reference bits; buckets stay balanced even
/// though tile bits dominate the high end.
#[inline]
fn hash_ref(reference: PolyRef) -> u32 {
    let mut a = reference.0;
    a = a.wrapping_add(!(a << 15));
    a ^= a >> 10;
    a = a.wrapping_add(a << 3);
    a ^= a >> 6;
    a = a.wrapping_add(!(a << 11));
    a ^= a >> 16;
    a
}

pub struct NodePool {
    nodes: Vec<Node>,
    bucket_heads: Vec<NodeIndex>,
    next_in_bucket: Vec<NodeIndex>,
    max_nodes: usize,
    hash_mask: u32,
}

impl NodePool {
    pub fn new(max_nodes: usize) -> Self {
        let max_nodes = max_nodes.min(NULL_INDEX as usize);
        let bucket_count = (max_nodes / 4).max(1).next_power_of_two();

        Self {
            nodes: Vec::with_capacity(max_nodes),
            bucket_heads: vec![NULL_INDEX; bucket_count],
            next_in_bucket: Vec::with_capacity(max_nodes),
            max_nodes,
            hash_mask: bucket_count as u32 - 1,
        }
    }

    /// Drops every node; allocation starts over. Capacity is kept.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.next_in_bucket.clear();
        self.bucket_heads.fill(NULL_INDEX);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    #[inline]
    pub fn get(&self, index: NodeIndex) -> &Node {
        &self.nodes[index as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, index: NodeIndex) -> &mut Node {
        &mut self.nodes[index as usize]
    }

    /// Existing node for `(reference, state)`, if allocated.
    pub fn find(&self, reference: PolyRef, state: u8) -> Option<NodeIndex> {
        let bucket = (hash_ref(reference) & self.hash_mask) as usize;

        let mut index = self.bucket_heads[bucket];
        while index != NULL_INDEX {
            let node = &self.nodes[index as usize];
            if node.reference == reference && node.state == state {
                return Some(index);
            }
            index = self.next_in_bucket[index as usize];
        }

        None
    }

    /// Any node for `reference`, regardless of crossing-side state.
    pub fn find_any(&self, reference: PolyRef) -> Option<NodeIndex> {
        let bucket = (hash_ref(reference) & self.hash_mask) as usize;

        let mut index = self.bucket_heads[bucket];
        while index != NULL_INDEX {
            if self.nodes[index as usize].reference == reference {
                return Some(index);
            }
            index = self.next_in_bucket[index as usize];
        }

        None
    }

    /// Existing node or a fresh allocation. `None` when the pool is full;
    /// callers surface that as an out-of-nodes result flag.
    pub fn get_or_create(&mut self, reference: PolyRef, state: u8) -> Option<NodeIndex> {
        debug_assert!(state < MAX_STATES_PER_NODE);

        if let Some(index) = self.find(reference, state) {
            return Some(index);
        }

        if self.nodes.len() >= self.max_nodes {
            return None;
        }

        let index = self.nodes.len() as NodeIndex;
        let bucket = (hash_ref(reference) & self.hash_mask) as usize;

        self.nodes.push(Node::new(reference, state));
        self.next_in_bucket.push(self.bucket_heads[bucket]);
        self.bucket_heads[bucket] = index;

        Some(index)
    }
}

/// Binary min-heap of `(total cost, node index)`.
#[derive(Default)]
pub struct NodeQueue {
    heap: Vec<(f32, NodeIndex)>,
}

impl NodeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn push(&mut self, total: f32, index: NodeIndex) {
        self.heap.push((total, index));
        self.bubble_up(self.heap.len() - 1);
    }

    pub fn pop(&mut self) -> Option<NodeIndex> {
        if self.heap.is_empty() {
            return None;
        }

        let top = self.heap.swap_remove(0).1;
        if !self.heap.is_empty() {
            self.trickle_down(0);
        }

        Some(top)
    }

    /// Re-keys `index` after its total cost decreased.
    pub fn modify(&mut self, index: NodeIndex, total: f32) {
        if let Some(position) = self.heap.iter().position(|&(_, i)| i == index) {
            self.heap[position].0 = total;
            self.bubble_up(position);
        }
    }

    fn bubble_up(&mut self, mut position: usize) {
        while position > 0 {
            let parent = (position - 1) / 2;
            if self.heap[position].0 >= self.heap[parent].0 {
                break;
            }
            self.heap.swap(position, parent);
            position = parent;
        }
    }

    fn trickle_down(&mut self, mut position: usize) {
        loop {
            let left = position * 2 + 1;
            let right = position * 2 + 2;
            let mut smallest = position;

            if left < self.heap.len() && self.heap[left].0 < self.heap[smallest].0 {
                smallest = left;
            }
            if right < self.heap.len() && self.heap[right].0 < self.heap[smallest].0 {
                smallest = right;
            }
            if smallest == position {
                break;
            }

            self.heap.swap(position, smallest);
            position = smallest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_allocates_one_node_per_state() {
        let mut pool = NodePool::new(16);
        let reference = PolyRef(42);

        let a = pool.get_or_create(reference, 0).unwrap();
        let b = pool.get_or_create(reference, 1).unwrap();
        assert_ne!(a, b);

        // Same key returns the same node.
        assert_eq!(pool.get_or_create(reference, 0), Some(a));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn pool_refuses_allocation_when_full() {
        let mut pool = NodePool::new(2);

        assert!(pool.get_or_create(PolyRef(1), 0).is_some());
        assert!(pool.get_or_create(PolyRef(2), 0).is_some());
        assert!(pool.get_or_create(PolyRef(3), 0).is_none());

        pool.clear();
        assert!(pool.get_or_create(PolyRef(3), 0).is_some());
    }

    #[test]
    fn queue_pops_in_cost_order() {
        let mut queue = NodeQueue::new();
        queue.push(3.0, 3);
        queue.push(1.0, 1);
        queue.push(2.0, 2);

        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn queue_modify_rebubbles() {
        let mut queue = NodeQueue::new();
        queue.push(5.0, 1);
        queue.push(6.0, 2);
        queue.push(7.0, 3);

        queue.modify(3, 1.0);
        assert_eq!(queue.pop(), Some(3));
    }
}
