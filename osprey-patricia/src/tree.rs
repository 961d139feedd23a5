// Patricia tree
//
// Each node tests one bit (`bit`) of the key. Nodes carrying a prefix sit
// at `bit == prefix.bitlen()`; glue nodes carry no prefix and always have
// two children. Freed arena slots are recycled through a free list.

use crate::prefix::Prefix;
use crate::{TrieError, TrieResult, MAX_KEY_BITS};
use serde::Serialize;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Handle to a node in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug)]
struct Node<V> {
    bit: u16,
    prefix: Option<Prefix>,
    value: Option<V>,
    parent: Option<NodeId>,
    left: Option<NodeId>,
    right: Option<NodeId>,
}

impl<V> Node<V> {
    fn new(bit: u16, prefix: Option<Prefix>, value: Option<V>) -> Self {
        Self {
            bit,
            prefix,
            value,
            parent: None,
            left: None,
            right: None,
        }
    }
}

/// Tree statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TreeStats {
    pub max_bits: u16,
    /// Live nodes, glue included
    pub nodes: usize,
    /// Nodes carrying a prefix
    pub prefixes: usize,
    pub searches: u64,
    pub found: u64,
}

/// Longest-prefix-match tree over keys of up to `max_bits` bits
#[derive(Debug)]
pub struct PatriciaTree<V> {
    max_bits: u16,
    root: Option<NodeId>,
    nodes: Vec<Node<V>>,
    free: Vec<usize>,
    prefixes: usize,
    searches: AtomicU64,
    found: AtomicU64,
}

impl<V> PatriciaTree<V> {
    pub fn new(max_bits: u16) -> TrieResult<Self> {
        if max_bits == 0 || max_bits > MAX_KEY_BITS {
            return Err(TrieError::InvalidWidth(max_bits));
        }
        Ok(Self {
            max_bits,
            root: None,
            nodes: Vec::new(),
            free: Vec::new(),
            prefixes: 0,
            searches: AtomicU64::new(0),
            found: AtomicU64::new(0),
        })
    }

    pub fn max_bits(&self) -> u16 {
        self.max_bits
    }

    pub fn len(&self) -> usize {
        self.prefixes
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes == 0
    }

    fn node(&self, id: NodeId) -> &Node<V> {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node<V> {
        &mut self.nodes[id.0]
    }

    fn alloc(&mut self, node: Node<V>) -> NodeId {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                NodeId(slot)
            }
            None => {
                self.nodes.push(node);
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    fn release(&mut self, id: NodeId) {
        let node = self.node_mut(id);
        node.prefix = None;
        node.value = None;
        node.parent = None;
        node.left = None;
        node.right = None;
        self.free.push(id.0);
    }

    /// Child of `node` selected by bit `node.bit` of `key`
    fn child_towards(&self, id: NodeId, key: &Prefix) -> Option<NodeId> {
        let node = self.node(id);
        if node.bit < self.max_bits && key.bit(node.bit) {
            node.right
        } else {
            node.left
        }
    }

    /// Point whichever parent link referenced `old` at `new`
    fn replace_link(&mut self, parent: Option<NodeId>, old: NodeId, new: Option<NodeId>) {
        match parent {
            None => self.root = new,
            Some(p) => {
                let parent = self.node_mut(p);
                if parent.right == Some(old) {
                    parent.right = new;
                } else {
                    parent.left = new;
                }
            }
        }
    }

    fn check_width(&self, prefix: &Prefix) -> TrieResult<()> {
        if prefix.bitlen() > self.max_bits {
            return Err(TrieError::PrefixTooLong {
                bits: prefix.bitlen(),
                max: self.max_bits,
            });
        }
        Ok(())
    }

    /// Insert `prefix`, overwriting the payload of an existing exact node
    pub fn insert(&mut self, prefix: Prefix, value: V) -> TrieResult<NodeId> {
        self.check_width(&prefix)?;
        let bitlen = prefix.bitlen();

        let Some(root) = self.root else {
            let id = self.alloc(Node::new(bitlen, Some(prefix), Some(value)));
            self.root = Some(id);
            self.prefixes += 1;
            return Ok(id);
        };

        // Walk down to the closest existing prefix
        let mut current = root;
        loop {
            let node = self.node(current);
            if node.bit >= bitlen && node.prefix.is_some() {
                break;
            }
            match self.child_towards(current, &prefix) {
                Some(next) => current = next,
                None => break,
            }
        }

        let test = self
            .node(current)
            .prefix
            .ok_or(TrieError::Corrupted("descent ended on a glue node"))?;
        let check_bit = self.node(current).bit.min(bitlen);
        let differ_bit = prefix.first_difference(&test, check_bit);

        // Climb back to where the new node belongs
        while let Some(parent) = self.node(current).parent {
            if self.node(parent).bit < differ_bit {
                break;
            }
            current = parent;
        }

        if differ_bit == bitlen && self.node(current).bit == bitlen {
            if self.node(current).prefix.is_none() {
                self.prefixes += 1;
            }
            let node = self.node_mut(current);
            node.prefix = Some(prefix);
            node.value = Some(value);
            trace!(%prefix, "Updated existing node");
            return Ok(current);
        }

        let new_id = self.alloc(Node::new(bitlen, Some(prefix), Some(value)));
        self.prefixes += 1;

        if self.node(current).bit == differ_bit {
            // New node becomes a direct child
            self.node_mut(new_id).parent = Some(current);
            let go_right = {
                let node = self.node(current);
                node.bit < self.max_bits && prefix.bit(node.bit)
            };
            let node = self.node_mut(current);
            if go_right {
                node.right = Some(new_id);
            } else {
                node.left = Some(new_id);
            }
            return Ok(new_id);
        }

        let old_parent = self.node(current).parent;

        if bitlen == differ_bit {
            // New node sits above `current`
            let go_right = bitlen < self.max_bits && test.bit(bitlen);
            {
                let new_node = self.node_mut(new_id);
                if go_right {
                    new_node.right = Some(current);
                } else {
                    new_node.left = Some(current);
                }
                new_node.parent = old_parent;
            }
            self.replace_link(old_parent, current, Some(new_id));
            self.node_mut(current).parent = Some(new_id);
        } else {
            // Diverging branches need a glue node
            let glue = self.alloc(Node::new(differ_bit, None, None));
            let new_on_right = differ_bit < self.max_bits && prefix.bit(differ_bit);
            {
                let glue_node = self.node_mut(glue);
                glue_node.parent = old_parent;
                if new_on_right {
                    glue_node.right = Some(new_id);
                    glue_node.left = Some(current);
                } else {
                    glue_node.right = Some(current);
                    glue_node.left = Some(new_id);
                }
            }
            self.node_mut(new_id).parent = Some(glue);
            self.replace_link(old_parent, current, Some(glue));
            self.node_mut(current).parent = Some(glue);
        }

        Ok(new_id)
    }

    fn find_exact_node(&self, prefix: &Prefix) -> Option<NodeId> {
        let bitlen = prefix.bitlen();
        let mut current = self.root?;
        while self.node(current).bit < bitlen {
            current = self.child_towards(current, prefix)?;
        }
        let node = self.node(current);
        if node.bit > bitlen {
            return None;
        }
        match node.prefix {
            Some(stored) if stored.bitlen() == bitlen && stored.matches_under(prefix, bitlen) => {
                Some(current)
            }
            _ => None,
        }
    }

    /// Payload of the node holding exactly `prefix`
    pub fn search_exact(&self, prefix: &Prefix) -> Option<&V> {
        self.searches.fetch_add(1, Ordering::Relaxed);
        let id = self.find_exact_node(prefix)?;
        self.found.fetch_add(1, Ordering::Relaxed);
        self.node(id).value.as_ref()
    }

    /// Node holding the longest prefix that covers `key`
    pub fn search_best_node(&self, key: &Prefix) -> Option<NodeId> {
        self.searches.fetch_add(1, Ordering::Relaxed);
        let bitlen = key.bitlen();
        let mut stack: SmallVec<[NodeId; 32]> = SmallVec::new();

        let mut cursor = self.root;
        while let Some(id) = cursor {
            let node = self.node(id);
            if node.bit >= bitlen {
                // Inclusive: the node at the key's own length still counts
                if node.prefix.is_some() {
                    stack.push(id);
                }
                break;
            }
            if node.prefix.is_some() {
                stack.push(id);
            }
            cursor = self.child_towards(id, key);
        }

        while let Some(id) = stack.pop() {
            if let Some(stored) = &self.node(id).prefix {
                if stored.bitlen() <= bitlen && stored.matches_under(key, stored.bitlen()) {
                    self.found.fetch_add(1, Ordering::Relaxed);
                    return Some(id);
                }
            }
        }
        None
    }

    /// Payload of the longest prefix covering `key`
    pub fn search_best(&self, key: &Prefix) -> Option<&V> {
        let id = self.search_best_node(key)?;
        self.node(id).value.as_ref()
    }

    /// Prefix and payload stored at `id`
    pub fn get(&self, id: NodeId) -> Option<(&Prefix, &V)> {
        let node = self.nodes.get(id.0)?;
        match (&node.prefix, &node.value) {
            (Some(prefix), Some(value)) => Some((prefix, value)),
            _ => None,
        }
    }

    /// Remove the prefix stored at `id`, returning its payload
    ///
    /// Glue nodes and stale handles are ignored.
    pub fn remove_node(&mut self, id: NodeId) -> Option<V> {
        let node = self.nodes.get(id.0)?;
        node.prefix?;
        let (left, right, parent) = (node.left, node.right, node.parent);

        if left.is_some() && right.is_some() {
            // Keep as glue
            self.prefixes -= 1;
            let node = self.node_mut(id);
            node.prefix = None;
            return node.value.take();
        }

        let value = self.node_mut(id).value.take();
        self.prefixes -= 1;

        match left.or(right) {
            None => {
                self.release(id);
                let Some(parent_id) = parent else {
                    self.root = None;
                    return value;
                };

                let sibling = {
                    let parent = self.node_mut(parent_id);
                    if parent.right == Some(id) {
                        parent.right = None;
                        parent.left
                    } else {
                        parent.left = None;
                        parent.right
                    }
                };

                // A glue parent left with one child is redundant
                if self.node(parent_id).prefix.is_none() {
                    let grand = self.node(parent_id).parent;
                    self.replace_link(grand, parent_id, sibling);
                    if let Some(child) = sibling {
                        self.node_mut(child).parent = grand;
                    }
                    self.release(parent_id);
                }
            }
            Some(child) => {
                self.node_mut(child).parent = parent;
                self.replace_link(parent, id, Some(child));
                self.release(id);
            }
        }
        value
    }

    /// Remove an exact prefix, returning its payload
    pub fn remove(&mut self, prefix: &Prefix) -> Option<V> {
        let id = self.find_exact_node(prefix)?;
        self.remove_node(id)
    }

    /// Visit every stored prefix: left subtree, node, right subtree
    pub fn walk_inorder<F>(&self, mut visit: F)
    where
        F: FnMut(NodeId, &Prefix, &V),
    {
        let mut stack: Vec<NodeId> = Vec::new();
        let mut cursor = self.root;
        while cursor.is_some() || !stack.is_empty() {
            while let Some(id) = cursor {
                stack.push(id);
                cursor = self.node(id).left;
            }
            let Some(id) = stack.pop() else { break };
            let node = self.node(id);
            if let (Some(prefix), Some(value)) = (&node.prefix, &node.value) {
                visit(id, prefix, value);
            }
            cursor = node.right;
        }
    }

    pub fn stats(&self) -> TreeStats {
        TreeStats {
            max_bits: self.max_bits,
            nodes: self.nodes.len() - self.free.len(),
            prefixes: self.prefixes,
            searches: self.searches.load(Ordering::Relaxed),
            found: self.found.load(Ordering::Relaxed),
        }
    }

    /// Drop every node
    pub fn clear(&mut self) {
        self.root = None;
        self.nodes.clear();
        self.free.clear();
        self.prefixes = 0;
    }
}
