//! Copy-on-write B+tree over an abstract page store.
//!
//! The tree keeps nothing in memory but the root page number. Every mutation
//! rebuilds the touched nodes bottom-up into freshly allocated pages and
//! retires the pages they replace; committed pages are never written again.
//! All I/O goes through the narrow [`PageStore`] capability so the tree stays
//! ignorant of mmap, staging and the free list.

use super::node::{Node, NodeType, HEADER_SIZE, MAX_KEY_SIZE, MAX_VAL_SIZE, PAGE_SIZE};
use crate::errors::Error;
use tracing::debug;

/// Page operations the tree needs from its host.
pub trait PageStore {
    /// Reads the page at `pno`, staged or persisted.
    fn page_read(&self, pno: u64) -> Node;
    /// Allocates a page number for a new page and stages its contents.
    fn page_alloc(&mut self, node: Node) -> u64;
    /// Retires a page that is no longer reachable from the new root.
    fn page_delete(&mut self, pno: u64);
}

/// Rejects keys and values the node layout cannot hold.
pub fn check_limit(key: &[u8], val: &[u8]) -> Result<(), Error> {
    if key.is_empty() {
        return Err(err!(Limit, "Key must not be empty"));
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(err!(Limit, "Key length {} exceeds {}", key.len(), MAX_KEY_SIZE));
    }
    if val.len() > MAX_VAL_SIZE {
        return Err(err!(
            Limit,
            "Value length {} exceeds {}",
            val.len(),
            MAX_VAL_SIZE
        ));
    }
    Ok(())
}

/// The B+tree handle. Holds only the root page number; zero means empty.
#[derive(Debug, Default)]
pub struct BTree {
    pub root: u64,
}

impl BTree {
    pub fn new(root: u64) -> Self {
        BTree { root }
    }

    /// Looks up `key`, descending with `lookup_le` until a leaf decides.
    pub fn get(&self, store: &impl PageStore, key: &[u8]) -> Option<Vec<u8>> {
        if self.root == 0 {
            return None;
        }
        let mut node = store.page_read(self.root);
        loop {
            let idx = node.lookup_le(key);
            match node.node_type() {
                NodeType::Internal => {
                    let pno = node.get_ptr(idx);
                    if pno == 0 {
                        return None;
                    }
                    node = store.page_read(pno);
                }
                NodeType::Leaf => {
                    let (node_key, val) = node.get_kv(idx);
                    return if node_key == key { Some(val.to_vec()) } else { None };
                }
            }
        }
    }

    /// Inserts or replaces `key`, splitting nodes and growing the root as
    /// needed. The first insert also creates the empty sentinel entry that
    /// anchors every later `lookup_le`.
    pub fn insert(
        &mut self,
        store: &mut impl PageStore,
        key: &[u8],
        val: &[u8],
    ) -> Result<(), Error> {
        check_limit(key, val)?;

        if self.root == 0 {
            let mut root = Node::new();
            root.set_header(NodeType::Leaf, 2);
            root.append_kv(0, 0, b"", b"");
            root.append_kv(1, 0, key, val);
            self.root = store.page_alloc(root);
            debug!(root = self.root, "Created the first root leaf");
            return Ok(());
        }

        let root_node = store.page_read(self.root);
        let node = tree_insert(store, root_node, key, val);
        let mut parts = node.split3();
        let old_root = self.root;

        self.root = if parts.len() > 1 {
            // the root split, add a new level
            debug!(parts = parts.len(), "Root split. Growing the tree by one level");
            let mut root = Node::new();
            root.set_header(NodeType::Internal, parts.len());
            for (i, part) in parts.into_iter().enumerate() {
                let first_key = part.get_kv(0).0.to_vec();
                let pno = store.page_alloc(part);
                root.append_kv(i, pno, &first_key, b"");
            }
            store.page_alloc(root)
        } else {
            store.page_alloc(parts.remove(0))
        };
        store.page_delete(old_root);
        Ok(())
    }

    /// Removes `key` if present. Underfull nodes are merged into a sibling
    /// on the way back up, and an internal root left with a single child is
    /// collapsed into that child.
    pub fn delete(&mut self, store: &mut impl PageStore, key: &[u8]) -> Result<bool, Error> {
        check_limit(key, b"")?;

        if self.root == 0 {
            return Ok(false);
        }
        let root_node = store.page_read(self.root);
        let updated = match tree_delete(store, root_node, key) {
            Some(node) => node,
            None => return Ok(false),
        };

        store.page_delete(self.root);
        if updated.node_type() == NodeType::Internal && updated.nkeys() == 1 {
            // remove a level
            self.root = updated.get_ptr(0);
            debug!(root = self.root, "Collapsed the root into its only child");
        } else {
            self.root = store.page_alloc(updated);
        }
        Ok(true)
    }
}

/// Rebuilds `old` with the children at `idx` replaced by `parts`, allocating
/// each part and keying it by its first key.
fn node_replace_children(
    store: &mut impl PageStore,
    new: &mut Node,
    old: &Node,
    idx: usize,
    parts: Vec<Node>,
) {
    let inc = parts.len();
    new.set_header(NodeType::Internal, old.nkeys() + inc - 1);
    new.append_range(old, 0, 0, idx);
    for (i, part) in parts.into_iter().enumerate() {
        let first_key = part.get_kv(0).0.to_vec();
        let pno = store.page_alloc(part);
        new.append_kv(idx + i, pno, &first_key, b"");
    }
    new.append_range(old, idx + inc, idx + 1, old.nkeys() - (idx + 1));
}

/// Recursive insert. Returns the replacement for `node`, possibly larger
/// than one page until the caller splits it.
fn tree_insert(store: &mut impl PageStore, node: Node, key: &[u8], val: &[u8]) -> Node {
    let mut new = Node::scratch();
    let idx = node.lookup_le(key);

    match node.node_type() {
        NodeType::Leaf => {
            let (node_key, _) = node.get_kv(idx);
            if node_key == key {
                new.leaf_upsert(&node, idx, key, val, true);
            } else {
                new.leaf_upsert(&node, idx + 1, key, val, false);
            }
        }
        NodeType::Internal => {
            let child_pno = node.get_ptr(idx);
            let child_node = store.page_read(child_pno);
            let child = tree_insert(store, child_node, key, val);
            let parts = child.split3();
            store.page_delete(child_pno);
            node_replace_children(store, &mut new, &node, idx, parts);
        }
    }
    new
}

/// Recursive delete. `None` signals that `key` was not found and nothing
/// was touched.
fn tree_delete(store: &mut impl PageStore, node: Node, key: &[u8]) -> Option<Node> {
    let idx = node.lookup_le(key);
    match node.node_type() {
        NodeType::Leaf => {
            let (node_key, _) = node.get_kv(idx);
            if node_key != key {
                return None;
            }
            let mut new = Node::new();
            new.leaf_remove(&node, idx);
            Some(new)
        }
        NodeType::Internal => node_delete(store, node, idx, key),
    }
}

/// Which sibling, if any, an underfull child should be merged into.
enum MergeDir {
    None,
    Left(Node),
    Right(Node),
}

/// A child is merged when it shrank to a quarter page and a neighbouring
/// sibling exists whose concatenation with it still fits one page. The left
/// sibling wins ties.
fn should_merge(store: &impl PageStore, parent: &Node, idx: usize, updated: &Node) -> MergeDir {
    if updated.nbytes() > PAGE_SIZE / 4 {
        return MergeDir::None;
    }
    if idx > 0 {
        let sibling = store.page_read(parent.get_ptr(idx - 1));
        if sibling.nbytes() + updated.nbytes() - HEADER_SIZE <= PAGE_SIZE {
            return MergeDir::Left(sibling);
        }
    }
    if idx + 1 < parent.nkeys() {
        let sibling = store.page_read(parent.get_ptr(idx + 1));
        if sibling.nbytes() + updated.nbytes() - HEADER_SIZE <= PAGE_SIZE {
            return MergeDir::Right(sibling);
        }
    }
    MergeDir::None
}

/// Delete within an internal node: recurse into the chosen child, then
/// rebuild this node around the updated child, merging it into a sibling
/// when it became underfull.
fn node_delete(store: &mut impl PageStore, node: Node, idx: usize, key: &[u8]) -> Option<Node> {
    let child_pno = node.get_ptr(idx);
    let child_node = store.page_read(child_pno);
    let updated = tree_delete(store, child_node, key)?;
    store.page_delete(child_pno);

    let mut new = Node::new();
    match should_merge(store, &node, idx, &updated) {
        MergeDir::Left(sibling) => {
            debug!(idx, "Merging an underfull child into its left sibling");
            let mut merged = Node::new();
            merged.merge(&sibling, &updated);
            store.page_delete(node.get_ptr(idx - 1));
            let first_key = merged.get_kv(0).0.to_vec();
            let pno = store.page_alloc(merged);
            new.replace_two(&node, idx - 1, pno, &first_key);
        }
        MergeDir::Right(sibling) => {
            debug!(idx, "Merging an underfull child into its right sibling");
            let mut merged = Node::new();
            merged.merge(&updated, &sibling);
            store.page_delete(node.get_ptr(idx + 1));
            let first_key = merged.get_kv(0).0.to_vec();
            let pno = store.page_alloc(merged);
            new.replace_two(&node, idx, pno, &first_key);
        }
        MergeDir::None if updated.nkeys() == 0 => {
            // the child emptied out and there is no sibling to absorb it;
            // the parent chain collapses this empty node
            assert!(node.nkeys() == 1 && idx == 0);
            new.set_header(NodeType::Internal, 0);
        }
        MergeDir::None => {
            node_replace_children(store, &mut new, &node, idx, vec![updated]);
        }
    }
    Some(new)
}
