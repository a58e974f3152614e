//! Durable FIFO of recyclable page numbers.
//!
//! The list lives in ordinary pages linked into a ring. Each list page is
//! `next:8 | pointers`, where `next` is the page number of the successor
//! (zero terminates) and the body is 511 eight-byte slots. Two cursors walk
//! a virtual sequence over the slots: the head consumes free pages, the tail
//! receives retired ones, and `seq % cap` picks the slot within a page.
//!
//! `max_seq` freezes the tail position at the start of a transaction so a
//! transaction never consumes a page it retired itself; pages pushed during
//! a commit only become allocatable in a later transaction.

use super::node::{read_u64, write_u64, Node, PAGE_SIZE, POINTER_SIZE};
use tracing::trace;

/// Size of the `next` link at the start of a list page.
const NEXT_SIZE: usize = 8;

/// Pointer slots per list page.
pub(crate) const FREE_LIST_CAP: usize = (PAGE_SIZE - NEXT_SIZE) / POINTER_SIZE;

fn get_next(node: &Node) -> u64 {
    read_u64(node.as_page(), 0)
}

fn set_next(node: &mut Node, next: u64) {
    write_u64(node.as_page_mut(), 0, next);
}

fn get_entry(node: &Node, idx: usize) -> u64 {
    read_u64(node.as_page(), NEXT_SIZE + idx * POINTER_SIZE)
}

fn set_entry(node: &mut Node, idx: usize, pno: u64) {
    write_u64(node.as_page_mut(), NEXT_SIZE + idx * POINTER_SIZE, pno);
}

fn seq_to_idx(seq: u64) -> usize {
    (seq % FREE_LIST_CAP as u64) as usize
}

/// Page operations the free list needs from the pager. Updates to list pages
/// go through [`FreePageStore::page_write`] so the pager can stage them
/// instead of touching the file.
pub trait FreePageStore {
    /// Reads the page at `pno`, staged or persisted.
    fn page_read(&self, pno: u64) -> Node;
    /// Appends a page at the end of the file, returning its page number.
    fn page_append(&mut self, node: Node) -> u64;
    /// Returns the staged, mutable copy of the page at `pno`.
    fn page_write(&mut self, pno: u64) -> &mut Node;
}

/// Head and tail cursors over the ring of list pages. The cursor fields are
/// persisted with the meta page; `max_seq` is in-memory only.
#[derive(Debug, Default)]
pub struct FreeList {
    pub head_page: u64,
    pub head_seq: u64,
    pub tail_page: u64,
    pub tail_seq: u64,
    max_seq: u64,
}

impl FreeList {
    pub fn new(head_page: u64, head_seq: u64, tail_page: u64, tail_seq: u64) -> Self {
        FreeList {
            head_page,
            head_seq,
            tail_page,
            tail_seq,
            max_seq: tail_seq,
        }
    }

    /// Freezes the tail position at the start of a transaction.
    pub fn set_max_seq(&mut self) {
        self.max_seq = self.tail_seq;
    }

    /// Takes a recyclable page number, or `None` when every remaining slot
    /// was filled by the current transaction.
    pub fn pop_head(&mut self, store: &mut impl FreePageStore) -> Option<u64> {
        let (pno, freed_list_page) = self.pop(store);
        if let Some(freed) = freed_list_page {
            // the drained head page itself goes back into circulation
            self.push_tail(store, freed);
        }
        pno
    }

    /// Appends a retired page number at the tail, growing the ring by one
    /// list page whenever the tail page fills up.
    pub fn push_tail(&mut self, store: &mut impl FreePageStore, pno: u64) {
        if self.tail_page == 0 {
            // first retirement ever: seed the ring with one empty list page
            self.tail_page = store.page_append(Node::new());
            self.head_page = self.tail_page;
            trace!(page = self.tail_page, "Seeded the free list ring");
        }

        set_entry(store.page_write(self.tail_page), seq_to_idx(self.tail_seq), pno);
        self.tail_seq += 1;

        if seq_to_idx(self.tail_seq) == 0 {
            // the tail page is full, link a successor; prefer recycling one
            // of our own pages over growing the file
            let (next, freed_list_page) = self.pop(store);
            let next = next.unwrap_or_else(|| store.page_append(Node::new()));
            set_next(store.page_write(self.tail_page), next);
            self.tail_page = next;
            trace!(page = next, "Linked a new free list tail page");

            if let Some(freed) = freed_list_page {
                set_entry(store.page_write(self.tail_page), 0, freed);
                self.tail_seq += 1;
            }
        }
    }

    /// Advances the head cursor one slot. Also returns the old head page
    /// number when the cursor moved off it, making that page recyclable.
    fn pop(&mut self, store: &mut impl FreePageStore) -> (Option<u64>, Option<u64>) {
        if self.head_seq == self.max_seq {
            return (None, None);
        }

        let head = store.page_read(self.head_page);
        let pno = get_entry(&head, seq_to_idx(self.head_seq));
        self.head_seq += 1;

        let mut freed_list_page = None;
        if seq_to_idx(self.head_seq) == 0 {
            // drained the whole page, move to its successor
            freed_list_page = Some(self.head_page);
            self.head_page = get_next(&head);
            assert!(self.head_page != 0, "free list ring is broken");
        }
        (Some(pno), freed_list_page)
    }
}
