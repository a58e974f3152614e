//! Page persistence: a growing memory-mapped file, per-transaction staging
//! and the two-fsync commit that makes the meta page the linearisation point.
//!
//! Page 0 is the meta page. Everything else is addressed by its logical page
//! number; reads go through an ordered sequence of mmap chunks, writes are
//! staged in memory and reach the file only inside [`Pager::commit`]:
//!
//! 1. Extend the file and mapping, `pwrite` every staged page, fsync.
//! 2. `pwrite` the meta header at offset 0, fsync.
//!
//! A failure at any step leaves the on-disk meta pointing at the previous
//! root, so readers fall back to the pre-call state after a revert.

use super::btree::PageStore;
use super::freelist::{FreeList, FreePageStore};
use super::node::{Node, PAGE_SIZE};
use crate::errors::Error;
use bincode::{config, Decode, Encode};
use memmap2::{MmapMut, MmapOptions};
use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use tracing::{debug, info, trace};

/// File signature at the start of the meta page.
pub const DB_SIG: [u8; 8] = *b"BEAVER01";

/// Encoded size of the meta header; the rest of page 0 is padding.
pub(crate) const META_SIZE: usize = 56;

/// Smallest file extension and mmap chunk; growth doubles from here.
const MIN_GROWTH: u64 = 64 << 10;

/// Upper bound on mapped chunks. Doubling growth reaches any representable
/// file size in far fewer steps.
const MAX_MMAP_CHUNKS: usize = 64;

/// The persisted header of page 0.
///
/// `flushed` is one past the highest page number made durable by a commit.
/// The four cursor fields locate the free list ring; all zero means the ring
/// has no pages yet.
#[derive(Encode, Decode, Debug, Clone, Copy, PartialEq)]
pub(crate) struct Meta {
    pub sig: [u8; 8],
    pub root: u64,
    pub flushed: u64,
    pub head_page: u64,
    pub head_seq: u64,
    pub tail_page: u64,
    pub tail_seq: u64,
}

impl Meta {
    /// The meta of a store no commit has reached yet: page 0 reserved,
    /// empty tree, empty free list.
    fn fresh() -> Self {
        Meta {
            sig: DB_SIG,
            root: 0,
            flushed: 1,
            head_page: 0,
            head_seq: 0,
            tail_page: 0,
            tail_seq: 0,
        }
    }
}

fn encode_meta(meta: &Meta) -> Result<[u8; META_SIZE], Error> {
    let encoded = bincode::encode_to_vec(meta, config::standard().with_fixed_int_encoding())
        .map_err(|e| err!(Encoding, "Failed to encode the meta header. {}", e))?;
    if encoded.len() != META_SIZE {
        return Err(err!(
            Encoding,
            "Meta header size ({}) does not fit the frame ({}).",
            encoded.len(),
            META_SIZE
        ));
    }
    let mut frame = [0u8; META_SIZE];
    frame.copy_from_slice(&encoded);
    Ok(frame)
}

fn decode_meta(bytes: &[u8]) -> Result<Meta, Error> {
    let (meta, _): (Meta, usize) =
        bincode::decode_from_slice(bytes, config::standard().with_fixed_int_encoding())
            .map_err(|e| err!(Encoding, "Failed to decode the meta header. {}", e))?;
    Ok(meta)
}

/// The file, its mappings and the per-transaction staging buffers.
///
/// Kept separate from [`Pager`] so the free list can be handed this part as
/// a capability while the pager drives it.
pub(crate) struct PageState {
    file: File,
    file_size: u64,
    mmap_size: u64,
    chunks: heapless::Vec<MmapMut, MAX_MMAP_CHUNKS>,
    /// One past the highest durable page number.
    pub(crate) flushed: u64,
    /// Pages appended past the end of the file by this transaction.
    temp: Vec<Node>,
    /// Staged copy-on-write buffers for already-allocated page numbers.
    updates: HashMap<u64, Node>,
    /// Pages retired by this transaction, absorbed by the free list at commit.
    to_delete: Vec<u64>,
}

impl PageState {
    /// Grows the file to hold at least `size` bytes, doubling so the number
    /// of extensions stays logarithmic.
    fn extend_file(&mut self, size: u64) -> Result<(), Error> {
        if self.file_size >= size {
            return Ok(());
        }
        let mut new_size = self.file_size.max(MIN_GROWTH);
        while new_size < size {
            new_size *= 2;
        }
        self.file.set_len(new_size)?;
        debug!(from = self.file_size, to = new_size, "Extended the store file");
        self.file_size = new_size;
        Ok(())
    }

    /// Maps another contiguous chunk so at least `size` bytes are readable.
    /// Existing chunks are never remapped, so outstanding page reads stay
    /// valid while the file grows.
    fn extend_mmap(&mut self, size: u64) -> Result<(), Error> {
        if size <= self.mmap_size {
            return Ok(());
        }
        let mut increment = self.mmap_size.max(MIN_GROWTH);
        while self.mmap_size + increment < size {
            increment *= 2;
        }
        let chunk = unsafe {
            MmapOptions::new()
                .offset(self.mmap_size)
                .len(increment as usize)
                .map_mut(&self.file)?
        };
        trace!(offset = self.mmap_size, len = increment, "Mapped a new chunk");
        if self.chunks.push(chunk).is_err() {
            return Err(err!(
                Storage,
                "Mmap chunk table is full ({} chunks mapped)",
                MAX_MMAP_CHUNKS
            ));
        }
        self.mmap_size += increment;
        Ok(())
    }

    /// Reads a committed page out of the mapping, walking the chunk
    /// sequence by cumulative page count.
    fn page_read_file(&self, pno: u64) -> Node {
        assert!(pno < self.flushed, "page {} has never been flushed", pno);
        let mut start = 0u64;
        for chunk in self.chunks.iter() {
            let end = start + (chunk.len() / PAGE_SIZE) as u64;
            if pno < end {
                let offset = ((pno - start) as usize) * PAGE_SIZE;
                return Node::from_page(&chunk[offset..offset + PAGE_SIZE]);
            }
            start = end;
        }
        panic!("page {} is outside the mapped file", pno);
    }

    /// Reads a page, preferring this transaction's staged copies.
    fn page_read(&self, pno: u64) -> Node {
        if pno >= self.flushed {
            let idx = (pno - self.flushed) as usize;
            assert!(idx < self.temp.len(), "page {} was never appended", pno);
            self.temp[idx].clone()
        } else if let Some(node) = self.updates.get(&pno) {
            node.clone()
        } else {
            self.page_read_file(pno)
        }
    }

    fn page_append(&mut self, node: Node) -> u64 {
        let pno = self.flushed + self.temp.len() as u64;
        self.temp.push(node);
        pno
    }

    fn page_write(&mut self, pno: u64) -> &mut Node {
        if pno >= self.flushed {
            let idx = (pno - self.flushed) as usize;
            assert!(idx < self.temp.len(), "page {} was never appended", pno);
            return &mut self.temp[idx];
        }
        if !self.updates.contains_key(&pno) {
            let copy = self.page_read_file(pno);
            self.updates.insert(pno, copy);
        }
        self.updates.get_mut(&pno).expect("staged copy just inserted")
    }

    fn sync(&self) -> Result<(), Error> {
        self.file.sync_all()?;
        Ok(())
    }
}

impl FreePageStore for PageState {
    fn page_read(&self, pno: u64) -> Node {
        PageState::page_read(self, pno)
    }

    fn page_append(&mut self, node: Node) -> u64 {
        PageState::page_append(self, node)
    }

    fn page_write(&mut self, pno: u64) -> &mut Node {
        PageState::page_write(self, pno)
    }
}

/// Owner of the file state and the free list; translates the tree's page
/// operations into staging and recycling.
pub struct Pager {
    pub(crate) state: PageState,
    pub(crate) freelist: FreeList,
}

impl Pager {
    /// Recovers a pager from an open store file. A zero-length file, or one
    /// whose meta page a crash left all-zero before the first commit, is an
    /// empty store. A present signature must match.
    pub(crate) fn open(file: File) -> Result<(Pager, u64), Error> {
        let file_size = file.metadata()?.len();
        let meta = if file_size == 0 {
            Meta::fresh()
        } else {
            let mut frame = [0u8; META_SIZE];
            file.read_exact_at(&mut frame, 0)?;
            if frame.iter().all(|b| *b == 0) {
                Meta::fresh()
            } else {
                let meta = decode_meta(&frame)?;
                assert!(meta.sig == DB_SIG, "not a beaverkv store: bad meta signature");
                assert!(
                    meta.flushed >= 1 && meta.flushed * PAGE_SIZE as u64 <= file_size,
                    "meta page count is outside the file"
                );
                meta
            }
        };

        let mut state = PageState {
            file,
            file_size,
            mmap_size: 0,
            chunks: heapless::Vec::new(),
            flushed: meta.flushed,
            temp: Vec::new(),
            updates: HashMap::new(),
            to_delete: Vec::new(),
        };
        if file_size > 0 {
            state.extend_mmap(file_size)?;
        }

        let freelist = FreeList::new(meta.head_page, meta.head_seq, meta.tail_page, meta.tail_seq);
        info!(root = meta.root, flushed = meta.flushed, "Opened the store");
        Ok((Pager { state, freelist }, meta.root))
    }

    /// The meta this pager would persist right now, for revert-on-error.
    pub(crate) fn snapshot(&self, root: u64) -> Meta {
        Meta {
            sig: DB_SIG,
            root,
            flushed: self.state.flushed,
            head_page: self.freelist.head_page,
            head_seq: self.freelist.head_seq,
            tail_page: self.freelist.tail_page,
            tail_seq: self.freelist.tail_seq,
        }
    }

    /// Discards every staged page and restores the cursors of `snapshot`.
    pub(crate) fn revert(&mut self, snapshot: Meta) {
        self.state.flushed = snapshot.flushed;
        self.state.temp.clear();
        self.state.updates.clear();
        self.state.to_delete.clear();
        self.freelist = FreeList::new(
            snapshot.head_page,
            snapshot.head_seq,
            snapshot.tail_page,
            snapshot.tail_seq,
        );
    }

    /// Makes the staged transaction durable under the given root.
    pub(crate) fn commit(&mut self, root: u64) -> Result<(), Error> {
        self.write_pages()?;
        self.state.sync()?;
        self.write_meta(root)?;
        self.state.sync()?;
        self.finish_commit();
        Ok(())
    }

    /// Phase A body: absorb retired pages into the free list, grow the file
    /// and mapping, and write out every staged page.
    pub(crate) fn write_pages(&mut self) -> Result<(), Error> {
        // pushing may stage further free list pages, so this runs first
        let retired = std::mem::take(&mut self.state.to_delete);
        for pno in retired {
            self.freelist.push_tail(&mut self.state, pno);
        }

        let nflushed = self.state.flushed + self.state.temp.len() as u64;
        let size = nflushed * PAGE_SIZE as u64;
        self.state.extend_file(size)?;
        self.state.extend_mmap(size)?;

        for (i, node) in self.state.temp.iter().enumerate() {
            let pno = self.state.flushed + i as u64;
            self.state.file.write_all_at(node.as_page(), pno * PAGE_SIZE as u64)?;
        }
        for (pno, node) in &self.state.updates {
            self.state.file.write_all_at(node.as_page(), pno * PAGE_SIZE as u64)?;
        }
        debug!(
            appended = self.state.temp.len(),
            updated = self.state.updates.len(),
            "Wrote staged pages"
        );
        Ok(())
    }

    /// Phase B body: the meta header covering everything phase A wrote.
    pub(crate) fn write_meta(&mut self, root: u64) -> Result<(), Error> {
        let meta = Meta {
            sig: DB_SIG,
            root,
            flushed: self.state.flushed + self.state.temp.len() as u64,
            head_page: self.freelist.head_page,
            head_seq: self.freelist.head_seq,
            tail_page: self.freelist.tail_page,
            tail_seq: self.freelist.tail_seq,
        };
        let frame = encode_meta(&meta)?;
        self.state.file.write_all_at(&frame, 0)?;
        Ok(())
    }

    fn finish_commit(&mut self) {
        self.state.flushed += self.state.temp.len() as u64;
        self.state.temp.clear();
        self.state.updates.clear();
    }

    /// Re-persists the meta from in-memory state after an earlier commit
    /// failed between its two fsyncs, restoring a definite on-disk root.
    pub(crate) fn rewrite_meta(&mut self, root: u64) -> Result<(), Error> {
        let frame = encode_meta(&self.snapshot(root))?;
        self.state.file.write_all_at(&frame, 0)?;
        self.state.sync()?;
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<(), Error> {
        self.state.sync()
    }
}

impl PageStore for Pager {
    fn page_read(&self, pno: u64) -> Node {
        self.state.page_read(pno)
    }

    fn page_alloc(&mut self, node: Node) -> u64 {
        assert!(node.nbytes() <= PAGE_SIZE, "oversized page handed to the allocator");
        if let Some(pno) = self.freelist.pop_head(&mut self.state) {
            trace!(pno, "Recycled a free page");
            self.state.updates.insert(pno, node);
            pno
        } else {
            self.state.page_append(node)
        }
    }

    fn page_delete(&mut self, pno: u64) {
        self.state.to_delete.push(pno);
    }
}
