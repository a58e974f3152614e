//! The store façade: open a file, then get, set and delete byte-string keys.
//!
//! Writes are single transactions. Each one snapshots the meta, lets the
//! tree stage its copy-on-write pages through the pager and then commits;
//! on any failure the in-memory state reverts to the snapshot and the next
//! mutation first re-persists the meta, so readers never observe a torn
//! update.

use super::btree::{check_limit, BTree};
use super::node::MAX_KEY_SIZE;
use super::pager::{Meta, Pager};
use crate::errors::Error;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A single-file, single-writer key-value store.
pub struct KV {
    path: PathBuf,
    pager: Pager,
    tree: BTree,
    last_update_failed: bool,
}

impl KV {
    /// Opens the store at `path`, creating the file if missing, and recovers
    /// the last committed state from its meta page.
    pub fn open(path: impl AsRef<Path>) -> Result<KV, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let (pager, root) = Pager::open(file)?;
        info!(path = %path.display(), root, "Opened key-value store");
        Ok(KV {
            path,
            pager,
            tree: BTree::new(root),
            last_update_failed: false,
        })
    }

    /// Unmaps and closes the store. Any staged but uncommitted state is
    /// discarded, which is also what dropping the handle does.
    pub fn close(self) {
        debug!(path = %self.path.display(), "Closed key-value store");
    }

    /// Looks up `key`. An empty stored value comes back as `Some` with an
    /// empty vector, distinct from an absent key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        check_key(key)?;
        Ok(self.tree.get(&self.pager, key))
    }

    /// Inserts or replaces `key`, durably. Returns only after both commit
    /// fsyncs have succeeded.
    pub fn set(&mut self, key: &[u8], val: &[u8]) -> Result<(), Error> {
        check_limit(key, val)?;
        let snapshot = self.begin_update()?;
        self.tree.insert(&mut self.pager, key, val)?;
        self.commit_or_revert(snapshot)
    }

    /// Deletes `key`, durably. An absent key is reported as
    /// [`Error::NotFound`] and leaves the store untouched.
    pub fn del(&mut self, key: &[u8]) -> Result<bool, Error> {
        check_key(key)?;
        let snapshot = self.begin_update()?;
        if !self.tree.delete(&mut self.pager, key)? {
            return Err(Error::NotFound);
        }
        self.commit_or_revert(snapshot)?;
        Ok(true)
    }

    /// Prepares a transaction: heal the meta page if the previous commit
    /// died between its fsyncs, freeze the free list tail, and snapshot the
    /// state to revert to.
    fn begin_update(&mut self) -> Result<Meta, Error> {
        if self.last_update_failed {
            warn!("Re-persisting the meta page after a failed update");
            self.pager.rewrite_meta(self.tree.root)?;
            self.last_update_failed = false;
        }
        self.pager.freelist.set_max_seq();
        Ok(self.pager.snapshot(self.tree.root))
    }

    fn commit_or_revert(&mut self, snapshot: Meta) -> Result<(), Error> {
        match self.pager.commit(self.tree.root) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Update failed. Reverting to the previous root");
                self.tree.root = snapshot.root;
                self.pager.revert(snapshot);
                self.last_update_failed = true;
                Err(e)
            }
        }
    }
}

fn check_key(key: &[u8]) -> Result<(), Error> {
    if key.is_empty() {
        return Err(err!(Limit, "Key must not be empty"));
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(err!(Limit, "Key length {} exceeds {}", key.len(), MAX_KEY_SIZE));
    }
    Ok(())
}
