//! An embedded, single-writer, durable key-value store in a single file.
//!
//! Keys and values are arbitrary byte strings, ordered lexicographically.
//! Storage is a copy-on-write B+tree of 4096-byte pages over a memory-mapped
//! file, with a free-page ring for recycling and a crash-safe meta page
//! committed with two fsyncs.
//!
//! ```no_run
//! use beaverkv::KV;
//!
//! let mut kv = KV::open("kvstore.data")?;
//! kv.set(b"k1", b"mickey1")?;
//! assert_eq!(kv.get(b"k1")?, Some(b"mickey1".to_vec()));
//! kv.close();
//! # Ok::<(), beaverkv::Error>(())
//! ```

#[macro_use]
mod errors;
pub mod storage;

pub use errors::Error;
pub use storage::KV;
