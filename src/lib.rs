//! A persistent, versioned trie over byte-string keys.
//!
//! Every mutation of a [`TrieVersion`] returns a new version that shares all
//! untouched subtrees with its predecessor. Nodes live in raw allocations
//! from an accounted [`Arena`] and are reference counted; when the last
//! handle to a version goes away the release of its nodes is handed to a
//! background worker (see [`reclaim`]).
//!
//! Ordered prefix scans are expressed as reductions:
//!
//! ```
//! use std::ops::ControlFlow;
//! use vtrie::{Direction, Epoch, Reducible, TrieVersion};
//!
//! let v = TrieVersion::empty()
//!     .insert(Epoch(1), b"ab").unwrap()
//!     .insert(Epoch(2), b"abc").unwrap()
//!     .insert(Epoch(3), b"b").unwrap();
//!
//! let keys = v.seek(b"ab", Direction::Backward).unwrap().collect_keys().unwrap();
//! assert_eq!(keys, vec![b"abc".to_vec(), b"ab".to_vec()]);
//!
//! let first = v
//!     .seek(b"", Direction::Forward).unwrap()
//!     .reduce(None, |_, key| ControlFlow::Break(Some(key.to_vec())))
//!     .unwrap();
//! assert_eq!(first.as_deref(), Some(&b"ab"[..]));
//! ```
//!
//! Keys handed to a reduction step live in scoped buffers of a
//! [`BufferPool`] and are released before the next key is produced.

pub mod arena;
pub mod buffer;
pub mod config;
pub mod error;
pub mod reclaim;
pub mod reduce;
pub mod trie;

pub use arena::Arena;
pub use buffer::{BufferKind, BufferPool, BufferStats, BufferToken, OpenBuffer, SealedBuffer};
pub use config::{config, configure, Config};
pub use error::{BoxError, ConfigError, Result, TrieError};
pub use reduce::Reducible;
pub use trie::{Cursor, Direction, Epoch, Seek, TrieVersion};

#[cfg(feature = "proptest")]
pub use trie::RandKey;
