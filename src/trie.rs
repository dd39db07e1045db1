//! Persistent, versioned byte-string trie.
//!
//! A [`TrieVersion`] is an immutable snapshot of a key set. Mutations copy
//! the path from the root to the touched node and share every other subtree
//! with the version they started from, so older versions stay valid and
//! cost nothing beyond the nodes only they still reference.
//!
//! The tree is path compressed: every node carries an infix and a
//! non-terminal node has at least two children. Children are kept sorted by
//! their edge byte which makes ordered traversal a plain depth first walk.
//! Each node also caches the number of keys, the number of node bytes, the
//! length of the longest key suffix and the XOR of the keyed hashes of all
//! keys below it.
//!
//! Descents keep their path in heap allocated stacks, so deep keys never
//! translate into call depth.

mod cursor;
mod node;

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::buffer::BufferPool;
use crate::config::config;
use crate::error::{Result, TrieError};
use crate::reclaim::{self, Tracker};

pub use cursor::{Cursor, Seek};
use node::{key_hash, Children, Node, NodePtr, NodeRef};

/// Opaque logical timestamp attached to every mutation.
///
/// The trie stores the epoch on the version a mutation produces and
/// otherwise does not interpret it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(pub u64);

impl Epoch {
    pub fn next(self) -> Epoch {
        Epoch(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Ascending byte order, a key before its extensions.
    Forward,
    /// Descending byte order, the exact reverse of `Forward`.
    Backward,
}

struct VersionHandle {
    root: Option<NonNull<Node>>,
    epoch: Epoch,
    // Dropping the last handle queues the root for reclamation.
    _tracker: Tracker,
}

// The root is kept alive by the disposer registered with the tracker.
unsafe impl Send for VersionHandle {}
unsafe impl Sync for VersionHandle {}

/// A handle to one immutable version of the trie.
///
/// Cloning is O(1) and every clone denotes the same version. The nodes of
/// a version are released by the reclamation worker once the last clone is
/// dropped.
#[derive(Clone)]
pub struct TrieVersion {
    handle: Arc<VersionHandle>,
}

impl TrieVersion {
    /// The empty trie.
    pub fn empty() -> Self {
        Self::from_root(None, Epoch::default())
    }

    fn from_root(root: Option<NodeRef>, epoch: Epoch) -> Self {
        let addr = root.as_ref().map(NodeRef::as_non_null);
        let tracker = reclaim::track(move || drop(root));
        Self {
            handle: Arc::new(VersionHandle {
                root: addr,
                epoch,
                _tracker: tracker,
            }),
        }
    }

    pub(crate) fn root(&self) -> Option<NodePtr<'_>> {
        self.handle.root.map(|ptr| unsafe { NodePtr::new(ptr) })
    }

    /// Epoch of the mutation that produced this version.
    pub fn epoch(&self) -> Epoch {
        self.handle.epoch
    }

    /// `true` if both handles denote the same version.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.handle, &b.handle)
    }

    /// Number of keys.
    pub fn len(&self) -> u64 {
        self.root().map_or(0, NodePtr::key_count)
    }

    pub fn is_empty(&self) -> bool {
        self.handle.root.is_none()
    }

    /// Bytes of node storage reachable from this version, counting shared
    /// subtrees in full.
    pub fn size(&self) -> usize {
        self.root().map_or(0, |root| root.bytes() as usize)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let Some(mut node) = self.root() else {
            return false;
        };
        let mut key = key;
        loop {
            let Some(rest) = key.strip_prefix(node.infix()) else {
                return false;
            };
            let Some((&byte, tail)) = rest.split_first() else {
                return node.is_terminal();
            };
            match node.find(byte) {
                Ok(index) => {
                    node = node.child_at(index);
                    key = tail;
                }
                Err(_) => return false,
            }
        }
    }

    /// Returns true if some key starts with `prefix`.
    pub fn has_prefix(&self, prefix: &[u8]) -> bool {
        self.root()
            .is_some_and(|root| cursor::locate(root, prefix).is_some())
    }

    /// Returns a version that also contains `key`.
    ///
    /// If the key is already present the result is this very version, so
    /// [`TrieVersion::ptr_eq`] holds between argument and result.
    pub fn insert(&self, epoch: Epoch, key: &[u8]) -> Result<TrieVersion> {
        check_key_len(key)?;
        self.check_epoch(epoch);
        let hash = key_hash(key);
        let root = match self.root() {
            None => Node::leaf(key, hash)?,
            Some(root) => match insert_at(root, key, hash)? {
                Some(root) => root,
                None => {
                    tracing::trace!(%epoch, len = key.len(), "insert of present key");
                    return Ok(self.clone());
                }
            },
        };
        tracing::trace!(%epoch, len = key.len(), "inserted key");
        Ok(Self::from_root(Some(root), epoch))
    }

    /// Returns a version without `key`.
    ///
    /// If the key is absent the result is this very version.
    pub fn remove(&self, epoch: Epoch, key: &[u8]) -> Result<TrieVersion> {
        check_key_len(key)?;
        self.check_epoch(epoch);
        let Some(root) = self.root() else {
            return Ok(self.clone());
        };
        let root = match remove_at(root, key)? {
            Removed::Absent => {
                tracing::trace!(%epoch, len = key.len(), "remove of absent key");
                return Ok(self.clone());
            }
            Removed::Gone => None,
            Removed::Node(root) => Some(root),
        };
        tracing::trace!(%epoch, len = key.len(), "removed key");
        Ok(Self::from_root(root, epoch))
    }

    /// Prefix query over this version using the process-wide buffer pool.
    pub fn seek(&self, prefix: &[u8], direction: Direction) -> Result<Seek<'_, 'static>> {
        Seek::new(self, BufferPool::global(), prefix, direction)
    }

    /// Prefix query whose buffers come from `pool`.
    pub fn seek_in<'v, 'p>(
        &'v self,
        pool: &'p BufferPool,
        prefix: &[u8],
        direction: Direction,
    ) -> Result<Seek<'v, 'p>> {
        Seek::new(self, pool, prefix, direction)
    }

    /// Walks the whole version and verifies the structural invariants and
    /// the cached aggregates of every node.
    pub fn check(&self) -> Result<()> {
        match self.root() {
            Some(root) => check_tree(root),
            None => Ok(()),
        }
    }

    fn check_epoch(&self, epoch: Epoch) {
        if epoch < self.epoch() {
            tracing::warn!(
                %epoch,
                base = %self.epoch(),
                "mutation epoch is older than its base version"
            );
        }
    }
}

impl Default for TrieVersion {
    fn default() -> Self {
        Self::empty()
    }
}

/// Content equality: both versions hold the same key set.
impl PartialEq for TrieVersion {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
            || (self.len() == other.len()
                && self.root().map(NodePtr::hash) == other.root().map(NodePtr::hash))
    }
}

impl Eq for TrieVersion {}

impl fmt::Debug for TrieVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrieVersion")
            .field("len", &self.len())
            .field("size", &self.size())
            .field("epoch", &self.epoch())
            .finish()
    }
}

fn check_key_len(key: &[u8]) -> Result<()> {
    let max = config().max_key_len;
    if key.len() > max {
        return Err(TrieError::KeyTooLong {
            len: key.len(),
            max,
        });
    }
    Ok(())
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Rebuilds a copied path bottom up: each parent gets `child` in place of
/// its edge `index`.
fn rebuild_path(path: &[(NodePtr<'_>, usize)], mut child: NodeRef) -> Result<NodeRef> {
    for &(parent, index) in path.iter().rev() {
        let mut children = parent.children();
        children[index].1 = child;
        child = Node::build(parent.is_terminal(), parent.key_hash(), parent.infix(), children)?;
    }
    Ok(child)
}

/// Splits `node`'s infix after `common` bytes, where `rest` leaves it.
fn split(node: NodePtr<'_>, common: usize, rest: &[u8], hash: u128) -> Result<NodeRef> {
    let infix = node.infix();
    let edge = infix[common];
    let lower = node.with_infix(&infix[common + 1..])?;
    let mut children = Children::new();
    match rest.get(common) {
        None => {
            children.push((edge, lower));
            Node::build(true, hash, rest, children)
        }
        Some(&byte) => {
            let leaf = Node::leaf(&rest[common + 1..], hash)?;
            if byte < edge {
                children.push((byte, leaf));
                children.push((edge, lower));
            } else {
                children.push((edge, lower));
                children.push((byte, leaf));
            }
            Node::build(false, 0, &infix[..common], children)
        }
    }
}

/// Inserts `key` below `root`. Returns `None` if the key is already present.
///
/// The descent keeps its path on the heap, key length never turns into
/// call depth.
fn insert_at(root: NodePtr<'_>, key: &[u8], hash: u128) -> Result<Option<NodeRef>> {
    let mut path = Vec::new();
    let mut node = root;
    let mut depth = 0;
    let replacement = loop {
        let rest = &key[depth..];
        let infix = node.infix();
        let common = common_prefix(infix, rest);

        if common < infix.len() {
            break split(node, common, rest, hash)?;
        }
        let Some((&byte, tail)) = rest[common..].split_first() else {
            if node.is_terminal() {
                return Ok(None);
            }
            break Node::build(true, hash, infix, node.children())?;
        };
        match node.find(byte) {
            Ok(index) => {
                path.push((node, index));
                node = node.child_at(index);
                depth += common + 1;
            }
            Err(index) => {
                let leaf = Node::leaf(tail, hash)?;
                let mut children = node.children();
                children.insert(index, (byte, leaf));
                break Node::build(node.is_terminal(), node.key_hash(), infix, children)?;
            }
        }
    };
    rebuild_path(&path, replacement).map(Some)
}

enum Removed {
    Absent,
    /// The subtree held only the removed key.
    Gone,
    Node(NodeRef),
}

/// Concatenates `infix ++ byte ++ child` into a single node.
fn merge(infix: &[u8], byte: u8, child: NodePtr<'_>) -> Result<NodeRef> {
    let mut merged = Vec::with_capacity(infix.len() + 1 + child.infix().len());
    merged.extend_from_slice(infix);
    merged.push(byte);
    merged.extend_from_slice(child.infix());
    child.with_infix(&merged)
}

/// Rebuilds `parent` around `children`, folding a branch that is left with
/// a single child into it.
fn collapse(parent: NodePtr<'_>, mut children: Children) -> Result<Removed> {
    let infix = parent.infix();
    match (parent.is_terminal(), children.len()) {
        (false, 0) => Ok(Removed::Gone),
        (false, 1) => match children.pop() {
            Some((byte, only)) => merge(infix, byte, only.ptr()).map(Removed::Node),
            None => Err(TrieError::invariant("branch lost its last child")),
        },
        (terminal, _) => {
            Node::build(terminal, parent.key_hash(), infix, children).map(Removed::Node)
        }
    }
}

fn remove_at(root: NodePtr<'_>, key: &[u8]) -> Result<Removed> {
    let mut path = Vec::new();
    let mut node = root;
    let mut depth = 0;
    let mut removed = loop {
        let infix = node.infix();
        let Some(rest) = key[depth..].strip_prefix(infix) else {
            return Ok(Removed::Absent);
        };
        let Some(&byte) = rest.first() else {
            if !node.is_terminal() {
                return Ok(Removed::Absent);
            }
            break match node.child_count() {
                0 => Removed::Gone,
                1 => Removed::Node(merge(infix, node.edges()[0].byte, node.child_at(0))?),
                _ => Removed::Node(Node::build(false, 0, infix, node.children())?),
            };
        };
        let Ok(index) = node.find(byte) else {
            return Ok(Removed::Absent);
        };
        path.push((node, index));
        node = node.child_at(index);
        depth += infix.len() + 1;
    };

    for &(parent, index) in path.iter().rev() {
        let mut children = parent.children();
        match removed {
            Removed::Absent => return Ok(Removed::Absent),
            Removed::Node(child) => children[index].1 = child,
            Removed::Gone => {
                children.remove(index);
            }
        }
        removed = collapse(parent, children)?;
    }
    Ok(removed)
}

/// Verifies every node below `root` against the cached aggregates of its
/// children. Consistency at every node implies consistency of the tree.
fn check_tree(root: NodePtr<'_>) -> Result<()> {
    let mut pending = vec![root];
    while let Some(node) = pending.pop() {
        check_node(node)?;
        pending.extend((0..node.child_count()).map(|index| node.child_at(index)));
    }
    Ok(())
}

fn check_node(node: NodePtr<'_>) -> Result<()> {
    let fail = |what: &str| {
        Err(TrieError::invariant(format!(
            "node at {:#x}: {what}",
            node.addr()
        )))
    };
    if node.ref_count() == 0 {
        return fail("reachable node with zero references");
    }
    if !node.is_terminal() && node.child_count() < 2 {
        return fail("non-terminal node with fewer than two children");
    }
    if !node.is_terminal() && node.key_hash() != 0 {
        return fail("non-terminal node carries a key hash");
    }
    if !node.edges().windows(2).all(|w| w[0].byte < w[1].byte) {
        return fail("children out of order");
    }

    let mut count = node.is_terminal() as u64;
    let mut hash = node.key_hash();
    let mut bytes = node.alloc_size() as u64;
    let mut below = 0u32;
    for index in 0..node.child_count() {
        let child = node.child_at(index);
        count += child.key_count();
        bytes += child.bytes();
        hash ^= child.hash();
        below = below.max(child.longest().saturating_add(1));
    }
    if count != node.key_count() {
        return fail("cached key count is stale");
    }
    if hash != node.hash() {
        return fail("cached hash is stale");
    }
    if bytes != node.bytes() {
        return fail("cached size is stale");
    }
    if node.infix().len() as u64 + below as u64 != node.longest() as u64 {
        return fail("cached longest suffix is stale");
    }
    Ok(())
}

/// Proptest strategy for keys of at most `max_len` bytes, each byte below
/// `alphabet`. A small alphabet makes generated keys share prefixes.
#[cfg(feature = "proptest")]
#[derive(Debug, Clone, Copy)]
pub struct RandKey {
    pub max_len: usize,
    pub alphabet: u8,
}

#[cfg(feature = "proptest")]
pub struct KeyValueTree(Vec<u8>);

#[cfg(feature = "proptest")]
impl proptest::strategy::Strategy for RandKey {
    type Tree = KeyValueTree;
    type Value = Vec<u8>;

    fn new_tree(
        &self,
        runner: &mut proptest::prelude::prop::test_runner::TestRunner,
    ) -> proptest::prelude::prop::strategy::NewTree<Self> {
        use rand::Rng;

        let rng = runner.rng();
        let len = rng.gen_range(0..=self.max_len);
        let key = (0..len)
            .map(|_| rng.gen_range(0..self.alphabet.max(1)))
            .collect();
        Ok(KeyValueTree(key))
    }
}

#[cfg(feature = "proptest")]
impl proptest::strategy::ValueTree for KeyValueTree {
    type Value = Vec<u8>;

    fn simplify(&mut self) -> bool {
        false
    }
    fn complicate(&mut self) -> bool {
        false
    }
    fn current(&self) -> Vec<u8> {
        self.0.clone()
    }
}
