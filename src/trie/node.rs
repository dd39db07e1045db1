use std::alloc::Layout;
use std::hash::Hasher;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::OnceLock;

use arrayvec::ArrayVec;
use rand::thread_rng;
use rand::RngCore;
use siphasher::sip128::{Hasher128, SipHasher24};

use crate::arena::Arena;
use crate::error::{Result, TrieError};

/// Children of a node under construction, sorted by edge byte.
pub(crate) type Children = ArrayVec<(u8, NodeRef), 256>;

static SIP_KEY: OnceLock<[u8; 16]> = OnceLock::new();

fn sip_key() -> &'static [u8; 16] {
    SIP_KEY.get_or_init(|| {
        let mut key = [0; 16];
        thread_rng().fill_bytes(&mut key);
        key
    })
}

/// Keyed 128 bit hash of a complete key. Subtree hashes are the XOR of the
/// hashes of all keys below, which makes set equality an O(1) comparison.
pub(crate) fn key_hash(key: &[u8]) -> u128 {
    let mut hasher = SipHasher24::new_with_key(sip_key());
    hasher.write(key);
    hasher.finish128().into()
}

/// Header of a node allocation.
///
/// The header is followed in the same allocation by `child_count` edges,
/// sorted by byte, and then by `infix_len` infix bytes. A node stands for
/// the key path `parent path ++ edge byte ++ infix`. Nodes are immutable
/// once built; only the reference count changes.
#[repr(C)]
pub(crate) struct Node {
    rc: atomic::AtomicU32,
    terminal: bool,
    child_count: u16,
    infix_len: u32,
    /// Length of the longest key suffix below this node, measured from the
    /// start of its infix.
    longest: u32,
    key_count: u64,
    bytes: u64,
    key_hash: u128,
    hash: u128,
}

#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct Edge {
    pub byte: u8,
    node: NonNull<Node>,
}

/// Returns the allocation layout plus the offsets of the edge table and
/// the infix bytes.
fn layout(child_count: usize, infix_len: usize) -> Result<(Layout, usize, usize)> {
    let overflow = |_| TrieError::invariant("node layout overflows the address space");
    let (with_edges, edges_at) = Layout::new::<Node>()
        .extend(Layout::array::<Edge>(child_count).map_err(overflow)?)
        .map_err(overflow)?;
    let (full, infix_at) = with_edges
        .extend(Layout::array::<u8>(infix_len).map_err(overflow)?)
        .map_err(overflow)?;
    Ok((full.pad_to_align(), edges_at, infix_at))
}

impl Node {
    pub(crate) fn leaf(infix: &[u8], key_hash: u128) -> Result<NodeRef> {
        Self::build(true, key_hash, infix, Children::new())
    }

    /// Allocates a node that takes over the references in `children`.
    ///
    /// If the allocation fails the children are dropped, which only
    /// decrements their counts.
    pub(crate) fn build(
        terminal: bool,
        key_hash: u128,
        infix: &[u8],
        children: Children,
    ) -> Result<NodeRef> {
        debug_assert!(children.windows(2).all(|w| w[0].0 < w[1].0));
        let infix_len: u32 = infix
            .len()
            .try_into()
            .map_err(|_| TrieError::invariant("infix longer than u32::MAX"))?;
        let (layout, edges_at, infix_at) = layout(children.len(), infix.len())?;

        let key_hash = if terminal { key_hash } else { 0 };
        let mut key_count = terminal as u64;
        let mut bytes = layout.size() as u64;
        let mut hash = key_hash;
        let mut below = 0u32;
        for (_, child) in &children {
            let child = child.ptr();
            key_count += child.key_count();
            bytes += child.bytes();
            hash ^= child.hash();
            below = below.max(child.longest().saturating_add(1));
        }
        let longest = infix_len
            .checked_add(below)
            .ok_or_else(|| TrieError::invariant("key suffix longer than u32::MAX"))?;

        let ptr = Arena::global().allocate(layout)?.cast::<Node>();
        unsafe {
            ptr.as_ptr().write(Node {
                rc: atomic::AtomicU32::new(1),
                terminal,
                child_count: children.len() as u16,
                infix_len,
                longest,
                key_count,
                bytes,
                key_hash,
                hash,
            });
            let base = ptr.as_ptr() as *mut u8;
            let edges = base.add(edges_at) as *mut Edge;
            for (i, (byte, child)) in children.into_iter().enumerate() {
                edges.add(i).write(Edge {
                    byte,
                    node: child.into_raw(),
                });
            }
            std::ptr::copy_nonoverlapping(infix.as_ptr(), base.add(infix_at), infix.len());
        }
        Ok(NodeRef { ptr })
    }

    unsafe fn rc_inc(node: NonNull<Self>) -> NonNull<Self> {
        unsafe {
            let rc = &node.as_ref().rc;
            let mut current = rc.load(Relaxed);
            loop {
                if current == u32::MAX {
                    panic!("max refcount exceeded");
                }
                match rc.compare_exchange(current, current + 1, Relaxed, Relaxed) {
                    Ok(_) => return node,
                    Err(v) => current = v,
                }
            }
        }
    }

    /// Drops one reference. Nodes reaching zero are freed together with
    /// every descendant that was only reachable through them.
    unsafe fn rc_dec(node: NonNull<Self>) {
        unsafe {
            if node.as_ref().rc.fetch_sub(1, Release) != 1 {
                return;
            }
            atomic::fence(Acquire);

            let mut pending = vec![node];
            while let Some(node) = pending.pop() {
                let ptr = NodePtr::new(node);
                for edge in ptr.edges() {
                    if edge.node.as_ref().rc.fetch_sub(1, Release) == 1 {
                        atomic::fence(Acquire);
                        pending.push(edge.node);
                    }
                }
                let header = node.as_ref();
                match layout(header.child_count as usize, header.infix_len as usize) {
                    Ok((layout, _, _)) => Arena::global().deallocate(node.cast(), layout),
                    Err(err) => tracing::error!(%err, "leaking node with unreadable layout"),
                }
            }
        }
    }
}

/// A borrowed view of a node that stays valid for `'a`, the lifetime of
/// whatever keeps the node alive.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodePtr<'a> {
    ptr: NonNull<Node>,
    _owner: PhantomData<&'a Node>,
}

impl<'a> NodePtr<'a> {
    /// # Safety
    /// `ptr` must point at a live node that outlives `'a`.
    pub(crate) unsafe fn new(ptr: NonNull<Node>) -> Self {
        Self {
            ptr,
            _owner: PhantomData,
        }
    }

    fn header(self) -> &'a Node {
        unsafe { self.ptr.as_ref() }
    }

    pub(crate) fn addr(self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub(crate) fn is_terminal(self) -> bool {
        self.header().terminal
    }

    pub(crate) fn key_count(self) -> u64 {
        self.header().key_count
    }

    pub(crate) fn bytes(self) -> u64 {
        self.header().bytes
    }

    pub(crate) fn key_hash(self) -> u128 {
        self.header().key_hash
    }

    pub(crate) fn hash(self) -> u128 {
        self.header().hash
    }

    pub(crate) fn longest(self) -> u32 {
        self.header().longest
    }

    pub(crate) fn child_count(self) -> usize {
        self.header().child_count as usize
    }

    pub(crate) fn ref_count(self) -> u32 {
        self.header().rc.load(Acquire)
    }

    fn layout(self) -> (Layout, usize, usize) {
        let header = self.header();
        // The layout was computed successfully when the node was built.
        match layout(header.child_count as usize, header.infix_len as usize) {
            Ok(layout) => layout,
            Err(_) => unreachable!("node layout was valid at construction"),
        }
    }

    fn offsets(self) -> (usize, usize) {
        let (_, edges_at, infix_at) = self.layout();
        (edges_at, infix_at)
    }

    /// Size of this node's own allocation.
    pub(crate) fn alloc_size(self) -> usize {
        self.layout().0.size()
    }

    pub(crate) fn edges(self) -> &'a [Edge] {
        let (edges_at, _) = self.offsets();
        unsafe {
            let edges = (self.ptr.as_ptr() as *const u8).add(edges_at) as *const Edge;
            std::slice::from_raw_parts(edges, self.child_count())
        }
    }

    pub(crate) fn infix(self) -> &'a [u8] {
        let (_, infix_at) = self.offsets();
        unsafe {
            let infix = (self.ptr.as_ptr() as *const u8).add(infix_at);
            std::slice::from_raw_parts(infix, self.header().infix_len as usize)
        }
    }

    pub(crate) fn child_at(self, index: usize) -> NodePtr<'a> {
        unsafe { NodePtr::new(self.edges()[index].node) }
    }

    /// Binary search over the edge bytes.
    pub(crate) fn find(self, byte: u8) -> std::result::Result<usize, usize> {
        self.edges().binary_search_by_key(&byte, |edge| edge.byte)
    }

    /// Takes a new reference on this node.
    pub(crate) fn to_ref(self) -> NodeRef {
        unsafe {
            NodeRef {
                ptr: Node::rc_inc(self.ptr),
            }
        }
    }

    /// Fresh references to every child, ready to be handed to
    /// [`Node::build`].
    pub(crate) fn children(self) -> Children {
        let mut children = Children::new();
        for (i, edge) in self.edges().iter().enumerate() {
            children.push((edge.byte, self.child_at(i).to_ref()));
        }
        children
    }

    /// Copy of this node under a different infix, sharing all children.
    pub(crate) fn with_infix(self, infix: &[u8]) -> Result<NodeRef> {
        Node::build(self.is_terminal(), self.key_hash(), infix, self.children())
    }
}

/// An owned reference to a node.
pub(crate) struct NodeRef {
    ptr: NonNull<Node>,
}

unsafe impl Send for NodeRef {}
unsafe impl Sync for NodeRef {}

impl NodeRef {
    pub(crate) fn ptr(&self) -> NodePtr<'_> {
        unsafe { NodePtr::new(self.ptr) }
    }

    pub(crate) fn as_non_null(&self) -> NonNull<Node> {
        self.ptr
    }

    fn into_raw(self) -> NonNull<Node> {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }
}

impl Clone for NodeRef {
    fn clone(&self) -> Self {
        self.ptr().to_ref()
    }
}

impl Drop for NodeRef {
    fn drop(&mut self) {
        unsafe { Node::rc_dec(self.ptr) }
    }
}
