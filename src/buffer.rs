//! Scoped byte buffers carved from the [`Arena`].
//!
//! A buffer is either open (writable), sealed (a read-only view of what was
//! written) or released. The only legal path is open → sealed → released,
//! where sealing is optional. Both guard types release on drop, so every
//! exit path, including `?` and unwinding, returns the memory. Calling
//! [`OpenBuffer::release`] or [`SealedBuffer::release`] instead surfaces
//! release failures to the caller.

use std::alloc::Layout;
use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use dashmap::DashMap;

use crate::arena::Arena;
use crate::config::config;
use crate::error::{Result, TrieError};

/// Intent of a buffer, only used for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Obtained through [`BufferPool::alloc`].
    Scratch,
    /// A copy of a caller supplied key or prefix.
    Key,
    /// Trie-produced output, see [`BufferPool::output`].
    Output,
    /// Iterator state of a [`Cursor`](crate::Cursor).
    Cursor,
}

/// Identifies a buffer within its pool. Tokens are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferToken(u64);

impl fmt::Display for BufferToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Sealed,
}

#[derive(Debug)]
struct Slot {
    addr: usize,
    layout: Layout,
    state: State,
}

/// Allocation counters of a [`BufferPool`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub scratch: u64,
    pub key: u64,
    pub output: u64,
    pub cursor: u64,
    pub released: u64,
    pub outstanding: usize,
}

impl BufferStats {
    /// Total number of buffers ever handed out.
    pub fn allocated(&self) -> u64 {
        self.scratch + self.key + self.output + self.cursor
    }
}

pub struct BufferPool {
    arena: &'static Arena,
    output_len: usize,
    slots: DashMap<BufferToken, Slot>,
    next_token: AtomicU64,
    allocated: [AtomicU64; 4],
    released: AtomicU64,
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("output_len", &self.output_len)
            .field("stats", &self.stats())
            .finish()
    }
}

impl BufferPool {
    /// A pool drawing from the global arena.
    pub fn new(output_len: usize) -> Self {
        Self::with_arena(Arena::global(), output_len)
    }

    pub fn with_arena(arena: &'static Arena, output_len: usize) -> Self {
        Self {
            arena,
            output_len,
            slots: DashMap::new(),
            next_token: AtomicU64::new(0),
            allocated: Default::default(),
            released: AtomicU64::new(0),
        }
    }

    /// The process-wide pool used by [`TrieVersion::seek`](crate::TrieVersion::seek).
    pub fn global() -> &'static BufferPool {
        static POOL: OnceLock<BufferPool> = OnceLock::new();
        POOL.get_or_init(|| BufferPool::new(config().output_buffer_len))
    }

    pub fn output_len(&self) -> usize {
        self.output_len
    }

    /// Allocates a writable buffer of at least `size` bytes.
    pub fn alloc(&self, size: usize) -> Result<OpenBuffer<'_>> {
        self.lease(BufferKind::Scratch, size)
    }

    /// Allocates a buffer sized for trie-produced keys.
    pub fn output(&self) -> Result<OpenBuffer<'_>> {
        self.lease(BufferKind::Output, self.output_len)
    }

    /// An output buffer that holds at least `len` bytes, for keys longer
    /// than this pool's output length.
    pub(crate) fn output_for(&self, len: usize) -> Result<OpenBuffer<'_>> {
        self.lease(BufferKind::Output, self.output_len.max(len))
    }

    pub(crate) fn lease(&self, kind: BufferKind, size: usize) -> Result<OpenBuffer<'_>> {
        let layout = Layout::from_size_align(size.max(1), 1).map_err(|_| {
            TrieError::OutOfMemory {
                requested: size,
                in_use: self.arena.in_use(),
                capacity: self.arena.capacity(),
            }
        })?;
        let ptr = self.arena.allocate(layout)?;
        let token = BufferToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.slots.insert(
            token,
            Slot {
                addr: ptr.as_ptr() as usize,
                layout,
                state: State::Open,
            },
        );
        self.allocated[kind as usize].fetch_add(1, Ordering::Relaxed);
        Ok(OpenBuffer {
            lease: Lease {
                pool: self,
                token,
                ptr,
                capacity: size,
            },
            len: 0,
        })
    }

    fn seal_token(&self, token: BufferToken) -> Result<()> {
        let Some(mut slot) = self.slots.get_mut(&token) else {
            return Err(TrieError::invariant(format!(
                "sealing buffer {token} which is not live"
            )));
        };
        match slot.state {
            State::Open => {
                slot.state = State::Sealed;
                Ok(())
            }
            State::Sealed => Err(TrieError::invariant(format!(
                "buffer {token} sealed twice"
            ))),
        }
    }

    /// Returns the buffer identified by `token` to the arena.
    ///
    /// Releasing a token that is not live, because it was already released
    /// or never belonged to this pool, is an
    /// [`InvariantViolation`](TrieError::InvariantViolation) and leaves the
    /// pool untouched.
    ///
    /// # Safety
    /// No [`OpenBuffer`] or [`SealedBuffer`] guard for `token` may still be
    /// alive; the guard would keep pointing at freed memory.
    pub unsafe fn release_token(&self, token: BufferToken) -> Result<()> {
        let Some((_, slot)) = self.slots.remove(&token) else {
            return Err(TrieError::invariant(format!(
                "buffer {token} released twice or never allocated"
            )));
        };
        let ptr = NonNull::new(slot.addr as *mut u8)
            .ok_or_else(|| TrieError::invariant(format!("buffer {token} has a null address")))?;
        unsafe { self.arena.deallocate(ptr, slot.layout) };
        self.released.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Number of buffers that are open or sealed.
    pub fn outstanding(&self) -> usize {
        self.slots.len()
    }

    pub fn stats(&self) -> BufferStats {
        let count = |kind: BufferKind| self.allocated[kind as usize].load(Ordering::Relaxed);
        BufferStats {
            scratch: count(BufferKind::Scratch),
            key: count(BufferKind::Key),
            output: count(BufferKind::Output),
            cursor: count(BufferKind::Cursor),
            released: self.released.load(Ordering::Relaxed),
            outstanding: self.outstanding(),
        }
    }
}

struct Lease<'p> {
    pool: &'p BufferPool,
    token: BufferToken,
    ptr: NonNull<u8>,
    capacity: usize,
}

impl<'p> Lease<'p> {
    fn release(self) -> Result<()> {
        let this = ManuallyDrop::new(self);
        unsafe { this.pool.release_token(this.token) }
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Err(err) = unsafe { self.pool.release_token(self.token) } {
            tracing::error!(%err, token = %self.token, "buffer release on drop failed");
        }
    }
}

/// A writable buffer owned by the caller until sealed or released.
pub struct OpenBuffer<'p> {
    lease: Lease<'p>,
    len: usize,
}

impl<'p> OpenBuffer<'p> {
    pub fn token(&self) -> BufferToken {
        self.lease.token
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.lease.capacity
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.lease.ptr.as_ptr(), self.len) }
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.len + bytes.len();
        if end > self.capacity() {
            return Err(TrieError::invariant(format!(
                "writing {end} bytes into buffer {} of capacity {}",
                self.lease.token,
                self.capacity()
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.lease.ptr.as_ptr().add(self.len),
                bytes.len(),
            );
        }
        self.len = end;
        Ok(())
    }

    pub fn push(&mut self, byte: u8) -> Result<()> {
        self.extend_from_slice(&[byte])
    }

    /// Shortens the logical length, keeping the allocation.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Finalizes the written length into a read-only view.
    pub fn seal(self) -> Result<SealedBuffer<'p>> {
        self.lease.pool.seal_token(self.lease.token)?;
        Ok(SealedBuffer {
            lease: self.lease,
            len: self.len,
        })
    }

    pub fn release(self) -> Result<()> {
        self.lease.release()
    }
}

impl fmt::Debug for OpenBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenBuffer")
            .field("token", &self.lease.token)
            .field("len", &self.len)
            .field("capacity", &self.lease.capacity)
            .finish()
    }
}

/// A read-only view, valid until released.
pub struct SealedBuffer<'p> {
    lease: Lease<'p>,
    len: usize,
}

impl SealedBuffer<'_> {
    pub fn token(&self) -> BufferToken {
        self.lease.token
    }

    pub fn release(self) -> Result<()> {
        self.lease.release()
    }
}

impl Deref for SealedBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.lease.ptr.as_ptr(), self.len) }
    }
}

impl fmt::Debug for SealedBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedBuffer")
            .field("token", &self.lease.token)
            .field("bytes", &&self[..])
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_seal_release() {
        let pool = BufferPool::new(16);
        let mut buf = pool.output().unwrap();
        assert_eq!(buf.capacity(), 16);
        buf.extend_from_slice(b"hello").unwrap();
        buf.push(b'!').unwrap();
        assert_eq!(buf.as_slice(), b"hello!");
        let sealed = buf.seal().unwrap();
        assert_eq!(&sealed[..], b"hello!");
        assert_eq!(pool.outstanding(), 1);
        sealed.release().unwrap();
        assert_eq!(pool.outstanding(), 0);

        let stats = pool.stats();
        assert_eq!(stats.output, 1);
        assert_eq!(stats.released, 1);
    }

    #[test]
    fn overflow_is_invariant_violation() {
        let pool = BufferPool::new(4);
        let mut buf = pool.alloc(4).unwrap();
        buf.extend_from_slice(b"abcd").unwrap();
        let err = buf.push(b'e').unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(buf.as_slice(), b"abcd");
    }

    #[test]
    fn truncate_keeps_prefix() {
        let pool = BufferPool::new(8);
        let mut buf = pool.alloc(8).unwrap();
        buf.extend_from_slice(b"abcdef").unwrap();
        buf.truncate(2);
        buf.extend_from_slice(b"z").unwrap();
        assert_eq!(buf.as_slice(), b"abz");
        buf.truncate(10);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn drop_releases() {
        let pool = BufferPool::new(8);
        {
            let _open = pool.alloc(3).unwrap();
            let sealed = pool.output().unwrap().seal().unwrap();
            assert_eq!(sealed.len(), 0);
            assert_eq!(pool.outstanding(), 2);
        }
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.stats().released, 2);
    }

    #[test]
    fn release_twice_is_detected() {
        let pool = BufferPool::new(8);
        let buf = pool.alloc(8).unwrap();
        let token = buf.token();
        buf.release().unwrap();
        let err = unsafe { pool.release_token(token) }.unwrap_err();
        assert!(matches!(err, TrieError::InvariantViolation(_)));
        assert_eq!(pool.stats().released, 1);
    }

    #[test]
    fn output_for_grows_past_output_len() {
        let pool = BufferPool::new(4);
        assert_eq!(pool.output_for(2).unwrap().capacity(), 4);
        let mut long = pool.output_for(9).unwrap();
        assert_eq!(long.capacity(), 9);
        long.extend_from_slice(b"ninebytes").unwrap();
        assert_eq!(pool.stats().output, 2);
    }

    #[test]
    fn zero_sized_buffers_are_fine() {
        let pool = BufferPool::new(0);
        let buf = pool.output().unwrap();
        assert_eq!(buf.capacity(), 0);
        assert!(buf.seal().unwrap().is_empty());
        assert_eq!(pool.outstanding(), 0);
    }
}
