use std::fmt;
use std::ops::ControlFlow;

use super::node::NodePtr;
use super::{Direction, TrieVersion};
use crate::buffer::{BufferKind, BufferPool, OpenBuffer, SealedBuffer};
use crate::error::{BoxError, Result, TrieError};
use crate::reduce::Reducible;

/// Finds the node whose subtree holds exactly the keys starting with
/// `prefix`. Returns it with the number of prefix bytes consumed above its
/// infix.
pub(crate) fn locate<'a>(root: NodePtr<'a>, prefix: &[u8]) -> Option<(NodePtr<'a>, usize)> {
    let mut node = root;
    let mut depth = 0;
    loop {
        let rest = &prefix[depth..];
        let infix = node.infix();
        if rest.len() <= infix.len() {
            return infix.starts_with(rest).then_some((node, depth));
        }
        if !rest.starts_with(infix) {
            return None;
        }
        let index = node.find(rest[infix.len()]).ok()?;
        node = node.child_at(index);
        depth += infix.len() + 1;
    }
}

/// A pending prefix query against one version.
///
/// Nothing is traversed until the seek is opened or reduced. The prefix is
/// held in a sealed buffer of the pool until then.
pub struct Seek<'v, 'p> {
    version: &'v TrieVersion,
    pool: &'p BufferPool,
    prefix: SealedBuffer<'p>,
    direction: Direction,
}

impl<'v, 'p> Seek<'v, 'p> {
    pub(crate) fn new(
        version: &'v TrieVersion,
        pool: &'p BufferPool,
        prefix: &[u8],
        direction: Direction,
    ) -> Result<Self> {
        let mut buffer = pool.lease(BufferKind::Key, prefix.len())?;
        buffer.extend_from_slice(prefix)?;
        Ok(Self {
            version,
            pool,
            prefix: buffer.seal()?,
            direction,
        })
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Positions a cursor in front of the first matching key.
    pub fn open(self) -> Result<Cursor<'v, 'p>> {
        let Seek {
            version,
            pool,
            prefix,
            direction,
        } = self;
        let cursor = Cursor::start(version.root(), pool, &prefix, direction)?;
        prefix.release()?;
        Ok(cursor)
    }
}

impl fmt::Debug for Seek<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seek")
            .field("prefix", &self.prefix())
            .field("direction", &self.direction)
            .finish()
    }
}

impl Reducible for Seek<'_, '_> {
    fn try_reduce<Acc, E, F>(self, init: Acc, step: F) -> Result<Acc>
    where
        F: FnMut(Acc, &[u8]) -> std::result::Result<ControlFlow<Acc, Acc>, E>,
        E: Into<BoxError>,
    {
        self.open()?.try_reduce(init, step)
    }
}

struct Frame<'v> {
    node: NodePtr<'v>,
    /// Length of the path up to and including the node's infix.
    path_len: usize,
    visited: usize,
    emitted: bool,
}

enum Step {
    Emit,
    Descend(usize),
    Pop,
}

/// Walks the keys below a prefix, one owned output buffer per key.
///
/// Forward order is lexicographic with a key before its extensions;
/// backward order is the exact reverse. The cursor keeps its path in a
/// pool buffer which is returned once the walk is exhausted or the cursor
/// is closed or dropped.
pub struct Cursor<'v, 'p> {
    pool: &'p BufferPool,
    direction: Direction,
    frames: Vec<Frame<'v>>,
    path: Option<OpenBuffer<'p>>,
}

impl<'v, 'p> Cursor<'v, 'p> {
    fn start(
        root: Option<NodePtr<'v>>,
        pool: &'p BufferPool,
        prefix: &[u8],
        direction: Direction,
    ) -> Result<Self> {
        let mut cursor = Cursor {
            pool,
            direction,
            frames: Vec::new(),
            path: None,
        };
        let Some((node, depth)) = root.and_then(|root| locate(root, prefix)) else {
            return Ok(cursor);
        };
        // Every key below `node` fits behind the consumed prefix bytes.
        let mut path = pool.lease(BufferKind::Cursor, depth + node.longest() as usize)?;
        path.extend_from_slice(&prefix[..depth])?;
        path.extend_from_slice(node.infix())?;
        cursor.frames.push(Frame {
            node,
            path_len: path.len(),
            visited: 0,
            emitted: false,
        });
        cursor.path = Some(path);
        Ok(cursor)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// `true` once no further key will be produced.
    pub fn is_exhausted(&self) -> bool {
        self.path.is_none()
    }

    fn next_step(&mut self) -> Option<Step> {
        let frame = self.frames.last_mut()?;
        let count = frame.node.child_count();
        let terminal = frame.node.is_terminal();
        let step = match self.direction {
            Direction::Forward => {
                if !frame.emitted {
                    frame.emitted = true;
                    if terminal {
                        return Some(Step::Emit);
                    }
                }
                if frame.visited < count {
                    frame.visited += 1;
                    Step::Descend(frame.visited - 1)
                } else {
                    Step::Pop
                }
            }
            Direction::Backward => {
                if frame.visited < count {
                    frame.visited += 1;
                    Step::Descend(count - frame.visited)
                } else if !frame.emitted {
                    frame.emitted = true;
                    if terminal {
                        Step::Emit
                    } else {
                        Step::Pop
                    }
                } else {
                    Step::Pop
                }
            }
        };
        Some(step)
    }

    /// Produces the next key as a sealed output buffer owned by the caller.
    ///
    /// Returns `Ok(None)` once exhausted; the cursor state has been released
    /// at that point.
    pub fn try_advance(&mut self) -> Result<Option<SealedBuffer<'p>>> {
        if self.path.is_none() {
            return Ok(None);
        }
        while let Some(step) = self.next_step() {
            let Some(frame) = self.frames.last() else {
                break;
            };
            let node = frame.node;
            let path_len = frame.path_len;
            let Some(path) = self.path.as_mut() else {
                break;
            };
            match step {
                Step::Emit => {
                    path.truncate(path_len);
                    let mut out = self.pool.output_for(path.len())?;
                    out.extend_from_slice(path.as_slice())?;
                    return out.seal().map(Some);
                }
                Step::Descend(index) => {
                    path.truncate(path_len);
                    let child = node.child_at(index);
                    path.push(node.edges()[index].byte)?;
                    path.extend_from_slice(child.infix())?;
                    self.frames.push(Frame {
                        node: child,
                        path_len: path.len(),
                        visited: 0,
                        emitted: false,
                    });
                }
                Step::Pop => {
                    self.frames.pop();
                }
            }
        }
        self.release_state()?;
        Ok(None)
    }

    fn release_state(&mut self) -> Result<()> {
        self.frames.clear();
        match self.path.take() {
            Some(path) => path.release(),
            None => Ok(()),
        }
    }

    /// Releases the cursor state early. Dropping does the same but cannot
    /// report a failed release.
    pub fn close(mut self) -> Result<()> {
        self.release_state()
    }
}

impl fmt::Debug for Cursor<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("direction", &self.direction)
            .field("depth", &self.frames.len())
            .field("path", &self.path.as_ref().map(OpenBuffer::as_slice))
            .finish()
    }
}

impl Reducible for Cursor<'_, '_> {
    fn try_reduce<Acc, E, F>(mut self, init: Acc, mut step: F) -> Result<Acc>
    where
        F: FnMut(Acc, &[u8]) -> std::result::Result<ControlFlow<Acc, Acc>, E>,
        E: Into<BoxError>,
    {
        let mut acc = init;
        loop {
            let Some(key) = self.try_advance()? else {
                return Ok(acc);
            };
            let outcome = step(acc, &*key);
            key.release()?;
            match outcome {
                Ok(ControlFlow::Continue(next)) => acc = next,
                Ok(ControlFlow::Break(done)) => {
                    self.close()?;
                    return Ok(done);
                }
                Err(err) => {
                    self.close()?;
                    return Err(TrieError::consumer(err));
                }
            }
        }
    }
}
