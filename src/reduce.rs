//! Early-terminating reduction over a sequence of keys.
//!
//! Producers of keys implement [`Reducible`]. The step function sees each
//! key as a borrowed slice that is only valid during the call; it returns
//! [`ControlFlow::Continue`] to ask for the next key or
//! [`ControlFlow::Break`] to stop. Whatever way the reduction ends, every
//! buffer it allocated has been released by the time it returns.

use std::convert::Infallible;
use std::ops::ControlFlow;

use crate::error::{BoxError, Result};

pub trait Reducible: Sized {
    /// Folds `step` over the keys, stopping at the first `Break` or error.
    ///
    /// An error returned by `step` is surfaced as
    /// [`TrieError::Consumer`](crate::TrieError::Consumer).
    fn try_reduce<Acc, E, F>(self, init: Acc, step: F) -> Result<Acc>
    where
        F: FnMut(Acc, &[u8]) -> std::result::Result<ControlFlow<Acc, Acc>, E>,
        E: Into<BoxError>;

    fn reduce<Acc, F>(self, init: Acc, mut step: F) -> Result<Acc>
    where
        F: FnMut(Acc, &[u8]) -> ControlFlow<Acc, Acc>,
    {
        self.try_reduce(init, |acc, key| Ok::<_, Infallible>(step(acc, key)))
    }

    /// The first key in iteration order.
    fn first_key(self) -> Result<Option<Vec<u8>>> {
        self.reduce(None, |_, key| ControlFlow::Break(Some(key.to_vec())))
    }

    fn collect_keys(self) -> Result<Vec<Vec<u8>>> {
        self.reduce(Vec::new(), |mut keys, key| {
            keys.push(key.to_vec());
            ControlFlow::Continue(keys)
        })
    }

    fn count_keys(self) -> Result<u64> {
        self.reduce(0, |count, _| ControlFlow::Continue(count + 1))
    }

    fn for_each_key<F>(self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8]),
    {
        self.reduce((), |(), key| {
            f(key);
            ControlFlow::Continue(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrieError;

    struct Keys(Vec<&'static [u8]>);

    impl Reducible for Keys {
        fn try_reduce<Acc, E, F>(self, init: Acc, mut step: F) -> Result<Acc>
        where
            F: FnMut(Acc, &[u8]) -> std::result::Result<ControlFlow<Acc, Acc>, E>,
            E: Into<BoxError>,
        {
            let mut acc = init;
            for key in self.0 {
                match step(acc, key).map_err(TrieError::consumer)? {
                    ControlFlow::Continue(next) => acc = next,
                    ControlFlow::Break(done) => return Ok(done),
                }
            }
            Ok(acc)
        }
    }

    fn keys() -> Keys {
        Keys(vec![b"a", b"b", b"c"])
    }

    #[test]
    fn provided_reductions() {
        assert_eq!(keys().first_key().unwrap(), Some(b"a".to_vec()));
        assert_eq!(keys().count_keys().unwrap(), 3);
        assert_eq!(
            keys().collect_keys().unwrap(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
        assert_eq!(Keys(vec![]).first_key().unwrap(), None);
    }

    #[test]
    fn break_stops_early() {
        let mut seen = 0;
        let last = keys()
            .reduce(None, |_, key| {
                seen += 1;
                if key == b"b" {
                    ControlFlow::Break(Some(key.to_vec()))
                } else {
                    ControlFlow::Continue(None)
                }
            })
            .unwrap();
        assert_eq!(last, Some(b"b".to_vec()));
        assert_eq!(seen, 2);
    }

    #[test]
    fn step_errors_become_consumer_errors() {
        let err = keys()
            .try_reduce(0, |_, _| Err(std::io::Error::other("nope")))
            .unwrap_err();
        assert!(matches!(err, TrieError::Consumer(_)));
    }
}
