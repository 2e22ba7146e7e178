//! Leadership state shared by the acquisition loop and the dispatcher.
//!
//! The token and the delegate for a term live together in one [`Term`],
//! and the current term is swapped atomically as a whole. A reader that
//! sees a term therefore always sees its fully constructed delegate.
//!
//! Invariants:
//! - at most one term is reachable at a time;
//! - a term's delegate is released exactly once, by whoever removed the
//!   term from the state;
//! - once closed, no term is ever published again.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::delegate::Delegate;
use crate::election::LeadershipToken;

/// One leadership term: the token that won it and the delegate serving it.
pub(crate) struct Term<D> {
    token: LeadershipToken,
    delegate: Arc<D>,
    generation: u64,
}

impl<D> Term<D> {
    pub(crate) fn token(&self) -> &LeadershipToken {
        &self.token
    }

    pub(crate) fn delegate(&self) -> &Arc<D> {
        &self.delegate
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}

pub(crate) struct LeadershipState<D> {
    current: ArcSwapOption<Term<D>>,
    closed: AtomicBool,
    generation: AtomicU64,
}

impl<D: Delegate> LeadershipState<D> {
    pub(crate) fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    /// Publish a freshly built delegate for `token`.
    ///
    /// Returns the published term, or `None` if the state is closed, in
    /// which case the delegate has already been released.
    pub(crate) fn try_publish(&self, token: LeadershipToken, delegate: D) -> Option<Arc<Term<D>>> {
        if self.is_closed() {
            release(&token, &delegate);
            return None;
        }

        let term = Arc::new(Term {
            token,
            delegate: Arc::new(delegate),
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
        });

        if let Some(previous) = self.current.swap(Some(Arc::clone(&term))) {
            tracing::warn!(
                term = previous.token.term(),
                generation = previous.generation,
                "Replacing a term that was never invalidated"
            );
            release(&previous.token, &*previous.delegate);
        }

        // close() may have run between the check above and the swap.
        if self.is_closed() {
            if let Some(term) = self.current.swap(None) {
                release(&term.token, &*term.delegate);
            }
            return None;
        }

        Some(term)
    }

    /// The live term, if any.
    pub(crate) fn current(&self) -> Option<Arc<Term<D>>> {
        self.current.load_full()
    }

    pub(crate) fn current_token(&self) -> Option<LeadershipToken> {
        (*self.current.load()).as_ref().map(|term| term.token.clone())
    }

    /// Whether `term` is still the live term (identity, not equality).
    pub(crate) fn is_current(&self, term: &Arc<Term<D>>) -> bool {
        (*self.current.load())
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, term))
    }

    /// End `term` if it is still live.
    ///
    /// Returns `true` only for the single caller that performed the
    /// transition; that caller's invocation also released the delegate.
    pub(crate) fn invalidate(&self, term: &Arc<Term<D>>) -> bool {
        let expected = Some(Arc::clone(term));
        let previous = self.current.compare_and_swap(&expected, None);
        let won = matches!(&*previous, Some(swapped) if Arc::ptr_eq(swapped, term));
        if won {
            release(&term.token, &*term.delegate);
        }
        won
    }

    /// Close the state and release the live delegate, if any.
    ///
    /// Returns `true` for the first call only.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(term) = self.current.swap(None) {
            release(&term.token, &*term.delegate);
        }
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn release<D: Delegate>(token: &LeadershipToken, delegate: &D) {
    if let Err(e) = delegate.close() {
        tracing::warn!(term = token.term(), "Problem closing delegate: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Tracked {
        closes: Arc<AtomicUsize>,
    }

    impl Delegate for Tracked {
        fn close(&self) -> Result<(), BoxError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn tracked() -> (Tracked, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        (
            Tracked {
                closes: Arc::clone(&closes),
            },
            closes,
        )
    }

    #[test]
    fn test_publish_then_read() {
        let state = LeadershipState::new();
        assert!(state.current().is_none());

        let token = LeadershipToken::new(1);
        let term = state.try_publish(token.clone(), Tracked::default()).unwrap();

        assert_eq!(state.current_token(), Some(token));
        assert!(state.is_current(&term));
        assert_eq!(term.generation(), 1);
    }

    #[test]
    fn test_invalidate_has_single_winner() {
        let state = LeadershipState::new();
        let (delegate, closes) = tracked();
        let term = state.try_publish(LeadershipToken::new(1), delegate).unwrap();

        assert!(state.invalidate(&term));
        assert!(!state.invalidate(&term));
        assert!(state.current().is_none());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalidate_stale_term_leaves_new_term() {
        let state = LeadershipState::new();
        let (first, first_closes) = tracked();
        let (second, second_closes) = tracked();

        let old = state.try_publish(LeadershipToken::new(1), first).unwrap();
        assert!(state.invalidate(&old));
        let new = state.try_publish(LeadershipToken::new(2), second).unwrap();

        assert!(!state.invalidate(&old), "old term must not clear the new one");
        assert!(state.is_current(&new));
        assert_eq!(first_closes.load(Ordering::SeqCst), 1);
        assert_eq!(second_closes.load(Ordering::SeqCst), 0);
        assert_eq!(new.generation(), 2);
    }

    #[test]
    fn test_publish_after_close_releases_immediately() {
        let state = LeadershipState::new();
        assert!(state.close());

        let (delegate, closes) = tracked();
        assert!(state.try_publish(LeadershipToken::new(1), delegate).is_none());
        assert!(state.current().is_none());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let state = LeadershipState::new();
        let (delegate, closes) = tracked();
        state.try_publish(LeadershipToken::new(1), delegate).unwrap();

        assert!(state.close());
        assert!(!state.close());
        assert!(state.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_invalidate_and_close_release_once() {
        for _ in 0..200 {
            let state = Arc::new(LeadershipState::new());
            let (delegate, closes) = tracked();
            let term = state.try_publish(LeadershipToken::new(1), delegate).unwrap();

            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let state = Arc::clone(&state);
                    let term = Arc::clone(&term);
                    std::thread::spawn(move || {
                        if i == 0 {
                            state.close();
                        } else {
                            state.invalidate(&term);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(closes.load(Ordering::SeqCst), 1);
        }
    }
}
