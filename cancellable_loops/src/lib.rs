//! # cancellable_loops
//!
//! A small utility crate for creating cancellable loops in both sequential and parallel contexts.
//!
//! Cancellation is requested through a [`CancelToken`], a cloneable handle around an atomic flag.
//! Requesting cancellation is monotonic: once set, the token stays cancelled. Loops poll the token
//! once per item and never block on it, so an item that is already running always completes.
//!
//! ## Features
//!
//! - Sequential loop with cancellation support
//! - Parallel map with cancellation support and per-worker state using Rayon
//!
//! ## Example
//!
//! ```
//! use cancellable_loops::{for_each_cancellable, CancelToken};
//!
//! let token = CancelToken::new();
//! let mut processed = Vec::new();
//!
//! let completed = for_each_cancellable(0..10, &token, |i| {
//!     processed.push(i);
//!     if i == 3 {
//!         token.cancel();
//!     }
//! });
//!
//! assert!(!completed);
//! assert_eq!(processed, vec![0, 1, 2, 3]);
//! ```

use rayon::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared cancellation flag.
///
/// Clones refer to the same flag. The flag can only go from "running" to "cancelled".
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Returns `true` once cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Executes a sequential loop that can be cancelled via a [`CancelToken`].
///
/// The token is checked before each item. Returns `true` if every item was processed and
/// `false` if the loop stopped early.
///
/// # Arguments
///
/// * `iter` - Any iterator to process
/// * `token` - Cancellation token polled once per item
/// * `func` - A function to apply to each element in the iterator
///
/// # Examples
///
/// ```
/// use cancellable_loops::{for_each_cancellable, CancelToken};
///
/// let token = CancelToken::new();
/// let mut sum = 0;
///
/// let completed = for_each_cancellable(1..=10, &token, |i| {
///     sum += i;
///     if sum > 15 {
///         token.cancel();
///     }
/// });
///
/// // 1 + 2 + 3 + 4 + 5 + 6 = 21 is the first partial sum above 15
/// assert!(!completed);
/// assert_eq!(sum, 21);
/// ```
pub fn for_each_cancellable<I, F, T>(iter: I, token: &CancelToken, mut func: F) -> bool
where
    I: IntoIterator<Item = T>,
    F: FnMut(T),
{
    for item in iter {
        if token.is_cancelled() {
            return false;
        }
        func(item);
    }
    true
}

/// Maps items in parallel with per-worker state, skipping the remaining items once cancelled.
///
/// `init` is called by Rayon whenever a worker starts a new chunk of work, so the state it
/// returns is never shared between concurrently running items. The output has one entry per
/// input item, in input order; items skipped due to cancellation are `None`.
///
/// # Arguments
///
/// * `iter` - Any indexed parallel iterator to process
/// * `token` - Cancellation token polled once per item
/// * `init` - Creates the per-worker state (scratch buffers, plans, ...)
/// * `func` - A function mapping an item to its result using the worker state
///
/// # Examples
///
/// ```
/// use cancellable_loops::{par_map_init_cancellable, CancelToken};
///
/// let token = CancelToken::new();
/// let squares = par_map_init_cancellable(
///     0..8usize,
///     &token,
///     || Vec::<usize>::with_capacity(4),
///     |scratch, i| {
///         scratch.clear();
///         scratch.push(i * i);
///         scratch[0]
///     },
/// );
///
/// assert_eq!(squares[3], Some(9));
/// assert_eq!(squares.len(), 8);
/// ```
pub fn par_map_init_cancellable<I, S, INIT, F, R>(
    iter: I,
    token: &CancelToken,
    init: INIT,
    func: F,
) -> Vec<Option<R>>
where
    I: IntoParallelIterator,
    I::Iter: IndexedParallelIterator,
    INIT: Fn() -> S + Sync + Send,
    F: Fn(&mut S, I::Item) -> R + Sync + Send,
    R: Send,
{
    iter.into_par_iter()
        .map_init(init, |state, item| {
            if token.is_cancelled() {
                None
            } else {
                Some(func(state, item))
            }
        })
        .collect()
}

/// Sequential counterpart of [`par_map_init_cancellable`] using a single state value.
pub fn map_init_cancellable<I, S, F, R>(
    iter: I,
    token: &CancelToken,
    state: &mut S,
    mut func: F,
) -> Vec<Option<R>>
where
    I: IntoIterator,
    F: FnMut(&mut S, I::Item) -> R,
{
    iter.into_iter()
        .map(|item| {
            if token.is_cancelled() {
                None
            } else {
                Some(func(state, item))
            }
        })
        .collect()
}
