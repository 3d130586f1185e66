// Caller-tunable knobs for `Volume::open`: sector-cache sizing, stretch-loop
// cancellation, diagnostics sink, and protector iteration order.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::observer::Observer;

const DEFAULT_CACHE_CAPACITY: usize = 64;

/// Configuration passed to `Volume::open`. Construct with `OpenOptions::default()`
/// and adjust via the builder methods.
#[derive(Clone)]
pub struct OpenOptions {
    pub(crate) cache_capacity: usize,
    pub(crate) abort: Option<Arc<AtomicBool>>,
    pub(crate) observer: Option<Arc<dyn Observer>>,
    pub(crate) protector_order: Option<Vec<usize>>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            abort: None,
            observer: None,
            protector_order: None,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recently decrypted sectors kept in the LRU cache. Zero
    /// disables caching entirely (every read re-decrypts).
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Shared flag polled every 4,096 stretch-loop iterations; setting it
    /// cancels an in-progress unlock with `abort_requested`.
    pub fn abort(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = Some(abort);
        self
    }

    /// Diagnostics sink. Defaults to a `LogObserver` forwarding to the `log`
    /// facade when none is supplied.
    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Overrides the default metadata-order protector iteration with an
    /// explicit index permutation, for diagnostics and tests.
    pub fn protector_order(mut self, order: Vec<usize>) -> Self {
        self.protector_order = Some(order);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_defaults() {
        let opts = OpenOptions::default();
        assert_eq!(opts.cache_capacity, DEFAULT_CACHE_CAPACITY);
        assert!(opts.abort.is_none());
        assert!(opts.observer.is_none());
        assert!(opts.protector_order.is_none());
    }

    #[test]
    fn builder_methods_chain() {
        let opts = OpenOptions::new().cache_capacity(8).protector_order(vec![1, 0]);
        assert_eq!(opts.cache_capacity, 8);
        assert_eq!(opts.protector_order, Some(vec![1, 0]));
    }
}
