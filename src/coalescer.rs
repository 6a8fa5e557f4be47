//! In-flight request coalescer.
//!
//! Maintains `hash → shared-future-of-result` under one map so that at
//! most one OCR job ever runs for a given hash at a time. The
//! coalescer itself only does bookkeeping: deciding whether to admit a
//! new job is atomic with respect to every other caller, but running
//! the job is the executor's job, not this module's.

use dashmap::DashMap;
use futures::future::Shared;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::hash::PageHash;

/// Outcome of one admitted job, shared by every caller that joined it.
pub type JobFuture<R> = Shared<Pin<Box<dyn Future<Output = R> + Send>>>;

/// Registry of in-flight jobs keyed by page hash.
///
/// `submit_or_join` and the registry's single internal mutex are the
/// only things that need to agree: the `DashMap` gives sharded internal
/// locking for reads, but admission decisions still go through one
/// `Mutex` guard so two concurrent uploads racing on the same hash can
/// never both decide "not present, I'll start it".
pub struct Coalescer<R: Clone + Send + 'static> {
    inflight: DashMap<PageHash, JobFuture<R>>,
    admission_lock: Mutex<()>,
}

impl<R: Clone + Send + 'static> Default for Coalescer<R> {
    fn default() -> Self {
        Self {
            inflight: DashMap::new(),
            admission_lock: Mutex::new(()),
        }
    }
}

impl<R: Clone + Send + 'static> Coalescer<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `hash`; if a job is already in flight, return its
    /// shared future. Otherwise call `job_factory` exactly once to
    /// produce a new job future, register it, and return it.
    ///
    /// `job_factory` is expected to hand its work to the executor
    /// and return a future that resolves once the executor has
    /// delivered the result; this function does not run the job
    /// itself.
    pub fn submit_or_join<F>(&self, hash: PageHash, job_factory: F) -> (JobFuture<R>, bool)
    where
        F: FnOnce() -> Pin<Box<dyn Future<Output = R> + Send>>,
    {
        let _guard = self.admission_lock.lock();

        if let Some(existing) = self.inflight.get(&hash) {
            return (existing.clone(), false);
        }

        let future: JobFuture<R> = job_factory().shared();
        self.inflight.insert(hash, future.clone());
        (future, true)
    }

    /// Remove the hash's in-flight entry. Named `remove` rather than
    /// `drop` to avoid colliding with `Drop::drop`. Called exactly once
    /// per admitted job, after its result has been persisted to the
    /// cache.
    pub fn remove(&self, hash: &PageHash) {
        self.inflight.remove(hash);
    }

    pub fn contains(&self, hash: &PageHash) -> bool {
        self.inflight.contains_key(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(n: u32) -> PageHash {
        PageHash::parse(&format!("{n:032}")).unwrap()
    }

    #[tokio::test]
    async fn second_submit_for_same_hash_joins_first() {
        let coalescer: Coalescer<u32> = Coalescer::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let make_factory = |calls: Arc<AtomicUsize>| {
            move || -> Pin<Box<dyn Future<Output = u32> + Send>> {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { 42 })
            }
        };

        let (fut1, admitted1) = coalescer.submit_or_join(key(1), make_factory(calls.clone()));
        let (fut2, admitted2) = coalescer.submit_or_join(key(1), make_factory(calls.clone()));

        assert!(admitted1);
        assert!(!admitted2);
        assert_eq!(fut1.await, 42);
        assert_eq!(fut2.await, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remove_then_submit_admits_a_new_job() {
        let coalescer: Coalescer<u32> = Coalescer::new();
        let k = key(1);

        let (_fut, admitted) = coalescer.submit_or_join(k.clone(), || Box::pin(async { 1 }));
        assert!(admitted);
        assert!(coalescer.contains(&k));

        coalescer.remove(&k);
        assert!(!coalescer.contains(&k));

        let (_fut, admitted_again) = coalescer.submit_or_join(k.clone(), || Box::pin(async { 2 }));
        assert!(admitted_again);
    }

    #[tokio::test]
    async fn contains_reflects_registration() {
        let coalescer: Coalescer<u32> = Coalescer::new();
        let k = key(1);
        assert!(!coalescer.contains(&k));
        coalescer.submit_or_join(k.clone(), || Box::pin(async { 1 }));
        assert!(coalescer.contains(&k));
    }
}
