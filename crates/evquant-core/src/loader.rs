//! Batch loader over an [`EventStore`].
//!
//! Each pass draws a fresh random order. With `num_workers == 0` batches are
//! assembled on the calling thread; otherwise worker `w` assembles batches
//! `w, w + n, w + 2n, ...` and hands them over a bounded channel, and the
//! consumer receives them round-robin so batch order matches the
//! synchronous path exactly.

use crate::config::TrainConfig;
use crate::dataset::EventStore;
use crate::error::{Error, Result};
use crate::events::{Device, EventBatch};
use crossbeam_channel::{Receiver, bounded};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoaderOptions {
    pub batch_size: usize,
    pub num_workers: usize,
    pub pin_memory: bool,
    pub shuffle: bool,
    pub seed: u64,
}

impl LoaderOptions {
    pub fn from_config(config: &TrainConfig, seed: u64) -> Self {
        Self {
            batch_size: config.batch_size,
            num_workers: config.num_workers,
            pin_memory: config.pin_memory,
            shuffle: true,
            seed,
        }
    }
}

pub struct Loader {
    store: Arc<dyn EventStore>,
    options: LoaderOptions,
    device: Device,
    passes: u64,
}

impl Loader {
    pub fn new(store: Arc<dyn EventStore>, options: LoaderOptions, device: Device) -> Self {
        debug_assert!(options.batch_size > 0);
        Self { store, options, device, passes: 0 }
    }

    /// Number of batches per pass (the final batch may be short)
    pub fn len(&self) -> usize {
        self.store.len().div_ceil(self.options.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Sample order for the given pass
    fn order(&self, pass: u64) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.store.len()).collect();
        if self.options.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.options.seed.wrapping_add(pass));
            indices.shuffle(&mut rng);
        }
        indices
    }

    /// Start a new pass over the store
    pub fn iter(&mut self) -> BatchIter {
        let pass = self.passes;
        self.passes += 1;
        let order: Arc<[usize]> = self.order(pass).into();
        let num_batches = self.len();
        let batch_size = self.options.batch_size;

        let source = if self.options.num_workers == 0 || num_batches == 0 {
            BatchSource::Sync { store: Arc::clone(&self.store), order }
        } else {
            let workers = self.options.num_workers.min(num_batches);
            let mut receivers = Vec::with_capacity(workers);
            let mut handles = Vec::with_capacity(workers);
            for worker in 0..workers {
                let (tx, rx) = bounded::<Result<EventBatch>>(1);
                let store = Arc::clone(&self.store);
                let order = Arc::clone(&order);
                handles.push(std::thread::spawn(move || {
                    for batch in (worker..num_batches).step_by(workers) {
                        let assembled = assemble(store.as_ref(), &order, batch, batch_size);
                        if tx.send(assembled).is_err() {
                            break; // receiver dropped
                        }
                    }
                }));
                receivers.push(rx);
            }
            BatchSource::Prefetch { receivers, handles }
        };

        BatchIter {
            source,
            next: 0,
            num_batches,
            batch_size,
            device: self.device,
            pin_memory: self.options.pin_memory,
        }
    }
}

fn assemble(store: &dyn EventStore, order: &[usize], batch: usize, batch_size: usize) -> Result<EventBatch> {
    let start = batch * batch_size;
    let end = (start + batch_size).min(order.len());
    let samples = order[start..end]
        .iter()
        .map(|&index| store.get(index))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(EventBatch::collate(samples))
}

enum BatchSource {
    Sync { store: Arc<dyn EventStore>, order: Arc<[usize]> },
    Prefetch { receivers: Vec<Receiver<Result<EventBatch>>>, handles: Vec<JoinHandle<()>> },
}

/// One pass of batches, each already transferred to the device
pub struct BatchIter {
    source: BatchSource,
    next: usize,
    num_batches: usize,
    batch_size: usize,
    device: Device,
    pin_memory: bool,
}

impl Iterator for BatchIter {
    type Item = Result<EventBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.num_batches {
            return None;
        }
        let batch = self.next;
        self.next += 1;
        let assembled = match &self.source {
            BatchSource::Sync { store, order } => assemble(store.as_ref(), order, batch, self.batch_size),
            BatchSource::Prefetch { receivers, .. } => receivers[batch % receivers.len()]
                .recv()
                .unwrap_or(Err(Error::LoaderDisconnected { batch })),
        };
        Some(assembled.map(|b| b.to_device(&self.device, self.pin_memory)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.num_batches - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for BatchIter {}

impl Drop for BatchIter {
    fn drop(&mut self) {
        if let BatchSource::Prefetch { receivers, handles } = &mut self.source {
            // Dropping the receivers unblocks any worker stuck in send
            receivers.clear();
            for handle in handles.drain(..) {
                if handle.join().is_err() {
                    log::warn!("loader worker panicked");
                }
            }
        }
    }
}
