//! Labelled event stores.

mod ncaltech;

pub use ncaltech::{NCaltech101, read_npy_events};

use crate::error::DatasetError;
use crate::events::EventSample;

/// Random-access source of labelled event streams.
///
/// Stores are shared read-only between the loader's worker threads.
pub trait EventStore: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Result<EventSample, DatasetError>;

    /// Class names; a sample's label indexes into this list
    fn classes(&self) -> &[String];
}

/// Store backed by samples already in memory
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    samples: Vec<EventSample>,
    classes: Vec<String>,
}

impl InMemoryStore {
    pub fn new(samples: Vec<EventSample>, classes: Vec<String>) -> Self {
        Self { samples, classes }
    }
}

impl EventStore for InMemoryStore {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<EventSample, DatasetError> {
        self.samples
            .get(index)
            .cloned()
            .ok_or(DatasetError::IndexOutOfRange { index, len: self.samples.len() })
    }

    fn classes(&self) -> &[String] {
        &self.classes
    }
}
