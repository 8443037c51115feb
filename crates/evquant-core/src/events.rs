//! Event records, per-sample streams, and the variable-length batch.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Brightness-change direction of an event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Polarity {
    Negative,
    Positive,
}

impl Polarity {
    /// Strictly positive raw values are positive events; everything else
    /// (0, -1) is negative.
    pub fn from_raw(value: f64) -> Self {
        if value > 0.0 { Polarity::Positive } else { Polarity::Negative }
    }

    /// Channel-group index: 0 for negative, 1 for positive
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Polarity::Negative => 0,
            Polarity::Positive => 1,
        }
    }
}

/// A single event
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Event {
    pub x: u16,
    pub y: u16,
    pub t: f32,
    pub polarity: Polarity,
}

impl Event {
    pub fn new(x: u16, y: u16, t: f32, polarity: Polarity) -> Self {
        Self { x, y, t, polarity }
    }
}

/// Events of one recording; may be empty
pub type EventStream = Vec<Event>;

/// One labelled recording
#[derive(Clone, Debug, PartialEq)]
pub struct EventSample {
    pub events: EventStream,
    pub label: usize,
}

impl EventSample {
    pub fn new(events: EventStream, label: usize) -> Self {
        Self { events, label }
    }
}

/// Variable-length batch of event streams.
///
/// All events are packed into one buffer; stream `i` spans
/// `events[offsets[i]..offsets[i + 1]]`. Empty streams occupy zero-width
/// ranges, so the sample index of every event is recoverable.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventBatch {
    events: Vec<Event>,
    offsets: Vec<usize>,
    labels: Vec<usize>,
}

impl EventBatch {
    /// Concatenate samples into one batch, preserving sample order
    pub fn collate(samples: Vec<EventSample>) -> Self {
        let total: usize = samples.iter().map(|s| s.events.len()).sum();
        let mut events = Vec::with_capacity(total);
        let mut offsets = Vec::with_capacity(samples.len() + 1);
        let mut labels = Vec::with_capacity(samples.len());
        offsets.push(0);
        for sample in samples {
            events.extend_from_slice(&sample.events);
            offsets.push(events.len());
            labels.push(sample.label);
        }
        Self { events, offsets, labels }
    }

    /// Number of samples (B)
    pub fn num_samples(&self) -> usize {
        self.labels.len()
    }

    /// Total number of events across all samples
    pub fn size(&self) -> usize {
        self.events.len()
    }

    /// True when the batch carries no events at all.
    ///
    /// Such batches are skipped by every phase.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Events of sample `index`
    pub fn stream(&self, index: usize) -> &[Event] {
        &self.events[self.offsets[index]..self.offsets[index + 1]]
    }

    pub fn streams(&self) -> impl Iterator<Item = &[Event]> {
        self.offsets.windows(2).map(|w| &self.events[w[0]..w[1]])
    }

    /// Move the batch to the compute device.
    ///
    /// Only host memory exists here; pinning compacts the buffers so the
    /// batch holds exactly its contents.
    pub fn to_device(mut self, device: &Device, pin_memory: bool) -> Self {
        match device {
            Device::Cpu(_) => {
                if pin_memory {
                    self.events.shrink_to_fit();
                    self.offsets.shrink_to_fit();
                    self.labels.shrink_to_fit();
                }
                self
            }
        }
    }
}

/// Compute device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Device {
    Cpu(Option<usize>),
}

impl Default for Device {
    fn default() -> Self {
        Device::Cpu(None)
    }
}

impl FromStr for Device {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "cpu" {
            return Ok(Device::Cpu(None));
        }
        if let Some(ordinal) = s.strip_prefix("cpu:") {
            return ordinal
                .parse::<usize>()
                .map(|n| Device::Cpu(Some(n)))
                .map_err(|_| ConfigError::UnsupportedDevice(s.to_string()));
        }
        Err(ConfigError::UnsupportedDevice(s.to_string()))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu(None) => write!(f, "cpu"),
            Device::Cpu(Some(n)) => write!(f, "cpu:{n}"),
        }
    }
}
