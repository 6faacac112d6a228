//! Windowed in-memory view of recent samples
//!
//! One [`RingBuffer`] per kind. CPU and memory keep the full
//! `max_history_points`; the heavier multi-entity kinds keep a fraction of
//! it so the view stays small.

use crate::error::SamplerResult;
use crate::ring_buffer::RingBuffer;
use crate::{MetricKind, Sample};

/// Smallest capacity any kind is given
const MIN_CAPACITY: usize = 10;

/// Capacity of the buffer for `kind` when the history is `max_points` long.
pub fn capacity_for(kind: MetricKind, max_points: usize) -> usize {
    match kind {
        MetricKind::Cpu | MetricKind::Memory => max_points,
        MetricKind::Disk | MetricKind::Network => (max_points / 5).max(MIN_CAPACITY),
        MetricKind::Processes => (max_points / 15).max(MIN_CAPACITY),
    }
}

#[derive(Debug, Clone)]
pub struct LiveHistory {
    cpu: RingBuffer<Sample>,
    memory: RingBuffer<Sample>,
    disk: RingBuffer<Sample>,
    network: RingBuffer<Sample>,
    processes: RingBuffer<Sample>,
    max_points: usize,
}

impl LiveHistory {
    pub fn new(max_points: usize) -> SamplerResult<Self> {
        Ok(Self {
            cpu: RingBuffer::new(capacity_for(MetricKind::Cpu, max_points))?,
            memory: RingBuffer::new(capacity_for(MetricKind::Memory, max_points))?,
            disk: RingBuffer::new(capacity_for(MetricKind::Disk, max_points))?,
            network: RingBuffer::new(capacity_for(MetricKind::Network, max_points))?,
            processes: RingBuffer::new(capacity_for(MetricKind::Processes, max_points))?,
            max_points,
        })
    }

    pub fn max_points(&self) -> usize {
        self.max_points
    }

    fn buffer(&self, kind: MetricKind) -> &RingBuffer<Sample> {
        match kind {
            MetricKind::Cpu => &self.cpu,
            MetricKind::Memory => &self.memory,
            MetricKind::Disk => &self.disk,
            MetricKind::Network => &self.network,
            MetricKind::Processes => &self.processes,
        }
    }

    fn buffer_mut(&mut self, kind: MetricKind) -> &mut RingBuffer<Sample> {
        match kind {
            MetricKind::Cpu => &mut self.cpu,
            MetricKind::Memory => &mut self.memory,
            MetricKind::Disk => &mut self.disk,
            MetricKind::Network => &mut self.network,
            MetricKind::Processes => &mut self.processes,
        }
    }

    /// Push a sample into the buffer of its kind.
    pub fn ingest(&mut self, sample: Sample) {
        self.buffer_mut(sample.kind()).push(sample);
    }

    /// Recompute every capacity for a new history length, keeping the newest
    /// samples that fit.
    pub fn resize(&mut self, max_points: usize) -> SamplerResult<()> {
        for kind in MetricKind::ALL {
            self.buffer_mut(kind)
                .resize(capacity_for(kind, max_points))?;
        }
        self.max_points = max_points;
        Ok(())
    }

    /// Empty one kind, or every kind with `None`.
    pub fn clear(&mut self, kind: Option<MetricKind>) {
        match kind {
            Some(kind) => self.buffer_mut(kind).clear(),
            None => {
                for kind in MetricKind::ALL {
                    self.buffer_mut(kind).clear();
                }
            }
        }
    }

    pub fn all(&self, kind: MetricKind) -> Vec<Sample> {
        self.buffer(kind).all()
    }

    pub fn recent(&self, kind: MetricKind, count: i64) -> Vec<Sample> {
        self.buffer(kind).recent(count)
    }

    pub fn latest(&self, kind: MetricKind) -> Option<&Sample> {
        self.buffer(kind).latest()
    }

    pub fn len(&self, kind: MetricKind) -> usize {
        self.buffer(kind).len()
    }

    pub fn capacity(&self, kind: MetricKind) -> usize {
        self.buffer(kind).capacity()
    }
}
