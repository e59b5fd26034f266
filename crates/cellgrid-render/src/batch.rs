//! Bounded accumulation of instance records into draw calls.

use crate::error::RenderResult;
use crate::instance::InstanceRecord;

/// Receives the records of one draw call, in append order.
pub trait DrawSink {
    fn draw(&mut self, records: &[InstanceRecord]) -> RenderResult<()>;
}

/// Paint order within a frame. Later layers draw over earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Layer {
    Background,
    Text,
    Decoration,
    Selection,
    Cursor,
}

impl Layer {
    pub const ORDER: [Layer; 5] = [
        Layer::Background,
        Layer::Text,
        Layer::Decoration,
        Layer::Selection,
        Layer::Cursor,
    ];
}

/// Counters since the last [`BatchAssembler::take_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub flushes: u32,
    pub instances: u64,
}

/// Collects records and hands them to a [`DrawSink`] in batches of at most
/// `capacity`. Records are never reordered or dropped.
#[derive(Debug)]
pub struct BatchAssembler {
    pending: Vec<InstanceRecord>,
    capacity: usize,
    stats: BatchStats,
}

impl BatchAssembler {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            pending: Vec::with_capacity(capacity),
            capacity,
            stats: BatchStats::default(),
        }
    }

    /// Append one record, flushing first if the batch is full. If that flush
    /// fails the record is not appended.
    pub fn append(&mut self, record: InstanceRecord, sink: &mut dyn DrawSink) -> RenderResult<()> {
        if self.pending.len() >= self.capacity {
            self.flush(sink)?;
        }
        self.pending.push(record);
        Ok(())
    }

    pub fn extend(
        &mut self,
        records: &[InstanceRecord],
        sink: &mut dyn DrawSink,
    ) -> RenderResult<()> {
        for record in records {
            self.append(*record, sink)?;
        }
        Ok(())
    }

    /// Draw everything pending. Returns `false`, without touching the sink,
    /// when nothing is pending.
    pub fn flush(&mut self, sink: &mut dyn DrawSink) -> RenderResult<bool> {
        if self.pending.is_empty() {
            return Ok(false);
        }
        sink.draw(&self.pending)?;
        self.stats.flushes += 1;
        self.stats.instances += self.pending.len() as u64;
        self.pending.clear();
        Ok(true)
    }

    /// Drop pending records without drawing them.
    pub fn discard(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!("Discarding {} pending instances", self.pending.len());
        }
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn take_stats(&mut self) -> BatchStats {
        std::mem::take(&mut self.stats)
    }
}
