//! A bounded-disorder sorting stage: records may arrive up to a fixed
//! number of reference positions behind the furthest position already
//! seen on the same contig, and leave in ascending start order.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::cmp::Reverse;

use log::debug;

use crate::error::{Result, WriteError};
use crate::record::VariantRecord;
use crate::types::Header;
use crate::writer::VariantWriter;

struct Queued {
    start: i64,
    seq: u64,
    record: VariantRecord,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.start == other.start && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // ties leave in arrival order
        self.start
            .cmp(&other.start)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Buffers records within a positional window `w` and forwards them in
/// `(contig, start)` order. Records further behind than the window, or
/// on a contig already finished, violate the contract and are refused.
pub struct SortingWriter<V: VariantWriter> {
    inner: V,
    window: i64,
    queue: BinaryHeap<Reverse<Queued>>,
    seq: u64,
    current_contig: Option<String>,
    completed: HashSet<String>,
    watermark: i64,
    close_inner: bool,
}

impl<V: VariantWriter> SortingWriter<V> {
    pub fn new(inner: V, window: i64) -> Self {
        Self::with_ownership(inner, window, true)
    }

    /// `close_inner` decides whether this stage's `close` also closes
    /// the wrapped writer; fixed at construction.
    pub fn with_ownership(inner: V, window: i64, close_inner: bool) -> Self {
        Self {
            inner,
            window,
            queue: BinaryHeap::new(),
            seq: 0,
            current_contig: None,
            completed: HashSet::new(),
            watermark: i64::MIN,
            close_inner,
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn into_inner(self) -> V {
        self.inner
    }

    fn drain_through(&mut self, bound: i64) -> Result<()> {
        while let Some(Reverse(head)) = self.queue.peek() {
            if head.start > bound {
                break;
            }
            let Reverse(queued) = self.queue.pop().expect("peeked head exists");
            self.inner.add(queued.record)?;
        }
        Ok(())
    }

    fn flush_contig(&mut self) -> Result<()> {
        if !self.queue.is_empty() {
            debug!(
                "flushing {} buffered records for contig {:?}",
                self.queue.len(),
                self.current_contig
            );
        }
        self.drain_through(i64::MAX)
    }
}

impl<V: VariantWriter> VariantWriter for SortingWriter<V> {
    fn write_header(&mut self, header: &Header) -> Result<()> {
        self.inner.write_header(header)
    }

    fn add(&mut self, record: VariantRecord) -> Result<()> {
        if self.current_contig.as_deref() != Some(record.chrom.as_str()) {
            self.flush_contig()?;
            if let Some(finished) = self.current_contig.take() {
                self.completed.insert(finished);
            }
            if self.completed.contains(&record.chrom) {
                return Err(WriteError::Ordering(format!(
                    "{}:{}: contig {} reappears after being finished",
                    record.chrom, record.start, record.chrom
                )));
            }
            self.current_contig = Some(record.chrom.clone());
            self.watermark = i64::MIN;
        }

        self.watermark = self.watermark.max(record.start - self.window);
        self.drain_through(self.watermark)?;
        if record.start < self.watermark {
            return Err(WriteError::Ordering(format!(
                "{}:{}: record trails the high-water mark {} by more than the window of {}",
                record.chrom, record.start, self.watermark, self.window
            )));
        }

        self.queue.push(Reverse(Queued {
            start: record.start,
            seq: self.seq,
            record,
        }));
        self.seq += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush_contig()?;
        if self.close_inner {
            self.inner.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records what reaches it, in order.
    #[derive(Clone, Default)]
    struct MockWriter {
        seen: Arc<Mutex<Vec<(String, i64)>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl VariantWriter for MockWriter {
        fn write_header(&mut self, _header: &Header) -> Result<()> {
            Ok(())
        }

        fn add(&mut self, record: VariantRecord) -> Result<()> {
            self.seen
                .lock()
                .unwrap()
                .push((record.chrom.clone(), record.start));
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    fn record(chrom: &str, start: i64) -> VariantRecord {
        VariantRecord::new(chrom, start, vec!["A".into()])
    }

    #[test]
    fn reorders_within_the_window() {
        let mock = MockWriter::default();
        let mut sorter = SortingWriter::new(mock.clone(), 10);
        for &start in &[10i64, 20, 12, 18] {
            sorter.add(record("1", start)).unwrap();
        }
        sorter.close().unwrap();
        let seen = mock.seen.lock().unwrap().clone();
        let starts: Vec<i64> = seen.iter().map(|(_, s)| *s).collect();
        assert_eq!(starts, vec![10, 12, 18, 20]);
        assert!(*mock.closed.lock().unwrap());
    }

    #[test]
    fn refuses_records_behind_the_watermark() {
        let mock = MockWriter::default();
        let mut sorter = SortingWriter::new(mock, 5);
        sorter.add(record("1", 10)).unwrap();
        sorter.add(record("1", 20)).unwrap();
        sorter.add(record("1", 18)).unwrap();
        let err = sorter.add(record("1", 12)).unwrap_err();
        assert!(matches!(err, WriteError::Ordering(_)));
    }

    #[test]
    fn contig_change_flushes_and_seals_the_old_contig() {
        let mock = MockWriter::default();
        let mut sorter = SortingWriter::new(mock.clone(), 100);
        sorter.add(record("1", 50)).unwrap();
        sorter.add(record("1", 40)).unwrap();
        sorter.add(record("2", 10)).unwrap();
        let seen = mock.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![("1".to_owned(), 40), ("1".to_owned(), 50)]
        );
        drop(seen);
        let err = sorter.add(record("1", 60)).unwrap_err();
        assert!(matches!(err, WriteError::Ordering(_)));
    }

    #[test]
    fn borrowed_inner_writer_is_left_open() {
        let mock = MockWriter::default();
        let mut sorter = SortingWriter::with_ownership(mock.clone(), 10, false);
        sorter.add(record("1", 5)).unwrap();
        sorter.close().unwrap();
        assert_eq!(mock.seen.lock().unwrap().len(), 1);
        assert!(!*mock.closed.lock().unwrap());
    }

    #[test]
    fn ties_keep_arrival_order() {
        let mock = MockWriter::default();
        let mut sorter = SortingWriter::new(mock.clone(), 10);
        sorter.add(record("1", 7)).unwrap();
        sorter.add(record("1", 7)).unwrap();
        sorter.add(record("1", 5)).unwrap();
        sorter.close().unwrap();
        let starts: Vec<i64> = mock.seen.lock().unwrap().iter().map(|(_, s)| *s).collect();
        assert_eq!(starts, vec![5, 7, 7]);
    }
}
