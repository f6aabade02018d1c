//! An asynchronous stage decoupling record production from encoding:
//! a bounded channel feeds a dedicated drain thread that owns the inner
//! writer. Failures on the drain side park in a mailbox and surface on
//! the producer's next call.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};
use log::debug;

use crate::error::{Result, WriteError};
use crate::record::VariantRecord;
use crate::types::Header;
use crate::writer::VariantWriter;

pub const DEFAULT_QUEUE_CAPACITY: usize = 2048;

enum Message {
    Header(Box<Header>),
    Record(Box<VariantRecord>),
    Finish,
}

/// FIFO transport between one producer and the drain thread. Submission
/// order is delivery order; the drain never reorders.
pub struct AsyncWriter {
    tx: Option<Sender<Message>>,
    drain: Option<JoinHandle<()>>,
    mailbox: Arc<Mutex<Option<WriteError>>>,
    poisoned: Option<String>,
    closed: bool,
}

impl AsyncWriter {
    pub fn new<V>(inner: V) -> Self
    where
        V: VariantWriter + Send + 'static,
    {
        Self::with_capacity(inner, DEFAULT_QUEUE_CAPACITY, true)
    }

    /// `close_inner` decides whether the drain thread closes the inner
    /// writer once the sentinel arrives; fixed at construction.
    pub fn with_capacity<V>(mut inner: V, capacity: usize, close_inner: bool) -> Self
    where
        V: VariantWriter + Send + 'static,
    {
        let (tx, rx) = bounded::<Message>(capacity);
        let mailbox: Arc<Mutex<Option<WriteError>>> = Arc::new(Mutex::new(None));
        let drain_mailbox = Arc::clone(&mailbox);

        let drain = thread::Builder::new()
            .name("bcf-writer-drain".to_owned())
            .spawn(move || {
                let mut drained = 0u64;
                for message in rx {
                    // after a failure, keep receiving so the producer
                    // never blocks on a full queue, but do no work
                    let failed = drain_mailbox.lock().unwrap().is_some();
                    match message {
                        Message::Header(header) => {
                            if failed {
                                continue;
                            }
                            if let Err(e) = inner.write_header(&header) {
                                *drain_mailbox.lock().unwrap() = Some(e);
                            }
                        }
                        Message::Record(record) => {
                            if failed {
                                continue;
                            }
                            if let Err(e) = inner.add(*record) {
                                *drain_mailbox.lock().unwrap() = Some(e);
                            } else {
                                drained += 1;
                            }
                        }
                        Message::Finish => break,
                    }
                }
                if close_inner && drain_mailbox.lock().unwrap().is_none() {
                    if let Err(e) = inner.close() {
                        *drain_mailbox.lock().unwrap() = Some(e);
                    }
                }
                debug!("drain thread exits after {} records", drained);
            })
            .expect("spawning the drain thread");

        Self {
            tx: Some(tx),
            drain: Some(drain),
            mailbox,
            poisoned: None,
            closed: false,
        }
    }

    /// Re-raises an error captured on the drain side, once; later calls
    /// see the poisoned state.
    fn check_mailbox(&mut self) -> Result<()> {
        if let Some(original) = &self.poisoned {
            return Err(WriteError::poisoned(original));
        }
        let taken = self.mailbox.lock().unwrap().take();
        if let Some(error) = taken {
            self.poisoned = Some(error.to_string());
            return Err(error);
        }
        Ok(())
    }

    fn send(&mut self, message: Message) -> Result<()> {
        let tx = self.tx.as_ref().ok_or_else(|| {
            WriteError::Lifecycle("add called after close".to_owned())
        })?;
        tx.send(message).map_err(|_| {
            WriteError::Lifecycle("drain thread is gone".to_owned())
        })
    }
}

impl VariantWriter for AsyncWriter {
    fn write_header(&mut self, header: &Header) -> Result<()> {
        self.check_mailbox()?;
        self.send(Message::Header(Box::new(header.clone())))
    }

    fn add(&mut self, record: VariantRecord) -> Result<()> {
        if self.closed {
            return Err(WriteError::Lifecycle("add called after close".to_owned()));
        }
        self.check_mailbox()?;
        self.send(Message::Record(Box::new(record)))
    }

    /// Inserts the sentinel, waits for the drain to finish in-flight
    /// records, then re-raises anything the drain captured.
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return self.check_mailbox();
        }
        self.closed = true;
        if self.tx.is_some() {
            self.send(Message::Finish)?;
            self.tx = None;
        }
        if let Some(drain) = self.drain.take() {
            drain
                .join()
                .map_err(|_| WriteError::Lifecycle("drain thread panicked".to_owned()))?;
        }
        self.check_mailbox()
    }
}

impl Drop for AsyncWriter {
    fn drop(&mut self) {
        // best effort: let the drain thread exit instead of leaking it
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Message::Finish);
        }
        if let Some(drain) = self.drain.take() {
            let _ = drain.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct MockWriter {
        seen: Arc<Mutex<Vec<i64>>>,
        closed: Arc<AtomicUsize>,
        fail_at: Option<i64>,
    }

    impl VariantWriter for MockWriter {
        fn write_header(&mut self, _header: &Header) -> Result<()> {
            Ok(())
        }

        fn add(&mut self, record: VariantRecord) -> Result<()> {
            if self.fail_at == Some(record.start) {
                return Err(WriteError::RecordShape("induced failure".to_owned()));
            }
            self.seen.lock().unwrap().push(record.start);
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn record(start: i64) -> VariantRecord {
        VariantRecord::new("1", start, vec!["A".into()])
    }

    #[test]
    fn passthrough_preserves_submission_order() {
        let mock = MockWriter::default();
        let seen = Arc::clone(&mock.seen);
        let closed = Arc::clone(&mock.closed);
        let mut writer = AsyncWriter::with_capacity(mock, 64, true);
        writer.write_header(&Header::new()).unwrap();
        for start in 1..=10_000i64 {
            writer.add(record(start)).unwrap();
        }
        writer.close().unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 10_000);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drain_side_failure_surfaces_on_a_later_call() {
        let mock = MockWriter {
            fail_at: Some(500),
            ..MockWriter::default()
        };
        let mut writer = AsyncWriter::with_capacity(mock, 8, true);
        writer.write_header(&Header::new()).unwrap();
        let mut failed = None;
        for start in 1..=1000i64 {
            if let Err(e) = writer.add(record(start)) {
                failed = Some((start, e));
                break;
            }
        }
        let result = writer.close();
        match failed {
            Some((at, error)) => {
                assert!(at > 500);
                assert!(matches!(error, WriteError::RecordShape(_)));
                // the error was already consumed; close reports poison
                assert!(result.is_err());
            }
            // the queue raced close; the error must surface there
            None => assert!(matches!(result, Err(WriteError::RecordShape(_)))),
        }
    }

    #[test]
    fn add_after_close_is_a_lifecycle_error() {
        let mock = MockWriter::default();
        let mut writer = AsyncWriter::with_capacity(mock, 8, true);
        writer.write_header(&Header::new()).unwrap();
        writer.close().unwrap();
        assert!(matches!(
            writer.add(record(1)),
            Err(WriteError::Lifecycle(_))
        ));
    }

    #[test]
    fn borrowed_inner_writer_is_left_open() {
        let mock = MockWriter::default();
        let closed = Arc::clone(&mock.closed);
        let mut writer = AsyncWriter::with_capacity(mock, 8, false);
        writer.write_header(&Header::new()).unwrap();
        writer.add(record(1)).unwrap();
        writer.close().unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }
}
