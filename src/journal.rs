//! Write-ahead journal of accepted order transitions
//!
//! Records are MessagePack-encoded order snapshots, each prefixed with its
//! length as a 4-byte big-endian integer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::error::{CoreError, Result};
use crate::order::{Order, OrderEvent};

/// One accepted change of an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
    /// `None` for the creation record
    pub event: Option<OrderEvent>,
    /// Snapshot after the change
    pub order: Order,
}

/// Persistence collaborator consulted before a transition becomes visible
pub trait TransitionJournal: Send + Sync {
    /// Durably store `record`; an error vetoes the transition
    fn record(&self, record: &TransitionRecord) -> Result<()>;
}

/// Journal that persists nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullJournal;

impl TransitionJournal for NullJournal {
    fn record(&self, _record: &TransitionRecord) -> Result<()> {
        Ok(())
    }
}

/// Storage a [`FrameLog`] appends to
pub trait JournalSink: Write {
    /// Flush written bytes to stable storage
    fn sync(&mut self) -> io::Result<()>;
    /// Cut the storage back to `len` bytes
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl JournalSink for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.sync_data()
    }
}

/// Length-prefixed frames appended to a sink, where a frame is either fully
/// durable or not there at all
#[derive(Debug)]
pub struct FrameLog<S> {
    sink: S,
    /// Bytes of fully written frames
    committed: u64,
    /// Set when a failed append could not be rolled back
    damaged: bool,
}

impl<S: JournalSink> FrameLog<S> {
    pub fn new(sink: S, committed: u64) -> Self {
        Self {
            sink,
            committed,
            damaged: false,
        }
    }

    /// Write and sync `frame`. On failure the sink is cut back to the last
    /// committed frame; if even that fails, every later append is refused.
    pub fn append(&mut self, frame: &[u8]) -> Result<()> {
        if self.damaged {
            return Err(CoreError::Journal(
                "journal has an unrecoverable partial frame".to_string(),
            ));
        }

        let written = self.sink.write_all(frame).and_then(|_| self.sink.sync());
        match written {
            Ok(()) => {
                self.committed += frame.len() as u64;
                Ok(())
            }
            Err(err) => {
                if let Err(rollback) = self.sink.truncate(self.committed) {
                    error!(error = %rollback, committed = self.committed, "Journal rollback failed");
                    self.damaged = true;
                }
                Err(CoreError::Journal(format!("append failed: {}", err)))
            }
        }
    }
}

/// Append-only journal file
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    log: Mutex<FrameLog<File>>,
}

impl FileJournal {
    /// Open `path` for appending, creating it if needed
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let committed = file.metadata()?.len();
        info!(path = %path.display(), bytes = committed, "Transition journal opened");

        Ok(Self {
            path,
            log: Mutex::new(FrameLog::new(file, committed)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every complete record from `path`. A missing file yields nothing;
    /// a truncated trailing record ends the replay with a warning.
    pub fn replay(path: impl AsRef<Path>) -> Result<Vec<TransitionRecord>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut buf = Bytes::from(std::fs::read(path)?);
        let mut records = Vec::new();

        while buf.remaining() >= 4 {
            let len = buf.get_u32() as usize;
            if buf.remaining() < len {
                warn!(
                    path = %path.display(),
                    expected = len,
                    available = buf.remaining(),
                    "Truncated journal record ignored"
                );
                return Ok(records);
            }
            let frame = buf.split_to(len);
            records.push(rmp_serde::from_slice::<TransitionRecord>(&frame)?);
        }

        if buf.has_remaining() {
            warn!(path = %path.display(), bytes = buf.remaining(), "Truncated journal length prefix ignored");
        }

        debug!(path = %path.display(), records = records.len(), "Journal replayed");
        Ok(records)
    }

    fn encode(record: &TransitionRecord) -> Result<Bytes> {
        let data = rmp_serde::to_vec_named(record)?;
        let len = u32::try_from(data.len())
            .map_err(|_| CoreError::Journal(format!("record too large: {} bytes", data.len())))?;

        let mut frame = BytesMut::with_capacity(4 + data.len());
        frame.put_u32(len);
        frame.put_slice(&data);
        Ok(frame.freeze())
    }
}

impl TransitionJournal for FileJournal {
    fn record(&self, record: &TransitionRecord) -> Result<()> {
        let frame = Self::encode(record)?;
        self.log.lock().append(&frame)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{Direction, OrderStatus, OrderType, TimeInForce};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn record(sequence: u64, status: OrderStatus) -> TransitionRecord {
        let now = Utc::now();
        TransitionRecord {
            sequence,
            recorded_at: now,
            event: (sequence > 1).then_some(OrderEvent::Submit),
            order: Order {
                id: Uuid::new_v4(),
                client_order_id: Some("abc".to_string()),
                symbol: "BTC/USD".to_string(),
                direction: Direction::Buy,
                order_type: OrderType::Limit,
                quantity: dec!(0.5),
                filled_quantity: dec!(0),
                price: Some(dec!(34500.0)),
                stop_price: None,
                time_in_force: TimeInForce::GoodTillCancelled,
                status,
                exchange: "paper".to_string(),
                exchange_order_id: None,
                created_at: now,
                updated_at: now,
                filled_at: None,
                average_fill_price: None,
                strategy_id: None,
                note: None,
            },
        }
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.journal");

        let first = record(1, OrderStatus::Created);
        let second = record(2, OrderStatus::PendingSubmission);
        {
            let journal = FileJournal::open(&path).unwrap();
            journal.record(&first).unwrap();
        }
        {
            let journal = FileJournal::open(&path).unwrap();
            journal.record(&second).unwrap();
        }

        let replayed = FileJournal::replay(&path).unwrap();
        assert_eq!(replayed, vec![first, second]);
    }

    #[test]
    fn test_truncated_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.journal");
        let complete = record(1, OrderStatus::Created);

        let journal = FileJournal::open(&path).unwrap();
        journal.record(&complete).unwrap();
        drop(journal);

        let partial = FileJournal::encode(&record(2, OrderStatus::Submitted)).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&partial[..partial.len() / 2]).unwrap();
        drop(file);

        let replayed = FileJournal::replay(&path).unwrap();
        assert_eq!(replayed, vec![complete]);
    }

    /// In-memory sink accepting `budget` more bytes before failing
    #[derive(Default)]
    struct FlakySink {
        data: Vec<u8>,
        budget: Option<usize>,
        truncate_fails: bool,
    }

    impl Write for FlakySink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = match self.budget {
                Some(0) => return Err(io::Error::new(io::ErrorKind::Other, "no space left on device")),
                Some(budget) => budget.min(buf.len()),
                None => buf.len(),
            };
            self.data.extend_from_slice(&buf[..n]);
            self.budget = self.budget.map(|b| b - n);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl JournalSink for FlakySink {
        fn sync(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            if self.truncate_fails {
                return Err(io::Error::new(io::ErrorKind::Other, "read-only filesystem"));
            }
            self.data.truncate(len as usize);
            Ok(())
        }
    }

    #[test]
    fn test_failed_append_is_rolled_back() {
        let vetoed = record(1, OrderStatus::Created);
        let accepted = record(2, OrderStatus::Created);

        // The vetoed frame gets torn after a few bytes
        let mut log = FrameLog::new(
            FlakySink {
                budget: Some(7),
                ..FlakySink::default()
            },
            0,
        );
        assert!(log.append(&FileJournal::encode(&vetoed).unwrap()).is_err());
        assert!(log.sink.data.is_empty());
        assert_eq!(log.committed, 0);

        log.sink.budget = None;
        log.append(&FileJournal::encode(&accepted).unwrap()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.journal");
        std::fs::write(&path, &log.sink.data).unwrap();
        assert_eq!(FileJournal::replay(&path).unwrap(), vec![accepted]);
    }

    #[test]
    fn test_unrecoverable_append_refuses_later_records() {
        let mut log = FrameLog::new(
            FlakySink {
                budget: Some(3),
                truncate_fails: true,
                ..FlakySink::default()
            },
            0,
        );
        let frame = FileJournal::encode(&record(1, OrderStatus::Created)).unwrap();
        assert!(log.append(&frame).is_err());

        log.sink.budget = None;
        assert!(matches!(log.append(&frame), Err(CoreError::Journal(_))));
        assert_eq!(log.sink.data.len(), 3);
    }

    #[test]
    fn test_reopen_continues_after_existing_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.journal");
        let first = record(1, OrderStatus::Created);
        FileJournal::open(&path).unwrap().record(&first).unwrap();

        let journal = FileJournal::open(&path).unwrap();
        assert_eq!(
            journal.log.lock().committed,
            std::fs::metadata(&path).unwrap().len()
        );
    }

    #[test]
    fn test_missing_file_replays_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileJournal::replay(dir.path().join("absent")).unwrap().is_empty());
    }
}
