//! Append-only history log (`history.dat`).
//!
//! Each record is one LF-terminated line: `<message-id>\t<epoch-seconds>\t
//! <groups>`. Records are never rewritten; their byte offsets are the keys
//! handed out to the shard index. Appends funnel through a single writer
//! task fed by a bounded channel; the writer batches records, flushes, and
//! fsyncs before acknowledging, so an acknowledged offset is always durable
//! and readable.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_channel::{Receiver, Sender};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::config::{HISTORY_WRITER_BATCH, HISTORY_WRITER_QUEUE_CAPACITY};
use crate::error::{Result, SpoolError};

/// Upper bound on one record line; RFC 5536 caps Message-IDs well below this.
const MAX_RECORD_BYTES: usize = 2_048;

/// A decoded history record.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub message_id: String,
    pub posted_at: i64,
    pub groups: String,
}

impl HistoryRecord {
    fn encode(&self) -> Vec<u8> {
        format!("{}\t{}\t{}\n", self.message_id, self.posted_at, self.groups).into_bytes()
    }

    /// Decode one LF-terminated line. Structural validation stands in for a
    /// checksum: the line must start with `<`, contain `@`, and carry two
    /// tab separators.
    pub fn decode(line: &str) -> Option<HistoryRecord> {
        let mut parts = line.trim_end_matches('\n').splitn(3, '\t');
        let message_id = parts.next()?;
        let posted_at = parts.next()?.parse().ok()?;
        let groups = parts.next()?;
        if !message_id.starts_with('<') || !message_id.contains('@') {
            return None;
        }
        Some(HistoryRecord {
            message_id: message_id.to_string(),
            posted_at,
            groups: groups.to_string(),
        })
    }
}

struct AppendRequest {
    record: HistoryRecord,
    reply: oneshot::Sender<Result<u64>>,
}

/// Handle to the append log: offset-addressed reads plus acknowledged
/// appends through the writer task.
pub struct HistoryLog {
    path: PathBuf,
    append_tx: Sender<AppendRequest>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<File>,
}

impl HistoryLog {
    /// Open (creating if missing) the log and start the writer task.
    pub async fn open(path: &Path) -> Result<HistoryLog> {
        let write_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let end_offset = write_file.metadata().await?.len();
        let reader = File::open(path).await?;

        let (append_tx, append_rx) = async_channel::bounded(HISTORY_WRITER_QUEUE_CAPACITY);
        let writer = tokio::spawn(writer_loop(write_file, end_offset, append_rx));

        Ok(HistoryLog {
            path: path.to_path_buf(),
            append_tx,
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(reader),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record; resolves with its byte offset once flushed and
    /// fsynced.
    pub async fn append(&self, record: HistoryRecord) -> Result<u64> {
        let (reply, reply_rx) = oneshot::channel();
        self.append_tx
            .send(AppendRequest { record, reply })
            .await
            .map_err(|_| SpoolError::ShuttingDown)?;
        reply_rx.await.map_err(|_| SpoolError::ShuttingDown)?
    }

    /// Read and decode the record at `offset`.
    ///
    /// I/O errors propagate (lookups fail closed); a structurally invalid
    /// line is reported as `CorruptRecord`.
    pub async fn read_record(&self, offset: u64) -> Result<HistoryRecord> {
        let mut reader = self.reader.lock().await;
        reader.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; MAX_RECORD_BYTES];
        let mut filled = 0;
        loop {
            let n = reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
            if buf[..filled].contains(&b'\n') || filled == buf.len() {
                break;
            }
        }
        drop(reader);

        let line_end = buf[..filled]
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(SpoolError::CorruptRecord { offset })?;
        let line = std::str::from_utf8(&buf[..line_end])
            .map_err(|_| SpoolError::CorruptRecord { offset })?;
        HistoryRecord::decode(line).ok_or(SpoolError::CorruptRecord { offset })
    }

    /// Stop accepting appends and wait for the writer to drain and fsync.
    pub async fn close(&self) {
        self.append_tx.close();
        if let Some(handle) = self.writer.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "history log writer task panicked");
            }
        }
    }
}

/// Writer task: drains the queue in batches, writes all records, flushes
/// and fsyncs once per batch, then acknowledges each append with its
/// offset.
async fn writer_loop(file: File, mut end_offset: u64, rx: Receiver<AppendRequest>) {
    let mut out = BufWriter::new(file);

    while let Ok(first) = rx.recv().await {
        let mut batch = vec![first];
        while batch.len() < HISTORY_WRITER_BATCH {
            match rx.try_recv() {
                Ok(req) => batch.push(req),
                Err(_) => break,
            }
        }

        let mut offsets = Vec::with_capacity(batch.len());
        let mut write_error: Option<std::io::Error> = None;
        for req in &batch {
            let bytes = req.record.encode();
            match out.write_all(&bytes).await {
                Ok(()) => {
                    offsets.push(end_offset);
                    end_offset += bytes.len() as u64;
                }
                Err(e) => {
                    write_error = Some(e);
                    break;
                }
            }
        }

        if write_error.is_none() {
            if let Err(e) = out.flush().await {
                write_error = Some(e);
            }
        }
        if write_error.is_none() {
            if let Err(e) = out.get_ref().sync_data().await {
                write_error = Some(e);
            }
        }

        match write_error {
            None => {
                for (req, offset) in batch.into_iter().zip(offsets) {
                    let _ = req.reply.send(Ok(offset));
                }
            }
            Some(e) => {
                tracing::error!(error = %e, "history log write failed");
                let msg = e.to_string();
                for req in batch {
                    let _ = req.reply.send(Err(SpoolError::Io(std::io::Error::new(
                        e.kind(),
                        msg.clone(),
                    ))));
                }
            }
        }
    }

    if let Err(e) = out.flush().await {
        tracing::error!(error = %e, "history log final flush failed");
    }
    if let Err(e) = out.get_ref().sync_data().await {
        tracing::error!(error = %e, "history log final fsync failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str) -> HistoryRecord {
        HistoryRecord {
            message_id: id.to_string(),
            posted_at: 1_700_000_000,
            groups: "misc.test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_append_then_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::open(&dir.path().join("history.dat")).await.unwrap();

        let off_a = log.append(record("<a@test>")).await.unwrap();
        let off_b = log.append(record("<b@test>")).await.unwrap();
        assert!(off_b > off_a);

        assert_eq!(log.read_record(off_a).await.unwrap().message_id, "<a@test>");
        assert_eq!(log.read_record(off_b).await.unwrap().message_id, "<b@test>");
        log.close().await;
    }

    #[tokio::test]
    async fn test_offsets_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.dat");

        let log = HistoryLog::open(&path).await.unwrap();
        let off = log.append(record("<persist@test>")).await.unwrap();
        log.close().await;

        let log = HistoryLog::open(&path).await.unwrap();
        assert_eq!(
            log.read_record(off).await.unwrap().message_id,
            "<persist@test>"
        );
        let off2 = log.append(record("<after@test>")).await.unwrap();
        assert!(off2 > off);
        log.close().await;
    }

    #[tokio::test]
    async fn test_corrupt_record_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.dat");
        tokio::fs::write(&path, b"garbage with no tabs\n").await.unwrap();

        let log = HistoryLog::open(&path).await.unwrap();
        assert!(matches!(
            log.read_record(0).await,
            Err(SpoolError::CorruptRecord { offset: 0 })
        ));
        log.close().await;
    }

    #[test]
    fn test_decode_rejects_missing_bracket() {
        assert!(HistoryRecord::decode("a@b\t1\tmisc.test").is_none());
        assert!(HistoryRecord::decode("<a@b>\t1\tmisc.test").is_some());
        assert!(HistoryRecord::decode("<a@b>\tnotanumber\tmisc.test").is_none());
    }
}
