//! # Topic Segments
//!
//! Durable, append-only storage for one topic's events.
//!
//! Record layout:
//! - Record Length (u32 LE, whole record including this field)
//! - Sequence Number (u64 LE)
//! - Body (JSON-encoded event)
//! - Checksum (u32 LE, CRC32 over sequence and body)
//!
//! Every append is followed by fsync. A failed append truncates the file back
//! to its previous length so a retry cannot leave a duplicate sequence behind.

use std::io;
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::event::Event;
use super::topic::TopicKey;

const HEADER_LEN: usize = 4 + 8;
const TRAILER_LEN: usize = 4;
const MIN_RECORD_LEN: usize = HEADER_LEN + TRAILER_LEN;
const SEGMENT_EXT: &str = "seg";

/// Result type for segment operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Segment storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Write or open failed; nothing was committed
    #[error("append failed for {path}: {source}")]
    AppendFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// fsync failed; the record was rolled back
    #[error("fsync failed for {path}: {source}")]
    FsyncFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A record in the middle of a segment is damaged
    #[error("segment {path} corrupt at offset {offset}: {reason}")]
    Corruption {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    /// Event could not be encoded or decoded
    #[error("event codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Directory listing or metadata failure
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Computes the CRC32 over a record's sequence number and body.
pub fn compute_checksum(sequence: u64, body: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&sequence.to_le_bytes());
    hasher.update(body);
    hasher.finalize()
}

/// Serialize an event into one segment record.
pub fn encode_record(event: &Event) -> StorageResult<Vec<u8>> {
    let body = serde_json::to_vec(event)?;
    let total = MIN_RECORD_LEN + body.len();

    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&(total as u32).to_le_bytes());
    buf.extend_from_slice(&event.sequence.to_le_bytes());
    buf.extend_from_slice(&body);
    buf.extend_from_slice(&compute_checksum(event.sequence, &body).to_le_bytes());
    Ok(buf)
}

/// Outcome of scanning a segment's bytes
#[derive(Debug)]
pub struct DecodedSegment {
    /// Events in file order
    pub events: Vec<Event>,
    /// Length of the intact prefix
    pub valid_len: u64,
    /// Whether a torn trailing record was found past `valid_len`
    pub torn_tail: bool,
}

/// Decode every record, validating checksums and strict +1 sequencing.
///
/// A damaged final record is treated as a torn write and reported through
/// `torn_tail`; damage anywhere else is corruption.
pub fn decode_records(path: &Path, bytes: &[u8]) -> StorageResult<DecodedSegment> {
    let mut events: Vec<Event> = Vec::new();
    let mut offset = 0usize;

    while offset < bytes.len() {
        let remaining = bytes.len() - offset;
        if remaining < MIN_RECORD_LEN {
            return Ok(torn(events, offset));
        }

        let len = u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]) as usize;

        if len < MIN_RECORD_LEN {
            return Err(corruption(path, offset, format!("invalid record length {}", len)));
        }
        if len > remaining {
            return Ok(torn(events, offset));
        }

        let record = &bytes[offset..offset + len];
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&record[4..12]);
        let sequence = u64::from_le_bytes(seq_bytes);
        let body = &record[HEADER_LEN..len - TRAILER_LEN];
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&record[len - TRAILER_LEN..]);
        let expected = u32::from_le_bytes(crc_bytes);

        let is_last = offset + len == bytes.len();
        if compute_checksum(sequence, body) != expected {
            if is_last {
                return Ok(torn(events, offset));
            }
            return Err(corruption(path, offset, "checksum mismatch".to_string()));
        }

        if let Some(prev) = events.last() {
            if sequence != prev.sequence + 1 {
                return Err(corruption(
                    path,
                    offset,
                    format!(
                        "non-sequential sequence number: expected {}, got {}",
                        prev.sequence + 1,
                        sequence
                    ),
                ));
            }
        }

        let event: Event = serde_json::from_slice(body)?;
        if event.sequence != sequence {
            return Err(corruption(
                path,
                offset,
                format!("header sequence {} disagrees with body {}", sequence, event.sequence),
            ));
        }

        events.push(event);
        offset += len;
    }

    Ok(DecodedSegment {
        events,
        valid_len: offset as u64,
        torn_tail: false,
    })
}

fn torn(events: Vec<Event>, offset: usize) -> DecodedSegment {
    DecodedSegment {
        events,
        valid_len: offset as u64,
        torn_tail: true,
    }
}

fn corruption(path: &Path, offset: usize, reason: String) -> StorageError {
    StorageError::Corruption {
        path: path.to_path_buf(),
        offset: offset as u64,
        reason,
    }
}

/// Append-only file holding one topic's events
#[derive(Debug)]
pub struct Segment {
    path: PathBuf,
    file: File,
    len: u64,
}

impl Segment {
    /// Path of the segment for `topic` under `dir`.
    pub fn path_for(dir: &Path, topic: &TopicKey) -> PathBuf {
        dir.join(format!("{}.{}", topic.file_stem(), SEGMENT_EXT))
    }

    /// Open (or create) the segment for `topic` and recover its events.
    ///
    /// A torn trailing record is cut off before the file is reopened for
    /// appends.
    pub async fn open(dir: &Path, topic: &TopicKey) -> StorageResult<(Self, Vec<Event>)> {
        fs::create_dir_all(dir).await.map_err(|source| StorageError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let path = Self::path_for(dir, topic);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(StorageError::Io { path, source }),
        };

        let decoded = decode_records(&path, &bytes)?;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .await
            .map_err(|source| StorageError::AppendFailed {
                path: path.clone(),
                source,
            })?;

        if decoded.torn_tail {
            tracing::warn!(
                path = %path.display(),
                valid_len = decoded.valid_len,
                file_len = bytes.len(),
                "truncating torn segment tail"
            );
            file.set_len(decoded.valid_len)
                .await
                .map_err(|source| StorageError::AppendFailed {
                    path: path.clone(),
                    source,
                })?;
            file.sync_all().await.map_err(|source| StorageError::FsyncFailed {
                path: path.clone(),
                source,
            })?;
        }

        let mut segment = Self {
            path,
            file,
            len: decoded.valid_len,
        };
        segment.seek_to_end().await?;

        Ok((segment, decoded.events))
    }

    /// Topics that already have a segment under `dir`.
    pub async fn discover(dir: &Path) -> StorageResult<Vec<TopicKey>> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StorageError::Io {
                    path: dir.to_path_buf(),
                    source,
                })
            }
        };

        let mut topics = Vec::new();
        loop {
            let entry = entries.next_entry().await.map_err(|source| StorageError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let Some(entry) = entry else { break };
            let path = entry.path();

            if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match TopicKey::from_file_stem(stem) {
                Some(topic) => topics.push(topic),
                None => tracing::warn!(path = %path.display(), "ignoring unrecognized segment"),
            }
        }

        topics.sort();
        Ok(topics)
    }

    /// Path of this segment.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current committed length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether nothing has been committed.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append one event and fsync before returning.
    pub async fn append(&mut self, event: &Event) -> StorageResult<()> {
        let record = encode_record(event)?;

        let written = match self.file.write_all(&record).await {
            Ok(()) => self.file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(source) = written {
            self.rollback().await;
            return Err(StorageError::AppendFailed {
                path: self.path.clone(),
                source,
            });
        }

        if let Err(source) = self.file.sync_data().await {
            self.rollback().await;
            return Err(StorageError::FsyncFailed {
                path: self.path.clone(),
                source,
            });
        }

        self.len += record.len() as u64;
        Ok(())
    }

    /// Replace the segment's contents with `events` (compaction).
    ///
    /// Written to a temporary file, fsynced, then renamed over the original.
    pub async fn rewrite(&mut self, events: &[Event]) -> StorageResult<()> {
        let tmp_path = self.path.with_extension("seg.tmp");
        let mut buf = Vec::new();
        for event in events {
            buf.extend_from_slice(&encode_record(event)?);
        }

        let mut tmp = File::create(&tmp_path)
            .await
            .map_err(|source| StorageError::Io {
                path: tmp_path.clone(),
                source,
            })?;
        tmp.write_all(&buf)
            .await
            .map_err(|source| StorageError::Io {
                path: tmp_path.clone(),
                source,
            })?;
        tmp.flush().await.map_err(|source| StorageError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        tmp.sync_all().await.map_err(|source| StorageError::FsyncFailed {
            path: tmp_path.clone(),
            source,
        })?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|source| StorageError::Io {
                path: self.path.clone(),
                source,
            })?;

        self.file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(|source| StorageError::AppendFailed {
                path: self.path.clone(),
                source,
            })?;
        self.len = buf.len() as u64;
        self.seek_to_end().await
    }

    async fn seek_to_end(&mut self) -> StorageResult<()> {
        use tokio::io::AsyncSeekExt;

        self.file
            .seek(io::SeekFrom::Start(self.len))
            .await
            .map_err(|source| StorageError::AppendFailed {
                path: self.path.clone(),
                source,
            })?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn replace_file_for_test(&mut self, file: File) {
        self.file = file;
    }

    async fn rollback(&mut self) {
        if let Err(e) = self.file.set_len(self.len).await {
            tracing::error!(path = %self.path.display(), error = %e, "segment rollback failed");
            return;
        }
        if let Err(e) = self.seek_to_end().await {
            tracing::error!(path = %self.path.display(), error = %e, "segment seek after rollback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::event::{EntityType, EventKind};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn event(topic: &TopicKey, sequence: u64) -> Event {
        Event::new(
            sequence,
            topic.clone(),
            EventKind::Created,
            EntityType::Message,
            serde_json::json!({"n": sequence}),
        )
    }

    #[test]
    fn test_checksum_covers_sequence() {
        assert_ne!(compute_checksum(1, b"body"), compute_checksum(2, b"body"));
        assert_eq!(compute_checksum(1, b"body"), compute_checksum(1, b"body"));
    }

    #[test]
    fn test_decode_detects_mid_file_corruption() {
        let topic = TopicKey::Channel(Uuid::new_v4());
        let mut bytes = encode_record(&event(&topic, 1)).unwrap();
        bytes.extend(encode_record(&event(&topic, 2)).unwrap());
        bytes[14] ^= 0xFF;

        let result = decode_records(Path::new("t.seg"), &bytes);
        assert!(matches!(result, Err(StorageError::Corruption { offset: 0, .. })));
    }

    #[test]
    fn test_decode_rejects_sequence_gap() {
        let topic = TopicKey::Channel(Uuid::new_v4());
        let mut bytes = encode_record(&event(&topic, 1)).unwrap();
        bytes.extend(encode_record(&event(&topic, 3)).unwrap());

        let result = decode_records(Path::new("t.seg"), &bytes);
        assert!(matches!(result, Err(StorageError::Corruption { .. })));
    }

    #[test]
    fn test_decode_accepts_compacted_start() {
        let topic = TopicKey::Channel(Uuid::new_v4());
        let mut bytes = encode_record(&event(&topic, 41)).unwrap();
        bytes.extend(encode_record(&event(&topic, 42)).unwrap());

        let decoded = decode_records(Path::new("t.seg"), &bytes).unwrap();
        assert_eq!(decoded.events.len(), 2);
        assert_eq!(decoded.events[0].sequence, 41);
        assert!(!decoded.torn_tail);
    }

    #[tokio::test]
    async fn test_append_and_reopen() {
        let dir = TempDir::new().unwrap();
        let topic = TopicKey::Channel(Uuid::new_v4());

        {
            let (mut segment, recovered) = Segment::open(dir.path(), &topic).await.unwrap();
            assert!(recovered.is_empty());
            for seq in 1..=3 {
                segment.append(&event(&topic, seq)).await.unwrap();
            }
            assert!(!segment.is_empty());
        }

        let (_, recovered) = Segment::open(dir.path(), &topic).await.unwrap();
        let seqs: Vec<u64> = recovered.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let topic = TopicKey::Conversation(Uuid::new_v4());

        let good_len = {
            let (mut segment, _) = Segment::open(dir.path(), &topic).await.unwrap();
            segment.append(&event(&topic, 1)).await.unwrap();
            segment.append(&event(&topic, 2)).await.unwrap();
            segment.len()
        };

        // Half of a third record, as if the process died mid-write
        let path = Segment::path_for(dir.path(), &topic);
        let partial = encode_record(&event(&topic, 3)).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&partial[..partial.len() / 2]);
        std::fs::write(&path, &bytes).unwrap();

        let (mut segment, recovered) = Segment::open(dir.path(), &topic).await.unwrap();
        assert_eq!(recovered.len(), 2);
        assert_eq!(segment.len(), good_len);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);

        // The slot is free again
        segment.append(&event(&topic, 3)).await.unwrap();
        let (_, recovered) = Segment::open(dir.path(), &topic).await.unwrap();
        assert_eq!(recovered.last().unwrap().sequence, 3);
    }

    #[tokio::test]
    async fn test_rewrite_keeps_only_survivors() {
        let dir = TempDir::new().unwrap();
        let topic = TopicKey::Channel(Uuid::new_v4());

        let (mut segment, _) = Segment::open(dir.path(), &topic).await.unwrap();
        let events: Vec<Event> = (1..=5).map(|s| event(&topic, s)).collect();
        for e in &events {
            segment.append(e).await.unwrap();
        }

        segment.rewrite(&events[3..]).await.unwrap();
        segment.append(&event(&topic, 6)).await.unwrap();

        let (_, recovered) = Segment::open(dir.path(), &topic).await.unwrap();
        let seqs: Vec<u64> = recovered.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn test_discover_lists_topics() {
        let dir = TempDir::new().unwrap();
        let a = TopicKey::Channel(Uuid::new_v4());
        let b = TopicKey::UserMembership(Uuid::new_v4());

        for topic in [&a, &b] {
            let (mut segment, _) = Segment::open(dir.path(), topic).await.unwrap();
            segment.append(&event(topic, 1)).await.unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let mut found = Segment::discover(dir.path()).await.unwrap();
        found.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(found, expected);
    }
}
