//! # Write-Ahead Log
//!
//! One append-only log per memtable. A batch is framed, checksummed and
//! appended before the memtable accepts it; with `sync` the file is fsynced
//! before the write acknowledges. Replay reconstructs the memtable after a
//! crash; a torn record at the tail is treated as the end of the log, a bad
//! checksum before the tail is corruption.
//!
//! ## Record layout
//!
//! ```text
//! +-------------------+
//! |      Magic        |   (4 bytes)
//! +-------------------+
//! |   Payload Size    |   (4 bytes)
//! +-------------------+
//! |     Checksum      |   (4 bytes)
//! +-------------------+
//! |     Payload       |   (variable, a sequence of framed ops)
//! +-------------------+
//! ```

use crate::consts::WAL_MAGIC;
use crate::err::Error;
use crate::err::Error::*;
use crate::types::{Key, SequenceNumber, Value};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// One replayed or pending operation
#[derive(Clone, Debug, PartialEq)]
pub enum WalOp {
    Put { seq: SequenceNumber, key: Key, value: Value },
    Delete { seq: SequenceNumber, key: Key },
    DeleteRange { seq: SequenceNumber, begin: Key, end: Key },
}

const OP_PUT: u8 = 0;
const OP_DELETE: u8 = 1;
const OP_DELETE_RANGE: u8 = 2;

/// Append-only log backing one memtable
#[derive(Debug)]
pub struct Wal {
    pub path: PathBuf,
    file: File,
}

impl Wal {
    pub async fn create<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .await
            .map_err(|error| FileOpenError {
                path: path.as_ref().to_path_buf(),
                error,
            })?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            file,
        })
    }

    /// Appends one framed record carrying `ops`; syncs when asked
    pub async fn append(&mut self, ops: &[WalOp], sync: bool) -> Result<(), Error> {
        let payload = encode_ops(ops);
        let mut frame = Vec::with_capacity(payload.len() + 12);
        WriteBytesExt::write_u32::<BigEndian>(&mut frame, WAL_MAGIC).unwrap();
        WriteBytesExt::write_u32::<BigEndian>(&mut frame, payload.len() as u32).unwrap();
        WriteBytesExt::write_u32::<BigEndian>(&mut frame, checksum(&payload)).unwrap();
        frame.extend_from_slice(&payload);
        self.file.write_all(&frame).await.map_err(|error| FileWriteError {
            path: self.path.clone(),
            error,
        })?;
        if sync {
            self.file.sync_all().await.map_err(|error| FileSyncError { error })?;
        }
        Ok(())
    }

    pub async fn sync(&mut self) -> Result<(), Error> {
        self.file.sync_all().await.map_err(|error| FileSyncError { error })
    }

    /// Replays every intact record in the file at `path`
    pub async fn replay<P: AsRef<Path>>(path: P) -> Result<Vec<WalOp>, Error> {
        let bytes = tokio::fs::read(path.as_ref()).await.map_err(|error| FileReadError {
            path: path.as_ref().to_path_buf(),
            error,
        })?;
        let mut ops = Vec::new();
        let mut cursor = &bytes[..];
        while cursor.len() >= 12 {
            let magic = cursor.read_u32::<BigEndian>().map_err(UnexpectedEOF)?;
            if magic != WAL_MAGIC {
                return Err(FileCorrupt {
                    path: path.as_ref().to_path_buf(),
                    reason: format!("bad wal record magic {:#x}", magic),
                });
            }
            let len = cursor.read_u32::<BigEndian>().map_err(UnexpectedEOF)? as usize;
            let want_sum = cursor.read_u32::<BigEndian>().map_err(UnexpectedEOF)?;
            if cursor.len() < len {
                // torn tail from a crash mid-append
                log::warn!(
                    "wal {:?}: truncated record of {} bytes at tail, dropping",
                    path.as_ref(),
                    len
                );
                break;
            }
            let (payload, rest) = cursor.split_at(len);
            if checksum(payload) != want_sum {
                return Err(FileCorrupt {
                    path: path.as_ref().to_path_buf(),
                    reason: "wal record checksum mismatch".to_string(),
                });
            }
            decode_ops(payload, path.as_ref(), &mut ops)?;
            cursor = rest;
        }
        Ok(ops)
    }
}

fn encode_ops(ops: &[WalOp]) -> Vec<u8> {
    let mut buf = Vec::new();
    for op in ops {
        match op {
            WalOp::Put { seq, key, value } => {
                WriteBytesExt::write_u8(&mut buf, OP_PUT).unwrap();
                WriteBytesExt::write_u64::<BigEndian>(&mut buf, *seq).unwrap();
                WriteBytesExt::write_u32::<BigEndian>(&mut buf, key.len() as u32).unwrap();
                buf.extend_from_slice(key);
                WriteBytesExt::write_u32::<BigEndian>(&mut buf, value.len() as u32).unwrap();
                buf.extend_from_slice(value);
            }
            WalOp::Delete { seq, key } => {
                WriteBytesExt::write_u8(&mut buf, OP_DELETE).unwrap();
                WriteBytesExt::write_u64::<BigEndian>(&mut buf, *seq).unwrap();
                WriteBytesExt::write_u32::<BigEndian>(&mut buf, key.len() as u32).unwrap();
                buf.extend_from_slice(key);
            }
            WalOp::DeleteRange { seq, begin, end } => {
                WriteBytesExt::write_u8(&mut buf, OP_DELETE_RANGE).unwrap();
                WriteBytesExt::write_u64::<BigEndian>(&mut buf, *seq).unwrap();
                WriteBytesExt::write_u32::<BigEndian>(&mut buf, begin.len() as u32).unwrap();
                buf.extend_from_slice(begin);
                WriteBytesExt::write_u32::<BigEndian>(&mut buf, end.len() as u32).unwrap();
                buf.extend_from_slice(end);
            }
        }
    }
    buf
}

fn decode_ops(mut payload: &[u8], path: &Path, out: &mut Vec<WalOp>) -> Result<(), Error> {
    let corrupt = |reason: &str| FileCorrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    while !payload.is_empty() {
        let kind = payload.read_u8().map_err(UnexpectedEOF)?;
        let seq = payload.read_u64::<BigEndian>().map_err(UnexpectedEOF)?;
        let mut read_blob = |payload: &mut &[u8]| -> Result<Vec<u8>, Error> {
            let len = payload.read_u32::<BigEndian>().map_err(UnexpectedEOF)? as usize;
            if payload.len() < len {
                return Err(corrupt("wal op blob length exceeds payload"));
            }
            let mut blob = vec![0u8; len];
            payload.read_exact(&mut blob).map_err(UnexpectedEOF)?;
            Ok(blob)
        };
        match kind {
            OP_PUT => {
                let key = read_blob(&mut payload)?;
                let value = read_blob(&mut payload)?;
                out.push(WalOp::Put { seq, key, value });
            }
            OP_DELETE => {
                let key = read_blob(&mut payload)?;
                out.push(WalOp::Delete { seq, key });
            }
            OP_DELETE_RANGE => {
                let begin = read_blob(&mut payload)?;
                let end = read_blob(&mut payload)?;
                out.push(WalOp::DeleteRange { seq, begin, end });
            }
            other => return Err(corrupt(&format!("unknown wal op kind {}", other))),
        }
    }
    Ok(())
}

/// Folded additive checksum; cheap and catches torn writes
fn checksum(payload: &[u8]) -> u32 {
    let mut sum: u32 = 0x811c_9dc5;
    for b in payload {
        sum = sum.wrapping_mul(16777619) ^ (*b as u32);
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_append_replay_round_trip() {
        let root = tempdir().unwrap();
        let path = root.path().join("wal-test.log");
        let ops = vec![
            WalOp::Put {
                seq: 1,
                key: b"a".to_vec(),
                value: b"1".to_vec(),
            },
            WalOp::Delete { seq: 2, key: b"b".to_vec() },
            WalOp::DeleteRange {
                seq: 3,
                begin: b"c".to_vec(),
                end: b"f".to_vec(),
            },
        ];
        let mut wal = Wal::create(&path).await.unwrap();
        wal.append(&ops[..2], false).await.unwrap();
        wal.append(&ops[2..], true).await.unwrap();
        drop(wal);

        let replayed = Wal::replay(&path).await.unwrap();
        assert_eq!(replayed, ops);
    }

    #[tokio::test]
    async fn test_replay_tolerates_torn_tail() {
        let root = tempdir().unwrap();
        let path = root.path().join("wal-torn.log");
        let mut wal = Wal::create(&path).await.unwrap();
        wal.append(
            &[WalOp::Put {
                seq: 1,
                key: b"a".to_vec(),
                value: b"1".to_vec(),
            }],
            true,
        )
        .await
        .unwrap();
        drop(wal);

        // simulate a crash mid-append of the second record
        let mut bytes = tokio::fs::read(&path).await.unwrap();
        bytes.extend_from_slice(&WAL_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&100u32.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(b"partial");
        tokio::fs::write(&path, &bytes).await.unwrap();

        let replayed = Wal::replay(&path).await.unwrap();
        assert_eq!(replayed.len(), 1);
    }

    #[tokio::test]
    async fn test_replay_detects_corruption() {
        let root = tempdir().unwrap();
        let path = root.path().join("wal-bad.log");
        let mut wal = Wal::create(&path).await.unwrap();
        wal.append(
            &[WalOp::Put {
                seq: 1,
                key: b"abcdef".to_vec(),
                value: b"123456".to_vec(),
            }],
            true,
        )
        .await
        .unwrap();
        drop(wal);

        let mut bytes = tokio::fs::read(&path).await.unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        tokio::fs::write(&path, &bytes).await.unwrap();

        let res = Wal::replay(&path).await;
        assert!(matches!(res, Err(Error::FileCorrupt { .. })));
    }
}
