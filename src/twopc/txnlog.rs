//! Durable transaction log of a 2PC participant.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use super::{TxnId, TxnLogEntry};

use crate::utils::TripStoreError;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Append-only file of length-prefixed `TxnLogEntry` records.
pub struct TxnLog {
    /// Node name used as logging prefix.
    me: String,

    path: PathBuf,

    /// Backing file, cursor always at EOF.
    backer: Mutex<File>,

    /// Whether to fsync after every append.
    sync: bool,
}

impl TxnLog {
    /// Opens (creating if absent) the log file at `path`.
    pub async fn open(
        me: impl ToString,
        path: impl AsRef<Path>,
        sync: bool,
    ) -> Result<Self, TripStoreError> {
        let me = me.to_string();
        let path = path.as_ref().to_path_buf();
        if !fs::try_exists(&path).await? {
            File::create(&path).await?;
            pf_info!(me; "created txn log file '{}'", path.display());
        } else {
            pf_info!(me; "txn log file '{}' already exists", path.display());
        }

        let mut backer =
            OpenOptions::new().read(true).write(true).open(&path).await?;
        backer.seek(SeekFrom::End(0)).await?;

        Ok(TxnLog {
            me,
            path,
            backer: Mutex::new(backer),
            sync,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record at EOF.
    pub async fn append(&self, entry: &TxnLogEntry) -> Result<(), TripStoreError> {
        let entry_bytes = encode_to_vec(entry)?;
        let mut backer = self.backer.lock().await;

        // write entry length header first
        backer.write_u64(entry_bytes.len() as u64).await?;

        // then entry content
        backer.write_all(&entry_bytes[..]).await?;

        if self.sync {
            backer.sync_data().await?;
        }
        pf_trace!(self.me; "logged txn {} phase {}", entry.txn, entry.phase);
        Ok(())
    }

    /// Reads the whole log back and returns the entries whose last
    /// recorded phase is not terminal, in first-seen order. A torn record
    /// at the tail is truncated away.
    pub async fn replay(&self) -> Result<Vec<TxnLogEntry>, TripStoreError> {
        let mut backer = self.backer.lock().await;
        let file_size = backer.seek(SeekFrom::End(0)).await? as usize;
        backer.seek(SeekFrom::Start(0)).await?;

        let mut order: Vec<TxnId> = vec![];
        let mut latest: HashMap<TxnId, TxnLogEntry> = HashMap::new();
        let mut offset = 0;
        while offset < file_size {
            if offset + 8 > file_size {
                break;
            }
            let entry_len = backer.read_u64().await? as usize;
            if offset + 8 + entry_len > file_size {
                break;
            }
            let mut entry_buf: Vec<u8> = vec![0; entry_len];
            backer.read_exact(&mut entry_buf[..]).await?;
            let entry: TxnLogEntry = match decode_from_slice(&entry_buf) {
                Ok(entry) => entry,
                Err(e) => {
                    pf_warn!(self.me; "undecodable txn log record at {}: {}",
                                      offset, e);
                    break;
                }
            };
            offset += 8 + entry_len;

            if !latest.contains_key(&entry.txn) {
                order.push(entry.txn.clone());
            }
            latest.insert(entry.txn.clone(), entry);
        }

        if offset < file_size {
            pf_warn!(self.me; "truncating torn txn log tail at {} of {}",
                              offset, file_size);
            backer.set_len(offset as u64).await?;
            backer.sync_all().await?;
        }
        backer.seek(SeekFrom::End(0)).await?;

        let live: Vec<TxnLogEntry> = order
            .into_iter()
            .filter_map(|txn| latest.remove(&txn))
            .filter(|entry| !entry.phase.is_terminal())
            .collect();
        pf_info!(self.me; "replayed txn log: {} live txns", live.len());
        Ok(live)
    }
}
