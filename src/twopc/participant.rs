//! 2PC -- participant role.

use std::collections::{HashMap, HashSet, VecDeque};

use super::{ReplicaConfigTwoPc, TxnId, TxnLog, TxnLogEntry, TxnPhase};

use crate::server::ReplicaId;
use crate::userdb::DirectoryOp;
use crate::utils::TripStoreError;

use tokio::sync::{Mutex, Notify};
use tokio::time::{self, Duration, Instant};

/// Number of most recently ended transactions remembered.
const ENDED_CAPACITY: usize = 4096;

/// In-memory transaction table of a participant.
#[derive(Debug, Default)]
struct TxnTable {
    /// Non-terminal transactions, by ID.
    live: HashMap<TxnId, TxnLogEntry>,

    /// Recently ended transactions. A late vote request for one of these
    /// is refused.
    ended: HashSet<TxnId>,

    /// Transactions in `ended`, oldest first.
    ended_order: VecDeque<TxnId>,
}

impl TxnTable {
    /// Moves `txn` out of the live table into the ended set, forgetting
    /// the oldest ended transaction once `ENDED_CAPACITY` are held.
    fn end(&mut self, txn: &str) {
        self.live.remove(txn);
        if self.ended.insert(txn.into()) {
            self.ended_order.push_back(txn.into());
        }
        while self.ended_order.len() > ENDED_CAPACITY {
            if let Some(oldest) = self.ended_order.pop_front() {
                self.ended.remove(&oldest);
            }
        }
    }
}

/// Participant state of one user directory replica.
pub struct Participant {
    /// Node name used as logging prefix.
    me: String,

    table: Mutex<TxnTable>,

    /// Signalled whenever a live transaction ends.
    released: Notify,

    /// Durable transaction log.
    log: TxnLog,

    /// Maximum wait on a conflicting live transaction before voting no.
    conflict_wait: Duration,
}

impl Participant {
    /// Opens the transaction log and recovers live transactions from it.
    /// Recovered transactions keep blocking conflicting ones.
    pub async fn new_and_setup(
        me: impl ToString,
        config: &ReplicaConfigTwoPc,
    ) -> Result<Self, TripStoreError> {
        let me = me.to_string();
        let log =
            TxnLog::open(&me, &config.txn_log_path, config.logger_sync).await?;

        let mut table = TxnTable::default();
        for entry in log.replay().await? {
            pf_warn!(me; "recovered live txn {} on key {} in phase {}",
                         entry.txn, entry.key, entry.phase);
            table.live.insert(entry.txn.clone(), entry);
        }

        Ok(Participant {
            me,
            table: Mutex::new(table),
            released: Notify::new(),
            log,
            conflict_wait: Duration::from_millis(config.conflict_wait_ms),
        })
    }

    /// Voting phase handler. Waits while another live transaction targets
    /// the same key, voting no if it is still there after the conflict
    /// wait; otherwise logs a `Prepared` entry and votes yes.
    pub async fn can_commit(
        &self,
        txn: &str,
        op: &[String],
        coordinator: ReplicaId,
    ) -> Result<bool, TripStoreError> {
        let key = match DirectoryOp::from_tokens(op) {
            Ok(op) => op.key().to_string(),
            Err(e) => {
                pf_warn!(self.me; "voting no on txn {}: {}", txn, e);
                return Ok(false);
            }
        };

        let deadline = Instant::now() + self.conflict_wait;
        loop {
            // register interest before checking, so a release in between
            // is not missed
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let mut table = self.table.lock().await;
                if table.ended.contains(txn) {
                    pf_debug!(self.me; "voting no on ended txn {}", txn);
                    return Ok(false);
                }
                if table.live.contains_key(txn) {
                    return Ok(true);
                }

                let conflict = table
                    .live
                    .values()
                    .find(|entry| entry.key == key)
                    .map(|entry| entry.txn.clone());
                match conflict {
                    None => {
                        let entry = TxnLogEntry {
                            txn: txn.into(),
                            coordinator,
                            key,
                            op: op.to_vec(),
                            phase: TxnPhase::Prepared,
                        };
                        self.log.append(&entry).await?;
                        table.live.insert(txn.into(), entry);
                        pf_debug!(self.me; "voting yes on txn {}", txn);
                        return Ok(true);
                    }
                    Some(other) => {
                        pf_debug!(self.me; "txn {} waits on live txn {} for key {}",
                                           txn, other, key);
                    }
                }
            }

            if time::timeout_at(deadline, released).await.is_err() {
                pf_warn!(self.me; "voting no on txn {}: key {} still busy",
                                  txn, key);
                return Ok(false);
            }
        }
    }

    /// Moves a prepared transaction to `StartedCommit` and returns its
    /// operation. Returns `None` if the transaction is not prepared here.
    pub async fn begin_commit(
        &self,
        txn: &str,
    ) -> Result<Option<(DirectoryOp, ReplicaId)>, TripStoreError> {
        let mut table = self.table.lock().await;
        let entry = match table.live.get_mut(txn) {
            Some(entry) if entry.phase == TxnPhase::Prepared => entry,
            Some(entry) => {
                pf_debug!(self.me; "txn {} already in phase {}", txn, entry.phase);
                return Ok(None);
            }
            None => {
                pf_warn!(self.me; "commit of unknown txn {}", txn);
                return Ok(None);
            }
        };

        let op = DirectoryOp::from_tokens(&entry.op)?;
        // a failed append leaves the txn prepared, so it can still abort
        self.log
            .append(&entry.with_phase(TxnPhase::StartedCommit))
            .await?;
        entry.phase = TxnPhase::StartedCommit;
        Ok(Some((op, entry.coordinator)))
    }

    /// Marks a started commit as `Committed` and drops it from the live
    /// table. The durable record stays for recovery.
    pub async fn finish_commit(&self, txn: &str) -> Result<(), TripStoreError> {
        let mut table = self.table.lock().await;
        let logged = match table.live.get(txn) {
            Some(entry) => {
                let logged =
                    self.log.append(&entry.with_phase(TxnPhase::Committed)).await;
                table.end(txn);
                pf_debug!(self.me; "committed txn {}", txn);
                logged
            }
            None => Ok(()),
        };
        drop(table);
        self.released.notify_waiters();
        logged
    }

    /// Aborts a transaction, prepared or not. A transaction whose commit
    /// already started is left alone.
    pub async fn abort(&self, txn: &str) -> Result<(), TripStoreError> {
        let mut table = self.table.lock().await;
        let entry = match table.live.get(txn) {
            Some(entry) if entry.phase == TxnPhase::StartedCommit => {
                pf_warn!(self.me; "ignoring abort of committing txn {}", txn);
                return Ok(());
            }
            Some(entry) => entry.with_phase(TxnPhase::Aborted),
            None => TxnLogEntry {
                txn: txn.into(),
                coordinator: 0,
                key: String::new(),
                op: vec![],
                phase: TxnPhase::Aborted,
            },
        };

        self.log.append(&entry).await?;
        table.end(txn);
        drop(table);
        pf_debug!(self.me; "aborted txn {}", txn);
        self.released.notify_waiters();
        Ok(())
    }

    /// Phase of a transaction if it is live here.
    pub async fn phase_of(&self, txn: &str) -> Option<TxnPhase> {
        self.table.lock().await.live.get(txn).map(|entry| entry.phase)
    }

    /// Number of live transactions.
    pub async fn num_live(&self) -> usize {
        self.table.lock().await.live.len()
    }
}
