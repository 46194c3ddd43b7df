//! Data-transfer collaborator interface and an in-memory implementation.
//!
//! The orchestrator only sequences transfers; implementations own the actual
//! byte movement. [`SimTransfer`] models each server's service state as an
//! append-only write log, which makes the cutover equality check ("target
//! holds exactly the source's state at the cutover instant") a plain
//! comparison of logs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::ServerId;

/// Opaque handle for an in-flight bulk copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransferHandle(pub u64);

/// Bulk copy progress as reported by the collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Done,
    Failed,
}

/// Result of one incremental delta round.
#[derive(Debug, Clone, Copy)]
pub struct DeltaOutcome {
    /// Entries replayed onto the target in this round.
    pub applied: u64,
    /// Entries still outstanding after this round.
    pub lag: u64,
}

/// Replicates service state from a source server to a target.
#[async_trait]
pub trait DataTransfer: Send + Sync + 'static {
    /// Begin an asynchronous bulk copy of the source's state.
    async fn start_bulk_copy(
        &self,
        source: ServerId,
        target: ServerId,
    ) -> anyhow::Result<TransferHandle>;

    /// Poll a bulk copy started earlier.
    async fn poll_transfer(&self, handle: TransferHandle) -> anyhow::Result<TransferStatus>;

    /// Replay state changes that landed on the source since the copy began.
    async fn apply_delta(&self, source: ServerId, target: ServerId)
        -> anyhow::Result<DeltaOutcome>;

    /// Stop accepting new writes on the source. Only called inside the
    /// cutover critical section; writers retry against the routing authority.
    async fn pause_writes(&self, source: ServerId) -> anyhow::Result<()>;

    /// Re-admit writes on the source (abort path, or post-cutover cleanup).
    async fn resume_writes(&self, source: ServerId) -> anyhow::Result<()>;
}

/// Tuning for [`SimTransfer`].
#[derive(Debug, Clone, Copy)]
pub struct SimTransferConfig {
    /// Poll rounds a bulk copy reports `Pending` before completing.
    pub bulk_copy_polls: u32,
    /// Backlog entries replayed per delta round.
    pub delta_drain_per_round: u64,
    /// New writes appended to the source per delta round; setting this at or
    /// above `delta_drain_per_round` makes the backlog never converge.
    pub writes_per_delta_round: u64,
    /// Report bulk copies as `Failed`.
    pub fail_bulk_copy: bool,
}

impl Default for SimTransferConfig {
    fn default() -> Self {
        Self {
            bulk_copy_polls: 3,
            delta_drain_per_round: 64,
            writes_per_delta_round: 0,
            fail_bulk_copy: false,
        }
    }
}

#[derive(Default)]
struct SimTransferInner {
    /// Authoritative per-server write logs.
    logs: BTreeMap<ServerId, Vec<u64>>,
    /// Replicated prefix length per (source, target) pair.
    copied: BTreeMap<(ServerId, ServerId), usize>,
    /// Replica contents per (source, target) pair.
    replicas: BTreeMap<(ServerId, ServerId), Vec<u64>>,
    handles: BTreeMap<TransferHandle, BulkCopy>,
    paused: BTreeSet<ServerId>,
    next_handle: u64,
    next_seq: u64,
}

struct BulkCopy {
    source: ServerId,
    target: ServerId,
    snapshot_len: usize,
    remaining_polls: u32,
}

/// Deterministic in-memory transfer used by tests and the workload driver.
pub struct SimTransfer {
    cfg: SimTransferConfig,
    inner: Mutex<SimTransferInner>,
}

impl SimTransfer {
    pub fn new(cfg: SimTransferConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(SimTransferInner::default()),
        }
    }

    /// Append a write to the server's log. Returns false while the server's
    /// writes are paused (the caller retries against the routing authority).
    pub fn record_write(&self, server: ServerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.paused.contains(&server) {
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.logs.entry(server).or_default().push(seq);
        true
    }

    /// Authoritative log for a server.
    pub fn log(&self, server: ServerId) -> Vec<u64> {
        self.inner
            .lock()
            .unwrap()
            .logs
            .get(&server)
            .cloned()
            .unwrap_or_default()
    }

    /// Replica contents accumulated on `target` for data from `source`.
    pub fn replica(&self, source: ServerId, target: ServerId) -> Vec<u64> {
        self.inner
            .lock()
            .unwrap()
            .replicas
            .get(&(source, target))
            .cloned()
            .unwrap_or_default()
    }

}

#[async_trait]
impl DataTransfer for SimTransfer {
    async fn start_bulk_copy(
        &self,
        source: ServerId,
        target: ServerId,
    ) -> anyhow::Result<TransferHandle> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_handle += 1;
        let handle = TransferHandle(inner.next_handle);
        let snapshot_len = inner.logs.get(&source).map(Vec::len).unwrap_or(0);
        inner.handles.insert(
            handle,
            BulkCopy {
                source,
                target,
                snapshot_len,
                remaining_polls: self.cfg.bulk_copy_polls,
            },
        );
        inner.copied.insert((source, target), 0);
        inner.replicas.insert((source, target), Vec::new());
        Ok(handle)
    }

    async fn poll_transfer(&self, handle: TransferHandle) -> anyhow::Result<TransferStatus> {
        if self.cfg.fail_bulk_copy {
            return Ok(TransferStatus::Failed);
        }
        let mut inner = self.inner.lock().unwrap();
        let Some(copy) = inner.handles.get_mut(&handle) else {
            anyhow::bail!("unknown transfer handle {handle:?}");
        };
        if copy.remaining_polls > 0 {
            copy.remaining_polls -= 1;
            return Ok(TransferStatus::Pending);
        }
        let (source, target, snapshot_len) = (copy.source, copy.target, copy.snapshot_len);
        let prefix: Vec<u64> = inner
            .logs
            .get(&source)
            .map(|log| log.iter().copied().take(snapshot_len).collect())
            .unwrap_or_default();
        inner.replicas.insert((source, target), prefix);
        inner.copied.insert((source, target), snapshot_len);
        Ok(TransferStatus::Done)
    }

    async fn apply_delta(
        &self,
        source: ServerId,
        target: ServerId,
    ) -> anyhow::Result<DeltaOutcome> {
        let mut inner = self.inner.lock().unwrap();

        let total = inner.logs.get(&source).map(Vec::len).unwrap_or(0);
        let done = inner.copied.get(&(source, target)).copied().unwrap_or(0);
        let take = (total - done).min(self.cfg.delta_drain_per_round.max(1) as usize);
        let chunk: Vec<u64> = inner
            .logs
            .get(&source)
            .map(|log| log.iter().copied().skip(done).take(take).collect())
            .unwrap_or_default();
        inner
            .replicas
            .entry((source, target))
            .or_default()
            .extend(chunk);
        inner.copied.insert((source, target), done + take);

        // Concurrent writer traffic lands after the drain, so the reported
        // lag reflects backlog the next round still has to replay.
        if !inner.paused.contains(&source) {
            for _ in 0..self.cfg.writes_per_delta_round {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.logs.entry(source).or_default().push(seq);
            }
        }

        let final_total = inner.logs.get(&source).map(Vec::len).unwrap_or(0);
        Ok(DeltaOutcome {
            applied: take as u64,
            lag: (final_total - done - take) as u64,
        })
    }

    async fn pause_writes(&self, source: ServerId) -> anyhow::Result<()> {
        self.inner.lock().unwrap().paused.insert(source);
        Ok(())
    }

    async fn resume_writes(&self, source: ServerId) -> anyhow::Result<()> {
        self.inner.lock().unwrap().paused.remove(&source);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bulk_copy_then_delta_converges_to_source_log() {
        let transfer = SimTransfer::new(SimTransferConfig {
            bulk_copy_polls: 1,
            delta_drain_per_round: 4,
            ..SimTransferConfig::default()
        });
        for _ in 0..10 {
            assert!(transfer.record_write(1));
        }

        let handle = transfer.start_bulk_copy(1, 2).await.unwrap();
        assert_eq!(
            transfer.poll_transfer(handle).await.unwrap(),
            TransferStatus::Pending
        );
        // Writes that land during the bulk copy become delta backlog.
        for _ in 0..3 {
            assert!(transfer.record_write(1));
        }
        assert_eq!(
            transfer.poll_transfer(handle).await.unwrap(),
            TransferStatus::Done
        );
        assert_eq!(transfer.replica(1, 2).len(), 10);

        let out = transfer.apply_delta(1, 2).await.unwrap();
        assert_eq!(out.applied, 3);
        assert_eq!(out.lag, 0);
        assert_eq!(transfer.replica(1, 2), transfer.log(1));
    }

    #[tokio::test]
    async fn paused_source_rejects_writes_until_resumed() {
        let transfer = SimTransfer::new(SimTransferConfig::default());
        assert!(transfer.record_write(1));
        transfer.pause_writes(1).await.unwrap();
        assert!(!transfer.record_write(1));
        transfer.resume_writes(1).await.unwrap();
        assert!(transfer.record_write(1));
        assert_eq!(transfer.log(1).len(), 2);
    }

    #[tokio::test]
    async fn sustained_writer_traffic_keeps_backlog_from_converging() {
        let transfer = SimTransfer::new(SimTransferConfig {
            bulk_copy_polls: 0,
            delta_drain_per_round: 2,
            writes_per_delta_round: 2,
            ..SimTransferConfig::default()
        });
        for _ in 0..8 {
            assert!(transfer.record_write(1));
        }
        let handle = transfer.start_bulk_copy(1, 2).await.unwrap();
        transfer.poll_transfer(handle).await.unwrap();

        for _ in 0..20 {
            let out = transfer.apply_delta(1, 2).await.unwrap();
            assert!(out.lag > 0, "backlog should never fully drain");
        }
    }
}
