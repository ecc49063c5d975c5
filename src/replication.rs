//! Leader-to-follower propagation of committed writes.
//!
//! Only the interface and a logging stub live here. A [`Leader`] fans each
//! [`LogEntry`] out to its followers concurrently and reports one ack per
//! follower; [`spawn_replication_worker`] runs that off the write path.
//! Quorum and retry policy are left to whoever plugs in a real transport.

use crate::config::ReplicationConfig;
use crate::engine::WriteOp;
use crate::error::ReplicationError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

/// A committed write, tagged with the leader's commit sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub sequence: u64,
    pub op: WriteOp,
}

impl LogEntry {
    pub fn new(sequence: u64, op: WriteOp) -> Self {
        Self { sequence, op }
    }
}

/// A replica that accepts log entries.
#[async_trait]
pub trait Follower: Send + Sync {
    fn id(&self) -> &str;

    async fn apply(&self, entry: &LogEntry) -> Result<(), ReplicationError>;
}

/// Follower stub: logs every entry and acknowledges it.
#[derive(Debug)]
pub struct LoggingFollower {
    id: String,
    applied: AtomicU64,
    last_sequence: AtomicU64,
}

impl LoggingFollower {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            applied: AtomicU64::new(0),
            last_sequence: AtomicU64::new(0),
        }
    }

    /// Number of entries acknowledged so far.
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Follower for LoggingFollower {
    fn id(&self) -> &str {
        &self.id
    }

    async fn apply(&self, entry: &LogEntry) -> Result<(), ReplicationError> {
        tracing::debug!(
            "Follower {} applied entry {} for key {:?}",
            self.id,
            entry.sequence,
            entry.op.key()
        );
        self.applied.fetch_add(1, Ordering::SeqCst);
        self.last_sequence.fetch_max(entry.sequence, Ordering::SeqCst);
        Ok(())
    }
}

/// Outcome of sending one entry to one follower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowerAck {
    pub follower: String,
    pub sequence: u64,
    pub result: Result<(), ReplicationError>,
}

impl FollowerAck {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Sends log entries to a set of followers.
#[async_trait]
pub trait Replicator: Send + Sync {
    /// Deliver `entry` to every follower. Returns one ack per follower.
    async fn propagate(&self, entry: LogEntry) -> Vec<FollowerAck>;
}

/// Fans every entry out to all followers at once.
pub struct Leader {
    followers: Vec<Arc<dyn Follower>>,
}

impl Leader {
    pub fn new(followers: Vec<Arc<dyn Follower>>) -> Self {
        Self { followers }
    }

    /// One [`LoggingFollower`] per configured follower id.
    pub fn from_config(config: &ReplicationConfig) -> Self {
        Self::new(
            config
                .followers
                .iter()
                .map(|id| Arc::new(LoggingFollower::new(id.clone())) as Arc<dyn Follower>)
                .collect(),
        )
    }

    pub fn followers(&self) -> &[Arc<dyn Follower>] {
        &self.followers
    }
}

#[async_trait]
impl Replicator for Leader {
    async fn propagate(&self, entry: LogEntry) -> Vec<FollowerAck> {
        let sequence = entry.sequence;
        let entry = Arc::new(entry);

        let mut tasks = JoinSet::new();
        for (i, follower) in self.followers.iter().enumerate() {
            let follower = follower.clone();
            let entry = entry.clone();
            tasks.spawn(async move { (i, follower.apply(&entry).await) });
        }

        let mut results: Vec<Option<Result<(), ReplicationError>>> =
            (0..self.followers.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((i, result)) => results[i] = Some(result),
                Err(e) => tracing::warn!("Replication task for entry {} failed: {}", sequence, e),
            }
        }

        self.followers
            .iter()
            .zip(results)
            .map(|(follower, result)| FollowerAck {
                follower: follower.id().to_string(),
                sequence,
                result: result.unwrap_or_else(|| {
                    Err(ReplicationError::Unavailable {
                        follower: follower.id().to_string(),
                        reason: "replication task did not complete".to_string(),
                    })
                }),
            })
            .collect()
    }
}

/// Handle for queueing entries to the replication worker.
///
/// Cloning is cheap. The worker stops once every handle is dropped and the
/// queue has drained.
#[derive(Clone)]
pub struct ReplicationQueue {
    tx: mpsc::UnboundedSender<LogEntry>,
}

impl ReplicationQueue {
    /// Queue an entry. Never blocks.
    pub fn submit(&self, entry: LogEntry) -> Result<(), ReplicationError> {
        self.tx
            .send(entry)
            .map_err(|_| ReplicationError::QueueClosed)
    }
}

/// Start a task that drains the queue into `replicator`, one entry at a time
/// so followers see entries in commit order.
///
/// Must be called from within a tokio runtime.
pub fn spawn_replication_worker<R>(replicator: R) -> (ReplicationQueue, JoinHandle<()>)
where
    R: Replicator + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<LogEntry>();

    let handle = tokio::spawn(async move {
        while let Some(entry) = rx.recv().await {
            let sequence = entry.sequence;
            for ack in replicator.propagate(entry).await {
                if let Err(e) = ack.result {
                    tracing::warn!("Entry {} not replicated to {}: {}", sequence, ack.follower, e);
                }
            }
        }
        tracing::info!("Replication worker stopped");
    });

    (ReplicationQueue { tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RejectingFollower;

    #[async_trait]
    impl Follower for RejectingFollower {
        fn id(&self) -> &str {
            "rejecting"
        }

        async fn apply(&self, entry: &LogEntry) -> Result<(), ReplicationError> {
            Err(ReplicationError::Rejected {
                follower: "rejecting".to_string(),
                sequence: entry.sequence,
                reason: "read-only".to_string(),
            })
        }
    }

    struct PanickingFollower;

    #[async_trait]
    impl Follower for PanickingFollower {
        fn id(&self) -> &str {
            "panicking"
        }

        async fn apply(&self, _entry: &LogEntry) -> Result<(), ReplicationError> {
            panic!("follower crashed");
        }
    }

    fn set_entry(sequence: u64, key: &str) -> LogEntry {
        LogEntry::new(
            sequence,
            WriteOp::Set {
                key: key.as_bytes().to_vec(),
                value: b"v".to_vec(),
            },
        )
    }

    #[tokio::test]
    async fn test_leader_acks_every_follower() {
        let f1 = Arc::new(LoggingFollower::new("f1"));
        let f2 = Arc::new(LoggingFollower::new("f2"));
        let followers: Vec<Arc<dyn Follower>> = vec![f1.clone(), f2.clone()];
        let leader = Leader::new(followers);

        let acks = leader.propagate(set_entry(7, "k")).await;

        assert_eq!(acks.len(), 2);
        assert_eq!(acks[0].follower, "f1");
        assert_eq!(acks[1].follower, "f2");
        assert!(acks.iter().all(|a| a.is_ok() && a.sequence == 7));
        assert_eq!(f1.applied(), 1);
        assert_eq!(f2.last_sequence(), 7);
    }

    #[tokio::test]
    async fn test_leader_reports_failures_per_follower() {
        let ok = Arc::new(LoggingFollower::new("ok"));
        let followers: Vec<Arc<dyn Follower>> =
            vec![Arc::new(RejectingFollower), ok.clone(), Arc::new(PanickingFollower)];
        let leader = Leader::new(followers);

        let acks = leader.propagate(set_entry(1, "k")).await;

        assert!(matches!(acks[0].result, Err(ReplicationError::Rejected { .. })));
        assert!(acks[1].is_ok());
        assert_eq!(acks[2].follower, "panicking");
        assert!(matches!(acks[2].result, Err(ReplicationError::Unavailable { .. })));
        assert_eq!(ok.applied(), 1);
    }

    #[tokio::test]
    async fn test_leader_without_followers() {
        let leader = Leader::from_config(&ReplicationConfig::default());
        assert!(leader.propagate(set_entry(1, "k")).await.is_empty());
    }

    #[tokio::test]
    async fn test_worker_drains_queue_in_order() {
        let follower = Arc::new(LoggingFollower::new("f1"));
        let leader = Leader::new(vec![follower.clone() as Arc<dyn Follower>]);
        let (queue, handle) = spawn_replication_worker(leader);

        for seq in 1..=10 {
            queue.submit(set_entry(seq, &format!("k{}", seq))).unwrap();
        }
        drop(queue);
        handle.await.unwrap();

        assert_eq!(follower.applied(), 10);
        assert_eq!(follower.last_sequence(), 10);
    }

    #[tokio::test]
    async fn test_submit_after_worker_stopped() {
        let (queue, handle) = spawn_replication_worker(Leader::new(Vec::new()));
        handle.abort();
        let _ = handle.await;

        assert_eq!(queue.submit(set_entry(1, "k")), Err(ReplicationError::QueueClosed));
    }
}
