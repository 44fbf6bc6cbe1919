use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::model::Event;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

/// Durable record of committed transactions.
///
/// A batch passed to `append` is one transaction: after `Ok(())` all of it is
/// durable, after `Err` none of it is.
#[async_trait]
pub trait Journal: Send + Sync {
    async fn append(&self, batch: &[Event]) -> io::Result<()>;

    /// Replace the journal contents with `snapshot`.
    async fn compact(&self, snapshot: Vec<Event>) -> io::Result<()>;

    async fn appends_since_compact(&self) -> u64;
}

// ── Group-commit WAL journal ─────────────────────────────────────

type Reply = oneshot::Sender<io::Result<()>>;

enum WalCommand {
    Append { batch: Vec<Event>, response: Reply },
    Compact { events: Vec<Event>, response: Reply },
    AppendsSinceCompact { response: oneshot::Sender<u64> },
}

/// File-backed journal. A background task owns the [`Wal`] and fsyncs
/// concurrent transactions together.
pub struct WalJournal {
    tx: mpsc::Sender<WalCommand>,
}

impl WalJournal {
    /// Open the WAL at `path` and spawn its writer. Must be called inside a
    /// tokio runtime. Returns the batches already on disk for replay.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Vec<Event>>)> {
        let (wal, history) = Wal::open(path)?;
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, rx));
        Ok((Self { tx }, history))
    }

    async fn request<T>(
        &self,
        cmd: WalCommand,
        rx: oneshot::Receiver<T>,
    ) -> io::Result<T> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "WAL writer shut down"))?;
        rx.await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "WAL writer dropped response"))
    }
}

#[async_trait]
impl Journal for WalJournal {
    async fn append(&self, batch: &[Event]) -> io::Result<()> {
        let (response, rx) = oneshot::channel();
        let cmd = WalCommand::Append {
            batch: batch.to_vec(),
            response,
        };
        self.request(cmd, rx).await?
    }

    async fn compact(&self, events: Vec<Event>) -> io::Result<()> {
        let (response, rx) = oneshot::channel();
        self.request(WalCommand::Compact { events, response }, rx).await?
    }

    async fn appends_since_compact(&self) -> u64 {
        let (response, rx) = oneshot::channel();
        self.request(WalCommand::AppendsSinceCompact { response }, rx)
            .await
            .unwrap_or(0)
    }
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole group.
/// 5. Respond to all senders; on failure roll the file back so nothing
///    from the group survives.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { batch, response } => {
                let mut group = vec![(batch, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { batch, response }) => group.push((batch, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush the group
                    }
                }

                metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(group.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_group(&mut wal, &group);
                metrics::histogram!(WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_group(group, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_group(wal: &mut Wal, group: &[(Vec<Event>, Reply)]) -> io::Result<()> {
    let written = group
        .iter()
        .try_for_each(|(batch, _)| wal.append_buffered(batch))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = written {
        tracing::error!(error = %e, frames = group.len(), "WAL group commit failed");
        if let Err(rb) = wal.rollback() {
            tracing::error!(error = %rb, "WAL rollback failed, writer poisoned until reopen");
        }
        return Err(e);
    }
    Ok(())
}

fn respond_group(group: Vec<(Vec<Event>, Reply)>, result: &io::Result<()>) {
    for (_, tx) in group {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are grouped by the writer loop"),
    }
}

// ── In-memory journal ────────────────────────────────────────────

/// Keeps committed batches in memory. Used by tests and by embedders that
/// persist elsewhere.
#[derive(Default)]
pub struct MemoryJournal {
    batches: Mutex<Vec<Vec<Event>>>,
    appends: AtomicU64,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything committed so far, in order. Feed to
    /// [`Engine::with_journal`](super::Engine::with_journal) to rebuild.
    pub async fn batches(&self) -> Vec<Vec<Event>> {
        self.batches.lock().await.clone()
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn append(&self, batch: &[Event]) -> io::Result<()> {
        self.batches.lock().await.push(batch.to_vec());
        self.appends.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn compact(&self, snapshot: Vec<Event>) -> io::Result<()> {
        let mut batches = self.batches.lock().await;
        batches.clear();
        if !snapshot.is_empty() {
            batches.push(snapshot);
        }
        self.appends.store(0, Ordering::Relaxed);
        Ok(())
    }

    async fn appends_since_compact(&self) -> u64 {
        self.appends.load(Ordering::Relaxed)
    }
}
