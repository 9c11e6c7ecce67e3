use std::time::Duration;

use eds_client::{db, Datapoint};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::sync::{mpsc, Mutex};

use crate::pipeline::{Lifecycle, PipelineError, Service};

/// Something that can open a write session against the store.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    type Session: BatchWriter;

    async fn open(&self) -> Result<Self::Session, PipelineError>;
}

/// Writes a batch atomically: either every point lands or none does.
#[async_trait::async_trait]
pub trait BatchWriter: Send {
    async fn write_batch(&mut self, batch: &[Datapoint]) -> Result<(), PipelineError>;
}

pub struct PgStorage {
    uri: String,
    max_connections: u32,
    granularity: Duration,
}

impl PgStorage {
    pub fn new(uri: impl Into<String>, max_connections: u32, granularity: Duration) -> Self {
        Self {
            uri: uri.into(),
            max_connections,
            granularity,
        }
    }
}

#[async_trait::async_trait]
impl Storage for PgStorage {
    type Session = PgSession;

    async fn open(&self) -> Result<PgSession, PipelineError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(&self.uri)
            .await
            .map_err(|e| PipelineError::Connect(e.to_string()))?;

        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| PipelineError::Connect(e.to_string()))?;
        db::ensure_schema(&mut *conn)
            .await
            .map_err(|e| PipelineError::Connect(format!("creating env table: {e}")))?;

        Ok(PgSession {
            pool,
            granularity: self.granularity,
        })
    }
}

pub struct PgSession {
    pool: PgPool,
    granularity: Duration,
}

#[async_trait::async_trait]
impl BatchWriter for PgSession {
    async fn write_batch(&mut self, batch: &[Datapoint]) -> Result<(), PipelineError> {
        let mut tx = self.pool.begin().await?;

        for dp in batch {
            let res = db::insert_datapoint(&mut *tx, dp, self.granularity).await;
            if let Err(e) = res {
                if let Err(rb) = tx.rollback().await {
                    tracing::warn!(error = %rb, "rollback failed");
                }
                return Err(e.into());
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

/// Points accepted by the writer but not yet committed, in arrival order.
#[derive(Debug, Default)]
pub struct PendingBuffer {
    points: Vec<Datapoint>,
}

impl PendingBuffer {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Datapoint] {
        &self.points
    }

    /// Append `dp` and try to commit everything pending in one batch.
    pub async fn deliver<W>(&mut self, dp: Datapoint, writer: &mut W) -> Result<usize, PipelineError>
    where
        W: BatchWriter + ?Sized,
    {
        self.points.push(dp);
        self.flush(writer).await
    }

    /// Commit the whole buffer. Returns how many points were written; the
    /// buffer is left untouched on error.
    pub async fn flush<W>(&mut self, writer: &mut W) -> Result<usize, PipelineError>
    where
        W: BatchWriter + ?Sized,
    {
        if self.points.is_empty() {
            return Ok(0);
        }

        writer.write_batch(&self.points).await?;
        let written = self.points.len();
        self.points.clear();
        Ok(written)
    }
}

/// Receives datapoints from the acquirer and persists them.
///
/// Persist failures never end the run: points stay buffered and ride along
/// with the next arrival. Failing to open storage does end it.
pub struct PostgresSink<S> {
    storage: S,
    inbox: Mutex<mpsc::Receiver<Datapoint>>,
    flush_on_stop: Duration,
    lifecycle: Lifecycle,
}

impl<S: Storage> PostgresSink<S> {
    pub fn new(storage: S, inbox: mpsc::Receiver<Datapoint>, flush_on_stop: Duration) -> Self {
        Self {
            storage,
            inbox: Mutex::new(inbox),
            flush_on_stop,
            lifecycle: Lifecycle::default(),
        }
    }

    async fn deliver(&self, pending: &mut PendingBuffer, dp: Datapoint, session: &mut S::Session) {
        match pending.deliver(dp, session).await {
            Ok(written) => {
                metrics::counter!("eds_datapoints_persisted_total").increment(written as u64);
                tracing::debug!(rows = written, "persisted");
            }
            Err(e) => {
                metrics::counter!("eds_persist_failures_total").increment(1);
                tracing::warn!(error = %e, pending = pending.len(), "persist failed (buffering)");
            }
        }
        metrics::gauge!("eds_pending_buffer_len").set(pending.len() as f64);
    }

    /// Last attempt at committing leftovers once the run is over.
    async fn drain(&self, pending: &mut PendingBuffer, session: &mut S::Session) {
        if pending.is_empty() {
            return;
        }
        if self.flush_on_stop.is_zero() {
            tracing::warn!(lost = pending.len(), "exiting with unpersisted points");
            return;
        }

        match tokio::time::timeout(self.flush_on_stop, pending.flush(session)).await {
            Ok(Ok(written)) => {
                metrics::counter!("eds_datapoints_persisted_total").increment(written as u64);
                tracing::info!(rows = written, "flushed pending points on exit");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, lost = pending.len(), "final flush failed, dropping points");
            }
            Err(_) => {
                tracing::warn!(lost = pending.len(), "final flush timed out, dropping points");
            }
        }
        metrics::gauge!("eds_pending_buffer_len").set(0.0);
    }
}

#[async_trait::async_trait]
impl<S: Storage + 'static> Service for PostgresSink<S> {
    fn name(&self) -> &str {
        "writer"
    }

    async fn serve(&self) -> Result<(), PipelineError> {
        let run = self.lifecycle.begin();
        let cancel = run.token().clone();
        tracing::info!("writer starting");

        // Held for the whole run; a restarted writer picks the receiver back up.
        let mut inbox = self.inbox.lock().await;

        let mut session = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("writer exiting");
                return Ok(());
            }
            res = self.storage.open() => match res {
                Ok(session) => session,
                Err(e) => {
                    tracing::error!(error = %e, "storage unavailable (fatal)");
                    return Err(e);
                }
            },
        };

        let mut pending = PendingBuffer::default();
        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                msg = inbox.recv() => match msg {
                    Some(dp) => self.deliver(&mut pending, dp, &mut session).await,
                    None => break Err(PipelineError::ChannelClosed),
                },
            }
        };

        self.drain(&mut pending, &mut session).await;
        tracing::info!("writer exiting");
        result
    }

    fn stop(&self) {
        self.lifecycle.stop();
    }
}
