//! Background delivery of post-log records
//!
//! Request tasks enqueue [`AuditlogMessage`]s on a bounded channel with a send
//! timeout. A single worker task drains the channel in FIFO order, so shards
//! of one request reach the backend in sequence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::models::AuditlogMessage;
use super::service::PostAuditlogService;
use crate::metrics::AuditlogMetrics;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("audit queue is full, gave up after {0:?}")]
    Timeout(Duration),

    #[error("audit worker is not running")]
    Closed,
}

impl EnqueueError {
    /// Metric label
    pub fn reason(&self) -> &'static str {
        match self {
            EnqueueError::Timeout(_) => "timeout",
            EnqueueError::Closed => "closed",
        }
    }
}

/// Producer side of the post-log queue
#[async_trait]
pub trait AuditlogSink: Send + Sync {
    async fn enqueue(&self, message: AuditlogMessage) -> Result<(), EnqueueError>;
}

#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<AuditlogMessage>,
    timeout: Duration,
}

#[async_trait]
impl AuditlogSink for ChannelSink {
    async fn enqueue(&self, message: AuditlogMessage) -> Result<(), EnqueueError> {
        self.sender
            .send_timeout(message, self.timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => EnqueueError::Timeout(self.timeout),
                SendTimeoutError::Closed(_) => EnqueueError::Closed,
            })
    }
}

/// Create the post-log queue
pub fn channel(
    capacity: usize,
    send_timeout: Duration,
) -> (ChannelSink, mpsc::Receiver<AuditlogMessage>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (
        ChannelSink {
            sender,
            timeout: send_timeout,
        },
        receiver,
    )
}

/// Sink used when audit logging is disabled
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpSink;

#[async_trait]
impl AuditlogSink for NoOpSink {
    async fn enqueue(&self, _message: AuditlogMessage) -> Result<(), EnqueueError> {
        Ok(())
    }
}

pub struct AuditWorker {
    receiver: mpsc::Receiver<AuditlogMessage>,
    service: Arc<dyn PostAuditlogService>,
    shutdown: CancellationToken,
    metrics: AuditlogMetrics,
}

impl AuditWorker {
    pub fn new(
        receiver: mpsc::Receiver<AuditlogMessage>,
        service: Arc<dyn PostAuditlogService>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            receiver,
            service,
            shutdown,
            metrics: AuditlogMetrics::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: AuditlogMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process messages until cancelled or until every sink has been dropped.
    /// Messages still queued at cancellation are discarded.
    pub async fn run(mut self) {
        info!("Audit log worker started");

        loop {
            let message = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Audit log worker cancelled");
                    break;
                }
                message = self.receiver.recv() => match message {
                    Some(message) => message,
                    None => {
                        info!("Audit log queue closed");
                        break;
                    }
                },
            };

            self.process(message).await;
        }

        info!("Audit log worker stopped");
    }

    async fn process(&self, message: AuditlogMessage) {
        let tag = message.tag;
        match self.service.log(&message).await {
            Ok(()) => {
                self.metrics.record_delivered();
                debug!(
                    transaction_id = %tag.transaction_id,
                    shard = tag.index,
                    "Post-log record processed"
                );
            },
            Err(e) => {
                self.metrics.record_failed(e.reason());
                error!(
                    transaction_id = %tag.transaction_id,
                    shard = tag.index,
                    error = %e,
                    "Failed to post-log proxied response"
                );
            },
        }
    }
}
