//! Downstream emission
//!
//! The host decides where records go. [`ChannelEmitter`] covers the common
//! case of handing encoded event bodies to another task.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use crate::config::SourceConfig;
use crate::convert::{ConvertedRecord, DelimitedEncoder};
use crate::error::EmissionError;

/// Receives converted batches.
///
/// A batch is either accepted as a whole or the call fails; on failure the
/// engine does not advance the watermark and the rows are polled again.
#[async_trait]
pub trait RecordEmitter: Send + Sync {
    /// Deliver one batch
    async fn emit(&self, batch: &[ConvertedRecord]) -> Result<(), EmissionError>;
}

/// Emitter that encodes records and sends the bodies over a bounded channel
#[derive(Debug, Clone)]
pub struct ChannelEmitter {
    tx: mpsc::Sender<Vec<u8>>,
    encoder: DelimitedEncoder,
}

impl ChannelEmitter {
    /// Create an emitter and the receiving end of its channel
    pub fn channel(capacity: usize, encoder: DelimitedEncoder) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, encoder }, rx)
    }

    /// Create an emitter encoding delimited records the way `config` asks
    pub fn for_config(capacity: usize, config: &SourceConfig) -> (Self, mpsc::Receiver<Vec<u8>>) {
        Self::channel(capacity, DelimitedEncoder::from_config(config))
    }
}

#[async_trait]
impl RecordEmitter for ChannelEmitter {
    async fn emit(&self, batch: &[ConvertedRecord]) -> Result<(), EmissionError> {
        for record in batch {
            let body = record
                .to_bytes(&self.encoder)
                .map_err(|e| EmissionError::with_source("failed to encode record", e))?;
            self.tx
                .send(body)
                .await
                .map_err(|_| EmissionError::new("downstream channel closed"))?;
        }
        trace!(records = batch.len(), "Batch sent downstream");
        Ok(())
    }
}
