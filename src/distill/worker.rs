//! Background digestion.
//!
//! Capturing an observation must not wait on the oracle. Submitters hand the
//! observation to a bounded channel and return; one task drains the channel
//! and digests sequentially.

use super::Distiller;
use crate::observations::Observation;
use crate::{DistillError, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct DigestWorker {
    tx: mpsc::Sender<Observation>,
    handle: JoinHandle<usize>,
}

impl DigestWorker {
    /// Start the digestion task. `capacity` bounds the queue.
    pub fn spawn(distiller: Arc<Distiller>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Observation>(capacity.max(1));

        let handle = tokio::spawn(async move {
            let mut digested = 0;
            while let Some(observation) = rx.recv().await {
                match distiller.digest_observation(&observation).await {
                    Ok(categories) => {
                        digested += 1;
                        debug!(
                            observation_id = %observation.id,
                            "Background digestion touched {} categories",
                            categories.len()
                        );
                    }
                    Err(e) => {
                        warn!(
                            observation_id = %observation.id,
                            "Background digestion failed: {}", e
                        );
                    }
                }
            }
            info!("Digest worker drained, {} observations digested", digested);
            digested
        });

        Self { tx, handle }
    }

    /// Queue an observation. Returns once it is enqueued, not once digested.
    pub async fn submit(&self, observation: Observation) -> Result<()> {
        self.tx
            .send(observation)
            .await
            .map_err(|_| DistillError::Storage("digest worker has stopped".to_string()))
    }

    /// Close the queue, wait for everything already submitted, and return
    /// how many observations were digested successfully.
    pub async fn shutdown(self) -> Result<usize> {
        drop(self.tx);
        self.handle
            .await
            .map_err(|e| DistillError::Storage(format!("digest worker panicked: {}", e)))
    }
}
