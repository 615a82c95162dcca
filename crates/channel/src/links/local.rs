//! LocalLink - in-process delivery into a node's inbox

use tokio::sync::mpsc;

use crate::error::LinkError;
use crate::link::NodeLink;
use crate::message::Envelope;

/// Link to a node running in the same process (simulation, tests).
///
/// The node receives encoded envelopes and decodes them itself, so the
/// wire format is exercised end to end.
pub struct LocalLink {
    name: String,
    tx: mpsc::Sender<Envelope>,
}

impl LocalLink {
    pub fn new(name: impl Into<String>, tx: mpsc::Sender<Envelope>) -> Self {
        Self {
            name: name.into(),
            tx,
        }
    }

    /// Link plus the receiving end of the node inbox
    pub fn pair(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(name, tx), rx)
    }
}

impl NodeLink for LocalLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&mut self, envelope: &Envelope) -> Result<(), LinkError> {
        self.tx
            .send(envelope.clone())
            .await
            .map_err(|_| LinkError::Closed(self.name.clone()))
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        Ok(())
    }
}
