//! LogLink - logs outbound message summaries via tracing

use tracing::{info, instrument};

use crate::error::LinkError;
use crate::link::NodeLink;
use crate::message::Envelope;

/// Link that only logs what would be sent, for dry runs
pub struct LogLink {
    name: String,
}

impl LogLink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl NodeLink for LogLink {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        name = "log_link_deliver",
        skip(self, envelope),
        fields(link = %self.name, topic = %envelope.topic)
    )]
    async fn deliver(&mut self, envelope: &Envelope) -> Result<(), LinkError> {
        info!(
            link = %self.name,
            topic = %envelope.topic,
            bytes = envelope.payload.len(),
            payload = %String::from_utf8_lossy(&envelope.payload),
            "Outbound message"
        );
        Ok(())
    }

    #[instrument(name = "log_link_close", skip(self))]
    async fn close(&mut self) -> Result<(), LinkError> {
        info!(link = %self.name, "LogLink closed");
        Ok(())
    }
}
