use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::CorrelationId;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::{Message, Result};

/// Header carrying the correlation id directly.
pub const CORRELATION_HEADER: &str = "correlation-id";

/// W3C-style baggage header, a secondary carrier for the correlation id.
pub const BAGGAGE_HEADER: &str = "baggage";

const BAGGAGE_CORRELATION_KEY: &str = "correlation_id";

/// A message on the channel together with its transport metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique identifier for this publish.
    pub message_id: Uuid,

    /// Topic the message was published to.
    pub topic: String,

    /// The message body as JSON.
    pub payload: serde_json::Value,

    /// Transport headers, including correlation propagation.
    pub headers: HashMap<String, String>,

    /// When the message was published.
    pub enqueued_at: DateTime<Utc>,
}

impl Envelope {
    /// Wraps a message for publishing on its topic, stamping the correlation
    /// id into both the correlation header and the baggage header.
    pub fn wrap<M: Message>(message: &M) -> Result<Self> {
        let correlation_id = message.correlation_id().to_string();
        let mut headers = HashMap::new();
        headers.insert(
            BAGGAGE_HEADER.to_string(),
            format!("{BAGGAGE_CORRELATION_KEY}={correlation_id}"),
        );
        headers.insert(CORRELATION_HEADER.to_string(), correlation_id);

        Ok(Self {
            message_id: Uuid::new_v4(),
            topic: M::TOPIC.to_string(),
            payload: serde_json::to_value(message)?,
            headers,
            enqueued_at: Utc::now(),
        })
    }

    /// Adds or replaces a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Deserializes the payload into a concrete message type.
    pub fn decode<M: DeserializeOwned>(&self) -> Result<M> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Resolves the correlation id from the headers.
    ///
    /// The correlation header wins; the baggage entry is the fallback carrier.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.headers
            .get(CORRELATION_HEADER)
            .and_then(|v| CorrelationId::parse(v).ok())
            .or_else(|| self.baggage_correlation_id())
    }

    fn baggage_correlation_id(&self) -> Option<CorrelationId> {
        self.headers
            .get(BAGGAGE_HEADER)?
            .split(',')
            .filter_map(|member| member.split_once('='))
            .find(|(key, _)| key.trim() == BAGGAGE_CORRELATION_KEY)
            .and_then(|(_, value)| {
                // Baggage members may carry `;property` suffixes.
                let value = value.split(';').next().unwrap_or_default();
                CorrelationId::parse(value).ok()
            })
    }
}

/// Opaque lease receipt identifying one delivery attempt of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Receipt {
    pub(crate) seq: i64,
    pub(crate) attempt: u32,
}

/// A leased message handed to a consumer.
///
/// Until it is acked, nacked or dead-lettered, the message is invisible to
/// other consumers; once the lease expires it is delivered again.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: Envelope,

    /// 1-based delivery attempt count.
    pub attempt: u32,

    pub(crate) receipt: Receipt,
}

impl Delivery {
    pub fn receipt(&self) -> Receipt {
        self.receipt
    }
}
