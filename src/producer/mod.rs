//! Client-side traffic generation.
//!
//! A [`Producer`] sends enveloped messages carrying a routing token. A
//! [`ClientSession`] pairs it with a [`FilterRuleManager`] so each iteration
//! routes a fresh token into a fresh lane before sending.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{BusError, MessagingClient, OutgoingMessage};
use crate::config::{ProducerConfig, TopicConfig};
use crate::envelope::{Envelope, EnvelopeCodec, ProstEnvelopeCodec};
use crate::filter::{FilterError, FilterRuleManager, RotatedFilter};

/// Length of generated message ids.
pub const MESSAGE_ID_LEN: usize = 8;

fn short_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(MESSAGE_ID_LEN);
    id
}

/// Result of one produce run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProduceReport {
    /// Ids of messages accepted by the transport, in send order.
    pub sent: Vec<String>,
    pub failed: usize,
}

/// Sends token-tagged test messages.
pub struct Producer {
    messaging: Arc<dyn MessagingClient>,
    codec: Arc<dyn EnvelopeCodec>,
    send_delay: Duration,
}

impl Producer {
    pub fn new(
        messaging: Arc<dyn MessagingClient>,
        codec: Arc<dyn EnvelopeCodec>,
        send_delay: Duration,
    ) -> Self {
        Self {
            messaging,
            codec,
            send_delay,
        }
    }

    pub fn with_default_codec(messaging: Arc<dyn MessagingClient>, send_delay: Duration) -> Self {
        Self::new(messaging, Arc::new(ProstEnvelopeCodec), send_delay)
    }

    /// Send `count` messages with `token` as subject and the topic TTL.
    ///
    /// A failed send is logged and skipped; only opening the sender can
    /// fail the whole run.
    #[tracing::instrument(name = "producer.send", skip_all, fields(token = %token, count = count))]
    pub async fn send(
        &self,
        config: &TopicConfig,
        token: &str,
        filter_rule: Option<&str>,
        count: usize,
    ) -> Result<ProduceReport, BusError> {
        let mut sender = self.messaging.create_sender(&config.topic).await?;
        let mut report = ProduceReport::default();

        for i in 0..count {
            let message_id = short_id();
            let payload = format!("{token} - Test Message with index: {i}");
            let mut envelope = Envelope::new(token, payload);
            if let Some(rule) = filter_rule {
                envelope = envelope.with_filter_rule(rule);
            }
            let message = OutgoingMessage {
                message_id: message_id.clone(),
                subject: Some(token.to_string()),
                body: self.codec.encode(&envelope),
                time_to_live: Some(config.message_ttl()),
            };

            match sender.send(message).await {
                Ok(()) => {
                    debug!(message_id = %message_id, index = i, "Message sent");
                    report.sent.push(message_id);
                }
                Err(e) => {
                    warn!(message_id = %message_id, index = i, error = %e, "Send failed, continuing");
                    report.failed += 1;
                }
            }

            if i + 1 < count && !self.send_delay.is_zero() {
                tokio::time::sleep(self.send_delay).await;
            }
        }

        if let Err(e) = sender.close().await {
            debug!(error = %e, "Sender close failed");
        }
        info!(sent = report.sent.len(), failed = report.failed, "Messages produced");
        Ok(report)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// One client iteration: the token used, the rotation, and what was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationReport {
    pub token: String,
    pub filter: RotatedFilter,
    pub produced: ProduceReport,
}

/// One logical client: a lane plus the traffic sent into it.
pub struct ClientSession {
    filter: FilterRuleManager,
    producer: Producer,
}

impl ClientSession {
    pub fn new(filter: FilterRuleManager, producer: Producer) -> Self {
        Self { filter, producer }
    }

    pub fn filter(&self) -> &FilterRuleManager {
        &self.filter
    }

    /// Route `token` into the session's lane, then send `count` messages.
    ///
    /// Records `token` as the config's last routing token.
    pub async fn run_iteration(
        &mut self,
        config: &mut TopicConfig,
        token: &str,
        count: usize,
    ) -> Result<IterationReport, SessionError> {
        let filter = self.filter.rotate_filter(config, token).await?;
        config.last_routing_token = Some(token.to_string());

        let rule = filter.installed.then_some(filter.rule_name.as_str());
        let produced = self.producer.send(config, token, rule, count).await?;
        Ok(IterationReport {
            token: token.to_string(),
            filter,
            produced,
        })
    }

    /// Run `total_iterations` iterations, each with a fresh token and lane.
    pub async fn run_iterations(
        &mut self,
        config: &mut TopicConfig,
        settings: &ProducerConfig,
    ) -> Result<Vec<IterationReport>, SessionError> {
        let mut reports = Vec::with_capacity(settings.total_iterations);
        for iteration in 1..=settings.total_iterations {
            let token = Uuid::new_v4().to_string();
            self.filter.start_new_session();
            let report = self
                .run_iteration(config, &token, settings.messages_per_iteration)
                .await?;
            info!(
                iteration,
                token = %token,
                subscription = %report.filter.subscription,
                sent = report.produced.sent.len(),
                "Client iteration complete"
            );
            reports.push(report);
        }
        Ok(reports)
    }
}
