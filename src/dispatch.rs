//! Applies gateway events to storage.
//!
//! One dispatcher consumes the gateway's event channel. Outcomes are matched to
//! delivery records through the correlation id (the delivery record id); sends
//! with a correlation id that is not a delivery id, such as one-off CLI sends,
//! are only logged.
//!
//! Send attempts and carrier status reports share one event type, so a single
//! delivery can produce several outcomes. Campaign counters move according to
//! the delivery's previous status: a report that a sent message failed moves it
//! from `sent_count` to `failed_count`, and repeated outcomes count once.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::gateway::{DeliveryOutcome, GatewayEvent, Outcome};
use crate::storage::{
    DeliveryId, DeliveryStatus, DeliveryUpdate, MessageStatus, MessageStore, MessageUpdate,
    StoreError,
};

/// Counter movement caused by one delivery changing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tally {
    sent: i32,
    delivered: i32,
    failed: i32,
}

/// `None` when the outcome does not move the delivery forward: a repeat, or a
/// report for a delivery that already reached a final state.
fn tally(previous: DeliveryStatus, outcome: Outcome) -> Option<Tally> {
    let t = |sent, delivered, failed| {
        Some(Tally {
            sent,
            delivered,
            failed,
        })
    };
    match (previous, outcome) {
        (DeliveryStatus::Pending, Outcome::Sent) => t(1, 0, 0),
        (DeliveryStatus::Pending, Outcome::Failed) => t(0, 0, 1),
        // The report overtook the send outcome
        (DeliveryStatus::Pending, Outcome::Delivered) => t(1, 1, 0),
        (DeliveryStatus::Sent, Outcome::Delivered) => t(0, 1, 0),
        // The carrier gave up on a message the modem accepted
        (DeliveryStatus::Sent, Outcome::Failed) => t(-1, 0, 1),
        _ => None,
    }
}

pub struct EventDispatcher {
    store: Arc<dyn MessageStore>,
}

impl EventDispatcher {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Consume events until the gateway goes away.
    pub fn spawn(self, mut events: mpsc::UnboundedReceiver<GatewayEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(e) = self.handle(&event).await {
                    warn!("Failed to apply {:?}: {}", event, e);
                }
            }
            debug!("Gateway event channel closed, dispatcher exiting");
        })
    }

    pub async fn handle(&self, event: &GatewayEvent) -> Result<(), StoreError> {
        match event {
            GatewayEvent::Connected => {
                info!("Gateway connected");
                Ok(())
            }
            GatewayEvent::Disconnected { reason } => {
                warn!(
                    "Gateway disconnected{}",
                    reason.as_deref().map(|r| format!(": {}", r)).unwrap_or_default()
                );
                Ok(())
            }
            GatewayEvent::MessageProcessed(outcome) => self.apply_outcome(outcome).await,
            GatewayEvent::OptOut { phone } => {
                let touched = self.store.blacklist_by_phone(phone).await?;
                if touched.is_empty() {
                    info!("Opt-out from {} matches no contact", phone);
                } else {
                    info!("Opt-out from {}: blacklisted contact(s) {:?}", phone, touched);
                }
                Ok(())
            }
        }
    }

    async fn apply_outcome(&self, outcome: &DeliveryOutcome) -> Result<(), StoreError> {
        let Some(id) = outcome
            .correlation_id
            .as_deref()
            .and_then(|c| c.parse::<DeliveryId>().ok())
        else {
            debug!(
                "{:?} for {} has no delivery record ({:?})",
                outcome.outcome, outcome.phone, outcome.correlation_id
            );
            return Ok(());
        };
        let Some(delivery) = self.store.delivery(id).await? else {
            debug!("Delivery {} not found, ignoring {:?}", id, outcome.outcome);
            return Ok(());
        };

        let Some(tally) = tally(delivery.status, outcome.outcome) else {
            debug!(
                "Delivery {} already {:?}, ignoring {:?}",
                id, delivery.status, outcome.outcome
            );
            return Ok(());
        };

        let now = Utc::now();
        let update = match outcome.outcome {
            Outcome::Sent => DeliveryUpdate {
                status: Some(DeliveryStatus::Sent),
                sent_at: Some(now),
                ..DeliveryUpdate::default()
            },
            Outcome::Delivered => DeliveryUpdate {
                status: Some(DeliveryStatus::Delivered),
                sent_at: delivery.sent_at.is_none().then_some(now),
                delivered_at: Some(now),
                ..DeliveryUpdate::default()
            },
            Outcome::Failed => DeliveryUpdate {
                status: Some(DeliveryStatus::Failed),
                failure_reason: outcome.error.clone(),
                ..DeliveryUpdate::default()
            },
        };
        self.store.update_delivery(id, update).await?;

        let Some(message) = self.store.message(delivery.message_id).await? else {
            return Ok(());
        };
        let sent = message.sent_count.saturating_add_signed(tally.sent);
        let delivered = message.delivered_count.saturating_add_signed(tally.delivered);
        let failed = message.failed_count.saturating_add_signed(tally.failed);
        let complete = sent + failed >= message.total_recipients;
        let newly_complete = complete && message.status != MessageStatus::Completed;
        self.store
            .update_message(
                message.id,
                MessageUpdate {
                    status: Some(if complete {
                        MessageStatus::Completed
                    } else {
                        MessageStatus::Sending
                    }),
                    sent_count: Some(sent),
                    delivered_count: Some(delivered),
                    failed_count: Some(failed),
                    completed_at: newly_complete.then_some(now),
                    ..MessageUpdate::default()
                },
            )
            .await?;
        if newly_complete {
            info!(
                "Campaign {} ({}) completed: {} sent, {} failed",
                message.id, message.campaign_name, sent, failed
            );
        }
        Ok(())
    }
}
