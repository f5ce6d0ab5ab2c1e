//! # Storage Module - Campaign Persistence Interface
//!
//! The gateway core never owns campaign data. It reads and updates it through
//! the [`MessageStore`] trait, which a persistence collaborator implements.
//! [`MemoryStore`] is the in-process implementation used by the binary and
//! the test suite; it can be seeded from a JSON file.
//!
//! ## Data Structures
//!
//! - [`Message`] - a campaign: template content, target list, counters, status
//! - [`Contact`] - a recipient with consent and blacklist flags
//! - [`Delivery`] - one personalised send of a campaign to one contact
//!
//! ## Seed format
//!
//! ```json
//! {
//!   "contacts": [
//!     { "id": 1, "list_id": 1, "name": "Ada", "phone": "+15551230001" }
//!   ],
//!   "messages": [
//!     { "id": 1, "campaign_name": "Launch", "content": "Hi {name}!",
//!       "list_id": 1, "status": "scheduled", "scheduled_at": "2026-01-01T09:00:00Z" }
//!   ]
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

pub type MessageId = u64;
pub type ContactId = u64;
pub type ListId = u64;
pub type DeliveryId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Scheduled,
    Sending,
    Completed,
    Failed,
    /// Withdrawn before its due time; never fires.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub campaign_name: String,
    /// Template; `{name}` is replaced per recipient.
    pub content: String,
    pub list_id: Option<ListId>,
    #[serde(default)]
    pub total_recipients: u32,
    #[serde(default)]
    pub sent_count: u32,
    #[serde(default)]
    pub delivered_count: u32,
    #[serde(default)]
    pub failed_count: u32,
    pub status: MessageStatus,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Message {
    /// A campaign waiting for `at`.
    pub fn scheduled(
        id: MessageId,
        campaign_name: impl Into<String>,
        content: impl Into<String>,
        list_id: ListId,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            campaign_name: campaign_name.into(),
            content: content.into(),
            list_id: Some(list_id),
            total_recipients: 0,
            sent_count: 0,
            delivered_count: 0,
            failed_count: 0,
            status: MessageStatus::Scheduled,
            scheduled_at: Some(at),
            completed_at: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub list_id: ListId,
    pub name: String,
    pub phone: String,
    #[serde(default = "default_true")]
    pub opted_in: bool,
    #[serde(default)]
    pub blacklisted: bool,
}

impl Contact {
    pub fn new(id: ContactId, list_id: ListId, name: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            id,
            list_id,
            name: name.into(),
            phone: phone.into(),
            opted_in: true,
            blacklisted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: DeliveryId,
    pub message_id: MessageId,
    pub contact_id: ContactId,
    pub phone: String,
    pub personalized_content: String,
    pub status: DeliveryStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDelivery {
    pub message_id: MessageId,
    pub contact_id: ContactId,
    pub phone: String,
    pub personalized_content: String,
}

/// Partial update of a [`Message`]; `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageUpdate {
    pub status: Option<MessageStatus>,
    pub total_recipients: Option<u32>,
    pub sent_count: Option<u32>,
    pub delivered_count: Option<u32>,
    pub failed_count: Option<u32>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl MessageUpdate {
    pub fn status(status: MessageStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryUpdate {
    pub status: Option<DeliveryStatus>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },
    #[error("storage backend failure: {0}")]
    Backend(String),
    #[error("failed to read seed file: {0}")]
    SeedIo(#[from] std::io::Error),
    #[error("invalid seed file: {0}")]
    SeedFormat(#[from] serde_json::Error),
}

/// Method contracts the scheduler and dispatcher rely on.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Campaigns in `scheduled` status.
    async fn scheduled_messages(&self) -> Result<Vec<Message>, StoreError>;
    async fn message(&self, id: MessageId) -> Result<Option<Message>, StoreError>;
    async fn update_message(&self, id: MessageId, update: MessageUpdate) -> Result<Message, StoreError>;
    /// Opted-in, non-blacklisted members of a list.
    async fn opted_in_contacts(&self, list_id: ListId) -> Result<Vec<Contact>, StoreError>;
    async fn create_delivery(&self, new: NewDelivery) -> Result<Delivery, StoreError>;
    async fn delivery(&self, id: DeliveryId) -> Result<Option<Delivery>, StoreError>;
    async fn update_delivery(&self, id: DeliveryId, update: DeliveryUpdate) -> Result<Delivery, StoreError>;
    /// Blacklist every contact whose phone matches; returns the ids touched.
    async fn blacklist_by_phone(&self, phone: &str) -> Result<Vec<ContactId>, StoreError>;
}

#[derive(Debug, Default, Deserialize)]
struct Seed {
    #[serde(default)]
    contacts: Vec<Contact>,
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Debug, Default)]
struct Tables {
    messages: HashMap<MessageId, Message>,
    contacts: HashMap<ContactId, Contact>,
    deliveries: HashMap<DeliveryId, Delivery>,
    next_delivery: DeliveryId,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load contacts and campaigns from a JSON seed file.
    pub async fn from_seed_file(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        let seed: Seed = serde_json::from_str(&raw)?;
        let store = Self::new();
        for c in seed.contacts {
            store.insert_contact(c).await;
        }
        for m in seed.messages {
            store.insert_message(m).await;
        }
        let t = store.tables.read().await;
        info!(
            "Loaded seed {}: {} contacts, {} messages",
            path.as_ref().display(),
            t.contacts.len(),
            t.messages.len()
        );
        drop(t);
        Ok(store)
    }

    pub async fn insert_message(&self, message: Message) {
        self.tables.write().await.messages.insert(message.id, message);
    }

    pub async fn insert_contact(&self, contact: Contact) {
        self.tables.write().await.contacts.insert(contact.id, contact);
    }

    pub async fn contact(&self, id: ContactId) -> Option<Contact> {
        self.tables.read().await.contacts.get(&id).cloned()
    }

    pub async fn deliveries_for(&self, message_id: MessageId) -> Vec<Delivery> {
        let mut found: Vec<Delivery> = self
            .tables
            .read()
            .await
            .deliveries
            .values()
            .filter(|d| d.message_id == message_id)
            .cloned()
            .collect();
        found.sort_by_key(|d| d.id);
        found
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn scheduled_messages(&self) -> Result<Vec<Message>, StoreError> {
        let mut found: Vec<Message> = self
            .tables
            .read()
            .await
            .messages
            .values()
            .filter(|m| m.status == MessageStatus::Scheduled)
            .cloned()
            .collect();
        found.sort_by_key(|m| m.id);
        Ok(found)
    }

    async fn message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        Ok(self.tables.read().await.messages.get(&id).cloned())
    }

    async fn update_message(&self, id: MessageId, update: MessageUpdate) -> Result<Message, StoreError> {
        let mut t = self.tables.write().await;
        let m = t
            .messages
            .get_mut(&id)
            .ok_or(StoreError::NotFound { kind: "message", id })?;
        if let Some(v) = update.status {
            m.status = v;
        }
        if let Some(v) = update.total_recipients {
            m.total_recipients = v;
        }
        if let Some(v) = update.sent_count {
            m.sent_count = v;
        }
        if let Some(v) = update.delivered_count {
            m.delivered_count = v;
        }
        if let Some(v) = update.failed_count {
            m.failed_count = v;
        }
        if update.completed_at.is_some() {
            m.completed_at = update.completed_at;
        }
        Ok(m.clone())
    }

    async fn opted_in_contacts(&self, list_id: ListId) -> Result<Vec<Contact>, StoreError> {
        let mut found: Vec<Contact> = self
            .tables
            .read()
            .await
            .contacts
            .values()
            .filter(|c| c.list_id == list_id && c.opted_in && !c.blacklisted)
            .cloned()
            .collect();
        found.sort_by_key(|c| c.id);
        Ok(found)
    }

    async fn create_delivery(&self, new: NewDelivery) -> Result<Delivery, StoreError> {
        let mut t = self.tables.write().await;
        t.next_delivery += 1;
        let delivery = Delivery {
            id: t.next_delivery,
            message_id: new.message_id,
            contact_id: new.contact_id,
            phone: new.phone,
            personalized_content: new.personalized_content,
            status: DeliveryStatus::Pending,
            sent_at: None,
            delivered_at: None,
            failure_reason: None,
        };
        t.deliveries.insert(delivery.id, delivery.clone());
        Ok(delivery)
    }

    async fn delivery(&self, id: DeliveryId) -> Result<Option<Delivery>, StoreError> {
        Ok(self.tables.read().await.deliveries.get(&id).cloned())
    }

    async fn update_delivery(&self, id: DeliveryId, update: DeliveryUpdate) -> Result<Delivery, StoreError> {
        let mut t = self.tables.write().await;
        let d = t
            .deliveries
            .get_mut(&id)
            .ok_or(StoreError::NotFound { kind: "delivery", id })?;
        if let Some(v) = update.status {
            d.status = v;
        }
        if update.sent_at.is_some() {
            d.sent_at = update.sent_at;
        }
        if update.delivered_at.is_some() {
            d.delivered_at = update.delivered_at;
        }
        if update.failure_reason.is_some() {
            d.failure_reason = update.failure_reason;
        }
        Ok(d.clone())
    }

    async fn blacklist_by_phone(&self, phone: &str) -> Result<Vec<ContactId>, StoreError> {
        let mut t = self.tables.write().await;
        let mut touched = Vec::new();
        for c in t.contacts.values_mut().filter(|c| c.phone == phone) {
            c.blacklisted = true;
            touched.push(c.id);
        }
        touched.sort_unstable();
        debug!("Blacklisted {} contact(s) for {}", touched.len(), phone);
        Ok(touched)
    }
}
