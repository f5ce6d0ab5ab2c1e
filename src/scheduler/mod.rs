//! # Scheduler - Timed Campaign Execution
//!
//! Campaigns in `scheduled` status are turned into per-recipient submissions to
//! the outbound queue when they come due.
//!
//! The job table maps a message id to its due time and armed timer. Timers are
//! only armed inside a bounded look-ahead window; a periodic reconciliation
//! pass brings far-future campaigns into the window as time passes, and
//! rebuilds the table from storage after a restart.
//!
//! Duplicate ids: an explicit [`MessageScheduler::schedule_message`] replaces
//! any armed timer for the id, while reconciliation never touches an id that is
//! already armed. An id that is currently executing is never started twice.
//!
//! Cancellation is recorded in memory at once and persisted as the
//! `cancelled` status, so a later reconciliation pass cannot re-arm the job
//! from storage.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use smsgate::config::SchedulerSettings;
//! # use smsgate::gateway::SmsGateway;
//! # use smsgate::scheduler::MessageScheduler;
//! # use smsgate::storage::MemoryStore;
//! # fn demo(gateway: SmsGateway) {
//! let store = Arc::new(MemoryStore::new());
//! let (scheduler, _events) =
//!     MessageScheduler::new(store, Arc::new(gateway), SchedulerSettings::default());
//! scheduler.start();
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::SchedulerSettings;
use crate::gateway::{OutboundSink, QueuedMessage};
use crate::metrics;
use crate::storage::{
    Contact, MessageId, MessageStatus, MessageStore, MessageUpdate, NewDelivery, StoreError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// The campaign was expanded and every recipient submitted.
    Executed { message_id: MessageId, recipients: usize },
    /// The campaign was no longer in `scheduled` status when it came due.
    Skipped { message_id: MessageId },
    Failed { message_id: MessageId, error: String },
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("message {0} has no target contact list")]
    NoTargetList(MessageId),
}

struct JobEntry {
    due: DateTime<Utc>,
    timer: JoinHandle<()>,
    /// Distinguishes a replaced timer from the current one.
    generation: u64,
}

struct SchedulerInner {
    store: Arc<dyn MessageStore>,
    sink: Arc<dyn OutboundSink>,
    settings: SchedulerSettings,
    jobs: Mutex<HashMap<MessageId, JobEntry>>,
    executing: Mutex<HashSet<MessageId>>,
    /// Cancelled ids that storage may still list as scheduled.
    cancelled: Mutex<HashSet<MessageId>>,
    generations: AtomicU64,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

fn locked<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn personalize(template: &str, contact: &Contact) -> String {
    template.replace("{name}", &contact.name)
}

#[derive(Clone)]
pub struct MessageScheduler {
    inner: Arc<SchedulerInner>,
}

impl MessageScheduler {
    pub fn new(
        store: Arc<dyn MessageStore>,
        sink: Arc<dyn OutboundSink>,
        settings: SchedulerSettings,
    ) -> (Self, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SchedulerInner {
            store,
            sink,
            settings,
            jobs: Mutex::new(HashMap::new()),
            executing: Mutex::new(HashSet::new()),
            cancelled: Mutex::new(HashSet::new()),
            generations: AtomicU64::new(0),
            events: tx,
            reconciler: Mutex::new(None),
        });
        (Self { inner }, rx)
    }

    /// Run one reconciliation now and then every configured interval.
    pub fn start(&self) {
        let mut slot = locked(&self.inner.reconciler);
        if slot.is_some() {
            return;
        }
        let every = self.inner.settings.reconcile_interval();
        info!(
            "Message scheduler started (reconcile every {}s, look-ahead {}h)",
            every.as_secs(),
            self.inner.settings.lookahead().num_hours()
        );
        *slot = Some(tokio::spawn(reconcile_loop(Arc::downgrade(&self.inner), every)));
    }

    /// Stop reconciling and drop every armed timer. Jobs already executing finish.
    pub fn stop(&self) {
        if let Some(handle) = locked(&self.inner.reconciler).take() {
            handle.abort();
        }
        let mut jobs = locked(&self.inner.jobs);
        for (_, job) in jobs.drain() {
            job.timer.abort();
        }
        info!("Message scheduler stopped");
    }

    /// Number of armed timers.
    pub fn job_count(&self) -> usize {
        locked(&self.inner.jobs).len()
    }

    /// Due time of the armed timer for `id`, if any.
    pub fn due_time(&self, id: MessageId) -> Option<DateTime<Utc>> {
        locked(&self.inner.jobs).get(&id).map(|j| j.due)
    }

    /// Execute now if `at` has passed, otherwise arm a timer for it,
    /// replacing any timer already armed for `id`.
    pub fn schedule_message(&self, id: MessageId, at: DateTime<Utc>) {
        locked(&self.inner.cancelled).remove(&id);
        if at <= Utc::now() {
            if let Some(old) = locked(&self.inner.jobs).remove(&id) {
                old.timer.abort();
            }
            debug!("Message {} already due, executing now", id);
            self.inner.launch(id);
        } else {
            self.inner.arm(id, at, true);
        }
    }

    /// Disarm the timer for `id` and mark the campaign cancelled. False when
    /// nothing was armed; a job that has already fired is not affected.
    pub fn cancel_scheduled_message(&self, id: MessageId) -> bool {
        let Some(job) = locked(&self.inner.jobs).remove(&id) else {
            return false;
        };
        job.timer.abort();
        locked(&self.inner.cancelled).insert(id);
        info!("Cancelled scheduled message {}", id);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(persist_cancellation(self.inner.clone(), id));
        }
        true
    }

    /// One reconciliation pass. Returns how many jobs were armed or started.
    pub async fn reconcile(&self) -> Result<usize, SchedulerError> {
        self.inner.reconcile().await
    }
}

impl SchedulerInner {
    fn emit(&self, event: SchedulerEvent) {
        let _ = self.events.send(event);
    }

    fn is_known(&self, id: MessageId) -> bool {
        locked(&self.jobs).contains_key(&id)
            || locked(&self.executing).contains(&id)
            || locked(&self.cancelled).contains(&id)
    }

    /// Arm a timer. With `replace` false an existing entry wins.
    fn arm(self: &Arc<Self>, id: MessageId, due: DateTime<Utc>, replace: bool) -> bool {
        let mut jobs = locked(&self.jobs);
        if !replace && jobs.contains_key(&id) {
            return false;
        }
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let delay = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let timer = tokio::spawn(fire_after(self.clone(), id, generation, delay));
        if let Some(old) = jobs.insert(id, JobEntry { due, timer, generation }) {
            old.timer.abort();
            debug!("Re-armed message {} for {}", id, due);
        } else {
            debug!("Armed message {} for {}", id, due);
        }
        true
    }

    /// Claim `id` for execution and run it on its own task.
    fn launch(self: &Arc<Self>, id: MessageId) -> bool {
        if !locked(&self.executing).insert(id) {
            debug!("Message {} is already executing", id);
            return false;
        }
        let inner = self.clone();
        tokio::spawn(async move {
            inner.execute(id).await;
            locked(&inner.executing).remove(&id);
        });
        true
    }

    async fn execute(&self, id: MessageId) {
        match self.expand_and_submit(id).await {
            Ok(Some(recipients)) => {
                metrics::inc_scheduled_executed();
                info!("Scheduled message {} submitted to {} recipient(s)", id, recipients);
                self.emit(SchedulerEvent::Executed {
                    message_id: id,
                    recipients,
                });
            }
            Ok(None) => {
                debug!("Scheduled message {} no longer scheduled, skipping", id);
                self.emit(SchedulerEvent::Skipped { message_id: id });
            }
            Err(e) => {
                metrics::inc_scheduled_failed();
                error!("Scheduled message {} failed: {}", id, e);
                let update = MessageUpdate {
                    status: Some(MessageStatus::Failed),
                    completed_at: Some(Utc::now()),
                    ..MessageUpdate::default()
                };
                if let Err(e) = self.store.update_message(id, update).await {
                    warn!("Could not mark message {} failed: {}", id, e);
                }
                self.emit(SchedulerEvent::Failed {
                    message_id: id,
                    error: e.to_string(),
                });
            }
        }
    }

    /// `None` when the campaign is not (or no longer) scheduled.
    async fn expand_and_submit(&self, id: MessageId) -> Result<Option<usize>, SchedulerError> {
        let Some(message) = self.store.message(id).await? else {
            return Ok(None);
        };
        if message.status != MessageStatus::Scheduled {
            return Ok(None);
        }
        self.store
            .update_message(id, MessageUpdate::status(MessageStatus::Pending))
            .await?;

        let list_id = message.list_id.ok_or(SchedulerError::NoTargetList(id))?;
        let contacts = self.store.opted_in_contacts(list_id).await?;
        let mut deliveries = Vec::with_capacity(contacts.len());
        for contact in &contacts {
            let delivery = self
                .store
                .create_delivery(NewDelivery {
                    message_id: id,
                    contact_id: contact.id,
                    phone: contact.phone.clone(),
                    personalized_content: personalize(&message.content, contact),
                })
                .await?;
            deliveries.push(delivery);
        }

        let total = deliveries.len() as u32;
        let update = if deliveries.is_empty() {
            // Nothing will ever report back for an empty campaign
            MessageUpdate {
                status: Some(MessageStatus::Completed),
                total_recipients: Some(0),
                completed_at: Some(Utc::now()),
                ..MessageUpdate::default()
            }
        } else {
            MessageUpdate {
                status: Some(MessageStatus::Sending),
                total_recipients: Some(total),
                ..MessageUpdate::default()
            }
        };
        self.store.update_message(id, update).await?;

        for delivery in &deliveries {
            self.sink.submit(QueuedMessage::new(
                delivery.phone.clone(),
                delivery.personalized_content.clone(),
                delivery.id.to_string(),
            ));
        }
        Ok(Some(deliveries.len()))
    }

    async fn reconcile(self: &Arc<Self>) -> Result<usize, SchedulerError> {
        let messages = self.store.scheduled_messages().await?;
        // Forget cancellations storage has caught up with
        locked(&self.cancelled).retain(|id| messages.iter().any(|m| m.id == *id));
        let now = Utc::now();
        let horizon = now + self.settings.lookahead();
        let mut touched = 0;
        for message in messages {
            let Some(due) = message.scheduled_at else {
                continue;
            };
            if self.is_known(message.id) {
                continue;
            }
            if due <= now {
                if self.launch(message.id) {
                    touched += 1;
                }
            } else if due <= horizon {
                if self.arm(message.id, due, false) {
                    touched += 1;
                }
            } else {
                debug!("Message {} due {} is beyond the look-ahead window", message.id, due);
            }
        }
        Ok(touched)
    }
}

async fn fire_after(inner: Arc<SchedulerInner>, id: MessageId, generation: u64, delay: Duration) {
    tokio::time::sleep(delay).await;
    {
        let mut jobs = locked(&inner.jobs);
        // Replaced or cancelled while the timer was waking
        if !jobs.get(&id).is_some_and(|job| job.generation == generation) {
            return;
        }
        jobs.remove(&id);
    }
    inner.launch(id);
}

async fn persist_cancellation(inner: Arc<SchedulerInner>, id: MessageId) {
    let still_scheduled = match inner.store.message(id).await {
        Ok(Some(message)) => message.status == MessageStatus::Scheduled,
        Ok(None) => false,
        Err(e) => {
            warn!("Could not load cancelled message {}: {}", id, e);
            return;
        }
    };
    // Rescheduled again in the meantime
    if !still_scheduled || !locked(&inner.cancelled).contains(&id) {
        return;
    }
    if let Err(e) = inner
        .store
        .update_message(id, MessageUpdate::status(MessageStatus::Cancelled))
        .await
    {
        warn!("Could not mark message {} cancelled: {}", id, e);
    }
}

async fn reconcile_loop(inner: Weak<SchedulerInner>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match inner.reconcile().await {
            Ok(0) => {}
            Ok(n) => debug!("Reconciliation armed or started {} job(s)", n),
            Err(e) => error!("Scheduler reconciliation failed: {}", e),
        }
    }
}
