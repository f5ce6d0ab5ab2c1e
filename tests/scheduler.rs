use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use smsgate::config::SchedulerSettings;
use smsgate::gateway::{OutboundSink, QueuedMessage};
use smsgate::scheduler::{MessageScheduler, SchedulerEvent};
use smsgate::storage::{Contact, MemoryStore, Message, MessageStatus, MessageStore};
use tokio::sync::mpsc;

#[derive(Default)]
struct RecordingSink {
    submitted: Mutex<Vec<QueuedMessage>>,
}

impl RecordingSink {
    fn taken(&self) -> Vec<QueuedMessage> {
        self.submitted.lock().unwrap().clone()
    }
}

impl OutboundSink for RecordingSink {
    fn submit(&self, msg: QueuedMessage) {
        self.submitted.lock().unwrap().push(msg);
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    sink: Arc<RecordingSink>,
    scheduler: MessageScheduler,
    events: mpsc::UnboundedReceiver<SchedulerEvent>,
}

async fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    store.insert_contact(Contact::new(1, 1, "Ada", "+15551230001")).await;
    store.insert_contact(Contact::new(2, 1, "Bob", "+15551230002")).await;
    store
        .insert_contact(Contact {
            opted_in: false,
            ..Contact::new(3, 1, "Cy", "+15551230003")
        })
        .await;
    let sink = Arc::new(RecordingSink::default());
    let (scheduler, events) =
        MessageScheduler::new(store.clone(), sink.clone(), SchedulerSettings::default());
    Fixture {
        store,
        sink,
        scheduler,
        events,
    }
}

async fn campaign(store: &MemoryStore, id: u64, in_ms: i64) {
    store
        .insert_message(Message::scheduled(
            id,
            format!("Campaign {id}"),
            "Hi {name}!",
            1,
            Utc::now() + chrono::Duration::milliseconds(in_ms),
        ))
        .await;
}

async fn next(events: &mut mpsc::UnboundedReceiver<SchedulerEvent>) -> SchedulerEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for scheduler event")
        .expect("scheduler event channel closed")
}

#[tokio::test]
async fn cancel_unknown_id_is_a_no_op() {
    let f = fixture().await;
    assert!(!f.scheduler.cancel_scheduled_message(42));
    assert_eq!(f.scheduler.job_count(), 0);
}

#[tokio::test]
async fn cancelled_job_never_fires() {
    let mut f = fixture().await;
    campaign(&f.store, 1, 100).await;
    f.scheduler
        .schedule_message(1, Utc::now() + chrono::Duration::milliseconds(100));
    assert_eq!(f.scheduler.job_count(), 1);

    assert!(f.scheduler.cancel_scheduled_message(1));
    assert!(!f.scheduler.cancel_scheduled_message(1));
    assert_eq!(f.scheduler.job_count(), 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(f.events.try_recv().is_err());
    assert!(f.sink.taken().is_empty());
    let m = f.store.message(1).await.unwrap().unwrap();
    assert_eq!(m.status, MessageStatus::Cancelled);
}

#[tokio::test]
async fn cancellation_survives_reconciliation() {
    let mut f = fixture().await;
    campaign(&f.store, 1, 150).await;
    f.scheduler
        .schedule_message(1, Utc::now() + chrono::Duration::milliseconds(150));
    assert!(f.scheduler.cancel_scheduled_message(1));

    // May run before the cancelled status reaches storage
    assert_eq!(f.scheduler.reconcile().await.unwrap(), 0);
    assert_eq!(f.scheduler.job_count(), 0);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(f.scheduler.reconcile().await.unwrap(), 0);
    assert!(f.events.try_recv().is_err());
    assert!(f.sink.taken().is_empty());
    let m = f.store.message(1).await.unwrap().unwrap();
    assert_eq!(m.status, MessageStatus::Cancelled);
    assert!(f.store.deliveries_for(1).await.is_empty());
}

#[tokio::test]
async fn near_due_job_fires_without_reconciliation() {
    let mut f = fixture().await;
    campaign(&f.store, 1, 50).await;
    f.scheduler
        .schedule_message(1, Utc::now() + chrono::Duration::milliseconds(50));

    assert_eq!(
        next(&mut f.events).await,
        SchedulerEvent::Executed {
            message_id: 1,
            recipients: 2
        }
    );
    assert_eq!(f.scheduler.job_count(), 0);

    let m = f.store.message(1).await.unwrap().unwrap();
    assert_eq!(m.status, MessageStatus::Sending);
    assert_eq!(m.total_recipients, 2);

    let deliveries = f.store.deliveries_for(1).await;
    let submitted = f.sink.taken();
    assert_eq!(submitted.len(), 2);
    assert_eq!(submitted[0].body, "Hi Ada!");
    assert_eq!(submitted[1].body, "Hi Bob!");
    for (queued, delivery) in submitted.iter().zip(&deliveries) {
        assert_eq!(queued.correlation_id, delivery.id.to_string());
        assert_eq!(queued.phone, delivery.phone);
    }
}

#[tokio::test]
async fn rescheduling_replaces_the_timer() {
    let mut f = fixture().await;
    campaign(&f.store, 1, 100).await;
    f.scheduler
        .schedule_message(1, Utc::now() + chrono::Duration::milliseconds(80));
    let later = Utc::now() + chrono::Duration::milliseconds(150);
    f.scheduler.schedule_message(1, later);
    assert_eq!(f.scheduler.job_count(), 1);
    assert_eq!(f.scheduler.due_time(1), Some(later));

    assert!(matches!(
        next(&mut f.events).await,
        SchedulerEvent::Executed { message_id: 1, .. }
    ));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(f.events.try_recv().is_err());
    assert_eq!(f.sink.taken().len(), 2);
}

#[tokio::test]
async fn overdue_schedule_executes_immediately() {
    let mut f = fixture().await;
    campaign(&f.store, 1, -1000).await;
    f.scheduler
        .schedule_message(1, Utc::now() - chrono::Duration::seconds(1));
    assert_eq!(f.scheduler.job_count(), 0);
    assert!(matches!(
        next(&mut f.events).await,
        SchedulerEvent::Executed { message_id: 1, .. }
    ));
}

#[tokio::test]
async fn recipients_are_resolved_at_fire_time() {
    let mut f = fixture().await;
    campaign(&f.store, 1, 100).await;
    f.scheduler
        .schedule_message(1, Utc::now() + chrono::Duration::milliseconds(100));
    f.store.blacklist_by_phone("+15551230002").await.unwrap();

    assert_eq!(
        next(&mut f.events).await,
        SchedulerEvent::Executed {
            message_id: 1,
            recipients: 1
        }
    );
    assert_eq!(f.sink.taken()[0].phone, "+15551230001");
}

#[tokio::test]
async fn job_no_longer_scheduled_is_skipped() {
    let mut f = fixture().await;
    campaign(&f.store, 1, 50).await;
    f.scheduler
        .schedule_message(1, Utc::now() + chrono::Duration::milliseconds(50));
    f.store
        .update_message(
            1,
            smsgate::storage::MessageUpdate::status(MessageStatus::Completed),
        )
        .await
        .unwrap();
    assert_eq!(
        next(&mut f.events).await,
        SchedulerEvent::Skipped { message_id: 1 }
    );
    assert!(f.sink.taken().is_empty());
}

#[tokio::test]
async fn expansion_failure_marks_message_failed() {
    let mut f = fixture().await;
    let mut message = Message::scheduled(9, "No list", "Hi", 1, Utc::now());
    message.list_id = None;
    f.store.insert_message(message).await;
    f.scheduler.schedule_message(9, Utc::now());

    match next(&mut f.events).await {
        SchedulerEvent::Failed { message_id, error } => {
            assert_eq!(message_id, 9);
            assert!(error.contains("no target contact list"));
        }
        other => panic!("unexpected {other:?}"),
    }
    let m = f.store.message(9).await.unwrap().unwrap();
    assert_eq!(m.status, MessageStatus::Failed);
    assert!(m.completed_at.is_some());
    assert_eq!(f.scheduler.job_count(), 0);
}

#[tokio::test]
async fn empty_list_completes_immediately() {
    let mut f = fixture().await;
    f.store
        .insert_message(Message::scheduled(5, "Nobody", "Hi", 77, Utc::now()))
        .await;
    f.scheduler.schedule_message(5, Utc::now());
    assert_eq!(
        next(&mut f.events).await,
        SchedulerEvent::Executed {
            message_id: 5,
            recipients: 0
        }
    );
    let m = f.store.message(5).await.unwrap().unwrap();
    assert_eq!(m.status, MessageStatus::Completed);
}

#[tokio::test]
async fn reconciliation_arms_only_inside_the_window() {
    let mut f = fixture().await;
    campaign(&f.store, 1, -5_000).await;
    campaign(&f.store, 2, 3_600_000).await;
    campaign(&f.store, 3, 48 * 3_600_000).await;

    assert_eq!(f.scheduler.reconcile().await.unwrap(), 2);
    assert!(matches!(
        next(&mut f.events).await,
        SchedulerEvent::Executed { message_id: 1, .. }
    ));
    assert_eq!(f.scheduler.job_count(), 1);
    assert!(f.scheduler.due_time(2).is_some());
    assert!(f.scheduler.due_time(3).is_none());

    // An armed job is left alone by later passes
    let armed = f.scheduler.due_time(2);
    assert_eq!(f.scheduler.reconcile().await.unwrap(), 0);
    assert_eq!(f.scheduler.due_time(2), armed);

    // An explicit schedule call replaces it
    let moved = Utc::now() + chrono::Duration::hours(2);
    f.scheduler.schedule_message(2, moved);
    assert_eq!(f.scheduler.due_time(2), Some(moved));
    assert_eq!(f.scheduler.job_count(), 1);
}

#[tokio::test]
async fn start_reconciles_immediately_and_stop_clears_timers() {
    let mut f = fixture().await;
    campaign(&f.store, 1, -1_000).await;
    campaign(&f.store, 2, 600_000).await;

    f.scheduler.start();
    assert!(matches!(
        next(&mut f.events).await,
        SchedulerEvent::Executed { message_id: 1, .. }
    ));
    assert_eq!(f.scheduler.job_count(), 1);

    f.scheduler.stop();
    assert_eq!(f.scheduler.job_count(), 0);
    let m = f.store.message(2).await.unwrap().unwrap();
    assert_eq!(m.status, MessageStatus::Scheduled);
}
