mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{sim_gateway, SimModem};
use smsgate::config::SchedulerSettings;
use smsgate::dispatch::EventDispatcher;
use smsgate::scheduler::{MessageScheduler, SchedulerEvent};
use smsgate::storage::{
    Contact, DeliveryStatus, MemoryStore, Message, MessageStatus, MessageStore,
};

/// Poll until `check` holds, failing after three seconds.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(3), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn scheduled_campaign_is_sent_and_tracked() {
    let store = Arc::new(MemoryStore::new());
    store.insert_contact(Contact::new(1, 1, "Ada", "+15551230001")).await;
    store.insert_contact(Contact::new(2, 1, "Bob", "+15551230002")).await;
    store
        .insert_message(Message::scheduled(
            1,
            "Launch",
            "Hi {name}, reply STOP to opt out",
            1,
            Utc::now() + chrono::Duration::milliseconds(50),
        ))
        .await;

    let sim = SimModem::new();
    let (gateway, events, _) = sim_gateway(&sim, 10);
    let _dispatcher = EventDispatcher::new(store.clone()).spawn(events);
    assert!(gateway.connect().await);

    let (scheduler, mut scheduler_events) = MessageScheduler::new(
        store.clone(),
        Arc::new(gateway.clone()),
        SchedulerSettings::default(),
    );
    scheduler.start();
    let executed = tokio::time::timeout(Duration::from_secs(2), scheduler_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        executed,
        SchedulerEvent::Executed {
            message_id: 1,
            recipients: 2
        }
    );

    let s = store.clone();
    eventually(move || {
        let s = s.clone();
        async move {
            let m = s.message(1).await.unwrap().unwrap();
            m.status == MessageStatus::Completed && m.sent_count == 2
        }
    })
    .await;

    let bodies: Vec<String> = sim.bodies().into_iter().map(|(b, _)| b).collect();
    assert_eq!(
        bodies,
        vec![
            "Hi Ada, reply STOP to opt out",
            "Hi Bob, reply STOP to opt out"
        ]
    );
    let deliveries = store.deliveries_for(1).await;
    assert!(deliveries
        .iter()
        .all(|d| d.status == DeliveryStatus::Sent && d.sent_at.is_some()));

    // Carrier confirms the first one
    sim.status_report(20, 1, "+15551230001", 0);
    let s = store.clone();
    let first = deliveries[0].id;
    eventually(move || {
        let s = s.clone();
        async move {
            s.delivery(first).await.unwrap().unwrap().status == DeliveryStatus::Delivered
        }
    })
    .await;
    assert_eq!(store.message(1).await.unwrap().unwrap().delivered_count, 1);

    // Bob opts out
    sim.receive_sms(21, "+15551230002", "stop");
    let s = store.clone();
    eventually(move || {
        let s = s.clone();
        async move { s.contact(2).await.unwrap().blacklisted }
    })
    .await;
    let remaining = store.opted_in_contacts(1).await.unwrap();
    assert_eq!(remaining.len(), 1);

    scheduler.stop();
    gateway.disconnect();
}
