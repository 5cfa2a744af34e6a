//! Full deposit flow over the in-memory broker and account store.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tgbank_core::broker::{BrokerClient, MemoryBroker, SubscribeOptions, SupervisorConfig};
use tgbank_core::entities::{NewUser, User};
use tgbank_core::pipeline::{
    DEPOSIT_QUEUE, DepositConsumer, DepositPublisher, Ingress, Notifier, NotifyError,
    declare_deposit_topology, spawn_deposit_consumer,
};
use tgbank_core::session::{MemorySessionSource, MemoryStore, RetryPolicy, SessionMiddleware};
use tgbank_sdk::objects::GatewayEvent;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<(String, String)>>,
}

impl Outbox {
    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for Outbox {
    async fn notify(&self, user_handle: &str, text: &str) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .unwrap()
            .push((user_handle.to_string(), text.to_string()));
        Ok(())
    }
}

struct Harness {
    broker: MemoryBroker,
    store: MemoryStore,
    source: Arc<MemorySessionSource>,
    publisher: DepositPublisher,
    outbox: Arc<Outbox>,
    user: User,
    shutdown_tx: watch::Sender<bool>,
    consumers: Vec<JoinHandle<()>>,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(SupervisorConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            ..SupervisorConfig::default()
        })
        .await
    }

    async fn start_with(supervisor: SupervisorConfig) -> Self {
        let broker = MemoryBroker::new();
        let client = Arc::new(BrokerClient::new(broker.clone()));
        let topology = declare_deposit_topology(&client).await.unwrap();

        let store = MemoryStore::default();
        let user = store.register(
            NewUser {
                first_name: Some("Chidi".to_string()),
                last_name: Some("Okafor".to_string()),
                email: "chidi@example.com".to_string(),
                phone_number: "+2348011111111".to_string(),
                telegram_id: 1001,
                chat_id: "1001".to_string(),
                customer_code: Some("CUS_123".to_string()),
            },
            Decimal::from_str("100.00").unwrap(),
        );
        let source = Arc::new(MemorySessionSource::new(store.clone()));
        let middleware = Arc::new(SessionMiddleware::new(
            source.clone(),
            RetryPolicy {
                base_delay: Duration::from_millis(5),
                ..RetryPolicy::default()
            },
        ));
        let outbox = Arc::new(Outbox::default());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumers = spawn_deposit_consumer(
            &client,
            &topology,
            DepositConsumer::new(middleware, outbox.clone()),
            SubscribeOptions {
                prefetch: 1,
                supervisor,
                ..SubscribeOptions::default()
            },
            shutdown_rx,
        );

        Self {
            broker,
            store,
            source,
            publisher: DepositPublisher::new(client),
            outbox,
            user,
            shutdown_tx,
            consumers,
        }
    }

    fn balance(&self) -> Decimal {
        self.store.user(self.user.id).unwrap().balance
    }

    async fn deliver(&self, amount_minor: i64, reference: &str) -> Ingress {
        let body = format!(
            r#"{{"event":"charge.success","data":{{"channel":"dedicated_nuban","amount":{amount_minor},
                "reference":"{reference}","customer":{{"customer_code":"CUS_123"}}}}}}"#
        );
        let event = GatewayEvent::from_slice(body.as_bytes()).unwrap();
        self.publisher.ingest(&event).await.unwrap()
    }

    async fn settled(&self) {
        wait_until(|| {
            self.broker.queue_len(DEPOSIT_QUEUE) == Some(0)
                && self.broker.unacked_len(DEPOSIT_QUEUE) == Some(0)
        })
        .await;
    }

    async fn stop(self) {
        self.shutdown_tx.send(true).unwrap();
        for consumer in self.consumers {
            tokio::time::timeout(Duration::from_secs(5), consumer)
                .await
                .unwrap()
                .unwrap();
        }
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn deposit_credits_balance_and_notifies_once() {
    let harness = Harness::start().await;

    let ingress = harness.deliver(5000, "T100").await;
    assert!(matches!(ingress, Ingress::Published(_)));

    wait_until(|| harness.outbox.count() == 1).await;
    harness.settled().await;

    assert_eq!(harness.balance(), Decimal::from_str("150.00").unwrap());
    let sent = harness.outbox.sent.lock().unwrap().clone();
    assert_eq!(sent[0].0, "1001");
    assert!(sent[0].1.contains("₦50.00"));
    assert!(sent[0].1.contains("₦150.00"));

    harness.stop().await;
}

#[tokio::test]
async fn repeated_reference_is_not_credited_twice() {
    let harness = Harness::start().await;

    harness.deliver(5000, "T200").await;
    harness.deliver(5000, "T200").await;
    harness.deliver(2550, "T201").await;

    wait_until(|| harness.store.applied_deposits().len() == 2).await;
    harness.settled().await;

    assert_eq!(harness.balance(), Decimal::from_str("175.50").unwrap());
    assert_eq!(harness.outbox.count(), 2);

    harness.stop().await;
}

#[tokio::test]
async fn store_outage_is_retried_through_redelivery() {
    let harness = Harness::start().await;
    // exhaust the first delivery's attempts, then recover
    harness.source.fail_next(3);

    harness.deliver(5000, "T300").await;

    wait_until(|| harness.outbox.count() == 1).await;
    harness.settled().await;

    assert_eq!(harness.balance(), Decimal::from_str("150.00").unwrap());
    assert!(harness.source.acquisitions() >= 4);
    assert_eq!(harness.source.recoveries(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn consumer_resumes_after_broker_connection_loss() {
    let harness = Harness::start().await;

    harness.deliver(1000, "T400").await;
    wait_until(|| harness.outbox.count() == 1).await;

    harness.broker.simulate_connection_loss();
    // the publisher reconnects, the supervised consumer restarts
    harness.deliver(2000, "T401").await;

    wait_until(|| harness.outbox.count() == 2).await;
    harness.settled().await;
    assert_eq!(harness.balance(), Decimal::from_str("130.00").unwrap());

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn consumer_survives_outage_longer_than_restart_window() {
    let harness = Harness::start_with(SupervisorConfig::default()).await;

    harness.broker.set_reachable(false);
    tokio::time::sleep(Duration::from_secs(45)).await;
    harness.broker.set_reachable(true);
    harness.deliver(5000, "R1").await;

    // throttled restarts come at most one backoff ceiling apart
    tokio::time::sleep(Duration::from_secs(120)).await;
    harness.settled().await;

    assert!(harness.consumers.iter().all(|consumer| !consumer.is_finished()));
    assert_eq!(harness.balance(), Decimal::from_str("150.00").unwrap());
    assert_eq!(harness.outbox.count(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn unknown_customer_is_dropped_and_consumer_keeps_running() {
    let harness = Harness::start().await;

    let body = br#"{"event":"charge.success","data":{"channel":"dedicated_nuban","amount":900,
        "reference":"T500","customer":{"customer_code":"CUS_UNKNOWN"}}}"#;
    harness
        .publisher
        .ingest(&GatewayEvent::from_slice(body).unwrap())
        .await
        .unwrap();
    harness.deliver(1000, "T501").await;

    wait_until(|| harness.outbox.count() == 1).await;
    harness.settled().await;
    assert_eq!(harness.balance(), Decimal::from_str("110.00").unwrap());

    harness.stop().await;
}
