//! Broker-side handler that applies deposits and notifies users.

use super::DepositState;
use super::ledger::{ApplyDeposit, ApplyError, ApplyOutcome, LedgerSession};
use super::notify::{Notifier, deposit_notification_text};
use crate::broker::{Disposition, Envelope, MessageHandler};
use crate::entities::User;
use crate::session::{MiddlewareError, SessionMiddleware, SessionSource};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tgbank_sdk::objects::DepositMessage;
use tracing::{error, info, warn};

/// Applies one deposit per delivery.
///
/// Acknowledgement policy:
/// - undecodable body or non-positive amount: rejected without requeue
/// - unknown account: acknowledged, nothing to retry
/// - already applied reference: acknowledged, no second notification
/// - store unavailable or any other failure: requeued
/// - applied: notified best-effort, then acknowledged
pub struct DepositConsumer<P: SessionSource, N: Notifier> {
    middleware: Arc<SessionMiddleware<P>>,
    notifier: N,
    notify_timeout: Duration,
}

impl<P, N> DepositConsumer<P, N>
where
    P: SessionSource,
    P::Session: LedgerSession,
    N: Notifier,
{
    pub fn new(middleware: Arc<SessionMiddleware<P>>, notifier: N) -> Self {
        Self {
            middleware,
            notifier,
            notify_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout = timeout;
        self
    }

    async fn notify(&self, user: &User, amount: Decimal) {
        let text = deposit_notification_text(amount, user.balance);
        match tokio::time::timeout(self.notify_timeout, self.notifier.notify(&user.chat_id, &text)).await {
            Ok(Ok(())) => info!(
                state = %DepositState::Notified,
                user_id = %user.id,
                "Deposit notification sent"
            ),
            Ok(Err(err)) => warn!(
                user_id = %user.id,
                error = %err,
                "Deposit notification failed, balance change stands"
            ),
            Err(_) => warn!(
                user_id = %user.id,
                timeout_secs = self.notify_timeout.as_secs(),
                "Deposit notification timed out, balance change stands"
            ),
        }
    }
}

#[async_trait]
impl<P, N> MessageHandler for DepositConsumer<P, N>
where
    P: SessionSource,
    P::Session: LedgerSession,
    N: Notifier,
{
    async fn consume(&self, envelope: &Envelope) -> anyhow::Result<Disposition> {
        let message = match DepositMessage::from_slice(&envelope.message.payload) {
            Ok(message) => message,
            Err(err) => {
                error!(
                    delivery_tag = envelope.delivery_tag,
                    error = %err,
                    "Discarding undecodable deposit message"
                );
                return Ok(Disposition::Reject { requeue: false });
            }
        };
        if let Err(err) = message.validate() {
            error!(
                state = %DepositState::Failed,
                delivery_tag = envelope.delivery_tag,
                customer_code = %message.customer_code,
                amount = %message.amount,
                error = %err,
                "Discarding invalid deposit message"
            );
            return Ok(Disposition::Reject { requeue: false });
        }
        info!(
            state = %DepositState::Consumed,
            customer_code = %message.customer_code,
            amount = %message.amount,
            reference = message.reference.as_deref(),
            redelivered = envelope.redelivered,
            "Deposit message received"
        );

        let customer_code = message.customer_code.clone();
        match self.middleware.run(ApplyDeposit { message }).await {
            Ok(ApplyOutcome::Credited { user, amount }) => {
                info!(
                    state = %DepositState::Applied,
                    user_id = %user.id,
                    customer_code = %customer_code,
                    amount = %amount,
                    balance = %user.balance,
                    "Deposit applied"
                );
                self.notify(&user, amount).await;
                Ok(Disposition::Ack)
            }
            Ok(ApplyOutcome::Duplicate { reference }) => {
                warn!(
                    customer_code = %customer_code,
                    reference = %reference,
                    "Deposit was already applied, acknowledging redelivery"
                );
                Ok(Disposition::Ack)
            }
            Err(MiddlewareError::Handler(ApplyError::AccountNotFound(code))) => {
                error!(
                    state = %DepositState::Failed,
                    customer_code = %code,
                    "No account for deposit, dropping message"
                );
                Ok(Disposition::Ack)
            }
            Err(err) => {
                warn!(
                    state = %DepositState::Failed,
                    customer_code = %customer_code,
                    error = %err,
                    "Deposit not applied, message will be redelivered"
                );
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerMessage;
    use crate::entities::NewUser;
    use crate::pipeline::notify::NotifyError;
    use crate::session::{MemorySessionSource, MemoryStore, RetryPolicy};
    use std::str::FromStr;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for Outbox {
        async fn notify(&self, user_handle: &str, text: &str) -> Result<(), NotifyError> {
            self.sent
                .lock()
                .unwrap()
                .push((user_handle.to_string(), text.to_string()));
            if self.fail {
                return Err(NotifyError::Rejected {
                    status: 403,
                    body: "bot was blocked by the user".to_string(),
                });
            }
            Ok(())
        }
    }

    struct Fixture {
        store: MemoryStore,
        source: Arc<MemorySessionSource>,
        consumer: DepositConsumer<MemorySessionSource, Arc<Outbox>>,
        outbox: Arc<Outbox>,
        user: User,
    }

    fn fixture(outbox: Outbox) -> Fixture {
        let store = MemoryStore::default();
        let user = store.register(
            NewUser {
                first_name: Some("Ada".to_string()),
                last_name: None,
                email: "ada@example.com".to_string(),
                phone_number: "+2348000000000".to_string(),
                telegram_id: 7,
                chat_id: "7".to_string(),
                customer_code: Some("CUS_123".to_string()),
            },
            Decimal::from(100),
        );
        let source = Arc::new(MemorySessionSource::new(store.clone()));
        let middleware = Arc::new(SessionMiddleware::new(
            source.clone(),
            RetryPolicy {
                base_delay: Duration::from_millis(1),
                ..RetryPolicy::default()
            },
        ));
        let outbox = Arc::new(outbox);
        Fixture {
            store,
            source,
            consumer: DepositConsumer::new(middleware, outbox.clone()),
            outbox,
            user,
        }
    }

    fn envelope(body: &str) -> Envelope {
        Envelope {
            message: BrokerMessage::new(body.as_bytes().to_vec()),
            exchange: "charge".to_string(),
            routing_key: "charge.deposit".to_string(),
            delivery_tag: 1,
            redelivered: false,
        }
    }

    #[tokio::test]
    async fn test_applied_deposit_is_notified_and_acked() {
        let f = fixture(Outbox::default());

        let disposition = f
            .consumer
            .consume(&envelope(r#"{"customer_code":"CUS_123","amount":50,"reference":"T1"}"#))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(
            f.store.user(f.user.id).unwrap().balance,
            Decimal::from_str("150.00").unwrap()
        );
        let sent = f.outbox.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "7");
        assert!(sent[0].1.contains("₦150.00"));
    }

    #[tokio::test]
    async fn test_poison_message_is_rejected_without_requeue() {
        let f = fixture(Outbox::default());

        let disposition = f.consumer.consume(&envelope("not json")).await.unwrap();

        assert_eq!(disposition, Disposition::Reject { requeue: false });
        assert_eq!(f.source.acquisitions(), 0);
    }

    #[tokio::test]
    async fn test_non_positive_amounts_are_rejected_without_requeue() {
        let f = fixture(Outbox::default());

        for body in [
            r#"{"customer_code":"CUS_123","amount":-50}"#,
            r#"{"customer_code":"CUS_123","amount":0,"reference":"T0"}"#,
            r#"{"customer_code":"CUS_123","amount":0.001,"reference":"T1"}"#,
            r#"{"customer_code":"","amount":50}"#,
        ] {
            let disposition = f.consumer.consume(&envelope(body)).await.unwrap();
            assert_eq!(disposition, Disposition::Reject { requeue: false }, "{body}");
        }

        assert_eq!(f.source.acquisitions(), 0);
        assert_eq!(f.store.user(f.user.id).unwrap().balance, Decimal::from(100));
        assert!(f.store.applied_deposits().is_empty());
        assert!(f.outbox.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_account_is_acked() {
        let f = fixture(Outbox::default());

        let disposition = f
            .consumer
            .consume(&envelope(r#"{"customer_code":"CUS_999","amount":50}"#))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Ack);
        assert!(f.outbox.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store_requeues() {
        let f = fixture(Outbox::default());
        f.source.fail_next(3);

        let result = f
            .consumer
            .consume(&envelope(r#"{"customer_code":"CUS_123","amount":50}"#))
            .await;

        assert!(result.is_err());
        assert_eq!(
            f.store.user(f.user.id).unwrap().balance,
            Decimal::from(100)
        );
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_undo_credit() {
        let f = fixture(Outbox {
            fail: true,
            ..Outbox::default()
        });

        let disposition = f
            .consumer
            .consume(&envelope(r#"{"customer_code":"CUS_123","amount":25.5}"#))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(
            f.store.user(f.user.id).unwrap().balance,
            Decimal::from_str("125.50").unwrap()
        );
    }
}
