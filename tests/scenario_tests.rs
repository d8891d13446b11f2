mod common;

use common::{event_body, TestEngine};
use credit_settlement::config::OutboxSettings;
use credit_settlement::models::{topics, RefundReason, TransactionType, VerificationStatus};
use credit_settlement::outbox::{LoggingNotificationSink, OutboxWorker};
use credit_settlement::repositories::OutboxStore;
use credit_settlement::services::{PaymentOutcome, PurchaseRequest, RefundOutcome};
use credit_settlement::webhook::ProcessingResult;
use rust_decimal_macros::dec;
use std::sync::Arc;

/// Top-up, duplicate webhook, purchase, timeout refund, repeated refund.
#[tokio::test]
async fn test_top_up_purchase_and_timeout_refund() {
    let env = TestEngine::new();
    let user_id = env.funded_user(dec!(10)).await;
    assert_eq!(env.balance(user_id).await, dec!(10));

    // Provider confirms a $20 payment, then redelivers the same event.
    let payment = env.initialize(user_id, dec!(20)).await;
    let body = event_body("evt_1", &payment.external_reference, "20.00", "success");

    let first = env.deliver(&body).await.unwrap();
    assert!(matches!(
        first,
        ProcessingResult::Processed {
            outcome: PaymentOutcome::Credited { .. },
            replayed: false
        }
    ));
    assert_eq!(env.balance(user_id).await, dec!(30));

    let second = env.deliver(&body).await.unwrap();
    assert!(matches!(second, ProcessingResult::Processed { replayed: true, .. }));
    assert_eq!(env.balance(user_id).await, dec!(30));

    // A $5 verification is bought, then times out.
    let receipt = env
        .engine
        .verifications
        .purchase(PurchaseRequest {
            verification_id: "ver_1".to_string(),
            user_id,
            amount: dec!(5),
        })
        .await
        .unwrap();
    assert_eq!(receipt.balance, dec!(25));
    assert_eq!(env.balance(user_id).await, dec!(25));

    let refund = env
        .engine
        .refunds
        .refund("ver_1", RefundReason::Timeout)
        .await
        .unwrap();
    let refund_id = match refund {
        RefundOutcome::Refunded {
            refund_transaction_id,
            amount,
            new_balance,
        } => {
            assert_eq!(amount, dec!(5));
            assert_eq!(new_balance, dec!(30));
            refund_transaction_id
        }
        other => panic!("unexpected refund outcome {:?}", other),
    };
    assert_eq!(env.balance(user_id).await, dec!(30));

    // The second refund request is a no-op.
    let again = env
        .engine
        .refunds
        .refund("ver_1", RefundReason::Timeout)
        .await
        .unwrap();
    assert_eq!(
        again,
        RefundOutcome::AlreadyRefunded {
            refund_transaction_id: refund_id
        }
    );
    assert_eq!(env.balance(user_id).await, dec!(30));

    // Log: two credits, one debit, one refund that points at the debit.
    let transactions = env.transactions(user_id).await;
    assert_eq!(transactions.len(), 4);
    let debit = transactions
        .iter()
        .find(|t| t.transaction_type == TransactionType::Debit)
        .unwrap();
    let refund = transactions
        .iter()
        .find(|t| t.transaction_type == TransactionType::Refund)
        .unwrap();
    assert_eq!(refund.reverses_transaction_id, Some(debit.id));
    assert_eq!(refund.amount, -debit.amount);
    assert_eq!(
        env.engine.verifications.verification("ver_1").await.unwrap().status,
        VerificationStatus::Refunded
    );
    env.assert_conserved(user_id).await;
}

#[tokio::test]
async fn test_scenario_notifications_are_published_from_the_outbox() {
    let env = TestEngine::new();
    let user_id = env.funded_user(dec!(10)).await;
    env.engine
        .verifications
        .purchase(PurchaseRequest {
            verification_id: "ver_notify".to_string(),
            user_id,
            amount: dec!(5),
        })
        .await
        .unwrap();
    env.engine
        .refunds
        .refund("ver_notify", RefundReason::ProvisioningFailed)
        .await
        .unwrap();

    let worker = OutboxWorker::new(
        env.engine.outbox.clone(),
        Arc::new(LoggingNotificationSink),
        &OutboxSettings::default(),
        env.engine.retry.clone(),
    );
    let report = worker.run_once().await.unwrap();
    assert_eq!(report.delivered, 3);

    let messages = env.engine.outbox.find_by_user(user_id).await.unwrap();
    let topics_seen: Vec<&str> = messages.iter().map(|m| m.topic.as_str()).collect();
    assert!(topics_seen.contains(&topics::PAYMENT_CREDITED));
    assert!(topics_seen.contains(&topics::VERIFICATION_DEBITED));
    assert!(topics_seen.contains(&topics::VERIFICATION_REFUNDED));

    // Nothing left to ship.
    assert_eq!(worker.run_once().await.unwrap().delivered, 0);
}
