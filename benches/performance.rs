use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use uuid::Uuid;

use credit_settlement::engine::{EngineConfig, SettlementEngine};
use credit_settlement::idempotency::IdempotencyKeyGenerator;
use credit_settlement::models::{RefundReason, Transaction};
use credit_settlement::services::{InitializePayment, PurchaseRequest};
use credit_settlement::webhook::{SignatureVerifier, WebhookEvent};

const SECRET: &str = "bench_secret";

fn event_body(size: usize) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "event_id": "evt_bench",
        "reference": format!("PAY-{}", "x".repeat(size)),
        "amount": "20.00",
        "status": "success",
    }))
    .unwrap()
}

fn benchmark_signature(c: &mut Criterion) {
    let mut group = c.benchmark_group("signature");
    let verifier = SignatureVerifier::new(SECRET).unwrap();

    for size in [32, 1024, 16 * 1024].iter() {
        let body = event_body(*size);
        let signature = verifier.sign(&body).unwrap();

        group.bench_with_input(BenchmarkId::new("verify", size), &body, |b, body| {
            b.iter(|| black_box(verifier.verify(black_box(body), Some(&signature)).is_ok()));
        });
    }

    group.bench_function("reject_forged", |b| {
        let body = event_body(32);
        b.iter(|| black_box(verifier.verify(black_box(&body), Some("00ff")).is_err()));
    });

    group.finish();
}

fn benchmark_payload(c: &mut Criterion) {
    let mut group = c.benchmark_group("payload");
    let body = event_body(32);
    let keys = IdempotencyKeyGenerator::default();

    group.bench_function("parse_event", |b| {
        b.iter(|| black_box(WebhookEvent::parse(black_box(&body)).unwrap()));
    });

    group.bench_function("fingerprint", |b| {
        let event = WebhookEvent::parse(&body).unwrap();
        b.iter(|| black_box(keys.fingerprint(black_box(&event)).unwrap()));
    });

    group.bench_function("build_refund", |b| {
        let debit = Transaction::debit(Uuid::new_v4(), "ver_bench", Decimal::from(5));
        b.iter(|| black_box(Transaction::refund_of(black_box(&debit))));
    });

    group.finish();
}

fn funded_engine(runtime: &Runtime, balance: i64) -> (Arc<SettlementEngine>, Uuid) {
    runtime.block_on(async {
        let (engine, _) = SettlementEngine::in_memory(EngineConfig::for_tests(SECRET)).unwrap();
        let engine = Arc::new(engine);
        let user_id = Uuid::new_v4();
        engine.ledger.open_account(user_id).await.unwrap();

        let payment = engine
            .payments
            .initialize_payment(
                &Uuid::new_v4().to_string(),
                InitializePayment {
                    user_id,
                    amount: Decimal::from(balance),
                },
            )
            .await
            .unwrap()
            .into_inner();
        let event = WebhookEvent::parse(
            &serde_json::to_vec(&json!({
                "event_id": "evt_funding",
                "reference": payment.external_reference,
                "amount": balance.to_string(),
                "status": "success",
            }))
            .unwrap(),
        )
        .unwrap();
        engine.payments.apply_event(&event).await.unwrap();
        (engine, user_id)
    })
}

fn benchmark_ledger(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger");
    group.measurement_time(Duration::from_secs(10));
    let runtime = Runtime::new().unwrap();

    group.bench_function("purchase_and_refund", |b| {
        let (engine, user_id) = funded_engine(&runtime, 1_000_000);
        b.to_async(&runtime).iter(|| {
            let engine = engine.clone();
            async move {
                let verification_id = Uuid::new_v4().to_string();
                engine
                    .verifications
                    .purchase(PurchaseRequest {
                        verification_id: verification_id.clone(),
                        user_id,
                        amount: Decimal::ONE,
                    })
                    .await
                    .unwrap();
                black_box(
                    engine
                        .refunds
                        .refund(&verification_id, RefundReason::Timeout)
                        .await
                        .unwrap(),
                )
            }
        });
    });

    group.bench_function("reconcile_after_1000", |b| {
        let (engine, user_id) = funded_engine(&runtime, 10_000);
        runtime.block_on(async {
            for i in 0..1000 {
                engine
                    .verifications
                    .purchase(PurchaseRequest {
                        verification_id: format!("ver_{}", i),
                        user_id,
                        amount: Decimal::ONE,
                    })
                    .await
                    .unwrap();
            }
        });
        b.to_async(&runtime).iter(|| {
            let engine = engine.clone();
            async move { black_box(engine.ledger.reconcile(user_id).await.unwrap()) }
        });
    });

    group.finish();
}

criterion_group!(benches, benchmark_signature, benchmark_payload, benchmark_ledger);

criterion_main!(benches);
