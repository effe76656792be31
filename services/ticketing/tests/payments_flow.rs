//! Payments service end to end over the in-memory broker and store.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use common::{PaymentsHarness, settle};
use replica_core::environment::Clock;
use replica_core::event_bus::EventBus;
use replica_core::store::VersionedStore;
use replica_core::stream::{EntityId, Version};
use replica_testing::SettleOutcome;
use replica_testing::helpers::envelope_bytes;
use ticketing::orders::{OrderSnapshot, TicketRef};
use ticketing::payments::{DECLINED_TOKEN, GatewayError, ReplicatedOrder};
use ticketing::subjects::{ORDER_CANCELLED, ORDER_CREATED, ORDER_UPDATED, PAYMENT_CREATED};
use ticketing::{CommandError, Money, OrderStatus, UserId};

fn snapshot(id: i64, version: u64, status: OrderStatus) -> OrderSnapshot {
    OrderSnapshot {
        id: EntityId::new(id),
        version: Version::new(version),
        user_id: UserId::new("alice"),
        status,
        expires_at: None,
        ticket: TicketRef {
            id: EntityId::new(100 + id),
            price: Money::from_cents(2050),
        },
    }
}

fn replica(id: i64, version: u64, status: OrderStatus) -> ReplicatedOrder {
    ReplicatedOrder::from(snapshot(id, version, status))
}

async fn publish(h: &PaymentsHarness, subject: &str, order: &OrderSnapshot) {
    let key = order.id.to_string();
    h.bus
        .publish(subject, Some(&key), envelope_bytes(subject, order))
        .await
        .unwrap();
}

#[tokio::test]
async fn cancellation_arriving_first_converges_to_the_cancelled_order() {
    let h = PaymentsHarness::new();
    let running = h.start().await;

    publish(&h, ORDER_CANCELLED, &snapshot(3, 1, OrderStatus::Cancelled)).await;
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    publish(&h, ORDER_CREATED, &snapshot(3, 0, OrderStatus::Created)).await;
    settle(&h.bus).await;

    let stored = h.orders.get(EntityId::new(3)).await.unwrap().unwrap();
    assert_eq!(stored.version, Version::new(1));
    assert_eq!(stored.status, OrderStatus::Cancelled);
    assert_eq!(stored.price, Money::from_cents(2050));
    assert!(h.dead_letters.is_empty());

    running.shutdown().await;
}

#[tokio::test]
async fn duplicate_cancellation_is_applied_once() {
    let h = PaymentsHarness::new();
    h.orders.seed([replica(7, 0, OrderStatus::Created)]).await;
    let running = h.start().await;

    let cancelled = snapshot(7, 1, OrderStatus::Cancelled);
    publish(&h, ORDER_CANCELLED, &cancelled).await;
    publish(&h, ORDER_CANCELLED, &cancelled).await;
    settle(&h.bus).await;

    assert_eq!(h.bus.count(ORDER_CANCELLED, |o| *o == SettleOutcome::Acked), 1);
    assert_eq!(h.bus.count(ORDER_CANCELLED, |o| *o == SettleOutcome::Termed), 1);
    assert_eq!(h.orders.version_of(EntityId::new(7)).await, Some(Version::new(1)));
    assert!(h.dead_letters.is_empty());

    running.shutdown().await;
}

#[tokio::test]
async fn updates_after_cancellation_are_dead_lettered() {
    let h = PaymentsHarness::new();
    h.orders.seed([replica(5, 1, OrderStatus::Cancelled)]).await;
    let running = h.start().await;

    publish(&h, ORDER_UPDATED, &snapshot(5, 2, OrderStatus::Created)).await;
    settle(&h.bus).await;

    assert_eq!(h.bus.count(ORDER_UPDATED, |o| *o == SettleOutcome::Termed), 1);
    let stored = h.orders.get(EntityId::new(5)).await.unwrap().unwrap();
    assert_eq!(stored.version, Version::new(1));
    assert_eq!(stored.status, OrderStatus::Cancelled);

    let letters = h.dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].class, "malformed");
    assert_eq!(letters[0].envelope.subject, ORDER_UPDATED);

    running.shutdown().await;
}

#[tokio::test]
async fn payment_charges_the_replicated_price() {
    let h = PaymentsHarness::new();
    h.orders.seed([replica(9, 0, OrderStatus::Created)]).await;

    let (payment, sequence) = h
        .service
        .create_payment(&UserId::new("alice"), EntityId::new(9), "tok_visa")
        .await
        .unwrap();

    assert_eq!(payment.order_id, EntityId::new(9));
    assert_eq!(payment.amount, Money::from_cents(2050));
    assert_eq!(payment.created_at, h.clock.now());
    assert_eq!(h.gateway.charges(), 1);
    assert_eq!(h.payments.all().await, vec![payment.clone()]);

    let published = h.bus.published_to(PAYMENT_CREATED);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].sequence, sequence);
    assert_eq!(published[0].key.as_deref(), Some("9"));
    let body = &published[0].json()[PAYMENT_CREATED];
    assert_eq!(body["orderId"], 9);
    assert_eq!(body["amount"], 2050);
    assert_eq!(body["chargeId"], payment.charge_id.as_str());
}

#[tokio::test]
async fn payment_is_refused_for_unknown_foreign_or_cancelled_orders() {
    let h = PaymentsHarness::new();
    h.orders
        .seed([replica(1, 0, OrderStatus::Created), replica(2, 1, OrderStatus::Cancelled)])
        .await;
    let alice = UserId::new("alice");

    let unknown = h.service.create_payment(&alice, EntityId::new(99), "tok_visa").await;
    assert!(matches!(unknown, Err(CommandError::NotFound { kind: "order", .. })));

    let foreign = h
        .service
        .create_payment(&UserId::new("bob"), EntityId::new(1), "tok_visa")
        .await;
    assert!(matches!(foreign, Err(CommandError::NotOwner { .. })));

    let cancelled = h.service.create_payment(&alice, EntityId::new(2), "tok_visa").await;
    assert!(matches!(cancelled, Err(CommandError::TerminalState { .. })));

    assert_eq!(h.gateway.charges(), 0);
    assert!(h.payments.all().await.is_empty());
    assert!(h.bus.published().is_empty());
}

#[tokio::test]
async fn declined_charge_records_nothing() {
    let h = PaymentsHarness::new();
    h.orders.seed([replica(4, 0, OrderStatus::Created)]).await;

    let result = h
        .service
        .create_payment(&UserId::new("alice"), EntityId::new(4), DECLINED_TOKEN)
        .await;

    assert!(matches!(result, Err(CommandError::ChargeFailed(GatewayError::Declined(_)))));
    assert!(h.payments.all().await.is_empty());
    assert!(h.bus.published().is_empty());
}

#[tokio::test]
async fn payment_follows_the_replicated_order() {
    let h = PaymentsHarness::new();
    let running = h.start().await;

    publish(&h, ORDER_CREATED, &snapshot(11, 0, OrderStatus::Created)).await;
    settle(&h.bus).await;
    h.service
        .create_payment(&UserId::new("alice"), EntityId::new(11), "tok_visa")
        .await
        .unwrap();

    publish(&h, ORDER_CANCELLED, &snapshot(11, 1, OrderStatus::Cancelled)).await;
    settle(&h.bus).await;
    let refused = h
        .service
        .create_payment(&UserId::new("alice"), EntityId::new(11), "tok_visa")
        .await;
    assert!(matches!(refused, Err(CommandError::TerminalState { .. })));
    assert_eq!(h.payments.all().await.len(), 1);

    running.shutdown().await;
}
