//! Shared harness for the service flow tests.

#![allow(dead_code)]

use replica_core::redelivery::RedeliveryPolicy;
use replica_testing::{FixedClock, InMemoryDeadLetters, InMemoryEventBus, InMemoryVersionedStore, test_clock};
use std::sync::Arc;
use std::time::Duration;
use ticketing::app::{orders_router, payments_router};
use ticketing::orders::{Order, OrdersService};
use ticketing::payments::{MockPaymentGateway, Payment, PaymentsService, ReplicatedOrder};
use ticketing::runtime::{Application, RunningApplication};
use ticketing::tickets::Ticket;

pub type Orders = OrdersService<InMemoryVersionedStore<Order>, InMemoryVersionedStore<Ticket>>;
pub type Payments = PaymentsService<InMemoryVersionedStore<ReplicatedOrder>, InMemoryVersionedStore<Payment>>;

/// Short redelivery so deferred messages come back quickly.
pub fn policy() -> RedeliveryPolicy {
    RedeliveryPolicy::new(Duration::from_millis(20), 5)
}

/// Wait for the bus to settle everything, failing the test otherwise.
pub async fn settle(bus: &InMemoryEventBus) {
    assert!(bus.quiesce(Duration::from_secs(5)).await, "bus did not quiesce");
}

/// Orders service wired to in-memory infrastructure.
pub struct OrdersHarness {
    pub bus: InMemoryEventBus,
    pub orders: InMemoryVersionedStore<Order>,
    pub tickets: InMemoryVersionedStore<Ticket>,
    pub dead_letters: InMemoryDeadLetters,
    pub clock: FixedClock,
    pub service: Arc<Orders>,
}

impl OrdersHarness {
    pub fn new() -> Self {
        let bus = InMemoryEventBus::new();
        let orders = InMemoryVersionedStore::new();
        let tickets = InMemoryVersionedStore::new();
        let clock = test_clock();
        let service = Arc::new(OrdersService::new(
            orders.clone(),
            tickets.clone(),
            Arc::new(bus.clone()),
            Arc::new(clock.clone()),
        ));
        Self {
            bus,
            orders,
            tickets,
            dead_letters: InMemoryDeadLetters::new(),
            clock,
            service,
        }
    }

    /// Start two competing consumers per subject.
    pub async fn start(&self) -> RunningApplication {
        let router = orders_router(Arc::clone(&self.service), policy())
            .with_dead_letters(Arc::new(self.dead_letters.clone()))
            .with_clock(Arc::new(self.clock.clone()));
        let running = Application::new("orders", Arc::new(self.bus.clone()), Arc::new(router), "orders-service")
            .with_workers(2)
            .start();
        subscribed().await;
        running
    }
}

/// Payments service wired to in-memory infrastructure.
pub struct PaymentsHarness {
    pub bus: InMemoryEventBus,
    pub orders: InMemoryVersionedStore<ReplicatedOrder>,
    pub payments: InMemoryVersionedStore<Payment>,
    pub gateway: Arc<MockPaymentGateway>,
    pub dead_letters: InMemoryDeadLetters,
    pub clock: FixedClock,
    pub service: Payments,
}

impl PaymentsHarness {
    pub fn new() -> Self {
        let bus = InMemoryEventBus::new();
        let orders = InMemoryVersionedStore::new();
        let payments = InMemoryVersionedStore::new();
        let gateway = Arc::new(MockPaymentGateway::new());
        let clock = test_clock();
        let service = PaymentsService::new(
            orders.clone(),
            payments.clone(),
            gateway.clone(),
            Arc::new(bus.clone()),
            Arc::new(clock.clone()),
        );
        Self {
            bus,
            orders,
            payments,
            gateway,
            dead_letters: InMemoryDeadLetters::new(),
            clock,
            service,
        }
    }

    /// Start two competing consumers per subject.
    pub async fn start(&self) -> RunningApplication {
        let router = payments_router(self.orders.clone(), policy())
            .with_dead_letters(Arc::new(self.dead_letters.clone()))
            .with_clock(Arc::new(self.clock.clone()));
        let running = Application::new("payments", Arc::new(self.bus.clone()), Arc::new(router), "payments-service")
            .with_workers(2)
            .start();
        subscribed().await;
        running
    }
}

/// Let spawned consumers subscribe; the in-memory bus drops messages published
/// to a subject nobody listens on.
async fn subscribed() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
