//! In-memory customer store + outbox.
//!
//! One tokio mutex covers both tables, so "entity write + outbox append" is
//! atomic by holding the lock across both, and every compare-and-swap is a
//! check and a write under the same lock. Used by tests and embedders that
//! do not need durability.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    Customer, CustomerId, CustomerUpdate, EventGuard, EventId, EventStatus, EventType,
    NewCustomer, OutboxEvent, OutflowError, Result,
};
use crate::ports::{Clock, CustomerStore, IdGenerator, OutboxStore, SharedClock, UlidGenerator};

#[derive(Default)]
struct State {
    customers: HashMap<CustomerId, Customer>,

    /// Append order, which is also `created_at` order.
    outbox: Vec<OutboxEvent>,
}

impl State {
    /// Next `created_at`: the clock reading, bumped past the newest event.
    fn next_created_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.outbox.last() {
            Some(last) if last.created_at >= now => last.created_at + TimeDelta::microseconds(1),
            _ => now,
        }
    }

    fn stage_event(
        &self,
        id: EventId,
        event_type: EventType,
        customer: &Customer,
        now: DateTime<Utc>,
    ) -> Result<OutboxEvent> {
        OutboxEvent::for_customer(id, event_type, customer, self.next_created_at(now))
            .map_err(|e| OutflowError::Transaction(format!("outbox append failed: {e}")))
    }

    fn event_mut(&mut self, id: EventId) -> Option<&mut OutboxEvent> {
        self.outbox.iter_mut().find(|e| e.id == id)
    }

    fn guarded_mut(&mut self, guard: &EventGuard) -> Result<&mut OutboxEvent> {
        match self.outbox.iter_mut().find(|e| e.id == guard.id) {
            Some(event) if guard.matches(event) => Ok(event),
            _ => Err(OutflowError::Conflict(guard.id.to_string())),
        }
    }
}

pub struct InMemoryStore {
    state: Mutex<State>,
    clock: SharedClock,
    ids: UlidGenerator<SharedClock>,
}

impl InMemoryStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(State::default()),
            ids: UlidGenerator::new(clock.clone()),
            clock,
        }
    }
}

#[async_trait]
impl CustomerStore for InMemoryStore {
    async fn create(&self, input: NewCustomer) -> Result<Customer> {
        let input = input.validated()?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let id = input.id.unwrap_or_else(|| self.ids.customer_id());
        if state.customers.contains_key(&id) {
            return Err(OutflowError::Transaction(format!(
                "customer {id} already exists"
            )));
        }
        let customer = Customer {
            id,
            name: input.name,
            email: input.email,
            deleted: false,
            created_at: now,
            updated_at: now,
        };
        let event = state.stage_event(self.ids.event_id(), EventType::Created, &customer, now)?;

        state.customers.insert(id, customer.clone());
        state.outbox.push(event);
        Ok(customer)
    }

    async fn update(&self, input: CustomerUpdate) -> Result<Customer> {
        let input = input.validated()?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let existing = match state.customers.get(&input.id) {
            Some(c) if !c.deleted => c,
            _ => return Err(OutflowError::not_found("customer", input.id)),
        };
        let customer = Customer {
            id: existing.id,
            name: input.name,
            email: input.email,
            deleted: false,
            created_at: existing.created_at,
            updated_at: now,
        };
        let event = state.stage_event(self.ids.event_id(), EventType::Updated, &customer, now)?;

        state.customers.insert(customer.id, customer.clone());
        state.outbox.push(event);
        Ok(customer)
    }

    async fn soft_delete(&self, id: CustomerId) -> Result<Customer> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let Some(existing) = state.customers.get(&id) else {
            return Err(OutflowError::not_found("customer", id));
        };
        let customer = Customer {
            deleted: true,
            updated_at: now,
            ..existing.clone()
        };
        let event = state.stage_event(self.ids.event_id(), EventType::Deleted, &customer, now)?;

        state.customers.insert(id, customer.clone());
        state.outbox.push(event);
        Ok(customer)
    }

    async fn find_by_id(&self, id: CustomerId, include_deleted: bool) -> Result<Option<Customer>> {
        let state = self.state.lock().await;
        Ok(state
            .customers
            .get(&id)
            .filter(|c| include_deleted || !c.deleted)
            .cloned())
    }

    async fn find_by_email(
        &self,
        email: &str,
        include_deleted: bool,
    ) -> Result<Option<Customer>> {
        let email = email.trim();
        let state = self.state.lock().await;
        let mut matches: Vec<&Customer> = state
            .customers
            .values()
            .filter(|c| c.email == email && (include_deleted || !c.deleted))
            .collect();
        matches.sort_by_key(|c| c.created_at);
        Ok(matches.first().map(|c| (*c).clone()))
    }

    async fn list(&self, include_deleted: bool) -> Result<Vec<Customer>> {
        let state = self.state.lock().await;
        let mut customers: Vec<Customer> = state
            .customers
            .values()
            .filter(|c| include_deleted || !c.deleted)
            .cloned()
            .collect();
        customers.sort_by_key(|c| c.created_at);
        Ok(customers)
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn watermark(&self) -> Result<Option<DateTime<Utc>>> {
        let state = self.state.lock().await;
        Ok(state.outbox.iter().filter_map(|e| e.processed_up_to).max())
    }

    async fn head_of_line(
        &self,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<Option<OutboxEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .iter()
            .filter(|e| e.status != EventStatus::Processed)
            .filter(|e| watermark.is_none_or(|w| e.created_at > w))
            .min_by_key(|e| e.created_at)
            .cloned())
    }

    async fn try_claim(&self, guard: &EventGuard, now: DateTime<Utc>) -> Result<OutboxEvent> {
        let mut state = self.state.lock().await;
        let event = state.guarded_mut(guard)?;
        event.claim(now);
        Ok(event.clone())
    }

    async fn mark_processed(&self, lease: &EventGuard, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.guarded_mut(lease)?.mark_processed(now);
        Ok(())
    }

    async fn mark_failed(
        &self,
        lease: &EventGuard,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.guarded_mut(lease)?.mark_failed(error, now);
        Ok(())
    }

    async fn retryable(
        &self,
        max_retries: u32,
        cooled_before: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .iter()
            .filter(|e| e.status == EventStatus::Failed && e.retry_count < max_retries)
            .filter(|e| e.last_retry_at.is_none_or(|at| at <= cooled_before))
            .cloned()
            .collect())
    }

    async fn requeue(
        &self,
        id: EventId,
        expected_retry_count: u32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.event_mut(id) {
            Some(e) if e.status == EventStatus::Failed && e.retry_count == expected_retry_count => {
                e.requeue(now);
                Ok(())
            }
            _ => Err(OutflowError::Conflict(id.to_string())),
        }
    }

    async fn dead_letters(&self, max_retries: u32) -> Result<Vec<OutboxEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .iter()
            .filter(|e| e.is_dead_letter(max_retries))
            .cloned()
            .collect())
    }

    async fn replay_dead_letter(
        &self,
        id: EventId,
        expected_retry_count: u32,
        now: DateTime<Utc>,
    ) -> Result<OutboxEvent> {
        let mut state = self.state.lock().await;
        match state.event_mut(id) {
            Some(e) if e.status == EventStatus::Failed && e.retry_count == expected_retry_count => {
                e.replay(now);
                Ok(e.clone())
            }
            _ => Err(OutflowError::Conflict(id.to_string())),
        }
    }

    async fn get_event(&self, id: EventId) -> Result<Option<OutboxEvent>> {
        let state = self.state.lock().await;
        Ok(state.outbox.iter().find(|e| e.id == id).cloned())
    }

    async fn list_events(&self) -> Result<Vec<OutboxEvent>> {
        let state = self.state.lock().await;
        Ok(state.outbox.clone())
    }
}
