//! Subscription reconciliation state machine
//!
//! [`apply_transition`] is a pure function from the stored row plus one
//! transition to the next row. [`Reconciler`] wraps it in an optimistic
//! compare-and-swap loop on the row's `version`, so two events for the same
//! user never interleave their writes.
//!
//! Ordering rules:
//! - status, tier and flags apply only when the event is at least as new as
//!   the last event that set them (`state_event_at`)
//! - the period window applies only when the event is at least as new as the
//!   last event that set it (`period_event_at`)
//! - renewals never move `current_period_end` backward

use std::sync::Arc;

use kindred_shared::{ProviderKind, SubscriptionStatus, Tier};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::SubscriptionSnapshot;
use crate::store::{BillingStore, SubscriptionRecord};

/// Attempts before giving up with `ConcurrentModification`
const MAX_CAS_ATTEMPTS: usize = 5;

/// Input to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// New subscription reported by a provider (or verified locally)
    Created(SubscriptionSnapshot),
    /// Provider reported the current absolute state
    Updated(SubscriptionSnapshot),
    /// Deleted by the provider, cancelled now by the user, or fully refunded
    Cancel,
    Expire,
    RenewalSucceeded {
        period_start: Option<OffsetDateTime>,
        period_end: OffsetDateTime,
        tier: Option<Tier>,
    },
    RenewalFailed,
    AutoRenewChanged {
        enabled: bool,
    },
    /// User asked to stop renewing at the end of the period
    CancelAtPeriodEnd,
    /// User undid a pending cancellation
    Reactivate,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Created(_) => "created",
            Transition::Updated(_) => "updated",
            Transition::Cancel => "cancel",
            Transition::Expire => "expire",
            Transition::RenewalSucceeded { .. } => "renewal_succeeded",
            Transition::RenewalFailed => "renewal_failed",
            Transition::AutoRenewChanged { .. } => "auto_renew_changed",
            Transition::CancelAtPeriodEnd => "cancel_at_period_end",
            Transition::Reactivate => "reactivate",
        }
    }
}

/// Where a transition came from and when it happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMeta {
    pub occurred_at: OffsetDateTime,
    /// Provider subscription the event refers to
    pub subscription_ref: Option<String>,
    /// Provider that reported the event, `None` for user-initiated changes
    pub provider: Option<ProviderKind>,
}

impl EventMeta {
    pub fn provider(
        provider: ProviderKind,
        occurred_at: OffsetDateTime,
        subscription_ref: Option<String>,
    ) -> Self {
        Self {
            occurred_at,
            subscription_ref,
            provider: Some(provider),
        }
    }

    /// User-initiated change happening now
    pub fn local() -> Self {
        Self {
            occurred_at: OffsetDateTime::now_utc(),
            subscription_ref: None,
            provider: None,
        }
    }

    fn is_local(&self) -> bool {
        self.provider.is_none()
    }
}

/// Result of the pure transition function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub record: SubscriptionRecord,
    /// False when the transition was stale or a no-op
    pub applied: bool,
}

/// Compute the next subscription row for `transition`
pub fn apply_transition(
    current: &SubscriptionRecord,
    transition: &Transition,
    meta: &EventMeta,
) -> TransitionOutcome {
    let unchanged = || TransitionOutcome {
        record: current.clone(),
        applied: false,
    };

    // Events about a subscription other than the one on file are leftovers
    // from a replaced subscription; only a creation may switch it.
    if !matches!(transition, Transition::Created(_)) {
        if let (Some(incoming), Some(stored)) = (
            meta.subscription_ref.as_deref(),
            current.provider_subscription_ref.as_deref(),
        ) {
            if incoming != stored {
                return unchanged();
            }
        }
    }

    // Local changes happen "now" but must not lose to a provider clock that
    // runs slightly ahead.
    let at = if meta.is_local() {
        current
            .state_event_at
            .map_or(meta.occurred_at, |stored| stored.max(meta.occurred_at))
    } else {
        meta.occurred_at
    };
    let state_fresh = current.state_event_at.map_or(true, |stored| at >= stored);
    let period_fresh = current.period_event_at.map_or(true, |stored| at >= stored);

    let mut next = current.clone();

    match transition {
        Transition::Created(snapshot) | Transition::Updated(snapshot) => {
            if state_fresh {
                apply_snapshot_state(&mut next, snapshot, at);
                if let Some(provider) = meta.provider {
                    next.provider = provider;
                }
            }
            if period_fresh && (snapshot.period_start.is_some() || snapshot.period_end.is_some()) {
                next.current_period_start = snapshot.period_start.or(next.current_period_start);
                next.current_period_end = snapshot.period_end.or(next.current_period_end);
                next.period_event_at = Some(at);
            }
        }
        Transition::Cancel => {
            if !state_fresh {
                return unchanged();
            }
            next.status = SubscriptionStatus::Cancelled;
            next.cancelled_at = Some(current.cancelled_at.unwrap_or(at));
            next.state_event_at = Some(at);
        }
        Transition::Expire => {
            if !state_fresh {
                return unchanged();
            }
            next.status = SubscriptionStatus::Expired;
            next.state_event_at = Some(at);
        }
        Transition::RenewalSucceeded {
            period_start,
            period_end,
            tier,
        } => {
            let extends = current
                .current_period_end
                .map_or(true, |stored| *period_end > stored);
            if extends {
                next.current_period_end = Some(*period_end);
                if period_start.is_some() {
                    next.current_period_start = *period_start;
                }
            }
            if extends || period_fresh {
                next.period_event_at = Some(
                    current
                        .period_event_at
                        .map_or(at, |stored| stored.max(at)),
                );
            }
            if state_fresh {
                next.status = SubscriptionStatus::Active;
                next.cancelled_at = None;
                if let Some(tier) = tier {
                    next.tier = *tier;
                }
                next.state_event_at = Some(at);
            }
        }
        Transition::RenewalFailed => {
            if !state_fresh || !current.status.is_live() {
                return unchanged();
            }
            next.status = SubscriptionStatus::BillingRetry;
            next.state_event_at = Some(at);
        }
        Transition::AutoRenewChanged { enabled } => {
            if !state_fresh {
                return unchanged();
            }
            next.auto_renew = *enabled;
            if next.status.is_live() {
                next.cancel_at_period_end = !*enabled;
            }
            next.state_event_at = Some(at);
        }
        Transition::CancelAtPeriodEnd => {
            if !state_fresh || !current.status.is_live() {
                return unchanged();
            }
            next.cancel_at_period_end = true;
            next.auto_renew = false;
            next.state_event_at = Some(at);
        }
        Transition::Reactivate => {
            if !state_fresh || current.status.is_terminal() {
                return unchanged();
            }
            next.cancel_at_period_end = false;
            next.auto_renew = true;
            next.status = SubscriptionStatus::Active;
            next.state_event_at = Some(at);
        }
    }

    enforce_terminal_state(&mut next);

    // Timestamps alone moving forward is not a change worth a write.
    let applied = !same_state(current, &next);
    if !applied {
        return unchanged();
    }
    next.updated_at = OffsetDateTime::now_utc();
    TransitionOutcome {
        record: next,
        applied,
    }
}

fn apply_snapshot_state(
    record: &mut SubscriptionRecord,
    snapshot: &SubscriptionSnapshot,
    at: OffsetDateTime,
) {
    record.status = snapshot.status;
    record.tier = snapshot.tier;
    record.cancel_at_period_end = snapshot.cancel_at_period_end;
    record.auto_renew = snapshot.auto_renew;
    record.is_trial = snapshot.is_trial;
    if snapshot.plan_ref.is_some() {
        record.plan_ref = snapshot.plan_ref.clone();
    }
    if snapshot.subscription_ref.is_some() {
        record.provider_subscription_ref = snapshot.subscription_ref.clone();
    }
    if snapshot.customer_ref.is_some() {
        record.provider_customer_ref = snapshot.customer_ref.clone();
    }
    if snapshot.original_transaction_ref.is_some() {
        record.provider_original_transaction_ref = snapshot.original_transaction_ref.clone();
    }
    if snapshot.status == SubscriptionStatus::Cancelled {
        record.cancelled_at = Some(record.cancelled_at.unwrap_or(at));
    } else {
        record.cancelled_at = None;
    }
    record.state_event_at = Some(at);
}

/// Ended subscriptions carry no paid tier and nothing pending
fn enforce_terminal_state(record: &mut SubscriptionRecord) {
    if record.status.is_terminal() {
        record.tier = Tier::lowest();
        record.cancel_at_period_end = false;
        record.auto_renew = false;
    }
}

fn same_state(a: &SubscriptionRecord, b: &SubscriptionRecord) -> bool {
    a.provider == b.provider
        && a.tier == b.tier
        && a.status == b.status
        && a.provider_customer_ref == b.provider_customer_ref
        && a.provider_subscription_ref == b.provider_subscription_ref
        && a.provider_original_transaction_ref == b.provider_original_transaction_ref
        && a.plan_ref == b.plan_ref
        && a.current_period_start == b.current_period_start
        && a.current_period_end == b.current_period_end
        && a.cancel_at_period_end == b.cancel_at_period_end
        && a.cancelled_at == b.cancelled_at
        && a.auto_renew == b.auto_renew
        && a.is_trial == b.is_trial
}

/// What a reconciliation changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionDelta {
    pub user_id: Uuid,
    pub previous_status: SubscriptionStatus,
    pub status: SubscriptionStatus,
    pub previous_tier: Tier,
    pub tier: Tier,
    pub previous_period_end: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub applied: bool,
    pub record: SubscriptionRecord,
}

impl SubscriptionDelta {
    fn new(previous: &SubscriptionRecord, record: SubscriptionRecord, applied: bool) -> Self {
        Self {
            user_id: record.user_id,
            previous_status: previous.status,
            status: record.status,
            previous_tier: previous.tier,
            tier: record.tier,
            previous_period_end: previous.current_period_end,
            period_end: record.current_period_end,
            applied,
            record,
        }
    }

    /// The paid period moved forward
    pub fn period_extended(&self) -> bool {
        match (self.previous_period_end, self.period_end) {
            (Some(before), Some(after)) => after > before,
            (None, Some(_)) => true,
            _ => false,
        }
    }

    pub fn status_changed(&self) -> bool {
        self.previous_status != self.status
    }

    pub fn tier_changed(&self) -> bool {
        self.previous_tier != self.tier
    }
}

/// Applies transitions to stored subscriptions
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn BillingStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Apply one transition to the user's subscription
    pub async fn apply(
        &self,
        user_id: Uuid,
        transition: &Transition,
        meta: &EventMeta,
    ) -> BillingResult<SubscriptionDelta> {
        let delta = self
            .modify(user_id, |current| {
                let outcome = apply_transition(current, transition, meta);
                outcome.applied.then_some(outcome.record)
            })
            .await?;

        if delta.applied {
            tracing::info!(
                user_id = %user_id,
                transition = transition.name(),
                previous_status = %delta.previous_status,
                status = %delta.status,
                previous_tier = %delta.previous_tier,
                tier = %delta.tier,
                "Subscription reconciled"
            );
        } else {
            tracing::debug!(
                user_id = %user_id,
                transition = transition.name(),
                occurred_at = %meta.occurred_at,
                "Transition was stale or a no-op"
            );
        }

        Ok(delta)
    }

    /// Read-modify-write the user's row under compare-and-swap. `change`
    /// returns `None` to leave the row untouched; it may run more than once.
    pub async fn modify<F>(&self, user_id: Uuid, change: F) -> BillingResult<SubscriptionDelta>
    where
        F: Fn(&SubscriptionRecord) -> Option<SubscriptionRecord> + Send + Sync,
    {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self
                .store
                .find_subscription_by_user(user_id)
                .await?
                .ok_or_else(|| {
                    BillingError::NoSubscription(format!("No subscription for user {}", user_id))
                })?;

            let Some(mut next) = change(&current) else {
                return Ok(SubscriptionDelta::new(&current, current.clone(), false));
            };

            if self
                .store
                .compare_and_swap_subscription(&next, current.version)
                .await?
            {
                next.version = current.version + 1;
                return Ok(SubscriptionDelta::new(&current, next, true));
            }

            tracing::warn!(
                user_id = %user_id,
                attempt = attempt,
                "Subscription changed concurrently, retrying"
            );
        }

        Err(BillingError::ConcurrentModification(format!(
            "Subscription for user {} kept changing after {} attempts",
            user_id, MAX_CAS_ATTEMPTS
        )))
    }

    /// Fetch the user's row, creating a `Pending` one if absent
    pub async fn ensure_subscription(
        &self,
        user_id: Uuid,
        provider: ProviderKind,
    ) -> BillingResult<SubscriptionRecord> {
        if let Some(existing) = self.store.find_subscription_by_user(user_id).await? {
            return Ok(existing);
        }

        let record = SubscriptionRecord::new(user_id, provider);
        match self.store.insert_subscription(&record).await {
            Ok(()) => {
                tracing::info!(user_id = %user_id, provider = %provider, "Created subscription record");
                Ok(record)
            }
            // Lost a race with a concurrent insert for the same user
            Err(BillingError::AlreadyExists(_)) => self
                .store
                .find_subscription_by_user(user_id)
                .await?
                .ok_or_else(|| {
                    BillingError::Internal(format!(
                        "Subscription for user {} vanished after conflict",
                        user_id
                    ))
                }),
            Err(e) => Err(e),
        }
    }
}
