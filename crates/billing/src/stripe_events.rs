//! Stripe notification normalization
//!
//! Payloads are decoded into minimal local structs rather than
//! `stripe::Event`, so newer Stripe API versions with extra or relocated
//! fields still parse. Only the fields the engine reads are declared.

use std::collections::HashMap;

use kindred_shared::{ProviderKind, SubscriptionStatus};
use serde::Deserialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::events::{
    from_unix_secs, EventKind, InvoiceOutcome, NormalizedEvent, OwnerRef, SubscriptionSnapshot,
};
use crate::store::{LedgerEntryType, LedgerStatus};
use crate::vocabulary::Vocabulary;

#[derive(Debug, Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: EnvelopeData,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    object: serde_json::Value,
}

/// Either a bare id or an expanded object carrying one
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Expandable {
    Id(String),
    Object { id: String },
}

impl Expandable {
    fn id(&self) -> &str {
        match self {
            Expandable::Id(id) => id,
            Expandable::Object { id } => id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct List<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Price {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Period {
    start: i64,
    end: i64,
}

#[derive(Debug, Deserialize)]
struct StripeSubscription {
    id: String,
    customer: Expandable,
    status: String,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
    #[serde(default)]
    cancel_at_period_end: bool,
    items: Option<List<SubscriptionItem>>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionItem {
    price: Option<Price>,
    // Newer API versions moved the period onto the item
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct StripeInvoice {
    id: Option<String>,
    customer: Option<Expandable>,
    subscription: Option<Expandable>,
    parent: Option<InvoiceParent>,
    #[serde(default)]
    amount_paid: i64,
    #[serde(default)]
    amount_due: i64,
    currency: Option<String>,
    description: Option<String>,
    hosted_invoice_url: Option<String>,
    invoice_pdf: Option<String>,
    period_start: Option<i64>,
    period_end: Option<i64>,
    lines: Option<List<InvoiceLine>>,
}

#[derive(Debug, Deserialize)]
struct InvoiceParent {
    subscription_details: Option<SubscriptionDetails>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionDetails {
    subscription: Option<Expandable>,
}

#[derive(Debug, Deserialize)]
struct InvoiceLine {
    period: Option<Period>,
    price: Option<Price>,
    pricing: Option<LinePricing>,
}

#[derive(Debug, Deserialize)]
struct LinePricing {
    price_details: Option<PriceDetails>,
}

#[derive(Debug, Deserialize)]
struct PriceDetails {
    price: Option<String>,
}

impl InvoiceLine {
    fn price_ref(&self) -> Option<&str> {
        self.price.as_ref().map(|p| p.id.as_str()).or_else(|| {
            self.pricing
                .as_ref()
                .and_then(|p| p.price_details.as_ref())
                .and_then(|d| d.price.as_deref())
        })
    }
}

impl StripeInvoice {
    fn subscription_ref(&self) -> Option<String> {
        self.subscription
            .as_ref()
            .or_else(|| {
                self.parent
                    .as_ref()
                    .and_then(|p| p.subscription_details.as_ref())
                    .and_then(|d| d.subscription.as_ref())
            })
            .map(|s| s.id().to_string())
    }

    fn first_line(&self) -> Option<&InvoiceLine> {
        self.lines.as_ref().and_then(|l| l.data.first())
    }

    /// Service period of the invoice's subscription line
    fn service_period(&self) -> BillingResult<(Option<OffsetDateTime>, Option<OffsetDateTime>)> {
        let (start, end) = match self.first_line().and_then(|l| l.period.as_ref()) {
            Some(period) => (Some(period.start), Some(period.end)),
            None => (self.period_start, self.period_end),
        };
        checked_period(start, end)
    }
}

/// `charge.invoice`, either a bare id or the expanded invoice
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChargeInvoice {
    Id(String),
    Expanded(Box<StripeInvoice>),
}

impl ChargeInvoice {
    fn id(&self) -> Option<String> {
        match self {
            ChargeInvoice::Id(id) => Some(id.clone()),
            ChargeInvoice::Expanded(invoice) => invoice.id.clone(),
        }
    }

    fn subscription_ref(&self) -> Option<String> {
        match self {
            ChargeInvoice::Id(_) => None,
            ChargeInvoice::Expanded(invoice) => invoice.subscription_ref(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StripeCharge {
    id: String,
    customer: Option<Expandable>,
    invoice: Option<ChargeInvoice>,
    payment_intent: Option<Expandable>,
    #[serde(default)]
    amount: i64,
    #[serde(default)]
    amount_refunded: i64,
    #[serde(default)]
    refunded: bool,
    currency: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CheckoutSession {
    id: String,
    mode: Option<String>,
    payment_status: Option<String>,
    customer: Option<Expandable>,
    payment_intent: Option<Expandable>,
    amount_total: Option<i64>,
    currency: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

/// Minimal view of a Stripe event used by ingestion
#[derive(Debug, Clone)]
pub struct StripeEventHeader {
    pub id: String,
    pub event_type: String,
    pub created: OffsetDateTime,
}

/// Read the envelope id, type and timestamp without interpreting the object
pub fn parse_header(payload: &serde_json::Value) -> BillingResult<StripeEventHeader> {
    let envelope: Envelope = serde_json::from_value(payload.clone())
        .map_err(|e| BillingError::InvalidPayload(format!("Stripe event envelope: {}", e)))?;
    let created = from_unix_secs(envelope.created).ok_or_else(|| {
        BillingError::InvalidPayload(format!("Invalid event timestamp {}", envelope.created))
    })?;
    Ok(StripeEventHeader {
        id: envelope.id,
        event_type: envelope.event_type,
        created,
    })
}

fn decode<T: serde::de::DeserializeOwned>(object: serde_json::Value, what: &str) -> BillingResult<T> {
    serde_json::from_value(object)
        .map_err(|e| BillingError::MalformedPayload(format!("Unexpected {} shape: {}", what, e)))
}

fn checked_period(
    start: Option<i64>,
    end: Option<i64>,
) -> BillingResult<(Option<OffsetDateTime>, Option<OffsetDateTime>)> {
    let parse = |secs: Option<i64>| -> BillingResult<Option<OffsetDateTime>> {
        secs.map(|s| {
            from_unix_secs(s)
                .ok_or_else(|| BillingError::MalformedPayload(format!("Invalid timestamp {}", s)))
        })
        .transpose()
    };
    let (start, end) = (parse(start)?, parse(end)?);
    if let (Some(start), Some(end)) = (start, end) {
        if end < start {
            return Err(BillingError::MalformedPayload(format!(
                "Period ends ({}) before it starts ({})",
                end, start
            )));
        }
    }
    Ok((start, end))
}

fn owner_of(customer: Option<&Expandable>) -> OwnerRef {
    customer.map_or(OwnerRef::Unknown, |c| OwnerRef::Customer(c.id().to_string()))
}

/// Translate a verified Stripe event into a [`NormalizedEvent`]
pub fn normalize(payload: &serde_json::Value, vocab: &Vocabulary) -> BillingResult<NormalizedEvent> {
    let header = parse_header(payload)?;
    let envelope: Envelope = serde_json::from_value(payload.clone())
        .map_err(|e| BillingError::MalformedPayload(e.to_string()))?;
    let object = envelope.data.object;

    let mut event = NormalizedEvent {
        provider: ProviderKind::Stripe,
        provider_event_ref: header.id,
        event_type: header.event_type.clone(),
        occurred_at: header.created,
        owner: OwnerRef::Unknown,
        subscription_ref: None,
        kind: EventKind::Unhandled {
            event_type: header.event_type.clone(),
        },
        invoice: None,
    };

    match header.event_type.as_str() {
        "customer.subscription.created"
        | "customer.subscription.updated"
        | "customer.subscription.deleted" => {
            let sub: StripeSubscription = decode(object, "subscription")?;
            event.owner = OwnerRef::Customer(sub.customer.id().to_string());
            event.subscription_ref = Some(sub.id.clone());
            event.kind = match header.event_type.as_str() {
                "customer.subscription.deleted" => EventKind::SubscriptionDeleted,
                "customer.subscription.created" => {
                    EventKind::SubscriptionCreated(subscription_snapshot(&sub, vocab)?)
                }
                _ => EventKind::SubscriptionUpdated(subscription_snapshot(&sub, vocab)?),
            };
        }
        "invoice.paid"
        | "invoice.payment_succeeded"
        | "invoice.payment_failed"
        | "invoice.created"
        | "invoice.finalized"
        | "invoice.voided"
        | "invoice.marked_uncollectible" => {
            let invoice: StripeInvoice = decode(object, "invoice")?;
            let invoice_ref = invoice.id.clone().ok_or_else(|| {
                BillingError::MalformedPayload("Invoice without an id".to_string())
            })?;
            let subscription_ref = invoice.subscription_ref();
            let (period_start, period_end) = invoice.service_period()?;

            let (status, amount) = match header.event_type.as_str() {
                "invoice.paid" | "invoice.payment_succeeded" => {
                    (LedgerStatus::Paid, invoice.amount_paid)
                }
                "invoice.payment_failed" | "invoice.finalized" => {
                    (LedgerStatus::Open, invoice.amount_due)
                }
                "invoice.voided" => (LedgerStatus::Void, invoice.amount_due),
                "invoice.marked_uncollectible" => (LedgerStatus::Uncollectible, invoice.amount_due),
                _ => (LedgerStatus::Draft, invoice.amount_due),
            };

            event.kind = match (status, subscription_ref.is_some(), period_end) {
                (LedgerStatus::Paid, true, Some(period_end)) => EventKind::RenewalSucceeded {
                    period_start,
                    period_end,
                    tier: invoice
                        .first_line()
                        .and_then(InvoiceLine::price_ref)
                        .and_then(|p| vocab.known_price_tier(p)),
                },
                _ if header.event_type == "invoice.payment_failed" && subscription_ref.is_some() => {
                    EventKind::RenewalFailed
                }
                _ => EventKind::InvoiceRecorded,
            };

            event.owner = owner_of(invoice.customer.as_ref());
            event.subscription_ref = subscription_ref;
            event.invoice = Some(InvoiceOutcome {
                invoice_ref,
                entry_type: if event.subscription_ref.is_some() {
                    LedgerEntryType::SubscriptionInvoice
                } else {
                    LedgerEntryType::OneTimePurchase
                },
                amount_cents: amount,
                currency: invoice.currency,
                status,
                period_start,
                period_end,
                subscription_ref: event.subscription_ref.clone(),
                description: invoice.description,
                hosted_invoice_url: invoice.hosted_invoice_url,
                invoice_pdf_url: invoice.invoice_pdf,
            });
        }
        "charge.refunded" => {
            let charge: StripeCharge = decode(object, "charge")?;
            let full = charge.refunded || charge.amount_refunded >= charge.amount;
            let invoice_ref = charge.invoice.as_ref().and_then(ChargeInvoice::id);
            let payment_ref = charge.payment_intent.as_ref().map(|p| p.id().to_string());

            event.owner = owner_of(charge.customer.as_ref());
            // Unexpanded invoices are linked through the ledger when processed
            event.subscription_ref = charge.invoice.as_ref().and_then(ChargeInvoice::subscription_ref);
            let transaction_ref = payment_ref.clone().unwrap_or_else(|| charge.id.clone());
            event.kind = if full {
                EventKind::Refunded {
                    transaction_ref,
                    affects_subscription: invoice_ref.is_some(),
                }
            } else {
                EventKind::PartialRefund {
                    transaction_ref,
                    amount_refunded: charge.amount_refunded,
                }
            };
            if full {
                // One-time purchases are keyed by payment intent
                let ledger_key = invoice_ref.clone().or(payment_ref).map(|key| {
                    let entry_type = if invoice_ref.is_some() {
                        LedgerEntryType::SubscriptionInvoice
                    } else {
                        LedgerEntryType::OneTimePurchase
                    };
                    (key, entry_type)
                });
                event.invoice = ledger_key.map(|(key, entry_type)| {
                    let mut outcome =
                        InvoiceOutcome::new(key, entry_type, charge.amount, LedgerStatus::Refunded);
                    outcome.currency = charge.currency.clone();
                    outcome.subscription_ref = event.subscription_ref.clone();
                    outcome
                });
            }
        }
        "checkout.session.completed" => {
            let session: CheckoutSession = decode(object, "checkout session")?;
            let paid = matches!(
                session.payment_status.as_deref(),
                None | Some("paid") | Some("no_payment_required")
            );
            if session.mode.as_deref() == Some("payment") && paid {
                let product_ref = session
                    .metadata
                    .get("product_ref")
                    .or_else(|| session.metadata.get("product_id"))
                    .cloned()
                    .ok_or_else(|| {
                        BillingError::MalformedPayload(format!(
                            "Checkout session {} has no product_ref metadata",
                            session.id
                        ))
                    })?;
                let transaction_ref = session
                    .payment_intent
                    .as_ref()
                    .map(|p| p.id().to_string())
                    .unwrap_or_else(|| session.id.clone());

                event.owner = owner_of(session.customer.as_ref());
                event.kind = EventKind::ConsumablePurchased {
                    transaction_ref: transaction_ref.clone(),
                    grant: vocab.consumable(&product_ref),
                    product_ref: product_ref.clone(),
                };
                let mut outcome = InvoiceOutcome::new(
                    transaction_ref,
                    LedgerEntryType::OneTimePurchase,
                    session.amount_total.unwrap_or(0),
                    LedgerStatus::Paid,
                );
                outcome.currency = session.currency;
                outcome.description = Some(product_ref);
                event.invoice = Some(outcome);
            }
        }
        _ => {}
    }

    Ok(event)
}

fn subscription_snapshot(
    sub: &StripeSubscription,
    vocab: &Vocabulary,
) -> BillingResult<SubscriptionSnapshot> {
    let item = sub.items.as_ref().and_then(|items| items.data.first());
    let price_ref = item.and_then(|i| i.price.as_ref()).map(|p| p.id.clone());
    let (period_start, period_end) = checked_period(
        sub.current_period_start
            .or_else(|| item.and_then(|i| i.current_period_start)),
        sub.current_period_end
            .or_else(|| item.and_then(|i| i.current_period_end)),
    )?;

    let status = vocab.map_status(ProviderKind::Stripe, &sub.status);
    let tier = match &price_ref {
        Some(price) => vocab.tier_for_price(price),
        None => {
            tracing::warn!(subscription_ref = %sub.id, "Subscription has no price, using lowest tier");
            kindred_shared::Tier::lowest()
        }
    };

    Ok(SubscriptionSnapshot {
        status,
        tier,
        plan_ref: price_ref,
        subscription_ref: Some(sub.id.clone()),
        customer_ref: Some(sub.customer.id().to_string()),
        original_transaction_ref: None,
        period_start,
        period_end,
        cancel_at_period_end: sub.cancel_at_period_end && status != SubscriptionStatus::Cancelled,
        auto_renew: !sub.cancel_at_period_end,
        is_trial: sub.status.trim().eq_ignore_ascii_case("trialing"),
    })
}
