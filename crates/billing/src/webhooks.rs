//! Webhook event decoding and dispatch.
//!
//! Gateway events arrive as JSON envelopes and are decoded into a typed
//! event before any handler runs; everything the billing core does not
//! react to decodes to [`WebhookEvent::Ignored`]. Handlers run on their own
//! task so a panic in one event cannot take the caller down. Events whose
//! handler fails are logged and dropped, there is no retry queue; the
//! balance job and the next webhook delivery re-converge the state.

use std::sync::Arc;

use crate::error::{BillingError, BillingResult};
use crate::subscriptions::SubscriptionService;

/// Decoded gateway event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    /// An invoice was paid; the subscription's organization gets (or keeps)
    /// its entitlements.
    InvoicePaid { subscription_id: String },
    /// A recurring charge needs user authentication.
    PaymentActionRequired {
        customer_id: String,
        payment_intent_id: String,
    },
    /// The subscription ended on the gateway side.
    SubscriptionDeleted { subscription_id: String },
    /// Event type the billing core does not react to.
    Ignored,
}

impl WebhookEvent {
    /// Decode the JSON envelope. Unknown event types are [`Self::Ignored`];
    /// a known type with missing fields is an error.
    pub fn decode(payload: &serde_json::Value) -> BillingResult<Self> {
        let event_type = payload["type"].as_str().unwrap_or_default();
        let object = &payload["data"]["object"];

        match event_type {
            "invoice.paid" => Ok(WebhookEvent::InvoicePaid {
                subscription_id: required_str(object, "subscription", event_type)?,
            }),
            "invoice.payment_action_required" => Ok(WebhookEvent::PaymentActionRequired {
                customer_id: required_str(object, "customer", event_type)?,
                payment_intent_id: required_str(object, "payment_intent", event_type)?,
            }),
            "customer.subscription.deleted" => Ok(WebhookEvent::SubscriptionDeleted {
                subscription_id: required_str(object, "id", event_type)?,
            }),
            _ => Ok(WebhookEvent::Ignored),
        }
    }
}

fn required_str(
    object: &serde_json::Value,
    field: &str,
    event_type: &str,
) -> BillingResult<String> {
    object[field]
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| {
            BillingError::Gateway(format!("webhook {event_type} is missing '{field}'"))
        })
}

/// Routes decoded events to the lifecycle controller.
pub struct WebhookDispatcher {
    service: Arc<SubscriptionService>,
}

impl WebhookDispatcher {
    pub fn new(service: Arc<SubscriptionService>) -> Self {
        Self { service }
    }

    /// Decode and handle one event.
    ///
    /// Returns an error only for payloads that cannot be decoded. Handler
    /// failures (including panics) are logged and the event is dropped.
    pub async fn dispatch(&self, payload: &serde_json::Value) -> BillingResult<()> {
        let event = WebhookEvent::decode(payload)?;
        if event == WebhookEvent::Ignored {
            return Ok(());
        }

        tracing::debug!(event = ?event, "dispatching webhook event");

        let service = self.service.clone();
        let described = format!("{event:?}");
        // Run the handler on its own task; a panicking handler surfaces as
        // a JoinError instead of unwinding into the caller.
        let handle = tokio::spawn(async move { handle_event(&service, event).await });

        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(event = %described, error = %e, "webhook handler failed, dropping event");
            }
            Err(e) => {
                tracing::error!(event = %described, error = %e, "webhook handler panicked, dropping event");
            }
        }

        Ok(())
    }
}

async fn handle_event(service: &SubscriptionService, event: WebhookEvent) -> BillingResult<()> {
    match event {
        WebhookEvent::InvoicePaid { subscription_id } => {
            service.invoice_paid(&subscription_id).await
        }
        WebhookEvent::PaymentActionRequired {
            customer_id,
            payment_intent_id,
        } => {
            service
                .payment_action_required(&customer_id, &payment_intent_id)
                .await
        }
        WebhookEvent::SubscriptionDeleted { subscription_id } => {
            service.downgrade(&subscription_id).await
        }
        WebhookEvent::Ignored => Ok(()),
    }
}
