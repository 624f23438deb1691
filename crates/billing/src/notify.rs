//! Admin notification mails for subscription lifecycle transitions.
//!
//! Lifecycle operations enqueue a notification after their state change is
//! persisted; delivery happens on a background task fed by a bounded queue.
//! Delivery failures are logged and never surfaced to the operation that
//! triggered them, and a full queue drops the notification rather than
//! blocking the lifecycle operation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use quill_shared::User;

const QUEUE_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
#[error("mail delivery failed: {0}")]
pub struct MailError(pub String);

/// Outbound mail capability.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError>;
}

/// Mailer that writes the mail to the log. Stands in where no mail
/// transport is configured.
#[derive(Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        tracing::info!(to = %to, subject = %subject, body = %body, "mail");
        Ok(())
    }
}

/// Lifecycle transition to notify organization admins about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Subscribed { organization_name: String },
    Cancelled { organization_name: String },
    Resumed { organization_name: String },
    PaymentActionRequired { organization_name: String },
    SubscriptionEnded { organization_name: String },
}

impl Notification {
    fn subject(&self) -> String {
        match self {
            Notification::Subscribed { organization_name } => {
                format!("Your subscription for {organization_name} is active")
            }
            Notification::Cancelled { organization_name } => {
                format!("Your subscription for {organization_name} was cancelled")
            }
            Notification::Resumed { organization_name } => {
                format!("Your subscription for {organization_name} was resumed")
            }
            Notification::PaymentActionRequired { organization_name } => {
                format!("Action required for your subscription for {organization_name}")
            }
            Notification::SubscriptionEnded { organization_name } => {
                format!("Your subscription for {organization_name} has ended")
            }
        }
    }

    fn body(&self) -> String {
        match self {
            Notification::Subscribed { organization_name } => format!(
                "Thank you for subscribing! {organization_name} is now on the paid plan."
            ),
            Notification::Cancelled { organization_name } => format!(
                "The subscription for {organization_name} was cancelled. It stays active \
                 until the end of the current billing period."
            ),
            Notification::Resumed { organization_name } => format!(
                "The cancellation for {organization_name} was revoked. The subscription \
                 continues as before."
            ),
            Notification::PaymentActionRequired { organization_name } => format!(
                "The latest payment for {organization_name} requires additional \
                 confirmation. Please open the billing settings to complete it."
            ),
            Notification::SubscriptionEnded { organization_name } => format!(
                "The subscription for {organization_name} has ended and the organization \
                 was moved back to the free plan."
            ),
        }
    }
}

struct Envelope {
    recipients: Vec<User>,
    notification: Notification,
}

/// Handle for enqueueing notifications.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Envelope>,
}

impl Notifier {
    /// Spawn the delivery worker and return the enqueue handle.
    pub fn spawn(mailer: Arc<dyn Mailer>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(deliver(mailer, rx));
        Self { tx }
    }

    /// Enqueue a notification for the given recipients. Drops it with a
    /// warning if the queue is full.
    pub fn notify(&self, recipients: Vec<User>, notification: Notification) {
        if recipients.is_empty() {
            return;
        }

        if let Err(e) = self.tx.try_send(Envelope {
            recipients,
            notification,
        }) {
            tracing::warn!(error = %e, "notification queue full, dropping notification");
        }
    }
}

async fn deliver(mailer: Arc<dyn Mailer>, mut rx: mpsc::Receiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        let subject = envelope.notification.subject();
        let body = envelope.notification.body();

        for recipient in &envelope.recipients {
            if let Err(e) = mailer.send(&recipient.email, &subject, &body).await {
                tracing::error!(
                    to = %recipient.email,
                    subject = %subject,
                    error = %e,
                    "failed to deliver notification mail"
                );
            }
        }
    }
}
