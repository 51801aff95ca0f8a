//! Notification fan-out for deal transitions.
//!
//! The routing is a fixed, declared table from reached status to recipient
//! and content key. Each intent produces one persisted [`Message`] (the
//! authoritative record) and one best-effort call to the external
//! [`Delivery`] collaborator. Fan-out runs at most once per
//! (deal, resulting status) pair.
use super::deal::{Anchor, Deal, DealKind, DealStatus};
use super::error::DeliveryError;
use super::stamp::TimeStamp;
use super::utils;
use chrono::Utc;
use sled::Batch;
use std::sync::Arc;
use tracing::{debug, warn};

/// What happened: a deal reached a status. Carries everything the
/// dispatcher needs so it never re-reads the deal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionEvent {
    pub deal_id: String,
    pub listing_id: String,
    pub owner_id: String,
    pub counterparty_id: String,
    pub kind: DealKind,
    pub status: DealStatus,
    pub anchor: Anchor,
}

impl TransitionEvent {
    pub fn from_deal(deal: &Deal) -> Self {
        Self {
            deal_id: deal.id.clone(),
            listing_id: deal.listing_id.clone(),
            owner_id: deal.owner_id.clone(),
            counterparty_id: deal.counterparty_id.clone(),
            kind: deal.kind,
            status: deal.status,
            anchor: deal.anchor,
        }
    }
}

/// Template key handed to the delivery collaborator. Rendering is not this
/// crate's concern; the key plus the event is enough to compose a mail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKey {
    OwnerListed,
    CounterpartyOffer,
    OwnerAccepted,
    CounterpartyAccepted,
    OwnerCompleted,
    OwnerCancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recipient {
    Owner,
    Counterparty,
}

/// The fixed transition -> recipients table.
fn route(status: DealStatus) -> &'static [(Recipient, ContentKey)] {
    match status {
        DealStatus::Pending | DealStatus::Reserved => &[
            (Recipient::Owner, ContentKey::OwnerListed),
            (Recipient::Counterparty, ContentKey::CounterpartyOffer),
        ],
        DealStatus::Confirmed => &[
            (Recipient::Owner, ContentKey::OwnerAccepted),
            (Recipient::Counterparty, ContentKey::CounterpartyAccepted),
        ],
        DealStatus::Completed => &[(Recipient::Owner, ContentKey::OwnerCompleted)],
        DealStatus::Cancelled => &[(Recipient::Owner, ContentKey::OwnerCancelled)],
    }
}

fn body_for(key: ContentKey, kind: DealKind, anchor: &Anchor) -> String {
    let noun = match kind {
        DealKind::Rental => "Rental",
        DealKind::Purchase => "Purchase",
    };
    let when = anchor.describe();
    match key {
        ContentKey::OwnerListed => match kind {
            DealKind::Rental => format!("You added a rental. Period of rental is {when}."),
            DealKind::Purchase => format!("You made a purchase reservation. Deal date is {when}."),
        },
        ContentKey::CounterpartyOffer => match kind {
            DealKind::Rental => format!("Rental has been offered. Period of rental is {when}."),
            DealKind::Purchase => format!("Purchase has been reserved. Deal date is {when}."),
        },
        ContentKey::OwnerAccepted => format!("{noun} has been accepted, {when}."),
        ContentKey::CounterpartyAccepted => format!("You accepted a {} offer, {when}.", noun.to_lowercase()),
        ContentKey::OwnerCompleted => format!("{noun} has been completed."),
        ContentKey::OwnerCancelled => format!("{noun} has been cancelled."),
    }
}

fn status_tag(status: DealStatus) -> &'static str {
    match status {
        DealStatus::Pending => "pending",
        DealStatus::Reserved => "reserved",
        DealStatus::Confirmed => "confirmed",
        DealStatus::Completed => "completed",
        DealStatus::Cancelled => "cancelled",
    }
}

/// In-app counterpart of an outbound notification, authored by the fixed
/// system identity. Its read flag belongs to the messaging UI.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub sender_id: String,
    #[n(2)]
    pub recipient_id: String,
    #[n(3)]
    pub listing_id: String,
    #[n(4)]
    pub counterparty_id: String,
    #[n(5)]
    pub subject: String,
    #[n(6)]
    pub body: String,
    #[n(7)]
    pub sent_at: TimeStamp<Utc>,
    #[n(8)]
    pub is_read: bool,
}

/// Outbound side of the fan-out. Implemented by the excluded mail layer;
/// tests substitute a recorder.
pub trait Delivery: Send + Sync {
    fn send(
        &self,
        recipient_id: &str,
        key: ContentKey,
        event: &TransitionEvent,
    ) -> Result<(), DeliveryError>;
}

pub struct Dispatcher {
    instance: Arc<sled::Db>,
    delivery: Arc<dyn Delivery>,
    system_sender_id: String,
}

impl Dispatcher {
    pub fn new(
        instance: Arc<sled::Db>,
        delivery: Arc<dyn Delivery>,
        system_sender_id: String,
    ) -> Self {
        Self {
            instance,
            delivery,
            system_sender_id,
        }
    }

    fn marker_key(event: &TransitionEvent) -> String {
        format!("sent/{}/{}", event.deal_id, status_tag(event.status))
    }

    /// Run the fan-out for a transition. Idempotent per
    /// (deal id, resulting status): a repeated call is a no-op.
    ///
    /// Messages and the dispatch marker commit in one batch before any
    /// outbound send, so a delivery failure can never lose the in-app
    /// record. Delivery errors are logged and swallowed.
    pub fn notify(&self, event: &TransitionEvent) -> anyhow::Result<Vec<Message>> {
        let marker = Self::marker_key(event);
        if self.instance.get(marker.as_bytes())?.is_some() {
            debug!(deal = %event.deal_id, status = status_tag(event.status),
                "duplicate transition fan-out suppressed");
            return Ok(Vec::new());
        }

        let intents = route(event.status);

        let mut batch = Batch::default();
        let mut messages = Vec::with_capacity(intents.len());
        for (recipient, key) in intents {
            let recipient_id = match recipient {
                Recipient::Owner => event.owner_id.clone(),
                Recipient::Counterparty => event.counterparty_id.clone(),
            };
            let message = Message {
                id: utils::new_message_id()?,
                sender_id: self.system_sender_id.clone(),
                recipient_id,
                listing_id: event.listing_id.clone(),
                counterparty_id: event.counterparty_id.clone(),
                subject: "Admin".to_owned(),
                body: body_for(*key, event.kind, &event.anchor),
                sent_at: TimeStamp::new(),
                is_read: false,
            };
            batch.insert(
                format!("msg/{}/{}", event.listing_id, message.id).into_bytes(),
                minicbor::to_vec(&message)?,
            );
            messages.push(message);
        }
        batch.insert(marker.into_bytes(), &[1][..]);
        self.instance.apply_batch(batch)?;

        for (message, (_, key)) in messages.iter().zip(intents) {
            if let Err(err) = self.delivery.send(&message.recipient_id, *key, event) {
                warn!(deal = %event.deal_id, recipient = %message.recipient_id,
                    error = %err, "outbound delivery failed, message record kept");
            }
        }

        Ok(messages)
    }

    /// Whether any message exists for the listing. Feeds the owner-inbox
    /// capability.
    pub fn has_messages(&self, listing_id: &str) -> anyhow::Result<bool> {
        let prefix = format!("msg/{listing_id}/");
        Ok(self.instance.scan_prefix(prefix.as_bytes()).next().is_some())
    }

    /// All messages recorded for a listing, in insertion order.
    pub fn messages_for(&self, listing_id: &str) -> anyhow::Result<Vec<Message>> {
        let prefix = format!("msg/{listing_id}/");
        let mut out = Vec::new();
        for entry in self.instance.scan_prefix(prefix.as_bytes()) {
            let (_, raw) = entry?;
            out.push(minicbor::decode(&raw)?);
        }
        Ok(out)
    }
}
