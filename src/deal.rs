//! Deal entity: a rental or purchase binding a listing, its owner and a
//! counterparty under a status lifecycle.
use super::error::Rejection;
use super::stamp::{Day, TimeStamp};
use super::utils;
use chrono::Utc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealKind {
    #[n(0)]
    Rental,
    #[n(1)]
    Purchase,
}

/// Pending is the opening status of a rental, Reserved of a purchase.
/// Completed and Cancelled are terminal for both kinds.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Reserved,
    #[n(2)]
    Confirmed,
    #[n(3)]
    Completed,
    #[n(4)]
    Cancelled,
}

impl DealStatus {
    pub fn initial(kind: DealKind) -> Self {
        match kind {
            DealKind::Rental => DealStatus::Pending,
            DealKind::Purchase => DealStatus::Reserved,
        }
    }
    pub fn is_terminal(self) -> bool {
        matches!(self, DealStatus::Completed | DealStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorRole {
    Owner,
    Counterparty,
}

/// Scheduling reference of a deal: a date range for rentals, a single deal
/// date for purchases. Drives both creation sanity checks and the
/// accept-time staleness guard.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    #[n(0)]
    Period {
        #[n(0)]
        start: Day,
        #[n(1)]
        end: Day,
    },
    #[n(1)]
    Date(#[n(0)] Day),
}

impl Anchor {
    /// Creation-time sanity: no past dates, and a rental must end strictly
    /// after it starts.
    pub fn validate(&self, kind: DealKind, today: Day) -> Result<(), Rejection> {
        match (kind, self) {
            (DealKind::Rental, Anchor::Period { start, end }) => {
                if *start < today || *end <= *start {
                    return Err(Rejection::InvalidAnchor);
                }
                Ok(())
            }
            (DealKind::Purchase, Anchor::Date(date)) => {
                if *date < today {
                    return Err(Rejection::InvalidAnchor);
                }
                Ok(())
            }
            _ => Err(Rejection::InvalidAnchor),
        }
    }

    /// Whether the anchor is still strictly in the future. Offers whose
    /// anchor has arrived or passed are stale and can no longer be accepted.
    pub fn starts_after(&self, today: Day) -> bool {
        match self {
            Anchor::Period { start, .. } => *start > today,
            Anchor::Date(date) => *date > today,
        }
    }

    /// Human-readable form used in generated message bodies.
    pub fn describe(&self) -> String {
        match self {
            Anchor::Period { start, end } => format!("from {start} to {end}"),
            Anchor::Date(date) => format!("on {date}"),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Deal {
    #[n(0)]
    pub id: String, // uuid7, bech32 "deal_" prefix
    #[n(1)]
    pub listing_id: String,
    #[n(2)]
    pub owner_id: String,
    #[n(3)]
    pub counterparty_id: String,
    #[n(4)]
    pub kind: DealKind,
    #[n(5)]
    pub status: DealStatus,
    #[n(6)]
    pub anchor: Anchor,
    // one stamp per status reached, nullable until reached
    #[n(7)]
    pub opened_at: TimeStamp<Utc>,
    #[n(8)]
    pub confirmed_at: Option<TimeStamp<Utc>>,
    #[n(9)]
    pub completed_at: Option<TimeStamp<Utc>>,
    #[n(10)]
    pub cancelled_at: Option<TimeStamp<Utc>>,
}

impl Deal {
    pub fn new(
        listing_id: String,
        owner_id: String,
        counterparty_id: String,
        kind: DealKind,
        anchor: Anchor,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            id: utils::new_deal_id()?,
            listing_id,
            owner_id,
            counterparty_id,
            kind,
            status: DealStatus::initial(kind),
            anchor,
            opened_at: TimeStamp::new(),
            confirmed_at: None,
            completed_at: None,
            cancelled_at: None,
        })
    }

    pub fn role_of(&self, actor_id: &str) -> Option<ActorRole> {
        if actor_id == self.owner_id {
            Some(ActorRole::Owner)
        } else if actor_id == self.counterparty_id {
            Some(ActorRole::Counterparty)
        } else {
            None
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
