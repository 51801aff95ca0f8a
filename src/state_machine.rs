//! Status transition table for deals. This is the single source of truth for
//! the legality of a status change; nothing else writes `Deal::status`.
use super::deal::{ActorRole, Deal, DealKind, DealStatus};
use super::error::Rejection;
use super::listing::Availability;
use super::notify::TransitionEvent;
use super::stamp::{Day, TimeStamp};

/// Apply a requested status change on behalf of an actor.
///
/// Edges, identical in shape for both kinds:
/// - opening status -> Confirmed: counterparty only, anchor strictly in the future
/// - opening status -> Cancelled: owner only
/// - Confirmed -> Completed: owner only
///
/// Everything else is refused with a reason. On success the deal carries the
/// new status and a stamp for it, and the returned event feeds the
/// notification dispatcher.
pub fn transition(
    mut deal: Deal,
    requested: DealStatus,
    actor: ActorRole,
    today: Day,
) -> Result<(Deal, TransitionEvent), Rejection> {
    let opening = DealStatus::initial(deal.kind);

    match (deal.status, requested) {
        (from, to) if from == opening && to == DealStatus::Confirmed => {
            if actor != ActorRole::Counterparty {
                return Err(Rejection::WrongActor);
            }
            if !deal.anchor.starts_after(today) {
                return Err(Rejection::StaleOffer);
            }
            deal.confirmed_at = Some(TimeStamp::new());
        }
        (from, to) if from == opening && to == DealStatus::Cancelled => {
            if actor != ActorRole::Owner {
                return Err(Rejection::WrongActor);
            }
            deal.cancelled_at = Some(TimeStamp::new());
        }
        (DealStatus::Confirmed, DealStatus::Completed) => {
            if actor != ActorRole::Owner {
                return Err(Rejection::WrongActor);
            }
            deal.completed_at = Some(TimeStamp::new());
        }
        (from, to) => {
            return Err(Rejection::WrongStatus {
                from,
                requested: to,
            });
        }
    }

    deal.status = requested;
    let event = TransitionEvent::from_deal(&deal);

    Ok((deal, event))
}

/// Availability consequence of a reached status. `None` leaves the listing's
/// tag untouched (a confirmation keeps the in-progress tag).
pub fn availability_after(kind: DealKind, status: DealStatus) -> Option<Availability> {
    match (kind, status) {
        (DealKind::Rental, DealStatus::Completed | DealStatus::Cancelled) => {
            Some(Availability::Available)
        }
        (DealKind::Purchase, DealStatus::Completed) => Some(Availability::Sold),
        (DealKind::Purchase, DealStatus::Cancelled) => Some(Availability::Available),
        _ => None,
    }
}

/// Availability set when a deal of the given kind is opened.
pub fn availability_on_open(kind: DealKind) -> Availability {
    match kind {
        DealKind::Rental => Availability::ActiveRental,
        DealKind::Purchase => Availability::PendingPurchase,
    }
}
