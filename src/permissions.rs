//! Role-aware capability evaluation.
//!
//! A pure function of the viewer's role and the listing's current deal
//! state. It owns no mutable state, touches no storage, and is total: every
//! input combination yields a defined capability set (default false), so the
//! whole domain can be enumerated in tests.
use super::deal::{Deal, DealKind, DealStatus};
use super::stamp::Day;

/// The actions a given viewer may currently perform on a given listing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CapabilitySet {
    pub can_add_rental: bool,
    pub can_edit_listing: bool,
    pub can_cancel_rental: bool,
    pub can_accept_rental: bool,
    pub can_complete_rental: bool,
    pub can_add_purchase: bool,
    pub can_cancel_purchase: bool,
    pub can_accept_purchase: bool,
    pub can_complete_purchase: bool,
    pub can_view_owner_inbox: bool,
}

/// Derive the capability set for a viewer.
///
/// `rental` and `purchase` are the listing's non-terminal deals of each kind,
/// if any; by invariant at most one of them is `Some`. Callers pass a deal
/// only when the viewer is entitled to see it (owner, or that deal's
/// counterparty). Terminal deals passed by mistake are ignored.
pub fn capabilities(
    viewer_is_owner: bool,
    rental: Option<&Deal>,
    purchase: Option<&Deal>,
    has_messages: bool,
    today: Day,
) -> CapabilitySet {
    let mut caps = CapabilitySet::default();

    let rental = rental.filter(|d| d.kind == DealKind::Rental && !d.is_terminal());
    let purchase = purchase.filter(|d| d.kind == DealKind::Purchase && !d.is_terminal());

    // owners only see an inbox affordance once there is something in it
    caps.can_view_owner_inbox = !viewer_is_owner || has_messages;

    if rental.is_none() && purchase.is_none() {
        if viewer_is_owner {
            caps.can_add_rental = true;
            caps.can_add_purchase = true;
            caps.can_edit_listing = true;
        }
        return caps;
    }

    if let Some(rental) = rental {
        match rental.status {
            DealStatus::Pending => {
                if viewer_is_owner {
                    caps.can_cancel_rental = true;
                } else {
                    // a stale offer degrades to "cannot accept"
                    caps.can_accept_rental = rental.anchor.starts_after(today);
                }
            }
            DealStatus::Confirmed => {
                caps.can_complete_rental = viewer_is_owner;
            }
            _ => {}
        }
    }

    if let Some(purchase) = purchase {
        match purchase.status {
            DealStatus::Reserved => {
                if viewer_is_owner {
                    caps.can_cancel_purchase = true;
                } else {
                    caps.can_accept_purchase = purchase.anchor.starts_after(today);
                }
            }
            DealStatus::Confirmed => {
                caps.can_complete_purchase = viewer_is_owner;
            }
            _ => {}
        }
    }

    caps
}
