use anyhow::Context;
use dealbroker::deal::{Anchor, DealKind, DealStatus};
use dealbroker::error::{DeliveryError, Rejection};
use dealbroker::listing::{Availability, Condition, ListingFields};
use dealbroker::notify::{ContentKey, Delivery, TransitionEvent};
use dealbroker::service::DealService;
use dealbroker::stamp::Day;
use dealbroker::utils;
use sled::open;
use std::sync::Arc;

use tempfile::tempdir; // Use for test db cleanup.

struct NoopDelivery;

impl Delivery for NoopDelivery {
    fn send(
        &self,
        _recipient_id: &str,
        _key: ContentKey,
        _event: &TransitionEvent,
    ) -> Result<(), DeliveryError> {
        Ok(())
    }
}

// Sled uses file-based locking to prevent concurrent access, so each test
// opens its own database under a tempdir for simplified cleanup.
fn new_service(dir: &tempfile::TempDir, name: &str) -> anyhow::Result<DealService> {
    let db = open(dir.path().join(name))?;
    let db = Arc::new(db);
    db.clear()?;

    Ok(DealService::new(
        db,
        Arc::new(NoopDelivery),
        utils::new_uuid_to_bech32("user_")?,
    ))
}

fn drill_fields() -> ListingFields {
    ListingFields::new()
        .set_title("Cordless drill")
        .set_description("18V, two batteries")
        .set_category("Tools")
        .set_condition(Condition::Good)
        .set_price_per_day(500)
        .set_deposit(2_000)
}

fn rejection(err: &anyhow::Error) -> Option<&Rejection> {
    err.downcast_ref::<Rejection>()
}

#[test]
fn rental_offer_accept_complete() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let service = new_service(&temp_dir, "rental_lifecycle.db")?;

    let owner = utils::new_uuid_to_bech32("user_")?;
    let renter = utils::new_uuid_to_bech32("user_")?;
    let today = Day::today();

    let listing = service.create_listing(owner.clone(), drill_fields())?;
    assert_eq!(listing.availability, Availability::Available);

    // Scenario A: offer a rental, have the renter accept it
    let deal = service
        .create_deal(
            &listing.id,
            &owner,
            &renter,
            DealKind::Rental,
            Anchor::Period {
                start: today.offset(1),
                end: today.offset(2),
            },
        )
        .context("Deal failed on creation: ")?;

    assert_eq!(deal.status, DealStatus::Pending);
    assert_eq!(
        service.listing(&listing.id)?.availability,
        Availability::ActiveRental
    );

    let deal = service
        .advance(&deal.id, DealStatus::Confirmed, &renter)
        .context("Deal failed on acceptance: ")?;
    assert_eq!(deal.status, DealStatus::Confirmed);
    assert!(deal.confirmed_at.is_some());

    let caps = service.get_capabilities(&listing.id, &owner)?;
    assert!(caps.can_complete_rental);
    assert!(!caps.can_add_rental);
    assert!(!caps.can_edit_listing);

    let deal = service.advance(&deal.id, DealStatus::Completed, &owner)?;
    assert_eq!(deal.status, DealStatus::Completed);
    assert_eq!(
        service.listing(&listing.id)?.availability,
        Availability::Available
    );

    // the listing is rentable again
    let caps = service.get_capabilities(&listing.id, &owner)?;
    assert!(caps.can_add_rental && caps.can_add_purchase && caps.can_edit_listing);

    Ok(())
}

#[test]
fn purchase_reserve_accept_complete_sells_the_listing() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let service = new_service(&temp_dir, "purchase_lifecycle.db")?;

    let owner = utils::new_uuid_to_bech32("user_")?;
    let buyer = utils::new_uuid_to_bech32("user_")?;
    let today = Day::today();

    let listing = service.create_listing(owner.clone(), drill_fields())?;
    let deal = service.create_deal(
        &listing.id,
        &owner,
        &buyer,
        DealKind::Purchase,
        Anchor::Date(today.offset(3)),
    )?;
    assert_eq!(deal.status, DealStatus::Reserved);
    assert_eq!(
        service.listing(&listing.id)?.availability,
        Availability::PendingPurchase
    );

    let deal = service.advance(&deal.id, DealStatus::Confirmed, &buyer)?;
    let deal = service.advance(&deal.id, DealStatus::Completed, &owner)?;
    assert_eq!(deal.status, DealStatus::Completed);
    assert_eq!(service.listing(&listing.id)?.availability, Availability::Sold);

    // a sold listing accepts no further deals of either kind
    let err = service
        .create_deal(
            &listing.id,
            &owner,
            &buyer,
            DealKind::Rental,
            Anchor::Period {
                start: today.offset(1),
                end: today.offset(2),
            },
        )
        .unwrap_err();
    assert_eq!(rejection(&err), Some(&Rejection::Unavailable));

    Ok(())
}

#[test]
fn stale_offer_cannot_be_accepted() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let service = new_service(&temp_dir, "stale_offer.db")?;

    let owner = utils::new_uuid_to_bech32("user_")?;
    let renter = utils::new_uuid_to_bech32("user_")?;
    let today = Day::today();

    let listing = service.create_listing(owner.clone(), drill_fields())?;

    // Scenario B: a rental starting today is creatable but already stale
    let deal = service.create_deal(
        &listing.id,
        &owner,
        &renter,
        DealKind::Rental,
        Anchor::Period {
            start: today,
            end: today.offset(2),
        },
    )?;

    let err = service
        .advance(&deal.id, DealStatus::Confirmed, &renter)
        .unwrap_err();
    assert_eq!(rejection(&err), Some(&Rejection::StaleOffer));

    // rejection never mutates status
    assert_eq!(service.deal(&deal.id)?.status, DealStatus::Pending);

    // and the capability view degrades rather than throwing
    let caps = service.get_capabilities(&listing.id, &renter)?;
    assert!(!caps.can_accept_rental);

    // the owner can still walk away
    let deal = service.advance(&deal.id, DealStatus::Cancelled, &owner)?;
    assert_eq!(deal.status, DealStatus::Cancelled);

    Ok(())
}

#[test]
fn deal_creation_guards() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let service = new_service(&temp_dir, "creation_guards.db")?;

    let owner = utils::new_uuid_to_bech32("user_")?;
    let renter = utils::new_uuid_to_bech32("user_")?;
    let stranger = utils::new_uuid_to_bech32("user_")?;
    let today = Day::today();
    let anchor = Anchor::Period {
        start: today.offset(1),
        end: today.offset(2),
    };

    let listing = service.create_listing(owner.clone(), drill_fields())?;

    // self-dealing
    let err = service
        .create_deal(&listing.id, &owner, &owner, DealKind::Rental, anchor)
        .unwrap_err();
    assert_eq!(rejection(&err), Some(&Rejection::SelfDeal));

    // only the listing owner opens deals on it
    let err = service
        .create_deal(&listing.id, &stranger, &renter, DealKind::Rental, anchor)
        .unwrap_err();
    assert_eq!(rejection(&err), Some(&Rejection::WrongActor));

    // anchor sanity is core guard logic, not a form concern
    let err = service
        .create_deal(
            &listing.id,
            &owner,
            &renter,
            DealKind::Rental,
            Anchor::Period {
                start: today.offset(-1),
                end: today.offset(2),
            },
        )
        .unwrap_err();
    assert_eq!(rejection(&err), Some(&Rejection::InvalidAnchor));

    let err = service
        .create_deal(
            &listing.id,
            &owner,
            &renter,
            DealKind::Purchase,
            Anchor::Date(today.offset(-2)),
        )
        .unwrap_err();
    assert_eq!(rejection(&err), Some(&Rejection::InvalidAnchor));

    // a second deal while one is open
    service.create_deal(&listing.id, &owner, &renter, DealKind::Rental, anchor)?;
    let err = service
        .create_deal(
            &listing.id,
            &owner,
            &renter,
            DealKind::Purchase,
            Anchor::Date(today.offset(1)),
        )
        .unwrap_err();
    assert_eq!(rejection(&err), Some(&Rejection::Unavailable));

    Ok(())
}

#[test]
fn advance_refuses_outsiders_and_wrong_roles() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let service = new_service(&temp_dir, "advance_guards.db")?;

    let owner = utils::new_uuid_to_bech32("user_")?;
    let renter = utils::new_uuid_to_bech32("user_")?;
    let stranger = utils::new_uuid_to_bech32("user_")?;
    let today = Day::today();

    let listing = service.create_listing(owner.clone(), drill_fields())?;
    let deal = service.create_deal(
        &listing.id,
        &owner,
        &renter,
        DealKind::Rental,
        Anchor::Period {
            start: today.offset(1),
            end: today.offset(2),
        },
    )?;

    // someone who is neither party
    let err = service
        .advance(&deal.id, DealStatus::Confirmed, &stranger)
        .unwrap_err();
    assert_eq!(rejection(&err), Some(&Rejection::WrongActor));

    // the owner cannot accept their own offer
    let err = service
        .advance(&deal.id, DealStatus::Confirmed, &owner)
        .unwrap_err();
    assert_eq!(rejection(&err), Some(&Rejection::WrongActor));

    // the renter cannot cancel
    let err = service
        .advance(&deal.id, DealStatus::Cancelled, &renter)
        .unwrap_err();
    assert_eq!(rejection(&err), Some(&Rejection::WrongActor));

    // skipping straight to completed
    let err = service
        .advance(&deal.id, DealStatus::Completed, &owner)
        .unwrap_err();
    assert!(matches!(
        rejection(&err),
        Some(&Rejection::WrongStatus { .. })
    ));

    // nothing moved
    assert_eq!(service.deal(&deal.id)?.status, DealStatus::Pending);

    Ok(())
}

#[test]
fn save_and_undo_walk_history_backward() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let service = new_service(&temp_dir, "undo_history.db")?;

    let owner = utils::new_uuid_to_bech32("user_")?;

    // Scenario D: three saved states, then undo until the floor
    let listing = service.create_listing(owner.clone(), drill_fields())?;
    let f0 = listing.fields.clone();

    let f1 = drill_fields().set_description("18V, one battery");
    service.save_listing(&listing.id, f1.clone())?;

    let f2 = drill_fields().set_price_per_day(450);
    service.save_listing(&listing.id, f2.clone())?;

    assert_eq!(service.listing(&listing.id)?.fields, f2);

    let restored = service.undo_listing(&listing.id)?;
    assert_eq!(restored.fields, f1);

    let restored = service.undo_listing(&listing.id)?;
    assert_eq!(restored.fields, f0);

    // the very first save is the floor
    let err = service.undo_listing(&listing.id).unwrap_err();
    assert_eq!(rejection(&err), Some(&Rejection::NoFurtherHistory));
    assert_eq!(service.listing(&listing.id)?.fields, f0);

    Ok(())
}

#[test]
fn edits_locked_while_a_deal_is_open() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let service = new_service(&temp_dir, "edit_lock.db")?;

    let owner = utils::new_uuid_to_bech32("user_")?;
    let renter = utils::new_uuid_to_bech32("user_")?;
    let today = Day::today();

    let listing = service.create_listing(owner.clone(), drill_fields())?;
    service.save_listing(&listing.id, drill_fields().set_price_per_day(450))?;

    let deal = service.create_deal(
        &listing.id,
        &owner,
        &renter,
        DealKind::Rental,
        Anchor::Period {
            start: today.offset(1),
            end: today.offset(2),
        },
    )?;

    let err = service
        .save_listing(&listing.id, drill_fields().set_price_per_day(400))
        .unwrap_err();
    assert_eq!(rejection(&err), Some(&Rejection::Unavailable));

    let err = service.undo_listing(&listing.id).unwrap_err();
    assert_eq!(rejection(&err), Some(&Rejection::Unavailable));

    // cancelling the deal unlocks editing again
    service.advance(&deal.id, DealStatus::Cancelled, &owner)?;
    assert!(service.undo_listing(&listing.id).is_ok());

    Ok(())
}

#[test]
fn concurrent_creations_pick_one_winner() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let service = Arc::new(new_service(&temp_dir, "create_race.db")?);

    let owner = utils::new_uuid_to_bech32("user_")?;
    let renter = utils::new_uuid_to_bech32("user_")?;
    let buyer = utils::new_uuid_to_bech32("user_")?;
    let today = Day::today();

    let listing = service.create_listing(owner.clone(), drill_fields())?;

    // Scenario C: a rental offer and a purchase reservation race
    let (rental_res, purchase_res) = std::thread::scope(|scope| {
        let rental = scope.spawn(|| {
            service.create_deal(
                &listing.id,
                &owner,
                &renter,
                DealKind::Rental,
                Anchor::Period {
                    start: today.offset(1),
                    end: today.offset(2),
                },
            )
        });
        let purchase = scope.spawn(|| {
            service.create_deal(
                &listing.id,
                &owner,
                &buyer,
                DealKind::Purchase,
                Anchor::Date(today.offset(1)),
            )
        });
        (rental.join().unwrap(), purchase.join().unwrap())
    });

    let winners = [&rental_res, &purchase_res]
        .iter()
        .filter(|res| res.is_ok())
        .count();
    assert_eq!(winners, 1, "exactly one racing creation may succeed");

    let loser = if rental_res.is_ok() {
        purchase_res.unwrap_err()
    } else {
        rental_res.unwrap_err()
    };
    assert_eq!(rejection(&loser), Some(&Rejection::Unavailable));

    Ok(())
}

#[test]
fn third_party_sees_no_deal_affordances() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let service = new_service(&temp_dir, "third_party.db")?;

    let owner = utils::new_uuid_to_bech32("user_")?;
    let renter = utils::new_uuid_to_bech32("user_")?;
    let stranger = utils::new_uuid_to_bech32("user_")?;
    let today = Day::today();

    let listing = service.create_listing(owner.clone(), drill_fields())?;
    service.create_deal(
        &listing.id,
        &owner,
        &renter,
        DealKind::Rental,
        Anchor::Period {
            start: today.offset(1),
            end: today.offset(2),
        },
    )?;

    let caps = service.get_capabilities(&listing.id, &stranger)?;
    assert!(!caps.can_accept_rental);
    assert!(!caps.can_cancel_rental);
    assert!(!caps.can_add_rental && !caps.can_add_purchase);
    assert!(caps.can_view_owner_inbox);

    let caps = service.get_capabilities(&listing.id, &renter)?;
    assert!(caps.can_accept_rental);

    Ok(())
}
