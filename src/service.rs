//! Service layer API binding the state machine, permission evaluator,
//! snapshot store and notification dispatcher over a sled database.
//!
//! This is the only module that writes entity state and the only one that
//! talks to the delivery collaborator. Every read-check-write window runs
//! under a per-listing lock, with the open-deal index claimed by
//! compare-and-swap as a backstop against racing creations.
use super::deal::{Anchor, Deal, DealKind, DealStatus};
use super::error::Rejection;
use super::listing::{Availability, Listing, ListingFields};
use super::notify::{Delivery, Dispatcher, Message, TransitionEvent};
use super::permissions::{CapabilitySet, capabilities};
use super::snapshot::SnapshotStore;
use super::stamp::Day;
use super::state_machine::{availability_after, availability_on_open, transition};
use sled::Batch;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

pub struct DealService {
    instance: Arc<sled::Db>,
    snapshots: SnapshotStore,
    dispatcher: Dispatcher,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

fn listing_key(id: &str) -> String {
    format!("listing/{id}")
}

fn deal_key(id: &str) -> String {
    format!("deal/{id}")
}

fn open_key(listing_id: &str) -> String {
    format!("open/{listing_id}")
}

impl DealService {
    pub fn new(
        instance: Arc<sled::Db>,
        delivery: Arc<dyn Delivery>,
        system_sender_id: String,
    ) -> Self {
        Self {
            snapshots: SnapshotStore::new(instance.clone()),
            dispatcher: Dispatcher::new(instance.clone(), delivery, system_sender_id),
            instance,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Per-listing mutual exclusion for the read-check-write windows.
    fn listing_lock(&self, listing_id: &str) -> Arc<Mutex<()>> {
        let mut table = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        table.entry(listing_id.to_owned()).or_default().clone()
    }

    /// Commit a set of writes as one batch, retrying once. A second failure
    /// surfaces as a conflict; the batch either commits whole or not at
    /// all, so no entity is ever half-updated. `None` deletes the key.
    fn apply_guarded(&self, writes: &[(String, Option<Vec<u8>>)]) -> anyhow::Result<()> {
        let build = || {
            let mut batch = Batch::default();
            for (key, value) in writes {
                match value {
                    Some(value) => batch.insert(key.as_bytes(), value.clone()),
                    None => batch.remove(key.as_bytes()),
                }
            }
            batch
        };

        if let Err(first) = self.instance.apply_batch(build()) {
            warn!(error = %first, "batch apply failed, retrying once");
            if self.instance.apply_batch(build()).is_err() {
                return Err(Rejection::Conflict.into());
            }
        }
        Ok(())
    }

    fn load_listing(&self, listing_id: &str) -> anyhow::Result<Listing> {
        let raw = self
            .instance
            .get(listing_key(listing_id).as_bytes())?
            .ok_or_else(|| anyhow::anyhow!("listing not found: {listing_id}"))?;
        Ok(minicbor::decode(&raw)?)
    }

    fn load_deal(&self, deal_id: &str) -> anyhow::Result<Deal> {
        let raw = self
            .instance
            .get(deal_key(deal_id).as_bytes())?
            .ok_or_else(|| anyhow::anyhow!("deal not found: {deal_id}"))?;
        Ok(minicbor::decode(&raw)?)
    }

    /// The listing's non-terminal deal, if one exists.
    fn open_deal(&self, listing_id: &str) -> anyhow::Result<Option<Deal>> {
        let Some(raw) = self.instance.get(open_key(listing_id).as_bytes())? else {
            return Ok(None);
        };
        let deal_id = std::str::from_utf8(&raw)?.to_owned();
        Ok(Some(self.load_deal(&deal_id)?))
    }

    /// Create a listing. The post-create state is pushed as the first
    /// snapshot, which becomes the undo floor.
    pub fn create_listing(
        &self,
        owner_id: String,
        fields: ListingFields,
    ) -> anyhow::Result<Listing> {
        let listing = Listing::new(owner_id, fields)?;

        let lock = self.listing_lock(&listing.id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        self.instance
            .insert(listing_key(&listing.id).as_bytes(), minicbor::to_vec(&listing)?)?;
        self.snapshots.push(&listing.id, &listing.fields)?;

        Ok(listing)
    }

    /// Apply new field values, persist, then unconditionally push a snapshot
    /// of the post-save state. Refused while a non-terminal deal exists.
    pub fn save_listing(
        &self,
        listing_id: &str,
        fields: ListingFields,
    ) -> anyhow::Result<Listing> {
        let lock = self.listing_lock(listing_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut listing = self.load_listing(listing_id)?;
        if self.open_deal(listing_id)?.is_some() {
            return Err(Rejection::Unavailable.into());
        }
        fields.validate()?;

        listing.fields = fields;
        self.instance
            .insert(listing_key(listing_id).as_bytes(), minicbor::to_vec(&listing)?)?;
        self.snapshots.push(listing_id, &listing.fields)?;

        Ok(listing)
    }

    /// Restore the listing's fields to the previous save. Pops the newest
    /// snapshot and copies the one beneath it back onto the listing, so
    /// repeated calls walk the history backward one step at a time. The
    /// first save is the floor and is never undone past.
    pub fn undo_listing(&self, listing_id: &str) -> anyhow::Result<Listing> {
        let lock = self.listing_lock(listing_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut listing = self.load_listing(listing_id)?;
        if self.open_deal(listing_id)?.is_some() {
            return Err(Rejection::Unavailable.into());
        }
        if self.snapshots.count(listing_id)? < 2 {
            return Err(Rejection::NoFurtherHistory.into());
        }

        self.snapshots.pop_latest(listing_id)?;
        let snapshot = self
            .snapshots
            .latest(listing_id)?
            .ok_or_else(|| anyhow::anyhow!("snapshot history empty after pop: {listing_id}"))?;

        listing.fields = snapshot.fields;
        self.instance
            .insert(listing_key(listing_id).as_bytes(), minicbor::to_vec(&listing)?)?;

        Ok(listing)
    }

    /// What may this viewer currently do to this listing.
    ///
    /// The open deal is only passed to the evaluator when the viewer is the
    /// owner or that deal's counterparty; a third party sees the listing as
    /// if no deal existed.
    pub fn get_capabilities(
        &self,
        listing_id: &str,
        viewer_id: &str,
    ) -> anyhow::Result<CapabilitySet> {
        let listing = self.load_listing(listing_id)?;
        let viewer_is_owner = viewer_id == listing.owner_id;

        let visible = self
            .open_deal(listing_id)?
            .filter(|deal| viewer_is_owner || deal.counterparty_id == viewer_id);
        let (rental, purchase) = match visible {
            Some(deal) if deal.kind == DealKind::Rental => (Some(deal), None),
            Some(deal) => (None, Some(deal)),
            None => (None, None),
        };
        let has_messages = self.dispatcher.has_messages(listing_id)?;

        Ok(capabilities(
            viewer_is_owner,
            rental.as_ref(),
            purchase.as_ref(),
            has_messages,
            Day::today(),
        ))
    }

    /// Open a deal on a listing. At most one non-terminal deal may exist per
    /// listing; the open-deal index entry is claimed by compare-and-swap so
    /// two racing calls cannot both win.
    pub fn create_deal(
        &self,
        listing_id: &str,
        owner_id: &str,
        counterparty_id: &str,
        kind: DealKind,
        anchor: Anchor,
    ) -> anyhow::Result<Deal> {
        let lock = self.listing_lock(listing_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut listing = self.load_listing(listing_id)?;
        if owner_id != listing.owner_id {
            return Err(Rejection::WrongActor.into());
        }
        if owner_id == counterparty_id {
            return Err(Rejection::SelfDeal.into());
        }
        if listing.availability == Availability::Sold {
            return Err(Rejection::Unavailable.into());
        }
        anchor.validate(kind, Day::today())?;

        let deal = Deal::new(
            listing_id.to_owned(),
            owner_id.to_owned(),
            counterparty_id.to_owned(),
            kind,
            anchor,
        )?;

        let claim = self.instance.compare_and_swap(
            open_key(listing_id).as_bytes(),
            None::<&[u8]>,
            Some(deal.id.as_bytes()),
        )?;
        if claim.is_err() {
            return Err(Rejection::Unavailable.into());
        }

        listing.availability = availability_on_open(kind);
        let writes = [
            (deal_key(&deal.id), Some(minicbor::to_vec(&deal)?)),
            (listing_key(listing_id), Some(minicbor::to_vec(&listing)?)),
        ];
        if let Err(err) = self.apply_guarded(&writes) {
            // release the claim so the listing is not wedged
            let _ = self.instance.remove(open_key(listing_id).as_bytes());
            return Err(err);
        }

        let event = TransitionEvent::from_deal(&deal);
        self.dispatcher.notify(&event)?;

        Ok(deal)
    }

    /// Move a deal to a requested status on behalf of an actor. Legality is
    /// decided by the state machine; on success the deal, the listing's
    /// availability and the open-deal index commit in one batch, then the
    /// notification fan-out runs.
    pub fn advance(
        &self,
        deal_id: &str,
        target: DealStatus,
        actor_id: &str,
    ) -> anyhow::Result<Deal> {
        let deal = self.load_deal(deal_id)?;
        let role = deal.role_of(actor_id).ok_or(Rejection::WrongActor)?;

        let lock = self.listing_lock(&deal.listing_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        // re-read under the lock, the deal may have moved
        let deal = self.load_deal(deal_id)?;
        let (updated, event) = transition(deal, target, role, Day::today())?;

        let mut writes = vec![(deal_key(&updated.id), Some(minicbor::to_vec(&updated)?))];
        if updated.is_terminal() {
            writes.push((open_key(&updated.listing_id), None));
        }
        if let Some(availability) = availability_after(updated.kind, updated.status) {
            let mut listing = self.load_listing(&updated.listing_id)?;
            listing.availability = availability;
            writes.push((
                listing_key(&updated.listing_id),
                Some(minicbor::to_vec(&listing)?),
            ));
        }
        self.apply_guarded(&writes)?;

        self.dispatcher.notify(&event)?;

        Ok(updated)
    }

    /// Load a listing by id.
    pub fn listing(&self, listing_id: &str) -> anyhow::Result<Listing> {
        self.load_listing(listing_id)
    }

    /// Load a deal by id.
    pub fn deal(&self, deal_id: &str) -> anyhow::Result<Deal> {
        self.load_deal(deal_id)
    }

    /// All system messages recorded for a listing, in insertion order.
    pub fn messages_for(&self, listing_id: &str) -> anyhow::Result<Vec<Message>> {
        self.dispatcher.messages_for(listing_id)
    }
}
