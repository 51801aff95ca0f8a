//! Append-only snapshot store backing listing undo.
//!
//! Snapshots are keyed `snap/{listing_id}/{seq}` with a zero-padded
//! sequence number, so lexicographic key order within a listing's prefix is
//! insertion order and the newest snapshot is the last key in the range.
use super::listing::ListingFields;
use super::stamp::TimeStamp;
use chrono::Utc;
use std::sync::Arc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    #[n(0)]
    pub listing_id: String,
    #[n(1)]
    pub fields: ListingFields,
    #[n(2)]
    pub fields_hash: String, // sha256 of the fields' CBOR encoding
    #[n(3)]
    pub saved_at: TimeStamp<Utc>,
}

pub struct SnapshotStore {
    instance: Arc<sled::Db>,
}

impl SnapshotStore {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self { instance }
    }

    fn prefix(listing_id: &str) -> String {
        format!("snap/{listing_id}/")
    }

    fn key(listing_id: &str, seq: u64) -> String {
        format!("snap/{listing_id}/{seq:020}")
    }

    fn latest_entry(&self, listing_id: &str) -> anyhow::Result<Option<(u64, Snapshot)>> {
        let prefix = Self::prefix(listing_id);
        let Some(entry) = self.instance.scan_prefix(prefix.as_bytes()).last() else {
            return Ok(None);
        };
        let (key, raw) = entry?;
        let seq: u64 = std::str::from_utf8(&key[prefix.len()..])?.parse()?;
        Ok(Some((seq, minicbor::decode(&raw)?)))
    }

    /// Append a snapshot of the given field state.
    pub fn push(&self, listing_id: &str, fields: &ListingFields) -> anyhow::Result<Snapshot> {
        let (fields_hash, _) = fields.validate_and_finalise()?;
        let next_seq = match self.latest_entry(listing_id)? {
            Some((seq, _)) => seq + 1,
            None => 0,
        };

        let snapshot = Snapshot {
            listing_id: listing_id.to_owned(),
            fields: fields.clone(),
            fields_hash,
            saved_at: TimeStamp::new(),
        };
        self.instance.insert(
            Self::key(listing_id, next_seq).as_bytes(),
            minicbor::to_vec(&snapshot)?,
        )?;

        Ok(snapshot)
    }

    pub fn latest(&self, listing_id: &str) -> anyhow::Result<Option<Snapshot>> {
        Ok(self.latest_entry(listing_id)?.map(|(_, snap)| snap))
    }

    /// Remove and return the newest snapshot.
    pub fn pop_latest(&self, listing_id: &str) -> anyhow::Result<Option<Snapshot>> {
        let Some((seq, snapshot)) = self.latest_entry(listing_id)? else {
            return Ok(None);
        };
        self.instance.remove(Self::key(listing_id, seq).as_bytes())?;
        Ok(Some(snapshot))
    }

    pub fn count(&self, listing_id: &str) -> anyhow::Result<usize> {
        let prefix = Self::prefix(listing_id);
        let mut n = 0;
        for entry in self.instance.scan_prefix(prefix.as_bytes()) {
            entry?;
            n += 1;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, SnapshotStore) {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path().join("snapshots.db")).unwrap();
        (dir, SnapshotStore::new(Arc::new(db)))
    }

    fn fields(title: &str) -> ListingFields {
        ListingFields::new().set_title(title).set_price_per_day(100)
    }

    #[test]
    fn push_then_pop_walks_backward() {
        let (_dir, store) = store();

        store.push("item_a", &fields("one")).unwrap();
        store.push("item_a", &fields("two")).unwrap();
        store.push("item_a", &fields("three")).unwrap();
        assert_eq!(store.count("item_a").unwrap(), 3);

        let popped = store.pop_latest("item_a").unwrap().unwrap();
        assert_eq!(popped.fields.title(), "three");

        let latest = store.latest("item_a").unwrap().unwrap();
        assert_eq!(latest.fields.title(), "two");
        assert_eq!(store.count("item_a").unwrap(), 2);
    }

    #[test]
    fn listings_do_not_share_history() {
        let (_dir, store) = store();

        store.push("item_a", &fields("a1")).unwrap();
        store.push("item_b", &fields("b1")).unwrap();
        store.push("item_b", &fields("b2")).unwrap();

        assert_eq!(store.count("item_a").unwrap(), 1);
        assert_eq!(store.count("item_b").unwrap(), 2);
        assert_eq!(store.latest("item_a").unwrap().unwrap().fields.title(), "a1");
    }

    #[test]
    fn empty_history_pops_nothing() {
        let (_dir, store) = store();

        assert!(store.pop_latest("item_missing").unwrap().is_none());
        assert_eq!(store.count("item_missing").unwrap(), 0);
    }
}
