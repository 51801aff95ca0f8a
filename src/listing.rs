//! Listing entity and its editable field set
use super::error::ValidationError;
use super::stamp::TimeStamp;
use super::utils;
use chrono::Utc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    #[n(0)]
    Excellent,
    #[n(1)]
    Good,
    #[n(2)]
    Fair,
    #[n(3)]
    Poor,
}

/// Derived cache of "does a non-terminal deal exist, and of which kind".
/// Owned by the orchestrator; nothing else writes it.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    #[n(0)]
    Available,
    #[n(1)]
    ActiveRental,
    #[n(2)]
    PendingPurchase,
    #[n(3)]
    Sold,
}

// The editable slice of a listing. This struct is the unit the snapshot
// store copies, so availability deliberately lives outside it.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Default, Clone, PartialEq, Eq)]
pub struct ListingFields {
    #[n(0)]
    title: String,
    #[n(1)]
    description: String,
    #[n(2)]
    category: String,
    #[n(3)]
    condition: Option<Condition>,
    #[n(4)]
    price_per_day: u64, // integer cents
    #[n(5)]
    deposit: Option<u64>,
    #[n(6)]
    image_ref: Option<String>,
    #[n(7)]
    discount_percent: u8,
}

impl ListingFields {
    /// Construct a new builder object, the basis for a create or edit
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_title(mut self, title: &str) -> Self {
        self.title = title.to_owned();
        self
    }
    pub fn set_description(mut self, description: &str) -> Self {
        self.description = description.to_owned();
        self
    }
    pub fn set_category(mut self, category: &str) -> Self {
        self.category = category.to_owned();
        self
    }
    pub fn set_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }
    pub fn set_price_per_day(mut self, cents: u64) -> Self {
        self.price_per_day = cents;
        self
    }
    pub fn set_deposit(mut self, cents: u64) -> Self {
        self.deposit = Some(cents);
        self
    }
    pub fn set_image_ref(mut self, image_ref: &str) -> Self {
        self.image_ref = Some(image_ref.to_owned());
        self
    }
    pub fn set_discount_percent(mut self, percent: u8) -> Self {
        self.discount_percent = percent;
        self
    }

    pub fn title(&self) -> &str {
        &self.title
    }
    pub fn description(&self) -> &str {
        &self.description
    }
    pub fn price_per_day(&self) -> u64 {
        self.price_per_day
    }
    pub fn deposit(&self) -> Option<u64> {
        self.deposit
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        if self.price_per_day == 0 {
            return Err(ValidationError::ZeroPrice);
        }
        if self.discount_percent > 100 {
            return Err(ValidationError::DiscountRange);
        }
        Ok(())
    }

    // Checks fields, then returns a content fingerprint alongside the CBOR
    // encoding. The fingerprint is stored on every snapshot of this state.
    pub fn validate_and_finalise(&self) -> anyhow::Result<(String, Vec<u8>)> {
        self.validate()?;

        let contents = minicbor::to_vec(self)?;
        let hash = sha256::digest(&contents);

        Ok((hash, contents))
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    #[n(0)]
    pub id: String, // uuid7, bech32 "item_" prefix
    #[n(1)]
    pub owner_id: String,
    #[n(2)]
    pub fields: ListingFields,
    #[n(3)]
    pub availability: Availability,
    #[n(4)]
    pub created_at: TimeStamp<Utc>,
}

impl Listing {
    pub fn new(owner_id: String, fields: ListingFields) -> anyhow::Result<Self> {
        fields.validate()?;

        Ok(Self {
            id: utils::new_listing_id()?,
            owner_id,
            fields,
            availability: Availability::Available,
            created_at: TimeStamp::new(),
        })
    }
}
