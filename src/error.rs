use crate::deal::DealStatus;

/// Expected, user-facing refusals. Returned as values so the calling layer
/// can match on the kind and render a precise message.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("actor is not permitted to perform this action on the deal")]
    WrongActor,
    #[error("no transition from {from:?} to {requested:?}")]
    WrongStatus {
        from: DealStatus,
        requested: DealStatus,
    },
    #[error("owner and counterparty must be different users")]
    SelfDeal,
    #[error("offer can no longer be accepted, its date is not in the future")]
    StaleOffer,
    #[error("anchor dates are invalid for this deal kind")]
    InvalidAnchor,
    #[error("listing is unavailable while a deal is open or after a sale")]
    Unavailable,
    #[error("no earlier saved state remains to restore")]
    NoFurtherHistory,
    #[error("storage conflict, the operation was lost to a concurrent writer")]
    Conflict,
}

#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("listing title must not be empty")]
    EmptyTitle,
    #[error("price per day must be at least 1")]
    ZeroPrice,
    #[error("discount percentage must be between 0 and 100")]
    DiscountRange,
}

/// Failure reported by the outbound delivery collaborator. Logged and
/// swallowed; never rolls back a committed transition or a stored Message.
#[derive(thiserror::Error, Debug)]
pub enum DeliveryError {
    #[error("recipient address rejected: {0}")]
    BadRecipient(String),
    #[error("delivery transport failed: {0}")]
    Transport(String),
}
