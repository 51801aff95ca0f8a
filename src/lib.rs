pub mod deal;
pub mod error;
pub mod listing;
pub mod notify;
pub mod permissions;
pub mod service;
pub mod snapshot;
pub mod stamp;
pub mod state_machine;
pub mod utils;
