//! One-time reward claim ledger.
//!
//! Redeems free usage credits for a public social handle exactly once,
//! proven by a live post carrying a short-lived verification code and
//! enforced by an atomic multi-item transaction against the external store.

mod ledger;
mod lookup;
mod store;

pub use ledger::{ClaimGrant, ClaimLedger, ClaimPrompt, parse_post_url, validate_claim_post};
pub use lookup::{ApiDanceSource, FxTwitterSource, Post, PostLookup, PostSource};
pub use store::{ClaimStore, NewClaim, PendingVerification};
