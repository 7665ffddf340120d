//! Offer store: the "have we seen this listing" collaborator
//!
//! The job executor answers "is this crawled offer new" through this module.
//! Upserts are idempotent: re-observing an identical offer is not new and
//! not an error; re-observing the same id with different content is a
//! data-consistency warning, and the newer record wins.

mod memory;
mod sqlite;
mod traits;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{OfferStore, StoreError, StoreResult};
