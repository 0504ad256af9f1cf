//! Per-indexer tag dictionaries.
//!
//! Every indexer owns a dictionary mapping tag names to 16-bit ids,
//! persisted as an append-only `tags.dat` beside its shard wells. The
//! dictionary is bijective, two mappings are reserved (`default` = 0 and
//! `gravwell` = 0xFFFF), and an exclusive file lock guards the backing
//! file for the lifetime of the open manager.
//!
//! [`TagRegistry`] hands out reference-counted handles so that concurrent
//! request handlers for the same `(customer, indexer)` share one open
//! manager, which is required both by the handle-scoped file lock and by
//! the in-memory allocation state.

mod error;
mod manager;
mod pair;
mod registry;

pub use error::TagError;
pub use manager::TagManager;
pub use pair::{
    check_tag, reserved_pairs, TagId, TagPair, DEFAULT_TAG_ID, DEFAULT_TAG_NAME, GRAVWELL_TAG_ID,
    GRAVWELL_TAG_NAME, TAG_FILE_NAME,
};
pub use registry::TagRegistry;
