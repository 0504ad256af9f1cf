//! Tag pairs, reserved mappings, and name validation.

use serde::{Deserialize, Serialize};

use crate::error::TagError;

/// Numeric tag identifier.
pub type TagId = u16;

pub const DEFAULT_TAG_NAME: &str = "default";
pub const DEFAULT_TAG_ID: TagId = 0;
pub const GRAVWELL_TAG_NAME: &str = "gravwell";
pub const GRAVWELL_TAG_ID: TagId = 0xffff;

/// Name of the dictionary file kept beside each indexer directory.
pub const TAG_FILE_NAME: &str = "tags.dat";

/// One name-to-id mapping, serialised with the wire field names used on
/// the HTTP surface and inside shard streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagPair {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value")]
    pub value: TagId,
}

impl TagPair {
    pub fn new(name: impl Into<String>, value: TagId) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// The two mappings every dictionary starts with and must never lose.
pub fn reserved_pairs() -> [TagPair; 2] {
    [
        TagPair::new(DEFAULT_TAG_NAME, DEFAULT_TAG_ID),
        TagPair::new(GRAVWELL_TAG_NAME, GRAVWELL_TAG_ID),
    ]
}

/// Validate a tag name: nonempty, no whitespace, no `=`.
pub fn check_tag(name: &str) -> Result<(), TagError> {
    if name.is_empty() {
        return Err(TagError::EmptyName);
    }
    if name.chars().any(|c| c.is_whitespace() || c == '=') {
        return Err(TagError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Validate an incoming tag set: bounded size and reserved mappings
/// intact.
pub(crate) fn check_tag_set(pairs: &[TagPair]) -> Result<(), TagError> {
    if pairs.len() > 0xffff {
        return Err(TagError::TooManyTags);
    }
    for p in pairs {
        match p.name.as_str() {
            DEFAULT_TAG_NAME => {
                if p.value != DEFAULT_TAG_ID {
                    return Err(TagError::ReservedMismatch(p.name.clone()));
                }
            }
            GRAVWELL_TAG_NAME => {
                if p.value != GRAVWELL_TAG_ID {
                    return Err(TagError::ReservedMismatch(p.name.clone()));
                }
            }
            _ => {}
        }
    }
    Ok(())
}
