//! Semantic component kinds and the per-stream usage tracker.

use crate::error::CodecError;

/// Archive entry name for the tag-dictionary update.
pub const TAGS_UPDATE_NAME: &str = "tagsupdate";

/// Archive entry name for the well tag list.
pub const WELL_TAGS_NAME: &str = "tags";

/// The semantic kinds a shard stream may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Store,
    Index,
    Verify,
    /// Flat bloom-filter accelerator file.
    Accel,
    /// Key half of an indexed accelerator.
    AccelKeys,
    /// Data half of an indexed accelerator.
    AccelData,
    /// Tag dictionary update, wire-only.
    TagsUpdate,
    /// Well tag list.
    WellTags,
}

impl FileKind {
    /// Archive entry name for this kind within a shard named `id`.
    pub fn entry_name(self, id: &str) -> String {
        match self {
            Self::Store => format!("{id}.store"),
            Self::Index => format!("{id}.index"),
            Self::Verify => format!("{id}.verify"),
            Self::Accel => format!("{id}.accel"),
            Self::AccelKeys => "keys".to_string(),
            Self::AccelData => "data".to_string(),
            Self::TagsUpdate => TAGS_UPDATE_NAME.to_string(),
            Self::WellTags => WELL_TAGS_NAME.to_string(),
        }
    }

    /// On-disk placement relative to the shard directory. The indexed
    /// accelerator halves live inside the `<id>.accel` directory.
    pub fn disk_path(self, id: &str) -> String {
        match self {
            Self::AccelKeys => format!("{id}.accel/keys"),
            Self::AccelData => format!("{id}.accel/data"),
            other => other.entry_name(id),
        }
    }

    /// Map an archive entry name back to its kind.
    pub fn from_entry_name(name: &str) -> Result<Self, CodecError> {
        match name {
            "keys" => return Ok(Self::AccelKeys),
            "data" => return Ok(Self::AccelData),
            TAGS_UPDATE_NAME => return Ok(Self::TagsUpdate),
            WELL_TAGS_NAME => return Ok(Self::WellTags),
            _ => {}
        }
        match name.rsplit_once('.').map(|(_, ext)| ext) {
            Some("store") => Ok(Self::Store),
            Some("index") => Ok(Self::Index),
            Some("verify") => Ok(Self::Verify),
            Some("accel") => Ok(Self::Accel),
            _ => Err(CodecError::UnknownEntry(name.to_string())),
        }
    }

    pub(crate) fn label(self) -> &'static str {
        match self {
            Self::Store => "store file",
            Self::Index => "index file",
            Self::Verify => "verify file",
            Self::Accel => "accelerator file",
            Self::AccelKeys => "indexed accelerator key file",
            Self::AccelData => "indexed accelerator data file",
            Self::TagsUpdate => "tags update",
            Self::WellTags => "well tags",
        }
    }
}

/// Tracks which kinds a stream has carried, enforcing first-use and the
/// accelerator exclusivity rules.
#[derive(Debug, Default)]
pub(crate) struct Tracker {
    store: bool,
    index: bool,
    verify: bool,
    accel: bool,
    accel_keys: bool,
    accel_data: bool,
    tags_update: bool,
    well_tags: bool,
}

impl Tracker {
    pub(crate) fn hit(&mut self, kind: FileKind) -> Result<(), CodecError> {
        match kind {
            FileKind::Store => Self::mark(&mut self.store, kind)?,
            FileKind::Index => Self::mark(&mut self.index, kind)?,
            FileKind::Verify => Self::mark(&mut self.verify, kind)?,
            FileKind::Accel => {
                if self.accel || self.accel_keys || self.accel_data {
                    return Err(CodecError::AcceleratorConflict);
                }
                self.accel = true;
            }
            FileKind::AccelKeys => {
                if self.accel || self.accel_keys {
                    return Err(CodecError::AcceleratorConflict);
                }
                self.accel_keys = true;
            }
            FileKind::AccelData => {
                if self.accel || self.accel_data {
                    return Err(CodecError::AcceleratorConflict);
                }
                self.accel_data = true;
            }
            FileKind::TagsUpdate => Self::mark(&mut self.tags_update, kind)?,
            FileKind::WellTags => Self::mark(&mut self.well_tags, kind)?,
        }
        Ok(())
    }

    fn mark(flag: &mut bool, kind: FileKind) -> Result<(), CodecError> {
        if *flag {
            return Err(CodecError::Duplicate(kind));
        }
        *flag = true;
        Ok(())
    }

    /// Completeness check at end of stream. Lenient mode requires only
    /// the store file; strict mode requires every mandatory component.
    /// A half-present indexed accelerator is always an error.
    pub(crate) fn complete(&self, strict: bool) -> Result<(), CodecError> {
        if !self.store {
            return Err(CodecError::Missing(FileKind::Store));
        }
        if strict {
            if !self.tags_update {
                return Err(CodecError::Missing(FileKind::TagsUpdate));
            }
            if !self.well_tags {
                return Err(CodecError::Missing(FileKind::WellTags));
            }
            if !self.index {
                return Err(CodecError::Missing(FileKind::Index));
            }
            if !self.verify {
                return Err(CodecError::Missing(FileKind::Verify));
            }
        }
        if self.accel_keys != self.accel_data {
            if !self.accel_keys {
                return Err(CodecError::Missing(FileKind::AccelKeys));
            }
            return Err(CodecError::Missing(FileKind::AccelData));
        }
        Ok(())
    }
}
