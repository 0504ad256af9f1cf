//! The storage contract the HTTP layer is written against.

use std::io::{Read, Write};

use shale_core::Timeframe;
use shale_tags::TagPair;
use uuid::Uuid;

use crate::error::StoreError;

/// One storage backend.
///
/// Implementations are synchronous; callers on an async runtime drive
/// them from a blocking task. Every mutating operation claims the upload
/// id for its shard before touching storage and releases it on all exit
/// paths, and any partially written shard directory is removed when an
/// unpack fails.
pub trait ShardStore: Send + Sync {
    /// Verify the backend is usable before serving traffic.
    fn preflight(&self) -> Result<(), StoreError>;

    /// Indexer UUIDs stored for a customer.
    fn list_indexers(&self, cid: u64) -> Result<Vec<String>, StoreError>;

    /// Well names stored for one indexer.
    fn list_indexer_wells(&self, cid: u64, indexer: Uuid) -> Result<Vec<String>, StoreError>;

    /// Union of the time ranges of every shard in a well.
    fn well_timeframe(
        &self,
        cid: u64,
        indexer: Uuid,
        well: &str,
    ) -> Result<Timeframe, StoreError>;

    /// Names of shards whose windows intersect the query timeframe.
    fn shards_in_timeframe(
        &self,
        cid: u64,
        indexer: Uuid,
        well: &str,
        tf: &Timeframe,
    ) -> Result<Vec<String>, StoreError>;

    /// Decode one shard stream into storage.
    fn unpack_shard(
        &self,
        cid: u64,
        indexer: Uuid,
        well: &str,
        shard: &str,
        rdr: &mut (dyn Read + Send),
    ) -> Result<(), StoreError>;

    /// Encode one stored shard into `wtr`.
    fn pack_shard(
        &self,
        cid: u64,
        indexer: Uuid,
        well: &str,
        shard: &str,
        wtr: &mut (dyn Write + Send),
    ) -> Result<(), StoreError>;

    /// The indexer's full tag dictionary.
    fn get_tags(&self, cid: u64, indexer: Uuid) -> Result<Vec<TagPair>, StoreError>;

    /// Merge the indexer's pairs into the dictionary and return the
    /// merged set.
    fn sync_tags(
        &self,
        cid: u64,
        indexer: Uuid,
        incoming: &[TagPair],
    ) -> Result<Vec<TagPair>, StoreError>;
}
