//! Local filesystem backend.
//!
//! Layout: `<root>/<cid>/<indexer-uuid>/<well>/<shard>/<files>` with each
//! indexer's `tags.dat` sibling to its well directories. Shard
//! directories are never modified after the unpack that created them.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use shale_codec::{CodecError, UnpackHandler, Unpacker};
use shale_core::shard::shard_name_range;
use shale_core::{Timeframe, UploadId, UploadTracker};
use shale_tags::{TagPair, TagRegistry};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::pack::pack_dir_to_writer;
use crate::traits::ShardStore;
use crate::{clean_entry_path, readable_dir, writable_dir};

/// Backend persisting shards beneath one pre-existing writable root.
pub struct FileStore {
    base: PathBuf,
    tracker: UploadTracker,
    registry: Arc<TagRegistry>,
}

impl FileStore {
    pub fn new(base: impl Into<PathBuf>, registry: Arc<TagRegistry>) -> Result<Self, StoreError> {
        let base = base.into();
        if base.as_os_str().is_empty() {
            return Err(StoreError::MissingBaseDir);
        }
        writable_dir(&base)?;
        Ok(Self {
            base,
            tracker: UploadTracker::new(),
            registry,
        })
    }

    fn indexer_dir(&self, cid: u64, indexer: Uuid) -> PathBuf {
        self.base.join(cid.to_string()).join(indexer.to_string())
    }

    fn well_dir(&self, cid: u64, indexer: Uuid, well: &str) -> PathBuf {
        self.indexer_dir(cid, indexer).join(well)
    }

    /// Walk a well directory, yielding each shard directory's name and
    /// covered range. Non-directories and unparseable names are skipped.
    fn shard_ranges(
        &self,
        cid: u64,
        indexer: Uuid,
        well: &str,
    ) -> Result<Vec<(String, chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>)>, StoreError>
    {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(self.well_dir(cid, indexer, well))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Ok((s, e)) = shard_name_range(&name) {
                out.push((name, s, e));
            }
        }
        Ok(out)
    }

    /// Pick the target directory for an incoming shard, suffixing
    /// `.1` .. `.9999` on collision.
    fn next_free_shard_dir(&self, well_dir: &Path, shard: &str) -> Result<PathBuf, StoreError> {
        let base = well_dir.join(shard);
        if !base.exists() {
            return Ok(base);
        }
        for i in 1..10_000 {
            let candidate = well_dir.join(format!("{shard}.{i}"));
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(StoreError::CollisionExhausted(shard.to_string()))
    }
}

impl ShardStore for FileStore {
    fn preflight(&self) -> Result<(), StoreError> {
        writable_dir(&self.base)
    }

    fn list_indexers(&self, cid: u64) -> Result<Vec<String>, StoreError> {
        let mut indexers = Vec::new();
        for entry in std::fs::read_dir(self.base.join(cid.to_string()))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if Uuid::parse_str(&name).is_ok() {
                indexers.push(name);
            }
        }
        Ok(indexers)
    }

    fn list_indexer_wells(&self, cid: u64, indexer: Uuid) -> Result<Vec<String>, StoreError> {
        let mut wells = Vec::new();
        for entry in std::fs::read_dir(self.indexer_dir(cid, indexer))? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                wells.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(wells)
    }

    fn well_timeframe(
        &self,
        cid: u64,
        indexer: Uuid,
        well: &str,
    ) -> Result<Timeframe, StoreError> {
        let mut tf: Option<Timeframe> = None;
        for (_, s, e) in self.shard_ranges(cid, indexer, well)? {
            let cur = tf.get_or_insert(Timeframe { start: s, end: e });
            if s < cur.start {
                cur.start = s;
            }
            if e > cur.end {
                cur.end = e;
            }
        }
        Ok(tf.unwrap_or_else(Timeframe::zero))
    }

    fn shards_in_timeframe(
        &self,
        cid: u64,
        indexer: Uuid,
        well: &str,
        tf: &Timeframe,
    ) -> Result<Vec<String>, StoreError> {
        let mut shards = Vec::new();
        for (name, s, e) in self.shard_ranges(cid, indexer, well)? {
            if tf.overlaps(s, e) {
                shards.push(name);
            }
        }
        Ok(shards)
    }

    fn unpack_shard(
        &self,
        cid: u64,
        indexer: Uuid,
        well: &str,
        shard: &str,
        rdr: &mut (dyn Read + Send),
    ) -> Result<(), StoreError> {
        let _claim = self
            .tracker
            .enter(UploadId::new(cid, indexer, well, shard))?;

        let indexer_dir = self.indexer_dir(cid, indexer);
        let shard_dir = self.next_free_shard_dir(&indexer_dir.join(well), shard)?;
        std::fs::create_dir_all(&shard_dir)?;

        let mut handler = LocalUnpackHandler {
            registry: &self.registry,
            cid,
            indexer,
            shard_dir: shard_dir.clone(),
            indexer_dir,
        };
        let result = Unpacker::new(shard, rdr).unpack(&mut handler);
        if let Err(e) = result {
            warn!(cid, %indexer, well, shard, error = %e, "unpack failed, removing shard directory");
            let _ = std::fs::remove_dir_all(&shard_dir);
            return Err(e.into());
        }
        info!(cid, %indexer, well, shard, "shard stored");
        Ok(())
    }

    fn pack_shard(
        &self,
        cid: u64,
        indexer: Uuid,
        well: &str,
        shard: &str,
        wtr: &mut (dyn Write + Send),
    ) -> Result<(), StoreError> {
        let _claim = self
            .tracker
            .enter(UploadId::new(cid, indexer, well, shard))?;

        let shard_dir = self.well_dir(cid, indexer, well).join(shard);
        eprintln!("DEBUG pack_shard shard_dir={:?} exists={}", shard_dir, shard_dir.exists());
        if let Ok(rd) = std::fs::read_dir(shard_dir.parent().unwrap()) { for e in rd { eprintln!("DEBUG sibling: {:?}", e.unwrap().path()); } }
        readable_dir(&shard_dir).map_err(|e| { eprintln!("DEBUG readable_dir err {:?}", e); StoreError::NoSuchShard(shard.to_string())})?;
        let r = pack_dir_to_writer(&shard_dir, shard, wtr);
        eprintln!("DEBUG pack_dir_to_writer result: {:?}", r.is_ok());
        r
    }

    fn get_tags(&self, cid: u64, indexer: Uuid) -> Result<Vec<TagPair>, StoreError> {
        let dir = self.indexer_dir(cid, indexer);
        let tm = self.registry.get(cid, indexer, &dir)?;
        let tags = tm.tag_set();
        let released = self.registry.release(cid, indexer);
        let tags = tags?;
        released?;
        Ok(tags)
    }

    fn sync_tags(
        &self,
        cid: u64,
        indexer: Uuid,
        incoming: &[TagPair],
    ) -> Result<Vec<TagPair>, StoreError> {
        let dir = self.indexer_dir(cid, indexer);
        // tag sync usually precedes the first shard push
        if writable_dir(&dir).is_err() {
            std::fs::create_dir_all(&dir)?;
        }
        let tm = self.registry.get(cid, indexer, &dir)?;
        let merged = tm.merge(incoming).and_then(|_| tm.tag_set());
        let released = self.registry.release(cid, indexer);
        let tags = merged?;
        released?;
        Ok(tags)
    }
}

struct LocalUnpackHandler<'a> {
    registry: &'a TagRegistry,
    cid: u64,
    indexer: Uuid,
    shard_dir: PathBuf,
    indexer_dir: PathBuf,
}

impl UnpackHandler for LocalUnpackHandler<'_> {
    fn handle_file(&mut self, rel_path: &str, rdr: &mut dyn Read) -> Result<(), CodecError> {
        let (dir, file) = clean_entry_path(rel_path);
        let mut target = self.shard_dir.clone();
        if let Some(dir) = dir {
            target.push(dir);
            match std::fs::create_dir(&target) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        }
        target.push(file);
        let mut out = std::fs::File::create(target)?;
        io::copy(rdr, &mut out)?;
        Ok(())
    }

    fn handle_tag_update(&mut self, pairs: Vec<TagPair>) -> Result<(), CodecError> {
        let tm = self
            .registry
            .get(self.cid, self.indexer, &self.indexer_dir)
            .map_err(|e| CodecError::Handler(e.to_string()))?;
        let merged = tm.merge(&pairs);
        let released = self.registry.release(self.cid, self.indexer);
        merged.map_err(|e| CodecError::Handler(e.to_string()))?;
        released.map_err(|e| CodecError::Handler(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::slurp;
    use shale_codec::{FileKind, Packer};

    fn store(dir: &tempfile::TempDir) -> FileStore {
        FileStore::new(dir.path(), Arc::new(TagRegistry::new())).unwrap()
    }

    /// Pack an in-memory shard description into wire bytes.
    fn wire_shard(id: &str, files: &[(FileKind, &str)], tags: &[TagPair]) -> Vec<u8> {
        let (packer, mut reader) = Packer::new(id);
        let files: Vec<(FileKind, String)> = files
            .iter()
            .map(|(k, v)| (*k, v.to_string()))
            .collect();
        let tags = tags.to_vec();
        std::thread::scope(|s| {
            s.spawn(move || {
                packer.add_tags(&tags).unwrap();
                packer.add_well_tags(&[]).unwrap();
                for (kind, content) in files {
                    packer
                        .add_file(kind, content.len() as u64, &mut content.as_bytes())
                        .unwrap();
                }
                packer.close().unwrap();
            });
            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();
            out
        })
    }

    const SHARD_FILES: &[(FileKind, &str)] = &[
        (FileKind::Store, "store stuff"),
        (FileKind::Index, "index stuff"),
        (FileKind::Verify, "verify stuff"),
        (FileKind::AccelKeys, "accel keys"),
        (FileKind::AccelData, "accel data"),
    ];

    #[test]
    fn unpack_then_pack_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let st = store(&dir);
        let guid = Uuid::new_v4();

        let bytes = wire_shard("769f2", SHARD_FILES, &[TagPair::new("testing", 1)]);
        st.unpack_shard(1337, guid, "foo", "769f2", &mut &bytes[..])
            .unwrap();

        // layout on disk
        let shard_dir = dir
            .path()
            .join("1337")
            .join(guid.to_string())
            .join("foo")
            .join("769f2");
        assert_eq!(slurp(&shard_dir, "769f2.store"), b"store stuff");
        assert_eq!(slurp(&shard_dir, "769f2.accel/keys"), b"accel keys");
        assert_eq!(slurp(&shard_dir, "769f2.accel/data"), b"accel data");

        // the tag update merged into tags.dat
        let tags = st.get_tags(1337, guid).unwrap();
        assert!(tags.iter().any(|p| p.name == "testing" && p.value == 1));

        // pack it back and decode through the codec
        let mut out: Vec<u8> = Vec::new();
        st.pack_shard(1337, guid, "foo", "769f2", &mut out)
            .unwrap();
        let unpack_dir = tempfile::tempdir().unwrap();
        let mut h = CollectHandler {
            dir: unpack_dir.path().to_path_buf(),
        };
        shale_codec::Unpacker::new("769f2", &out[..])
            .unpack(&mut h)
            .unwrap();
        assert_eq!(slurp(unpack_dir.path(), "769f2.store"), b"store stuff");
        assert_eq!(slurp(unpack_dir.path(), "769f2.index"), b"index stuff");
        assert_eq!(slurp(unpack_dir.path(), "769f2.verify"), b"verify stuff");
        assert_eq!(slurp(unpack_dir.path(), "769f2.accel/keys"), b"accel keys");
        assert_eq!(slurp(unpack_dir.path(), "769f2.accel/data"), b"accel data");
    }

    struct CollectHandler {
        dir: PathBuf,
    }

    impl UnpackHandler for CollectHandler {
        fn handle_file(&mut self, rel: &str, rdr: &mut dyn Read) -> Result<(), CodecError> {
            let target = self.dir.join(rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = std::fs::File::create(target)?;
            io::copy(rdr, &mut out)?;
            Ok(())
        }

        fn handle_tag_update(&mut self, _pairs: Vec<TagPair>) -> Result<(), CodecError> {
            Ok(())
        }
    }

    #[test]
    fn listings_and_timeframes() {
        let dir = tempfile::tempdir().unwrap();
        let st = store(&dir);
        let guid = Uuid::new_v4();

        for shard in ["769f2", "769f3"] {
            let bytes = wire_shard(shard, &[(FileKind::Store, "s")], &[]);
            st.unpack_shard(1337, guid, "foo", shard, &mut &bytes[..])
                .unwrap();
        }

        assert_eq!(st.list_indexers(1337).unwrap(), vec![guid.to_string()]);
        assert_eq!(
            st.list_indexer_wells(1337, guid).unwrap(),
            vec!["foo".to_string()]
        );

        let tf = st.well_timeframe(1337, guid, "foo").unwrap();
        assert_eq!(tf.start.timestamp(), 0x769f2 << 17);
        assert_eq!(tf.end.timestamp(), (0x769f3 + 1) << 17);

        let mut shards = st.shards_in_timeframe(1337, guid, "foo", &tf).unwrap();
        shards.sort();
        assert_eq!(shards, vec!["769f2".to_string(), "769f3".to_string()]);

        // a disjoint window matches nothing
        let far = Timeframe {
            start: chrono::DateTime::from_timestamp(100, 0).unwrap(),
            end: chrono::DateTime::from_timestamp(200, 0).unwrap(),
        };
        assert!(st
            .shards_in_timeframe(1337, guid, "foo", &far)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn collision_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let st = store(&dir);
        let guid = Uuid::new_v4();

        for _ in 0..3 {
            let bytes = wire_shard("769f2", &[(FileKind::Store, "store stuff")], &[]);
            st.unpack_shard(1337, guid, "foo", "769f2", &mut &bytes[..])
                .unwrap();
        }

        let well = dir.path().join("1337").join(guid.to_string()).join("foo");
        for name in ["769f2", "769f2.1", "769f2.2"] {
            assert_eq!(slurp(&well.join(name), "769f2.store"), b"store stuff");
        }
    }

    #[test]
    fn failed_unpack_removes_partial_directory() {
        let dir = tempfile::tempdir().unwrap();
        let st = store(&dir);
        let guid = Uuid::new_v4();

        // stream missing the store file fails lenient completeness
        let bytes = wire_shard("769f2", &[(FileKind::Index, "index")], &[]);
        assert!(st
            .unpack_shard(1337, guid, "foo", "769f2", &mut &bytes[..])
            .is_err());
        let shard_dir = dir
            .path()
            .join("1337")
            .join(guid.to_string())
            .join("foo")
            .join("769f2");
        assert!(!shard_dir.exists());
    }

    #[test]
    fn pack_of_missing_shard_fails() {
        let dir = tempfile::tempdir().unwrap();
        let st = store(&dir);
        let mut out: Vec<u8> = Vec::new();
        assert!(matches!(
            st.pack_shard(1337, Uuid::new_v4(), "foo", "769f2", &mut out),
            Err(StoreError::NoSuchShard(_))
        ));
    }

    #[test]
    fn sync_tags_merges_and_rejects_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let st = store(&dir);
        let guid = Uuid::new_v4();

        let tags = st
            .sync_tags(1337, guid, &[TagPair::new("testing", 1)])
            .unwrap();
        assert_eq!(tags.len(), 3); // reserved pair + testing

        let tags = st
            .sync_tags(1337, guid, &[TagPair::new("xyzzy", 100)])
            .unwrap();
        assert_eq!(tags.len(), 4);

        assert!(st
            .sync_tags(1337, guid, &[TagPair::new("xyzzy", 101)])
            .is_err());

        // state unchanged after the rejected merge
        let tags = st.get_tags(1337, guid).unwrap();
        assert!(tags.iter().any(|p| p.name == "xyzzy" && p.value == 100));
    }

    #[test]
    fn upload_claim_blocks_concurrent_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let st = store(&dir);
        let guid = Uuid::new_v4();
        let bytes = wire_shard("769f2", &[(FileKind::Store, "s")], &[]);
        st.unpack_shard(1337, guid, "foo", "769f2", &mut &bytes[..])
            .unwrap();

        // claim the id directly, then watch a pack bounce off it
        let claim = st
            .tracker
            .enter(UploadId::new(1337, guid, "foo", "769f2"))
            .unwrap();
        let mut out: Vec<u8> = Vec::new();
        assert!(matches!(
            st.pack_shard(1337, guid, "foo", "769f2", &mut out),
            Err(StoreError::Upload(_))
        ));
        drop(claim);
        let mut out: Vec<u8> = Vec::new();
        st.pack_shard(1337, guid, "foo", "769f2", &mut out)
            .unwrap();
    }
}
