//! FTP backend.
//!
//! The server-side layout mirrors [`crate::FileStore`] beneath a
//! configured base directory, but the protocol forces three detours:
//! recursive directory creation is emulated component by component, a
//! directory-existence probe falls back to a `CWD` round-trip when the
//! server does not implement `MLSD`, and `tags.dat` is staged through a
//! local directory because read-modify-write cannot be done remotely.
//! Directory creation and `tags.dat` staging across all in-flight
//! operations are serialised by one process-global mutex so interleaved
//! creations cannot manufacture spurious already-exists failures.
//!
//! Connections are not pooled: every operation dials, logs in, and
//! quits.

use std::io::{self, Read, Write};
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shale_codec::{CodecError, UnpackHandler, Unpacker};
use shale_core::shard::shard_name_range;
use shale_core::{Timeframe, UploadId, UploadTracker};
use shale_tags::{TagPair, TagRegistry, TAG_FILE_NAME};
use suppaftp::{FtpError, FtpStream};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clean_entry_path;
use crate::error::StoreError;
use crate::pack::pack_dir_to_writer;
use crate::traits::ShardStore;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

// serialises remote directory creation and tags.dat staging across all
// in-flight operations
static FTP_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone)]
pub struct FtpStoreConfig {
    /// FTP server address as `host:port`.
    pub server: String,
    pub username: String,
    pub password: String,
    /// Base directory on the server beneath which everything lives.
    pub base_dir: String,
    /// Local directory for `tags.dat` copies and pack staging.
    pub local_store: PathBuf,
}

/// Backend persisting shards on an FTP server.
pub struct FtpStore {
    cfg: FtpStoreConfig,
    tracker: UploadTracker,
    registry: Arc<TagRegistry>,
}

impl FtpStore {
    pub fn new(cfg: FtpStoreConfig, registry: Arc<TagRegistry>) -> Result<Self, StoreError> {
        if cfg.base_dir.is_empty() {
            return Err(StoreError::MissingBaseDir);
        }
        Ok(Self {
            cfg,
            tracker: UploadTracker::new(),
            registry,
        })
    }

    fn connect(&self) -> Result<FtpStream, StoreError> {
        let addr = self
            .cfg
            .server
            .to_socket_addrs()
            .map_err(|e| StoreError::Ftp(format!("resolve {}: {e}", self.cfg.server)))?
            .next()
            .ok_or_else(|| StoreError::Ftp(format!("no address for {}", self.cfg.server)))?;
        let mut conn = FtpStream::connect_timeout(addr, DIAL_TIMEOUT).map_err(|e| {
            error!(server = %self.cfg.server, error = %e, "failed to dial ftp server");
            ftp_err(e)
        })?;
        conn.login(&self.cfg.username, &self.cfg.password)
            .map_err(|e| {
                error!(server = %self.cfg.server, error = %e, "ftp login failed");
                ftp_err(e)
            })?;
        Ok(conn)
    }

    fn indexer_dir(&self, cid: u64, indexer: Uuid) -> String {
        join_remote(
            &join_remote(&self.cfg.base_dir, &cid.to_string()),
            &indexer.to_string(),
        )
    }

    fn well_dir(&self, cid: u64, indexer: Uuid, well: &str) -> String {
        join_remote(&self.indexer_dir(cid, indexer), well)
    }

    fn shard_ranges(
        &self,
        conn: &mut FtpStream,
        cid: u64,
        indexer: Uuid,
        well: &str,
    ) -> Result<Vec<(String, chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>)>, StoreError>
    {
        let well_dir = self.well_dir(cid, indexer, well);
        let mut out = Vec::new();
        for (name, is_dir) in list_dir(conn, &well_dir)? {
            if !is_dir {
                continue;
            }
            if let Ok((s, e)) = shard_name_range(&name) {
                out.push((name, s, e));
            }
        }
        Ok(out)
    }
}

impl ShardStore for FtpStore {
    /// Make sure we can log in, list the base directory, and store a
    /// marker file beneath it.
    fn preflight(&self) -> Result<(), StoreError> {
        crate::writable_dir(&self.cfg.local_store)?;
        let mut conn = self.connect()?;
        conn.list(Some(self.cfg.base_dir.as_str())).map_err(ftp_err)?;
        let marker = format!("preflight test {}", chrono::Utc::now());
        conn.put_file(
            &join_remote(&self.cfg.base_dir, ".preflight_test"),
            &mut marker.as_bytes(),
        )
        .map_err(ftp_err)?;
        conn.quit().map_err(ftp_err)?;
        Ok(())
    }

    fn list_indexers(&self, cid: u64) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connect()?;
        let dir = join_remote(&self.cfg.base_dir, &cid.to_string());
        let entries = list_dir(&mut conn, &dir)?;
        let _ = conn.quit();
        Ok(entries
            .into_iter()
            .filter(|(name, is_dir)| *is_dir && Uuid::parse_str(name).is_ok())
            .map(|(name, _)| name)
            .collect())
    }

    fn list_indexer_wells(&self, cid: u64, indexer: Uuid) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connect()?;
        let dir = self.indexer_dir(cid, indexer);
        let entries = list_dir(&mut conn, &dir).map_err(|e| {
            error!(directory = %dir, error = %e, "failed to list indexer directory");
            e
        })?;
        let _ = conn.quit();
        Ok(entries
            .into_iter()
            .filter(|(_, is_dir)| *is_dir)
            .map(|(name, _)| name)
            .collect())
    }

    fn well_timeframe(
        &self,
        cid: u64,
        indexer: Uuid,
        well: &str,
    ) -> Result<Timeframe, StoreError> {
        let mut conn = self.connect()?;
        let ranges = self.shard_ranges(&mut conn, cid, indexer, well)?;
        let _ = conn.quit();
        let mut tf: Option<Timeframe> = None;
        for (_, s, e) in ranges {
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
        let mut conn = self.connect()?;
        let ranges = self.shard_ranges(&mut conn, cid, indexer, well)?;
        let _ = conn.quit();
        Ok(ranges
            .into_iter()
            .filter(|(_, s, e)| tf.overlaps(*s, *e))
            .map(|(name, _, _)| name)
            .collect())
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
        let mut conn = self.connect()?;

        let indexer_dir = self.indexer_dir(cid, indexer);
        let well_dir = join_remote(&indexer_dir, well);
        let base = join_remote(&well_dir, shard);
        let mut shard_dir = base.clone();
        let mut free = !dir_exists(&mut conn, &shard_dir);
        if !free {
            for i in 1..10_000 {
                shard_dir = format!("{base}.{i}");
                if !dir_exists(&mut conn, &shard_dir) {
                    free = true;
                    break;
                }
            }
        }
        if !free {
            let _ = conn.quit();
            return Err(StoreError::CollisionExhausted(shard.to_string()));
        }
        mkdir_all(&mut conn, &shard_dir).map_err(|e| {
            error!(directory = %shard_dir, error = %e, "failed to make shard directory");
            e
        })?;

        ensure_tags_dat(&mut conn, &self.cfg.local_store, &indexer_dir)?;

        let mut handler = FtpUnpackHandler {
            conn,
            registry: &self.registry,
            local_store: &self.cfg.local_store,
            cid,
            indexer,
            shard_dir: shard_dir.clone(),
            indexer_dir,
        };
        let result = Unpacker::new(shard, rdr).unpack(&mut handler);
        let mut conn = handler.conn;
        if let Err(e) = result {
            warn!(cid, %indexer, well, shard, error = %e, "unpack failed, removing remote shard directory");
            remove_dir_all_remote(&mut conn, &shard_dir);
            let _ = conn.quit();
            return Err(e.into());
        }
        let _ = conn.quit();
        info!(cid, %indexer, well, shard, "shard stored on ftp backend");
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
        let mut conn = self.connect()?;

        let remote_shard = join_remote(&self.well_dir(cid, indexer, well), shard);
        if !dir_exists(&mut conn, &remote_shard) {
            let _ = conn.quit();
            return Err(StoreError::NoSuchShard(shard.to_string()));
        }

        // mirror into local staging, pack from there, clean up regardless
        let local_shard = self
            .cfg
            .local_store
            .join(remote_shard.trim_start_matches('/'));
        std::fs::create_dir_all(&local_shard)?;
        let result = mirror_remote_dir(&mut conn, &remote_shard, &local_shard)
            .and_then(|()| pack_dir_to_writer(&local_shard, shard, wtr));
        let _ = std::fs::remove_dir_all(&local_shard);
        let _ = conn.quit();
        result
    }

    fn get_tags(&self, cid: u64, indexer: Uuid) -> Result<Vec<TagPair>, StoreError> {
        let mut conn = self.connect()?;
        let indexer_dir = self.indexer_dir(cid, indexer);
        let local_base = ensure_tags_dat(&mut conn, &self.cfg.local_store, &indexer_dir)?;
        let _ = conn.quit();

        let tm = self.registry.get(cid, indexer, &local_base)?;
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
        let mut conn = self.connect()?;
        let indexer_dir = self.indexer_dir(cid, indexer);
        let local_base = ensure_tags_dat(&mut conn, &self.cfg.local_store, &indexer_dir)?;

        let tm = self.registry.get(cid, indexer, &local_base)?;
        let merged = tm.merge(incoming).and_then(|_| tm.tag_set());
        let released = self.registry.release(cid, indexer);
        let tags = match merged {
            Ok(tags) => tags,
            Err(e) => {
                error!(cid, %indexer, error = %e, "failed to merge tags");
                let _ = conn.quit();
                return Err(e.into());
            }
        };
        released?;

        // publish the merged dictionary back to the server
        push_tags_dat(&mut conn, &self.cfg.local_store, &indexer_dir)?;
        let _ = conn.quit();
        Ok(tags)
    }
}

struct FtpUnpackHandler<'a> {
    conn: FtpStream,
    registry: &'a TagRegistry,
    local_store: &'a Path,
    cid: u64,
    indexer: Uuid,
    shard_dir: String,
    indexer_dir: String,
}

impl UnpackHandler for FtpUnpackHandler<'_> {
    fn handle_file(&mut self, rel_path: &str, rdr: &mut dyn Read) -> Result<(), CodecError> {
        let (dir, file) = clean_entry_path(rel_path);
        let mut dest = self.shard_dir.clone();
        if let Some(dir) = dir {
            dest = join_remote(&dest, &dir);
            mkdir_all(&mut self.conn, &dest).map_err(|e| CodecError::Handler(e.to_string()))?;
        }
        dest = join_remote(&dest, &file);
        let mut rdr = &mut *rdr;
        self.conn
            .put_file(&dest, &mut rdr)
            .map_err(|e| CodecError::Handler(e.to_string()))?;
        Ok(())
    }

    fn handle_tag_update(&mut self, pairs: Vec<TagPair>) -> Result<(), CodecError> {
        let local_base = ensure_tags_dat(&mut self.conn, self.local_store, &self.indexer_dir)
            .map_err(|e| CodecError::Handler(e.to_string()))?;
        let tm = self
            .registry
            .get(self.cid, self.indexer, &local_base)
            .map_err(|e| CodecError::Handler(e.to_string()))?;
        let merged = tm.merge(&pairs);
        let released = self.registry.release(self.cid, self.indexer);
        merged.map_err(|e| CodecError::Handler(e.to_string()))?;
        released.map_err(|e| CodecError::Handler(e.to_string()))?;
        push_tags_dat(&mut self.conn, self.local_store, &self.indexer_dir)
            .map_err(|e| CodecError::Handler(e.to_string()))?;
        Ok(())
    }
}

fn ftp_err(e: FtpError) -> StoreError {
    StoreError::Ftp(e.to_string())
}

fn status_code(err: &FtpError) -> Option<u32> {
    match err {
        FtpError::UnexpectedResponse(resp) => Some(resp.status as u32),
        _ => None,
    }
}

/// Join remote path components with `/`, never doubling separators.
fn join_remote(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// List a remote directory as `(name, is_directory)` pairs. Lines the
/// server formats unrecognisably are skipped.
fn list_dir(conn: &mut FtpStream, path: &str) -> Result<Vec<(String, bool)>, StoreError> {
    let lines = conn.list(Some(path)).map_err(ftp_err)?;
    let mut out = Vec::new();
    for line in lines {
        if let Ok(f) = suppaftp::list::File::try_from(line.as_str()) {
            let name = f.name().to_string();
            if name == "." || name == ".." {
                continue;
            }
            out.push((name, f.is_directory()));
        }
    }
    Ok(out)
}

/// Probe a remote directory, preferring `MLSD` and falling back to a
/// `CWD` round-trip (restoring the previous working directory) when the
/// server answers 502 not-implemented.
fn dir_exists(conn: &mut FtpStream, path: &str) -> bool {
    match conn.mlsd(Some(path)) {
        Ok(_) => true,
        Err(err) if status_code(&err) == Some(502) => {
            let Ok(prev) = conn.pwd() else {
                return false;
            };
            if conn.cwd(path).is_ok() {
                let _ = conn.cwd(&prev);
                true
            } else {
                false
            }
        }
        Err(_) => false,
    }
}

/// Emulated `mkdir -p`: walk the components, probing and creating each
/// in turn under the global FTP mutex.
fn mkdir_all(conn: &mut FtpStream, path: &str) -> Result<(), StoreError> {
    let _g = FTP_LOCK.lock().unwrap();
    mkdir_all_unlocked(conn, path)
}

/// Best-effort recursive removal of a remote directory.
fn remove_dir_all_remote(conn: &mut FtpStream, path: &str) {
    if let Ok(entries) = list_dir(conn, path) {
        for (name, is_dir) in entries {
            let child = join_remote(path, &name);
            if is_dir {
                remove_dir_all_remote(conn, &child);
            } else {
                let _ = conn.rm(&child);
            }
        }
    }
    let _ = conn.rmdir(path);
}

/// Mirror a remote shard directory into local staging.
fn mirror_remote_dir(
    conn: &mut FtpStream,
    remote: &str,
    local: &Path,
) -> Result<(), StoreError> {
    for (name, is_dir) in list_dir(conn, remote)? {
        let remote_child = join_remote(remote, &name);
        let local_child = local.join(&name);
        if is_dir {
            std::fs::create_dir_all(&local_child)?;
            mirror_remote_dir(conn, &remote_child, &local_child)?;
        } else {
            let mut body = conn.retr_as_buffer(&remote_child).map_err(ftp_err)?;
            let mut out = std::fs::File::create(&local_child)?;
            io::copy(&mut body, &mut out)?;
        }
    }
    Ok(())
}

/// Make sure a local copy of the indexer's `tags.dat` exists, fetching
/// it from the server when absent. A 551 file-not-found response leaves
/// a fresh empty file; any other retrieval error is fatal. Returns the
/// local base directory holding the file.
fn ensure_tags_dat(
    conn: &mut FtpStream,
    local_store: &Path,
    remote_indexer_dir: &str,
) -> Result<PathBuf, StoreError> {
    let _g = FTP_LOCK.lock().unwrap();
    let local_base = local_store.join(remote_indexer_dir.trim_start_matches('/'));
    let local_tags = local_base.join(TAG_FILE_NAME);
    if local_tags.exists() {
        return Ok(local_base);
    }
    std::fs::create_dir_all(&local_base)?;
    let mut out = std::fs::File::create(&local_tags)?;
    match conn.retr_as_buffer(&join_remote(remote_indexer_dir, TAG_FILE_NAME)) {
        Ok(mut body) => {
            io::copy(&mut body, &mut out)?;
        }
        Err(err) if status_code(&err) == Some(551) => {
            // nothing on the server yet: the empty local file stands
        }
        Err(err) => {
            drop(out);
            let _ = std::fs::remove_file(&local_tags);
            return Err(ftp_err(err));
        }
    }
    Ok(local_base)
}

/// Upload the local `tags.dat` back to the server.
fn push_tags_dat(
    conn: &mut FtpStream,
    local_store: &Path,
    remote_indexer_dir: &str,
) -> Result<(), StoreError> {
    let _g = FTP_LOCK.lock().unwrap();
    let local_tags = local_store
        .join(remote_indexer_dir.trim_start_matches('/'))
        .join(TAG_FILE_NAME);
    let mut file = std::fs::File::open(&local_tags)?;
    mkdir_all_unlocked(conn, remote_indexer_dir)?;
    conn.put_file(
        &join_remote(remote_indexer_dir, TAG_FILE_NAME),
        &mut file,
    )
    .map_err(ftp_err)?;
    Ok(())
}

/// `mkdir_all` body without taking the global mutex; for callers that
/// already hold it.
fn mkdir_all_unlocked(conn: &mut FtpStream, path: &str) -> Result<(), StoreError> {
    let absolute = path.starts_with('/');
    let mut prefix = String::new();
    for comp in path.split('/').filter(|c| !c.is_empty()) {
        if prefix.is_empty() && !absolute {
            prefix = comp.to_string();
        } else {
            prefix = format!("{prefix}/{comp}");
        }
        if !dir_exists(conn, &prefix) {
            conn.mkdir(&prefix).map_err(ftp_err)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_joins_never_double_separators() {
        assert_eq!(join_remote("/archive", "1337"), "/archive/1337");
        assert_eq!(join_remote("/archive/", "1337"), "/archive/1337");
        assert_eq!(join_remote("", "1337"), "1337");
        assert_eq!(join_remote("archive", "x"), "archive/x");
    }

    #[test]
    fn config_requires_base_dir() {
        let cfg = FtpStoreConfig {
            server: "127.0.0.1:21".into(),
            username: "u".into(),
            password: "p".into(),
            base_dir: String::new(),
            local_store: PathBuf::from("/tmp"),
        };
        assert!(matches!(
            FtpStore::new(cfg, Arc::new(TagRegistry::new())),
            Err(StoreError::MissingBaseDir)
        ));
    }
}
