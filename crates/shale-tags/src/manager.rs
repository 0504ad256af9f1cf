//! The tag manager: one open, exclusively locked `tags.dat`.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use shale_core::flock;

use crate::error::TagError;
use crate::pair::{
    check_tag, check_tag_set, reserved_pairs, TagId, TagPair, DEFAULT_TAG_ID, DEFAULT_TAG_NAME,
    GRAVWELL_TAG_ID, GRAVWELL_TAG_NAME,
};

/// Manages one indexer's tag dictionary.
///
/// The backing file is created and seeded with the reserved mappings on
/// first open, parsed and validated on every open, and held under an
/// exclusive advisory lock until [`TagManager::close`]. Every operation
/// is serialised by an instance mutex, so a manager can be shared freely
/// across tasks.
pub struct TagManager {
    inner: Mutex<Inner>,
}

struct Inner {
    by_name: HashMap<String, TagId>,
    by_id: HashMap<TagId, String>,
    next_tag: TagId,
    file: Option<File>,
    path: PathBuf,
}

impl TagManager {
    /// Open (or create) the dictionary at `path` and take its lock.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TagError> {
        let path = path.as_ref().to_path_buf();
        let mut new_file = false;
        let mut file = match std::fs::metadata(&path) {
            Ok(md) => {
                if !md.is_file() {
                    return Err(TagError::NotARegularFile(path));
                }
                OpenOptions::new().read(true).write(true).open(&path)?
            }
            Err(_) => {
                new_file = true;
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(&path)?
            }
        };
        flock::lock_exclusive(&file)?;
        match Self::load(&mut file, new_file) {
            Ok((by_name, by_id, next_tag)) => Ok(Self {
                inner: Mutex::new(Inner {
                    by_name,
                    by_id,
                    next_tag,
                    file: Some(file),
                    path,
                }),
            }),
            Err(e) => {
                let _ = flock::unlock(&file);
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn load(
        file: &mut File,
        new_file: bool,
    ) -> Result<(HashMap<String, TagId>, HashMap<TagId, String>, TagId), TagError> {
        if new_file {
            for p in reserved_pairs() {
                writeln!(file, "{}={}", p.name, p.value)?;
            }
            file.flush()?;
        }
        file.seek(SeekFrom::Start(0))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let mut by_name = HashMap::new();
        let mut by_id = HashMap::new();
        for raw in contents.lines() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let (name, id) = parse_line(line)?;
            check_reserved_line(&name, id)?;
            if by_id.contains_key(&id) {
                return Err(TagError::DuplicateId(id));
            }
            if by_name.contains_key(&name) {
                return Err(TagError::DuplicateName(name));
            }
            by_id.insert(id, name.clone());
            by_name.insert(name, id);
        }

        // older dictionaries may predate the reserved mappings
        for p in reserved_pairs() {
            ensure_in_maps(&mut by_name, &mut by_id, &p)?;
        }

        let next_tag = find_next_available(&by_id)?;
        Ok((by_name, by_id, next_tag))
    }

    /// Allocate the next free id for `name`, failing if it already exists.
    pub fn add_tag(&self, name: &str) -> Result<(), TagError> {
        let name = name.trim();
        let mut inner = self.inner.lock().unwrap();
        inner.active()?;
        if inner.by_name.contains_key(name) {
            return Err(TagError::AlreadyPresent(name.to_string()));
        }
        inner.allocate(name)?;
        Ok(())
    }

    /// Add every name, skipping those already present.
    pub fn import_tags<I, S>(&self, names: I) -> Result<(), TagError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut inner = self.inner.lock().unwrap();
        inner.active()?;
        for name in names {
            inner.get_and_populate(name.as_ref().trim())?;
        }
        Ok(())
    }

    /// Assert that the exact `(id, name)` pair exists; insert it when
    /// neither side is present, fail when only one side matches.
    pub fn ensure_tag(&self, id: TagId, name: &str) -> Result<(), TagError> {
        let mut inner = self.inner.lock().unwrap();
        inner.active()?;
        let by_id = inner.by_id.get(&id).cloned();
        let by_name = inner.by_name.get(name).copied();
        match (by_id, by_name) {
            (None, None) => {
                inner.by_id.insert(id, name.to_string());
                inner.by_name.insert(name.to_string(), id);
                Ok(())
            }
            (cur_name, cur_id) => {
                if cur_id == Some(id) && cur_name.as_deref() == Some(name) {
                    Ok(())
                } else {
                    Err(TagError::EnsureConflict {
                        name: name.to_string(),
                        id,
                    })
                }
            }
        }
    }

    pub fn get_tag(&self, name: &str) -> Result<TagId, TagError> {
        let inner = self.inner.lock().unwrap();
        inner.active()?;
        inner
            .by_name
            .get(name.trim())
            .copied()
            .ok_or(TagError::NotFound)
    }

    pub fn reverse_lookup(&self, id: TagId) -> Result<String, TagError> {
        let inner = self.inner.lock().unwrap();
        inner.active()?;
        inner.by_id.get(&id).cloned().ok_or(TagError::NotFound)
    }

    /// Look the name up, allocating a fresh id when absent.
    pub fn get_and_populate(&self, name: &str) -> Result<TagId, TagError> {
        let mut inner = self.inner.lock().unwrap();
        inner.active()?;
        inner.get_and_populate(name.trim())
    }

    /// The full dictionary, ordered by id.
    pub fn tag_set(&self) -> Result<Vec<TagPair>, TagError> {
        let inner = self.inner.lock().unwrap();
        inner.active()?;
        let mut pairs: Vec<TagPair> = inner
            .by_name
            .iter()
            .map(|(n, &v)| TagPair::new(n.clone(), v))
            .collect();
        pairs.sort_by_key(|p| p.value);
        Ok(pairs)
    }

    /// The subset of the dictionary covering `ids`; every id must exist.
    pub fn get_tag_submap(&self, ids: &[TagId]) -> Result<HashMap<String, TagId>, TagError> {
        let inner = self.inner.lock().unwrap();
        inner.active()?;
        let mut map = HashMap::with_capacity(ids.len());
        for &id in ids {
            let name = inner.by_id.get(&id).cloned().ok_or(TagError::NotFound)?;
            map.insert(name, id);
        }
        Ok(map)
    }

    /// Merge an incoming pair list. Pairs already present must match
    /// exactly; unknown pairs are assigned verbatim. Returns whether any
    /// pair was added. A conflicting pair fails the call; pairs applied
    /// before the conflict remain, as the file is append-only.
    pub fn merge(&self, incoming: &[TagPair]) -> Result<bool, TagError> {
        check_tag_set(incoming)?;
        let mut inner = self.inner.lock().unwrap();
        inner.active()?;
        let mut updated = false;
        for pair in incoming {
            let mut hit = false;
            if let Some(current) = inner.by_id.get(&pair.value) {
                if current != &pair.name {
                    return Err(TagError::MergeConflict(pair.name.clone()));
                }
                hit = true;
            }
            if let Some(&current) = inner.by_name.get(&pair.name) {
                if current != pair.value {
                    return Err(TagError::MergeConflict(pair.name.clone()));
                }
                hit = true;
            }
            if !hit {
                inner.assign(&pair.name, pair.value)?;
                updated = true;
            }
        }
        Ok(updated)
    }

    /// Truncate the dictionary and rewrite it from `set`. The reserved
    /// pairs are always emitted first; incoming entries carrying a
    /// reserved id are dropped.
    pub fn reset_override(&self, set: &[TagPair]) -> Result<(), TagError> {
        check_tag_set(set)?;
        let kept: Vec<&TagPair> = set
            .iter()
            .filter(|p| p.value != DEFAULT_TAG_ID && p.value != GRAVWELL_TAG_ID)
            .collect();
        // the incoming set must itself be bijective
        let mut seen_names = HashMap::new();
        let mut seen_ids = HashMap::new();
        for p in &kept {
            check_tag(&p.name)?;
            if seen_names.insert(p.name.as_str(), p.value).is_some() {
                return Err(TagError::DuplicateName(p.name.clone()));
            }
            if seen_ids.insert(p.value, p.name.as_str()).is_some() {
                return Err(TagError::DuplicateId(p.value));
            }
        }

        let mut inner = self.inner.lock().unwrap();
        inner.active()?;
        {
            let file = inner.file.as_mut().ok_or(TagError::NotActive)?;
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            for p in reserved_pairs() {
                writeln!(file, "{}={}", p.name, p.value)?;
            }
            for p in &kept {
                writeln!(file, "{}={}", p.name, p.value)?;
            }
            file.flush()?;
        }
        inner.by_name.clear();
        inner.by_id.clear();
        for p in reserved_pairs() {
            inner.by_id.insert(p.value, p.name.clone());
            inner.by_name.insert(p.name, p.value);
        }
        for p in kept {
            inner.by_id.insert(p.value, p.name.clone());
            inner.by_name.insert(p.name.clone(), p.value);
        }
        inner.next_tag = find_next_available(&inner.by_id)?;
        Ok(())
    }

    /// Number of tags in the dictionary.
    pub fn count(&self) -> Result<usize, TagError> {
        let inner = self.inner.lock().unwrap();
        inner.active()?;
        Ok(inner.by_name.len())
    }

    pub fn active(&self) -> bool {
        self.inner.lock().unwrap().file.is_some()
    }

    /// Path of the backing dictionary file.
    pub fn path(&self) -> PathBuf {
        self.inner.lock().unwrap().path.clone()
    }

    /// Release the file lock and close the backing file. All subsequent
    /// operations fail.
    pub fn close(&self) -> Result<(), TagError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.file.take() {
            Some(file) => {
                let unlocked = flock::unlock(&file);
                drop(file);
                unlocked.map_err(TagError::from)
            }
            None => Ok(()),
        }
    }
}

impl Inner {
    fn active(&self) -> Result<(), TagError> {
        if self.file.is_none() {
            return Err(TagError::NotActive);
        }
        Ok(())
    }

    fn append_line(&mut self, name: &str, id: TagId) -> Result<(), TagError> {
        let file = self.file.as_mut().ok_or(TagError::NotActive)?;
        file.seek(SeekFrom::End(0))?;
        writeln!(file, "{name}={id}")?;
        Ok(())
    }

    fn assign(&mut self, name: &str, id: TagId) -> Result<(), TagError> {
        check_tag(name)?;
        self.append_line(name, id)?;
        self.by_id.insert(id, name.to_string());
        self.by_name.insert(name.to_string(), id);
        Ok(())
    }

    fn allocate(&mut self, name: &str) -> Result<TagId, TagError> {
        check_tag(name)?;
        if self.by_id.contains_key(&self.next_tag) {
            self.next_tag = find_next_available(&self.by_id)?;
        }
        let id = self.next_tag;
        self.assign(name, id)?;
        self.next_tag = self.next_tag.wrapping_add(1);
        Ok(id)
    }

    fn get_and_populate(&mut self, name: &str) -> Result<TagId, TagError> {
        if let Some(&id) = self.by_name.get(name) {
            return Ok(id);
        }
        self.allocate(name)
    }
}

impl Drop for TagManager {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn parse_line(line: &str) -> Result<(String, TagId), TagError> {
    let mut bits = line.splitn(2, '=');
    let name = bits.next().unwrap_or_default().trim();
    let value = bits.next().unwrap_or_default().trim();
    if name.is_empty() || value.is_empty() {
        return Err(TagError::MalformedLine(line.to_string()));
    }
    let id: TagId = value
        .parse()
        .map_err(|_| TagError::MalformedLine(line.to_string()))?;
    Ok((name.to_string(), id))
}

fn check_reserved_line(name: &str, id: TagId) -> Result<(), TagError> {
    let default_broken =
        (id == DEFAULT_TAG_ID) != (name == DEFAULT_TAG_NAME);
    let gravwell_broken =
        (id == GRAVWELL_TAG_ID) != (name == GRAVWELL_TAG_NAME);
    if default_broken || gravwell_broken {
        return Err(TagError::ReservedMismatch(name.to_string()));
    }
    Ok(())
}

fn ensure_in_maps(
    by_name: &mut HashMap<String, TagId>,
    by_id: &mut HashMap<TagId, String>,
    pair: &TagPair,
) -> Result<(), TagError> {
    let cur_name = by_id.get(&pair.value);
    let cur_id = by_name.get(&pair.name);
    match (cur_name, cur_id) {
        (None, None) => {
            by_id.insert(pair.value, pair.name.clone());
            by_name.insert(pair.name.clone(), pair.value);
            Ok(())
        }
        (n, v) => {
            if n.map(String::as_str) == Some(pair.name.as_str()) && v == Some(&pair.value) {
                Ok(())
            } else {
                Err(TagError::EnsureConflict {
                    name: pair.name.clone(),
                    id: pair.value,
                })
            }
        }
    }
}

fn find_next_available(by_id: &HashMap<TagId, String>) -> Result<TagId, TagError> {
    (1..GRAVWELL_TAG_ID)
        .find(|id| !by_id.contains_key(id))
        .ok_or(TagError::Exhausted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag_file(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("tags.dat")
    }

    #[test]
    fn open_seeds_reserved_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let tm = TagManager::open(tag_file(&dir)).unwrap();
        assert_eq!(tm.get_tag(DEFAULT_TAG_NAME).unwrap(), DEFAULT_TAG_ID);
        assert_eq!(tm.get_tag(GRAVWELL_TAG_NAME).unwrap(), GRAVWELL_TAG_ID);
        assert_eq!(tm.count().unwrap(), 2);
        tm.close().unwrap();
    }

    #[test]
    fn open_close_reopen_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        for _ in 0..2 {
            let tm = TagManager::open(tag_file(&dir)).unwrap();
            tm.close().unwrap();
        }
    }

    #[test]
    fn second_open_hits_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let tm = TagManager::open(tag_file(&dir)).unwrap();
        // a second handle in the same process steals a record lock, so
        // simulate the second opener from a child that merely checks the
        // manager contract: not applicable cross-handle here. Closing and
        // reopening must still work.
        tm.close().unwrap();
        let tm = TagManager::open(tag_file(&dir)).unwrap();
        tm.close().unwrap();
    }

    #[test]
    fn add_and_retrieve_many() {
        let dir = tempfile::tempdir().unwrap();
        let tm = TagManager::open(tag_file(&dir)).unwrap();
        for i in 0..0xff {
            tm.add_tag(&format!("namedtag{i}")).unwrap();
        }
        for i in 0..0xff {
            let id = tm.get_tag(&format!("namedtag{i}")).unwrap();
            assert_ne!(id, 0);
            assert_eq!(tm.reverse_lookup(id).unwrap(), format!("namedtag{i}"));
        }
        assert!(tm.add_tag("namedtag0").is_err());
        tm.close().unwrap();
    }

    #[test]
    fn import_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let tm = TagManager::open(tag_file(&dir)).unwrap();
        let names: Vec<String> = (0..32).map(|i| format!("imported{i}")).collect();
        tm.import_tags(&names).unwrap();
        let before = tm.count().unwrap();
        tm.import_tags(&names).unwrap();
        assert_eq!(tm.count().unwrap(), before);
        tm.close().unwrap();
    }

    #[test]
    fn dictionary_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let tm = TagManager::open(tag_file(&dir)).unwrap();
        let id = tm.get_and_populate("thisisatest").unwrap();
        tm.close().unwrap();

        let tm = TagManager::open(tag_file(&dir)).unwrap();
        assert_eq!(tm.get_tag("thisisatest").unwrap(), id);
        assert_eq!(tm.reverse_lookup(id).unwrap(), "thisisatest");
        tm.close().unwrap();
    }

    #[test]
    fn merge_adds_checks_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let tm = TagManager::open(tag_file(&dir)).unwrap();

        let set = vec![TagPair::new("chucktesta", 99)];
        assert!(tm.merge(&set).unwrap());
        assert_eq!(tm.get_tag("chucktesta").unwrap(), 99);

        // merging the same set again is a no-op
        assert!(!tm.merge(&set).unwrap());

        // a conflicting id for a known name fails without corrupting state
        let bad = vec![TagPair::new("chucktesta", 199)];
        assert!(tm.merge(&bad).is_err());
        assert_eq!(tm.get_tag("chucktesta").unwrap(), 99);

        // a known id under a different name fails too
        let bad = vec![TagPair::new("impostor", 99)];
        assert!(tm.merge(&bad).is_err());
        tm.close().unwrap();

        // merged tags persist
        let tm = TagManager::open(tag_file(&dir)).unwrap();
        assert_eq!(tm.get_tag("chucktesta").unwrap(), 99);
        tm.close().unwrap();
    }

    #[test]
    fn merge_rejects_reserved_violations() {
        let dir = tempfile::tempdir().unwrap();
        let tm = TagManager::open(tag_file(&dir)).unwrap();
        assert!(tm.merge(&[TagPair::new(DEFAULT_TAG_NAME, 7)]).is_err());
        assert!(tm.merge(&[TagPair::new(GRAVWELL_TAG_NAME, 7)]).is_err());
        // the correct reserved pairs merge as no-ops
        assert!(!tm.merge(&reserved_pairs().to_vec()).unwrap());
        tm.close().unwrap();
    }

    #[test]
    fn reset_override_rewrites_the_dictionary() {
        let dir = tempfile::tempdir().unwrap();
        let tm = TagManager::open(tag_file(&dir)).unwrap();
        let old = tm.get_and_populate("thisisatest").unwrap();

        tm.reset_override(&[TagPair::new("thisisatest", 40)]).unwrap();
        let now = tm.get_tag("thisisatest").unwrap();
        assert_ne!(now, old);
        assert_eq!(now, 40);
        assert_eq!(tm.get_tag(DEFAULT_TAG_NAME).unwrap(), DEFAULT_TAG_ID);
        assert_eq!(tm.get_tag(GRAVWELL_TAG_NAME).unwrap(), GRAVWELL_TAG_ID);

        // entries squatting on reserved ids are dropped
        tm.reset_override(&[TagPair::new("sneaky", DEFAULT_TAG_ID)])
            .unwrap();
        assert!(tm.get_tag("sneaky").is_err());
        assert_eq!(tm.get_tag(DEFAULT_TAG_NAME).unwrap(), DEFAULT_TAG_ID);
        tm.close().unwrap();

        // the truncated file reloads cleanly
        let tm = TagManager::open(tag_file(&dir)).unwrap();
        assert_eq!(tm.count().unwrap(), 2);
        tm.close().unwrap();
    }

    #[test]
    fn reset_override_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let tm = TagManager::open(tag_file(&dir)).unwrap();
        let dup_name = vec![TagPair::new("a", 4), TagPair::new("a", 5)];
        assert!(tm.reset_override(&dup_name).is_err());
        let dup_id = vec![TagPair::new("a", 4), TagPair::new("b", 4)];
        assert!(tm.reset_override(&dup_id).is_err());
        tm.close().unwrap();
    }

    #[test]
    fn submap_returns_requested_subset() {
        let dir = tempfile::tempdir().unwrap();
        let tm = TagManager::open(tag_file(&dir)).unwrap();
        let id = tm.get_and_populate("thisisatest").unwrap();
        let map = tm.get_tag_submap(&[id]).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["thisisatest"], id);
        assert!(tm.get_tag_submap(&[0x7ffe]).is_err());
        tm.close().unwrap();
    }

    #[test]
    fn operations_fail_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let tm = TagManager::open(tag_file(&dir)).unwrap();
        tm.close().unwrap();
        assert!(!tm.active());
        assert!(matches!(tm.get_tag("x"), Err(TagError::NotActive)));
        assert!(matches!(tm.add_tag("x"), Err(TagError::NotActive)));
        assert!(matches!(tm.tag_set(), Err(TagError::NotActive)));
    }

    #[test]
    fn reload_rejects_duplicate_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = tag_file(&dir);
        std::fs::write(&path, "default=0\ngravwell=65535\nfoo=7\nfoo=8\n").unwrap();
        assert!(TagManager::open(&path).is_err());

        std::fs::write(&path, "default=0\ngravwell=65535\nfoo=7\nbar=7\n").unwrap();
        assert!(TagManager::open(&path).is_err());
    }

    #[test]
    fn reload_rejects_reserved_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = tag_file(&dir);
        std::fs::write(&path, "default=3\n").unwrap();
        assert!(TagManager::open(&path).is_err());

        std::fs::write(&path, "other=0\n").unwrap();
        assert!(TagManager::open(&path).is_err());
    }

    #[test]
    fn bijection_holds_after_mixed_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let tm = TagManager::open(tag_file(&dir)).unwrap();
        tm.add_tag("alpha").unwrap();
        tm.import_tags(["beta", "gamma"]).unwrap();
        tm.merge(&[TagPair::new("delta", 500)]).unwrap();
        for pair in tm.tag_set().unwrap() {
            assert_eq!(tm.get_tag(&pair.name).unwrap(), pair.value);
            assert_eq!(tm.reverse_lookup(pair.value).unwrap(), pair.name);
        }
        tm.close().unwrap();
    }
}
