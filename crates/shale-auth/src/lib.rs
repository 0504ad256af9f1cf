//! Password-file authentication.
//!
//! Customers authenticate with their decimal customer number and a shared
//! secret. Credentials live in a text file, one `<cid>:<bcrypt hash>`
//! line per customer, guarded by an exclusive advisory lock whenever it
//! is read or rewritten. Updates are atomic: a sibling `.tmp` file is
//! written, both files locked, and the temporary renamed over the
//! original. A hash field prefixed with `!` marks the account locked.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use shale_core::flock;
use thiserror::Error;

/// Default bcrypt cost for newly hashed passwords.
pub const DEFAULT_COST: u32 = 12;

/// Entries hashed below this cost fail to load.
pub const MIN_COST: u32 = 8;

const MAX_COST: u32 = 31;
const LOCK_PREFIX: char = '!';

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("empty authentication parameters")]
    EmptyParameters,

    #[error("invalid user")]
    UnknownUser,

    #[error("invalid password")]
    BadPassword,

    #[error("account is locked")]
    Locked,

    #[error("user id already exists")]
    UserExists,

    #[error("user id not found")]
    NotFound,

    #[error("password line is corrupt: {0:?}")]
    CorruptLine(String),

    #[error("password line has an invalid hash cost")]
    InvalidHashCost,

    #[error("{0} is not a regular file")]
    NotARegularFile(PathBuf),

    #[error("hash error: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    #[error(transparent)]
    Lock(#[from] flock::FlockError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The authentication contract the HTTP layer consumes.
pub trait Authenticator: Send + Sync {
    /// Exchange a customer number and password for the customer id.
    fn authenticate(&self, user: &str, pass: &str) -> Result<u64, AuthError>;
}

#[derive(Debug, Clone)]
struct UserEntry {
    cid: u64,
    hash: String,
    locked: bool,
}

impl UserEntry {
    fn parse(line: &str) -> Result<Self, AuthError> {
        let line = line.trim();
        let (cid, hash) = line
            .split_once(':')
            .ok_or_else(|| AuthError::CorruptLine(line.to_string()))?;
        let cid: u64 = cid
            .parse()
            .map_err(|_| AuthError::CorruptLine(line.to_string()))?;
        let (locked, hash) = match hash.strip_prefix(LOCK_PREFIX) {
            Some(rest) => (true, rest),
            None => (false, hash),
        };
        if hash_cost(hash)? < MIN_COST {
            return Err(AuthError::InvalidHashCost);
        }
        Ok(Self {
            cid,
            hash: hash.to_string(),
            locked,
        })
    }

    fn line(&self) -> String {
        if self.locked {
            format!("{}:{}{}", self.cid, LOCK_PREFIX, self.hash)
        } else {
            format!("{}:{}", self.cid, self.hash)
        }
    }
}

fn hash_cost(hash: &str) -> Result<u32, AuthError> {
    // modular crypt format: $2b$12$...
    let mut fields = hash.split('$');
    let _empty = fields.next();
    let _ident = fields.next();
    fields
        .next()
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| AuthError::CorruptLine(hash.to_string()))
}

fn clamp_cost(cost: u32) -> u32 {
    cost.clamp(MIN_COST, MAX_COST)
}

/// File-backed credential store.
pub struct PasswordFile {
    path: PathBuf,
    // serialises load/rewrite sequences within the process; the file
    // lock covers other processes
    guard: Mutex<()>,
}

impl PasswordFile {
    /// Open the password file, creating an empty one if absent.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let path = path.as_ref().to_path_buf();
        match std::fs::metadata(&path) {
            Ok(md) if !md.is_file() => return Err(AuthError::NotARegularFile(path)),
            Ok(_) => {
                // confirm we can open it read-write
                OpenOptions::new().read(true).write(true).open(&path)?;
            }
            Err(_) => {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)?;
            }
        }
        Ok(Self {
            path,
            guard: Mutex::new(()),
        })
    }

    /// Customer ids present in the file, with their locked state.
    pub fn list(&self) -> Result<Vec<(u64, bool)>, AuthError> {
        let _g = self.guard.lock().unwrap();
        let entries = self.load()?;
        Ok(entries.iter().map(|e| (e.cid, e.locked)).collect())
    }

    /// Append a new customer with the given bcrypt cost (clamped to the
    /// valid range).
    pub fn add_user(&self, cid: u64, pass: &str, cost: u32) -> Result<(), AuthError> {
        if cid == 0 || pass.is_empty() {
            return Err(AuthError::EmptyParameters);
        }
        let _g = self.guard.lock().unwrap();
        let entries = self.load()?;
        if entries.iter().any(|e| e.cid == cid) {
            return Err(AuthError::UserExists);
        }
        let hash = bcrypt::hash(pass, clamp_cost(cost))?;
        self.append(&UserEntry {
            cid,
            hash,
            locked: false,
        })
    }

    /// Remove a customer; the whole file is rewritten atomically.
    pub fn delete_user(&self, cid: u64) -> Result<(), AuthError> {
        if cid == 0 {
            return Err(AuthError::EmptyParameters);
        }
        let _g = self.guard.lock().unwrap();
        let mut entries = self.load()?;
        let before = entries.len();
        entries.retain(|e| e.cid != cid);
        if entries.len() == before {
            return Err(AuthError::NotFound);
        }
        self.rewrite(&entries)
    }

    /// Re-hash a customer's password, preserving the entry's cost.
    pub fn change_password(&self, cid: u64, pass: &str) -> Result<(), AuthError> {
        if cid == 0 || pass.is_empty() {
            return Err(AuthError::EmptyParameters);
        }
        let _g = self.guard.lock().unwrap();
        let mut entries = self.load()?;
        let entry = entries
            .iter_mut()
            .find(|e| e.cid == cid)
            .ok_or(AuthError::NotFound)?;
        let cost = clamp_cost(hash_cost(&entry.hash)?);
        entry.hash = bcrypt::hash(pass, cost)?;
        self.rewrite(&entries)
    }

    /// Open, lock, parse, and release the file.
    fn load(&self) -> Result<Vec<UserEntry>, AuthError> {
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        flock::lock_exclusive(&file)?;
        let result = Self::parse(&file);
        let unlocked = flock::unlock(&file);
        let entries = result?;
        unlocked?;
        Ok(entries)
    }

    fn parse(file: &File) -> Result<Vec<UserEntry>, AuthError> {
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(UserEntry::parse(&line)?);
        }
        Ok(entries)
    }

    fn append(&self, entry: &UserEntry) -> Result<(), AuthError> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        flock::lock_exclusive(&file)?;
        let written = writeln!(file, "{}", entry.line());
        let unlocked = flock::unlock(&file);
        written?;
        unlocked?;
        Ok(())
    }

    /// Write a sibling `.tmp`, lock both files, and rename over.
    fn rewrite(&self, entries: &[UserEntry]) -> Result<(), AuthError> {
        let tmp_path = self.path.with_extension("tmp");
        let result = (|| -> Result<(), AuthError> {
            let mut tmp = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            flock::lock_exclusive(&tmp)?;
            for e in entries {
                writeln!(tmp, "{}", e.line())?;
            }
            tmp.flush()?;

            let current = OpenOptions::new().read(true).write(true).open(&self.path)?;
            flock::lock_exclusive(&current)?;
            let renamed = std::fs::rename(&tmp_path, &self.path);
            let _ = flock::unlock(&tmp);
            let _ = flock::unlock(&current);
            renamed?;
            Ok(())
        })();
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
        }
        result
    }
}

impl Authenticator for PasswordFile {
    fn authenticate(&self, user: &str, pass: &str) -> Result<u64, AuthError> {
        if user.is_empty() || pass.is_empty() {
            return Err(AuthError::EmptyParameters);
        }
        let cid: u64 = user.parse().map_err(|_| AuthError::UnknownUser)?;
        let entries = {
            let _g = self.guard.lock().unwrap();
            self.load()?
        };
        for entry in entries {
            if entry.cid == cid {
                if entry.locked {
                    return Err(AuthError::Locked);
                }
                return if bcrypt::verify(pass, &entry.hash)? {
                    Ok(cid)
                } else {
                    tracing::info!(cid, "password verification failed");
                    Err(AuthError::BadPassword)
                };
            }
        }
        Err(AuthError::UnknownUser)
    }
}
