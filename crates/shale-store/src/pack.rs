//! Shared packing helpers: feeding a shard directory into a packer and
//! the two-thread pack-and-copy orchestration.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use shale_codec::{FileKind, Packer, PackerReader};
use shale_core::shard::trim_version;

use crate::error::StoreError;

/// Add a shard directory's files to a packer in the fixed wire order:
/// verify (optional on disk), index, store, then whichever accelerator
/// form is present.
pub fn add_shard_files(dir: &Path, id: &str, packer: &Packer) -> Result<(), StoreError> {
    let id = trim_version(id);
    add_file(dir, id, FileKind::Verify, packer, true)?;
    add_file(dir, id, FileKind::Index, packer, false)?;
    add_file(dir, id, FileKind::Store, packer, false)?;

    let accel = dir.join(FileKind::Accel.entry_name(id));
    match std::fs::metadata(&accel) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
        Ok(md) if md.is_file() => add_file(dir, id, FileKind::Accel, packer, false),
        Ok(_) => {
            add_file(dir, id, FileKind::AccelKeys, packer, false)?;
            add_file(dir, id, FileKind::AccelData, packer, false)
        }
    }
}

fn add_file(
    dir: &Path,
    id: &str,
    kind: FileKind,
    packer: &Packer,
    optional: bool,
) -> Result<(), StoreError> {
    let path = dir.join(kind.disk_path(id));
    let mut file = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound && optional => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let md = file.metadata()?;
    if !md.is_file() {
        return Err(StoreError::NotARegularFile(path));
    }
    packer.add_file(kind, md.len(), &mut file)?;
    Ok(())
}

/// Run the pack-and-copy pair for a shard directory: one thread feeds
/// the packer, the other relays the stream into `wtr`. Either side's
/// failure closes the packer with that error so the other side fails
/// promptly, and both sides are joined before returning.
pub(crate) fn pack_dir_to_writer(
    dir: &Path,
    shard: &str,
    wtr: &mut (dyn Write + Send),
) -> Result<(), StoreError> {
    let (packer, reader) = Packer::new(trim_version(shard));

    std::thread::scope(|s| {
        let copier = s.spawn(move || -> Result<(), StoreError> {
            let mut reader: PackerReader = reader;
            io::copy(&mut reader, wtr)?;
            Ok(())
        });

        let fed = add_shard_files(dir, shard, &packer)
            .and_then(|()| packer.flush().map_err(StoreError::from))
            .and_then(|()| packer.close().map_err(StoreError::from));
        if let Err(e) = &fed {
            let _ = packer.close_with_error(e.to_string());
        }

        let copied = copier.join().map_err(|_| StoreError::WorkerPanic)?;
        fed.and(copied)
    })
}

/// Read one component into memory; test helper used by backends' suites.
#[cfg(test)]
pub(crate) fn slurp(dir: &Path, rel: &str) -> Vec<u8> {
    std::fs::read(dir.join(rel)).unwrap()
}
