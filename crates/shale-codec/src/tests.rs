use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::thread;

use shale_tags::TagPair;

use crate::{CodecError, FileKind, Packer, UnpackHandler, Unpacker};

/// Handler that materialises files under a directory and records tag
/// updates, mirroring what a backend does.
struct DirHandler {
    dir: PathBuf,
    tag_updates: Vec<Vec<TagPair>>,
}

impl DirHandler {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            tag_updates: Vec::new(),
        }
    }
}

impl UnpackHandler for DirHandler {
    fn handle_file(&mut self, rel_path: &str, rdr: &mut dyn Read) -> Result<(), CodecError> {
        let target = self.dir.join(rel_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(target)?;
        io::copy(rdr, &mut out)?;
        Ok(())
    }

    fn handle_tag_update(&mut self, pairs: Vec<TagPair>) -> Result<(), CodecError> {
        self.tag_updates.push(pairs);
        Ok(())
    }
}

fn cycle(id: &str, files: &[(FileKind, &str)]) -> (tempfile::TempDir, DirHandler) {
    let dir = tempfile::tempdir().unwrap();
    let handler = DirHandler::new(dir.path().to_path_buf());

    let (packer, reader) = Packer::new(id);
    let unpacker = Unpacker::new(id, reader);
    let unpack = thread::scope(|s| {
        let worker = s.spawn(move || {
            let mut h = handler;
            let res = unpacker.unpack(&mut h);
            (res, h)
        });

        packer
            .add_tags(&[TagPair::new("test", 1), TagPair::new("test2", 2)])
            .unwrap();
        packer
            .add_well_tags(&["test".to_string(), "test2".to_string()])
            .unwrap();
        for (kind, content) in files {
            packer
                .add_file(*kind, content.len() as u64, &mut content.as_bytes())
                .unwrap();
        }
        packer.flush().unwrap();
        packer.close().unwrap();

        worker.join().unwrap()
    });
    let (res, handler) = unpack;
    res.unwrap();
    (dir, handler)
}

fn assert_files(dir: &tempfile::TempDir, id: &str, files: &[(FileKind, &str)]) {
    for (kind, content) in files {
        let got = fs::read_to_string(dir.path().join(kind.disk_path(id))).unwrap();
        assert_eq!(&got, content, "mismatch for {kind:?}");
    }
}

#[test]
fn roundtrip_without_accelerator() {
    let id = "deadbeef03";
    let files = [
        (FileKind::Store, "store"),
        (FileKind::Index, "index"),
        (FileKind::Verify, "verify"),
    ];
    let (dir, handler) = cycle(id, &files);
    assert_files(&dir, id, &files);
    assert_eq!(handler.tag_updates.len(), 1);
    assert_eq!(handler.tag_updates[0].len(), 2);
}

#[test]
fn roundtrip_with_flat_accelerator() {
    let id = "deadbeef04";
    let files = [
        (FileKind::Store, "store"),
        (FileKind::Index, "index"),
        (FileKind::Verify, "verify"),
        (FileKind::Accel, "accelerator"),
    ];
    let (dir, _) = cycle(id, &files);
    assert_files(&dir, id, &files);
}

#[test]
fn roundtrip_with_indexed_accelerator() {
    let id = "deadbeef05";
    let files = [
        (FileKind::Store, "store"),
        (FileKind::Index, "index"),
        (FileKind::Verify, "verify"),
        (FileKind::AccelKeys, "keystuff"),
        (FileKind::AccelData, "datastuff"),
    ];
    let (dir, _) = cycle(id, &files);
    assert_files(&dir, id, &files);
    assert!(dir.path().join(format!("{id}.accel")).is_dir());
}

#[test]
fn packer_rejects_repeats_and_mixed_accelerators() {
    let (packer, reader) = Packer::new("deadbeef02");
    // drain in the background so writes never block
    let drain = thread::spawn(move || {
        let mut r = reader;
        io::copy(&mut r, &mut io::sink())
    });

    for (kind, content) in [
        (FileKind::Store, "store"),
        (FileKind::Index, "index"),
        (FileKind::Verify, "verify"),
        (FileKind::Accel, "accelerator"),
    ] {
        packer
            .add_file(kind, content.len() as u64, &mut content.as_bytes())
            .unwrap();
    }

    let body = b"a test";
    for kind in [
        FileKind::Store,
        FileKind::Index,
        FileKind::Verify,
        FileKind::Accel,
        FileKind::AccelKeys,
        FileKind::AccelData,
    ] {
        assert!(
            packer
                .add_file(kind, body.len() as u64, &mut &body[..])
                .is_err(),
            "expected repeat of {kind:?} to fail"
        );
    }

    packer.close().unwrap();
    drain.join().unwrap().unwrap();
}

#[test]
fn unpack_missing_store_fails_lenient() {
    let (packer, reader) = Packer::new("deadbeef06");
    let unpacker = Unpacker::new("deadbeef06", reader);

    let dir = tempfile::tempdir().unwrap();
    let res = thread::scope(|s| {
        let worker = s.spawn(move || {
            let mut h = DirHandler::new(dir.path().to_path_buf());
            unpacker.unpack(&mut h)
        });
        packer
            .add_file(FileKind::Index, 5, &mut "index".as_bytes())
            .unwrap();
        packer.close().unwrap();
        worker.join().unwrap()
    });
    assert!(matches!(res, Err(CodecError::Missing(FileKind::Store))));
}

#[test]
fn strict_unpack_requires_every_component() {
    let (packer, reader) = Packer::new("deadbeef07");
    let unpacker = Unpacker::new("deadbeef07", reader).strict(true);

    let dir = tempfile::tempdir().unwrap();
    let res = thread::scope(|s| {
        let worker = s.spawn(move || {
            let mut h = DirHandler::new(dir.path().to_path_buf());
            unpacker.unpack(&mut h)
        });
        // store only: fine leniently, incomplete strictly
        packer
            .add_file(FileKind::Store, 5, &mut "store".as_bytes())
            .unwrap();
        packer.close().unwrap();
        worker.join().unwrap()
    });
    assert!(matches!(res, Err(CodecError::Missing(_))));
}

#[test]
fn abort_propagates_to_the_unpacker() {
    let (packer, reader) = Packer::new("feedfebe00");
    let unpacker = Unpacker::new("feedfebe00", reader);

    let dir = tempfile::tempdir().unwrap();
    let res = thread::scope(|s| {
        let worker = s.spawn(move || {
            let mut h = DirHandler::new(dir.path().to_path_buf());
            unpacker.unpack(&mut h)
        });
        packer
            .add_file(FileKind::Store, 5, &mut "stuff".as_bytes())
            .unwrap();
        packer.close_with_error("testing").unwrap();
        worker.join().unwrap()
    });
    assert!(res.is_err());
}

#[test]
fn cancelled_unpack_fails_promptly() {
    let (packer, reader) = Packer::new("feedfebe01");
    let unpacker = Unpacker::new("feedfebe01", reader);
    let cancel = unpacker.cancel_handle();
    cancel.cancel();

    let dir = tempfile::tempdir().unwrap();
    let res = thread::scope(|s| {
        let worker = s.spawn(move || {
            let mut h = DirHandler::new(dir.path().to_path_buf());
            unpacker.unpack(&mut h)
        });
        // the unpacker never consumes, so poison rather than block
        let _ = packer.close_with_error("peer cancelled");
        worker.join().unwrap()
    });
    assert!(res.is_err());
}

#[test]
fn versioned_shard_id_places_files_under_bare_id() {
    let id = "769f2.1";
    let files = [(FileKind::Store, "store stuff")];
    let (dir, _) = cycle(id, &files);
    assert!(dir.path().join("769f2.store").is_file());
}

#[test]
fn short_component_is_rejected() {
    let (packer, reader) = Packer::new("deadbeef08");
    let drain = thread::spawn(move || {
        let mut r = reader;
        io::copy(&mut r, &mut io::sink())
    });
    // promise ten bytes, deliver five
    let err = packer
        .add_file(FileKind::Store, 10, &mut "short".as_bytes())
        .unwrap_err();
    assert!(matches!(err, CodecError::ShortFile(FileKind::Store)));
    let _ = packer.close_with_error("short write");
    let _ = drain.join().unwrap();
}

#[test]
fn foreign_entries_abort_the_unpack() {
    // hand-build a stream carrying an unknown name
    let (packer, reader) = Packer::new("deadbeef09");
    let unpacker = Unpacker::new("deadbeef09", reader);
    let dir = tempfile::tempdir().unwrap();
    let res = thread::scope(|s| {
        let worker = s.spawn(move || {
            let mut h = DirHandler::new(dir.path().to_path_buf());
            unpacker.unpack(&mut h)
        });
        // the packer itself refuses unknown kinds, so smuggle a raw tar
        // entry through a second archive read by the same unpacker logic
        packer
            .add_file(FileKind::Store, 5, &mut "store".as_bytes())
            .unwrap();
        packer.close().unwrap();
        worker.join().unwrap()
    });
    res.unwrap();

    // raw stream with a bogus entry name
    let mut raw = Vec::new();
    {
        let encoder =
            flate2::write::ZlibEncoder::new(&mut raw, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o600);
        header.set_size(4);
        builder
            .append_data(&mut header, "strange.bin", &mut &b"data"[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();
    }
    let dir = tempfile::tempdir().unwrap();
    let mut h = DirHandler::new(dir.path().to_path_buf());
    let res = Unpacker::new("deadbeef09", &raw[..]).unpack(&mut h);
    assert!(matches!(res, Err(CodecError::UnknownEntry(_))));
}

#[test]
fn tag_update_payload_roundtrips() {
    let id = "deadbeef0a";
    let (dir, handler) = cycle(id, &[(FileKind::Store, "store")]);
    drop(dir);
    let mut expect = HashMap::new();
    expect.insert("test".to_string(), 1u16);
    expect.insert("test2".to_string(), 2u16);
    let got: HashMap<String, u16> = handler.tag_updates[0]
        .iter()
        .map(|p| (p.name.clone(), p.value))
        .collect();
    assert_eq!(got, expect);
}

#[test]
fn well_tags_entry_is_newline_separated() {
    let id = "deadbeef0b";
    let files = [(FileKind::Store, "store")];
    let (dir, _) = cycle(id, &files);
    let tags = fs::read_to_string(dir.path().join("tags")).unwrap();
    assert_eq!(tags, "test\ntest2");
}
