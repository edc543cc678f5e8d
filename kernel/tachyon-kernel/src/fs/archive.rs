//! Boot archive extraction.
//!
//! The archive is a flat, little-endian format: an 8-byte magic, an index
//! length and total size, then one index entry per file (offset, size,
//! path length, DJB2 hash over path-plus-data), then the file entries
//! themselves as `path` immediately followed by `data`. Every entry is
//! bounds- and hash-checked before its file is created in the RAM
//! filesystem with recursive directory creation.

use tachyon_core::error::{Errno, KResult};

use super::ramfs::RamFs;

/// Magic bytes at the start of every archive.
pub const ARCHIVE_MAGIC: &[u8; 8] = b"TATIX_AR";

/// Header: magic, index length (i64), total size (i64).
const HEADER_LEN: usize = 24;
/// Index entry: hash (u64), offset (i64), size (i64), path length (i64),
/// flags (u32).
const INDEX_ENT_LEN: usize = 36;

/// DJB2 over `bytes`, seed 5381.
pub fn djb2_hash(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 5381;
    for &b in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(u64::from(b));
    }
    hash
}

fn read_i64(bytes: &[u8], offset: usize) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[offset..offset + 8]);
    i64::from_le_bytes(b)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(b)
}

/// One validated index entry.
struct IndexEntry {
    hash: u64,
    offset: usize,
    size: usize,
    path_length: usize,
}

impl IndexEntry {
    /// Parses and bounds-checks the entry at `index_offset`.
    fn parse(archive: &[u8], index_offset: usize) -> KResult<Self> {
        if index_offset + INDEX_ENT_LEN > archive.len() {
            return Err(Errno::Einval);
        }
        let hash = read_u64(archive, index_offset);
        let offset = read_i64(archive, index_offset + 8);
        let size = read_i64(archive, index_offset + 16);
        let path_length = read_i64(archive, index_offset + 24);
        // Flags at +32 are reserved and ignored.

        if offset < 0 || size < 0 || path_length < 0 {
            return Err(Errno::Einval);
        }
        let (offset, size, path_length) = (offset as usize, size as usize, path_length as usize);

        if path_length > size {
            return Err(Errno::Einval);
        }
        let end = offset.checked_add(size).ok_or(Errno::Einval)?;
        if end > archive.len() {
            return Err(Errno::Einval);
        }

        Ok(Self {
            hash,
            offset,
            size,
            path_length,
        })
    }
}

/// Extracts every file of `archive` into `fs`.
///
/// Fails with `EINVAL` on any structural or hash mismatch; files created
/// before the failure stay in place.
pub fn extract(archive: &[u8], fs: &mut RamFs<'_>) -> KResult<()> {
    if archive.len() < HEADER_LEN {
        return Err(Errno::Einval);
    }
    if &archive[..8] != ARCHIVE_MAGIC {
        return Err(Errno::Einval);
    }
    let index_length = read_i64(archive, 8);
    let total_size = read_i64(archive, 16);
    if index_length < 0 || total_size < 0 || total_size as usize > archive.len() {
        return Err(Errno::Einval);
    }

    let mut index_offset = HEADER_LEN;
    for _ in 0..index_length {
        let entry = IndexEntry::parse(archive, index_offset)?;

        let path_and_data = &archive[entry.offset..entry.offset + entry.size];
        if djb2_hash(path_and_data) != entry.hash {
            return Err(Errno::Einval);
        }

        let (path_bytes, data) = path_and_data.split_at(entry.path_length);
        let path = core::str::from_utf8(path_bytes).map_err(|_| Errno::Einval)?;

        let node = fs.create_file(path, true)?;
        fs.write(node, data, 0)?;

        index_offset += INDEX_ENT_LEN;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ramfs::tests::TEST_ALLOC;
    use tachyon_core::bytes::ByteBuf;

    /// Builds a valid archive from `(path, data)` pairs.
    fn build_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut entries = Vec::new();
        let mut blob = Vec::new();
        let files_start = HEADER_LEN + files.len() * INDEX_ENT_LEN;

        for (path, data) in files {
            let offset = files_start + blob.len();
            let mut path_and_data = path.as_bytes().to_vec();
            path_and_data.extend_from_slice(data);
            entries.push((
                djb2_hash(&path_and_data),
                offset as i64,
                path_and_data.len() as i64,
                path.len() as i64,
            ));
            blob.extend_from_slice(&path_and_data);
        }

        let mut archive = Vec::new();
        archive.extend_from_slice(ARCHIVE_MAGIC);
        archive.extend_from_slice(&(files.len() as i64).to_le_bytes());
        let total = files_start + blob.len();
        archive.extend_from_slice(&(total as i64).to_le_bytes());
        for (hash, offset, size, path_length) in entries {
            archive.extend_from_slice(&hash.to_le_bytes());
            archive.extend_from_slice(&offset.to_le_bytes());
            archive.extend_from_slice(&size.to_le_bytes());
            archive.extend_from_slice(&path_length.to_le_bytes());
            archive.extend_from_slice(&0u32.to_le_bytes());
        }
        archive.extend_from_slice(&blob);
        archive
    }

    fn read_all(fs: &mut RamFs<'_>, path: &str) -> Vec<u8> {
        let node = fs.open(path).unwrap();
        let mut backing = vec![0u8; fs.size(node).max(1)];
        let mut buf = ByteBuf::new(&mut backing);
        fs.read(node, &mut buf, 0).unwrap();
        buf.as_slice().to_vec()
    }

    #[test]
    fn extract_then_read_back() {
        let files: &[(&str, &[u8])] = &[
            ("/boot/boot.cfg", b"host_ip=10.0.2.2\n"),
            ("/web/index.html", b"<html>hi</html>\n"),
            ("/web/assets/logo.txt", b"tachyon"),
        ];
        let archive = build_archive(files);

        let mut fs = RamFs::new(&TEST_ALLOC).unwrap();
        extract(&archive, &mut fs).unwrap();

        for (path, data) in files {
            assert_eq!(read_all(&mut fs, path), *data, "content of {path}");
        }
    }

    #[test]
    fn djb2_reference_values() {
        // hash("") is the seed; hash("a") = 5381 * 33 + 'a'.
        assert_eq!(djb2_hash(b""), 5381);
        assert_eq!(djb2_hash(b"a"), 5381 * 33 + 97);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut archive = build_archive(&[("/f", b"x")]);
        archive[0] = b'X';
        let mut fs = RamFs::new(&TEST_ALLOC).unwrap();
        assert_eq!(extract(&archive, &mut fs).unwrap_err(), Errno::Einval);
    }

    #[test]
    fn corrupted_data_fails_hash_check() {
        let mut archive = build_archive(&[("/f", b"payload")]);
        let last = archive.len() - 1;
        archive[last] ^= 0xFF;
        let mut fs = RamFs::new(&TEST_ALLOC).unwrap();
        assert_eq!(extract(&archive, &mut fs).unwrap_err(), Errno::Einval);
    }

    #[test]
    fn truncated_archive_is_rejected() {
        let archive = build_archive(&[("/f", b"payload")]);
        let mut fs = RamFs::new(&TEST_ALLOC).unwrap();
        assert_eq!(
            extract(&archive[..archive.len() - 3], &mut fs).unwrap_err(),
            Errno::Einval
        );
    }

    #[test]
    fn empty_archive_extracts_nothing() {
        let archive = build_archive(&[]);
        let mut fs = RamFs::new(&TEST_ALLOC).unwrap();
        extract(&archive, &mut fs).unwrap();
        assert_eq!(fs.open("/anything").unwrap_err(), Errno::Enoent);
    }
}
