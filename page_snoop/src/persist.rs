// Dump format: one lowercase hex page address per line, oldest first, no
// prefix and no header. Never-filled slots are written as 0, so a cache of N
// slots always produces N lines.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::cache::CacheSnapshot;
use crate::error::TraceError;

pub fn write_dump(path: &Path, snapshot: &CacheSnapshot) -> Result<(), TraceError> {
    let wrap = |source: io::Error| TraceError::Dump {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(wrap)?;
    let mut writer = BufWriter::new(file);
    write_to(&mut writer, snapshot).map_err(wrap)?;
    writer.flush().map_err(wrap)?;
    debug!("Wrote {} page addresses to {}", snapshot.capacity(), path.display());
    Ok(())
}

pub fn write_to<W: Write>(out: &mut W, snapshot: &CacheSnapshot) -> io::Result<()> {
    for addr in snapshot.addresses() {
        writeln!(out, "{:x}", addr)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PageCache;

    #[test]
    fn one_line_per_slot_in_cache_order() {
        let mut cache = PageCache::with_capacity(3);
        for page in &[0x1000, 0x2000, 0x3000] {
            cache.record(*page);
        }
        let mut out = Vec::new();
        write_to(&mut out, &cache.snapshot()).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "1000\n2000\n3000\n");
    }

    #[test]
    fn empty_slots_are_zero() {
        let cache = PageCache::with_capacity(2);
        let mut out = Vec::new();
        write_to(&mut out, &cache.snapshot()).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "0\n0\n");
    }

    #[test]
    fn writes_lowercase_hex() {
        let mut cache = PageCache::with_capacity(1);
        cache.record(0x7ffc_abcd_e000);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump");
        write_dump(&path, &cache.snapshot()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "7ffcabcde000\n");
    }

    #[test]
    fn unwritable_path_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("dump");
        match write_dump(&path, &CacheSnapshot::default()) {
            Err(TraceError::Dump { path: p, .. }) => assert_eq!(p, path),
            other => panic!("unexpected {:?}", other),
        }
    }
}
