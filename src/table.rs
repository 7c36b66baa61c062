use byteorder::{NativeEndian, ReadBytesExt};
use log::trace;
use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    mem::size_of,
};

/// Size in bytes of one entry in `pagemap`, `kpagecount` and `kpageflags`
pub const ENTRY_SIZE: u64 = size_of::<u64>() as u64;

/// Random access to a table of 64-bit entries, such as `/proc/<pid>/pagemap`.
///
/// Entry `index` lives at byte offset `index * 8` and is stored in host byte order.
///
/// These tables are sparse: the kernel refuses reads for frames that aren't RAM, and a table can be
/// shorter than the index space.  A seek or read that fails, or that comes back with fewer than 8
/// bytes, is reported as `None` rather than as an error.
#[derive(Debug)]
pub struct EntryTable<R = File> {
    reader: R,
}

impl<R: Read + Seek> EntryTable<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the entry at `index`, or `None` if the table has no data there.
    pub fn lookup(&mut self, index: u64) -> Option<u64> {
        let position = index.checked_mul(ENTRY_SIZE)?;
        if let Err(e) = self.reader.seek(SeekFrom::Start(position)) {
            trace!("seek to entry {} failed: {}", index, e);
            return None;
        }

        match self.reader.read_u64::<NativeEndian>() {
            Ok(entry) => Some(entry),
            Err(e) => {
                trace!("no data for entry {}: {}", index, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn table(entries: &[u64]) -> EntryTable<Cursor<Vec<u8>>> {
        let bytes = entries.iter().flat_map(|e| e.to_ne_bytes()).collect();
        EntryTable::new(Cursor::new(bytes))
    }

    #[test]
    fn test_lookup() {
        let mut t = table(&[7, 0, u64::MAX, 0x8000_0000_0000_1234]);

        assert_eq!(t.lookup(0), Some(7));
        assert_eq!(t.lookup(1), Some(0));
        assert_eq!(t.lookup(2), Some(u64::MAX));
        assert_eq!(t.lookup(3), Some(0x8000_0000_0000_1234));
        // random access, backwards
        assert_eq!(t.lookup(0), Some(7));
    }

    #[test]
    fn test_lookup_past_end() {
        let mut t = table(&[1, 2]);
        assert_eq!(t.lookup(2), None);
        assert_eq!(t.lookup(1000), None);
        // an index whose byte offset doesn't fit in a u64
        assert_eq!(t.lookup(u64::MAX), None);
        // still usable afterwards
        assert_eq!(t.lookup(1), Some(2));
    }

    #[test]
    fn test_short_read() {
        let mut bytes: Vec<u8> = 5u64.to_ne_bytes().to_vec();
        bytes.extend_from_slice(&[0xff; 5]);
        let mut t = EntryTable::new(Cursor::new(bytes));

        assert_eq!(t.lookup(0), Some(5));
        assert_eq!(t.lookup(1), None);
    }

    #[test]
    fn test_host_byte_order() {
        let mut t = EntryTable::new(Cursor::new(0x0102_0304_0506_0708u64.to_ne_bytes().to_vec()));
        assert_eq!(t.lookup(0), Some(0x0102_0304_0506_0708));
    }
}
