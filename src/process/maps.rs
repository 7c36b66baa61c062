use super::PageEntry;
use crate::{FromBufRead, ProcError, ProcResult};

use log::debug;
use std::{
    collections::BTreeMap,
    fmt,
    io::{self, BufRead},
    iter::StepBy,
    ops::Range,
    path::PathBuf,
    str::FromStr,
};

#[cfg(feature = "serde1")]
use serde::{Deserialize, Serialize};

fn parse_hex(s: &str, what: &str) -> ProcResult<u64> {
    // from_str_radix also accepts a leading '+', the maps format never has one
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ProcError::Parse(format!("{} ({:?}) is not a hexadecimal number", what, s)));
    }
    Ok(from_str!(u64, s, 16))
}

/// A span of virtual addresses, `start` included and `end` excluded.
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
}

impl AddressRange {
    pub fn new(start: u64, end: u64) -> ProcResult<Self> {
        if start > end {
            return Err(ProcError::Parse(format!(
                "address range start {:x} is past its end {:x}",
                start, end
            )));
        }
        Ok(AddressRange { start, end })
    }

    /// Length of the range in bytes
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Number of whole pages in the range
    ///
    /// # Panics
    ///
    /// If `page_size` is zero.
    pub fn page_count(&self, page_size: u64) -> u64 {
        self.size() / page_size
    }

    pub fn contains(&self, address: u64) -> bool {
        (self.start..self.end).contains(&address)
    }

    /// Iterates the page addresses of this range.
    ///
    /// The first address is `start` itself, even when it isn't page aligned, and each following
    /// one is `page_size` bytes further, for as long as it is below `end`.
    ///
    /// # Panics
    ///
    /// If `page_size` is zero.
    pub fn pages(&self, page_size: u64) -> PageAddresses {
        let step = usize::try_from(page_size).unwrap_or(usize::MAX);
        PageAddresses {
            inner: (self.start..self.end).step_by(step),
        }
    }
}

impl FromStr for AddressRange {
    type Err = ProcError;

    /// Parses the `start-end` form used by `/proc/<pid>/maps`, e.g. `00400000-00452000`
    fn from_str(s: &str) -> ProcResult<Self> {
        let (start, end) = expect!(s.split_once('-'), format!("address range {:?} has no '-'", s));
        AddressRange::new(parse_hex(start, "range start")?, parse_hex(end, "range end")?)
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}-{:x}", self.start, self.end)
    }
}

/// Iterator over the page addresses of an [AddressRange], see [AddressRange::pages()]
#[derive(Debug, Clone)]
pub struct PageAddresses {
    inner: StepBy<Range<u64>>,
}

impl Iterator for PageAddresses {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// The backing of a memory mapping, derived from its pathname
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MMapPath {
    /// The file that is backing the mapping.
    Path(PathBuf),
    /// The process's heap.
    Heap,
    /// The initial process's (also known as the main thread's) stack.
    Stack,
    /// A thread's stack (where the `<tid>` is a thread ID).  It corresponds to the
    /// `/proc/<pid>/task/<tid>/` path.
    ///
    /// (since Linux 3.4)
    TStack(u32),
    /// The virtual dynamically linked shared object.
    Vdso,
    /// Shared kernel variables
    Vvar,
    /// obsolete virtual syscalls, succeeded by vdso
    Vsyscall,
    /// An anonymous mapping as obtained via mmap(2).
    Anonymous,
    /// Some other pseudo-path
    Other(String),
}

impl From<&str> for MMapPath {
    fn from(path: &str) -> Self {
        match path.trim() {
            "" => MMapPath::Anonymous,
            "[heap]" => MMapPath::Heap,
            "[stack]" => MMapPath::Stack,
            "[vdso]" => MMapPath::Vdso,
            "[vvar]" => MMapPath::Vvar,
            "[vsyscall]" => MMapPath::Vsyscall,
            x if x.starts_with("[stack:") && x.ends_with(']') => match x[7..x.len() - 1].parse() {
                Ok(tid) => MMapPath::TStack(tid),
                Err(_) => MMapPath::Other(x[1..x.len() - 1].to_string()),
            },
            x if x.starts_with('[') && x.ends_with(']') => MMapPath::Other(x[1..x.len() - 1].to_string()),
            x => MMapPath::Path(PathBuf::from(x)),
        }
    }
}

/// Represents an entry in a `/proc/<pid>/maps` file, together with the state of its pages.
///
/// [MemoryMap::from_line()] only parses the text, `pages` starts out empty.  A
/// [crate::PageScanner] fills it in with one [PageEntry] per page address (see
/// [AddressRange::pages()]).  Pages the kernel reported nothing for are left out of `pages`.
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MemoryMap {
    /// The address space in the process that the mapping occupies.
    pub address: AddressRange,
    /// Some combination of `rwxsp-`
    pub perms: String,
    /// The offset into the file/whatever
    pub offset: u64,
    /// The device as `major:minor`
    pub dev: String,
    /// The inode on that device
    ///
    /// 0 indicates that no inode is associated with the memory region, as would be the case with
    /// BSS (uninitialized data).
    pub inode: u64,
    /// Empty for anonymous mappings
    pub pathname: String,
    pub pages: BTreeMap<u64, PageEntry>,
}

impl MemoryMap {
    /// Parses one line of `/proc/<pid>/maps`:
    ///
    /// ```text
    /// 00400000-00452000 r-xp 00000000 08:02 173521      /usr/bin/dbus-daemon
    /// ```
    ///
    /// The pathname is optional, and only its first whitespace separated word is kept.
    ///
    /// The inode must be made of hex digits but is read as decimal, so a token such as `ab` makes
    /// the line malformed rather than decoding to 0.
    pub fn from_line(line: &str) -> ProcResult<MemoryMap> {
        let mut s = line.split_ascii_whitespace();
        let address = expect!(s.next(), "missing address range");
        let perms = expect!(s.next(), "missing permissions");
        let offset = expect!(s.next(), "missing offset");
        let dev = expect!(s.next(), "missing device");
        let inode = expect!(s.next(), "missing inode");
        let pathname = s.next().unwrap_or("");

        if !perms.bytes().all(|b| b"rwxsp-".contains(&b)) {
            return Err(ProcError::Parse(format!("invalid permissions {:?}", perms)));
        }
        if !inode.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ProcError::Parse(format!("invalid inode {:?}", inode)));
        }

        Ok(MemoryMap {
            address: address.parse()?,
            perms: perms.to_string(),
            offset: parse_hex(offset, "offset")?,
            dev: dev.to_string(),
            inode: from_str!(u64, inode),
            pathname: pathname.to_string(),
            pages: BTreeMap::new(),
        })
    }

    /// Classifies the pathname of this mapping
    pub fn path(&self) -> MMapPath {
        MMapPath::from(self.pathname.as_str())
    }

    /// The state of the page at `address`, if it was scanned and the kernel reported on it
    pub fn page(&self, address: u64) -> Option<&PageEntry> {
        self.pages.get(&address)
    }

    /// Number of scanned pages that are backed by a physical frame
    pub fn resident_pages(&self) -> usize {
        self.pages.values().filter(|p| p.present).count()
    }
}

impl fmt::Display for MemoryMap {
    /// The mapping as `/proc/<pid>/maps` would show it, without the column padding
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:x} {} {}",
            self.address, self.perms, self.offset, self.dev, self.inode
        )?;
        if !self.pathname.is_empty() {
            write!(f, " {}", self.pathname)?;
        }
        Ok(())
    }
}

/// The memory maps of a process, in the order of `/proc/<pid>/maps`.
///
/// Lines that can't be parsed are skipped.
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemoryMaps(pub Vec<MemoryMap>);

impl MemoryMaps {
    /// Return an iterator over [MemoryMap].
    pub fn iter(&self) -> std::slice::Iter<MemoryMap> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a MemoryMaps {
    type IntoIter = std::slice::Iter<'a, MemoryMap>;
    type Item = &'a MemoryMap;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl IntoIterator for MemoryMaps {
    type IntoIter = std::vec::IntoIter<MemoryMap>;
    type Item = MemoryMap;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Splits `reader` on newlines.  Pathnames are arbitrary bytes, so invalid UTF-8 is replaced with
/// U+FFFD instead of failing the read.
pub(crate) fn lossy_lines<R: BufRead>(reader: R) -> impl Iterator<Item = io::Result<String>> {
    reader.split(b'\n').map(|line| {
        line.map(|mut bytes| {
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
            String::from_utf8_lossy(&bytes).into_owned()
        })
    })
}

impl FromBufRead for MemoryMaps {
    fn from_buf_read<R: BufRead>(reader: R) -> ProcResult<Self> {
        let mut memory_maps = Vec::new();

        for line in lossy_lines(reader) {
            let line = line?;
            match MemoryMap::from_line(&line) {
                Ok(map) => memory_maps.push(map),
                Err(e) => debug!("skipping maps line {:?}: {}", line, e),
            }
        }

        Ok(MemoryMaps(memory_maps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FromRead;

    #[test]
    fn test_address_range() {
        let range: AddressRange = "1000-2000".parse().unwrap();
        assert_eq!(range.size(), 0x1000);
        assert_eq!(range.page_count(0x1000), 1);
        assert_eq!(range.pages(0x1000).collect::<Vec<_>>(), vec![0x1000]);
        assert_eq!(range.to_string(), "1000-2000");
    }

    #[test]
    fn test_address_range_unaligned() {
        let range: AddressRange = "1008-3008".parse().unwrap();
        assert_eq!(range.page_count(0x1000), 2);
        assert_eq!(range.pages(0x1000).collect::<Vec<_>>(), vec![0x1008, 0x2008]);

        // a partial trailing page still gets an address
        let range: AddressRange = "1000-2800".parse().unwrap();
        assert_eq!(range.page_count(0x1000), 1);
        assert_eq!(range.pages(0x1000).collect::<Vec<_>>(), vec![0x1000, 0x2000]);
    }

    #[test]
    fn test_address_range_restartable() {
        let range: AddressRange = "7f0000-7f4000".parse().unwrap();
        let first = range.pages(0x1000).collect::<Vec<_>>();
        let second = range.pages(0x1000).collect::<Vec<_>>();
        assert_eq!(first, second);
        assert_eq!(first, vec![0x7f0000, 0x7f1000, 0x7f2000, 0x7f3000]);
        assert_eq!(range.pages(0x1000).size_hint(), (4, Some(4)));
    }

    #[test]
    fn test_address_range_empty() {
        let range: AddressRange = "5000-5000".parse().unwrap();
        assert_eq!(range.size(), 0);
        assert_eq!(range.page_count(0x1000), 0);
        assert_eq!(range.pages(0x1000).next(), None);
    }

    #[test]
    fn test_address_range_errors() {
        for bad in ["", "1000", "1000-", "-2000", "0x1000-0x2000", "1000-zz", "+1000-2000", "2000-1000"] {
            let err = bad.parse::<AddressRange>().unwrap_err();
            assert!(matches!(err, ProcError::Parse(_)), "{:?} gave {:?}", bad, err);
        }
        assert!(AddressRange::new(2, 1).is_err());
        assert!("ffffffffff600000-ffffffffff601000".parse::<AddressRange>().is_ok());
    }

    #[test]
    fn test_from_line() {
        let map = MemoryMap::from_line("00400000-00452000 r-xp 00000000 08:02 173521 /usr/bin/dbus-daemon").unwrap();
        assert_eq!(map.address.start, 0x00400000);
        assert_eq!(map.address.end, 0x00452000);
        assert_eq!(map.perms, "r-xp");
        assert_eq!(map.offset, 0);
        assert_eq!(map.dev, "08:02");
        assert_eq!(map.inode, 173521);
        assert_eq!(map.pathname, "/usr/bin/dbus-daemon");
        assert_eq!(map.path(), MMapPath::Path(PathBuf::from("/usr/bin/dbus-daemon")));
        assert!(map.pages.is_empty());
        assert_eq!(
            map.to_string(),
            "400000-452000 r-xp 0 08:02 173521 /usr/bin/dbus-daemon"
        );
    }

    #[test]
    fn test_from_line_anonymous() {
        // the kernel pads anonymous mappings with trailing spaces
        let map = MemoryMap::from_line("7ffd2de28000-7ffd2de49000 rw-p 00001000 00:00 0                          ").unwrap();
        assert_eq!(map.offset, 0x1000);
        assert_eq!(map.inode, 0);
        assert_eq!(map.pathname, "");
        assert_eq!(map.path(), MMapPath::Anonymous);
        assert_eq!(map.to_string(), "7ffd2de28000-7ffd2de49000 rw-p 1000 00:00 0");

        let map = MemoryMap::from_line("7ffd2de28000-7ffd2de49000 rw-p 00000000 00:00 0").unwrap();
        assert_eq!(map.pathname, "");
    }

    #[test]
    fn test_from_line_pathname_first_word() {
        let map = MemoryMap::from_line("7f1c2e000000-7f1c2e021000 rw-s 00000000 00:05 1043 /memfd:wayland (deleted)").unwrap();
        assert_eq!(map.perms, "rw-s");
        assert_eq!(map.pathname, "/memfd:wayland");
    }

    #[test]
    fn test_from_line_errors() {
        for bad in [
            "",
            "00400000-00452000",
            "00400000-00452000 r-xp 00000000 08:02",
            "00400000 r-xp 00000000 08:02 173521 /bin/true",
            "00400000-00452000 rwzp 00000000 08:02 173521 /bin/true",
            "00400000-00452000 r-xp 0000zz00 08:02 173521 /bin/true",
            "00400000-00452000 r-xp 00000000 08:02 17g521 /bin/true",
            "00400000-00452000 r-xp 00000000 08:02 ab /bin/true",
            "Size:                  4 kB",
        ] {
            let err = MemoryMap::from_line(bad).unwrap_err();
            assert!(matches!(err, ProcError::Parse(_)), "{:?} gave {:?}", bad, err);
        }
    }

    #[test]
    fn test_mmap_path() {
        assert_eq!(MMapPath::from("[stack]"), MMapPath::Stack);
        assert_eq!(MMapPath::from("[foo]"), MMapPath::Other("foo".to_owned()));
        assert_eq!(MMapPath::from(""), MMapPath::Anonymous);
        assert_eq!(MMapPath::from("[stack:154]"), MMapPath::TStack(154));
        assert_eq!(MMapPath::from("[stack:x]"), MMapPath::Other("stack:x".to_owned()));
        assert_eq!(MMapPath::from("[vsyscall]"), MMapPath::Vsyscall);
        assert_eq!(
            MMapPath::from("/lib/libfoo.so"),
            MMapPath::Path(PathBuf::from("/lib/libfoo.so"))
        );
    }

    #[test]
    fn test_memory_maps_skips_bad_lines() {
        let data = r#"55d1b7a5e000-55d1b7a60000 r--p 00000000 fd:01 1837150                    /usr/bin/cat
this is not a mapping
55d1b8f4f000-55d1b8f70000 rw-p 00000000 00:00 0                          [heap]

ffffffffff600000-ffffffffff601000 --xp 00000000 00:00 0                  [vsyscall]"#;

        let maps = MemoryMaps::from_read(data.as_bytes()).unwrap();
        assert_eq!(maps.len(), 3);
        let paths = maps.iter().map(|m| m.path()).collect::<Vec<_>>();
        assert_eq!(
            paths,
            vec![
                MMapPath::Path(PathBuf::from("/usr/bin/cat")),
                MMapPath::Heap,
                MMapPath::Vsyscall
            ]
        );
        assert_eq!(maps.0[2].perms, "--xp");
    }

    #[test]
    fn test_memory_maps_non_utf8_pathname() {
        let data = b"1000-2000 r--p 00000000 fd:01 12 /usr/lib/a.so\r\n\
                     2000-3000 r--p 00000000 fd:01 13 /tmp/caf\xe9.so\n\
                     3000-4000 rw-p 00000000 00:00 0 [heap]\n";

        let maps = MemoryMaps::from_read(&data[..]).unwrap();
        assert_eq!(maps.len(), 3);
        assert_eq!(maps.0[0].pathname, "/usr/lib/a.so");
        assert_eq!(maps.0[1].pathname, "/tmp/caf\u{FFFD}.so");
        assert_eq!(maps.0[1].inode, 13);
        assert_eq!(maps.0[2].path(), MMapPath::Heap);
    }
}
