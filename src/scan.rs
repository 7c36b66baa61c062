//! Page-state snapshots of whole mappings, and of single addresses.

use crate::process::{lossy_lines, MemoryMap, MemoryMaps, PageEntry, PageMap, Process};
use crate::{KPageCount, KPageFlags, ProcError, ProcResult, PAGESIZE};

use log::{debug, warn};
use std::{
    fs::File,
    io::{BufRead, Read, Seek},
    path::PathBuf,
};

/// Settings shared by every lookup of a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// Where procfs is mounted; `kpagecount` and `kpageflags` are opened from here
    pub proc_root: PathBuf,
    /// Size of a virtual page in bytes.  Must not be zero.
    pub page_size: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            proc_root: PathBuf::from("/proc"),
            page_size: *PAGESIZE,
        }
    }
}

impl ScanConfig {
    /// The process `pid` under [ScanConfig::proc_root]
    pub fn process(&self, pid: i32) -> ProcResult<Process> {
        Process::new_with_root(self.proc_root.join(pid.to_string()))
    }
}

/// Parses a user supplied address, in the given `radix` (2 to 36).
///
/// In base 16 an optional `0x` prefix is accepted.
pub fn parse_address(s: &str, radix: u32) -> ProcResult<u64> {
    if !(2..=36).contains(&radix) {
        return Err(ProcError::Other(format!("radix {} is not between 2 and 36", radix)));
    }
    let s = s.trim();
    let digits = match radix {
        16 => s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s),
        _ => s,
    };
    if digits.starts_with('+') {
        return Err(ProcError::Parse(format!("invalid address {:?}", s)));
    }
    Ok(from_str!(u64, digits, radix))
}

/// The open tables of one scan: a process's `pagemap` and, when readable, the system wide
/// `kpagecount` and `kpageflags`.
///
/// Frame tables that couldn't be opened are skipped for the whole lifetime of the scanner, and the
/// matching [PageEntry] fields stay `None`.
///
/// All lookups seek the underlying files, so they take `&mut self`.
#[derive(Debug)]
pub struct PageScanner<R = File> {
    pagemap: PageMap<R>,
    kpagecount: Option<KPageCount<R>>,
    kpageflags: Option<KPageFlags<R>>,
    page_size: u64,
}

impl PageScanner {
    /// Opens the tables needed to scan `process`.
    ///
    /// Failing to open `/proc/<pid>/pagemap` is an error.  Failing to open `kpagecount` or
    /// `kpageflags` (usually because we're not root) only disables that enrichment.
    pub fn open(process: &Process, config: &ScanConfig) -> ProcResult<Self> {
        let pagemap = process.pagemap()?;
        debug!("opened pagemap of pid {}", process.pid);

        let kpagecount = match KPageCount::from_custom_root(&config.proc_root) {
            Ok(table) => Some(table),
            Err(e) => {
                warn!("page reference counts unavailable: {}", e);
                None
            }
        };
        let kpageflags = match KPageFlags::from_custom_root(&config.proc_root) {
            Ok(table) => Some(table),
            Err(e) => {
                warn!("page flags unavailable: {}", e);
                None
            }
        };

        Self::from_tables(pagemap, kpagecount, kpageflags, config.page_size)
    }
}

impl<R: Read + Seek> PageScanner<R> {
    /// Builds a scanner from already opened tables
    pub fn from_tables(
        pagemap: PageMap<R>,
        kpagecount: Option<KPageCount<R>>,
        kpageflags: Option<KPageFlags<R>>,
        page_size: u64,
    ) -> ProcResult<Self> {
        if page_size == 0 {
            return Err(ProcError::Other("page size must not be zero".to_string()));
        }
        Ok(PageScanner {
            pagemap,
            kpagecount,
            kpageflags,
            page_size,
        })
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Whether page entries will carry reference counts
    pub fn has_counts(&self) -> bool {
        self.kpagecount.is_some()
    }

    /// Whether page entries will carry frame flags
    pub fn has_flags(&self) -> bool {
        self.kpageflags.is_some()
    }

    /// The state of the page containing virtual `address`.
    ///
    /// Returns `None` if `pagemap` has no entry for it.  For a present page, the reference count
    /// and flags of its frame are filled in when available.
    pub fn resolve(&mut self, address: u64) -> Option<PageEntry> {
        let mut entry = self.pagemap.get_info(address / self.page_size)?;

        if entry.present {
            entry.count = self.kpagecount.as_mut().and_then(|t| t.get_count_at_pfn(entry.pfn));
            entry.flags = self.kpageflags.as_mut().and_then(|t| t.get_info(entry.pfn));
        }

        Some(entry)
    }

    /// Resolves every page of `map` into `map.pages`.
    ///
    /// Page addresses without a pagemap entry are left out.
    pub fn populate(&mut self, map: &mut MemoryMap) {
        for address in map.address.pages(self.page_size) {
            if let Some(entry) = self.resolve(address) {
                map.pages.insert(address, entry);
            }
        }
        debug!(
            "scanned {}: {} of {} pages resolved",
            map.address,
            map.pages.len(),
            map.address.page_count(self.page_size)
        );
    }

    /// Populates the pages of every map whose pathname satisfies `filter`.
    ///
    /// Maps rejected by the filter are dropped.
    pub fn scan<F>(&mut self, maps: MemoryMaps, mut filter: F) -> Vec<MemoryMap>
    where
        F: FnMut(&str) -> bool,
    {
        let mut scanned = Vec::new();
        for mut map in maps {
            if !filter(map.pathname.as_str()) {
                debug!("filtered out {}", map);
                continue;
            }
            self.populate(&mut map);
            scanned.push(map);
        }
        scanned
    }

    /// Reads `/proc/<pid>/maps` formatted text from `reader`, and scans the maps whose pathname
    /// satisfies `filter`.
    ///
    /// Lines that aren't a mapping are skipped.  An error is only returned if reading fails.
    pub fn scan_maps<B, F>(&mut self, reader: B, mut filter: F) -> ProcResult<Vec<MemoryMap>>
    where
        B: BufRead,
        F: FnMut(&str) -> bool,
    {
        let mut scanned = Vec::new();
        for line in lossy_lines(reader) {
            let line = line?;
            if let Some(map) = self.scan_line(&line, &mut filter) {
                scanned.push(map);
            }
        }
        Ok(scanned)
    }

    /// Parses and scans one maps line.
    ///
    /// Returns `None` when the line is malformed or its pathname doesn't satisfy `filter`.
    pub fn scan_line<F>(&mut self, line: &str, mut filter: F) -> Option<MemoryMap>
    where
        F: FnMut(&str) -> bool,
    {
        let mut map = match MemoryMap::from_line(line) {
            Ok(map) => map,
            Err(e) => {
                debug!("skipping maps line {:?}: {}", line, e);
                return None;
            }
        };
        if !filter(map.pathname.as_str()) {
            return None;
        }
        self.populate(&mut map);
        Some(map)
    }

    /// Resolves each of `addresses`, independently of any mapping.
    ///
    /// The result is in the same order as `addresses`.
    pub fn lookup_addresses(&mut self, addresses: &[u64]) -> Vec<(u64, Option<PageEntry>)> {
        addresses
            .iter()
            .map(|&address| (address, self.resolve(address)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{PageState, Pfn};
    use crate::PhysicalPageFlags;
    use std::io::Cursor;

    const PAGE: u64 = 0x1000;
    const PRESENT: u64 = 1 << 63;
    const SWAP: u64 = 1 << 62;
    const SHIFT_12: u64 = 12 << 55;

    fn table(words: &[u64]) -> Cursor<Vec<u8>> {
        Cursor::new(words.iter().flat_map(|w| w.to_ne_bytes()).collect())
    }

    /// Pages 1 to 4 have entries: present in frame 2, swapped, absent, present in frame 7.
    fn scanner(with_frame_tables: bool) -> PageScanner<Cursor<Vec<u8>>> {
        let pagemap = PageMap::from_reader(table(&[
            0,
            PRESENT | SHIFT_12 | 2,
            SWAP | (0x41 << 5) | 1,
            0,
            PRESENT | SHIFT_12 | 7,
        ]));
        let (kpagecount, kpageflags) = if with_frame_tables {
            let flags = (PhysicalPageFlags::UPTODATE | PhysicalPageFlags::LRU).bits();
            (
                Some(KPageCount::from_reader(table(&[1, 1, 3, 0]))),
                Some(KPageFlags::from_reader(table(&[0, 0, flags, 0]))),
            )
        } else {
            (None, None)
        };
        PageScanner::from_tables(pagemap, kpagecount, kpageflags, PAGE).unwrap()
    }

    #[test]
    fn test_resolve_enriched() {
        let mut scanner = scanner(true);
        assert!(scanner.has_counts());
        assert!(scanner.has_flags());

        let entry = scanner.resolve(0x1000).unwrap();
        assert_eq!(entry.state(), PageState::Present);
        assert_eq!(entry.pfn, Pfn(2));
        assert_eq!(entry.physical_address(), Some(0x2000));
        assert_eq!(entry.count, Some(3));
        assert_eq!(entry.flags, Some(PhysicalPageFlags::UPTODATE | PhysicalPageFlags::LRU));
        assert_eq!(entry.to_string(), "2000 3 UPTODATE LRU");

        // any address inside the page resolves to the same entry
        assert_eq!(scanner.resolve(0x1fff), Some(entry));
    }

    #[test]
    fn test_resolve_frame_outside_frame_tables() {
        let mut scanner = scanner(true);
        let entry = scanner.resolve(0x4000).unwrap();
        assert!(entry.present);
        assert_eq!(entry.pfn, Pfn(7));
        assert_eq!(entry.count, None);
        assert_eq!(entry.flags, None);
    }

    #[test]
    fn test_resolve_not_present() {
        let mut scanner = scanner(true);

        let swapped = scanner.resolve(0x2000).unwrap();
        assert_eq!(swapped.state(), PageState::Swapped);
        assert_eq!(swapped.swap_type, 1);
        assert_eq!(swapped.swap_offset, 0x41);
        assert_eq!(swapped.count, None);
        assert_eq!(swapped.flags, None);

        let absent = scanner.resolve(0x3000).unwrap();
        assert_eq!(absent.state(), PageState::Absent);
        assert_eq!(absent.count, None);

        assert_eq!(scanner.resolve(0x5000), None);
    }

    #[test]
    fn test_resolve_without_frame_tables() {
        let mut scanner = scanner(false);
        assert!(!scanner.has_counts());
        assert!(!scanner.has_flags());

        let entry = scanner.resolve(0x1000).unwrap();
        assert!(entry.present);
        assert_eq!(entry.count, None);
        assert_eq!(entry.flags, None);
        assert_eq!(entry.to_string(), "2000");
    }

    #[test]
    fn test_zero_page_size() {
        let err = PageScanner::from_tables(PageMap::from_reader(table(&[])), None, None, 0).unwrap_err();
        assert!(matches!(err, ProcError::Other(_)));
    }

    #[test]
    fn test_scan_maps() {
        let data = "00001000-00006000 rw-p 00000000 00:00 0 \n\
                    garbage\n\
                    00001000-00003000 r-xp 00000000 08:02 173521 /lib/libfoo.so\n";

        let mut scanner = scanner(true);
        let maps = scanner.scan_maps(data.as_bytes(), |path| path.is_empty()).unwrap();
        assert_eq!(maps.len(), 1);

        let map = &maps[0];
        assert_eq!(map.address.page_count(PAGE), 5);
        // page 5 has no pagemap entry, so it's left out rather than recorded as zero
        assert_eq!(map.pages.keys().copied().collect::<Vec<_>>(), vec![0x1000, 0x2000, 0x3000, 0x4000]);
        assert!(map.page(0x5000).is_none());
        assert_eq!(map.resident_pages(), 2);
        assert_eq!(map.page(0x1000).and_then(|p| p.count), Some(3));

        // the default filter keeps everything
        let maps = scanner.scan_maps(data.as_bytes(), |_| true).unwrap();
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[1].pathname, "/lib/libfoo.so");
        assert_eq!(maps[1].pages.len(), 2);
    }

    #[test]
    fn test_scan_maps_non_utf8_pathname() {
        let data = b"1000-2000 r--p 00000000 fd:01 12 /tmp/caf\xe9.so\n3000-4000 rw-p 00000000 00:00 0\n";

        let mut scanner = scanner(false);
        let maps = scanner.scan_maps(&data[..], |path| path.starts_with("/tmp")).unwrap();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0].pathname, "/tmp/caf\u{FFFD}.so");
        assert_eq!(maps[0].page(0x1000).map(|p| p.state()), Some(PageState::Present));
    }

    #[test]
    fn test_scan_unaligned_start() {
        let mut scanner = scanner(false);
        let map = scanner.scan_line("1008-3008 rw-p 00000000 00:00 0", |_| true).unwrap();
        assert_eq!(map.pages.keys().copied().collect::<Vec<_>>(), vec![0x1008, 0x2008]);
        assert_eq!(map.page(0x1008).map(|p| p.state()), Some(PageState::Present));
        assert_eq!(map.page(0x2008).map(|p| p.state()), Some(PageState::Swapped));
    }

    #[test]
    fn test_scan_line_rejections() {
        let mut scanner = scanner(false);
        assert!(scanner.scan_line("not a mapping", |_| true).is_none());
        assert!(scanner
            .scan_line("1000-2000 rw-p 00000000 00:00 0 [heap]", |path| path != "[heap]")
            .is_none());
    }

    #[test]
    fn test_scan_parsed_maps() {
        use crate::FromRead;

        let maps = MemoryMaps::from_read(
            "1000-3000 r--p 00000000 fd:01 12 /usr/bin/cat\n3000-5000 rw-p 00000000 00:00 0 [heap]\n".as_bytes(),
        )
        .unwrap();

        let mut scanner = scanner(true);
        let scanned = scanner.scan(maps, |path| path.starts_with('/'));
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].pathname, "/usr/bin/cat");
        assert_eq!(scanned[0].pages.len(), 2);
    }

    #[test]
    fn test_lookup_addresses_keeps_order() {
        let mut scanner = scanner(true);
        let results = scanner.lookup_addresses(&[0x4000, 0x1000, 0x9000, 0x1000]);

        let addresses = results.iter().map(|(a, _)| *a).collect::<Vec<_>>();
        assert_eq!(addresses, vec![0x4000, 0x1000, 0x9000, 0x1000]);
        assert_eq!(results[0].1.map(|e| e.pfn), Some(Pfn(7)));
        assert_eq!(results[1].1.map(|e| e.pfn), Some(Pfn(2)));
        assert!(results[2].1.is_none());
        assert_eq!(results[1].1, results[3].1);
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("7ffd2de4708f", 16).unwrap(), 0x7ffd2de4708f);
        assert_eq!(parse_address("0x1000", 16).unwrap(), 0x1000);
        assert_eq!(parse_address("0X1000", 16).unwrap(), 0x1000);
        assert_eq!(parse_address("4096", 10).unwrap(), 0x1000);
        assert_eq!(parse_address("1000000000000", 2).unwrap(), 0x1000);

        assert!(matches!(parse_address("zz", 16), Err(ProcError::Parse(_))));
        assert!(matches!(parse_address("0x10", 10), Err(ProcError::Parse(_))));
        assert!(matches!(parse_address("+10", 16), Err(ProcError::Parse(_))));
        assert!(matches!(parse_address("", 16), Err(ProcError::Parse(_))));
        assert!(matches!(parse_address("10", 1), Err(ProcError::Other(_))));
        assert!(matches!(parse_address("10", 37), Err(ProcError::Other(_))));
    }
}
