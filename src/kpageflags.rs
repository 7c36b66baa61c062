use crate::{process::Pfn, EntryTable, FileWrapper, ProcResult};

use bitflags::bitflags;
use std::{
    fmt,
    fs::File,
    io::{Read, Seek},
    ops::Range,
    path::Path,
};

#[cfg(feature = "serde1")]
use serde::{Deserialize, Serialize};

bitflags! {
    /// The state flags of a physical page frame, as found in `/proc/kpageflags`.
    ///
    /// Bit `i` of the raw word is the `i`-th flag below.  Bits past `KSM` are not decoded.
    #[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PhysicalPageFlags: u64 {
        /// The page is being locked for exclusive access, e.g. by undergoing read/write IO
        const LOCKED = 1 << 0;
        /// IO error occurred
        const ERROR = 1 << 1;
        /// The page has been referenced since last LRU list enqueue/requeue
        const REFERENCED = 1 << 2;
        /// The page has up-to-date data
        const UPTODATE = 1 << 3;
        /// The page has been written to, hence contains new data
        const DIRTY = 1 << 4;
        /// The page is in one of the LRU lists
        const LRU = 1 << 5;
        /// The page is in the active LRU list
        const ACTIVE = 1 << 6;
        /// The page is managed by the SLAB/SLOB/SLUB/SLQB kernel memory allocator
        const SLAB = 1 << 7;
        /// The page is being synced to disk
        const WRITEBACK = 1 << 8;
        /// The page will be reclaimed soon after its pageout IO completed
        const RECLAIM = 1 << 9;
        /// A free memory block managed by the buddy system allocator
        const BUDDY = 1 << 10;
        /// A memory mapped page
        const MMAP = 1 << 11;
        /// A memory mapped page that is not part of a file
        const ANON = 1 << 12;
        /// The page is mapped to swap space, i.e. has an associated swap entry
        const SWAPCACHE = 1 << 13;
        /// The page is backed by swap/RAM
        const SWAPBACKED = 1 << 14;
        /// The head page of a compound page
        const COMPOUND_HEAD = 1 << 15;
        /// A tail page of a compound page
        const COMPOUND_TAIL = 1 << 16;
        /// This is an integral part of a HugeTLB page
        const HUGE = 1 << 17;
        /// The page is in the unevictable (non-)LRU list
        const UNEVICTABLE = 1 << 18;
        /// Hardware detected memory corruption on this page: don't touch the data!
        const HWPOISON = 1 << 19;
        /// No page frame exists at the requested address
        const NOPAGE = 1 << 20;
        /// Identical memory pages dynamically shared between one or more processes
        const KSM = 1 << 21;
    }
}

impl PhysicalPageFlags {
    /// Decodes a raw `kpageflags` word.  Unknown high bits are dropped.
    pub fn parse_info(info: u64) -> Self {
        PhysicalPageFlags::from_bits_truncate(info)
    }

    /// Names of the set flags, from the lowest bit to the highest.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.iter_names().map(|(name, _)| name)
    }
}

impl fmt::Display for PhysicalPageFlags {
    /// Writes the set flag names separated by spaces, e.g. `UPTODATE LRU MMAP`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, name) in self.names().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(name)?;
        }
        Ok(())
    }
}

/// Parse physical memory flags accessing `/proc/kpageflags`.
///
/// Require root or CAP_SYS_ADMIN
#[derive(Debug)]
pub struct KPageFlags<R = File> {
    table: EntryTable<R>,
}

impl KPageFlags {
    /// Get a parser from default `/proc/kpageflags`
    ///
    /// Return `Err` if process is not running as root or don't have CAP_SYS_ADMIN
    pub fn new() -> ProcResult<Self> {
        Self::from_custom_root("/proc")
    }

    /// Get a parser from custom `/proc`
    ///
    /// Return `Err` if process is not running as root or don't have CAP_SYS_ADMIN
    pub fn from_custom_root<P: AsRef<Path>>(root: P) -> ProcResult<Self> {
        let path = root.as_ref().join("kpageflags");
        let file = FileWrapper::open(path)?.inner();

        Ok(Self::from_reader(file))
    }
}

impl<R: Read + Seek> KPageFlags<R> {
    /// Reads flags from any reader laid out like `/proc/kpageflags`
    pub fn from_reader(reader: R) -> Self {
        Self {
            table: EntryTable::new(reader),
        }
    }

    /// Retrieve the flags of the page frame `pfn`.
    ///
    /// Returns `None` if the kernel has no entry for this frame (the PFN is not in RAM).
    pub fn get_info(&mut self, pfn: Pfn) -> Option<PhysicalPageFlags> {
        self.table.lookup(pfn.0).map(PhysicalPageFlags::parse_info)
    }

    /// Retrieve the flags of every frame within `range`, end excluded.
    pub fn get_range_info(&mut self, range: Range<Pfn>) -> Vec<Option<PhysicalPageFlags>> {
        (range.start.0..range.end.0).map(|pfn| self.get_info(Pfn(pfn))).collect()
    }
}
