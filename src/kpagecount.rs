use std::{
    fs::File,
    io::{Read, Seek},
    ops::Range,
    path::Path,
};

use crate::{process::Pfn, EntryTable, FileWrapper};

use super::ProcResult;

/// Parse physical memory references accessing `/proc/kpagecount`
///
/// Require root or CAP_SYS_ADMIN
#[derive(Debug)]
pub struct KPageCount<R = File> {
    table: EntryTable<R>,
}

impl KPageCount {
    /// Get a parser from default `/proc/kpagecount`
    ///
    /// Return `Err` if process is not running as root or don't have CAP_SYS_ADMIN
    pub fn new() -> ProcResult<Self> {
        Self::from_custom_root("/proc")
    }

    /// Get a parser from custom `/proc`
    ///
    /// Return `Err` if process is not running as root or don't have CAP_SYS_ADMIN
    pub fn from_custom_root<P: AsRef<Path>>(root: P) -> ProcResult<Self> {
        let path = root.as_ref().join("kpagecount");
        let file = FileWrapper::open(path)?.inner();

        Ok(Self::from_reader(file))
    }
}

impl<R: Read + Seek> KPageCount<R> {
    /// Reads counts from any reader laid out like `/proc/kpagecount`
    pub fn from_reader(reader: R) -> Self {
        Self {
            table: EntryTable::new(reader),
        }
    }

    /// Get the number of references to physical memory at `pfn`
    ///
    /// Returns `None` if pfn is not in RAM, which is not the same as a count of zero.
    ///
    /// See [crate::process::PageMap] and [crate::process::PageEntry::pfn]
    pub fn get_count_at_pfn(&mut self, pfn: Pfn) -> Option<u64> {
        self.table.lookup(pfn.0)
    }

    /// Get the number of references to physical memory for PFNs within `range`, end excluded
    pub fn get_count_in_range(&mut self, range: Range<Pfn>) -> Vec<Option<u64>> {
        (range.start.0..range.end.0)
            .map(|pfn| self.get_count_at_pfn(Pfn(pfn)))
            .collect()
    }
}
