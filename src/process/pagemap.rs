use crate::{EntryTable, PhysicalPageFlags};

use bitflags::bitflags;
use std::{
    fmt,
    fs::File,
    io::{Read, Seek},
    mem::size_of,
    ops::Range,
};

#[cfg(feature = "serde1")]
use serde::{Deserialize, Serialize};

const fn genmask(high: usize, low: usize) -> u64 {
    let mask_bits = size_of::<u64>() * 8;
    (!0 - (1 << low) + 1) & (!0 >> (mask_bits - 1 - high))
}

// source: include/linux/swap.h
const MAX_SWAPFILES_SHIFT: usize = 5;

const PAGE_SHIFT_SHIFT: usize = 55;

bitflags! {
    // Layout of one /proc/<pid>/pagemap entry. Several fields overlap, which one applies
    // depends on PRESENT and SWAP.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct EntryBits: u64 {
        const PFN = genmask(54, 0);
        const SWAP_TYPE = genmask(MAX_SWAPFILES_SHIFT - 1, 0);
        const SWAP_OFFSET = genmask(54, MAX_SWAPFILES_SHIFT);
        const PAGE_SHIFT = genmask(60, PAGE_SHIFT_SHIFT);
        const RESERVED = 1 << 61;
        const SWAP = 1 << 62;
        const PRESENT = 1 << 63;
    }
}

/// A physical page frame number
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pfn(pub u64);

impl From<u64> for Pfn {
    fn from(value: u64) -> Self {
        Pfn(value)
    }
}

impl From<Pfn> for u64 {
    fn from(value: Pfn) -> Self {
        value.0
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Where a virtual page currently lives
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageState {
    /// Backed by a physical page frame
    Present,
    /// Paged out to a swap device
    Swapped,
    /// Neither resident nor swapped, e.g. never touched
    Absent,
}

impl fmt::Display for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageState::Present => write!(f, "present"),
            PageState::Swapped => write!(f, "swapped"),
            PageState::Absent => write!(f, "absent"),
        }
    }
}

/// A snapshot of one virtual page, decoded from its `/proc/<pid>/pagemap` entry.
///
/// `pfn` is only meaningful when `present` is set, `swap_type` and `swap_offset` only when
/// `swapped` is set.  All of them are always decoded from the raw entry.
///
/// `count` and `flags` come from `/proc/kpagecount` and `/proc/kpageflags`.  They are only looked
/// up for present pages, and stay `None` whenever the frame tables are unreadable or have no entry
/// for the frame.
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageEntry {
    pub present: bool,
    pub swapped: bool,
    /// Bit 61.  Set for file-backed or shared-anonymous pages on current kernels.
    pub reserved: bool,
    pub pfn: Pfn,
    pub swap_type: u8,
    pub swap_offset: u64,
    /// log2 of the page size for this entry
    pub page_shift: u8,
    /// Number of times the frame is mapped
    pub count: Option<u64>,
    pub flags: Option<PhysicalPageFlags>,
}

impl PageEntry {
    /// Decodes a raw pagemap entry.  Every 64-bit value is a valid entry.
    pub fn decode(code: u64) -> Self {
        let bits = EntryBits::from_bits_retain(code);

        PageEntry {
            present: bits.contains(EntryBits::PRESENT),
            swapped: bits.contains(EntryBits::SWAP),
            reserved: bits.contains(EntryBits::RESERVED),
            pfn: Pfn((bits & EntryBits::PFN).bits()),
            swap_type: (bits & EntryBits::SWAP_TYPE).bits() as u8,
            swap_offset: (bits & EntryBits::SWAP_OFFSET).bits() >> MAX_SWAPFILES_SHIFT,
            page_shift: ((bits & EntryBits::PAGE_SHIFT).bits() >> PAGE_SHIFT_SHIFT) as u8,
            count: None,
            flags: None,
        }
    }

    pub fn state(&self) -> PageState {
        if self.present {
            PageState::Present
        } else if self.swapped {
            PageState::Swapped
        } else {
            PageState::Absent
        }
    }

    /// The byte address of the backing frame, `pfn << page_shift`, for present pages.
    ///
    /// `None` if the page isn't present, or if the address doesn't fit in 64 bits.
    pub fn physical_address(&self) -> Option<u64> {
        if !self.present {
            return None;
        }
        let page_bytes = 1u64.checked_shl(u32::from(self.page_shift))?;
        self.pfn.0.checked_mul(page_bytes)
    }
}

impl fmt::Display for PageEntry {
    /// `<physical address> [count] [flags]` for present pages, else `swapped` or `absent`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.physical_address() {
            Some(addr) => {
                write!(f, "{:x}", addr)?;
                if let Some(count) = self.count {
                    write!(f, " {}", count)?;
                }
                if let Some(flags) = self.flags {
                    write!(f, " {}", flags)?;
                }
                Ok(())
            }
            None => write!(f, "{}", self.state()),
        }
    }
}

/// Parses page table entries accessing `/proc/<pid>/pagemap`.
///
/// To construct this structure, see [super::Process::pagemap()].
#[derive(Debug)]
pub struct PageMap<R = File> {
    table: EntryTable<R>,
}

impl<R: Read + Seek> PageMap<R> {
    /// Reads entries from any reader laid out like `/proc/<pid>/pagemap`
    pub fn from_reader(reader: R) -> Self {
        Self {
            table: EntryTable::new(reader),
        }
    }

    /// The raw entry for the page at index `page_index` (virtual address / page size)
    pub fn lookup(&mut self, page_index: u64) -> Option<u64> {
        self.table.lookup(page_index)
    }

    /// Retrieves information in the page table entry for the page at index `page_index`.
    ///
    /// Some mappings are not accessible, and will return `None`: `vsyscall`
    pub fn get_info(&mut self, page_index: u64) -> Option<PageEntry> {
        self.lookup(page_index).map(PageEntry::decode)
    }

    /// Retrieves information in the page table entry for the pages with index in range `page_range`.
    pub fn get_range_info(&mut self, page_range: Range<u64>) -> Vec<Option<PageEntry>> {
        page_range.map(|index| self.get_info(index)).collect()
    }
}
