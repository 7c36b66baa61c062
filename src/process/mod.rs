//! Functions and structs related to process memory
//!
//! The primary source of data for functions in this module is the files in a `/proc/<pid>/`
//! directory: `maps` lists the memory mappings of the process, and `pagemap` tells, page by page,
//! what backs them.  If you have a process ID, you can use
//! [`Process::new(pid)`](struct.Process.html#method.new).
//!
//! In case you have procfs filesystem mounted to a location other than `/proc`,
//! use [`Process::new_with_root()`](struct.Process.html#method.new_with_root).
//!
//! # Examples
//!
//! Print the physical address of every resident page of the stack:
//!
//! ```rust,no_run
//! use pagemap::process::{MMapPath, Process};
//!
//! let page_size = pagemap::page_size();
//! let me = Process::myself().unwrap();
//! let mut pagemap = me.pagemap().unwrap();
//!
//! for map in me.maps().unwrap() {
//!     if map.path() != MMapPath::Stack {
//!         continue;
//!     }
//!     for va in map.address.pages(page_size) {
//!         if let Some(addr) = pagemap.get_info(va / page_size).and_then(|e| e.physical_address()) {
//!             println!("virt_mem: 0x{:x}, phys_addr: 0x{:x}", va, addr);
//!         }
//!     }
//! }
//! ```

use crate::{FileWrapper, FromRead, ProcError, ProcResult};

use std::path::PathBuf;

mod maps;
pub use maps::*;
pub(crate) use maps::lossy_lines;

mod pagemap;
pub use pagemap::*;


/// Represents a process in `/proc/<pid>`.
#[derive(Debug, Clone)]
pub struct Process {
    pub pid: i32,
    pub(crate) root: PathBuf,
}

/// Methods for constructing a new `Process` object.
impl Process {
    /// Returns a `Process` based on a specified PID.
    ///
    /// This can fail if the process doesn't exist, or if you don't have permission to access it.
    pub fn new(pid: i32) -> ProcResult<Process> {
        let root = PathBuf::from("/proc").join(pid.to_string());
        Self::new_with_root(root)
    }

    /// Returns a `Process` based on a specified `/proc/<pid>` path.
    pub fn new_with_root(root: PathBuf) -> ProcResult<Process> {
        let metadata = wrap_io_error!(root, std::fs::metadata(&root))?;
        if !metadata.is_dir() {
            return Err(ProcError::NotFound(Some(root)));
        }

        let pidres = root
            .as_path()
            .components()
            .last()
            .and_then(|c| match c {
                std::path::Component::Normal(s) => Some(s),
                _ => None,
            })
            .and_then(|s| s.to_string_lossy().parse::<i32>().ok())
            .or_else(|| {
                std::fs::read_link(&root)
                    .ok()
                    .and_then(|s| s.to_string_lossy().parse::<i32>().ok())
            });
        let pid = match pidres {
            Some(pid) => pid,
            None => return Err(ProcError::NotFound(Some(root))),
        };

        Ok(Process { pid, root })
    }

    /// Returns a `Process` for the currently running process.
    ///
    /// This is done by using the `/proc/self` symlink
    pub fn myself() -> ProcResult<Process> {
        let root = PathBuf::from("/proc/self");
        Self::new_with_root(root)
    }
}

impl Process {
    /// Returns the process ID for this process
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// The `/proc/<pid>` directory of this process
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// Return a list of the currently mapped memory regions and their access permissions, based on
    /// the `/proc/pid/maps` file.
    ///
    /// Lines that can't be parsed are skipped.  The returned maps have no pages yet, see
    /// [crate::PageScanner::scan()].
    pub fn maps(&self) -> ProcResult<MemoryMaps> {
        MemoryMaps::from_file(self.root.join("maps"))
    }

    /// Returns a struct that can be used to access information in the `/proc/pid/pagemap` file.
    pub fn pagemap(&self) -> ProcResult<PageMap> {
        let path = self.root.join("pagemap");
        let file = FileWrapper::open(path)?.inner();
        Ok(PageMap::from_reader(file))
    }
}
