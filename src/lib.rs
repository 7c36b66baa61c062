#![allow(unknown_lints)]
#![deny(rustdoc::broken_intra_doc_links, rustdoc::invalid_html_tags)]
//! This crate decodes the linux page tables that the kernel exposes through the `procfs`
//! filesystem, usually mounted at `/proc`.
//!
//! Three binary tables are involved:
//!
//! * `/proc/<pid>/pagemap` -- one 64-bit entry per virtual page of a process, telling whether the
//!   page is resident, swapped out or absent, and where it lives.  See [process::PageMap].
//! * `/proc/kpagecount` -- one 64-bit reference count per physical page frame.  See [KPageCount].
//! * `/proc/kpageflags` -- one 64-bit set of state flags per physical page frame.  See
//!   [KPageFlags] and [PhysicalPageFlags].
//!
//! The textual `/proc/<pid>/maps` table is parsed into [process::MemoryMap] records, and a
//! [PageScanner] ties everything together: for every page of every mapping it builds a
//! [process::PageEntry] snapshot, enriched with the frame's reference count and flags when the
//! frame tables are readable.
//!
//! # Permissions
//!
//! Reading `/proc/kpagecount` and `/proc/kpageflags` requires root (or CAP_SYS_ADMIN).  When they
//! can't be opened, scanning still works, but [process::PageEntry::count] and
//! [process::PageEntry::flags] stay `None`.  Without CAP_SYS_ADMIN the kernel also reports every
//! page frame number in `pagemap` as zero.
//!
//! # Cargo features
//!
//! * `serde1` -- Optional.  Derives `Serialize` and `Deserialize` for all data types, so that a
//!   scan can be dumped without losing the difference between an unknown and a zero value.
//!
//! # Example
//!
//! ```rust,no_run
//! use pagemap::{PageScanner, ScanConfig};
//! use pagemap::process::Process;
//!
//! let config = ScanConfig::default();
//! let me = Process::myself().unwrap();
//! let mut scanner = PageScanner::open(&me, &config).unwrap();
//!
//! for map in scanner.scan(me.maps().unwrap(), |path| path.contains("libc")) {
//!     println!("{} ({} resident pages)", map, map.resident_pages());
//! }
//! ```

use lazy_static::lazy_static;

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

macro_rules! build_parse_error {
    ($err: expr) => {
        crate::ProcError::Parse(format!("{}", $err))
    };
    ($err: expr, $msg: expr) => {
        crate::ProcError::Parse(format!("{}: {}", $msg, $err))
    };
}

macro_rules! expect {
    ($e:expr) => {
        match crate::IntoResult::into($e) {
            Ok(v) => v,
            Err(e) => return Err(build_parse_error!(e)),
        }
    };
    ($e:expr, $msg:expr) => {
        match crate::IntoResult::into($e) {
            Ok(v) => v,
            Err(e) => return Err(build_parse_error!(e, $msg)),
        }
    };
}

macro_rules! from_str {
    ($t:tt, $e:expr) => {{
        let e = $e;
        expect!(
            $t::from_str_radix(e, 10),
            format!("Failed to parse {} ({:?}) as a {}", stringify!($e), e, stringify!($t))
        )
    }};
    ($t:tt, $e:expr, $radix:expr) => {{
        let e = $e;
        expect!(
            $t::from_str_radix(e, $radix),
            format!("Failed to parse {} ({:?}) as a {}", stringify!($e), e, stringify!($t))
        )
    }};
}

macro_rules! wrap_io_error {
    ($path:expr, $expr:expr) => {
        match $expr {
            Ok(v) => Ok(v),
            Err(e) => {
                let kind = e.kind();
                Err(::std::io::Error::new(
                    kind,
                    crate::IoErrorWrapper {
                        path: $path.to_owned(),
                        inner: e.into(),
                    },
                ))
            }
        }
    };
}

mod table;
pub use table::*;

mod kpagecount;
pub use kpagecount::*;

mod kpageflags;
pub use kpageflags::*;

pub mod process;

mod scan;
pub use scan::*;

lazy_static! {
    /// Memory page size, in bytes.
    ///
    /// This is calculated from `sysconf(_SC_PAGESIZE)`.
    static ref PAGESIZE: u64 = {
        page_size()
    };
}

/// Memory page size, in bytes.
///
/// This is calculated from `sysconf(_SC_PAGESIZE)`.
pub fn page_size() -> u64 {
    rustix::param::page_size() as u64
}

/// Common result type of all fallible operations in this crate.
pub type ProcResult<T> = Result<T, ProcError>;

/// The various error conditions in this crate.
///
/// `PermissionDenied`, `NotFound` and `Io` all mean a table or file could not be used; see
/// [ProcError::is_unavailable].  A failed read from an already opened table is never an error,
/// lookups return `None` instead.
#[derive(Debug)]
pub enum ProcError {
    /// A standard permission denied error.
    ///
    /// This will be a common error, since `/proc/kpageflags` and `/proc/kpagecount` are only
    /// readable by root.
    PermissionDenied(Option<PathBuf>),
    /// This might mean that the process no longer exists, or that your kernel doesn't support the
    /// feature you are trying to use.
    NotFound(Option<PathBuf>),
    /// This might mean that a file was truncated while it was being read.
    Incomplete(Option<PathBuf>),
    /// Any other IO error (rare).
    Io(io::Error, Option<PathBuf>),
    /// Text that doesn't have the expected shape: a `maps` line, an address range or an address.
    Parse(String),
    /// Any other non-IO error (rare).
    Other(String),
}

impl ProcError {
    /// Is this the error of a resource that couldn't be opened or read?
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            ProcError::PermissionDenied(_) | ProcError::NotFound(_) | ProcError::Io(..)
        )
    }

    /// The path of the resource this error is about, if known.
    pub fn path(&self) -> Option<&Path> {
        match self {
            ProcError::PermissionDenied(p) | ProcError::NotFound(p) | ProcError::Incomplete(p) => p.as_deref(),
            ProcError::Io(_, p) => p.as_deref(),
            ProcError::Parse(_) | ProcError::Other(_) => None,
        }
    }
}

impl fmt::Display for ProcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcError::PermissionDenied(Some(p)) => write!(f, "Permission Denied: {}", p.display()),
            ProcError::NotFound(Some(p)) => write!(f, "File not found: {}", p.display()),
            ProcError::Incomplete(Some(p)) => write!(f, "Data incomplete: {}", p.display()),
            ProcError::Io(inner, Some(p)) => {
                write!(f, "Unexpected IO error({}): {}", p.display(), inner)
            }
            ProcError::PermissionDenied(None) => write!(f, "Permission Denied"),
            ProcError::NotFound(None) => write!(f, "File not found"),
            ProcError::Incomplete(None) => write!(f, "Data incomplete"),
            ProcError::Io(inner, None) => write!(f, "Unexpected IO error: {}", inner),
            ProcError::Parse(s) => write!(f, "Parse error: {}", s),
            ProcError::Other(s) => write!(f, "Unknown error {}", s),
        }
    }
}

impl std::error::Error for ProcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcError::Io(inner, _) => Some(inner),
            _ => None,
        }
    }
}

impl From<io::Error> for ProcError {
    fn from(io: io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = io.kind();
        // the only way to get a path is via the IoErrorWrapper that FileWrapper attaches
        let path: Option<PathBuf> = io
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<IoErrorWrapper>().map(|wrapper| wrapper.path.clone()));

        // ESRCH: the process went away between opening its directory and reading from it
        if io.raw_os_error() == Some(rustix::io::Errno::SRCH.raw_os_error()) {
            return ProcError::NotFound(path);
        }

        match kind {
            ErrorKind::PermissionDenied => ProcError::PermissionDenied(path),
            ErrorKind::NotFound => ProcError::NotFound(path),
            ErrorKind::UnexpectedEof => ProcError::Incomplete(path),
            _other => ProcError::Io(io, path),
        }
    }
}

impl From<std::num::ParseIntError> for ProcError {
    fn from(e: std::num::ParseIntError) -> Self {
        ProcError::Parse(e.to_string())
    }
}

/// An `io::Error` payload that remembers which path the error came from.
#[derive(Debug)]
pub(crate) struct IoErrorWrapper {
    pub path: PathBuf,
    pub inner: Box<dyn std::error::Error + Send + Sync>,
}

impl std::error::Error for IoErrorWrapper {}

impl fmt::Display for IoErrorWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IoErrorWrapper({}): {}", self.path.display(), self.inner)
    }
}

/// Marker for an `Option` that was unexpectedly `None`.
#[derive(Debug)]
pub(crate) struct NoneError;

impl fmt::Display for NoneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "value not present")
    }
}

pub(crate) trait IntoResult<T, E> {
    fn into(t: Self) -> Result<T, E>;
}

impl<T> IntoResult<T, NoneError> for Option<T> {
    fn into(t: Option<T>) -> Result<T, NoneError> {
        t.ok_or(NoneError)
    }
}

impl<T, E> IntoResult<T, E> for Result<T, E> {
    fn into(t: Result<T, E>) -> Result<T, E> {
        t
    }
}

/// A trait for parsing something from a reader.
pub trait FromRead: Sized {
    /// Read the type from a Read
    fn from_read<R: Read>(r: R) -> ProcResult<Self>;

    /// Read the type from a file.
    fn from_file<P: AsRef<Path>>(path: P) -> ProcResult<Self> {
        let file = FileWrapper::open(path)?;
        Self::from_read(file)
    }
}

/// A trait for parsing something from a buffered reader.
pub trait FromBufRead: Sized {
    fn from_buf_read<R: BufRead>(r: R) -> ProcResult<Self>;
}

impl<T: FromBufRead> FromRead for T {
    fn from_read<R: Read>(r: R) -> ProcResult<Self> {
        T::from_buf_read(BufReader::new(r))
    }
}

/// A wrapper around a `File` that remembers the name of the path
pub(crate) struct FileWrapper {
    inner: File,
    path: PathBuf,
}

impl FileWrapper {
    pub(crate) fn open<P: AsRef<Path>>(path: P) -> Result<FileWrapper, io::Error> {
        let p = path.as_ref();
        let f = wrap_io_error!(p, File::open(p))?;
        Ok(FileWrapper {
            inner: f,
            path: p.to_owned(),
        })
    }

    /// Returns the inner file
    pub(crate) fn inner(self) -> File {
        self.inner
    }
}

impl Read for FileWrapper {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        wrap_io_error!(self.path, self.inner.read(buf))
    }
    fn read_to_end(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        wrap_io_error!(self.path, self.inner.read_to_end(buf))
    }
    fn read_to_string(&mut self, buf: &mut String) -> io::Result<usize> {
        wrap_io_error!(self.path, self.inner.read_to_string(buf))
    }
    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        wrap_io_error!(self.path, self.inner.read_exact(buf))
    }
}
