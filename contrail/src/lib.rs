//! A continuous, low-overhead execution tracer for dynamic host runtimes,
//! written in Rust.
//!
//! ### Recording
//!
//! Contrail layers on the host runtime's profile hook: every function entry,
//! return and raised exception becomes one compact, packed binary record
//! with a timestamp, the logical call depth and (for calls) snapshots of the
//! arguments. Nothing is sampled and nothing is buffered across the process
//! boundary; records go straight into memory-mapped pages, so the common
//! event costs a few dozen nanoseconds and no system call, and whatever the
//! kernel has paged out survives a crash.
//!
//! ### Rotation
//!
//! The record stream is striped across a bounded set of fixed-size files
//! managed by a [`RotDir`]: when all file slots have been used, the one
//! released longest ago is unlinked to make room, so a long-running program
//! can be traced continuously within a fixed disk budget. Each file carries
//! the stream offset at which it begins, which keeps a record's absolute
//! offset stable across rotation.
//!
//! ### Interning
//!
//! Source locations (function code objects, native function descriptors, log
//! format strings) are interned: the stream carries a 16-bit *codepoint* and
//! the expanded descriptor is written exactly once to a side file. A second
//! side file, the *time index*, maps wall-clock timestamps to absolute
//! stream offsets about once a second, for cheap seeking in long traces.
//!
//! ## Usage
//!
//! A host binding constructs a shared [`RotDir`], a [`Tracer`] per execution
//! context, and feeds profile-hook events through a [`HookDispatcher`]:
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use contrail_trace::{Config, HookDispatcher, RotDir, Tracer};
//! # struct NoFlags;
//! # impl contrail_trace::FlagsProvider for NoFlags {
//! #     fn code_flags(&self, _: &contrail_trace::CodeRef<'_>) -> contrail_trace::TraceFlags {
//! #         contrail_trace::TraceFlags::NONE
//! #     }
//! #     fn native_flags(&self, _: &contrail_trace::NativeRef<'_>) -> contrail_trace::TraceFlags {
//! #         contrail_trace::TraceFlags::NONE
//! #     }
//! # }
//! let rotdir = Arc::new(RotDir::new("/var/log/myapp/trace", 16)?);
//! let config = Config::new().file_data_size(16 * 1024 * 1024);
//! let tracer = Tracer::new(rotdir, "worker-0", &config)?;
//!
//! let mut hook = HookDispatcher::new(tracer, NoFlags, None);
//! hook.start()?;
//! // ... install the host's profile hook, forwarding events to
//! // `hook.dispatch(...)`, until `hook.stop()` ...
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! The events themselves, and the values they carry, reach the dispatcher
//! through the borrowed views in [`host`] — the tracer never retains a host
//! reference past the hook callback that produced it.

pub mod host;
pub use host::{
    CodeRef, FlagsProvider, HostValue, NativeRef, ObjectId, RenderError, TraceFlags, ValueKind,
};

pub mod hook;
pub use hook::{Control, Error as HookError, HookDispatcher, HookEvent};

pub mod rotdir;
pub use rotdir::RotDir;

pub mod tracer;
pub use tracer::{Error as TraceError, RecordKind, Tracer};

pub mod clock;
pub mod htable;
pub mod intern;
pub mod listfile;
pub mod mmap;
pub mod pack;
pub mod rotrec;

/// The default size of the sliding map window (4 MiB).
pub const DEFAULT_MAP_SIZE: usize = 4 * 1024 * 1024;

/// The default data area of one rotating file (32 MiB).
pub const DEFAULT_FILE_DATA_SIZE: u64 = 32 * 1024 * 1024;

/// The default spacing of time-index entries, in microseconds (1 s).
pub const DEFAULT_TIMEINDEX_INTERVAL: u64 = 1_000_000;

/// Configuration of a tracer instance.
pub struct Config {
    pub(crate) map_size: usize,
    pub(crate) file_data_size: u64,
    pub(crate) codepoints_name: Option<String>,
    pub(crate) timeindex_name: Option<String>,
    pub(crate) timeindex_interval: u64,
    pub(crate) canonical_paths: bool,
}

impl Config {
    /// Constructs a new `Config`.
    #[inline]
    pub fn new() -> Self {
        Default::default()
    }

    /// How much of the current rotating file is kept mapped at a time.
    ///
    /// Must not exceed `file_data_size`. The default value is
    /// [`DEFAULT_MAP_SIZE`].
    #[inline]
    pub fn map_size(mut self, size: usize) -> Self {
        self.map_size = size;
        self
    }

    /// The data area of one rotating file, excluding its 8-byte header.
    ///
    /// Together with the rotating directory's slot count this bounds the
    /// total disk usage of a trace. The default value is
    /// [`DEFAULT_FILE_DATA_SIZE`].
    #[inline]
    pub fn file_data_size(mut self, size: u64) -> Self {
        self.file_data_size = size;
        self
    }

    /// The codepoint file name inside the rotating directory.
    ///
    /// The default is `"<prefix>.codepoints"`.
    #[inline]
    pub fn codepoints_name(mut self, name: Option<String>) -> Self {
        self.codepoints_name = name;
        self
    }

    /// The time-index file name inside the rotating directory.
    ///
    /// The default is `"<prefix>.timeindex"`.
    #[inline]
    pub fn timeindex_name(mut self, name: Option<String>) -> Self {
        self.timeindex_name = name;
        self
    }

    /// The minimum spacing between time-index entries, in microseconds.
    ///
    /// The default value is [`DEFAULT_TIMEINDEX_INTERVAL`].
    #[inline]
    pub fn timeindex_interval(mut self, interval: u64) -> Self {
        self.timeindex_interval = interval;
        self
    }

    /// Whether function filenames are resolved to canonical absolute paths
    /// in codepoint descriptors.
    ///
    /// It is disabled by default.
    #[inline]
    pub fn canonical_paths(mut self, flag: bool) -> Self {
        self.canonical_paths = flag;
        self
    }
}

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Self {
            map_size: DEFAULT_MAP_SIZE,
            file_data_size: DEFAULT_FILE_DATA_SIZE,
            codepoints_name: None,
            timeindex_name: None,
            timeindex_interval: DEFAULT_TIMEINDEX_INTERVAL,
            canonical_paths: false,
        }
    }
}
