//! Trace record assembly.
//!
//! The tracer turns host events into packed binary records and pushes them
//! through the rotating log. Every record starts with the same 13-byte
//! header:
//!
//! ```plain
//!    ┌────────┬─────────┬───────────────┬─────────────┬─ ─ ─ ─ ─ ─ ─
//!    │  type  │  depth  │  timestamp µs │  codepoint  │  payload ...
//!    ▲────────▲─────────▲───────────────▲─────────────▲
//!    └── 1 ───┴─── 2 ───┴────── 8 ──────┴───── 2 ─────┘
//! ```
//!
//! Call records carry tagged argument snapshots; return records carry the
//! returned value; raise records carry nothing further at this revision.
//! Alongside the record stream the tracer maintains a *time index* of
//! `{timestamp, absolute_offset}` pairs spaced at least one index interval
//! apart, for random access into the stream by wall-clock time.

use std::sync::Arc;

use thiserror::Error;

use crate::{
    clock::{self, Clock},
    host::{CodeRef, HostValue, NativeRef, RenderError, ValueKind},
    intern::{self, Interner},
    listfile::{self, ListFile},
    pack::{self, PackWriter},
    rotdir::RotDir,
    rotrec::{self, RotRec},
    Config,
};

/// Trace record types, the first byte of every record.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RecordKind {
    Invalid = 0,
    /// A pure-function call; payload: `argcount: u16` then tagged arguments.
    Call = 1,
    /// A pure-function return; payload: one tagged value.
    Return = 2,
    /// An exception leaving a pure function.
    Raise = 3,
    /// A native-function call.
    NativeCall = 4,
    /// A native-function return.
    NativeReturn = 5,
    /// An exception leaving a native function.
    NativeRaise = 6,
    /// An in-band log line; payload: `argcount: u16` then length-prefixed
    /// stringified arguments.
    Log = 7,
}

/// Argument tag bytes.
pub const ARG_NIL: u8 = 0;
pub const ARG_OPAQUE: u8 = 1;
pub const ARG_TRUE: u8 = 2;
pub const ARG_FALSE: u8 = 3;
pub const ARG_INT: u8 = 4;
pub const ARG_BIGINT: u8 = 5;
pub const ARG_FLOAT: u8 = 6;
pub const ARG_BYTES: u8 = 7;

/// Integers in `[MIN_IMM_INT, MAX_IMM_INT]` are encoded directly in the tag
/// byte as `ARG_IMM_ZERO + value`, occupying the tag range 8..=58.
pub const MIN_IMM_INT: i64 = -20;
pub const MAX_IMM_INT: i64 = 30;
const ARG_IMM_ZERO: i64 = 28;

/// Float and byte-string snapshots are truncated to this many bytes.
const VALUE_SNAPSHOT_CAP: usize = 50;

/// Scratch space for one record.
const SCRATCH_CAPACITY: usize = 16 * 1024;

/// The error type for [`Tracer`].
#[derive(Error, Debug)]
pub enum Error {
    /// The host failed to stringify an argument.
    #[error("stringify: {0}")]
    Stringify(#[from] RenderError),
    /// A raise event arrived with no pending exception.
    #[error("no exception set")]
    NoExceptionSet,
    #[error("clock: {0}")]
    Clock(#[from] clock::Error),
    #[error("packing record: {0}")]
    Pack(#[from] pack::Error),
    #[error("codepoints: {0}")]
    Intern(#[from] intern::Error),
    #[error("records: {0}")]
    Records(#[from] rotrec::Error),
    #[error("time index: {0}")]
    TimeIndex(#[from] listfile::Error),
}

/// The record-writing half of the tracer.
///
/// A `Tracer` owns its record stream, codepoint file, time index, interner
/// and scratch buffers; it is single-owner and does no locking. Depth
/// bookkeeping is symmetric: a call records at the caller's depth and then
/// descends, every return-class record ascends first, so a matched pair
/// shares one depth value.
pub struct Tracer {
    clock: Clock,
    records: RotRec,
    interner: Interner,
    timeindex: ListFile,
    writer: PackWriter,
    depth: u16,
    index_interval: u64,
    next_index_at: u64,
}

impl Tracer {
    /// Constructs a tracer writing into `rotdir` under `prefix`.
    ///
    /// The codepoint and time-index files are created (truncated) inside the
    /// rotating directory; a failed construction leaks nothing.
    pub fn new(rotdir: Arc<RotDir>, prefix: &str, config: &Config) -> Result<Self, Error> {
        let clock = Clock::new()?;

        let codepoints_name = match &config.codepoints_name {
            Some(name) => name.clone(),
            None => format!("{prefix}.codepoints"),
        };
        let timeindex_name = match &config.timeindex_name {
            Some(name) => name.clone(),
            None => format!("{prefix}.timeindex"),
        };

        let codepoints = ListFile::create(&rotdir.path().join(codepoints_name))
            .map_err(intern::Error::List)?;
        let timeindex = ListFile::create(&rotdir.path().join(timeindex_name))?;
        let records = RotRec::new(rotdir, prefix, config.map_size, config.file_data_size)?;

        Ok(Self {
            clock,
            records,
            interner: Interner::new(codepoints, config.canonical_paths),
            timeindex,
            writer: PackWriter::new(SCRATCH_CAPACITY),
            depth: 0,
            index_interval: config.timeindex_interval,
            next_index_at: 0,
        })
    }

    /// The logical call depth the next call record will carry.
    #[inline]
    pub fn depth(&self) -> u16 {
        self.depth
    }

    /// Records a pure-function call with snapshots of its arguments.
    pub fn record_call(
        &mut self,
        code: &CodeRef<'_>,
        args: &[&dyn HostValue],
    ) -> Result<(), Error> {
        let ts = self.begin(RecordKind::Call)?;
        let cp = self.interner.function(code)?;
        self.writer.put_u16(cp)?;

        self.writer.put_u16(args.len() as u16)?;
        for arg in args {
            self.put_argument(*arg)?;
        }

        self.depth += 1;
        self.finish(ts)
    }

    /// Records a pure-function return with a snapshot of the return value.
    pub fn record_return(
        &mut self,
        code: &CodeRef<'_>,
        value: &dyn HostValue,
    ) -> Result<(), Error> {
        self.depth = self.depth.saturating_sub(1);
        let ts = self.begin(RecordKind::Return)?;
        let cp = self.interner.function(code)?;
        self.writer.put_u16(cp)?;
        self.put_argument(value)?;
        self.finish(ts)
    }

    /// Records an exception leaving a pure function.
    pub fn record_raise(
        &mut self,
        code: &CodeRef<'_>,
        exception: Option<&dyn HostValue>,
    ) -> Result<(), Error> {
        if exception.is_none() {
            return Err(Error::NoExceptionSet);
        }
        self.depth = self.depth.saturating_sub(1);
        let ts = self.begin(RecordKind::Raise)?;
        let cp = self.interner.function(code)?;
        self.writer.put_u16(cp)?;
        self.finish(ts)
    }

    /// Records a native-function call.
    pub fn record_native_call(&mut self, func: &NativeRef<'_>) -> Result<(), Error> {
        let ts = self.begin(RecordKind::NativeCall)?;
        let cp = self.interner.native(func)?;
        self.writer.put_u16(cp)?;
        self.depth += 1;
        self.finish(ts)
    }

    /// Records a native-function return.
    pub fn record_native_return(&mut self, func: &NativeRef<'_>) -> Result<(), Error> {
        self.depth = self.depth.saturating_sub(1);
        let ts = self.begin(RecordKind::NativeReturn)?;
        let cp = self.interner.native(func)?;
        self.writer.put_u16(cp)?;
        self.finish(ts)
    }

    /// Records an exception leaving a native function.
    pub fn record_native_raise(
        &mut self,
        func: &NativeRef<'_>,
        exception: Option<&dyn HostValue>,
    ) -> Result<(), Error> {
        if exception.is_none() {
            return Err(Error::NoExceptionSet);
        }
        self.depth = self.depth.saturating_sub(1);
        let ts = self.begin(RecordKind::NativeRaise)?;
        let cp = self.interner.native(func)?;
        self.writer.put_u16(cp)?;
        self.finish(ts)
    }

    /// Records an in-band log line: the interned format string plus every
    /// item of `args` in stringified form.
    pub fn record_log(
        &mut self,
        fmt: &dyn HostValue,
        args: &dyn HostValue,
    ) -> Result<(), Error> {
        let ts = self.begin(RecordKind::Log)?;
        let cp = self.interner.logline(fmt)?;
        self.writer.put_u16(cp)?;

        let count = args.seq_len().unwrap_or(0);
        self.writer.put_u16(count as u16)?;
        for i in 0..count {
            let item = args.seq_item(i).ok_or(Error::Stringify(RenderError))?;
            let text = item.display()?;
            self.writer.put_pstr(&text)?;
        }
        self.finish(ts)
    }

    /// Flushes and closes the record stream. Idempotent; a closed tracer
    /// reopens a fresh rotating file if another record arrives.
    #[inline]
    pub fn close(&mut self) -> Result<(), Error> {
        self.records.close()?;
        Ok(())
    }

    /// Stamps the record header up to (not including) the codepoint.
    fn begin(&mut self, kind: RecordKind) -> Result<u64, Error> {
        let ts = self.clock.now();
        self.writer.clear();
        self.writer.put_u8(kind as u8)?;
        self.writer.put_u16(self.depth)?;
        self.writer.put_u64(ts)?;
        Ok(ts)
    }

    /// Writes the staged record and updates the time index.
    fn finish(&mut self, ts: u64) -> Result<(), Error> {
        let offset = self.records.write(self.writer.bytes())?;

        if ts >= self.next_index_at {
            let mut entry = [0u8; 16];
            entry[..8].copy_from_slice(&ts.to_le_bytes());
            entry[8..].copy_from_slice(&offset.to_le_bytes());
            self.timeindex.append(&entry)?;
            self.next_index_at = ts + self.index_interval;
        }
        Ok(())
    }

    /// Encodes one tagged value snapshot.
    fn put_argument(&mut self, value: &dyn HostValue) -> Result<(), Error> {
        match value.classify() {
            ValueKind::Nil => self.writer.put_u8(ARG_NIL)?,
            ValueKind::True => self.writer.put_u8(ARG_TRUE)?,
            ValueKind::False => self.writer.put_u8(ARG_FALSE)?,
            ValueKind::Int(v) if (MIN_IMM_INT..=MAX_IMM_INT).contains(&v) => {
                self.writer.put_u8((ARG_IMM_ZERO + v) as u8)?;
            }
            ValueKind::Int(_) => {
                self.writer.put_u8(ARG_INT)?;
                let text = value.repr()?;
                self.writer.put_pstr(&text)?;
            }
            ValueKind::BigInt => {
                self.writer.put_u8(ARG_BIGINT)?;
                let text = value.repr()?;
                self.writer.put_pstr(&text)?;
            }
            ValueKind::Float => {
                self.writer.put_u8(ARG_FLOAT)?;
                let text = value.display()?;
                self.writer.put_pstr(snapshot(&text))?;
            }
            ValueKind::Bytes => {
                self.writer.put_u8(ARG_BYTES)?;
                let bytes = value.as_bytes().ok_or(RenderError)?;
                self.writer.put_pstr(snapshot(bytes))?;
            }
            ValueKind::Opaque => self.writer.put_u8(ARG_OPAQUE)?,
        }
        Ok(())
    }
}

/// Caps a value snapshot at [`VALUE_SNAPSHOT_CAP`] bytes.
#[inline]
fn snapshot(bytes: &[u8]) -> &[u8] {
    &bytes[..bytes.len().min(VALUE_SNAPSHOT_CAP)]
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use crate::{
        host::{CodeRef, HostValue, ObjectId, RenderError, ValueKind},
        rotdir::RotDir,
        tracer::{
            Error, RecordKind, Tracer, ARG_BYTES, ARG_FALSE, ARG_FLOAT, ARG_INT, ARG_NIL,
            ARG_OPAQUE, ARG_TRUE,
        },
        Config,
    };

    /// A stand-in host value for tests.
    enum Value {
        Nil,
        Bool(bool),
        Int(i64),
        Float(f64),
        Bytes(Vec<u8>),
        Opaque,
    }

    impl HostValue for Value {
        fn classify(&self) -> ValueKind {
            match self {
                Value::Nil => ValueKind::Nil,
                Value::Bool(true) => ValueKind::True,
                Value::Bool(false) => ValueKind::False,
                Value::Int(v) => ValueKind::Int(*v),
                Value::Float(_) => ValueKind::Float,
                Value::Bytes(_) => ValueKind::Bytes,
                Value::Opaque => ValueKind::Opaque,
            }
        }

        fn identity(&self) -> ObjectId {
            ObjectId(self as *const Self as u64)
        }

        fn repr(&self) -> Result<Vec<u8>, RenderError> {
            self.display()
        }

        fn display(&self) -> Result<Vec<u8>, RenderError> {
            match self {
                Value::Nil => Ok(b"nil".to_vec()),
                Value::Bool(v) => Ok(format!("{v}").into_bytes()),
                Value::Int(v) => Ok(format!("{v}").into_bytes()),
                Value::Float(v) => Ok(format!("{v}").into_bytes()),
                Value::Bytes(v) => Ok(v.clone()),
                Value::Opaque => Err(RenderError),
            }
        }

        fn as_bytes(&self) -> Option<&[u8]> {
            match self {
                Value::Bytes(v) => Some(v),
                _ => None,
            }
        }
    }

    fn code() -> CodeRef<'static> {
        CodeRef {
            identity: ObjectId(0x7000),
            filename: b"demo.hy",
            name: b"f",
            first_line: 1,
            arg_count: 2,
        }
    }

    fn tracer(dir: &std::path::Path) -> Tracer {
        let rotdir = Arc::new(RotDir::new(dir, 8).unwrap());
        let config = Config::new().map_size(4096).file_data_size(4096);
        Tracer::new(rotdir, "t", &config).unwrap()
    }

    /// Reads back every record currently in the rotating files, in stream
    /// order.
    fn read_records(dir: &std::path::Path) -> Vec<Vec<u8>> {
        let mut files: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|e| e == "rot"))
            .collect();
        files.sort();

        let mut records = Vec::new();
        for path in files {
            let bytes = std::fs::read(path).unwrap();
            let mut pos = 8;
            while pos + 2 <= bytes.len() {
                let size = u16::from_le_bytes(bytes[pos..pos + 2].try_into().unwrap()) as usize;
                if size == 0 {
                    break;
                }
                records.push(bytes[pos + 2..pos + 2 + size].to_vec());
                pos += 2 + size;
            }
        }
        records
    }

    #[test]
    fn test_depth_symmetric_on_matched_pair() {
        let dir = tempdir().unwrap();
        let mut tracer = tracer(dir.path());

        let outer = code();
        tracer.record_call(&outer, &[]).unwrap();
        assert_eq!(tracer.depth(), 1);
        tracer.record_return(&outer, &Value::Nil).unwrap();
        assert_eq!(tracer.depth(), 0);
        tracer.close().unwrap();

        let records = read_records(dir.path());
        assert_eq!(records.len(), 2);
        // type, then depth: both records at depth 0.
        assert_eq!(records[0][0], RecordKind::Call as u8);
        assert_eq!(&records[0][1..3], &0u16.to_le_bytes());
        assert_eq!(records[1][0], RecordKind::Return as u8);
        assert_eq!(&records[1][1..3], &0u16.to_le_bytes());
        // Both refer to the same codepoint.
        assert_eq!(&records[0][11..13], &records[1][11..13]);
    }

    #[test]
    fn test_raise_descends_like_return() {
        let dir = tempdir().unwrap();
        let mut tracer = tracer(dir.path());

        let f = code();
        tracer.record_call(&f, &[]).unwrap();
        let exc = Value::Bytes(b"Boom".to_vec());
        tracer.record_raise(&f, Some(&exc)).unwrap();
        assert_eq!(tracer.depth(), 0);

        assert!(matches!(tracer.record_raise(&f, None), Err(Error::NoExceptionSet)));
    }

    #[test]
    fn test_argument_tags() {
        let dir = tempdir().unwrap();
        let mut tracer = tracer(dir.path());

        let args: Vec<Value> = vec![
            Value::Nil,
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(0),
            Value::Int(-20),
            Value::Int(30),
            Value::Int(31),
            Value::Float(1.5),
            Value::Bytes(b"hey".to_vec()),
            Value::Opaque,
        ];
        let refs: Vec<&dyn HostValue> = args.iter().map(|a| a as &dyn HostValue).collect();
        tracer.record_call(&code(), &refs).unwrap();
        tracer.close().unwrap();

        let records = read_records(dir.path());
        let payload = &records[0][13..];
        assert_eq!(&payload[..2], &10u16.to_le_bytes());

        let tags = &payload[2..];
        assert_eq!(tags[0], ARG_NIL);
        assert_eq!(tags[1], ARG_TRUE);
        assert_eq!(tags[2], ARG_FALSE);
        // Immediate ints carry the value in the tag byte: 28 + v.
        assert_eq!(tags[3], 28);
        assert_eq!(tags[4], 8);
        assert_eq!(tags[5], 58);
        // 31 is out of immediate range, rendered as text.
        assert_eq!(tags[6], ARG_INT);
        assert_eq!(&tags[7..9], &2u16.to_le_bytes());
        assert_eq!(&tags[9..11], b"31");
        assert_eq!(tags[11], ARG_FLOAT);
        assert_eq!(&tags[12..14], &3u16.to_le_bytes());
        assert_eq!(&tags[14..17], b"1.5");
        assert_eq!(tags[17], ARG_BYTES);
        assert_eq!(&tags[18..20], &3u16.to_le_bytes());
        assert_eq!(&tags[20..23], b"hey");
        assert_eq!(tags[23], ARG_OPAQUE);
        assert_eq!(tags.len(), 24);
    }

    #[test]
    fn test_long_snapshots_truncate() {
        let dir = tempdir().unwrap();
        let mut tracer = tracer(dir.path());

        let long = Value::Bytes(vec![b'x'; 200]);
        tracer.record_call(&code(), &[&long]).unwrap();
        tracer.close().unwrap();

        let records = read_records(dir.path());
        let payload = &records[0][13..];
        assert_eq!(payload[2], ARG_BYTES);
        assert_eq!(&payload[3..5], &50u16.to_le_bytes());
        assert_eq!(payload.len(), 2 + 1 + 2 + 50);
    }

    #[test]
    fn test_opaque_render_failure_is_an_error() {
        let dir = tempdir().unwrap();
        let mut tracer = tracer(dir.path());

        // Opaque encodes without rendering, so this succeeds...
        tracer.record_call(&code(), &[&Value::Opaque]).unwrap();
        // ...but a value whose rendering fails surfaces the failure.
        struct Broken;
        impl HostValue for Broken {
            fn classify(&self) -> ValueKind {
                ValueKind::Float
            }
            fn identity(&self) -> ObjectId {
                ObjectId(1)
            }
            fn repr(&self) -> Result<Vec<u8>, RenderError> {
                Err(RenderError)
            }
            fn display(&self) -> Result<Vec<u8>, RenderError> {
                Err(RenderError)
            }
        }
        assert!(matches!(
            tracer.record_call(&code(), &[&Broken]),
            Err(Error::Stringify(_))
        ));
        // The failed record aborted, but the tracer keeps working.
        tracer.record_call(&code(), &[]).unwrap();
    }

    #[test]
    fn test_time_index_spacing() {
        let dir = tempdir().unwrap();
        let rotdir = Arc::new(RotDir::new(dir.path(), 8).unwrap());
        let config =
            Config::new().map_size(4096).file_data_size(4096).timeindex_interval(1000);
        let mut tracer = Tracer::new(rotdir, "t", &config).unwrap();

        let f = code();
        for _ in 0..200 {
            tracer.record_call(&f, &[]).unwrap();
            tracer.record_return(&f, &Value::Nil).unwrap();
        }
        tracer.close().unwrap();

        let bytes = std::fs::read(dir.path().join("t.timeindex")).unwrap();
        let mut entries = Vec::new();
        let mut pos = 0;
        while pos + 4 <= bytes.len() {
            let size = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
            if size == 0 {
                break;
            }
            pos += 4;
            let ts = u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap());
            let offset = u64::from_le_bytes(bytes[pos + 8..pos + 16].try_into().unwrap());
            entries.push((ts, offset));
            pos += size;
        }

        // The very first record is always indexed.
        assert!(!entries.is_empty());
        assert_eq!(entries[0].1, 8);
        // Consecutive entries are at least one interval apart, offsets grow.
        for pair in entries.windows(2) {
            assert!(pair[1].0 >= pair[0].0 + 1000);
            assert!(pair[1].1 > pair[0].1);
        }
    }
}
