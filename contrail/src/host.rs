//! The host-runtime seam.
//!
//! The tracer is host-agnostic: it sees the runtime's objects only through
//! the borrowed views in this module, which a binding constructs inside the
//! profile-hook callback. None of these references may be stored past the
//! callback that produced them; the tracer never does.

use thiserror::Error;

/// The host failed to stringify a value.
#[derive(Error, Clone, Copy, Debug)]
#[error("stringifying host value failed")]
pub struct RenderError;

/// The stable identity of a host-runtime object, typically its address.
///
/// Identity equality (not value equality) is the interning contract: two
/// objects with the same id are the same object, and an object's descriptor
/// is assumed immutable for its lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ObjectId(pub u64);

/// Classification of a host value for argument encoding.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ValueKind {
    /// The host's null/nil singleton.
    Nil,
    True,
    False,
    /// A machine integer with its value.
    Int(i64),
    /// An arbitrary-precision integer.
    BigInt,
    Float,
    /// A byte string.
    Bytes,
    /// Anything the tracer does not know how to encode.
    Opaque,
}

/// A borrowed view of a host-runtime value.
///
/// Valid only for the duration of the hook callback that produced it.
pub trait HostValue {
    /// Classifies the value for encoding.
    fn classify(&self) -> ValueKind;

    /// The value's stable identity.
    fn identity(&self) -> ObjectId;

    /// Exact, re-readable rendering (the host's `repr`).
    fn repr(&self) -> Result<Vec<u8>, RenderError>;

    /// Human rendering (the host's `str`).
    fn display(&self) -> Result<Vec<u8>, RenderError>;

    /// The raw bytes of a [`ValueKind::Bytes`] value.
    fn as_bytes(&self) -> Option<&[u8]> {
        None
    }

    /// For sequence values: the number of items.
    fn seq_len(&self) -> Option<usize> {
        None
    }

    /// For sequence values: the item at `index`.
    fn seq_item(&self, index: usize) -> Option<&dyn HostValue> {
        let _ = index;
        None
    }
}

/// A borrowed descriptor of a pure (bytecode) function.
///
/// Valid only for the duration of the hook callback; `identity` must be
/// stable for the lifetime of the underlying code object.
#[derive(Clone, Copy, Debug)]
pub struct CodeRef<'a> {
    pub identity: ObjectId,
    /// Source file, as the host stores it.
    pub filename: &'a [u8],
    /// Function name.
    pub name: &'a [u8],
    /// First line of the function in its source file.
    pub first_line: u32,
    /// How many leading frame slots hold arguments (including the
    /// vararg/kwarg collector slots, when present).
    pub arg_count: u16,
}

/// A borrowed descriptor of a native (built-in) function.
#[derive(Clone, Copy, Debug)]
pub struct NativeRef<'a> {
    pub identity: ObjectId,
    /// The module the function lives in, if any.
    pub module: Option<&'a [u8]>,
    pub name: &'a [u8],
}

/// Per-function tracing flags.
///
/// The bit values are an external contract: hosts that stash these flags on
/// their function descriptors keep working unchanged.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct TraceFlags(u32);

impl TraceFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// The function's own call and return are not recorded.
    pub const IGNORED_SINGLE: Self = Self(0x0200_0000);
    /// The function is recorded, but while it is on the stack all of its
    /// descendants are suppressed.
    pub const IGNORED_CHILDREN: Self = Self(0x0400_0000);
    /// Both of the above.
    pub const IGNORED_WHOLE: Self =
        Self(Self::IGNORED_SINGLE.0 | Self::IGNORED_CHILDREN.0);
    /// Reserved for a per-event verbose mode.
    pub const DETAILED: Self = Self(0x0800_0000);

    /// Constructs flags from their raw bit representation.
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// The raw bit representation.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set in `self`.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TraceFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Reads tracing flags off the host's function descriptors.
///
/// Hosts stash the flag bits in host-specific places (a spare field on the
/// code object, method-definition flags, a side table); the dispatcher only
/// ever reads them through this adapter.
pub trait FlagsProvider {
    /// Flags of a pure-function descriptor.
    fn code_flags(&self, code: &CodeRef<'_>) -> TraceFlags;

    /// Flags of a native-function descriptor.
    fn native_flags(&self, func: &NativeRef<'_>) -> TraceFlags;
}

#[cfg(test)]
mod tests {
    use crate::host::TraceFlags;

    #[test]
    fn test_flag_bits() {
        assert_eq!(TraceFlags::IGNORED_SINGLE.bits(), 0x0200_0000);
        assert_eq!(TraceFlags::IGNORED_CHILDREN.bits(), 0x0400_0000);
        assert_eq!(
            TraceFlags::IGNORED_WHOLE,
            TraceFlags::IGNORED_SINGLE | TraceFlags::IGNORED_CHILDREN
        );
        assert!(TraceFlags::IGNORED_WHOLE.contains(TraceFlags::IGNORED_SINGLE));
        assert!(!TraceFlags::NONE.contains(TraceFlags::IGNORED_SINGLE));
    }

    #[test]
    fn test_raw_bits_round_trip() {
        // Hosts stash the flags as raw bits on their function descriptors; a
        // binding reads them back with `from_bits`, reserved bits included.
        assert_eq!(TraceFlags::DETAILED.bits(), 0x0800_0000);

        let raw = TraceFlags::IGNORED_SINGLE.bits() | TraceFlags::DETAILED.bits();
        let flags = TraceFlags::from_bits(raw);
        assert!(flags.contains(TraceFlags::IGNORED_SINGLE));
        assert!(flags.contains(TraceFlags::DETAILED));
        assert!(!flags.contains(TraceFlags::IGNORED_CHILDREN));
        assert_eq!(flags, TraceFlags::IGNORED_SINGLE | TraceFlags::DETAILED);
        assert_eq!(flags.bits(), raw);
    }
}
