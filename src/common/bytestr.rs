//! A cheaply cloneable, `str`-validated wrapper around [`Bytes`].
use bytes::Bytes;
use std::{fmt, ops::Deref, str::Utf8Error};

/// A [`Bytes`] known to contain valid UTF-8.
///
/// Cloning is a refcount bump, not an allocation, which matters for the protocol layer:
/// row field names and session parameter values are sliced straight out of the read
/// buffer and handed back to callers without copying.
#[derive(Clone, Eq, PartialEq, Hash, Default)]
pub struct ByteStr(Bytes);

impl ByteStr {
    /// Validate `bytes` as UTF-8, without copying.
    pub fn from_utf8(bytes: Bytes) -> Result<Self, Utf8Error> {
        std::str::from_utf8(&bytes)?;
        Ok(Self(bytes))
    }

    /// Wrap a `'static` string with no allocation.
    pub fn from_static(s: &'static str) -> Self {
        Self(Bytes::from_static(s.as_bytes()))
    }

    /// Copy `s` into an owned buffer.
    pub fn copy_from_str(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// Borrow as `&str`.
    pub fn as_str(&self) -> &str {
        // SAFETY: validated in `from_utf8`/`from_static`/`copy_from_str`.
        unsafe { std::str::from_utf8_unchecked(&self.0) }
    }

    /// Re-slice a subslice of `self`'s backing storage without copying, the way
    /// [`Bytes::slice_ref`] does for byte slices.
    pub fn slice_ref(&self, subset: &str) -> Self {
        Self(self.0.slice_ref(subset.as_bytes()))
    }
}

impl From<&str> for ByteStr {
    fn from(s: &str) -> Self {
        Self::copy_from_str(s)
    }
}

impl From<String> for ByteStr {
    fn from(s: String) -> Self {
        Self(Bytes::from(s.into_bytes()))
    }
}

impl Deref for ByteStr {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl AsRef<str> for ByteStr {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl PartialEq<str> for ByteStr {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for ByteStr {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl fmt::Display for ByteStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ByteStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}
