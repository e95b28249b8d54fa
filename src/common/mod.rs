//! Supporting utility type.
mod bytestr;
pub use bytestr::ByteStr;

/// Trace when the `tracing` feature is enabled.
macro_rules! verbose {
    ($($tt:tt)*) => {
        #[cfg(feature = "tracing")]
        tracing::trace!($($tt)*)
    };
}

/// Warn when the `tracing` feature is enabled.
macro_rules! verbose_warn {
    ($($tt:tt)*) => {
        #[cfg(feature = "tracing")]
        tracing::warn!($($tt)*)
    };
}

/// Create and enter `Span` when the `tracing` feature is enabled.
macro_rules! span {
    ($($tt:tt)*) => {
        #[cfg(feature = "tracing")]
        let s = tracing::trace_span!($($tt)*);
        #[cfg(feature = "tracing")]
        let _s = s.enter();
    };
}

pub(crate) use verbose;
pub(crate) use verbose_warn;
pub(crate) use span;

