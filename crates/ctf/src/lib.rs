//! Decoding of packetized binary traces into tracemux messages.
//!
//! This crate provides the source side of a trace-processing graph:
//! mediums (where bytes come from), the bit-level field decoder, the
//! per-data-stream message iterator, packet indexing with producer-bug
//! fixups, and a source component exposing one output port per data
//! stream.
//!
//! The trace-class schema itself comes from a metadata decoder and is
//! consumed read-only here; see `tracemux_runtime_core::ir`.

pub mod bitio;
pub mod decode;
pub mod file_medium;
pub mod group_medium;
pub mod index;
pub mod iterator;
pub mod medium;
pub mod quirks;
pub mod source;

#[cfg(test)]
pub(crate) mod testdata;

pub use file_medium::FileMedium;
pub use group_medium::GroupMedium;
pub use index::{IndexEntry, PacketIndex};
pub use iterator::MsgIter;
pub use medium::{BufferMedium, Medium};
pub use source::TraceFileSource;
