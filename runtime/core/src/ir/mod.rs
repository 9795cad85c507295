//! The trace-class schema: trace, stream, event, clock and field classes.
//!
//! Produced by a metadata decoder, consumed read-only by message
//! iterators. See [`trace::TraceClass`] for the freeze-on-observe rules.

pub mod clock;
pub mod field;
pub mod trace;

pub use clock::{clocks_comparable, ClockClass, ClockClassBuilder};
pub use field::{
    ByteOrder, DisplayBase, EnumClass, EnumMapping, FieldClass, FieldClassId, FieldPath, IntClass,
    RealClass, Scope, StructMember, VariantOption, VariantSelector,
};
pub use trace::{EventClass, LogLevel, Quirks, StreamClass, TraceClass};
