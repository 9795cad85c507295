//! Field classes: the typed shape of every piece of decoded data.
//!
//! All field classes of one trace class live in a single arena owned by
//! the trace class and are addressed by [`FieldClassId`]. Links between
//! field classes (struct members, array elements, variant options) are
//! ids, never owning pointers, so the class graph is acyclic by
//! construction and freezing is one flag flip on the arena.

use super::clock::ClockClass;

/// Index of a field class in its trace class's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldClassId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

/// Preferred display radix of an integer field. Purely cosmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayBase {
    Binary,
    Octal,
    Decimal,
    Hexadecimal,
}

/// A fixed-width integer layout: 1 to 64 bits, any alignment, either
/// byte order, optionally mapped to a clock class (in which case decoding
/// one updates the stream's current clock snapshot).
#[derive(Debug, Clone)]
pub struct IntClass {
    pub signed: bool,
    pub bits: u8,
    /// Minimum alignment of the first bit, in bits. At least 1.
    pub alignment: u32,
    pub byte_order: ByteOrder,
    pub base: DisplayBase,
    pub mapped_clock: Option<ClockClass>,
}

impl IntClass {
    pub fn new(signed: bool, bits: u8, byte_order: ByteOrder) -> Self {
        IntClass {
            signed,
            bits,
            alignment: if bits % 8 == 0 { 8 } else { 1 },
            byte_order,
            base: DisplayBase::Decimal,
            mapped_clock: None,
        }
    }

    pub fn with_alignment(mut self, alignment: u32) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_base(mut self, base: DisplayBase) -> Self {
        self.base = base;
        self
    }

    pub fn with_mapped_clock(mut self, clock: ClockClass) -> Self {
        self.mapped_clock = Some(clock);
        self
    }
}

/// One label of an enumeration, selecting one or more inclusive integer
/// ranges. Ranges of different labels may overlap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumMapping {
    pub label: String,
    /// Inclusive `(lower, upper)` bounds, in the container's signedness
    /// (widened to 128 bits so one representation covers both).
    pub ranges: Vec<(i128, i128)>,
}

#[derive(Debug, Clone)]
pub struct EnumClass {
    pub container: IntClass,
    pub mappings: Vec<EnumMapping>,
}

impl EnumClass {
    /// Every label whose ranges contain `value`.
    pub fn labels_for(&self, value: i128) -> Vec<&str> {
        self.mappings
            .iter()
            .filter(|m| m.ranges.iter().any(|&(lo, hi)| lo <= value && value <= hi))
            .map(|m| m.label.as_str())
            .collect()
    }
}

/// An IEEE-754 binary floating point layout, described by its exponent
/// and mantissa digit counts: 8/24 is single precision, 11/53 double.
#[derive(Debug, Clone)]
pub struct RealClass {
    pub exp_digits: u8,
    pub mant_digits: u8,
    pub alignment: u32,
    pub byte_order: ByteOrder,
}

impl RealClass {
    pub fn single(byte_order: ByteOrder) -> Self {
        RealClass {
            exp_digits: 8,
            mant_digits: 24,
            alignment: 8,
            byte_order,
        }
    }

    pub fn double(byte_order: ByteOrder) -> Self {
        RealClass {
            exp_digits: 11,
            mant_digits: 53,
            alignment: 8,
            byte_order,
        }
    }

    pub fn total_bits(&self) -> u32 {
        self.exp_digits as u32 + self.mant_digits as u32
    }
}

/// One named member of a structure.
#[derive(Debug, Clone)]
pub struct StructMember {
    pub name: String,
    pub class: FieldClassId,
    /// Minimum alignment in bits; the effective alignment also honors the
    /// member class's own alignment.
    pub min_alignment: u32,
}

/// The six decoding scopes, in hierarchy order. Field paths resolve
/// against them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Scope {
    PacketHeader,
    PacketContext,
    EventHeader,
    EventCommonContext,
    EventSpecificContext,
    EventPayload,
}

/// An absolute reference to a field: a root scope and the member names
/// walked from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    pub root: Scope,
    pub items: Vec<String>,
}

impl FieldPath {
    pub fn new<I, S>(root: Scope, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldPath {
            root,
            items: items.into_iter().map(Into::into).collect(),
        }
    }
}

/// How a variant option is selected by the tag field's value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariantSelector {
    /// Tag is an integer in one of these inclusive ranges.
    Ranges(Vec<(i128, i128)>),
    /// Tag is an enumeration whose value maps to this label.
    Label(String),
}

#[derive(Debug, Clone)]
pub struct VariantOption {
    pub name: String,
    pub selector: VariantSelector,
    pub class: FieldClassId,
}

/// A field class. See the module docs for the arena model.
#[derive(Debug, Clone)]
pub enum FieldClass {
    FixedInt(IntClass),
    Enum(EnumClass),
    Real(RealClass),
    /// A NUL-terminated byte string, byte aligned. UTF-8 unless the
    /// producer declared otherwise.
    CtfString,
    Struct {
        members: Vec<StructMember>,
        min_alignment: u32,
    },
    StaticArray {
        element: FieldClassId,
        length: u64,
    },
    /// A sequence: the length is read from another, previously decoded
    /// field.
    DynArray {
        element: FieldClassId,
        length_path: FieldPath,
    },
    Variant {
        tag_path: FieldPath,
        options: Vec<VariantOption>,
    },
}
