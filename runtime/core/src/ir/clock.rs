//! Clock classes.

use std::rc::Rc;

use uuid::Uuid;

use crate::error::Error;

const NS_PER_S: i128 = 1_000_000_000;

#[derive(Debug)]
struct ClockClassInner {
    name: Option<String>,
    description: Option<String>,
    /// Ticks per second. Always > 0.
    frequency: u64,
    offset_seconds: i64,
    /// Always < `frequency`.
    offset_cycles: u64,
    precision: u64,
    is_absolute: bool,
    uuid: Option<Uuid>,
}

/// A clock class: the metadata shared by every snapshot of one clock.
///
/// Clock classes are immutable once built and freely shared.
#[derive(Clone)]
pub struct ClockClass(Rc<ClockClassInner>);

impl ClockClass {
    pub fn builder(frequency: u64) -> ClockClassBuilder {
        ClockClassBuilder {
            name: None,
            description: None,
            frequency,
            offset_seconds: 0,
            offset_cycles: 0,
            precision: 0,
            is_absolute: false,
            uuid: None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.0.description.as_deref()
    }

    pub fn frequency(&self) -> u64 {
        self.0.frequency
    }

    pub fn offset(&self) -> (i64, u64) {
        (self.0.offset_seconds, self.0.offset_cycles)
    }

    pub fn precision(&self) -> u64 {
        self.0.precision
    }

    pub fn is_absolute(&self) -> bool {
        self.0.is_absolute
    }

    pub fn uuid(&self) -> Option<&Uuid> {
        self.0.uuid.as_ref()
    }

    /// Whether two handles designate the same clock class object.
    pub fn same_class(&self, other: &ClockClass) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Whether two clock classes describe the same clock: the same
    /// object, or one re-declared with identical parameters.
    pub fn same_shape(&self, other: &ClockClass) -> bool {
        self.same_class(other)
            || (self.0.name == other.0.name
                && self.0.description == other.0.description
                && self.0.frequency == other.0.frequency
                && self.0.offset_seconds == other.0.offset_seconds
                && self.0.offset_cycles == other.0.offset_cycles
                && self.0.precision == other.0.precision
                && self.0.is_absolute == other.0.is_absolute
                && self.0.uuid == other.0.uuid)
    }

    /// Converts a cycle count into nanoseconds from the clock origin:
    /// `offset_s * 1e9 + (cycles + offset_cycles) * 1e9 / frequency`.
    ///
    /// The intermediate products use 128-bit arithmetic; a result that
    /// does not fit a signed 64-bit count is a decoding error.
    pub fn cycles_to_ns_from_origin(&self, cycles: u64) -> Result<i64, Error> {
        let base = (self.0.offset_seconds as i128) * NS_PER_S;
        let ticks = (cycles as i128 + self.0.offset_cycles as i128) * NS_PER_S
            / (self.0.frequency as i128);
        let ns = base + ticks;
        i64::try_from(ns).map_err(|_| {
            Error::Decode(format!(
                "clock value {cycles} overflows the nanosecond range of clock class {:?}",
                self.0.name.as_deref().unwrap_or("(unnamed)")
            ))
        })
    }
}

impl std::fmt::Debug for ClockClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockClass")
            .field("name", &self.0.name)
            .field("frequency", &self.0.frequency)
            .field("is_absolute", &self.0.is_absolute)
            .field("uuid", &self.0.uuid)
            .finish_non_exhaustive()
    }
}

/// Two clock classes are comparable when their snapshots can be ordered
/// against each other: same object, both absolute, or same UUID.
pub fn clocks_comparable(a: &ClockClass, b: &ClockClass) -> bool {
    if a.same_class(b) {
        return true;
    }
    if a.is_absolute() && b.is_absolute() {
        return true;
    }
    matches!((a.uuid(), b.uuid()), (Some(ua), Some(ub)) if ua == ub)
}

pub struct ClockClassBuilder {
    name: Option<String>,
    description: Option<String>,
    frequency: u64,
    offset_seconds: i64,
    offset_cycles: u64,
    precision: u64,
    is_absolute: bool,
    uuid: Option<Uuid>,
}

impl ClockClassBuilder {
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn offset(mut self, seconds: i64, cycles: u64) -> Self {
        self.offset_seconds = seconds;
        self.offset_cycles = cycles;
        self
    }

    pub fn precision(mut self, precision: u64) -> Self {
        self.precision = precision;
        self
    }

    pub fn absolute(mut self, is_absolute: bool) -> Self {
        self.is_absolute = is_absolute;
        self
    }

    pub fn uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn build(self) -> Result<ClockClass, Error> {
        if self.frequency == 0 {
            return Err(Error::InvalidArgument(
                "clock class frequency must be positive".into(),
            ));
        }
        if self.offset_cycles >= self.frequency {
            return Err(Error::InvalidArgument(format!(
                "clock class offset cycles ({}) must be less than the frequency ({})",
                self.offset_cycles, self.frequency
            )));
        }
        Ok(ClockClass(Rc::new(ClockClassInner {
            name: self.name,
            description: self.description,
            frequency: self.frequency,
            offset_seconds: self.offset_seconds,
            offset_cycles: self.offset_cycles,
            precision: self.precision,
            is_absolute: self.is_absolute,
            uuid: self.uuid,
        })))
    }
}
