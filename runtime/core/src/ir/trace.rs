//! Trace, stream and event classes.
//!
//! A trace class is the root of one trace's schema: it owns the field
//! class arena, the environment, and the stream classes. Stream and event
//! classes hold weak links back to their parent, so the class graph never
//! owns itself in a cycle.
//!
//! Classes freeze when first observed by an iterator. A frozen class
//! rejects structural mutation; adding *new* stream or event classes
//! remains allowed, which is how live metadata updates append to a schema
//! mid-run.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use uuid::Uuid;

use crate::error::Error;
use crate::values::Value;

use super::clock::ClockClass;
use super::field::{FieldClass, FieldClassId, IntClass};

/// Producer-bug compensations that apply to this trace. Set by the packet
/// index fixup pass, read by anyone who needs to know the index was
/// adjusted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quirks {
    pub event_after_packet: bool,
    pub event_before_packet: bool,
    pub lttng_crash: bool,
}

/// Event severity, mirroring the packetized format's levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    Info,
    DebugSystem,
    DebugProgram,
    DebugProcess,
    DebugModule,
    DebugUnit,
    DebugFunction,
    DebugLine,
    Debug,
}

// === Trace class ===

#[derive(Debug)]
pub(crate) struct TraceClassInner {
    uuid: RefCell<Option<Uuid>>,
    environment: Value,
    packet_header: Cell<Option<FieldClassId>>,
    arena: RefCell<Vec<Rc<FieldClass>>>,
    stream_classes: RefCell<Vec<StreamClass>>,
    frozen: Cell<bool>,
    quirks: Cell<Quirks>,
}

/// The schema root for one trace.
#[derive(Debug, Clone)]
pub struct TraceClass(Rc<TraceClassInner>);

impl TraceClass {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        TraceClass(Rc::new(TraceClassInner {
            uuid: RefCell::new(None),
            environment: Value::new_map(),
            packet_header: Cell::new(None),
            arena: RefCell::new(Vec::new()),
            stream_classes: RefCell::new(Vec::new()),
            frozen: Cell::new(false),
            quirks: Cell::new(Quirks::default()),
        }))
    }

    fn check_mutable(&self, what: &str) -> Result<(), Error> {
        if self.0.frozen.get() {
            Err(Error::Frozen(format!(
                "cannot {what} of an observed trace class"
            )))
        } else {
            Ok(())
        }
    }

    pub fn uuid(&self) -> Option<Uuid> {
        *self.0.uuid.borrow()
    }

    pub fn set_uuid(&self, uuid: Uuid) -> Result<(), Error> {
        if self.0.frozen.get() {
            if *self.0.uuid.borrow() == Some(uuid) {
                return Ok(());
            }
            return self.check_mutable("set the UUID");
        }
        *self.0.uuid.borrow_mut() = Some(uuid);
        Ok(())
    }

    /// The environment map: string keys to scalar values.
    pub fn environment(&self) -> Value {
        self.0.environment.clone()
    }

    pub fn environment_entry(&self, name: &str) -> Option<Value> {
        self.0.environment.map_get(name)
    }

    pub fn set_environment_entry<K: Into<String>>(
        &self,
        name: K,
        value: Value,
    ) -> Result<(), Error> {
        self.0.environment.map_insert(name, value)
    }

    pub fn packet_header_class(&self) -> Option<FieldClassId> {
        self.0.packet_header.get()
    }

    pub fn set_packet_header_class(&self, class: FieldClassId) -> Result<(), Error> {
        if self.0.frozen.get() {
            let identical = self
                .0
                .packet_header
                .get()
                .is_some_and(|current| self.field_classes_same_shape(current, class));
            if identical {
                return Ok(());
            }
            return self.check_mutable("set the packet header class");
        }
        self.0.packet_header.set(Some(class));
        Ok(())
    }

    pub fn quirks(&self) -> Quirks {
        self.0.quirks.get()
    }

    pub fn set_quirks(&self, quirks: Quirks) {
        self.0.quirks.set(quirks);
    }

    // --- Field class arena ---

    /// Adds a field class to the arena. Additions stay permitted after
    /// freezing: new stream classes appended by a live metadata update
    /// need somewhere to put their fields. Existing entries are never
    /// replaced.
    pub fn add_field_class(&self, class: FieldClass) -> FieldClassId {
        let mut arena = self.0.arena.borrow_mut();
        let id = FieldClassId(arena.len() as u32);
        arena.push(Rc::new(class));
        id
    }

    pub fn field_class(&self, id: FieldClassId) -> Rc<FieldClass> {
        Rc::clone(&self.0.arena.borrow()[id.0 as usize])
    }

    /// Structural equality of two field classes of this arena: a
    /// re-declaration with the same shape decodes the same bytes to the
    /// same values.
    pub fn field_classes_same_shape(&self, a: FieldClassId, b: FieldClassId) -> bool {
        if a == b {
            return true;
        }
        let (fa, fb) = (self.field_class(a), self.field_class(b));
        match (&*fa, &*fb) {
            (FieldClass::FixedInt(x), FieldClass::FixedInt(y)) => int_classes_same_shape(x, y),
            (FieldClass::Enum(x), FieldClass::Enum(y)) => {
                int_classes_same_shape(&x.container, &y.container) && x.mappings == y.mappings
            }
            (FieldClass::Real(x), FieldClass::Real(y)) => {
                x.exp_digits == y.exp_digits
                    && x.mant_digits == y.mant_digits
                    && x.alignment == y.alignment
                    && x.byte_order == y.byte_order
            }
            (FieldClass::CtfString, FieldClass::CtfString) => true,
            (
                FieldClass::Struct {
                    members: ma,
                    min_alignment: xa,
                },
                FieldClass::Struct {
                    members: mb,
                    min_alignment: xb,
                },
            ) => {
                xa == xb
                    && ma.len() == mb.len()
                    && ma.iter().zip(mb).all(|(m, n)| {
                        m.name == n.name
                            && m.min_alignment == n.min_alignment
                            && self.field_classes_same_shape(m.class, n.class)
                    })
            }
            (
                FieldClass::StaticArray {
                    element: ea,
                    length: la,
                },
                FieldClass::StaticArray {
                    element: eb,
                    length: lb,
                },
            ) => la == lb && self.field_classes_same_shape(*ea, *eb),
            (
                FieldClass::DynArray {
                    element: ea,
                    length_path: pa,
                },
                FieldClass::DynArray {
                    element: eb,
                    length_path: pb,
                },
            ) => pa == pb && self.field_classes_same_shape(*ea, *eb),
            (
                FieldClass::Variant {
                    tag_path: ta,
                    options: oa,
                },
                FieldClass::Variant {
                    tag_path: tb,
                    options: ob,
                },
            ) => {
                ta == tb
                    && oa.len() == ob.len()
                    && oa.iter().zip(ob).all(|(x, y)| {
                        x.name == y.name
                            && x.selector == y.selector
                            && self.field_classes_same_shape(x.class, y.class)
                    })
            }
            _ => false,
        }
    }

    /// Effective alignment of a field class, in bits.
    pub fn field_alignment(&self, id: FieldClassId) -> u32 {
        match &*self.field_class(id) {
            FieldClass::FixedInt(int) => int.alignment.max(1),
            FieldClass::Enum(e) => e.container.alignment.max(1),
            FieldClass::Real(r) => r.alignment.max(1),
            FieldClass::CtfString => 8,
            FieldClass::Struct { min_alignment, .. } => (*min_alignment).max(1),
            FieldClass::StaticArray { element, .. } | FieldClass::DynArray { element, .. } => {
                self.field_alignment(*element)
            }
            FieldClass::Variant { .. } => 1,
        }
    }

    // --- Stream classes ---

    /// Creates a stream class with a stable id, unique in this trace
    /// class. Permitted on a frozen trace class (additive update).
    ///
    /// A colliding id names an already observed class only when a live
    /// metadata update re-declares it: the observed class is handed
    /// back, and its setters reject any re-declaration that is not
    /// structurally identical. The same id twice during construction is
    /// a metadata bug.
    pub fn add_stream_class(&self, id: u64) -> Result<StreamClass, Error> {
        let mut streams = self.0.stream_classes.borrow_mut();
        if let Some(existing) = streams.iter().find(|sc| sc.id() == id) {
            if existing.is_frozen() {
                return Ok(existing.clone());
            }
            return Err(Error::Schema(format!(
                "duplicate stream class id {id} in trace class"
            )));
        }
        let stream = StreamClass(Rc::new(StreamClassInner {
            id,
            trace: Rc::downgrade(&self.0),
            packet_context: Cell::new(None),
            event_header: Cell::new(None),
            event_common_context: Cell::new(None),
            default_clock: RefCell::new(None),
            event_classes: RefCell::new(Vec::new()),
            frozen: Cell::new(false),
        }));
        streams.push(stream.clone());
        Ok(stream)
    }

    pub fn stream_class_count(&self) -> usize {
        self.0.stream_classes.borrow().len()
    }

    pub fn stream_class_by_index(&self, index: usize) -> Option<StreamClass> {
        self.0.stream_classes.borrow().get(index).cloned()
    }

    pub fn stream_class_by_id(&self, id: u64) -> Option<StreamClass> {
        self.0
            .stream_classes
            .borrow()
            .iter()
            .find(|sc| sc.id() == id)
            .cloned()
    }

    pub fn is_frozen(&self) -> bool {
        self.0.frozen.get()
    }

    /// Freezes this trace class and every stream class it currently has.
    /// Stream classes added later freeze when they are first observed.
    pub fn freeze(&self) {
        if self.0.frozen.get() {
            return;
        }
        self.0.frozen.set(true);
        self.0.environment.freeze();
        for stream in self.0.stream_classes.borrow().iter() {
            stream.freeze();
        }
    }

    pub fn same_class(&self, other: &TraceClass) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

// === Stream class ===

#[derive(Debug)]
pub(crate) struct StreamClassInner {
    id: u64,
    trace: Weak<TraceClassInner>,
    packet_context: Cell<Option<FieldClassId>>,
    event_header: Cell<Option<FieldClassId>>,
    event_common_context: Cell<Option<FieldClassId>>,
    default_clock: RefCell<Option<ClockClass>>,
    event_classes: RefCell<Vec<EventClass>>,
    frozen: Cell<bool>,
}

/// The schema of one kind of data stream.
#[derive(Debug, Clone)]
pub struct StreamClass(Rc<StreamClassInner>);

impl StreamClass {
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// The owning trace class. `None` only if the trace class was
    /// dropped, which cannot happen while decoding is in progress.
    pub fn trace_class(&self) -> Option<TraceClass> {
        self.0.trace.upgrade().map(TraceClass)
    }

    fn check_mutable(&self, what: &str) -> Result<(), Error> {
        if self.0.frozen.get() {
            Err(Error::Frozen(format!(
                "cannot {what} of an observed stream class (id {})",
                self.0.id
            )))
        } else {
            Ok(())
        }
    }

    /// Whether setting `incoming` on an observed class merely
    /// re-declares the current field class with the same shape.
    fn redeclares_identically(&self, current: Option<FieldClassId>, incoming: FieldClassId) -> bool {
        match (current, self.trace_class()) {
            (Some(current), Some(trace)) => trace.field_classes_same_shape(current, incoming),
            _ => false,
        }
    }

    pub fn packet_context_class(&self) -> Option<FieldClassId> {
        self.0.packet_context.get()
    }

    pub fn set_packet_context_class(&self, class: FieldClassId) -> Result<(), Error> {
        if self.0.frozen.get() {
            if self.redeclares_identically(self.0.packet_context.get(), class) {
                return Ok(());
            }
            return self.check_mutable("set the packet context class");
        }
        self.0.packet_context.set(Some(class));
        Ok(())
    }

    pub fn event_header_class(&self) -> Option<FieldClassId> {
        self.0.event_header.get()
    }

    pub fn set_event_header_class(&self, class: FieldClassId) -> Result<(), Error> {
        if self.0.frozen.get() {
            if self.redeclares_identically(self.0.event_header.get(), class) {
                return Ok(());
            }
            return self.check_mutable("set the event header class");
        }
        self.0.event_header.set(Some(class));
        Ok(())
    }

    pub fn event_common_context_class(&self) -> Option<FieldClassId> {
        self.0.event_common_context.get()
    }

    pub fn set_event_common_context_class(&self, class: FieldClassId) -> Result<(), Error> {
        if self.0.frozen.get() {
            if self.redeclares_identically(self.0.event_common_context.get(), class) {
                return Ok(());
            }
            return self.check_mutable("set the event common context class");
        }
        self.0.event_common_context.set(Some(class));
        Ok(())
    }

    pub fn default_clock_class(&self) -> Option<ClockClass> {
        self.0.default_clock.borrow().clone()
    }

    pub fn set_default_clock_class(&self, clock: ClockClass) -> Result<(), Error> {
        if self.0.frozen.get() {
            let identical = self
                .0
                .default_clock
                .borrow()
                .as_ref()
                .is_some_and(|current| current.same_shape(&clock));
            if identical {
                return Ok(());
            }
            return self.check_mutable("set the default clock class");
        }
        *self.0.default_clock.borrow_mut() = Some(clock);
        Ok(())
    }

    /// Creates an event class with an id unique in this stream class.
    /// Permitted on a frozen stream class (additive update).
    ///
    /// As with [`TraceClass::add_stream_class`], re-declaring an
    /// observed event class hands the observed class back; its setters
    /// reject any drift from the observed shape.
    pub fn add_event_class(&self, id: u64) -> Result<EventClass, Error> {
        let mut events = self.0.event_classes.borrow_mut();
        if let Some(existing) = events.iter().find(|ec| ec.id() == id) {
            if existing.is_frozen() {
                return Ok(existing.clone());
            }
            return Err(Error::Schema(format!(
                "duplicate event class id {id} in stream class {}",
                self.0.id
            )));
        }
        let event = EventClass(Rc::new(EventClassInner {
            id,
            stream: Rc::downgrade(&self.0),
            name: RefCell::new(None),
            log_level: Cell::new(None),
            emf_uri: RefCell::new(None),
            specific_context: Cell::new(None),
            payload: Cell::new(None),
            frozen: Cell::new(false),
        }));
        events.push(event.clone());
        Ok(event)
    }

    pub fn event_class_count(&self) -> usize {
        self.0.event_classes.borrow().len()
    }

    pub fn event_class_by_index(&self, index: usize) -> Option<EventClass> {
        self.0.event_classes.borrow().get(index).cloned()
    }

    pub fn event_class_by_id(&self, id: u64) -> Option<EventClass> {
        self.0
            .event_classes
            .borrow()
            .iter()
            .find(|ec| ec.id() == id)
            .cloned()
    }

    pub fn is_frozen(&self) -> bool {
        self.0.frozen.get()
    }

    pub fn freeze(&self) {
        if self.0.frozen.get() {
            return;
        }
        self.0.frozen.set(true);
        for event in self.0.event_classes.borrow().iter() {
            event.freeze();
        }
    }

    pub fn same_class(&self, other: &StreamClass) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

// === Event class ===

#[derive(Debug)]
pub(crate) struct EventClassInner {
    id: u64,
    stream: Weak<StreamClassInner>,
    name: RefCell<Option<String>>,
    log_level: Cell<Option<LogLevel>>,
    emf_uri: RefCell<Option<String>>,
    specific_context: Cell<Option<FieldClassId>>,
    payload: Cell<Option<FieldClassId>>,
    frozen: Cell<bool>,
}

/// The schema of one kind of event.
#[derive(Debug, Clone)]
pub struct EventClass(Rc<EventClassInner>);

impl EventClass {
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn stream_class(&self) -> Option<StreamClass> {
        self.0.stream.upgrade().map(StreamClass)
    }

    fn check_mutable(&self, what: &str) -> Result<(), Error> {
        if self.0.frozen.get() {
            Err(Error::Frozen(format!(
                "cannot {what} of an observed event class (id {})",
                self.0.id
            )))
        } else {
            Ok(())
        }
    }

    fn redeclares_identically(&self, current: Option<FieldClassId>, incoming: FieldClassId) -> bool {
        let trace = self.stream_class().and_then(|sc| sc.trace_class());
        match (current, trace) {
            (Some(current), Some(trace)) => trace.field_classes_same_shape(current, incoming),
            _ => false,
        }
    }

    pub fn name(&self) -> Option<String> {
        self.0.name.borrow().clone()
    }

    pub fn set_name<S: Into<String>>(&self, name: S) -> Result<(), Error> {
        let name = name.into();
        if self.0.frozen.get() {
            if self.0.name.borrow().as_deref() == Some(name.as_str()) {
                return Ok(());
            }
            return self.check_mutable("set the name");
        }
        *self.0.name.borrow_mut() = Some(name);
        Ok(())
    }

    pub fn log_level(&self) -> Option<LogLevel> {
        self.0.log_level.get()
    }

    pub fn set_log_level(&self, level: LogLevel) -> Result<(), Error> {
        if self.0.frozen.get() {
            if self.0.log_level.get() == Some(level) {
                return Ok(());
            }
            return self.check_mutable("set the log level");
        }
        self.0.log_level.set(Some(level));
        Ok(())
    }

    pub fn emf_uri(&self) -> Option<String> {
        self.0.emf_uri.borrow().clone()
    }

    pub fn set_emf_uri<S: Into<String>>(&self, uri: S) -> Result<(), Error> {
        let uri = uri.into();
        if self.0.frozen.get() {
            if self.0.emf_uri.borrow().as_deref() == Some(uri.as_str()) {
                return Ok(());
            }
            return self.check_mutable("set the EMF URI");
        }
        *self.0.emf_uri.borrow_mut() = Some(uri);
        Ok(())
    }

    pub fn specific_context_class(&self) -> Option<FieldClassId> {
        self.0.specific_context.get()
    }

    pub fn set_specific_context_class(&self, class: FieldClassId) -> Result<(), Error> {
        if self.0.frozen.get() {
            if self.redeclares_identically(self.0.specific_context.get(), class) {
                return Ok(());
            }
            return self.check_mutable("set the specific context class");
        }
        self.0.specific_context.set(Some(class));
        Ok(())
    }

    pub fn payload_class(&self) -> Option<FieldClassId> {
        self.0.payload.get()
    }

    pub fn set_payload_class(&self, class: FieldClassId) -> Result<(), Error> {
        if self.0.frozen.get() {
            if self.redeclares_identically(self.0.payload.get(), class) {
                return Ok(());
            }
            return self.check_mutable("set the payload class");
        }
        self.0.payload.set(Some(class));
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.0.frozen.get()
    }

    pub fn freeze(&self) {
        self.0.frozen.set(true);
    }

    pub fn same_class(&self, other: &EventClass) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

fn int_classes_same_shape(a: &IntClass, b: &IntClass) -> bool {
    a.signed == b.signed
        && a.bits == b.bits
        && a.alignment == b.alignment
        && a.byte_order == b.byte_order
        && a.base == b.base
        && match (&a.mapped_clock, &b.mapped_clock) {
            (None, None) => true,
            (Some(x), Some(y)) => x.same_shape(y),
            _ => false,
        }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::field::{ByteOrder, IntClass, StructMember};
    use assert_matches::assert_matches;

    #[test]
    fn ids_are_unique_within_parent() {
        let tc = TraceClass::new();
        let sc = tc.add_stream_class(0).unwrap();
        assert_matches!(tc.add_stream_class(0), Err(Error::Schema(_)));
        tc.add_stream_class(1).unwrap();

        sc.add_event_class(5).unwrap();
        assert_matches!(sc.add_event_class(5), Err(Error::Schema(_)));
        sc.add_event_class(6).unwrap();
    }

    #[test]
    fn freeze_rejects_structural_mutation_but_not_additions() {
        let tc = TraceClass::new();
        let sc = tc.add_stream_class(0).unwrap();
        let ec = sc.add_event_class(0).unwrap();
        tc.freeze();

        assert_matches!(tc.set_uuid(Uuid::from_bytes([1; 16])), Err(Error::Frozen(_)));
        assert_matches!(
            sc.set_packet_context_class(FieldClassId(0)),
            Err(Error::Frozen(_))
        );
        assert_matches!(ec.set_name("x"), Err(Error::Frozen(_)));
        assert_matches!(
            tc.set_environment_entry("k", Value::int(1)),
            Err(Error::Frozen(_))
        );

        // Additive updates stay permitted.
        let late_sc = tc.add_stream_class(7).unwrap();
        assert!(!late_sc.is_frozen());
        late_sc
            .set_event_header_class(tc.add_field_class(FieldClass::FixedInt(IntClass::new(
                false,
                8,
                ByteOrder::LittleEndian,
            ))))
            .unwrap();
        sc.add_event_class(99).unwrap();
    }

    #[test]
    fn observed_classes_accept_identical_redeclarations() {
        let len_member = |tc: &TraceClass| {
            let u8c = tc.add_field_class(FieldClass::FixedInt(IntClass::new(
                false,
                8,
                ByteOrder::LittleEndian,
            )));
            tc.add_field_class(FieldClass::Struct {
                members: vec![StructMember {
                    name: "len".into(),
                    class: u8c,
                    min_alignment: 8,
                }],
                min_alignment: 8,
            })
        };

        let tc = TraceClass::new();
        let ctx = len_member(&tc);
        let sc = tc.add_stream_class(0).unwrap();
        sc.set_packet_context_class(ctx).unwrap();
        let ec = sc.add_event_class(4).unwrap();
        ec.set_name("alpha").unwrap();
        tc.freeze();

        // A live metadata update re-parses everything and re-declares
        // the observed classes, with freshly allocated (but identical)
        // field classes: every call is a no-op.
        let sc2 = tc.add_stream_class(0).unwrap();
        assert!(sc2.same_class(&sc));
        let ctx2 = len_member(&tc);
        sc2.set_packet_context_class(ctx2).unwrap();
        let ec2 = sc2.add_event_class(4).unwrap();
        assert!(ec2.same_class(&ec));
        ec2.set_name("alpha").unwrap();

        // Any drift from the observed shape is still rejected.
        let wider = tc.add_field_class(FieldClass::FixedInt(IntClass::new(
            false,
            16,
            ByteOrder::LittleEndian,
        )));
        let drifted = tc.add_field_class(FieldClass::Struct {
            members: vec![StructMember {
                name: "len".into(),
                class: wider,
                min_alignment: 8,
            }],
            min_alignment: 8,
        });
        assert_matches!(sc2.set_packet_context_class(drifted), Err(Error::Frozen(_)));
        assert_matches!(ec2.set_name("beta"), Err(Error::Frozen(_)));
    }

    #[test]
    fn back_references_do_not_own() {
        let tc = TraceClass::new();
        let sc = tc.add_stream_class(0).unwrap();
        assert!(sc.trace_class().is_some());
        drop(tc);
        // The stream class handle is still alive but its parent is gone;
        // the weak link reports that rather than leaking a cycle.
        assert!(sc.trace_class().is_none());
    }

    #[test]
    fn environment_entries() {
        let tc = TraceClass::new();
        tc.set_environment_entry("tracer_name", Value::string("lttng-ust"))
            .unwrap();
        tc.set_environment_entry("tracer_major", Value::int(2))
            .unwrap();
        assert_eq!(
            tc.environment_entry("tracer_name").unwrap().as_string(),
            Some("lttng-ust".to_string())
        );
        assert!(tc.environment_entry("nope").is_none());
    }
}
