//! Field decoding: turning bits into value trees, driven by the schema.
//!
//! [`FieldDecoder`] is an explicit stack machine rather than a recursive
//! descent, because a decode must be able to return `Again` from any
//! depth (the medium ran dry) and resume later without replaying bytes.
//! Each in-progress container is a frame; leaf reads are transactional
//! (the bit cursor does not move unless the whole leaf was read), so an
//! interrupted decode simply re-enters the same frame.

use std::rc::Rc;

use tracemux_runtime_core::ir::{FieldClass, FieldClassId, FieldPath, IntClass, Scope, TraceClass};
use tracemux_runtime_core::{Error, Value};

use crate::bitio::{sign_extend, MediumReader};

/// The decoded value trees of the six scopes, filled in hierarchy order
/// as a packet and its events decode.
#[derive(Default)]
pub struct ScopeValues {
    slots: [Option<Value>; 6],
}

fn scope_index(scope: Scope) -> usize {
    match scope {
        Scope::PacketHeader => 0,
        Scope::PacketContext => 1,
        Scope::EventHeader => 2,
        Scope::EventCommonContext => 3,
        Scope::EventSpecificContext => 4,
        Scope::EventPayload => 5,
    }
}

impl ScopeValues {
    pub fn get(&self, scope: Scope) -> Option<&Value> {
        self.slots[scope_index(scope)].as_ref()
    }

    pub fn set(&mut self, scope: Scope, value: Value) {
        self.slots[scope_index(scope)] = Some(value);
    }

    pub fn take(&mut self, scope: Scope) -> Option<Value> {
        self.slots[scope_index(scope)].take()
    }

    /// Drops the per-event scopes, keeping the packet ones.
    pub fn clear_event_scopes(&mut self) {
        for scope in [
            Scope::EventHeader,
            Scope::EventCommonContext,
            Scope::EventSpecificContext,
            Scope::EventPayload,
        ] {
            self.slots[scope_index(scope)] = None;
        }
    }

    pub fn clear(&mut self) {
        self.slots = Default::default();
    }
}

/// The field classes declared for each scope, used to resolve variant
/// tag classes structurally.
#[derive(Default, Clone)]
pub struct ScopeClasses {
    slots: [Option<FieldClassId>; 6],
}

impl ScopeClasses {
    pub fn get(&self, scope: Scope) -> Option<FieldClassId> {
        self.slots[scope_index(scope)]
    }

    pub fn set(&mut self, scope: Scope, class: Option<FieldClassId>) {
        self.slots[scope_index(scope)] = class;
    }
}

/// The stream's current clock value, updated by every mapped-clock
/// integer as it decodes.
///
/// A timestamp field narrower than 64 bits replaces the low bits of the
/// current value and bumps the high bits when the low part wrapped.
#[derive(Default)]
pub struct ClockTracker {
    pub cycles: u64,
}

impl ClockTracker {
    pub fn update(&mut self, raw: u64, bits: u32) {
        if bits >= 64 {
            self.cycles = raw;
            return;
        }
        let mask = (1u64 << bits) - 1;
        let low = self.cycles & mask;
        let mut updated = (self.cycles & !mask) | raw;
        if raw < low {
            // The narrow counter wrapped since the last observation.
            updated = updated.wrapping_add(mask + 1);
        }
        self.cycles = updated;
    }
}

/// Everything a decode needs besides the reader.
pub struct DecodeEnv<'a> {
    pub trace: &'a TraceClass,
    pub scopes: &'a ScopeValues,
    pub scope_classes: &'a ScopeClasses,
    pub current_scope: Scope,
    pub clock: &'a mut ClockTracker,
}

enum Frame {
    Struct {
        class: Rc<FieldClass>,
        value: Value,
        /// Index of the member being decoded (or to decode next); it
        /// advances only once the member's value is attached.
        next: usize,
    },
    Array {
        element: FieldClassId,
        remaining: u64,
        value: Value,
    },
    Variant {
        option_name: String,
        child: FieldClassId,
    },
    Str {
        acc: Vec<u8>,
    },
}

/// What one [`FieldDecoder::step`] decided to do, computed before any
/// reading so the frame stack is not borrowed across reads.
enum Action {
    ReadStringBytes,
    Complete(Value),
    StartChild { class: FieldClassId, align: u32 },
}

/// A resumable decode of one field-class tree.
#[derive(Default)]
pub struct FieldDecoder {
    stack: Vec<Frame>,
}

impl FieldDecoder {
    pub fn new() -> Self {
        FieldDecoder::default()
    }

    pub fn is_idle(&self) -> bool {
        self.stack.is_empty()
    }

    /// Runs the decode to completion, returning the root value.
    /// On `Err(Again)` (or `Err(End)`) the decoder keeps its state; call
    /// again with the same arguments to resume.
    pub fn decode(
        &mut self,
        io: &mut MediumReader,
        env: &mut DecodeEnv<'_>,
        root: FieldClassId,
    ) -> Result<Value, Error> {
        if self.stack.is_empty() {
            io.align_to(env.trace.field_alignment(root) as u64)?;
            if let Some(value) = self.start_field(io, env, root)? {
                return Ok(value);
            }
        }
        loop {
            if let Some(value) = self.step(io, env)? {
                return Ok(value);
            }
        }
    }

    /// Abandons any in-progress decode.
    pub fn reset(&mut self) {
        self.stack.clear();
    }

    /// Advances the deepest frame once. `Ok(Some(_))` is the completed
    /// root value.
    fn step(
        &mut self,
        io: &mut MediumReader,
        env: &mut DecodeEnv<'_>,
    ) -> Result<Option<Value>, Error> {
        let top = self.stack.len() - 1;
        let action = match &self.stack[top] {
            Frame::Str { .. } => Action::ReadStringBytes,
            Frame::Struct { class, value, next } => {
                let FieldClass::Struct { members, .. } = &**class else {
                    unreachable!("struct frame holds a struct class");
                };
                if *next >= members.len() {
                    Action::Complete(value.clone())
                } else {
                    let member = &members[*next];
                    Action::StartChild {
                        class: member.class,
                        align: member
                            .min_alignment
                            .max(env.trace.field_alignment(member.class)),
                    }
                }
            }
            Frame::Array {
                element,
                remaining,
                value,
            } => {
                if *remaining == 0 {
                    Action::Complete(value.clone())
                } else {
                    Action::StartChild {
                        class: *element,
                        align: env.trace.field_alignment(*element),
                    }
                }
            }
            Frame::Variant { child, .. } => Action::StartChild {
                class: *child,
                align: env.trace.field_alignment(*child),
            },
        };

        match action {
            Action::ReadStringBytes => {
                loop {
                    let byte = io.read_byte()?;
                    if byte == 0 {
                        break;
                    }
                    let Frame::Str { acc } = &mut self.stack[top] else {
                        unreachable!("string frame stays until terminated");
                    };
                    acc.push(byte);
                }
                let Some(Frame::Str { acc }) = self.stack.pop() else {
                    unreachable!("string frame stays until terminated");
                };
                let text = String::from_utf8_lossy(&acc).into_owned();
                self.attach(Value::string(text))
            }
            Action::Complete(value) => {
                self.stack.pop();
                self.attach(value)
            }
            Action::StartChild { class, align } => {
                io.align_to(align as u64)?;
                match self.start_field(io, env, class)? {
                    Some(leaf) => self.attach(leaf),
                    None => Ok(None),
                }
            }
        }
    }

    /// Starts decoding a field: leaves return their value immediately,
    /// containers push a frame and return `None`. The caller aligned the
    /// cursor already.
    fn start_field(
        &mut self,
        io: &mut MediumReader,
        env: &mut DecodeEnv<'_>,
        class_id: FieldClassId,
    ) -> Result<Option<Value>, Error> {
        let class = env.trace.field_class(class_id);
        match &*class {
            FieldClass::FixedInt(int) => Ok(Some(self.read_int(io, env, int)?)),
            FieldClass::Enum(en) => Ok(Some(self.read_int(io, env, &en.container)?)),
            FieldClass::Real(real) => {
                let bits = real.total_bits();
                let raw = io.read_bits(bits, real.byte_order)?;
                let value = match bits {
                    32 => f32::from_bits(raw as u32) as f64,
                    64 => f64::from_bits(raw),
                    other => {
                        return Err(Error::Decode(format!(
                            "unsupported real field width: {other} bits"
                        )))
                    }
                };
                Ok(Some(Value::real(value)))
            }
            FieldClass::CtfString => {
                self.stack.push(Frame::Str { acc: Vec::new() });
                Ok(None)
            }
            FieldClass::Struct { .. } => {
                self.stack.push(Frame::Struct {
                    class,
                    value: Value::new_map(),
                    next: 0,
                });
                Ok(None)
            }
            FieldClass::StaticArray { element, length } => {
                self.stack.push(Frame::Array {
                    element: *element,
                    remaining: *length,
                    value: Value::new_array(),
                });
                Ok(None)
            }
            FieldClass::DynArray {
                element,
                length_path,
            } => {
                let length = self
                    .resolve_path_value(env, length_path)
                    .and_then(|v| v.as_u64_lossy())
                    .ok_or_else(|| {
                        Error::Decode(format!(
                            "cannot resolve the length of a sequence ({:?} {:?})",
                            length_path.root, length_path.items
                        ))
                    })?;
                self.stack.push(Frame::Array {
                    element: *element,
                    remaining: length,
                    value: Value::new_array(),
                });
                Ok(None)
            }
            FieldClass::Variant { tag_path, options } => {
                let tag_value = self.resolve_path_value(env, tag_path).ok_or_else(|| {
                    Error::Decode(format!(
                        "cannot resolve the tag of a variant ({:?} {:?})",
                        tag_path.root, tag_path.items
                    ))
                })?;
                let tag = match (tag_value.as_int(), tag_value.as_uint()) {
                    (Some(i), _) => i as i128,
                    (_, Some(u)) => u as i128,
                    _ => {
                        return Err(Error::Decode(
                            "variant tag field is not an integer".into(),
                        ))
                    }
                };
                let tag_class = resolve_path_class(env.trace, env.scope_classes, tag_path);
                let option = options
                    .iter()
                    .find(|opt| {
                        use tracemux_runtime_core::ir::VariantSelector;
                        match &opt.selector {
                            VariantSelector::Ranges(ranges) => {
                                ranges.iter().any(|&(lo, hi)| lo <= tag && tag <= hi)
                            }
                            VariantSelector::Label(label) => tag_class
                                .as_ref()
                                .map(|tc| match &**tc {
                                    FieldClass::Enum(en) => {
                                        en.labels_for(tag).contains(&label.as_str())
                                    }
                                    _ => false,
                                })
                                .unwrap_or(false),
                        }
                    })
                    .ok_or_else(|| {
                        Error::Decode(format!("no variant option selected by tag value {tag}"))
                    })?;
                self.stack.push(Frame::Variant {
                    option_name: option.name.clone(),
                    child: option.class,
                });
                Ok(None)
            }
        }
    }

    fn read_int(
        &mut self,
        io: &mut MediumReader,
        env: &mut DecodeEnv<'_>,
        int: &IntClass,
    ) -> Result<Value, Error> {
        let raw = io.read_bits(int.bits as u32, int.byte_order)?;
        if int.mapped_clock.is_some() {
            env.clock.update(raw, int.bits as u32);
        }
        Ok(if int.signed {
            Value::int(sign_extend(raw, int.bits as u32))
        } else {
            Value::uint(raw)
        })
    }

    /// Attaches a completed value to the parent frame, propagating
    /// container completions upward. `Ok(Some(_))` is the root value.
    fn attach(&mut self, value: Value) -> Result<Option<Value>, Error> {
        let mut value = value;
        loop {
            let Some(top) = self.stack.last_mut() else {
                return Ok(Some(value));
            };
            match top {
                Frame::Struct { class, value: map, next } => {
                    let FieldClass::Struct { members, .. } = &**class else {
                        unreachable!("struct frame holds a struct class");
                    };
                    map.map_insert(members[*next].name.clone(), value)
                        .expect("struct under construction is not frozen");
                    *next += 1;
                    return Ok(None);
                }
                Frame::Array {
                    remaining,
                    value: array,
                    ..
                } => {
                    array
                        .array_push(value)
                        .expect("array under construction is not frozen");
                    *remaining -= 1;
                    return Ok(None);
                }
                Frame::Variant { option_name, .. } => {
                    let wrapped = Value::new_map();
                    wrapped
                        .map_insert(option_name.clone(), value)
                        .expect("fresh map is not frozen");
                    self.stack.pop();
                    value = wrapped;
                }
                Frame::Str { .. } => unreachable!("strings have no children"),
            }
        }
    }

    /// Resolves a field path against the completed scopes and, for the
    /// scope currently decoding, the partial value tree.
    fn resolve_path_value(&self, env: &DecodeEnv<'_>, path: &FieldPath) -> Option<Value> {
        let root = if path.root == env.current_scope {
            match self.stack.first() {
                Some(Frame::Struct { value, .. }) | Some(Frame::Array { value, .. }) => {
                    Some(value.clone())
                }
                _ => None,
            }
        } else {
            env.scopes.get(path.root).cloned()
        }?;
        let mut value = root;
        for name in &path.items {
            value = value.map_get(name)?;
        }
        Some(value)
    }
}

/// Structurally resolves the field class a path points at, walking
/// struct members by name from the scope's root class.
pub fn resolve_path_class(
    trace: &TraceClass,
    scope_classes: &ScopeClasses,
    path: &FieldPath,
) -> Option<Rc<FieldClass>> {
    let mut class = trace.field_class(scope_classes.get(path.root)?);
    for name in &path.items {
        let next = match &*class {
            FieldClass::Struct { members, .. } => {
                members.iter().find(|m| &m.name == name)?.class
            }
            _ => return None,
        };
        class = trace.field_class(next);
    }
    Some(class)
}
