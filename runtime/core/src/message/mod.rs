//! Messages: the typed stream flowing through the graph.
//!
//! Every message belongs to a stream (except iterator inactivity, which
//! only asserts the absence of messages up to a time). Streams and
//! packets are shared objects: a packet stays alive as long as the
//! longest-lived message referencing it.

use std::rc::Rc;

use crate::error::Error;
use crate::ir::{ClockClass, EventClass, StreamClass};
use crate::values::Value;

// === Streams and packets ===

struct StreamInner {
    class: StreamClass,
    instance_id: Option<u64>,
    name: Option<String>,
}

/// One instance of a data stream.
#[derive(Clone)]
pub struct Stream(Rc<StreamInner>);

impl Stream {
    pub fn new(class: StreamClass, instance_id: Option<u64>, name: Option<String>) -> Self {
        Stream(Rc::new(StreamInner {
            class,
            instance_id,
            name,
        }))
    }

    pub fn class(&self) -> &StreamClass {
        &self.0.class
    }

    pub fn instance_id(&self) -> Option<u64> {
        self.0.instance_id
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn same_stream(&self, other: &Stream) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("class_id", &self.0.class.id())
            .field("instance_id", &self.0.instance_id)
            .field("name", &self.0.name)
            .finish()
    }
}

struct PacketInner {
    stream: Stream,
    context: Option<Value>,
}

/// One packet of a data stream, carrying its decoded packet context.
#[derive(Clone)]
pub struct Packet(Rc<PacketInner>);

impl Packet {
    pub fn new(stream: Stream, context: Option<Value>) -> Self {
        if let Some(context) = &context {
            context.freeze();
        }
        Packet(Rc::new(PacketInner { stream, context }))
    }

    pub fn stream(&self) -> &Stream {
        &self.0.stream
    }

    pub fn context(&self) -> Option<&Value> {
        self.0.context.as_ref()
    }

    pub fn same_packet(&self, other: &Packet) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("stream", &self.0.stream)
            .finish_non_exhaustive()
    }
}

// === Clock snapshots ===

/// An unsigned cycle count against a clock class.
#[derive(Clone)]
pub struct ClockSnapshot {
    class: ClockClass,
    cycles: u64,
}

impl ClockSnapshot {
    pub fn new(class: ClockClass, cycles: u64) -> Self {
        ClockSnapshot { class, cycles }
    }

    pub fn clock_class(&self) -> &ClockClass {
        &self.class
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn ns_from_origin(&self) -> Result<i64, Error> {
        self.class.cycles_to_ns_from_origin(self.cycles)
    }
}

impl std::fmt::Debug for ClockSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClockSnapshot({} cycles)", self.cycles)
    }
}

/// A closed time range expressed as two snapshots of the same clock.
#[derive(Debug, Clone)]
pub struct SnapshotRange {
    pub begin: ClockSnapshot,
    pub end: ClockSnapshot,
}

// === Events ===

/// A decoded event: its class, its packet, and the decoded field trees of
/// each scope that the schema declares.
pub struct EventMessage {
    pub class: EventClass,
    pub packet: Packet,
    pub header: Option<Value>,
    pub common_context: Option<Value>,
    pub specific_context: Option<Value>,
    pub payload: Option<Value>,
    pub snapshot: Option<ClockSnapshot>,
}

// === Messages ===

/// Discriminant-only view of a message, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    StreamBeginning,
    StreamEnd,
    PacketBeginning,
    PacketEnd,
    Event,
    DiscardedEvents,
    DiscardedPackets,
    Inactivity,
}

/// One element of the typed stream flowing through the graph.
#[derive(Clone)]
pub enum Message {
    StreamBeginning {
        stream: Stream,
        snapshot: Option<ClockSnapshot>,
    },
    StreamEnd {
        stream: Stream,
        snapshot: Option<ClockSnapshot>,
    },
    PacketBeginning {
        packet: Packet,
        snapshot: Option<ClockSnapshot>,
    },
    PacketEnd {
        packet: Packet,
        snapshot: Option<ClockSnapshot>,
    },
    Event(Rc<EventMessage>),
    /// `count` events of this stream were lost between `range.begin` and
    /// `range.end`. The range is omitted when either boundary is unknown.
    DiscardedEvents {
        stream: Stream,
        count: u64,
        range: Option<SnapshotRange>,
    },
    DiscardedPackets {
        stream: Stream,
        count: u64,
        range: Option<SnapshotRange>,
    },
    /// No message exists in this iterator at or before the snapshot.
    Inactivity { snapshot: ClockSnapshot },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::StreamBeginning { .. } => MessageKind::StreamBeginning,
            Message::StreamEnd { .. } => MessageKind::StreamEnd,
            Message::PacketBeginning { .. } => MessageKind::PacketBeginning,
            Message::PacketEnd { .. } => MessageKind::PacketEnd,
            Message::Event(_) => MessageKind::Event,
            Message::DiscardedEvents { .. } => MessageKind::DiscardedEvents,
            Message::DiscardedPackets { .. } => MessageKind::DiscardedPackets,
            Message::Inactivity { .. } => MessageKind::Inactivity,
        }
    }

    /// The stream this message belongs to, if any.
    pub fn stream(&self) -> Option<&Stream> {
        match self {
            Message::StreamBeginning { stream, .. }
            | Message::StreamEnd { stream, .. }
            | Message::DiscardedEvents { stream, .. }
            | Message::DiscardedPackets { stream, .. } => Some(stream),
            Message::PacketBeginning { packet, .. } | Message::PacketEnd { packet, .. } => {
                Some(packet.stream())
            }
            Message::Event(event) => Some(event.packet.stream()),
            Message::Inactivity { .. } => None,
        }
    }

    /// The clock snapshot carried by this message, if any. Discarded
    /// messages report their end boundary.
    pub fn snapshot(&self) -> Option<&ClockSnapshot> {
        match self {
            Message::StreamBeginning { snapshot, .. }
            | Message::StreamEnd { snapshot, .. }
            | Message::PacketBeginning { snapshot, .. }
            | Message::PacketEnd { snapshot, .. } => snapshot.as_ref(),
            Message::Event(event) => event.snapshot.as_ref(),
            Message::DiscardedEvents { range, .. } | Message::DiscardedPackets { range, .. } => {
                range.as_ref().map(|r| &r.end)
            }
            Message::Inactivity { snapshot } => Some(snapshot),
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.kind())?;
        if let Some(snapshot) = self.snapshot() {
            write!(f, "@{}", snapshot.cycles())?;
        }
        Ok(())
    }
}
