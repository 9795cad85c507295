//! The message iterator: a pull-driven state machine turning the bytes
//! of one data stream into messages.
//!
//! Each packet walks header -> context -> events -> padding; between
//! packets the iterator synthesizes discarded-events and
//! discarded-packets messages from the counters it tracks. Any step may
//! suspend with `Again` when the medium has no bytes: the exact bit
//! cursor, decoder stack and queued messages survive, and the next call
//! resumes without replaying anything.

use std::collections::VecDeque;
use std::rc::Rc;

use tracemux_runtime_core::graph::MessageIterator;
use tracemux_runtime_core::ir::{
    ClockClass, EventClass, FieldClassId, Scope, StreamClass, TraceClass,
};
use tracemux_runtime_core::message::{
    ClockSnapshot, EventMessage, Message, Packet, SnapshotRange, Stream,
};
use tracemux_runtime_core::{Error, Value};

use crate::bitio::MediumReader;
use crate::decode::{ClockTracker, DecodeEnv, FieldDecoder, ScopeClasses, ScopeValues};
use crate::index::PacketIndex;
use crate::medium::Medium;

/// The packetized format's magic number, first in every packet header
/// that declares it.
pub const PACKET_MAGIC: u32 = 0xC1FC_1FC1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// At a packet boundary: detect end-of-medium, or start a packet.
    PacketBoundary,
    PacketHeaderDecode,
    PacketHeaderCheck,
    PacketContextDecode,
    PacketContextCheck,
    /// At an event boundary inside a packet: detect the content end, or
    /// start an event.
    EventBoundary,
    EventHeaderDecode,
    EventHeaderCheck,
    EventCommonContextDecode,
    EventSpecificContextDecode,
    EventPayloadDecode,
    EventEmit,
    PacketEndEmit,
    PaddingSkip,
    StreamEndEmit,
    Done,
}

/// A message iterator over one packetized data stream.
pub struct MsgIter {
    reader: MediumReader,
    trace: TraceClass,
    state: State,
    decoder: FieldDecoder,
    scopes: ScopeValues,
    scope_classes: ScopeClasses,
    clock: ClockTracker,
    pending: VecDeque<Message>,
    saved_error: Option<Error>,

    stream: Option<Stream>,
    stream_class: Option<StreamClass>,
    stream_begin_emitted: bool,

    packet_start_bits: u64,
    packet_size_bits: Option<u64>,
    content_size_bits: Option<u64>,
    cur_packet: Option<Packet>,
    cur_event_class: Option<EventClass>,
    /// The packet's declared end timestamp, in cycles.
    ts_end: Option<u64>,

    prev_events_discarded: Option<u64>,
    prev_seq_num: Option<u64>,
    prev_end_cycles: Option<u64>,

    index: Option<PacketIndex>,
    /// Drop events older than this after a time seek.
    skip_until_ns: Option<i64>,
}

impl MsgIter {
    /// Creates an iterator over `medium`, decoding against `trace`.
    /// The trace class is frozen here: this is its first observation.
    pub fn new(medium: Box<dyn Medium>, trace: TraceClass) -> Self {
        trace.freeze();
        let mut scope_classes = ScopeClasses::default();
        scope_classes.set(Scope::PacketHeader, trace.packet_header_class());
        MsgIter {
            reader: MediumReader::new(medium),
            trace,
            state: State::PacketBoundary,
            decoder: FieldDecoder::new(),
            scopes: ScopeValues::default(),
            scope_classes,
            clock: ClockTracker::default(),
            pending: VecDeque::new(),
            saved_error: None,
            stream: None,
            stream_class: None,
            stream_begin_emitted: false,
            packet_start_bits: 0,
            packet_size_bits: None,
            content_size_bits: None,
            cur_packet: None,
            cur_event_class: None,
            ts_end: None,
            prev_events_discarded: None,
            prev_seq_num: None,
            prev_end_cycles: None,
            index: None,
            skip_until_ns: None,
        }
    }

    /// Attaches a pre-built packet index, enabling time seeks.
    pub fn with_index(mut self, index: PacketIndex) -> Self {
        self.index = Some(index);
        self
    }

    fn stream_class(&self) -> &StreamClass {
        self.stream_class.as_ref().expect("stream class resolved")
    }

    fn default_clock(&self) -> Option<ClockClass> {
        self.stream_class
            .as_ref()
            .and_then(|sc| sc.default_clock_class())
    }

    fn snapshot(&self, cycles: u64) -> Option<ClockSnapshot> {
        self.default_clock()
            .map(|clock| ClockSnapshot::new(clock, cycles))
    }

    fn packet_rel_bits(&self) -> u64 {
        self.reader.cursor_bits() - self.packet_start_bits
    }

    /// Runs the field decoder on one scope; end-of-medium inside a field
    /// is a truncation, not a clean end.
    fn run_decoder(&mut self, root: FieldClassId, scope: Scope) -> Result<Value, Error> {
        let mut env = DecodeEnv {
            trace: &self.trace,
            scopes: &self.scopes,
            scope_classes: &self.scope_classes,
            current_scope: scope,
            clock: &mut self.clock,
        };
        match self.decoder.decode(&mut self.reader, &mut env, root) {
            Ok(value) => Ok(value),
            Err(Error::End) => Err(Error::Decode(format!(
                "trace data ends in the middle of a {scope:?} field"
            ))),
            Err(err) => Err(err),
        }
    }

    /// One state-machine transition. May queue messages in `pending`.
    fn step(&mut self) -> Result<(), Error> {
        match self.state {
            State::PacketBoundary => {
                if self.reader.at_eof()? {
                    self.state = if self.stream_begin_emitted {
                        State::StreamEndEmit
                    } else {
                        State::Done
                    };
                    return Ok(());
                }
                debug_assert_eq!(self.reader.cursor_bits() % 8, 0);
                self.packet_start_bits = self.reader.cursor_bits();
                self.packet_size_bits = None;
                self.content_size_bits = None;
                self.ts_end = None;
                self.state = State::PacketHeaderDecode;
                Ok(())
            }
            State::PacketHeaderDecode => {
                if let Some(root) = self.trace.packet_header_class() {
                    let value = self.run_decoder(root, Scope::PacketHeader)?;
                    self.scopes.set(Scope::PacketHeader, value);
                }
                self.state = State::PacketHeaderCheck;
                Ok(())
            }
            State::PacketHeaderCheck => {
                self.check_packet_header()?;
                self.state = State::PacketContextDecode;
                Ok(())
            }
            State::PacketContextDecode => {
                if let Some(root) = self.stream_class().packet_context_class() {
                    let value = self.run_decoder(root, Scope::PacketContext)?;
                    self.scopes.set(Scope::PacketContext, value);
                }
                self.state = State::PacketContextCheck;
                Ok(())
            }
            State::PacketContextCheck => {
                self.check_packet_context()?;
                // The empty-packet case is the event boundary's call, so
                // that a suspension here cannot re-queue the boundary
                // messages.
                self.state = State::EventBoundary;
                Ok(())
            }
            State::EventBoundary => {
                if self.content_exhausted()? {
                    self.state = State::PacketEndEmit;
                    return Ok(());
                }
                self.scopes.clear_event_scopes();
                self.cur_event_class = None;
                self.state = State::EventHeaderDecode;
                Ok(())
            }
            State::EventHeaderDecode => {
                if let Some(root) = self.stream_class().event_header_class() {
                    let value = self.run_decoder(root, Scope::EventHeader)?;
                    self.scopes.set(Scope::EventHeader, value);
                }
                self.state = State::EventHeaderCheck;
                Ok(())
            }
            State::EventHeaderCheck => {
                self.check_event_header()?;
                self.state = State::EventCommonContextDecode;
                Ok(())
            }
            State::EventCommonContextDecode => {
                if let Some(root) = self.stream_class().event_common_context_class() {
                    let value = self.run_decoder(root, Scope::EventCommonContext)?;
                    self.scopes.set(Scope::EventCommonContext, value);
                }
                self.state = State::EventSpecificContextDecode;
                Ok(())
            }
            State::EventSpecificContextDecode => {
                let class = self
                    .cur_event_class
                    .as_ref()
                    .expect("event class resolved")
                    .specific_context_class();
                if let Some(root) = class {
                    let value = self.run_decoder(root, Scope::EventSpecificContext)?;
                    self.scopes.set(Scope::EventSpecificContext, value);
                }
                self.state = State::EventPayloadDecode;
                Ok(())
            }
            State::EventPayloadDecode => {
                let class = self
                    .cur_event_class
                    .as_ref()
                    .expect("event class resolved")
                    .payload_class();
                if let Some(root) = class {
                    let value = self.run_decoder(root, Scope::EventPayload)?;
                    self.scopes.set(Scope::EventPayload, value);
                }
                self.state = State::EventEmit;
                Ok(())
            }
            State::EventEmit => {
                self.emit_event()?;
                self.state = State::EventBoundary;
                Ok(())
            }
            State::PacketEndEmit => {
                self.emit_packet_end();
                self.state = State::PaddingSkip;
                Ok(())
            }
            State::PaddingSkip => {
                if let Err(err) = self.skip_padding() {
                    if matches!(err, Error::End) {
                        // The final packet's padding was cut short; the
                        // content was complete, so the stream just ends.
                        log::warn!("trace data ends inside the final packet's padding");
                        self.reader.cancel_skip();
                        self.state = State::StreamEndEmit;
                        return Ok(());
                    }
                    return Err(err);
                }
                self.scopes.clear();
                self.state = State::PacketBoundary;
                Ok(())
            }
            State::StreamEndEmit => {
                let stream = self.stream.clone().expect("stream resolved");
                let snapshot = self
                    .prev_end_cycles
                    .or(Some(self.clock.cycles))
                    .and_then(|cycles| self.snapshot(cycles));
                self.pending.push_back(Message::StreamEnd { stream, snapshot });
                self.state = State::Done;
                Ok(())
            }
            State::Done => Err(Error::End),
        }
    }

    /// Interprets the decoded packet header: magic, UUID, stream
    /// selection; resolves the stream through the medium.
    fn check_packet_header(&mut self) -> Result<(), Error> {
        let header = self.scopes.get(Scope::PacketHeader).cloned();
        let get = |name: &str| header.as_ref().and_then(|h| h.map_get(name));

        if let Some(magic) = get("magic").and_then(|v| v.as_u64_lossy()) {
            if magic != PACKET_MAGIC as u64 {
                return Err(Error::Decode(format!(
                    "invalid packet magic number: {magic:#010x} (expecting {PACKET_MAGIC:#010x})"
                )));
            }
        }

        if let Some(uuid_field) = get("uuid") {
            if let Some(expected) = self.trace.uuid() {
                let mut bytes = [0u8; 16];
                let len = uuid_field.array_len().unwrap_or(0);
                if len != 16 {
                    return Err(Error::Decode(format!(
                        "packet header UUID field has {len} elements (expecting 16)"
                    )));
                }
                for (i, byte) in bytes.iter_mut().enumerate() {
                    *byte = uuid_field
                        .array_get(i)
                        .and_then(|v| v.as_u64_lossy())
                        .unwrap_or(0) as u8;
                }
                if uuid::Uuid::from_bytes(bytes) != expected {
                    return Err(Error::Decode(format!(
                        "packet UUID does not match the trace class UUID ({expected})"
                    )));
                }
            }
        }

        let stream_class = match get("stream_id").and_then(|v| v.as_u64_lossy()) {
            Some(id) => self.trace.stream_class_by_id(id).ok_or_else(|| {
                Error::Decode(format!("packet header selects unknown stream class {id}"))
            })?,
            None => {
                if self.trace.stream_class_count() == 1 {
                    self.trace.stream_class_by_index(0).expect("one stream class")
                } else {
                    return Err(Error::Decode(
                        "packet header does not select a stream class".into(),
                    ));
                }
            }
        };
        // First observation freezes the stream class (the trace class
        // froze when this iterator was created).
        stream_class.freeze();

        let instance_id = get("stream_instance_id").and_then(|v| v.as_u64_lossy());
        let stream = self.reader.medium().borrow_stream(
            &stream_class,
            instance_id,
            header.as_ref(),
        )?;
        if let Some(prev) = &self.stream {
            if !prev.same_stream(&stream) {
                return Err(Error::Schema(
                    "medium switched to a different stream mid-iterator".into(),
                ));
            }
        }

        self.scope_classes
            .set(Scope::PacketContext, stream_class.packet_context_class());
        self.scope_classes
            .set(Scope::EventHeader, stream_class.event_header_class());
        self.scope_classes.set(
            Scope::EventCommonContext,
            stream_class.event_common_context_class(),
        );
        self.stream = Some(stream);
        self.stream_class = Some(stream_class);
        Ok(())
    }

    /// Interprets the decoded packet context: sizes, timestamps,
    /// discarded counters; queues the boundary messages.
    fn check_packet_context(&mut self) -> Result<(), Error> {
        let context = self.scopes.get(Scope::PacketContext).cloned();
        let get =
            |name: &str| context.as_ref().and_then(|c| c.map_get(name)).and_then(|v| v.as_u64_lossy());

        let mut content = get("content_size");
        let mut packet = get("packet_size");
        if content.is_none() {
            content = packet;
        }
        if packet.is_none() {
            packet = content.map(|c| c.div_ceil(8) * 8);
        }
        if let (Some(content), Some(packet)) = (content, packet) {
            if content > packet {
                return Err(Error::Decode(format!(
                    "content size ({content} bits) is larger than the packet size ({packet} bits)"
                )));
            }
            if packet % 8 != 0 {
                return Err(Error::Decode(format!(
                    "packet size ({packet} bits) is not a multiple of 8"
                )));
            }
        }
        if let Some(content) = content {
            if content < self.packet_rel_bits() {
                return Err(Error::Decode(format!(
                    "content size ({content} bits) is smaller than the packet header \
                     and context ({} bits)",
                    self.packet_rel_bits()
                )));
            }
        }
        self.content_size_bits = content;
        self.packet_size_bits = packet;

        let ts_begin = get("timestamp_begin");
        if let Some(begin) = ts_begin {
            self.clock.cycles = begin;
        }
        self.ts_end = get("timestamp_end");

        let stream = self.stream.clone().expect("stream resolved");
        if !self.stream_begin_emitted {
            self.pending.push_back(Message::StreamBeginning {
                stream: stream.clone(),
                snapshot: None,
            });
            self.stream_begin_emitted = true;
        }

        // Discarded-events and discarded-packets synthesis: counter
        // deltas against the previous packet of this stream. The time
        // range is only attached when both boundaries are known.
        let gap_range = match (
            self.prev_end_cycles.and_then(|c| self.snapshot(c)),
            ts_begin.and_then(|c| self.snapshot(c)),
        ) {
            (Some(begin), Some(end)) => Some(SnapshotRange { begin, end }),
            _ => None,
        };
        let events_discarded = get("events_discarded");
        if let (Some(prev), Some(cur)) = (self.prev_events_discarded, events_discarded) {
            if cur > prev {
                self.pending.push_back(Message::DiscardedEvents {
                    stream: stream.clone(),
                    count: cur - prev,
                    range: gap_range.clone(),
                });
            }
        }
        let seq_num = get("packet_seq_num");
        if let (Some(prev), Some(cur)) = (self.prev_seq_num, seq_num) {
            if cur > prev + 1 {
                self.pending.push_back(Message::DiscardedPackets {
                    stream: stream.clone(),
                    count: cur - prev - 1,
                    range: gap_range,
                });
            }
        }
        if events_discarded.is_some() {
            self.prev_events_discarded = events_discarded;
        }
        if seq_num.is_some() {
            self.prev_seq_num = seq_num;
        }

        let packet_obj = Packet::new(stream, context);
        self.cur_packet = Some(packet_obj.clone());
        self.pending.push_back(Message::PacketBeginning {
            packet: packet_obj,
            snapshot: ts_begin.and_then(|c| self.snapshot(c)),
        });
        Ok(())
    }

    /// Whether the cursor reached the packet's content boundary (or the
    /// medium's end, for an unbounded packet).
    fn content_exhausted(&mut self) -> Result<bool, Error> {
        match self.content_size_bits {
            Some(content) => Ok(self.packet_rel_bits() >= content),
            None => self.reader.at_eof(),
        }
    }

    fn check_event_header(&mut self) -> Result<(), Error> {
        let stream_class = self.stream_class().clone();
        let id = self
            .scopes
            .get(Scope::EventHeader)
            .and_then(|h| h.map_get("id"))
            .and_then(|v| v.as_u64_lossy());
        let event_class = match id {
            Some(id) => stream_class.event_class_by_id(id).ok_or_else(|| {
                Error::Decode(format!("event header selects unknown event class {id}"))
            })?,
            None => {
                if stream_class.event_class_count() == 1 {
                    stream_class.event_class_by_index(0).expect("one event class")
                } else {
                    return Err(Error::Decode(
                        "event header does not select an event class".into(),
                    ));
                }
            }
        };
        event_class.freeze();
        self.scope_classes.set(
            Scope::EventSpecificContext,
            event_class.specific_context_class(),
        );
        self.scope_classes
            .set(Scope::EventPayload, event_class.payload_class());
        self.cur_event_class = Some(event_class);
        Ok(())
    }

    fn emit_event(&mut self) -> Result<(), Error> {
        // A partial event must not cross the content boundary.
        if let Some(content) = self.content_size_bits {
            if self.packet_rel_bits() > content {
                return Err(Error::Decode(format!(
                    "event ends {} bits past the packet content boundary",
                    self.packet_rel_bits() - content
                )));
            }
        }

        let snapshot = self.snapshot(self.clock.cycles);
        if let (Some(until), Some(snapshot)) = (self.skip_until_ns, &snapshot) {
            // Seeking forward: drop events before the target time.
            if snapshot.ns_from_origin()? < until {
                self.scopes.clear_event_scopes();
                return Ok(());
            }
        }

        let freeze = |value: &Option<Value>| {
            if let Some(value) = value {
                value.freeze();
            }
        };
        let header = self.scopes.take(Scope::EventHeader);
        let common_context = self.scopes.take(Scope::EventCommonContext);
        let specific_context = self.scopes.take(Scope::EventSpecificContext);
        let payload = self.scopes.take(Scope::EventPayload);
        freeze(&header);
        freeze(&common_context);
        freeze(&specific_context);
        freeze(&payload);

        self.pending.push_back(Message::Event(Rc::new(EventMessage {
            class: self.cur_event_class.clone().expect("event class resolved"),
            packet: self.cur_packet.clone().expect("packet open"),
            header,
            common_context,
            specific_context,
            payload,
            snapshot,
        })));
        Ok(())
    }

    fn emit_packet_end(&mut self) {
        let end_cycles = self.ts_end.or_else(|| {
            self.default_clock().map(|_| self.clock.cycles)
        });
        if let Some(end) = self.ts_end {
            self.clock.cycles = end;
        }
        let snapshot = end_cycles.and_then(|c| self.snapshot(c));
        self.prev_end_cycles = end_cycles;
        self.pending.push_back(Message::PacketEnd {
            packet: self.cur_packet.take().expect("packet open"),
            snapshot,
        });
    }

    fn skip_padding(&mut self) -> Result<(), Error> {
        if self.reader.skip_in_progress() {
            return self.reader.continue_skip();
        }
        let Some(packet) = self.packet_size_bits else {
            // Unbounded packet: the medium is already exhausted.
            return Ok(());
        };
        let target = self.packet_start_bits + packet;
        let cursor = self.reader.cursor_bits();
        if cursor > target {
            return Err(Error::Decode(format!(
                "packet data ends {} bits past its declared packet size",
                cursor - target
            )));
        }
        if cursor < target {
            self.reader.skip_bits(target - cursor)?;
        }
        Ok(())
    }

    fn reset_decode_state(&mut self) {
        self.state = State::PacketBoundary;
        self.decoder.reset();
        self.scopes.clear();
        self.clock = ClockTracker::default();
        self.pending.clear();
        self.saved_error = None;
        self.stream_begin_emitted = false;
        self.cur_packet = None;
        self.cur_event_class = None;
        self.ts_end = None;
        self.prev_events_discarded = None;
        self.prev_seq_num = None;
        self.prev_end_cycles = None;
        self.skip_until_ns = None;
    }

    /// Whether every stream class of the trace has a default clock, the
    /// precondition for time seeks.
    fn all_stream_classes_clocked(&self) -> bool {
        let n = self.trace.stream_class_count();
        n > 0
            && (0..n).all(|i| {
                self.trace
                    .stream_class_by_index(i)
                    .is_some_and(|sc| sc.default_clock_class().is_some())
            })
    }
}

impl MessageIterator for MsgIter {
    fn next(&mut self, out: &mut Vec<Message>, capacity: usize) -> Result<usize, Error> {
        if capacity == 0 {
            return Err(Error::InvalidArgument(
                "message batch capacity must be at least 1".into(),
            ));
        }
        if let Some(err) = self.saved_error.take() {
            return Err(err);
        }

        let mut count = 0;
        while count < capacity {
            if let Some(msg) = self.pending.pop_front() {
                out.push(msg);
                count += 1;
                continue;
            }
            match self.step() {
                Ok(()) => {}
                Err(Error::Again) => {
                    return if count > 0 { Ok(count) } else { Err(Error::Again) };
                }
                Err(Error::End) => {
                    return if count > 0 { Ok(count) } else { Err(Error::End) };
                }
                Err(err) => {
                    return if count > 0 {
                        self.saved_error = Some(err);
                        Ok(count)
                    } else {
                        Err(err)
                    };
                }
            }
        }
        Ok(count)
    }

    fn can_seek_beginning(&mut self) -> bool {
        self.reader.medium().can_seek()
    }

    fn seek_beginning(&mut self) -> Result<(), Error> {
        self.reader.seek_byte(0)?;
        self.reset_decode_state();
        Ok(())
    }

    fn can_seek_ns_from_origin(&mut self, _ns_from_origin: i64) -> bool {
        self.index.is_some() && self.reader.medium().can_seek() && self.all_stream_classes_clocked()
    }

    /// Fast-forwards to the first packet whose end time is at or after
    /// `ns_from_origin`, then discards events older than it.
    fn seek_ns_from_origin(&mut self, ns_from_origin: i64) -> Result<(), Error> {
        if !self.can_seek_ns_from_origin(ns_from_origin) {
            return Err(Error::Unsupported);
        }
        let index = self.index.as_ref().expect("index present");
        let offset = match index.first_entry_ending_at_or_after(ns_from_origin) {
            Some(entry) => entry.offset_bytes,
            // Past the last packet: land at the end of the data.
            None => index.end_offset_bytes(),
        };
        self.reader.seek_byte(offset)?;
        self.reset_decode_state();
        self.skip_until_ns = Some(ns_from_origin);
        Ok(())
    }
}
