//! Test fixtures: a small schema and a wire-format packet builder.
//!
//! The layout, all little-endian and byte-aligned:
//!
//! | Scope          | Fields                                                          |
//! |----------------|-----------------------------------------------------------------|
//! | packet header  | magic u32, [uuid u8x16,] stream_id u8                           |
//! | packet context | packet_size u32, content_size u32 (bits), timestamp_begin u32,  |
//! |                | timestamp_end u32, events_discarded u16, packet_seq_num u16     |
//! | event header   | id u8, timestamp u32 (mapped to the clock)                      |
//! | payload id 0   | `alpha`: { value u32 }                                          |
//! | payload id 1   | `beta`: { msg string }                                          |

use tracemux_runtime_core::ir::{
    ByteOrder, ClockClass, FieldClass, FieldClassId, IntClass, StructMember, TraceClass,
};

use crate::iterator::PACKET_MAGIC;

pub const CLOCK_FREQ: u64 = 1_000_000_000;
pub const TEST_UUID: [u8; 16] = [9; 16];

fn member(name: &str, class: FieldClassId) -> StructMember {
    StructMember {
        name: name.into(),
        class,
        min_alignment: 8,
    }
}

/// Builds the fixture trace class. With `with_uuid`, the trace class
/// carries [`TEST_UUID`] and the packet header gets a `uuid` member.
pub fn build_trace_class(with_uuid: bool) -> (TraceClass, ClockClass) {
    let tc = TraceClass::new();
    let clock = ClockClass::builder(CLOCK_FREQ)
        .name("cycles")
        .uuid(uuid::Uuid::from_bytes(TEST_UUID))
        .build()
        .unwrap();

    let u8c = tc.add_field_class(FieldClass::FixedInt(IntClass::new(
        false,
        8,
        ByteOrder::LittleEndian,
    )));
    let u16c = tc.add_field_class(FieldClass::FixedInt(IntClass::new(
        false,
        16,
        ByteOrder::LittleEndian,
    )));
    let u32c = tc.add_field_class(FieldClass::FixedInt(IntClass::new(
        false,
        32,
        ByteOrder::LittleEndian,
    )));
    let ts32 = tc.add_field_class(FieldClass::FixedInt(
        IntClass::new(false, 32, ByteOrder::LittleEndian).with_mapped_clock(clock.clone()),
    ));

    let mut header_members = vec![member("magic", u32c)];
    if with_uuid {
        let uuid_arr = tc.add_field_class(FieldClass::StaticArray {
            element: u8c,
            length: 16,
        });
        header_members.push(member("uuid", uuid_arr));
        tc.set_uuid(uuid::Uuid::from_bytes(TEST_UUID)).unwrap();
    }
    header_members.push(member("stream_id", u8c));
    let header = tc.add_field_class(FieldClass::Struct {
        members: header_members,
        min_alignment: 8,
    });
    tc.set_packet_header_class(header).unwrap();

    let context = tc.add_field_class(FieldClass::Struct {
        members: vec![
            member("packet_size", u32c),
            member("content_size", u32c),
            member("timestamp_begin", ts32),
            member("timestamp_end", u32c),
            member("events_discarded", u16c),
            member("packet_seq_num", u16c),
        ],
        min_alignment: 8,
    });

    let event_header = tc.add_field_class(FieldClass::Struct {
        members: vec![member("id", u8c), member("timestamp", ts32)],
        min_alignment: 8,
    });

    let sc = tc.add_stream_class(0).unwrap();
    sc.set_default_clock_class(clock.clone()).unwrap();
    sc.set_packet_context_class(context).unwrap();
    sc.set_event_header_class(event_header).unwrap();

    let alpha = sc.add_event_class(0).unwrap();
    alpha.set_name("alpha").unwrap();
    let alpha_payload = tc.add_field_class(FieldClass::Struct {
        members: vec![member("value", u32c)],
        min_alignment: 8,
    });
    alpha.set_payload_class(alpha_payload).unwrap();

    let beta = sc.add_event_class(1).unwrap();
    beta.set_name("beta").unwrap();
    let s = tc.add_field_class(FieldClass::CtfString);
    let beta_payload = tc.add_field_class(FieldClass::Struct {
        members: vec![member("msg", s)],
        min_alignment: 8,
    });
    beta.set_payload_class(beta_payload).unwrap();

    (tc, clock)
}

#[derive(Clone)]
pub enum EventSpec {
    Alpha { ts: u32, value: u32 },
    Beta { ts: u32, msg: &'static str },
}

impl EventSpec {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            EventSpec::Alpha { ts, value } => {
                out.push(0);
                out.extend_from_slice(&ts.to_le_bytes());
                out.extend_from_slice(&value.to_le_bytes());
            }
            EventSpec::Beta { ts, msg } => {
                out.push(1);
                out.extend_from_slice(&ts.to_le_bytes());
                out.extend_from_slice(msg.as_bytes());
                out.push(0);
            }
        }
    }
}

#[derive(Clone)]
pub struct PacketSpec {
    pub stream_id: u8,
    pub uuid: Option<[u8; 16]>,
    pub magic: u32,
    pub ts_begin: u32,
    pub ts_end: u32,
    pub events_discarded: u16,
    pub seq_num: u16,
    pub events: Vec<EventSpec>,
    /// Trailing padding bytes between content and packet end.
    pub padding: usize,
    /// Overrides for malformed-trace tests, in bits.
    pub content_size_override: Option<u32>,
    pub packet_size_override: Option<u32>,
}

impl PacketSpec {
    pub fn new(ts_begin: u32, ts_end: u32, events: Vec<EventSpec>) -> Self {
        PacketSpec {
            stream_id: 0,
            uuid: None,
            magic: PACKET_MAGIC,
            ts_begin,
            ts_end,
            events_discarded: 0,
            seq_num: 0,
            events,
            padding: 0,
            content_size_override: None,
            packet_size_override: None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut events = Vec::new();
        for event in &self.events {
            event.encode(&mut events);
        }
        let header_len = 4 + self.uuid.map_or(0, |_| 16) + 1;
        let context_len = 4 + 4 + 4 + 4 + 2 + 2;
        let content_bits = ((header_len + context_len + events.len()) * 8) as u32;
        let content = self.content_size_override.unwrap_or(content_bits);
        let packet = self
            .packet_size_override
            .unwrap_or(content_bits + self.padding as u32 * 8);

        let mut out = Vec::new();
        out.extend_from_slice(&self.magic.to_le_bytes());
        if let Some(uuid) = self.uuid {
            out.extend_from_slice(&uuid);
        }
        out.push(self.stream_id);
        out.extend_from_slice(&packet.to_le_bytes());
        out.extend_from_slice(&content.to_le_bytes());
        out.extend_from_slice(&self.ts_begin.to_le_bytes());
        out.extend_from_slice(&self.ts_end.to_le_bytes());
        out.extend_from_slice(&self.events_discarded.to_le_bytes());
        out.extend_from_slice(&self.seq_num.to_le_bytes());
        out.extend_from_slice(&events);
        out.extend(std::iter::repeat(0u8).take(self.padding));
        out
    }
}

/// Encodes a whole data stream: the packets, back to back.
pub fn encode_stream(packets: &[PacketSpec]) -> Vec<u8> {
    let mut out = Vec::new();
    for packet in packets {
        out.extend_from_slice(&packet.encode());
    }
    out
}
