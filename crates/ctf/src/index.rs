//! Packet indexing: a pre-scan of every packet's header and context,
//! recording offsets, sizes and timestamps.
//!
//! The index enables time seeks (binary search for the first packet
//! ending at or after a target time) and is where producer-bug
//! compensations are applied before use (see [`crate::quirks`]).

use tracemux_runtime_core::graph::MessageIterator;
use tracemux_runtime_core::ir::{Scope, StreamClass, TraceClass};
use tracemux_runtime_core::message::Message;
use tracemux_runtime_core::Error;

use crate::bitio::MediumReader;
use crate::decode::{ClockTracker, DecodeEnv, FieldDecoder, ScopeClasses, ScopeValues};
use crate::iterator::MsgIter;
use crate::medium::Medium;

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub offset_bytes: u64,
    pub packet_size_bits: u64,
    /// Raw cycle counts from the packet context.
    pub timestamp_begin: Option<u64>,
    pub timestamp_end: Option<u64>,
    pub packet_seq_num: Option<u64>,
    /// The timestamps converted through the stream's clock.
    pub timestamp_begin_ns: Option<i64>,
    pub timestamp_end_ns: Option<i64>,
}

pub struct PacketIndex {
    entries: Vec<IndexEntry>,
    stream_class_id: Option<u64>,
    end_offset_bytes: u64,
}

impl PacketIndex {
    /// Scans every packet of a seekable medium, decoding only headers
    /// and contexts and hopping from packet to packet by declared size.
    pub fn build(medium: Box<dyn Medium>, trace: &TraceClass) -> Result<PacketIndex, Error> {
        let mut reader = MediumReader::new(medium);
        let mut decoder = FieldDecoder::new();
        let mut scopes = ScopeValues::default();
        let mut scope_classes = ScopeClasses::default();
        scope_classes.set(Scope::PacketHeader, trace.packet_header_class());
        let mut clock = ClockTracker::default();
        let mut entries = Vec::new();
        let mut stream_class_id = None;

        loop {
            if reader.at_eof()? {
                break;
            }
            let offset_bytes = reader.cursor_bits() / 8;
            scopes.clear();

            if let Some(root) = trace.packet_header_class() {
                let mut env = DecodeEnv {
                    trace,
                    scopes: &scopes,
                    scope_classes: &scope_classes,
                    current_scope: Scope::PacketHeader,
                    clock: &mut clock,
                };
                let value = decoder.decode(&mut reader, &mut env, root)?;
                scopes.set(Scope::PacketHeader, value);
            }
            let stream_class = index_stream_class(trace, &scopes)?;
            stream_class_id.get_or_insert(stream_class.id());
            scope_classes.set(Scope::PacketContext, stream_class.packet_context_class());

            if let Some(root) = stream_class.packet_context_class() {
                let mut env = DecodeEnv {
                    trace,
                    scopes: &scopes,
                    scope_classes: &scope_classes,
                    current_scope: Scope::PacketContext,
                    clock: &mut clock,
                };
                let value = decoder.decode(&mut reader, &mut env, root)?;
                scopes.set(Scope::PacketContext, value);
            }

            let context = scopes.get(Scope::PacketContext);
            let get = |name: &str| {
                context
                    .and_then(|c| c.map_get(name))
                    .and_then(|v| v.as_u64_lossy())
            };
            // Packets without a declared size cannot be hopped over.
            let packet_size_bits = get("packet_size")
                .or_else(|| get("content_size").map(|c| c.div_ceil(8) * 8))
                .ok_or(Error::Unsupported)?;
            let clock_class = stream_class.default_clock_class();
            let to_ns = |cycles: Option<u64>| -> Option<i64> {
                let clock = clock_class.as_ref()?;
                clock.cycles_to_ns_from_origin(cycles?).ok()
            };
            let timestamp_begin = get("timestamp_begin");
            let timestamp_end = get("timestamp_end");
            entries.push(IndexEntry {
                offset_bytes,
                packet_size_bits,
                timestamp_begin,
                timestamp_end,
                packet_seq_num: get("packet_seq_num"),
                timestamp_begin_ns: to_ns(timestamp_begin),
                timestamp_end_ns: to_ns(timestamp_end),
            });

            if packet_size_bits == 0 || packet_size_bits % 8 != 0 {
                return Err(Error::Decode(format!(
                    "cannot index a packet of {packet_size_bits} bits"
                )));
            }
            reader.seek_byte(offset_bytes + packet_size_bits / 8)?;
            decoder.reset();
        }

        Ok(PacketIndex {
            end_offset_bytes: reader.cursor_bits() / 8,
            entries,
            stream_class_id,
        })
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [IndexEntry] {
        &mut self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stream_class_id(&self) -> Option<u64> {
        self.stream_class_id
    }

    /// Byte offset just past the last indexed packet.
    pub fn end_offset_bytes(&self) -> u64 {
        self.end_offset_bytes
    }

    /// The first packet whose end time is at or after `ns`, by binary
    /// search. Packets without an end time sort before everything.
    pub fn first_entry_ending_at_or_after(&self, ns: i64) -> Option<&IndexEntry> {
        let split = self
            .entries
            .partition_point(|e| e.timestamp_end_ns.unwrap_or(i64::MIN) < ns);
        self.entries.get(split)
    }

    /// Refreshes the nanosecond timestamps from the raw cycle counts,
    /// after a fixup pass rewrote them.
    pub fn recompute_ns(&mut self, trace: &TraceClass) {
        let clock = self
            .stream_class_id
            .and_then(|id| trace.stream_class_by_id(id))
            .and_then(|sc| sc.default_clock_class());
        let Some(clock) = clock else { return };
        for entry in &mut self.entries {
            entry.timestamp_begin_ns = entry
                .timestamp_begin
                .and_then(|c| clock.cycles_to_ns_from_origin(c).ok());
            entry.timestamp_end_ns = entry
                .timestamp_end
                .and_then(|c| clock.cycles_to_ns_from_origin(c).ok());
        }
    }
}

/// Resolves the stream class a packet header selects (shared with the
/// iterator's rules: explicit `stream_id`, or the only stream class).
fn index_stream_class(trace: &TraceClass, scopes: &ScopeValues) -> Result<StreamClass, Error> {
    let id = scopes
        .get(Scope::PacketHeader)
        .and_then(|h| h.map_get("stream_id"))
        .and_then(|v| v.as_u64_lossy());
    match id {
        Some(id) => trace.stream_class_by_id(id).ok_or_else(|| {
            Error::Decode(format!("packet header selects unknown stream class {id}"))
        }),
        None => {
            if trace.stream_class_count() == 1 {
                Ok(trace.stream_class_by_index(0).expect("one stream class"))
            } else {
                Err(Error::Decode(
                    "packet header does not select a stream class".into(),
                ))
            }
        }
    }
}

/// Which event of a packet a fixup wants the timestamp of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketBound {
    First,
    Last,
}

/// Decodes one packet's events and returns the clock cycles of its
/// first or last event, by running a throwaway message iterator over
/// the packet.
pub fn packet_event_bound_cycles(
    mut medium: Box<dyn Medium>,
    trace: &TraceClass,
    entry: &IndexEntry,
    bound: PacketBound,
) -> Result<Option<u64>, Error> {
    medium.seek(entry.offset_bytes)?;
    let mut iter = MsgIter::new(medium, trace.clone());
    let mut batch = Vec::new();
    let mut first = None;
    let mut last = None;
    'outer: loop {
        batch.clear();
        let count = match iter.next(&mut batch, 16) {
            Ok(count) => count,
            Err(Error::End) => break,
            Err(err) => return Err(err),
        };
        for msg in batch.drain(..count) {
            match msg {
                Message::Event(event) => {
                    let cycles = event.snapshot.as_ref().map(|s| s.cycles());
                    if first.is_none() {
                        first = cycles;
                    }
                    last = cycles;
                }
                Message::PacketEnd { .. } => break 'outer,
                _ => {}
            }
        }
    }
    Ok(match bound {
        PacketBound::First => first,
        PacketBound::Last => last,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::medium::BufferMedium;
    use crate::testdata::{build_trace_class, encode_stream, EventSpec, PacketSpec};

    fn two_packet_stream() -> Vec<u8> {
        let mut p1 = PacketSpec::new(
            100,
            200,
            vec![
                EventSpec::Alpha { ts: 110, value: 1 },
                EventSpec::Alpha { ts: 150, value: 2 },
            ],
        );
        p1.padding = 5;
        let p2 = PacketSpec::new(250, 300, vec![EventSpec::Alpha { ts: 260, value: 3 }]);
        encode_stream(&[p1, p2])
    }

    #[test]
    fn scan_records_offsets_sizes_and_timestamps() {
        let bytes = two_packet_stream();
        let total = bytes.len() as u64;
        let (tc, _clock) = build_trace_class(false);
        let index = PacketIndex::build(Box::new(BufferMedium::new(bytes)), &tc).unwrap();

        assert_eq!(index.len(), 2);
        assert_eq!(index.stream_class_id(), Some(0));
        assert_eq!(index.end_offset_bytes(), total);

        // Packet 1: 25 bytes of header+context, two 9-byte events,
        // 5 bytes of padding.
        let e1 = &index.entries()[0];
        assert_eq!(e1.offset_bytes, 0);
        assert_eq!(e1.packet_size_bits, (25 + 18 + 5) * 8);
        assert_eq!(e1.timestamp_begin, Some(100));
        assert_eq!(e1.timestamp_end, Some(200));
        assert_eq!(e1.timestamp_end_ns, Some(200));

        let e2 = &index.entries()[1];
        assert_eq!(e2.offset_bytes, 48);
        assert_eq!(e2.timestamp_begin, Some(250));
    }

    #[test]
    fn binary_search_finds_the_first_packet_ending_at_or_after() {
        let (tc, _clock) = build_trace_class(false);
        let index =
            PacketIndex::build(Box::new(BufferMedium::new(two_packet_stream())), &tc).unwrap();

        assert_eq!(
            index.first_entry_ending_at_or_after(0).unwrap().offset_bytes,
            0
        );
        assert_eq!(
            index
                .first_entry_ending_at_or_after(200)
                .unwrap()
                .offset_bytes,
            0
        );
        assert_eq!(
            index
                .first_entry_ending_at_or_after(201)
                .unwrap()
                .offset_bytes,
            48
        );
        assert!(index.first_entry_ending_at_or_after(301).is_none());
    }

    #[test]
    fn bound_decoding_reads_one_packet_only() {
        let bytes = two_packet_stream();
        let (tc, _clock) = build_trace_class(false);
        let index =
            PacketIndex::build(Box::new(BufferMedium::new(bytes.clone())), &tc).unwrap();

        let first = packet_event_bound_cycles(
            Box::new(BufferMedium::new(bytes.clone())),
            &tc,
            &index.entries()[0],
            PacketBound::First,
        )
        .unwrap();
        assert_eq!(first, Some(110));

        let last = packet_event_bound_cycles(
            Box::new(BufferMedium::new(bytes.clone())),
            &tc,
            &index.entries()[0],
            PacketBound::Last,
        )
        .unwrap();
        assert_eq!(last, Some(150));

        let second_last = packet_event_bound_cycles(
            Box::new(BufferMedium::new(bytes)),
            &tc,
            &index.entries()[1],
            PacketBound::Last,
        )
        .unwrap();
        assert_eq!(second_last, Some(260));
    }
}
