//! Producer-bug compensations ("quirks") applied to the packet index.
//!
//! Some tracer versions emit packets whose declared end timestamp is
//! wrong: an event recorded after the packet context was written, a
//! first event older than the packet's begin timestamp, or a crash that
//! left the end timestamp zeroed. The affected producers are identified
//! by the trace environment (`tracer_name`, `tracer_major`, ...); when
//! a known-buggy version produced the trace, the index timestamps are
//! rewritten before anything trusts them.

use tracemux_runtime_core::ir::{Quirks, TraceClass};
use tracemux_runtime_core::Error;

use crate::index::{packet_event_bound_cycles, IndexEntry, PacketBound, PacketIndex};
use crate::medium::Medium;

/// Producer identity from the trace environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracerInfo {
    pub name: String,
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

/// Reads the producer identity. A missing name or major version is not
/// an error; it just disables every quirk.
pub fn extract_tracer_info(trace: &TraceClass) -> Option<TracerInfo> {
    let name = trace.environment_entry("tracer_name")?.as_string()?;
    let int_entry = |key: &str| {
        trace
            .environment_entry(key)
            .and_then(|v| v.as_u64_lossy())
    };
    let major = int_entry("tracer_major")?;
    let minor = int_entry("tracer_minor").unwrap_or(0);
    // Older producers call it `tracer_patchlevel`.
    let patch = int_entry("tracer_patch")
        .or_else(|| int_entry("tracer_patchlevel"))
        .unwrap_or(0);
    Some(TracerInfo {
        name,
        major,
        minor,
        patch,
    })
}

/// Whether this producer may emit an event with a timestamp past its
/// packet's declared end timestamp.
/// Affected: lttng-ust < 2.11; lttng-modules < 2.9.13, 2.10.x < 2.10.10
/// and anything below 2.9.
pub fn has_event_after_packet_bug(info: &TracerInfo) -> bool {
    match info.name.as_str() {
        "lttng-ust" => info.major < 2 || (info.major == 2 && info.minor < 11),
        "lttng-modules" => {
            if info.major < 2 {
                return true;
            }
            if info.major > 2 {
                return false;
            }
            match info.minor {
                10 => info.patch < 10,
                9 => info.patch < 13,
                minor => minor < 9,
            }
        }
        _ => false,
    }
}

/// Whether this producer may emit an event older than its packet's
/// begin timestamp. Affected: barectf < 2.3.1.
pub fn has_event_before_packet_bug(info: &TracerInfo) -> bool {
    info.name == "barectf"
        && (info.major < 2
            || (info.major == 2 && (info.minor < 3 || (info.minor == 3 && info.patch < 1))))
}

/// Whether a crashed tracer may have left a zero end timestamp.
/// Any lttng-ust or lttng-modules version is affected.
pub fn has_crash_truncation_bug(info: &TracerInfo) -> bool {
    matches!(info.name.as_str(), "lttng-ust" | "lttng-modules")
}

/// Rewrites every entry's end timestamp: the next packet's begin
/// timestamp, or for the last packet the timestamp of its last event
/// (supplied by `last_event_cycles`).
pub fn fix_index_event_after_packet(
    entries: &mut [IndexEntry],
    mut last_event_cycles: impl FnMut(&IndexEntry) -> Result<Option<u64>, Error>,
) -> Result<(), Error> {
    let len = entries.len();
    for i in 0..len {
        if i + 1 < len {
            entries[i].timestamp_end = entries[i + 1].timestamp_begin;
        } else {
            let fixed = last_event_cycles(&entries[i])?;
            if fixed.is_some() {
                entries[i].timestamp_end = fixed;
            }
        }
    }
    Ok(())
}

/// From the second packet on, replaces the begin timestamp with the
/// first event's timestamp and pulls the previous packet's end
/// timestamp to the same value.
pub fn fix_index_event_before_packet(
    entries: &mut [IndexEntry],
    mut first_event_cycles: impl FnMut(&IndexEntry) -> Result<Option<u64>, Error>,
) -> Result<(), Error> {
    for i in 1..entries.len() {
        let Some(first) = first_event_cycles(&entries[i])? else {
            continue;
        };
        entries[i].timestamp_begin = Some(first);
        entries[i - 1].timestamp_end = Some(first);
    }
    Ok(())
}

/// Recomputes zeroed end timestamps (begin set, end zero) the same way
/// the event-after-packet fix does: the next packet's begin timestamp,
/// or, for the last packet, the timestamp of its last event.
pub fn fix_index_crash_truncation(
    entries: &mut [IndexEntry],
    mut last_event_cycles: impl FnMut(&IndexEntry) -> Result<Option<u64>, Error>,
) -> Result<(), Error> {
    let len = entries.len();
    for i in 0..len {
        let zero_end = entries[i].timestamp_end == Some(0);
        let nonzero_begin = entries[i].timestamp_begin.is_some_and(|b| b != 0);
        if !(zero_end && nonzero_begin) {
            continue;
        }
        if i + 1 < len {
            entries[i].timestamp_end = entries[i + 1].timestamp_begin;
        } else {
            let fixed = last_event_cycles(&entries[i])?;
            if fixed.is_some() {
                entries[i].timestamp_end = fixed;
            }
        }
    }
    Ok(())
}

/// Applies every quirk the producer is known for, records the applied
/// set on the trace class, and refreshes the index's nanosecond
/// timestamps. `reopen` yields a fresh medium over the same data each
/// time a packet's events must be re-decoded.
pub fn fix_packet_index(
    index: &mut PacketIndex,
    trace: &TraceClass,
    mut reopen: impl FnMut() -> Result<Box<dyn Medium>, Error>,
) -> Result<(), Error> {
    let Some(info) = extract_tracer_info(trace) else {
        return Ok(());
    };
    let mut quirks = Quirks::default();

    if has_event_after_packet_bug(&info) {
        log::info!(
            "trace producer {} {}.{}.{} has the event-after-packet bug; fixing the index",
            info.name,
            info.major,
            info.minor,
            info.patch
        );
        fix_index_event_after_packet(index.entries_mut(), |entry| {
            packet_event_bound_cycles(reopen()?, trace, entry, PacketBound::Last)
        })?;
        quirks.event_after_packet = true;
    }

    if has_event_before_packet_bug(&info) {
        log::info!(
            "trace producer {} {}.{}.{} has the event-before-packet bug; fixing the index",
            info.name,
            info.major,
            info.minor,
            info.patch
        );
        fix_index_event_before_packet(index.entries_mut(), |entry| {
            packet_event_bound_cycles(reopen()?, trace, entry, PacketBound::First)
        })?;
        quirks.event_before_packet = true;
    }

    if has_crash_truncation_bug(&info) {
        fix_index_crash_truncation(index.entries_mut(), |entry| {
            packet_event_bound_cycles(reopen()?, trace, entry, PacketBound::Last)
        })?;
        quirks.lttng_crash = true;
    }

    trace.set_quirks(quirks);
    index.recompute_ns(trace);
    Ok(())
}
