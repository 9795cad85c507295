//! The muxer: a filter merging N upstream message streams into one,
//! ordered by time.
//!
//! The muxer exposes one output port `"out"` and grows input ports
//! `"in0"`, `"in1"`, ... so that one is always free to connect. Its
//! iterator keeps one slot per upstream connection, pulls one message
//! per slot, and repeatedly emits the smallest head. Ties break by slot
//! index, so two slots with identical timestamps produce a fixed order
//! across runs.
//!
//! Time assignment: a message carrying a clock snapshot is pinned to its
//! nanoseconds-from-origin. A message without one (stream or packet
//! boundaries, messages of clockless streams) floats: its effective time
//! is whatever the muxer last returned, so it is emitted as soon as its
//! slot is considered. Every clock class contributing to one muxer
//! output must be pairwise comparable (same object, both absolute, or
//! same UUID).
//!
//! Upstream connections may appear while the graph runs; the iterator
//! absorbs them on its next pull. A pinned head that is older than the
//! last returned time is a time regression and fails the iterator.

use std::rc::Rc;

use crate::append_error_cause;
use crate::error::Error;
use crate::graph::{
    ComponentCtx, FilterComponent, MessageIterator, UpstreamConn, UpstreamSet,
};
use crate::ir::{clocks_comparable, ClockClass};
use crate::message::{Message, MessageKind};
use crate::values::Value;

pub const CLASS_NAME: &str = "filter.utils.muxer";

/// The muxer component. Add it to a graph with
/// [`Graph::add_filter_component`](crate::graph::Graph::add_filter_component).
#[derive(Default)]
pub struct Muxer {
    ports_added: usize,
}

impl Muxer {
    pub fn new() -> Self {
        Muxer::default()
    }

    fn add_next_input(&mut self, ctx: &ComponentCtx) -> Result<(), Error> {
        let name = format!("in{}", self.ports_added);
        self.ports_added += 1;
        ctx.add_input_port(&name)?;
        Ok(())
    }
}

impl FilterComponent for Muxer {
    fn initialize(&mut self, ctx: &ComponentCtx, _params: &Value) -> Result<(), Error> {
        ctx.add_output_port("out")?;
        // Keep one input port available at all times.
        self.add_next_input(ctx)
    }

    fn input_port_connected(&mut self, ctx: &ComponentCtx, _port: &str) -> Result<(), Error> {
        self.add_next_input(ctx)
    }

    fn create_iterator(
        &mut self,
        ctx: &ComponentCtx,
        _output_port: &str,
        upstreams: &UpstreamSet,
    ) -> Result<Box<dyn MessageIterator>, Error> {
        Ok(Box::new(MuxerIterator::new(
            Rc::clone(upstreams),
            ctx.clone(),
        )))
    }
}

// === Iterator ===

const NO_TIME: i64 = i64::MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    NeedsPull,
    Ready,
    Ended,
    Again,
}

struct Slot {
    port_name: String,
    iter: Box<dyn MessageIterator>,
    head: Option<Message>,
    /// Pinned time in ns from origin, or `None` when the head floats
    /// (no clock snapshot: effective time is the last returned time).
    head_time: Option<i64>,
    state: SlotState,
    scratch: Vec<Message>,
}

pub struct MuxerIterator {
    upstreams: UpstreamSet,
    absorbed: usize,
    slots: Vec<Slot>,
    last_returned_ts: i64,
    /// First clock class observed; every later one must be comparable.
    expected_clock: Option<ClockClass>,
    saved_error: Option<Error>,
    ctx: ComponentCtx,
}

impl MuxerIterator {
    fn new(upstreams: UpstreamSet, ctx: ComponentCtx) -> Self {
        MuxerIterator {
            upstreams,
            absorbed: 0,
            slots: Vec::new(),
            last_returned_ts: NO_TIME,
            expected_clock: None,
            saved_error: None,
            ctx,
        }
    }

    /// Creates slots for upstream connections that appeared since the
    /// last call.
    fn absorb_new_upstreams(&mut self) -> Result<(), Error> {
        loop {
            let next = {
                let upstreams = self.upstreams.borrow();
                if self.absorbed >= upstreams.len() {
                    break;
                }
                let conn: &UpstreamConn = &upstreams[self.absorbed];
                (conn.input_port().to_string(), conn.create_iterator())
            };
            let (port_name, iter) = next;
            let iter = match iter {
                Ok(iter) => iter,
                Err(err) => {
                    append_error_cause!(
                        self.ctx.name(),
                        self.ctx.class_name(),
                        "failed to create an iterator on input port `{port_name}`: {err}"
                    );
                    return Err(err);
                }
            };
            log::debug!(
                "muxer `{}`: new upstream slot {} on port `{port_name}`",
                self.ctx.name(),
                self.slots.len()
            );
            self.slots.push(Slot {
                port_name,
                iter,
                head: None,
                head_time: None,
                state: SlotState::NeedsPull,
                scratch: Vec::new(),
            });
            self.absorbed += 1;
        }
        Ok(())
    }

    fn check_clock(&mut self, clock: &ClockClass, port_name: &str) -> Result<(), Error> {
        match &self.expected_clock {
            None => {
                self.expected_clock = Some(clock.clone());
                Ok(())
            }
            Some(expected) if clocks_comparable(expected, clock) => Ok(()),
            Some(_) => {
                let err = Error::IncomparableClocks(format!(
                    "clock class of a message on port `{port_name}` cannot be ordered \
                     against the other active clock classes"
                ));
                append_error_cause!(self.ctx.name(), self.ctx.class_name(), "{err}");
                Err(err)
            }
        }
    }

    /// The pinned time of a message, or `None` when it floats.
    fn message_time(&mut self, msg: &Message, port_name: &str) -> Result<Option<i64>, Error> {
        if let Some(snapshot) = msg.snapshot() {
            self.check_clock(snapshot.clock_class(), port_name)?;
            return snapshot.ns_from_origin().map(Some);
        }
        // Events of a clock-bearing stream must carry a snapshot; the
        // boundary messages may float.
        if msg.kind() == MessageKind::Event {
            let has_clock = msg
                .stream()
                .is_some_and(|s| s.class().default_clock_class().is_some());
            if has_clock {
                let err = Error::Schema(format!(
                    "expecting a clock snapshot on an event message from port `{port_name}`"
                ));
                append_error_cause!(self.ctx.name(), self.ctx.class_name(), "{err}");
                return Err(err);
            }
        }
        Ok(None)
    }

    fn pull(&mut self, index: usize) -> Result<(), Error> {
        let slot = &mut self.slots[index];
        slot.scratch.clear();
        match slot.iter.next(&mut slot.scratch, 1) {
            Ok(count) => {
                debug_assert!(count >= 1, "next returned ok with an empty batch");
                let msg = slot.scratch.remove(0);
                let port_name = slot.port_name.clone();
                let time = self.message_time(&msg, &port_name)?;
                let slot = &mut self.slots[index];
                slot.head = Some(msg);
                slot.head_time = time;
                slot.state = SlotState::Ready;
                Ok(())
            }
            Err(Error::Again) => {
                self.slots[index].state = SlotState::Again;
                Ok(())
            }
            Err(Error::End) => {
                self.slots[index].state = SlotState::Ended;
                Ok(())
            }
            Err(err) => {
                append_error_cause!(
                    self.ctx.name(),
                    self.ctx.class_name(),
                    "upstream iterator on port `{}` failed: {err}",
                    self.slots[index].port_name
                );
                Err(err)
            }
        }
    }

    /// One merge step: `Ok(Some(msg))` to emit, `Ok(None)` when all
    /// upstreams ended.
    fn advance(&mut self) -> Result<Option<Message>, Error> {
        self.absorb_new_upstreams()?;

        let mut any_again = false;
        for index in 0..self.slots.len() {
            if self.slots[index].state == SlotState::NeedsPull {
                self.pull(index)?;
            }
            if self.slots[index].state == SlotState::Again {
                any_again = true;
            }
        }
        let any_ready = self.slots.iter().any(|s| s.state == SlotState::Ready);

        // Blocked slots are retried on the next call.
        if any_again {
            for slot in &mut self.slots {
                if slot.state == SlotState::Again {
                    slot.state = SlotState::NeedsPull;
                }
            }
            if !any_ready {
                return Err(Error::Again);
            }
        }
        if !any_ready {
            return Ok(None);
        }

        // Smallest effective head time wins; ties go to the lowest slot
        // index.
        let mut best: Option<(usize, i64)> = None;
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.state != SlotState::Ready {
                continue;
            }
            let time = slot.head_time.unwrap_or(self.last_returned_ts);
            if best.is_none() || time < best.unwrap().1 {
                best = Some((index, time));
            }
        }
        let (index, time) = best.expect("at least one ready slot");

        if time < self.last_returned_ts {
            let err = Error::TimeRegression(format!(
                "message at {time} ns on port `{}` is older than the last \
                 returned time ({} ns)",
                self.slots[index].port_name, self.last_returned_ts
            ));
            append_error_cause!(self.ctx.name(), self.ctx.class_name(), "{err}");
            return Err(err);
        }
        self.last_returned_ts = time;

        let slot = &mut self.slots[index];
        let msg = slot.head.take().expect("ready slot has a head");
        slot.head_time = None;
        slot.state = SlotState::NeedsPull;
        Ok(Some(msg))
    }
}

impl MessageIterator for MuxerIterator {
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
            match self.advance() {
                Ok(Some(msg)) => {
                    out.push(msg);
                    count += 1;
                }
                Ok(None) => {
                    return if count > 0 { Ok(count) } else { Err(Error::End) };
                }
                Err(Error::Again) => {
                    return if count > 0 { Ok(count) } else { Err(Error::Again) };
                }
                Err(err) => {
                    // Messages already accumulated are delivered now; the
                    // failure surfaces on the next call.
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
        !self.slots.is_empty() && self.slots.iter_mut().all(|s| s.iter.can_seek_beginning())
    }

    fn seek_beginning(&mut self) -> Result<(), Error> {
        for slot in &mut self.slots {
            slot.iter.seek_beginning()?;
            slot.head = None;
            slot.head_time = None;
            slot.state = SlotState::NeedsPull;
        }
        self.last_returned_ts = NO_TIME;
        self.saved_error = None;
        Ok(())
    }
}
