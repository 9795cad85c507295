//! The medium abstraction: where a message iterator's bytes come from.
//!
//! A medium hands out buffers of at least 1 and at most the requested
//! number of bytes, tagged with their offset from the start of the
//! medium. A buffer stays valid until the next medium call for the same
//! iterator; the iterator copies whatever it must keep. `Err(Again)`
//! means "no bytes right now, retry"; `Err(End)` means the medium is
//! exhausted.

use std::collections::VecDeque;

use bytes::Bytes;
use tracemux_runtime_core::ir::StreamClass;
use tracemux_runtime_core::message::Stream;
use tracemux_runtime_core::Error;
use tracemux_runtime_core::Value;

/// A byte source consumed by one message iterator.
pub trait Medium {
    /// Returns between 1 and `requested_len` bytes, plus the byte offset
    /// of the buffer's start from the beginning of the medium.
    fn request_bytes(&mut self, requested_len: usize) -> Result<(Bytes, u64), Error>;

    fn can_seek(&self) -> bool {
        false
    }

    /// Repositions the medium. Optional; required for packet indexing
    /// and re-seeking.
    fn seek(&mut self, _offset_from_begin: u64) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    /// Maps a decoded packet header to the stream the iterator should
    /// attach subsequent messages to, lazily allocating it on first use.
    fn borrow_stream(
        &mut self,
        stream_class: &StreamClass,
        stream_instance_id: Option<u64>,
        packet_header: Option<&Value>,
    ) -> Result<Stream, Error>;
}

/// Stream instances a medium has allocated, keyed by stream class id and
/// instance id. Shared by every concrete medium here.
#[derive(Default)]
pub(crate) struct StreamTable {
    streams: Vec<((u64, Option<u64>), Stream)>,
}

impl StreamTable {
    pub(crate) fn borrow(
        &mut self,
        stream_class: &StreamClass,
        instance_id: Option<u64>,
        name: Option<&str>,
    ) -> Stream {
        let key = (stream_class.id(), instance_id);
        if let Some((_, stream)) = self.streams.iter().find(|(k, _)| *k == key) {
            return stream.clone();
        }
        let stream = Stream::new(
            stream_class.clone(),
            instance_id,
            name.map(str::to_string),
        );
        self.streams.push((key, stream.clone()));
        stream
    }
}

/// One scripted behavior of a [`BufferMedium`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStep {
    /// Serve at most this many bytes for one request.
    Give(usize),
    /// Report `Again` once.
    Again,
}

/// An in-memory medium over one buffer.
///
/// By default every request is served fully. A script can throttle it:
/// each request pops one step, either serving a bounded slice or
/// reporting `Again`, which is how the tests exercise suspension and
/// resumption mid-field.
pub struct BufferMedium {
    data: Bytes,
    pos: u64,
    script: VecDeque<BufferStep>,
    streams: StreamTable,
    stream_name: Option<String>,
}

impl BufferMedium {
    pub fn new(data: impl Into<Bytes>) -> Self {
        BufferMedium {
            data: data.into(),
            pos: 0,
            script: VecDeque::new(),
            streams: StreamTable::default(),
            stream_name: None,
        }
    }

    pub fn with_script(mut self, script: impl IntoIterator<Item = BufferStep>) -> Self {
        self.script = script.into_iter().collect();
        self
    }

    pub fn with_stream_name(mut self, name: impl Into<String>) -> Self {
        self.stream_name = Some(name.into());
        self
    }
}

impl Medium for BufferMedium {
    fn request_bytes(&mut self, requested_len: usize) -> Result<(Bytes, u64), Error> {
        let mut limit = requested_len;
        match self.script.pop_front() {
            Some(BufferStep::Again) => return Err(Error::Again),
            Some(BufferStep::Give(n)) => limit = limit.min(n),
            None => {}
        }
        if self.pos >= self.data.len() as u64 {
            return Err(Error::End);
        }
        let start = self.pos as usize;
        let end = (start + limit.max(1)).min(self.data.len());
        let buf = self.data.slice(start..end);
        let offset = self.pos;
        self.pos = end as u64;
        Ok((buf, offset))
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn seek(&mut self, offset_from_begin: u64) -> Result<(), Error> {
        if offset_from_begin > self.data.len() as u64 {
            return Err(Error::InvalidArgument(format!(
                "seek offset {offset_from_begin} is past the end of the buffer"
            )));
        }
        self.pos = offset_from_begin;
        Ok(())
    }

    fn borrow_stream(
        &mut self,
        stream_class: &StreamClass,
        stream_instance_id: Option<u64>,
        _packet_header: Option<&Value>,
    ) -> Result<Stream, Error> {
        Ok(self
            .streams
            .borrow(stream_class, stream_instance_id, self.stream_name.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tracemux_runtime_core::ir::TraceClass;

    #[test]
    fn scripted_buffer_serves_then_stalls_then_resumes() {
        let mut medium = BufferMedium::new(vec![1u8, 2, 3, 4, 5])
            .with_script([BufferStep::Give(2), BufferStep::Again]);

        let (buf, offset) = medium.request_bytes(16).unwrap();
        assert_eq!(&buf[..], &[1, 2]);
        assert_eq!(offset, 0);

        assert_matches!(medium.request_bytes(16), Err(Error::Again));

        let (buf, offset) = medium.request_bytes(16).unwrap();
        assert_eq!(&buf[..], &[3, 4, 5]);
        assert_eq!(offset, 2);

        assert_matches!(medium.request_bytes(16), Err(Error::End));
    }

    #[test]
    fn borrow_stream_returns_one_instance_per_id() {
        let tc = TraceClass::new();
        let sc = tc.add_stream_class(0).unwrap();
        let mut medium = BufferMedium::new(Vec::new());
        let a = medium.borrow_stream(&sc, Some(1), None).unwrap();
        let b = medium.borrow_stream(&sc, Some(1), None).unwrap();
        let c = medium.borrow_stream(&sc, Some(2), None).unwrap();
        assert!(a.same_stream(&b));
        assert!(!a.same_stream(&c));
    }
}
