//! A medium concatenating the data-stream files of one stream.
//!
//! A long-running tracer rotates data files; together, in order, they
//! form one contiguous stream instance. This medium makes the list read
//! like a single medium: offsets are global across the concatenation
//! and `End` only surfaces past the last file.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracemux_runtime_core::ir::StreamClass;
use tracemux_runtime_core::message::Stream;
use tracemux_runtime_core::Error;
use tracemux_runtime_core::Value;

use crate::file_medium::FileMedium;
use crate::medium::{Medium, StreamTable};

struct Part {
    path: PathBuf,
    /// Global offset of this file's first byte.
    base: u64,
    len: u64,
}

pub struct GroupMedium {
    parts: Vec<Part>,
    total_len: u64,
    /// Index of the part the cursor is in, and the open file for it.
    current: usize,
    open: Option<FileMedium>,
    pos: u64,
    streams: StreamTable,
    name: Option<String>,
}

impl GroupMedium {
    /// Opens a group over the given files, in the given order.
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self, Error> {
        if paths.is_empty() {
            return Err(Error::InvalidArgument(
                "a stream file group needs at least one file".into(),
            ));
        }
        let mut parts = Vec::with_capacity(paths.len());
        let mut base = 0;
        for path in paths {
            let path = path.as_ref();
            let len = std::fs::metadata(path)?.len();
            parts.push(Part {
                path: path.to_path_buf(),
                base,
                len,
            });
            base += len;
        }
        let name = parts[0]
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        Ok(GroupMedium {
            parts,
            total_len: base,
            current: 0,
            open: None,
            pos: 0,
            streams: StreamTable::default(),
            name,
        })
    }

    pub fn len(&self) -> u64 {
        self.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    /// Positions `current`/`open` on the part containing `pos`.
    fn open_part_at(&mut self, pos: u64) -> Result<(), Error> {
        let index = self
            .parts
            .iter()
            .position(|p| pos >= p.base && pos < p.base + p.len)
            .expect("position inside the concatenation");
        if self.open.is_none() || self.current != index {
            self.open = Some(FileMedium::open(&self.parts[index].path)?);
            self.current = index;
        }
        let local = pos - self.parts[index].base;
        self.open
            .as_mut()
            .expect("file just opened")
            .seek(local)?;
        Ok(())
    }
}

impl Medium for GroupMedium {
    fn request_bytes(&mut self, requested_len: usize) -> Result<(Bytes, u64), Error> {
        // Empty files in the middle are legal; hop over them.
        while self.pos < self.total_len {
            self.open_part_at(self.pos)?;
            let global = self.pos;
            match self
                .open
                .as_mut()
                .expect("part opened")
                .request_bytes(requested_len)
            {
                Ok((buf, _local_offset)) => {
                    self.pos += buf.len() as u64;
                    return Ok((buf, global));
                }
                Err(Error::End) => {
                    // This part is exhausted; resume in the next one.
                    let part_end = self.parts[self.current].base + self.parts[self.current].len;
                    self.pos = part_end;
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::End)
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn seek(&mut self, offset_from_begin: u64) -> Result<(), Error> {
        if offset_from_begin > self.total_len {
            return Err(Error::InvalidArgument(format!(
                "seek offset {offset_from_begin} is past the end of the stream file group \
                 ({} bytes)",
                self.total_len
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
            .borrow(stream_class, stream_instance_id, self.name.as_deref()))
    }
}
