//! A medium over one data-stream file, memory-mapped in windows.
//!
//! The whole file is never mapped at once: a bounded window is mapped
//! at an aligned offset and slides forward as the iterator consumes.
//! Seeking drops the window and remaps on the next request.

use std::fs::File;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use memmap2::{Mmap, MmapOptions};
use tracemux_runtime_core::ir::StreamClass;
use tracemux_runtime_core::message::Stream;
use tracemux_runtime_core::Error;
use tracemux_runtime_core::Value;

use crate::medium::{Medium, StreamTable};

/// Default window size: 4 MiB.
const DEFAULT_WINDOW: usize = 4 << 20;

/// Window starts are aligned down to this, a multiple of every page
/// size in the wild, as mmap offsets must be page-aligned.
const WINDOW_ALIGN: u64 = 64 * 1024;

struct Window {
    map: Mmap,
    start: u64,
}

pub struct FileMedium {
    file: File,
    path: PathBuf,
    len: u64,
    pos: u64,
    window: Option<Window>,
    max_window: usize,
    streams: StreamTable,
}

impl FileMedium {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(FileMedium {
            file,
            path: path.to_path_buf(),
            len,
            pos: 0,
            window: None,
            max_window: DEFAULT_WINDOW,
            streams: StreamTable::default(),
        })
    }

    /// Bounds the mapped window; mostly for tests that want to see it
    /// slide. Must cover at least one alignment unit so that any
    /// position fits inside a window starting at an aligned offset.
    pub fn with_max_window(mut self, max_window: usize) -> Self {
        assert!(max_window as u64 >= WINDOW_ALIGN);
        self.max_window = max_window;
        self.window = None;
        self
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn window_covering(&mut self, pos: u64) -> Result<&Window, Error> {
        let stale = match &self.window {
            Some(w) => pos < w.start || pos >= w.start + w.map.len() as u64,
            None => true,
        };
        if stale {
            let start = pos / WINDOW_ALIGN * WINDOW_ALIGN;
            let len = (self.len - start).min(self.max_window as u64) as usize;
            let map = unsafe { MmapOptions::new().offset(start).len(len).map(&self.file)? };
            self.window = Some(Window { map, start });
        }
        Ok(self.window.as_ref().expect("window just ensured"))
    }
}

impl Medium for FileMedium {
    fn request_bytes(&mut self, requested_len: usize) -> Result<(Bytes, u64), Error> {
        if self.pos >= self.len {
            return Err(Error::End);
        }
        let pos = self.pos;
        let window = self.window_covering(pos)?;
        let in_window = (pos - window.start) as usize;
        let available = window.map.len() - in_window;
        let take = requested_len.clamp(1, available);
        let buf = Bytes::copy_from_slice(&window.map[in_window..in_window + take]);
        self.pos += take as u64;
        Ok((buf, pos))
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn seek(&mut self, offset_from_begin: u64) -> Result<(), Error> {
        if offset_from_begin > self.len {
            return Err(Error::InvalidArgument(format!(
                "seek offset {offset_from_begin} is past the end of {} ({} bytes)",
                self.path.display(),
                self.len
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
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        Ok(self
            .streams
            .borrow(stream_class, stream_instance_id, name.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn reads_the_whole_file_through_a_sliding_window() {
        // Three alignment units of data, one unit of window: the map
        // must slide twice.
        let data: Vec<u8> = (0..200_000usize).map(|i| (i % 251) as u8).collect();
        let f = temp_file(&data);
        let mut medium = FileMedium::open(f.path())
            .unwrap()
            .with_max_window(64 * 1024);

        let mut collected = Vec::new();
        loop {
            match medium.request_bytes(50_000) {
                Ok((buf, offset)) => {
                    assert_eq!(offset as usize, collected.len());
                    collected.extend_from_slice(&buf);
                }
                Err(Error::End) => break,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        assert_eq!(collected, data);
    }

    #[test]
    fn seek_rewinds() {
        let data: Vec<u8> = (0..100u8).collect();
        let f = temp_file(&data);
        let mut medium = FileMedium::open(f.path()).unwrap();

        let (_, _) = medium.request_bytes(60).unwrap();
        medium.seek(10).unwrap();
        let (buf, offset) = medium.request_bytes(5).unwrap();
        assert_eq!(offset, 10);
        assert_eq!(&buf[..], &[10, 11, 12, 13, 14]);

        assert!(medium.seek(101).is_err());
        medium.seek(100).unwrap();
        assert!(matches!(medium.request_bytes(1), Err(Error::End)));
    }
}
