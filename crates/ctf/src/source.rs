//! The trace file source component.
//!
//! One component wraps one trace: each data stream (an ordered group of
//! files sharing a stream instance) becomes one output port, whose
//! iterators decode through a [`GroupMedium`]. When indexing is on, a
//! packet index is built per stream and run through the producer-bug
//! fixups, which also enables time seeks.

use std::path::PathBuf;

use anyhow::Context as _;
use tracemux_runtime_core::graph::{ComponentCtx, MessageIterator, SourceComponent};
use tracemux_runtime_core::ir::TraceClass;
use tracemux_runtime_core::{Error, Value};

use crate::group_medium::GroupMedium;
use crate::index::PacketIndex;
use crate::iterator::MsgIter;
use crate::medium::Medium;
use crate::quirks;

pub const CLASS_NAME: &str = "src.trace.files";

#[derive(Debug)]
struct StreamFiles {
    port_name: String,
    paths: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct TraceFileSource {
    trace: TraceClass,
    inputs: Vec<StreamFiles>,
    indexed: bool,
}

impl TraceFileSource {
    pub fn builder(trace: TraceClass) -> TraceFileSourceBuilder {
        TraceFileSourceBuilder {
            trace,
            inputs: Vec::new(),
            indexed: true,
        }
    }
}

pub struct TraceFileSourceBuilder {
    trace: TraceClass,
    inputs: Vec<StreamFiles>,
    indexed: bool,
}

impl TraceFileSourceBuilder {
    /// Adds one data stream: an output port named `port_name` over the
    /// given files, concatenated in order.
    pub fn add_stream(
        mut self,
        port_name: impl Into<String>,
        paths: Vec<PathBuf>,
    ) -> Self {
        self.inputs.push(StreamFiles {
            port_name: port_name.into(),
            paths,
        });
        self
    }

    /// Disables packet indexing (and therefore time seeks).
    pub fn without_index(mut self) -> Self {
        self.indexed = false;
        self
    }

    pub fn build(self) -> anyhow::Result<TraceFileSource> {
        anyhow::ensure!(
            !self.inputs.is_empty(),
            "a trace file source needs at least one data stream"
        );
        for input in &self.inputs {
            anyhow::ensure!(
                !input.paths.is_empty(),
                "data stream `{}` has no files",
                input.port_name
            );
            for path in &input.paths {
                std::fs::metadata(path).with_context(|| {
                    format!("cannot open data stream file {}", path.display())
                })?;
            }
        }
        Ok(TraceFileSource {
            trace: self.trace,
            inputs: self.inputs,
            indexed: self.indexed,
        })
    }
}

impl SourceComponent for TraceFileSource {
    fn initialize(&mut self, ctx: &ComponentCtx, _params: &Value) -> Result<(), Error> {
        for input in &self.inputs {
            ctx.add_output_port(&input.port_name)?;
        }
        Ok(())
    }

    /// `trace-infos`: one entry per data stream, with its port name and
    /// file count.
    fn query(&self, object: &str, _params: &Value) -> Result<Value, Error> {
        match object {
            "trace-infos" => {
                let infos = Value::new_array();
                for input in &self.inputs {
                    let info = Value::new_map();
                    info.map_insert("port-name", Value::string(input.port_name.clone()))
                        .expect("fresh map");
                    info.map_insert("file-count", Value::uint(input.paths.len() as u64))
                        .expect("fresh map");
                    infos.array_push(info).expect("fresh array");
                }
                Ok(infos)
            }
            _ => Err(Error::Unsupported),
        }
    }

    fn create_iterator(
        &mut self,
        ctx: &ComponentCtx,
        output_port: &str,
    ) -> Result<Box<dyn MessageIterator>, Error> {
        let input = self
            .inputs
            .iter()
            .find(|i| i.port_name == output_port)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "`{}` has no output port named `{output_port}`",
                    ctx.name()
                ))
            })?;

        let medium = GroupMedium::open(&input.paths)?;
        let mut iter = MsgIter::new(Box::new(medium), self.trace.clone());

        if self.indexed {
            let scan = GroupMedium::open(&input.paths)?;
            match PacketIndex::build(Box::new(scan), &self.trace) {
                Ok(mut index) => {
                    let paths = input.paths.clone();
                    quirks::fix_packet_index(&mut index, &self.trace, move || {
                        Ok(Box::new(GroupMedium::open(&paths)?) as Box<dyn Medium>)
                    })?;
                    iter = iter.with_index(index);
                }
                // Packets without declared sizes cannot be indexed;
                // decoding still works, only seeks are off.
                Err(Error::Unsupported) => {
                    log::debug!(
                        "`{}`: stream `{output_port}` is not indexable",
                        ctx.name()
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(Box::new(iter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdata::{build_trace_class, encode_stream, EventSpec, PacketSpec};
    use std::io::Write;
    use tracemux_runtime_core::graph::{Graph, SimpleSink};
    use tracemux_runtime_core::message::MessageKind;
    use tracemux_runtime_core::mux::Muxer;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn write_stream(dir: &std::path::Path, name: &str, packets: &[PacketSpec]) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&encode_stream(packets)).unwrap();
        path
    }

    #[test]
    fn builder_rejects_missing_files() {
        let (tc, _) = build_trace_class(false);
        let err = TraceFileSource::builder(tc)
            .add_stream("s", vec![PathBuf::from("/nonexistent/stream")])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("cannot open data stream file"));
    }

    /// Checks the per-stream message grammar:
    /// `SB (PB E* PE | DE | DP)* SE`.
    fn assert_bracketing(messages: &[(String, MessageKind)]) {
        use MessageKind::*;
        let mut streams: std::collections::HashMap<&str, (bool, bool, bool)> =
            std::collections::HashMap::new();
        for (stream, kind) in messages {
            let (began, ended, in_packet) = streams
                .entry(stream.as_str())
                .or_insert((false, false, false));
            assert!(!*ended, "stream {stream}: message after its end");
            match kind {
                StreamBeginning => {
                    assert!(!*began, "stream {stream}: double beginning");
                    *began = true;
                }
                StreamEnd => {
                    assert!(*began && !*in_packet, "stream {stream}: bad end");
                    *ended = true;
                }
                PacketBeginning => {
                    assert!(*began && !*in_packet, "stream {stream}: nested packet");
                    *in_packet = true;
                }
                PacketEnd => {
                    assert!(*in_packet, "stream {stream}: packet end without begin");
                    *in_packet = false;
                }
                Event => assert!(*in_packet, "stream {stream}: event outside a packet"),
                DiscardedEvents | DiscardedPackets | Inactivity => {
                    assert!(*began && !*in_packet, "stream {stream}: gap inside a packet");
                }
            }
        }
        for (stream, (began, ended, _)) in streams {
            assert!(began && ended, "stream {stream}: unterminated");
        }
    }

    #[test]
    fn multi_packet_streams_keep_the_bracketing_grammar_through_the_mux() {
        let dir = tempfile::tempdir().unwrap();
        let (tc, _clock) = build_trace_class(false);

        // Two streams, two packets each, one with discarded counters.
        let mut a2 = PacketSpec::new(60, 80, vec![EventSpec::Alpha { ts: 65, value: 2 }]);
        a2.events_discarded = 2;
        a2.seq_num = 3;
        let a = write_stream(
            dir.path(),
            "a",
            &[
                {
                    let mut p = PacketSpec::new(
                        10,
                        30,
                        vec![
                            EventSpec::Alpha { ts: 12, value: 1 },
                            EventSpec::Beta { ts: 25, msg: "x" },
                        ],
                    );
                    p.padding = 7;
                    p.seq_num = 0;
                    p
                },
                a2,
            ],
        );
        let b = write_stream(
            dir.path(),
            "b",
            &[
                PacketSpec::new(5, 20, vec![EventSpec::Alpha { ts: 8, value: 3 }]),
                PacketSpec::new(40, 90, vec![EventSpec::Alpha { ts: 55, value: 4 }]),
            ],
        );

        let source = TraceFileSource::builder(tc)
            .add_stream("a", vec![a])
            .add_stream("b", vec![b])
            .build()
            .unwrap();

        let mut graph = Graph::new();
        let src = graph
            .add_source_component(CLASS_NAME, "trace", source, &Value::new_map(), log::LevelFilter::Warn)
            .unwrap();
        let mux = graph
            .add_filter_component(
                tracemux_runtime_core::mux::CLASS_NAME,
                "mux",
                Muxer::new(),
                &Value::new_map(),
                log::LevelFilter::Warn,
            )
            .unwrap();
        for (index, port) in ["a", "b"].into_iter().enumerate() {
            graph
                .connect_ports(
                    graph.output_port(src, port).unwrap(),
                    graph.input_port(mux, &format!("in{index}")).unwrap(),
                )
                .unwrap();
        }

        let seen: Rc<RefCell<Vec<(String, MessageKind, Option<i64>)>>> =
            Rc::new(RefCell::new(Vec::new()));
        let seen2 = Rc::clone(&seen);
        let sink = graph
            .add_sink_component(
                "sink.simple",
                "sink",
                SimpleSink::new(
                    None,
                    Box::new(move |iter| {
                        let mut batch = Vec::new();
                        let count = iter.next(&mut batch, 5)?;
                        for msg in batch.drain(..count) {
                            let stream = msg
                                .stream()
                                .and_then(|s| s.name().map(str::to_string))
                                .unwrap_or_default();
                            let ns = msg.snapshot().map(|s| s.ns_from_origin().unwrap());
                            seen2.borrow_mut().push((stream, msg.kind(), ns));
                        }
                        Ok(())
                    }),
                    None,
                ),
                &Value::new_map(),
                log::LevelFilter::Warn,
            )
            .unwrap();
        graph
            .connect_ports(
                graph.output_port(mux, "out").unwrap(),
                graph.input_port(sink, "in").unwrap(),
            )
            .unwrap();
        graph.run().unwrap();

        let seen = seen.borrow();
        // The merged output is monotonic and a discarded-events message
        // survived the merge.
        let times: Vec<i64> = seen.iter().filter_map(|(_, _, ns)| *ns).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]), "{times:?}");
        assert!(seen
            .iter()
            .any(|(_, kind, _)| *kind == MessageKind::DiscardedEvents));
        assert!(seen
            .iter()
            .any(|(_, kind, _)| *kind == MessageKind::DiscardedPackets));

        let tagged: Vec<(String, MessageKind)> = seen
            .iter()
            .map(|(stream, kind, _)| (stream.clone(), *kind))
            .collect();
        assert_bracketing(&tagged);
    }

    #[test]
    fn two_files_merge_through_the_graph_in_time_order() {
        let dir = tempfile::tempdir().unwrap();
        let (tc, _clock) = build_trace_class(false);

        let a = write_stream(
            dir.path(),
            "stream-a",
            &[PacketSpec::new(
                10,
                20,
                vec![
                    EventSpec::Alpha { ts: 12, value: 1 },
                    EventSpec::Alpha { ts: 18, value: 2 },
                ],
            )],
        );
        let b = write_stream(
            dir.path(),
            "stream-b",
            &[PacketSpec::new(
                5,
                16,
                vec![
                    EventSpec::Alpha { ts: 5, value: 3 },
                    EventSpec::Beta { ts: 15, msg: "hey" },
                ],
            )],
        );

        let source = TraceFileSource::builder(tc)
            .add_stream("a", vec![a])
            .add_stream("b", vec![b])
            .build()
            .unwrap();

        let mut graph = Graph::new();
        let src = graph
            .add_source_component(
                CLASS_NAME,
                "trace",
                source,
                &Value::new_map(),
                log::LevelFilter::Warn,
            )
            .unwrap();
        let mux = graph
            .add_filter_component(
                tracemux_runtime_core::mux::CLASS_NAME,
                "mux",
                Muxer::new(),
                &Value::new_map(),
                log::LevelFilter::Warn,
            )
            .unwrap();
        graph
            .connect_ports(
                graph.output_port(src, "a").unwrap(),
                graph.input_port(mux, "in0").unwrap(),
            )
            .unwrap();
        graph
            .connect_ports(
                graph.output_port(src, "b").unwrap(),
                graph.input_port(mux, "in1").unwrap(),
            )
            .unwrap();

        let seen: Rc<RefCell<Vec<(MessageKind, Option<i64>)>>> = Rc::new(RefCell::new(Vec::new()));
        let seen2 = Rc::clone(&seen);
        let sink = graph
            .add_sink_component(
                "sink.simple",
                "sink",
                SimpleSink::new(
                    None,
                    Box::new(move |iter| {
                        let mut batch = Vec::new();
                        let count = iter.next(&mut batch, 8)?;
                        for msg in batch.drain(..count) {
                            let ns = msg.snapshot().map(|s| s.ns_from_origin().unwrap());
                            seen2.borrow_mut().push((msg.kind(), ns));
                        }
                        Ok(())
                    }),
                    None,
                ),
                &Value::new_map(),
                log::LevelFilter::Warn,
            )
            .unwrap();
        graph
            .connect_ports(
                graph.output_port(mux, "out").unwrap(),
                graph.input_port(sink, "in").unwrap(),
            )
            .unwrap();

        graph.run().unwrap();

        let events: Vec<i64> = seen
            .borrow()
            .iter()
            .filter(|(kind, _)| *kind == MessageKind::Event)
            .map(|(_, ns)| ns.unwrap())
            .collect();
        assert_eq!(events, vec![5, 12, 15, 18]);

        // Bracketing survived the merge: each stream begins once, ends
        // once, and the merged times never decrease.
        let kinds: Vec<MessageKind> = seen.borrow().iter().map(|(k, _)| *k).collect();
        assert_eq!(
            kinds
                .iter()
                .filter(|k| **k == MessageKind::StreamBeginning)
                .count(),
            2
        );
        assert_eq!(
            kinds
                .iter()
                .filter(|k| **k == MessageKind::StreamEnd)
                .count(),
            2
        );
        let times: Vec<i64> = seen.borrow().iter().filter_map(|(_, ns)| *ns).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]), "{times:?}");
    }
}
