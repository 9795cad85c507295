//! The graph runtime: components, ports, connections and the pull
//! scheduler.
//!
//! A graph owns a set of components wired by connections between output
//! and input ports, and advances them by asking sinks to consume. All of
//! it is single-threaded and cooperative: every callback, iterator `next`
//! and listener dispatch runs serialized on the caller's thread.
//!
//! Message iterators are created on demand when a sink first consumes:
//! creating an iterator on an input port asks the upstream component for
//! one, and a filter's iterator in turn creates iterators on the filter's
//! own input ports. Each connection carries an iterator *factory* so this
//! recursion also works for ports connected after the graph started
//! running.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::append_error_cause;
use crate::error::Error;
use crate::message::Message;
use crate::values::Value;

pub mod simple_sink;

pub use simple_sink::SimpleSink;

// === Message iterators ===

/// A pull iterator over messages.
///
/// `next` appends at least one and at most `capacity` messages to `out`,
/// in FIFO order, and returns how many it appended. `Err(Again)` means
/// "retry later, nothing changed"; `Err(End)` is terminal.
pub trait MessageIterator {
    fn next(&mut self, out: &mut Vec<Message>, capacity: usize) -> Result<usize, Error>;

    fn can_seek_beginning(&mut self) -> bool {
        false
    }

    fn seek_beginning(&mut self) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    fn can_seek_ns_from_origin(&mut self, _ns_from_origin: i64) -> bool {
        false
    }

    fn seek_ns_from_origin(&mut self, _ns_from_origin: i64) -> Result<(), Error> {
        Err(Error::Unsupported)
    }
}

// === Ports ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Input,
    Output,
}

/// Identifies one port of one component in its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRef {
    pub component: CompId,
    pub kind: PortKind,
    pub index: usize,
}

struct Port {
    name: String,
    peer: Option<PortRef>,
}

#[derive(Default)]
struct PortSet {
    inputs: Vec<Port>,
    outputs: Vec<Port>,
}

impl PortSet {
    fn list(&self, kind: PortKind) -> &Vec<Port> {
        match kind {
            PortKind::Input => &self.inputs,
            PortKind::Output => &self.outputs,
        }
    }

    fn list_mut(&mut self, kind: PortKind) -> &mut Vec<Port> {
        match kind {
            PortKind::Input => &mut self.inputs,
            PortKind::Output => &mut self.outputs,
        }
    }
}

/// A port that appeared in the graph; handed to port-added listeners.
#[derive(Debug, Clone)]
pub struct PortAdded {
    pub port: PortRef,
    pub component_name: String,
    pub port_name: String,
}

// === Components ===

pub type CompId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Source,
    Filter,
    Sink,
}

/// The capability handle a component receives in its callbacks. Cloning
/// it is cheap; a component may keep a clone to add ports later (a
/// source discovering a new data stream mid-run does exactly that).
#[derive(Clone)]
pub struct ComponentCtx {
    component: CompId,
    name: Rc<str>,
    class_name: Rc<str>,
    log_level: log::LevelFilter,
    ports: Rc<RefCell<PortSet>>,
    shared: Rc<RefCell<GraphShared>>,
}

impl ComponentCtx {
    pub fn component_id(&self) -> CompId {
        self.component
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.log_level
    }

    pub fn add_input_port(&self, name: &str) -> Result<PortRef, Error> {
        self.add_port(PortKind::Input, name)
    }

    pub fn add_output_port(&self, name: &str) -> Result<PortRef, Error> {
        self.add_port(PortKind::Output, name)
    }

    fn add_port(&self, kind: PortKind, name: &str) -> Result<PortRef, Error> {
        let mut ports = self.ports.borrow_mut();
        let list = ports.list_mut(kind);
        if list.iter().any(|p| p.name == name) {
            return Err(Error::InvalidArgument(format!(
                "component `{}` already has a {kind:?} port named `{name}`",
                self.name
            )));
        }
        let port = PortRef {
            component: self.component,
            kind,
            index: list.len(),
        };
        list.push(Port {
            name: name.to_string(),
            peer: None,
        });
        log::debug!(
            "component `{}`: added {kind:?} port `{name}`",
            self.name
        );
        // Listener dispatch is deferred until the current callback
        // returns; nested adds are therefore seen in BFS order.
        self.shared.borrow_mut().deferred.push_back(PortAdded {
            port,
            component_name: self.name.to_string(),
            port_name: name.to_string(),
        });
        Ok(port)
    }
}

/// One upstream connection of a filter or sink: the name of the local
/// input port and a factory creating a fresh iterator over whatever is
/// connected to it.
pub struct UpstreamConn {
    input_port: String,
    factory: IterFactory,
}

type IterFactory = Rc<dyn Fn() -> Result<Box<dyn MessageIterator>, Error>>;

impl UpstreamConn {
    /// Builds an upstream connection from an explicit factory. The graph
    /// does this when ports are connected; standalone filter drivers
    /// (and tests) can do it by hand.
    pub fn new<F>(input_port: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn MessageIterator>, Error> + 'static,
    {
        UpstreamConn {
            input_port: input_port.into(),
            factory: Rc::new(factory),
        }
    }

    pub fn input_port(&self) -> &str {
        &self.input_port
    }

    pub fn create_iterator(&self) -> Result<Box<dyn MessageIterator>, Error> {
        (self.factory)()
    }
}

/// The shared, lazily growing list of a component's upstream
/// connections. Filters capture it when creating their iterator so that
/// ports connected later still feed the same iterator.
pub type UpstreamSet = Rc<RefCell<Vec<UpstreamConn>>>;

/// The handle a sink receives while consuming.
pub struct ConsumeCtx {
    name: Rc<str>,
    upstreams: UpstreamSet,
}

impl ConsumeCtx {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates a message iterator on the named (connected) input port.
    pub fn create_iterator(&self, input_port: &str) -> Result<Box<dyn MessageIterator>, Error> {
        let upstreams = self.upstreams.borrow();
        let conn = upstreams
            .iter()
            .find(|c| c.input_port == input_port)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "sink `{}`: input port `{input_port}` is not connected",
                    self.name
                ))
            })?;
        conn.create_iterator()
    }
}

/// A source component: produces messages on its output ports.
pub trait SourceComponent {
    fn initialize(&mut self, ctx: &ComponentCtx, params: &Value) -> Result<(), Error>;

    fn finalize(&mut self) {}

    fn output_port_connected(&mut self, _ctx: &ComponentCtx, _port: &str) -> Result<(), Error> {
        Ok(())
    }

    fn query(&self, _object: &str, _params: &Value) -> Result<Value, Error> {
        Err(Error::Unsupported)
    }

    fn create_iterator(
        &mut self,
        ctx: &ComponentCtx,
        output_port: &str,
    ) -> Result<Box<dyn MessageIterator>, Error>;
}

/// A filter component: consumes from its input ports, produces on its
/// output ports.
pub trait FilterComponent {
    fn initialize(&mut self, ctx: &ComponentCtx, params: &Value) -> Result<(), Error>;

    fn finalize(&mut self) {}

    fn input_port_connected(&mut self, _ctx: &ComponentCtx, _port: &str) -> Result<(), Error> {
        Ok(())
    }

    fn output_port_connected(&mut self, _ctx: &ComponentCtx, _port: &str) -> Result<(), Error> {
        Ok(())
    }

    fn query(&self, _object: &str, _params: &Value) -> Result<Value, Error> {
        Err(Error::Unsupported)
    }

    fn create_iterator(
        &mut self,
        ctx: &ComponentCtx,
        output_port: &str,
        upstreams: &UpstreamSet,
    ) -> Result<Box<dyn MessageIterator>, Error>;
}

/// A sink component: drives the pipeline by consuming messages.
pub trait SinkComponent {
    fn initialize(&mut self, ctx: &ComponentCtx, params: &Value) -> Result<(), Error>;

    fn finalize(&mut self) {}

    fn input_port_connected(&mut self, _ctx: &ComponentCtx, _port: &str) -> Result<(), Error> {
        Ok(())
    }

    /// Consumes a batch of messages. `Err(End)` means this sink is done;
    /// `Err(Again)` means it could not make progress yet.
    fn consume(&mut self, ctx: &mut ConsumeCtx) -> Result<(), Error>;
}

enum Logic {
    Source(Rc<RefCell<dyn SourceComponent>>),
    Filter(Rc<RefCell<dyn FilterComponent>>),
    Sink(Rc<RefCell<dyn SinkComponent>>),
}

struct ComponentEntry {
    name: Rc<str>,
    class_name: Rc<str>,
    logic: Logic,
    ports: Rc<RefCell<PortSet>>,
    upstreams: UpstreamSet,
    ctx: ComponentCtx,
}

// === Graph ===

#[derive(Default)]
struct GraphShared {
    deferred: VecDeque<PortAdded>,
}

type Listener = Box<dyn FnMut(&mut Graph, &PortAdded) -> Result<(), Error>>;

/// Opaque id of a registered port-added listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(PortKind, usize);

/// Identifies one connection of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionId(usize);

#[derive(Default)]
pub struct Graph {
    components: Vec<ComponentEntry>,
    connections: Vec<(PortRef, PortRef)>,
    sink_queue: VecDeque<CompId>,
    sinks_added: usize,
    input_listeners: Vec<Option<Listener>>,
    output_listeners: Vec<Option<Listener>>,
    shared: Rc<RefCell<GraphShared>>,
    faulty: bool,
}

impl Graph {
    pub fn new() -> Self {
        Graph::default()
    }

    fn check_usable(&self) -> Result<(), Error> {
        if self.faulty {
            return Err(Error::InvalidArgument(
                "graph is in a faulty state from a previous error".into(),
            ));
        }
        Ok(())
    }

    fn check_name_free(&self, name: &str) -> Result<(), Error> {
        if self.components.iter().any(|c| &*c.name == name) {
            return Err(Error::InvalidArgument(format!(
                "graph already contains a component named `{name}`"
            )));
        }
        Ok(())
    }

    fn push_entry(
        &mut self,
        class_name: &str,
        name: &str,
        logic: Logic,
        log_level: log::LevelFilter,
    ) -> CompId {
        let id = self.components.len();
        let ports = Rc::new(RefCell::new(PortSet::default()));
        let name: Rc<str> = name.into();
        let class_name: Rc<str> = class_name.into();
        let ctx = ComponentCtx {
            component: id,
            name: Rc::clone(&name),
            class_name: Rc::clone(&class_name),
            log_level,
            ports: Rc::clone(&ports),
            shared: Rc::clone(&self.shared),
        };
        self.components.push(ComponentEntry {
            name,
            class_name,
            logic,
            ports,
            upstreams: Rc::new(RefCell::new(Vec::new())),
            ctx,
        });
        id
    }

    fn initialize_component(&mut self, id: CompId, params: &Value) -> Result<(), Error> {
        let entry = &self.components[id];
        let ctx = entry.ctx.clone();
        let result = match &entry.logic {
            Logic::Source(logic) => {
                let logic = Rc::clone(logic);
                let result = logic.borrow_mut().initialize(&ctx, params);
                result
            }
            Logic::Filter(logic) => {
                let logic = Rc::clone(logic);
                let result = logic.borrow_mut().initialize(&ctx, params);
                result
            }
            Logic::Sink(logic) => {
                let logic = Rc::clone(logic);
                let result = logic.borrow_mut().initialize(&ctx, params);
                result
            }
        };
        if let Err(err) = result {
            if !err.is_status() {
                append_error_cause!(
                    &*self.components[id].name,
                    &*self.components[id].class_name,
                    "component initialization failed: {err}"
                );
            }
            return Err(err);
        }
        self.dispatch_deferred()
    }

    pub fn add_source_component<C>(
        &mut self,
        class_name: &str,
        name: &str,
        component: C,
        params: &Value,
        log_level: log::LevelFilter,
    ) -> Result<CompId, Error>
    where
        C: SourceComponent + 'static,
    {
        self.check_usable()?;
        self.check_name_free(name)?;
        let id = self.push_entry(
            class_name,
            name,
            Logic::Source(Rc::new(RefCell::new(component))),
            log_level,
        );
        self.initialize_component(id, params)?;
        Ok(id)
    }

    pub fn add_filter_component<C>(
        &mut self,
        class_name: &str,
        name: &str,
        component: C,
        params: &Value,
        log_level: log::LevelFilter,
    ) -> Result<CompId, Error>
    where
        C: FilterComponent + 'static,
    {
        self.check_usable()?;
        self.check_name_free(name)?;
        let id = self.push_entry(
            class_name,
            name,
            Logic::Filter(Rc::new(RefCell::new(component))),
            log_level,
        );
        self.initialize_component(id, params)?;
        Ok(id)
    }

    pub fn add_sink_component<C>(
        &mut self,
        class_name: &str,
        name: &str,
        component: C,
        params: &Value,
        log_level: log::LevelFilter,
    ) -> Result<CompId, Error>
    where
        C: SinkComponent + 'static,
    {
        self.check_usable()?;
        self.check_name_free(name)?;
        let id = self.push_entry(
            class_name,
            name,
            Logic::Sink(Rc::new(RefCell::new(component))),
            log_level,
        );
        self.initialize_component(id, params)?;
        self.sink_queue.push_back(id);
        self.sinks_added += 1;
        Ok(id)
    }

    pub fn component_name(&self, id: CompId) -> Option<&str> {
        self.components.get(id).map(|c| &*c.name)
    }

    pub(crate) fn component_ctx(&self, id: CompId) -> Option<ComponentCtx> {
        self.components.get(id).map(|c| c.ctx.clone())
    }

    pub fn component_by_name(&self, name: &str) -> Option<CompId> {
        self.components.iter().position(|c| &*c.name == name)
    }

    fn port_ref(&self, component: CompId, kind: PortKind, name: &str) -> Option<PortRef> {
        let entry = self.components.get(component)?;
        let ports = entry.ports.borrow();
        let index = ports.list(kind).iter().position(|p| p.name == name)?;
        Some(PortRef {
            component,
            kind,
            index,
        })
    }

    pub fn input_port(&self, component: CompId, name: &str) -> Option<PortRef> {
        self.port_ref(component, PortKind::Input, name)
    }

    pub fn output_port(&self, component: CompId, name: &str) -> Option<PortRef> {
        self.port_ref(component, PortKind::Output, name)
    }

    pub fn port_name(&self, port: PortRef) -> Option<String> {
        let entry = self.components.get(port.component)?;
        let ports = entry.ports.borrow();
        ports.list(port.kind).get(port.index).map(|p| p.name.clone())
    }

    fn port_peer(&self, port: PortRef) -> Option<PortRef> {
        let entry = &self.components[port.component];
        let ports = entry.ports.borrow();
        ports.list(port.kind)[port.index].peer
    }

    fn set_port_peer(&self, port: PortRef, peer: Option<PortRef>) {
        let entry = &self.components[port.component];
        let mut ports = entry.ports.borrow_mut();
        ports.list_mut(port.kind)[port.index].peer = peer;
    }

    /// Builds the iterator factory for a connection whose upstream end is
    /// `output`.
    fn make_factory(&self, output: PortRef) -> Result<IterFactory, Error> {
        let entry = &self.components[output.component];
        let port_name = self
            .port_name(output)
            .expect("validated output port has a name");
        let ctx = entry.ctx.clone();
        match &entry.logic {
            Logic::Source(logic) => {
                let logic = Rc::clone(logic);
                Ok(Rc::new(move || {
                    logic.borrow_mut().create_iterator(&ctx, &port_name)
                }))
            }
            Logic::Filter(logic) => {
                let logic = Rc::clone(logic);
                let upstreams = Rc::clone(&entry.upstreams);
                Ok(Rc::new(move || {
                    logic
                        .borrow_mut()
                        .create_iterator(&ctx, &port_name, &upstreams)
                }))
            }
            Logic::Sink(_) => Err(Error::InvalidArgument(
                "a sink component has no output ports".into(),
            )),
        }
    }

    /// Connects an output port to an input port.
    ///
    /// Both ports must be unconnected. After the link is established, the
    /// upstream component's `output_port_connected` runs first, then the
    /// downstream component's `input_port_connected`; a failure in either
    /// tears the connection down and propagates.
    pub fn connect_ports(&mut self, output: PortRef, input: PortRef) -> Result<ConnectionId, Error> {
        self.check_usable()?;
        if output.kind != PortKind::Output || input.kind != PortKind::Input {
            return Err(Error::InvalidArgument(
                "connect_ports requires an output port and an input port".into(),
            ));
        }
        let (Some(out_name), Some(in_name)) = (self.port_name(output), self.port_name(input))
        else {
            return Err(Error::InvalidArgument(
                "port does not belong to this graph".into(),
            ));
        };
        if self.port_peer(output).is_some() {
            return Err(Error::InvalidArgument(format!(
                "output port `{out_name}` is already connected"
            )));
        }
        if self.port_peer(input).is_some() {
            return Err(Error::InvalidArgument(format!(
                "input port `{in_name}` is already connected"
            )));
        }

        self.set_port_peer(output, Some(input));
        self.set_port_peer(input, Some(output));

        let factory = self.make_factory(output)?;
        let down_entry = &self.components[input.component];
        down_entry.upstreams.borrow_mut().push(UpstreamConn {
            input_port: in_name.clone(),
            factory,
        });

        let teardown = |graph: &mut Graph| {
            graph.set_port_peer(output, None);
            graph.set_port_peer(input, None);
            let entry = &graph.components[input.component];
            entry.upstreams.borrow_mut().pop();
        };

        // Upstream side first.
        let up_entry = &self.components[output.component];
        let up_ctx = up_entry.ctx.clone();
        let up_result = match &up_entry.logic {
            Logic::Source(logic) => {
                let logic = Rc::clone(logic);
                let result = logic.borrow_mut().output_port_connected(&up_ctx, &out_name);
                result
            }
            Logic::Filter(logic) => {
                let logic = Rc::clone(logic);
                let result = logic.borrow_mut().output_port_connected(&up_ctx, &out_name);
                result
            }
            Logic::Sink(_) => unreachable!("validated output port"),
        };
        if let Err(err) = up_result {
            if !err.is_status() {
                append_error_cause!(
                    &*self.components[output.component].name,
                    &*self.components[output.component].class_name,
                    "output port connection callback failed: {err}"
                );
            }
            teardown(self);
            return Err(err);
        }

        // Then the downstream side.
        let down_entry = &self.components[input.component];
        let down_ctx = down_entry.ctx.clone();
        let down_result = match &down_entry.logic {
            Logic::Filter(logic) => {
                let logic = Rc::clone(logic);
                let result = logic.borrow_mut().input_port_connected(&down_ctx, &in_name);
                result
            }
            Logic::Sink(logic) => {
                let logic = Rc::clone(logic);
                let result = logic.borrow_mut().input_port_connected(&down_ctx, &in_name);
                result
            }
            Logic::Source(_) => {
                teardown(self);
                return Err(Error::InvalidArgument(
                    "a source component has no input ports".into(),
                ));
            }
        };
        if let Err(err) = down_result {
            if !err.is_status() {
                append_error_cause!(
                    &*self.components[input.component].name,
                    &*self.components[input.component].class_name,
                    "input port connection callback failed: {err}"
                );
            }
            teardown(self);
            return Err(err);
        }

        let id = ConnectionId(self.connections.len());
        self.connections.push((output, input));
        log::debug!(
            "connected `{}`.`{out_name}` -> `{}`.`{in_name}`",
            self.components[output.component].name,
            self.components[input.component].name,
        );
        self.dispatch_deferred()?;
        Ok(id)
    }

    /// Registers a listener invoked once for every input port that
    /// appears in the graph from now on. Listeners run in registration
    /// order, after the callback that added the port returns.
    pub fn add_input_port_added_listener<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&mut Graph, &PortAdded) -> Result<(), Error> + 'static,
    {
        self.input_listeners.push(Some(Box::new(listener)));
        ListenerId(PortKind::Input, self.input_listeners.len() - 1)
    }

    pub fn add_output_port_added_listener<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&mut Graph, &PortAdded) -> Result<(), Error> + 'static,
    {
        self.output_listeners.push(Some(Box::new(listener)));
        ListenerId(PortKind::Output, self.output_listeners.len() - 1)
    }

    /// Dispatches deferred port-added events to the listeners, in the
    /// order the ports were added.
    fn dispatch_deferred(&mut self) -> Result<(), Error> {
        loop {
            let event = self.shared.borrow_mut().deferred.pop_front();
            let Some(event) = event else { break };
            let count = match event.port.kind {
                PortKind::Input => self.input_listeners.len(),
                PortKind::Output => self.output_listeners.len(),
            };
            for i in 0..count {
                // Take the listener out so it can borrow the graph.
                let taken = match event.port.kind {
                    PortKind::Input => self.input_listeners[i].take(),
                    PortKind::Output => self.output_listeners[i].take(),
                };
                let Some(mut listener) = taken else { continue };
                let result = listener(self, &event);
                match event.port.kind {
                    PortKind::Input => self.input_listeners[i] = Some(listener),
                    PortKind::Output => self.output_listeners[i] = Some(listener),
                }
                if let Err(err) = result {
                    if !err.is_status() {
                        append_error_cause!(-, "port-added listener failed: {err}");
                    }
                    self.faulty = true;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Advances the graph by one sink consume call.
    ///
    /// `Err(Again)` re-queues the sink at the tail; `Err(End)` means every
    /// sink has finished.
    pub fn run_once(&mut self) -> Result<(), Error> {
        self.check_usable()?;
        if self.sinks_added == 0 {
            return Err(Error::InvalidArgument(
                "graph has no sink component".into(),
            ));
        }
        let Some(sink_id) = self.sink_queue.pop_front() else {
            return Err(Error::End);
        };
        let entry = &self.components[sink_id];
        let Logic::Sink(logic) = &entry.logic else {
            unreachable!("sink queue only holds sinks");
        };
        let logic = Rc::clone(logic);
        let mut ctx = ConsumeCtx {
            name: Rc::clone(&entry.name),
            upstreams: Rc::clone(&entry.upstreams),
        };
        let result = logic.borrow_mut().consume(&mut ctx);
        match result {
            Ok(()) => {
                self.sink_queue.push_back(sink_id);
                self.dispatch_deferred()?;
                Ok(())
            }
            Err(Error::End) => {
                log::debug!("sink `{}` finished", self.components[sink_id].name);
                self.dispatch_deferred()?;
                if self.sink_queue.is_empty() {
                    Err(Error::End)
                } else {
                    Ok(())
                }
            }
            Err(Error::Again) => {
                self.sink_queue.push_back(sink_id);
                self.dispatch_deferred()?;
                Err(Error::Again)
            }
            Err(err) => {
                append_error_cause!(
                    &*self.components[sink_id].name,
                    &*self.components[sink_id].class_name,
                    "sink failed to consume: {err}"
                );
                self.faulty = true;
                Err(err)
            }
        }
    }

    /// Runs the graph to completion. Returns `Err(Again)` when every
    /// remaining sink is blocked, i.e. the only possible progress is on
    /// something that is not ready.
    pub fn run(&mut self) -> Result<(), Error> {
        let mut consecutive_again = 0usize;
        loop {
            match self.run_once() {
                Ok(()) => consecutive_again = 0,
                Err(Error::End) => return Ok(()),
                Err(Error::Again) => {
                    consecutive_again += 1;
                    if consecutive_again >= self.sink_queue.len().max(1) {
                        return Err(Error::Again);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        // Listeners are released in reverse registration order.
        while self.output_listeners.pop().is_some() {}
        while self.input_listeners.pop().is_some() {}
        for entry in self.components.iter().rev() {
            match &entry.logic {
                Logic::Source(logic) => logic.borrow_mut().finalize(),
                Logic::Filter(logic) => logic.borrow_mut().finalize(),
                Logic::Sink(logic) => logic.borrow_mut().finalize(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error;
    use crate::ir::TraceClass;
    use crate::message::{Message, Stream};
    use assert_matches::assert_matches;
    use std::rc::Rc;

    /// A source that emits a scripted list of messages, one per `next`.
    struct ScriptedSource {
        script: Vec<Message>,
    }

    struct ScriptedIterator {
        script: std::vec::IntoIter<Message>,
    }

    impl MessageIterator for ScriptedIterator {
        fn next(&mut self, out: &mut Vec<Message>, _capacity: usize) -> Result<usize, Error> {
            match self.script.next() {
                Some(msg) => {
                    out.push(msg);
                    Ok(1)
                }
                None => Err(Error::End),
            }
        }
    }

    impl SourceComponent for ScriptedSource {
        fn initialize(&mut self, ctx: &ComponentCtx, _params: &Value) -> Result<(), Error> {
            ctx.add_output_port("out")?;
            Ok(())
        }

        fn create_iterator(
            &mut self,
            _ctx: &ComponentCtx,
            _port: &str,
        ) -> Result<Box<dyn MessageIterator>, Error> {
            Ok(Box::new(ScriptedIterator {
                script: self.script.clone().into_iter(),
            }))
        }
    }

    fn stream_pair() -> (Message, Message) {
        let tc = TraceClass::new();
        let sc = tc.add_stream_class(0).unwrap();
        let stream = Stream::new(sc, None, None);
        (
            Message::StreamBeginning {
                stream: stream.clone(),
                snapshot: None,
            },
            Message::StreamEnd {
                stream,
                snapshot: None,
            },
        )
    }

    fn scripted_graph(
        script: Vec<Message>,
        consume: impl FnMut(&mut dyn MessageIterator) -> Result<(), Error> + 'static,
    ) -> Graph {
        let mut graph = Graph::new();
        let src = graph
            .add_source_component(
                "src.scripted",
                "src",
                ScriptedSource { script },
                &Value::new_map(),
                log::LevelFilter::Warn,
            )
            .unwrap();
        let sink = graph
            .add_sink_component(
                "sink.simple",
                "sink",
                SimpleSink::new(None, Box::new(consume), None),
                &Value::new_map(),
                log::LevelFilter::Warn,
            )
            .unwrap();
        let out = graph.output_port(src, "out").unwrap();
        let inp = graph.input_port(sink, "in").unwrap();
        graph.connect_ports(out, inp).unwrap();
        graph
    }

    #[test]
    fn rejects_duplicate_component_names() {
        let mut graph = Graph::new();
        graph
            .add_source_component(
                "src.scripted",
                "the-name",
                ScriptedSource { script: vec![] },
                &Value::new_map(),
                log::LevelFilter::Warn,
            )
            .unwrap();
        let err = graph
            .add_source_component(
                "src.scripted",
                "the-name",
                ScriptedSource { script: vec![] },
                &Value::new_map(),
                log::LevelFilter::Warn,
            )
            .unwrap_err();
        assert_matches!(err, Error::InvalidArgument(_));
    }

    #[test]
    fn rejects_double_connection() {
        let mut graph = Graph::new();
        let src = graph
            .add_source_component(
                "src.scripted",
                "src",
                ScriptedSource { script: vec![] },
                &Value::new_map(),
                log::LevelFilter::Warn,
            )
            .unwrap();
        let s1 = graph
            .add_sink_component(
                "sink.simple",
                "s1",
                SimpleSink::new(None, Box::new(|_| Err(Error::End)), None),
                &Value::new_map(),
                log::LevelFilter::Warn,
            )
            .unwrap();
        let s2 = graph
            .add_sink_component(
                "sink.simple",
                "s2",
                SimpleSink::new(None, Box::new(|_| Err(Error::End)), None),
                &Value::new_map(),
                log::LevelFilter::Warn,
            )
            .unwrap();
        let out = graph.output_port(src, "out").unwrap();
        graph
            .connect_ports(out, graph.input_port(s1, "in").unwrap())
            .unwrap();
        let err = graph
            .connect_ports(out, graph.input_port(s2, "in").unwrap())
            .unwrap_err();
        assert_matches!(err, Error::InvalidArgument(_));
    }

    #[test]
    fn run_drains_the_source() {
        let (begin, end) = stream_pair();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = Rc::clone(&seen);
        let mut graph = scripted_graph(vec![begin, end], move |iter| {
            let mut batch = Vec::new();
            match iter.next(&mut batch, 16) {
                Ok(_) => {
                    seen2.borrow_mut().extend(batch.drain(..).map(|m| m.kind()));
                    Ok(())
                }
                Err(e) => Err(e),
            }
        });
        graph.run().unwrap();
        use crate::message::MessageKind::*;
        assert_eq!(*seen.borrow(), vec![StreamBeginning, StreamEnd]);
    }

    #[test]
    fn sink_initialize_error_surfaces_from_run_once() {
        // Scenario: a simple sink whose initialize function fails makes
        // the first run_once fail with the sink's own cause on the chain.
        error::clear_causes();
        let (begin, end) = stream_pair();
        let mut graph = Graph::new();
        let src = graph
            .add_source_component(
                "src.scripted",
                "src",
                ScriptedSource {
                    script: vec![begin, end],
                },
                &Value::new_map(),
                log::LevelFilter::Warn,
            )
            .unwrap();
        let sink = graph
            .add_sink_component(
                "sink.simple",
                "sink",
                SimpleSink::new(
                    Some(Box::new(|| {
                        Err(Error::InvalidArgument("sink init says no".into()))
                    })),
                    Box::new(|_| Ok(())),
                    None,
                ),
                &Value::new_map(),
                log::LevelFilter::Warn,
            )
            .unwrap();
        graph
            .connect_ports(
                graph.output_port(src, "out").unwrap(),
                graph.input_port(sink, "in").unwrap(),
            )
            .unwrap();

        let err = graph.run_once().unwrap_err();
        assert_matches!(err, Error::InvalidArgument(_));
        let causes = error::take_causes();
        assert!(
            causes.iter().any(|c| c.message.contains("sink init says no")),
            "causes: {causes:?}"
        );
    }

    #[test]
    fn sink_again_requeues() {
        let (begin, end) = stream_pair();
        let mut first = true;
        let mut graph = scripted_graph(vec![begin, end], move |iter| {
            if first {
                first = false;
                return Err(Error::Again);
            }
            let mut batch = Vec::new();
            iter.next(&mut batch, 16).map(|_| ())
        });
        assert_matches!(graph.run_once(), Err(Error::Again));
        // The sink was re-queued: the next call makes progress.
        graph.run_once().unwrap();
    }

    #[test]
    fn listener_sees_ports_added_after_registration_only() {
        let mut graph = Graph::new();
        graph
            .add_source_component(
                "src.scripted",
                "early",
                ScriptedSource { script: vec![] },
                &Value::new_map(),
                log::LevelFilter::Warn,
            )
            .unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = Rc::clone(&seen);
        graph.add_output_port_added_listener(move |_graph, added| {
            seen2
                .borrow_mut()
                .push(format!("{}.{}", added.component_name, added.port_name));
            Ok(())
        });

        graph
            .add_source_component(
                "src.scripted",
                "late",
                ScriptedSource { script: vec![] },
                &Value::new_map(),
                log::LevelFilter::Warn,
            )
            .unwrap();

        assert_eq!(*seen.borrow(), vec!["late.out".to_string()]);
    }

    #[test]
    fn listeners_dispatch_in_registration_order() {
        let mut graph = Graph::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let o1 = Rc::clone(&order);
        let o2 = Rc::clone(&order);
        graph.add_output_port_added_listener(move |_g, _p| {
            o1.borrow_mut().push(1);
            Ok(())
        });
        graph.add_output_port_added_listener(move |_g, _p| {
            o2.borrow_mut().push(2);
            Ok(())
        });
        graph
            .add_source_component(
                "src.scripted",
                "src",
                ScriptedSource { script: vec![] },
                &Value::new_map(),
                log::LevelFilter::Warn,
            )
            .unwrap();
        assert_eq!(*order.borrow(), vec![1, 2]);
    }

    #[test]
    fn graph_without_sinks_cannot_run() {
        let mut graph = Graph::new();
        assert_matches!(graph.run_once(), Err(Error::InvalidArgument(_)));
    }

    #[test]
    fn drop_finalizes_components_and_releases_closures() {
        let (begin, end) = stream_pair();
        let finalized = Rc::new(RefCell::new(false));
        let finalized2 = Rc::clone(&finalized);
        let seen: Rc<RefCell<Vec<crate::message::MessageKind>>> = Rc::new(RefCell::new(Vec::new()));
        let seen2 = Rc::clone(&seen);

        let mut graph = Graph::new();
        let src = graph
            .add_source_component(
                "src.scripted",
                "src",
                ScriptedSource {
                    script: vec![begin, end],
                },
                &Value::new_map(),
                log::LevelFilter::Warn,
            )
            .unwrap();
        let sink = graph
            .add_sink_component(
                "sink.simple",
                "sink",
                SimpleSink::new(
                    None,
                    Box::new(move |iter| {
                        let mut batch = Vec::new();
                        let count = iter.next(&mut batch, 16)?;
                        seen2
                            .borrow_mut()
                            .extend(batch.drain(..count).map(|m| m.kind()));
                        Ok(())
                    }),
                    Some(Box::new(move || *finalized2.borrow_mut() = true)),
                ),
                &Value::new_map(),
                log::LevelFilter::Warn,
            )
            .unwrap();
        graph
            .connect_ports(
                graph.output_port(src, "out").unwrap(),
                graph.input_port(sink, "in").unwrap(),
            )
            .unwrap();
        let listener_state = Rc::new(RefCell::new(0usize));
        let listener_state2 = Rc::clone(&listener_state);
        graph.add_input_port_added_listener(move |_g, _p| {
            *listener_state2.borrow_mut() += 1;
            Ok(())
        });

        graph.run().unwrap();
        drop(graph);

        assert!(*finalized.borrow());
        // Every graph-held reference (component closures, messages,
        // listeners) is gone: the test holds the only handles left.
        assert_eq!(Rc::strong_count(&seen), 1);
        assert_eq!(Rc::strong_count(&finalized), 1);
        assert_eq!(Rc::strong_count(&listener_state), 1);
    }
}
