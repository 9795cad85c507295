//! A sink built from plain closures.
//!
//! Non-trivial sinks live outside the core, but tests and small tools
//! still need one. [`SimpleSink`] wraps three callables: an optional
//! initializer (run lazily, right before the first consume), the consume
//! function (handed the message iterator created on the single `"in"`
//! port), and an optional finalizer. Return codes pass through untouched.

use crate::append_error_cause;
use crate::error::Error;
use crate::values::Value;

use super::{ComponentCtx, ConsumeCtx, MessageIterator, SinkComponent};

pub type InitFn = Box<dyn FnMut() -> Result<(), Error>>;
pub type ConsumeFn = Box<dyn FnMut(&mut dyn MessageIterator) -> Result<(), Error>>;
pub type FinalizeFn = Box<dyn FnMut()>;

pub struct SimpleSink {
    init: Option<InitFn>,
    consume: ConsumeFn,
    finalize: Option<FinalizeFn>,
    initialized: bool,
    iterator: Option<Box<dyn MessageIterator>>,
}

impl SimpleSink {
    pub fn new(init: Option<InitFn>, consume: ConsumeFn, finalize: Option<FinalizeFn>) -> Self {
        SimpleSink {
            init,
            consume,
            finalize,
            initialized: false,
            iterator: None,
        }
    }
}

impl SinkComponent for SimpleSink {
    fn initialize(&mut self, ctx: &ComponentCtx, _params: &Value) -> Result<(), Error> {
        ctx.add_input_port("in")?;
        Ok(())
    }

    fn consume(&mut self, ctx: &mut ConsumeCtx) -> Result<(), Error> {
        if !self.initialized {
            if let Some(init) = &mut self.init {
                if let Err(err) = init() {
                    if !err.is_status() {
                        append_error_cause!(
                            ctx.name(),
                            "sink.simple",
                            "initialization function failed: {err}"
                        );
                    }
                    return Err(err);
                }
            }
            self.initialized = true;
        }
        if self.iterator.is_none() {
            self.iterator = Some(ctx.create_iterator("in")?);
        }
        (self.consume)(self.iterator.as_mut().expect("iterator created").as_mut())
    }

    fn finalize(&mut self) {
        if let Some(finalize) = &mut self.finalize {
            finalize();
        }
    }
}
