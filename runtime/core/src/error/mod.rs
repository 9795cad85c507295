//! Framework error model.
//!
//! Errors come in two flavors. `Again` and `End` are control-flow statuses:
//! the first means "retry later, nothing changed", the second means "this
//! iterator or sink is exhausted". Neither records anything. Every other
//! variant is a genuine failure; code raising one appends a structured
//! [`ErrorCause`] to the calling thread's error chain so the top-level
//! caller can print where the failure came from, hop by hop.

use std::cell::{Cell, RefCell};

/// Framework-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operation cannot make progress right now. Retry later; no state
    /// was changed.
    #[error("try again later")]
    Again,

    /// The iterator or sink is exhausted. Terminal.
    #[error("end of stream")]
    End,

    /// The operation is optional and this object does not advertise it.
    #[error("unsupported operation")]
    Unsupported,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("allocation failed: {0}")]
    Memory(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed trace bytes: bad magic, bad UUID, a straddling event,
    /// an unknown stream id after schema freeze, an arithmetic overflow.
    #[error("malformed trace data: {0}")]
    Decode(String),

    /// The metadata is inconsistent with the consumed bytes.
    #[error("metadata does not match trace data: {0}")]
    Schema(String),

    /// The muxer saw a non-monotonic message head.
    #[error("message time regression: {0}")]
    TimeRegression(String),

    /// The muxer saw mutually incomparable active clock classes.
    #[error("incomparable clock classes: {0}")]
    IncomparableClocks(String),

    /// Mutation of a frozen value or class.
    #[error("object is frozen: {0}")]
    Frozen(String),

    #[error("graph was canceled")]
    Canceled,
}

impl Error {
    /// Whether this is a control-flow status rather than a failure.
    /// Statuses never append error causes.
    pub fn is_status(&self) -> bool {
        matches!(self, Error::Again | Error::End)
    }
}

/// One hop of the thread's error chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCause {
    /// Name of the component instance that raised or forwarded the error,
    /// if it was raised inside a component method.
    pub component: Option<String>,
    /// Name of the component class.
    pub component_class: Option<String>,
    pub file: &'static str,
    pub line: u32,
    pub message: String,
}

thread_local! {
    static ERROR_CHAIN: RefCell<Vec<ErrorCause>> = const { RefCell::new(Vec::new()) };
    static CANCELED: Cell<bool> = const { Cell::new(false) };
}

/// Appends a cause to the calling thread's error chain.
///
/// Prefer the [`append_error_cause!`](crate::append_error_cause) macro,
/// which captures the call site.
pub fn append_cause(cause: ErrorCause) {
    ERROR_CHAIN.with(|chain| chain.borrow_mut().push(cause));
}

/// Drains the thread's error chain, most recent cause first.
pub fn take_causes() -> Vec<ErrorCause> {
    let mut causes = ERROR_CHAIN.with(|chain| chain.borrow_mut().split_off(0));
    causes.reverse();
    causes
}

/// Returns a copy of the most recently appended cause without draining.
pub fn last_cause() -> Option<ErrorCause> {
    ERROR_CHAIN.with(|chain| chain.borrow().last().cloned())
}

pub fn has_causes() -> bool {
    ERROR_CHAIN.with(|chain| !chain.borrow().is_empty())
}

/// Discards the thread's error chain.
pub fn clear_causes() {
    ERROR_CHAIN.with(|chain| chain.borrow_mut().clear());
}

/// Appends an [`ErrorCause`] to the thread's error chain, capturing the
/// call site. The first two arguments are the component name and the
/// component-class name; pass `-` for code running outside any component.
///
/// ```ignore
/// append_error_cause!("src.ctf", "TraceFileSource", "bad magic: {magic:#x}");
/// ```
#[macro_export]
macro_rules! append_error_cause {
    (-, $($arg:tt)*) => {
        $crate::error::append_cause($crate::error::ErrorCause {
            component: None,
            component_class: None,
            file: file!(),
            line: line!(),
            message: format!($($arg)*),
        })
    };
    ($comp:expr, $class:expr, $($arg:tt)*) => {
        $crate::error::append_cause($crate::error::ErrorCause {
            component: Some($comp.to_string()),
            component_class: Some($class.to_string()),
            file: file!(),
            line: line!(),
            message: format!($($arg)*),
        })
    };
}

/// Whether the "graph canceled" flag is set for this thread.
///
/// Mediums and iterators check this at their `Again` boundaries: once set,
/// they keep returning [`Error::Again`] without doing work, which lets the
/// caller abandon the graph cleanly.
pub fn is_canceled() -> bool {
    CANCELED.with(|flag| flag.get())
}

pub fn set_canceled(canceled: bool) {
    CANCELED.with(|flag| flag.set(canceled));
}

/// RAII cancellation scope: sets the canceled flag on creation and clears
/// it on drop.
pub struct CancelGuard(());

impl CancelGuard {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        set_canceled(true);
        CancelGuard(())
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        set_canceled(false);
    }
}
