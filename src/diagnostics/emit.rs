//! Diagnostic emission backend.
//!
//! Diagnostics go to the `log` facade. Tests can additionally capture them
//! per thread through a [`DiagnosticSink`].

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::kind::{Diagnostic, DiagnosticKind};
use super::strict::strict_mode;

/// Global flag to suppress diagnostic output (for testing).
static DIAGNOSTICS_SUPPRESSED: AtomicBool = AtomicBool::new(false);

thread_local! {
    static THREAD_SINK: RefCell<Option<Arc<dyn DiagnosticSink>>> = RefCell::new(None);
}

/// Suppress all diagnostic log output. Sinks still receive diagnostics.
pub fn suppress_diagnostics(suppress: bool) {
    DIAGNOSTICS_SUPPRESSED.store(suppress, Ordering::Relaxed);
}

/// Check if diagnostics are suppressed.
pub fn is_suppressed() -> bool {
    DIAGNOSTICS_SUPPRESSED.load(Ordering::Relaxed)
}

/// Install a sink that receives every diagnostic emitted on this thread.
///
/// Returns the previously installed sink.
pub fn set_thread_sink(sink: Option<Arc<dyn DiagnosticSink>>) -> Option<Arc<dyn DiagnosticSink>> {
    THREAD_SINK.with(|slot| std::mem::replace(&mut *slot.borrow_mut(), sink))
}

/// Emit a diagnostic.
pub fn emit(diag: &Diagnostic) {
    dispatch(diag, None);
}

/// Emit a diagnostic with additional runtime context.
pub fn emit_with_context(diag: &Diagnostic, context: &str) {
    dispatch(diag, Some(context));
}

fn dispatch(diag: &Diagnostic, context: Option<&str>) {
    THREAD_SINK.with(|slot| {
        if let Some(sink) = slot.borrow().as_ref() {
            sink.emit(diag);
        }
    });

    if !is_suppressed() {
        emit_to_log(diag, context);
    }

    if strict_mode().is_fatal(diag.kind) {
        match context {
            Some(context) => panic!(
                "[ddisplay][{}] {}\nContext: {}\nStrict mode enabled - diagnostics are fatal.",
                diag.code, diag.message, context
            ),
            None => panic!(
                "[ddisplay][{}] {}\nStrict mode enabled - diagnostics are fatal.",
                diag.code, diag.message
            ),
        }
    }
}

fn emit_to_log(diag: &Diagnostic, context: Option<&str>) {
    let level = match diag.kind {
        DiagnosticKind::Error => log::Level::Error,
        DiagnosticKind::Warning => log::Level::Warn,
        DiagnosticKind::Note => log::Level::Info,
    };
    match context {
        Some(context) => log::log!(level, "[{}] {}: {}", diag.code, diag.message, context),
        None => log::log!(level, "[{}] {}", diag.code, diag.message),
    }

    // Notes and help are only useful when someone is looking closely.
    #[cfg(any(debug_assertions, feature = "diagnostics"))]
    {
        if let Some(note) = diag.note {
            log::debug!("  note: {}", note);
        }
        if let Some(help) = diag.help {
            log::debug!("  help: {}", help);
        }
    }
}

/// A diagnostic sink trait for custom output.
pub trait DiagnosticSink: Send + Sync {
    /// Handle a diagnostic.
    fn emit(&self, diag: &Diagnostic);
}

/// A simple sink that collects diagnostics.
#[derive(Default)]
pub struct CollectingSink {
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    /// Create a new collecting sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected diagnostics.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.lock().clone()
    }

    /// Codes of all collected diagnostics, in emission order.
    pub fn codes(&self) -> Vec<&'static str> {
        self.lock().iter().map(|d| d.code).collect()
    }

    /// Clear collected diagnostics.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Check if any errors were collected.
    pub fn has_errors(&self) -> bool {
        self.lock().iter().any(|d| d.kind == DiagnosticKind::Error)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Diagnostic>> {
        self.diagnostics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DiagnosticSink for CollectingSink {
    fn emit(&self, diag: &Diagnostic) {
        self.lock().push(diag.clone());
    }
}

/// Panics on every diagnostic, the way strict mode does, without touching
/// the process-wide strict mode other tests rely on.
#[cfg(test)]
pub(crate) struct PanickingSink;

#[cfg(test)]
impl DiagnosticSink for PanickingSink {
    fn emit(&self, diag: &Diagnostic) {
        panic!("[ddisplay][{}] {}", diag.code, diag.message);
    }
}
