//! Coded runtime diagnostics.
//!
//! This module provides:
//! - **Runtime diagnostics**: renderer-aware error messages with codes
//! - **Log routing**: every diagnostic goes through the `log` facade
//! - **Strict mode**: optional panic-on-error for CI
//!
//! ## Diagnostic Codes
//!
//! | Code  | Meaning                            |
//! |-------|------------------------------------|
//! | DD0xx | Device memory                      |
//! | DD1xx | Command buffers and submission     |
//! | DD2xx | Presentation                       |
//! | DD3xx | Device and display setup           |
//! | DD9xx | Internal errors                    |
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ddisplay::dd_emit;
//!
//! dd_emit!(DD201);
//! dd_emit!(DD202, "{} swapchain(s)", 2);
//! ```

pub mod emit;
pub mod kind;
pub mod macros;
pub mod strict;

pub use emit::{
    emit, emit_with_context, is_suppressed, set_thread_sink, suppress_diagnostics,
    CollectingSink, DiagnosticSink,
};
#[cfg(test)]
pub(crate) use emit::PanickingSink;
pub use kind::{Diagnostic, DiagnosticKind};
pub use strict::{init_from_env, set_strict_mode, strict_mode, StrictMode, StrictModeGuard};

pub use kind::{
    DD001, DD002, DD003, DD101, DD102, DD103, DD201, DD202, DD203, DD204, DD301, DD302, DD303,
    DD304, DD901,
};
