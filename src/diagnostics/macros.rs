//! Diagnostic macros.

/// Emit a predefined diagnostic, optionally with formatted context.
///
/// # Example
///
/// ```rust,ignore
/// dd_emit!(DD201);
/// dd_emit!(DD202, "swapchain {:?}", swapchain);
/// ```
#[macro_export]
macro_rules! dd_emit {
    ($diag:ident) => {{
        $crate::diagnostics::emit::emit(&$crate::diagnostics::$diag);
    }};
    ($diag:ident, $($arg:tt)+) => {{
        $crate::diagnostics::emit::emit_with_context(
            &$crate::diagnostics::$diag,
            &format!($($arg)+),
        );
    }};
}
