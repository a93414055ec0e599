//! Diagnostic kinds and the predefined renderer diagnostics.

/// The severity level of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// Something is definitely wrong; the operation was refused or skipped.
    Error,
    /// Something is probably wrong or suboptimal.
    Warning,
    /// Informational.
    Note,
}

impl DiagnosticKind {
    /// Get the display prefix for this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            DiagnosticKind::Error => "error",
            DiagnosticKind::Warning => "warning",
            DiagnosticKind::Note => "note",
        }
    }
}

/// A diagnostic message with code, message, and optional context.
///
/// Diagnostic codes follow the pattern:
/// - `DD0xx` - Device memory
/// - `DD1xx` - Command buffers and submission
/// - `DD2xx` - Presentation
/// - `DD3xx` - Device and display setup
/// - `DD9xx` - Internal errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Severity level.
    pub kind: DiagnosticKind,
    /// Diagnostic code (e.g., "DD001").
    pub code: &'static str,
    /// Primary message.
    pub message: &'static str,
    /// Optional additional context.
    pub note: Option<&'static str>,
    /// Optional fix suggestion.
    pub help: Option<&'static str>,
}

impl Diagnostic {
    /// Create a new error diagnostic.
    pub const fn error(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Create a new warning diagnostic.
    pub const fn warning(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Warning,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Add a note to this diagnostic.
    pub const fn with_note(mut self, note: &'static str) -> Self {
        self.note = Some(note);
        self
    }

    /// Add a help message to this diagnostic.
    pub const fn with_help(mut self, help: &'static str) -> Self {
        self.help = Some(help);
        self
    }
}

// =============================================================================
// DD0xx - Device memory
// =============================================================================

/// DD001: No memory type satisfies the requested property flags.
pub const DD001: Diagnostic = Diagnostic::error(
    "DD001",
    "failed to find a memory type with the requested properties"
).with_note("no memory type allowed by the resource has all requested property flags")
.with_help("check the memory properties reported by the physical device");

/// DD002: A memory pool was dropped with ranges its allocations never returned.
///
/// Every live allocation keeps its pool alive, so this only fires when the
/// per-page free lists disagree with the allocations handed out. Checked in
/// debug builds.
pub const DD002: Diagnostic = Diagnostic::warning(
    "DD002",
    "memory pool dropped with unreturned ranges"
).with_note("the lost ranges are released together with their pages");

/// DD003: An allocation was returned to a pool that does not own its page.
pub const DD003: Diagnostic = Diagnostic::error(
    "DD003",
    "allocation returned to a pool that does not own its page"
);

// =============================================================================
// DD1xx - Command buffers and submission
// =============================================================================

/// DD101: Wait or signal pushed for a command buffer this unit never handed out.
pub const DD101: Diagnostic = Diagnostic::error(
    "DD101",
    "unknown command buffer given"
).with_note("semaphores can only be attached to buffers requested from the same unit this frame")
.with_help("request the command buffer from the execution unit of the current frame");

/// DD102: Waiting on a queue family fence failed.
pub const DD102: Diagnostic = Diagnostic::error(
    "DD102",
    "waiting for command execution unit fences failed"
);

/// DD103: Queue submission failed.
pub const DD103: Diagnostic = Diagnostic::error(
    "DD103",
    "queue submission failed"
);

// =============================================================================
// DD2xx - Presentation
// =============================================================================

/// DD201: Swapchain image acquisition failed; the frame is skipped for that display.
pub const DD201: Diagnostic = Diagnostic::error(
    "DD201",
    "acquiring the next swapchain image failed"
).with_note("the frame is skipped for this display");

/// DD202: Present failed; the frame is skipped.
pub const DD202: Diagnostic = Diagnostic::warning(
    "DD202",
    "present failed"
).with_note("the next frame is rendered as usual");

/// DD203: Present rectangles of one device do not tile their bounding box.
pub const DD203: Diagnostic = Diagnostic::warning(
    "DD203",
    "present rectangles cannot be packed tightly"
).with_help("for optimal performance and correct results adjust the display configuration");

/// DD204: Display plane does not support opaque alpha.
pub const DD204: Diagnostic = Diagnostic::error(
    "DD204",
    "display plane does not support opaque alpha"
);

// =============================================================================
// DD3xx - Setup
// =============================================================================

/// DD301: No queue family with the requested capabilities on every device.
pub const DD301: Diagnostic = Diagnostic::error(
    "DD301",
    "no common queue family index found"
);

/// DD302: The enabled displays share no surface format.
pub const DD302: Diagnostic = Diagnostic::error(
    "DD302",
    "no common surface format for shared display"
);

/// DD303: A display was enabled twice on the same logical device.
pub const DD303: Diagnostic = Diagnostic::error(
    "DD303",
    "tried to enable display twice"
);

/// DD304: The display is not connected to any device of the group.
pub const DD304: Diagnostic = Diagnostic::error(
    "DD304",
    "display is not connected to any physical device of this device group"
);

// =============================================================================
// DD9xx - Internal
// =============================================================================

/// DD901: A render thread panicked while recording.
pub const DD901: Diagnostic = Diagnostic::error(
    "DD901",
    "render thread panicked"
).with_note("the thread stopped recording; its display presents stale content");
