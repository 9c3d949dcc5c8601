//! Error hierarchy and rate-limited diagnostics for the attribution pipeline.
//!
//! Fatal conditions (`ConfigError`, `IntegrityError`, `ToolFailure` from §7 of the
//! design) are represented by [`Error`] and propagate via `?`. Non-fatal
//! conditions (`WarningOnly`, `DataGap`) never produce an `Err` — they are
//! recorded on a [`Diagnostics`] sink that rate-limits repeated occurrences of
//! the same category, matching the "first ten, then a summary count" contract.

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;

use thiserror::Error;

/// The crate's fallible-operation result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Fatal errors produced by the attribution pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// The build output directory or cross-compilation tool prefix could not be
    /// located or verified (§4.2).
    #[error("configuration error: {0}")]
    Config(String),

    /// Two independently-produced artifacts disagree in a way that cannot be
    /// reconciled (duplicate ninja output with different inputs, map/ELF
    /// section-size mismatch).
    #[error("integrity error: {0}")]
    Integrity(String),

    /// An external tool (`nm`, `c++filt`, `readelf`) exited non-zero.
    #[error("`{command}` failed with status {status}: {stderr}")]
    ToolFailure {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid UTF-8 in tool output: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("malformed linker map at line {line}: {message}")]
    MapParse { line: usize, message: String },
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Error::Integrity(message.into())
    }
}

/// A category of non-fatal condition, rate-limited independently of others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    /// §4.3: a ninja-unresolved object path.
    UnresolvedSourcePath,
    /// §4.6 stage 4: too-few-aliases heuristic undershoot.
    TooFewAliases,
    /// §4.6 stage 6: implausibly large padding.
    ImplausiblePadding,
    /// §4.6 stage 5 / §4.4: a name present in the map but absent from any
    /// object file's symbol table (nm↔map mismatch).
    UnmatchedName,
    /// §7 `DataGap`: a section with no symbol coverage at all.
    SectionCoverageGap,
}

impl DiagnosticKind {
    fn label(self) -> &'static str {
        match self {
            DiagnosticKind::UnresolvedSourcePath => "unresolved source path",
            DiagnosticKind::TooFewAliases => "too few aliases",
            DiagnosticKind::ImplausiblePadding => "implausible padding",
            DiagnosticKind::UnmatchedName => "unmatched nm/map name",
            DiagnosticKind::SectionCoverageGap => "section coverage gap",
        }
    }
}

/// Rate limit: the first 10 occurrences per category are logged individually; the
/// rest are tallied into a summary emitted at the end of a run (§7).
const RATE_LIMIT: usize = 10;

#[derive(Default)]
struct Counters {
    counts: HashMap<DiagnosticKind, usize>,
}

/// Collects warnings and data-gap statistics produced during an archive run.
///
/// Every warning site in the pipeline (§4.3, §4.6, §7) reports through this
/// sink rather than failing the operation. The sink is intentionally `Sync`
/// so that it can be shared across the worker threads driving C3/C4/C5.
pub struct Diagnostics {
    counters: Mutex<Counters>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Diagnostics {
            counters: Mutex::new(Counters::default()),
        }
    }
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one occurrence of `kind`. Logs at `tracing::warn!` for the first
    /// [`RATE_LIMIT`] occurrences, then silently increments the tally.
    pub fn warn(&self, kind: DiagnosticKind, message: impl std::fmt::Display) {
        let mut counters = self.counters.lock().unwrap();
        let count = counters.counts.entry(kind).or_insert(0);
        *count += 1;
        if *count <= RATE_LIMIT {
            tracing::warn!(kind = kind.label(), "{message}");
        }
    }

    /// Logs a final per-category summary for every category that exceeded the
    /// rate limit. Intended to be called once, at the end of an archive run.
    pub fn log_summary(&self) {
        let counters = self.counters.lock().unwrap();
        for (kind, count) in counters.counts.iter() {
            if *count > RATE_LIMIT {
                tracing::info!(
                    kind = kind.label(),
                    total = count,
                    logged = RATE_LIMIT,
                    "suppressed {} further occurrences",
                    count - RATE_LIMIT
                );
            }
        }
    }

    /// Total occurrences recorded for `kind`, for tests and telemetry.
    pub fn count(&self, kind: DiagnosticKind) -> usize {
        *self.counters.lock().unwrap().counts.get(&kind).unwrap_or(&0)
    }
}
