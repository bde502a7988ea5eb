// Logging setup: a thread-safe writer behind the `tracing` facade.
//
// The runtime emits diagnostics through `tracing` macros; this module turns
// a verbosity rule set into an installed subscriber. The writer is shared
// behind a mutex so the worker thread and the caller thread can interleave
// lines safely (the subscriber formats into a local buffer and takes the
// lock once per line).
//
// Verbosity rules are per-target: a default level plus overrides keyed by
// module path prefix, e.g. ("alderwire_session::ping", Verbosity::Off) to
// silence ping traffic while keeping connection events.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::{Result, SessionError};

/// How much a target is allowed to say.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Off,
    /// Unrecoverable failures only.
    Error,
    /// Dropped packets, rejected admissions, permission violations.
    Warn,
    /// Connection lifecycle events.
    Info,
    /// Per-message dispatch detail.
    Debug,
    /// Byte-level tracing.
    Trace,
}

impl Verbosity {
    fn level_filter(self) -> LevelFilter {
        match self {
            Verbosity::Off => LevelFilter::OFF,
            Verbosity::Error => LevelFilter::ERROR,
            Verbosity::Warn => LevelFilter::WARN,
            Verbosity::Info => LevelFilter::INFO,
            Verbosity::Debug => LevelFilter::DEBUG,
            Verbosity::Trace => LevelFilter::TRACE,
        }
    }
}

/// Default verbosity plus per-target overrides.
#[derive(Clone, Debug)]
pub struct LogSettings {
    pub default: Verbosity,
    pub rules: Vec<(String, Verbosity)>,
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings {
            default: Verbosity::Warn,
            rules: Vec::new(),
        }
    }
}

impl LogSettings {
    pub fn with_rule(mut self, target: &str, verbosity: Verbosity) -> Self {
        self.rules.push((target.to_owned(), verbosity));
        self
    }
}

/// A writer shared across threads; every `write` takes the mutex.
#[derive(Clone)]
pub struct SharedWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl SharedWriter {
    pub fn new(writer: Box<dyn Write + Send>) -> SharedWriter {
        SharedWriter {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    pub fn stderr() -> SharedWriter {
        SharedWriter::new(Box::new(io::stderr()))
    }
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Install the global subscriber. Fails if one is already installed (tests
/// call this repeatedly; use [`try_init_logging`] there).
pub fn init_logging(settings: &LogSettings, writer: SharedWriter) -> Result<()> {
    let mut targets = Targets::new().with_default(settings.default.level_filter());
    for (target, verbosity) in &settings.rules {
        targets = targets.with_target(target.clone(), verbosity.level_filter());
    }
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true),
        )
        .with(targets)
        .try_init()
        .map_err(|e| SessionError::Config(format!("logging init failed: {e}")))
}

/// Like [`init_logging`] but quietly keeps an already-installed subscriber.
pub fn try_init_logging(settings: &LogSettings, writer: SharedWriter) {
    let _ = init_logging(settings, writer);
}
