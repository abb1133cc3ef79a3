//! Logging utils. See ["log" crate documentation](https://docs.rs/log/) for details.
//!
//! [`FilamentLogger`] is a [`log::Log`] implementation whose lines carry the
//! runtime context a fiber scheduler produces: the OS thread id and name, and
//! the id of the fiber the record was emitted from. Install it with
//! [`init`]; afterwards the ordinary `log` macros work everywhere, including
//! inside fibers:
//!
//! ```
//! filament::log::init();
//! log::info!("hello from fiber {}", filament::fiber::id());
//! ```
//!
//! The maximum level is bound to the `"log.level"` configuration variable
//! (default `"info"`), so changing that variable at runtime retargets the
//! filter through its change listener.

use std::io::{self, Write};
use std::sync::Once;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::Lazy;

use crate::sync::Spinlock;
use crate::{config, fiber, thread, util};

static START: Lazy<Instant> = Lazy::new(Instant::now);
static SINK: Spinlock<()> = Spinlock::new(());
static LOGGER: FilamentLogger = FilamentLogger;

/// [`Log`] implementation writing formatted records to stderr.
pub struct FilamentLogger;

impl Log for FilamentLogger {
    #[inline(always)]
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format(record);
        // one formatted write per record; a spinlock is enough to keep
        // concurrent lines from interleaving
        let _guard = SINK.lock();
        let _ = writeln!(io::stderr(), "{}", line);
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

/// Renders one record the way [`FilamentLogger`] writes it.
///
/// Fields, in order: wall-clock time (unix epoch ms), elapsed ms since
/// [`init`], level, `tid:thread-name`, current fiber id, target,
/// `file:line`, message.
pub fn format(record: &Record) -> String {
    let wall_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!(
        "{} +{}ms {:<5} {}:{} fiber={} [{}] {}:{} {}",
        wall_ms,
        START.elapsed().as_millis(),
        record.level(),
        util::thread_id(),
        thread::current_name(),
        fiber::id(),
        record.target(),
        record.file().unwrap_or("?"),
        record.line().unwrap_or(0),
        record.args(),
    )
}

/// Installs [`FilamentLogger`] as the global logger. Idempotent; keeps an
/// already-installed foreign logger in place.
pub fn init() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        Lazy::force(&START);
        if log::set_logger(&LOGGER).is_err() {
            return;
        }
        match config::lookup::<String>("log.level", "info".to_string(), "global log level filter")
        {
            Some(level) => {
                log::set_max_level(parse_level(&level.value()));
                level.add_listener(|_, new| log::set_max_level(parse_level(new)));
            }
            None => log::set_max_level(LevelFilter::Info),
        }
    });
}

/// Parses a level filter name; unknown names fall back to `Info`.
pub fn parse_level(name: &str) -> LevelFilter {
    match name.to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" | "warning" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}
