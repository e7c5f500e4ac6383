//! A minimal, zero-dependency logging crate for the `ddeshm` workspace.
//!
//! Several cooperating processes usually share one terminal when the DDE
//! subsystem is in use, so every line is tagged with the emitting pid:
//!
//! ```text
//! [WARN] pid=4242 ddeshm::dde::proc: reaping stale process 4199 (slot 3)
//! ```
//!
//! Output goes to stderr. ANSI colors are used only when stderr is a
//! terminal.
//!
//! # Example
//!
//! ```
//! use ddeshm_log::{debug, error, info, warn, Level};
//!
//! ddeshm_log::set_level(Level::Debug);
//!
//! let segment = 17;
//! info!("attached segment {}", segment);
//! debug!("free list: {:?}", vec![16, 4096]);
//! warn!("atom table is full");
//! error!("semop failed");
//! ```

use std::fmt::Arguments;
use std::io::{IsTerminal, Write};
use std::str::FromStr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Environment variable read by [`init_from_env`].
pub const LOG_ENV: &str = "DDESHM_LOG";

/// Log levels, ordered from most severe (`Error`) to least severe (`Trace`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Failures that degrade an operation (lock errors, corrupt headers).
    Error = 0,
    /// Recoverable anomalies (stale peers, exhausted tables).
    Warn = 1,
    /// Lifecycle events (attach, detach, segment creation).
    Info = 2,
    /// Message traffic.
    Debug = 3,
    /// Allocator internals.
    Trace = 4,
}

impl Level {
    const fn color_code(self) -> &'static str {
        match self {
            Level::Error => "\x1b[31m",
            Level::Warn => "\x1b[33m",
            Level::Info => "\x1b[32m",
            Level::Debug => "\x1b[36m",
            Level::Trace => "\x1b[35m",
        }
    }

    /// Returns the upper-case name of this level.
    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn from_u8(raw: u8) -> Level {
        match raw {
            0 => Level::Error,
            1 => Level::Warn,
            2 => Level::Info,
            3 => Level::Debug,
            _ => Level::Trace,
        }
    }
}

impl FromStr for Level {
    type Err = String;

    /// Parses a level name, ignoring case.
    ///
    /// ```
    /// use ddeshm_log::Level;
    ///
    /// assert_eq!("error".parse::<Level>(), Ok(Level::Error));
    /// assert_eq!("INFO".parse::<Level>(), Ok(Level::Info));
    /// assert!("loud".parse::<Level>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ERROR" => Ok(Level::Error),
            "WARN" | "WARNING" => Ok(Level::Warn),
            "INFO" => Ok(Level::Info),
            "DEBUG" => Ok(Level::Debug),
            "TRACE" => Ok(Level::Trace),
            _ => Err(format!("invalid log level: {s}")),
        }
    }
}

/// The process-wide logger.
///
/// Level and color settings are atomics so the logger can be consulted
/// from any thread without locking.
pub struct Logger {
    level: AtomicU8,
    color: AtomicBool,
}

impl Logger {
    fn new(level: Level) -> Self {
        Logger {
            level: AtomicU8::new(level as u8),
            color: AtomicBool::new(std::io::stderr().is_terminal()),
        }
    }

    /// Sets the minimum level that will be emitted.
    pub fn set_level(&self, level: Level) {
        self.level.store(level as u8, Ordering::SeqCst);
    }

    /// Returns the current minimum level.
    pub fn level(&self) -> Level {
        Level::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Forces colored output on or off.
    pub fn set_color(&self, enabled: bool) {
        self.color.store(enabled, Ordering::Relaxed);
    }

    /// Checks whether a message at `level` would be emitted.
    pub fn enabled(&self, level: Level) -> bool {
        level as u8 <= self.level.load(Ordering::Relaxed)
    }

    fn render(&self, level: Level, pid: u32, target: &str, args: Arguments) -> String {
        if self.color.load(Ordering::Relaxed) {
            format!(
                "{}[{}]\x1b[0m pid={pid} {target}: {args}",
                level.color_code(),
                level.as_str()
            )
        } else {
            format!("[{}] pid={pid} {target}: {args}", level.as_str())
        }
    }
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Returns the global logger, initializing it at `Level::Info` on first use.
pub fn get_logger() -> &'static Logger {
    LOGGER.get_or_init(|| Logger::new(Level::Info))
}

/// Sets the minimum level of the global logger.
pub fn set_level(level: Level) {
    get_logger().set_level(level);
}

/// Sets the minimum level of the global logger from a level name.
///
/// ```
/// ddeshm_log::set_level_from_str("debug").unwrap();
/// assert!(ddeshm_log::set_level_from_str("chatty").is_err());
/// ```
pub fn set_level_from_str(s: &str) -> Result<(), String> {
    set_level(s.parse()?);
    Ok(())
}

/// Applies the level named by `DDESHM_LOG`, if set.
///
/// An unparsable value leaves the level untouched and is reported once on
/// stderr. Returns the level in effect afterwards.
pub fn init_from_env() -> Level {
    if let Ok(value) = std::env::var(LOG_ENV)
        && let Err(e) = set_level_from_str(&value)
    {
        eprintln!("ddeshm-log: ignoring {LOG_ENV}: {e}");
    }
    get_logger().level()
}

/// Writes one log line. Called by the macros after the level check.
#[doc(hidden)]
pub fn __log_with_target(level: Level, target: &str, args: Arguments) {
    let logger = get_logger();
    if !logger.enabled(level) {
        return;
    }

    let line = logger.render(level, std::process::id(), target, args);
    // A closed stderr must not take the process down with it.
    let _ = writeln!(std::io::stderr().lock(), "{line}");
}

/// Logs a message at an explicit level, tagged with the calling module.
///
/// ```
/// use ddeshm_log::{log, Level};
///
/// log!(level: Level::Info, "segment {} attached", 7);
/// ```
#[macro_export]
macro_rules! log {
    (level: $level:expr, $($arg:tt)*) => {
        {
            if $crate::get_logger().enabled($level) {
                $crate::__log_with_target(
                    $level,
                    module_path!(),
                    format_args!($($arg)*)
                );
            }
        }
    };
}

/// Logs at `Level::Error`.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Error, $($arg)*)
    };
}

/// Logs at `Level::Warn`.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Warn, $($arg)*)
    };
}

/// Logs at `Level::Info`.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Info, $($arg)*)
    };
}

/// Logs at `Level::Debug`.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Debug, $($arg)*)
    };
}

/// Logs at `Level::Trace`.
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Trace, $($arg)*)
    };
}
