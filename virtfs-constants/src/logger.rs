use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// How much to log.
///
/// Levels are ordered from most to least verbose.  A logger emits a message when the message's
/// level is at least as severe as its own level.
#[derive(Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Debug)]
pub enum LogLevel {
    Dump,
    Trace,
    Debug,
    Info,
    Normal,
    Error,
    Fatal,
}

impl LogLevel {
    /// Maps a command-line style verbosity count to a level.
    pub fn from_verbosity(verbosity: i32) -> Self {
        match verbosity {
            x if x < -1 => LogLevel::Fatal,
            -1 => LogLevel::Error,
            0 => LogLevel::Normal,
            1 => LogLevel::Info,
            2 => LogLevel::Debug,
            3 => LogLevel::Trace,
            _ => LogLevel::Dump,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Dump => "dump",
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Normal => "message",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        }
    }
}

pub trait Logger {
    fn level(&self) -> LogLevel;
    fn fatal(&self, msg: &str);
    fn error(&self, msg: &str);
    fn message(&self, msg: &str);
    fn info(&self, msg: &str);
    fn debug(&self, msg: &str);
    fn trace(&self, msg: &str);

    fn enabled(&self, level: LogLevel) -> bool {
        level >= self.level()
    }
}

impl<T: Logger + ?Sized> Logger for Arc<T> {
    fn level(&self) -> LogLevel {
        self.as_ref().level()
    }

    fn fatal(&self, msg: &str) {
        self.as_ref().fatal(msg);
    }

    fn error(&self, msg: &str) {
        self.as_ref().error(msg);
    }

    fn message(&self, msg: &str) {
        self.as_ref().message(msg);
    }

    fn info(&self, msg: &str) {
        self.as_ref().info(msg);
    }

    fn debug(&self, msg: &str) {
        self.as_ref().debug(msg);
    }

    fn trace(&self, msg: &str) {
        self.as_ref().trace(msg);
    }
}

/// A logger that writes one line per message to a shared writer.
pub struct WriterLogger {
    output: Mutex<Box<dyn Write + Send + Sync>>,
    level: LogLevel,
}

impl WriterLogger {
    pub fn new(level: LogLevel, output: Box<dyn Write + Send + Sync>) -> Self {
        Self {
            output: Mutex::new(output),
            level,
        }
    }

    pub fn stderr(level: LogLevel) -> Self {
        Self::new(level, Box::new(std::io::stderr()))
    }

    fn write(&self, level: LogLevel, msg: &str) {
        if !self.enabled(level) {
            return;
        }
        let line = if level <= LogLevel::Trace {
            let time = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_else(|e| e.duration());
            format!("{}: {:09.9}: {}\n", level.as_str(), time.as_secs_f64(), msg)
        } else if level == LogLevel::Normal {
            format!("{}\n", msg)
        } else {
            format!("{}: {}\n", level.as_str(), msg)
        };
        // A poisoned lock only means another thread panicked mid-write.
        let mut out = match self.output.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        let _ = out.write_all(line.as_bytes());
    }
}

impl Logger for WriterLogger {
    fn level(&self) -> LogLevel {
        self.level
    }

    fn fatal(&self, msg: &str) {
        self.write(LogLevel::Fatal, msg);
    }

    fn error(&self, msg: &str) {
        self.write(LogLevel::Error, msg);
    }

    fn message(&self, msg: &str) {
        self.write(LogLevel::Normal, msg);
    }

    fn info(&self, msg: &str) {
        self.write(LogLevel::Info, msg);
    }

    fn debug(&self, msg: &str) {
        self.write(LogLevel::Debug, msg);
    }

    fn trace(&self, msg: &str) {
        self.write(LogLevel::Trace, msg);
    }
}

/// A logger that discards everything.
#[derive(Default, Clone, Copy)]
pub struct NullLogger;

impl Logger for NullLogger {
    fn level(&self) -> LogLevel {
        LogLevel::Fatal
    }

    fn fatal(&self, _msg: &str) {}
    fn error(&self, _msg: &str) {}
    fn message(&self, _msg: &str) {}
    fn info(&self, _msg: &str) {}
    fn debug(&self, _msg: &str) {}
    fn trace(&self, _msg: &str) {}
}

#[macro_export]
macro_rules! trace {
    ($logger:expr, $($args : tt) *) => {
        {
            use $crate::logger::{Logger, LogLevel};
            if $logger.enabled(LogLevel::Trace) {
                $logger.trace(&format!($($args)*));
            }
        }
    }
}

#[macro_export]
macro_rules! debug {
    ($logger:expr, $($args : tt) *) => {
        {
            use $crate::logger::{Logger, LogLevel};
            if $logger.enabled(LogLevel::Debug) {
                $logger.debug(&format!($($args)*));
            }
        }
    }
}

#[macro_export]
macro_rules! info {
    ($logger:expr, $($args : tt) *) => {
        {
            use $crate::logger::{Logger, LogLevel};
            if $logger.enabled(LogLevel::Info) {
                $logger.info(&format!($($args)*));
            }
        }
    }
}

#[macro_export]
macro_rules! error {
    ($logger:expr, $($args : tt) *) => {
        {
            use $crate::logger::{Logger, LogLevel};
            if $logger.enabled(LogLevel::Error) {
                $logger.error(&format!($($args)*));
            }
        }
    }
}
