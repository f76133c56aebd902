//! Tracing subscriber bootstrap for the pypihub binaries.
//!
//! Settings come from `PYPIHUB_LOG_*` environment variables; `RUST_LOG`
//! still wins over the configured level when it is set.

use std::{
    env,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt::MakeWriter, prelude::*, registry, EnvFilter};

const DEFAULT_LOG_FILE: &str = "/tmp/pypihub.log";

/// Output encoding for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

/// Where log lines are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
    None,
}

impl LogOutput {
    fn console(self) -> bool {
        matches!(self, LogOutput::Console | LogOutput::Both)
    }

    fn file(self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
    pub file_path: PathBuf,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Human,
            output: LogOutput::Console,
            file_path: PathBuf::from(DEFAULT_LOG_FILE),
        }
    }
}

impl LogSettings {
    /// Read settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read settings through an arbitrary variable lookup.
    ///
    /// Unknown values fall back to the defaults instead of failing, so a typo
    /// in a deployment never prevents the server from starting.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let level = lookup("PYPIHUB_LOG_LEVEL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.level);

        let format = match lookup("PYPIHUB_LOG_FORMAT").as_deref().map(str::trim) {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Human,
        };

        let output = match lookup("PYPIHUB_LOG_OUTPUT").as_deref().map(str::trim) {
            Some("file") => LogOutput::File,
            Some("both") => LogOutput::Both,
            Some("none") => LogOutput::None,
            _ => LogOutput::Console,
        };

        let file_path = lookup("PYPIHUB_LOG_FILE")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.file_path);

        Self {
            level,
            format,
            output,
            file_path,
        }
    }

    fn env_filter(&self) -> EnvFilter {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        ["hyper=warn", "reqwest=warn", "h2=warn"]
            .into_iter()
            .filter_map(|directive| directive.parse().ok())
            .fold(filter, |filter, directive| filter.add_directive(directive))
    }
}

// Duplicates every write to two sinks. A failure on one side is reported
// only when the other side failed too.
struct Tee<A, B> {
    a: A,
    b: B,
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res_a = self.a.write_all(buf).map(|_| buf.len());
        let res_b = self.b.write_all(buf).map(|_| buf.len());
        res_a.or(res_b)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.a.flush()?;
        self.b.flush()
    }
}

#[derive(Clone)]
struct MakeTee<A, B> {
    make_a: A,
    make_b: B,
}

impl<'a, A, B> MakeWriter<'a> for MakeTee<A, B>
where
    A: MakeWriter<'a>,
    B: MakeWriter<'a>,
{
    type Writer = Tee<A::Writer, B::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        Tee {
            a: self.make_a.make_writer(),
            b: self.make_b.make_writer(),
        }
    }
}

fn file_writer(path: &Path) -> (tracing_appender::non_blocking::NonBlocking, WorkerGuard) {
    let dir = path.parent().unwrap_or_else(|| Path::new("/tmp"));
    let name = path.file_name().unwrap_or("pypihub.log".as_ref());
    tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name))
}

/// Installs the global tracing subscriber.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the lifetime of the process when file output is enabled. Calling this more
/// than once is harmless: later calls leave the first subscriber in place.
pub fn init_subscriber(settings: &LogSettings) -> Option<WorkerGuard> {
    let subscriber = registry().with(settings.env_filter());
    let json = settings.format == LogFormat::Json;

    macro_rules! install {
        ($writer:expr) => {{
            let layer = tracing_subscriber::fmt::layer().with_writer($writer);
            if json {
                let _ = subscriber.with(layer.json()).try_init();
            } else {
                let _ = subscriber.with(layer).try_init();
            }
        }};
    }

    match (settings.output.console(), settings.output.file()) {
        (true, true) => {
            let (non_blocking, guard) = file_writer(&settings.file_path);
            install!(MakeTee {
                make_a: io::stdout,
                make_b: non_blocking,
            });
            Some(guard)
        }
        (true, false) => {
            install!(io::stdout);
            None
        }
        (false, true) => {
            let (non_blocking, guard) = file_writer(&settings.file_path);
            install!(non_blocking);
            Some(guard)
        }
        (false, false) => {
            let _ = subscriber.try_init();
            None
        }
    }
}
