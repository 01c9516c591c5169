use colored::*;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

/// Event formatter for the daemons' `-O` (log to stdout) mode.
///
/// Every line is prefixed `program[pid] L:` where `L` is the one-letter
/// severity tag matching the `-T` scale, and only the prefix is tinted, so
/// multi-daemon output stays greppable by program name and level letter.
/// The log-file layer uses the plain formatter instead.
pub struct DaemonLogFormatter {
    program: String,
    pid: u32,
}

impl DaemonLogFormatter {
    /// Formatter tagging lines with `program` and this process's pid.
    pub fn new(program: &str) -> DaemonLogFormatter {
        DaemonLogFormatter {
            program: program.to_string(),
            pid: std::process::id(),
        }
    }

    /// One-letter severity tag, in the daemons' `-T` ordering.
    fn level_tag(level: Level) -> &'static str {
        match level {
            Level::ERROR => "E",
            Level::WARN => "W",
            Level::INFO => "I",
            Level::DEBUG => "D",
            Level::TRACE => "T",
        }
    }
}

impl<S, N> FormatEvent<S, N> for DaemonLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let level = *event.metadata().level();
        let prefix = format!("{}[{}] {}:", self.program, self.pid, Self::level_tag(level));
        let tinted = match level {
            Level::ERROR => prefix.red().bold(),
            Level::WARN => prefix.yellow(),
            Level::INFO => prefix.green(),
            Level::DEBUG => prefix.blue(),
            Level::TRACE => prefix.dimmed(),
        };
        write!(writer, "{} ", tinted)?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Map the daemons' numeric `-T <0..5>` trace level to a tracing filter.
///
/// 0 turns logging off entirely; 5 is the most verbose. Values above 5 are
/// clamped to TRACE.
pub fn level_filter(trace_level: u8) -> LevelFilter {
    match trace_level {
        0 => LevelFilter::OFF,
        1 => LevelFilter::ERROR,
        2 => LevelFilter::WARN,
        3 => LevelFilter::INFO,
        4 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}
