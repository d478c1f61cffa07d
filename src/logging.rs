//! Console formatting for the user-facing stdout layer.
//!
//! Measurement results and diagnostics share one stream, which shapes the
//! format: result lines must stay bare so `netmark host tcp_bw | awk ...`
//! keeps working, while anything the user should act on gets a label and a
//! color. Timestamps and level tags belong to the detailed log layer, not
//! here.

use colored::Colorize;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

/// Renders events as single lines: results plain, problems labeled,
/// debug detail dimmed out of the way of the numbers.
pub struct ConsoleFormatter;

impl ConsoleFormatter {
    /// The `error:`/`warning:` labels scripts and eyes key on.
    fn label(level: Level) -> Option<&'static str> {
        match level {
            Level::ERROR => Some("error:"),
            Level::WARN => Some("warning:"),
            _ => None,
        }
    }
}

impl<S, N> FormatEvent<S, N> for ConsoleFormatter
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
        // Render the fields into a line first; coloring applies to the
        // whole line, and the field formatter writes piecemeal.
        let mut line = String::new();
        ctx.format_fields(Writer::new(&mut line), event)?;

        let level = *event.metadata().level();
        if let Some(label) = Self::label(level) {
            let painted = if level == Level::ERROR {
                label.red().bold()
            } else {
                label.yellow().bold()
            };
            return writeln!(writer, "{} {}", painted, line);
        }
        if level == Level::INFO {
            // Result lines pass through untouched.
            writeln!(writer, "{}", line)
        } else {
            writeln!(writer, "{}", line.dimmed())
        }
    }
}
