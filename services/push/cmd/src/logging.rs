//! Log line formatting for the push client.
//!
//! Lines look like `[timestamp] [component] [level] message`. Events carrying
//! a `component` field are attributed to `push-<component>`.

use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const COMPONENT_WIDTH: usize = 20;
const LEVEL_WIDTH: usize = 9;

/// Log formatter for the push client
pub struct PushLogFormatter {
    service_name: String,
    color_enabled: bool,
}

/// Log at info level attributed to a component
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

/// Log at warn level attributed to a component
#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

/// Log at debug level attributed to a component
#[macro_export]
macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

/// Log at error level attributed to a component
#[macro_export]
macro_rules! component_error {
    ($component:expr, $($arg:tt)*) => {
        tracing::error!(component = $component, $($arg)*)
    };
}

impl PushLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: color_supported(),
        }
    }

    /// Fixed-width column naming the emitting component
    fn component_column(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(component) => format!("push-{}", component),
            None => self.service_name.clone(),
        };

        if name.chars().count() > COMPONENT_WIDTH {
            let truncated: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    fn level_column(level: &Level) -> String {
        let label = match *level {
            Level::ERROR => "✗ ERROR",
            Level::WARN => "⚠ WARN",
            Level::INFO => "ℹ INFO",
            Level::DEBUG => "◦ DEBUG",
            Level::TRACE => "◦ TRACE",
        };
        format!("{:<width$}", label, width = LEVEL_WIDTH)
    }

    fn level_color(&self, level: &Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }
        match *level {
            Level::ERROR => COLOR_BRIGHT_RED,
            Level::WARN => COLOR_BRIGHT_YELLOW,
            Level::INFO => COLOR_GREEN,
            Level::DEBUG | Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }

    fn paint(&self, color: &'static str) -> &'static str {
        if self.color_enabled {
            color
        } else {
            ""
        }
    }
}

impl<S, N> FormatEvent<S, N> for PushLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let level = event.metadata().level();

        let mut fields = EventFields::default();
        event.record(&mut fields);

        write!(
            writer,
            "{}[{}] [{}] [{}{}{}] ",
            self.paint(COLOR_CYAN),
            timestamp,
            self.component_column(fields.component.as_deref()),
            self.level_color(level),
            Self::level_column(level),
            self.paint(COLOR_RESET),
        )?;
        writeln!(writer, "{}{}", fields.message, self.paint(COLOR_RESET))
    }
}

/// Message and component extracted from an event
#[derive(Default)]
struct EventFields {
    message: String,
    component: Option<String>,
}

impl tracing::field::Visit for EventFields {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        let unquoted = rendered
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .map(str::to_string)
            .unwrap_or(rendered);
        match field.name() {
            "message" => self.message = unquoted,
            "component" => self.component = Some(unquoted),
            _ => {}
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            _ => {}
        }
    }
}

fn color_supported() -> bool {
    match std::env::var("TERM") {
        Ok(term) => term != "dumb" && std::io::stdout().is_terminal(),
        Err(_) => false,
    }
}
