//! Tracing setup and log capture.
//!
//! The components only emit `tracing` events; installing a subscriber is left
//! to the embedding application. [`init_tracing`] is a ready-made one that
//! honours `RUST_LOG`, `PACER_LOG` and `LOG_FORMAT`.

use tokio::sync::mpsc;
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global stderr subscriber.
///
/// `RUST_LOG` takes precedence. Otherwise `PACER_LOG` (`trace`, `debug`,
/// `info`, `warn`, `error`) selects the level of the `pacer` target.
/// `LOG_FORMAT=json` switches to JSON lines. Does nothing if a global
/// subscriber already exists.
pub fn init_tracing() {
    let rust_log = std::env::var("RUST_LOG").ok();
    let pacer_log = std::env::var("PACER_LOG").ok();
    let filter = EnvFilter::builder()
        .parse_lossy(filter_directive(rust_log.as_deref(), pacer_log.as_deref()));

    let registry = tracing_subscriber::registry().with(filter);
    let _ = if wants_json(std::env::var("LOG_FORMAT").ok().as_deref()) {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
}

/// Filter directives for the given `RUST_LOG` and `PACER_LOG` values.
fn filter_directive(rust_log: Option<&str>, pacer_log: Option<&str>) -> String {
    if let Some(directives) = rust_log.filter(|d| !d.trim().is_empty()) {
        return directives.to_string();
    }
    let level = match pacer_log.map(|l| l.trim().to_ascii_lowercase()).as_deref() {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn" | "warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("pacer={level}")
}

fn wants_json(log_format: Option<&str>) -> bool {
    log_format.is_some_and(|f| f.eq_ignore_ascii_case("json"))
}

/// Layer forwarding every event as `[LEVEL target] message key=value...`
/// into an unbounded channel.
pub struct LogCollector {
    tx: mpsc::UnboundedSender<String>,
}

impl LogCollector {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    /// Collector plus the receiving end to drain with [`drain_collected_logs`].
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl<S> Layer<S> for LogCollector
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if self.tx.is_closed() {
            return;
        }

        let metadata = event.metadata();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut line = format!(
            "[{} {}] {}",
            metadata.level(),
            metadata.target(),
            visitor.message
        );
        for (name, value) in visitor.fields {
            line.push_str(&format!(" {name}={value}"));
        }
        let _ = self.tx.send(line);
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: Vec<(&'static str, String)>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let mut rendered = format!("{:?}", value);
        if rendered.len() >= 2 && rendered.starts_with('"') && rendered.ends_with('"') {
            rendered = rendered[1..rendered.len() - 1].to_string();
        }
        if field.name() == "message" {
            self.message = rendered;
        } else {
            self.fields.push((field.name(), rendered));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name(), value.to_string()));
        }
    }
}

/// Join everything collected so far, one event per line.
pub fn drain_collected_logs(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    let mut lines = Vec::new();
    while let Ok(line) = rx.try_recv() {
        lines.push(line);
    }

    if lines.is_empty() {
        String::new()
    } else {
        let mut result = lines.join("\n");
        result.push('\n');
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_formats_level_target_and_fields() {
        let (collector, mut rx) = LogCollector::channel();
        let subscriber = tracing_subscriber::registry().with(collector);

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "pacer::queue", queue = "saves", backlog = 3, "Backlog growing");
        });

        let logs = drain_collected_logs(&mut rx);
        assert_eq!(
            logs,
            "[WARN pacer::queue] Backlog growing queue=saves backlog=3\n"
        );
    }

    #[test]
    fn rust_log_takes_precedence() {
        assert_eq!(
            filter_directive(Some("pacer::queue=trace,tokio=warn"), Some("error")),
            "pacer::queue=trace,tokio=warn"
        );
        assert_eq!(filter_directive(Some("  "), Some("debug")), "pacer=debug");
    }

    #[test]
    fn pacer_log_selects_level() {
        let cases = [
            (Some("trace"), "pacer=trace"),
            (Some("DEBUG"), "pacer=debug"),
            (Some("warning"), "pacer=warn"),
            (Some("error"), "pacer=error"),
            (Some("verbose"), "pacer=info"),
            (None, "pacer=info"),
        ];
        for (pacer_log, expected) in cases {
            assert_eq!(filter_directive(None, pacer_log), expected, "{pacer_log:?}");
        }
    }

    #[test]
    fn log_format_json() {
        assert!(wants_json(Some("json")));
        assert!(wants_json(Some("JSON")));
        assert!(!wants_json(Some("text")));
        assert!(!wants_json(None));
    }

    #[test]
    fn init_tracing_tolerates_existing_subscriber() {
        init_tracing();
        init_tracing();
        tracing::info!(target: "pacer", "still logging");
    }

    #[test]
    fn drain_empty_is_empty_string() {
        let (_collector, mut rx) = LogCollector::channel();
        assert_eq!(drain_collected_logs(&mut rx), "");
    }

    #[test]
    fn collector_stops_after_receiver_dropped() {
        let (collector, rx) = LogCollector::channel();
        drop(rx);
        let subscriber = tracing_subscriber::registry().with(collector);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("nobody is listening");
        });
    }
}
