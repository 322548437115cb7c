use anyhow::Context;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, MakeWriter};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Log lines are stamped in UTC+8.
const LOG_OFFSET_SECS: i32 = 8 * 3600;

const OTLP_ENDPOINT_VAR: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Renders `2024-05-01 20:00:00:123` style timestamps in UTC+8.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utc8Timer;

impl FormatTime for Utc8Timer {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(w, "{}", format_timestamp(Utc::now()))
    }
}

pub fn format_timestamp(now: DateTime<Utc>) -> String {
    let offset = FixedOffset::east_opt(LOG_OFFSET_SECS).unwrap_or_else(|| Utc.fix());
    now.with_timezone(&offset)
        .format("%Y-%m-%d %H:%M:%S:%3f")
        .to_string()
}

/// `<timestamp> <LEVEL> <message>` with no span context, so stdout reads as
/// one timestamped message per line. Spans still reach the OTLP exporter.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogLineFormat;

impl<S, N> FormatEvent<S, N> for LogLineFormat
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
        Utc8Timer.format_time(&mut writer)?;
        write!(writer, " {} ", event.metadata().level())?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// The stdout layer installed by [`init_tracing`], generic over its writer.
pub fn log_line_layer<S, W>(make_writer: W, ansi: bool) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .event_format(LogLineFormat)
        .with_ansi(ansi)
        .with_writer(make_writer)
}

/// Keeps the OTLP pipeline alive until the process is done logging.
pub struct Telemetry {
    provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn shutdown(self) {
        if let Some(provider) = self.provider
            && let Err(e) = provider.shutdown()
        {
            eprintln!("Failed to shut down tracer provider: {e}");
        }
    }
}

/// Installs the global subscriber. Spans are exported over OTLP only when
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
pub fn init_tracing() -> anyhow::Result<Telemetry> {
    let provider = if std::env::var_os(OTLP_ENDPOINT_VAR).is_some() {
        let otlp_exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .build()
            .context("Failed to create OTLP exporter")?;
        Some(
            SdkTracerProvider::builder()
                .with_batch_exporter(otlp_exporter)
                .build(),
        )
    } else {
        None
    };

    let telemetry = provider
        .as_ref()
        .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer("gha-run-purger")));
    let fmt_layer = log_line_layer(std::io::stdout, std::io::stdout().is_terminal());

    tracing_subscriber::registry()
        .with(telemetry)
        .with(fmt_layer)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(Telemetry { provider })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn captured_lines(emit: impl FnOnce()) -> Vec<String> {
        let buffer = Buffer::default();
        let make_writer = {
            let buffer = buffer.clone();
            move || buffer.clone()
        };
        let subscriber = tracing_subscriber::registry().with(log_line_layer(make_writer, false));
        tracing::subscriber::with_default(subscriber, emit);

        let bytes = buffer.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// `YYYY-MM-DD HH:MM:SS:mmm ` with digits exactly where expected.
    fn starts_with_timestamp(line: &str) -> bool {
        let pattern = "dddd-dd-dd dd:dd:dd:ddd ";
        line.len() > pattern.len()
            && pattern.bytes().zip(line.bytes()).all(|(p, c)| match p {
                b'd' => c.is_ascii_digit(),
                _ => p == c,
            })
    }

    #[test]
    fn test_log_line_is_timestamp_level_message() {
        let lines = captured_lines(|| {
            let span = tracing::info_span!("sweep", sweep = 1);
            let _enter = span.enter();
            tracing::info!("Fetching page {}", 1);
            tracing::warn!("Failed to delete run with ID {}. Status code: {}", 9, 404);
        });

        assert_eq!(lines.len(), 2, "{lines:?}");
        for line in &lines {
            assert!(starts_with_timestamp(line), "{line:?}");
            assert!(!line.contains('\u{1b}'), "{line:?}");
            assert!(!line.contains("sweep{"), "{line:?}");
        }
        assert_eq!(&lines[0][24..], "INFO Fetching page 1");
        assert_eq!(
            &lines[1][24..],
            "WARN Failed to delete run with ID 9. Status code: 404"
        );
    }

    #[test]
    fn test_timestamp_is_shifted_to_utc8_with_millis() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
            + chrono::TimeDelta::milliseconds(7);
        assert_eq!(format_timestamp(now), "2024-05-01 20:00:00:007");
    }

    #[test]
    fn test_timestamp_rolls_over_midnight() {
        let now = Utc.with_ymd_and_hms(2024, 12, 31, 16, 30, 15).unwrap()
            + chrono::TimeDelta::milliseconds(999);
        assert_eq!(format_timestamp(now), "2025-01-01 00:30:15:999");
    }
}
