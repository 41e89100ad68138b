// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log line formatting for hosts that do not install their own subscriber.
//!
//! Lines look like:
//! ```text
//! KAFKA_OUTPUT | DEBUG | Kafka: Delivered! t=1.2ms messages=40
//! KAFKA_OUTPUT | WARN | produce{broker=1}: Kafka broker kafka-1:9092 unavailable
//! ```

use std::fmt;

use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

pub const PREFIX: &str = "KAFKA_OUTPUT";

/// Event formatter writing `KAFKA_OUTPUT | LEVEL | spans: message fields`.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(&mut writer, "{PREFIX} | {} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs a global subscriber using [`Formatter`]. `level` is an
/// `EnvFilter` directive such as `debug` or `kafka_output=debug,warn`.
pub fn init(level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_new(level)?)
        .event_format(Formatter)
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Capture {
        type Writer = Capture;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn capture(f: impl FnOnce()) -> String {
        let capture = Capture::default();
        let subscriber = tracing_subscriber::fmt::Subscriber::builder()
            .with_writer(capture.clone())
            .with_ansi(false)
            .event_format(Formatter)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = capture.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn formats_level_and_fields() {
        let out = capture(|| tracing::info!(messages = 3, "Kafka: Delivered!"));
        assert_eq!(out, "KAFKA_OUTPUT | INFO | Kafka: Delivered! messages=3\n");
    }

    #[test]
    fn includes_span_context() {
        let out = capture(|| {
            let span = tracing::info_span!("produce", broker = 1);
            let _guard = span.enter();
            tracing::warn!("retrying");
        });
        assert_eq!(out, "KAFKA_OUTPUT | WARN | produce{broker=1}: retrying\n");
    }

    #[test]
    fn init_rejects_bad_filter() {
        assert!(init("kafka_output=notalevel").is_err());
    }
}
