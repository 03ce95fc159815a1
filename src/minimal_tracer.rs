// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{
    env,
    fmt::{self, Write},
    sync::atomic::{AtomicU64, Ordering},
};

use tracing::{field::Visit, Id, Level, Metadata, Subscriber};
use tracing_core::{
    span::{Attributes, Record},
    Event, Field,
};

use crate::environment::ENV_RUST_LOG;

struct StringVisitor<'a> {
    string: &'a mut String,
}

impl Visit for StringVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        // writing into a String cannot fail
        let _ = if field.name() == "message" {
            write!(self.string, "{value:?} ")
        } else {
            write!(self.string, "{} = {:?}; ", field.name(), value)
        };
    }
}

#[derive(Debug, Clone, PartialEq)]
struct LogFilter {
    target: Option<String>,
    level: Option<Level>,
}

impl LogFilter {
    fn matches(&self, metadata: &Metadata<'_>) -> bool {
        if let Some(level) = self.level {
            if *metadata.level() != level {
                return false;
            }
        }
        if let Some(target) = &self.target {
            if !metadata.target().starts_with(target.as_str()) {
                return false;
            }
        }
        true
    }
}

fn string_to_level(string: &str) -> Option<Level> {
    match string.to_lowercase().as_str() {
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "warn" | "warning" => Some(Level::WARN),
        "trace" => Some(Level::TRACE),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

// RUST_LOG is a comma separated list of `target`, `level` or `target=level` entries.
fn parse_filters(value: &str) -> Vec<LogFilter> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((target, level)) => LogFilter {
                target: Some(target.to_string()),
                level: string_to_level(level),
            },
            None => match string_to_level(entry) {
                Some(level) => LogFilter {
                    target: None,
                    level: Some(level),
                },
                None => LogFilter {
                    target: Some(entry.to_string()),
                    level: None,
                },
            },
        })
        .collect()
}

/// A bare-bones subscriber that prints every enabled event to stderr.
///
/// Nothing is printed unless `RUST_LOG` is set. An empty filter list enables everything.
pub struct MinimalTracer {
    enabled: bool,
    filters: Vec<LogFilter>,
}

static AUTO_ID: AtomicU64 = AtomicU64::new(1);

impl MinimalTracer {
    fn from_env_value(value: Option<&str>) -> Self {
        match value {
            Some(value) => Self {
                enabled: true,
                filters: parse_filters(value),
            },
            None => Self {
                enabled: false,
                filters: Vec::new(),
            },
        }
    }

    pub fn register() -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
        let value = env::var(ENV_RUST_LOG).ok();
        tracing::subscriber::set_global_default(Self::from_env_value(value.as_deref()))
    }
}

impl Subscriber for MinimalTracer {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        if !self.enabled {
            return false;
        }
        self.filters.is_empty() || self.filters.iter().any(|filter| filter.matches(metadata))
    }

    fn new_span(&self, _span: &Attributes<'_>) -> Id {
        Id::from_u64(AUTO_ID.fetch_add(1, Ordering::Relaxed))
    }

    fn record(&self, _span: &Id, _values: &Record<'_>) {}

    fn record_follows_from(&self, _span: &Id, _follows: &Id) {}

    fn event(&self, event: &Event<'_>) {
        let metadata = event.metadata();

        let mut text = String::new();
        event.record(&mut StringVisitor { string: &mut text });

        eprintln!("{} {}: {}", metadata.level(), metadata.target(), text);
    }

    fn enter(&self, _span: &Id) {}

    fn exit(&self, _span: &Id) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_targets_and_levels() {
        assert_eq!(
            parse_filters("weir_stream_web=trace, debug,weir_abort"),
            vec![
                LogFilter {
                    target: Some("weir_stream_web".into()),
                    level: Some(Level::TRACE),
                },
                LogFilter {
                    target: None,
                    level: Some(Level::DEBUG),
                },
                LogFilter {
                    target: Some("weir_abort".into()),
                    level: None,
                },
            ]
        );
    }

    #[test]
    fn disabled_without_rust_log() {
        let tracer = MinimalTracer::from_env_value(None);
        assert!(!tracer.enabled);

        let tracer = MinimalTracer::from_env_value(Some(""));
        assert!(tracer.enabled);
        assert!(tracer.filters.is_empty());
    }
}
