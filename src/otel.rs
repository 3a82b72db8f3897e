// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! OpenTelemetry context propagation through AMQP message headers.
//!
//! Outgoing publishes carry the current trace context in their headers;
//! each consumed delivery is processed inside a consumer span linked to the
//! context extracted from those headers.

use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};

/// Collects the propagation fields emitted for an outgoing message; they are
/// merged into the message headers once the propagator is done.
#[derive(Default)]
struct HeaderInjector {
    captured: Vec<(ShortString, AMQPValue)>,
}

impl Injector for HeaderInjector {
    fn set(&mut self, key: &str, value: String) {
        let key = ShortString::from(key.to_lowercase());
        self.captured.push((key, AMQPValue::LongString(value.into())));
    }
}

/// Reads propagation fields straight out of a delivery's header table.
struct HeaderExtractor<'a> {
    headers: Option<&'a FieldTable>,
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.headers?.inner().get(&ShortString::from(key))? {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes()).ok(),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        match self.headers {
            Some(table) => table.inner().keys().map(ShortString::as_str).collect(),
            None => Vec::new(),
        }
    }
}

/// Returns the properties with the current trace context injected into the
/// message headers. Properties pass through untouched when the propagator
/// emits nothing.
pub(crate) fn inject_current_context(properties: BasicProperties) -> BasicProperties {
    let mut injector = HeaderInjector::default();
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&Context::current(), &mut injector)
    });

    if injector.captured.is_empty() {
        return properties;
    }

    let mut headers = properties.headers().clone().unwrap_or_default();
    for (key, value) in injector.captured {
        headers.insert(key, value);
    }

    properties.with_headers(headers)
}

/// Extracts the upstream context from the delivery headers and opens a
/// consumer span for processing it.
pub(crate) fn consumer_span(
    properties: &BasicProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let extractor = HeaderExtractor {
        headers: properties.headers().as_ref(),
    };
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&extractor)
    });

    let span = tracer
        .span_builder(name.to_owned())
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extractor_reads_long_string_headers() {
        let mut table = FieldTable::default();
        table.insert(
            "traceparent".into(),
            AMQPValue::LongString("00-abc-def-01".into()),
        );
        table.insert("weight".into(), AMQPValue::LongInt(3.into()));

        let extractor = HeaderExtractor {
            headers: Some(&table),
        };

        assert_eq!(extractor.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(extractor.get("weight"), None);
        assert_eq!(extractor.get("missing"), None);
        assert_eq!(extractor.keys(), vec!["traceparent", "weight"]);
    }

    #[test]
    fn absent_header_table_extracts_nothing() {
        let extractor = HeaderExtractor { headers: None };

        assert_eq!(extractor.get("traceparent"), None);
        assert!(extractor.keys().is_empty());
    }

    #[test]
    fn injector_lowercases_captured_keys() {
        let mut injector = HeaderInjector::default();
        injector.set("TraceParent", "00-abc-def-01".to_owned());

        assert_eq!(injector.captured.len(), 1);
        assert_eq!(injector.captured[0].0.as_str(), "traceparent");
    }
}
