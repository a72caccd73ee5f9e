//! Trace context for distributed tracing.
//!
//! Only active when the `trace-propagation` feature is enabled. When
//! disabled, `TraceContext` serializes to an empty vector and all operations
//! are no-ops.

#[cfg(feature = "trace-propagation")]
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
#[cfg(feature = "trace-propagation")]
use opentelemetry_sdk::propagation::TraceContextPropagator;

use borsh::{BorshDeserialize, BorshSerialize};

/// Trace context carrier for network messages.
///
/// With the `trace-propagation` feature, carries W3C Trace Context headers
/// across replicas. Without it, a zero-overhead placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct TraceContext {
    /// W3C Trace Context headers (traceparent, tracestate).
    /// Empty when the feature is disabled.
    pub headers: Vec<(String, String)>,
}

impl TraceContext {
    /// Capture the current span's context.
    #[allow(unused_variables)]
    pub fn from_current() -> Self {
        #[cfg(feature = "trace-propagation")]
        {
            let propagator = TraceContextPropagator::new();
            let mut headers = Vec::new();
            let cx = opentelemetry::Context::current();
            propagator.inject_context(&cx, &mut VecInjector(&mut headers));
            Self { headers }
        }
        #[cfg(not(feature = "trace-propagation"))]
        {
            Self {
                headers: Vec::new(),
            }
        }
    }

    /// Extract the carried context.
    #[cfg(feature = "trace-propagation")]
    pub fn extract(&self) -> opentelemetry::Context {
        let propagator = TraceContextPropagator::new();
        propagator.extract(&VecExtractor(&self.headers))
    }

    /// Whether trace propagation is compiled in.
    pub const fn is_enabled() -> bool {
        cfg!(feature = "trace-propagation")
    }

    /// Whether this context carries trace data.
    pub fn has_trace(&self) -> bool {
        !self.headers.is_empty()
    }
}

/// Injector that writes headers to a Vec.
#[cfg(feature = "trace-propagation")]
struct VecInjector<'a>(&'a mut Vec<(String, String)>);

#[cfg(feature = "trace-propagation")]
impl Injector for VecInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.push((key.to_string(), value));
    }
}

/// Extractor that reads headers from a Vec.
#[cfg(feature = "trace-propagation")]
struct VecExtractor<'a>(&'a [(String, String)]);

#[cfg(feature = "trace-propagation")]
impl Extractor for VecExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.iter().map(|(k, _)| k.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_empty() {
        let ctx = TraceContext::default();
        assert!(ctx.headers.is_empty());
        assert!(!ctx.has_trace());
    }

    #[test]
    fn from_current_without_span() {
        let ctx = TraceContext::from_current();
        assert!(!ctx.has_trace() || TraceContext::is_enabled());
    }
}
