//! Observability: metrics derived from routing outcomes
//!
//! What this module provides
//! - Counters and latency histograms for every routed request, fed to an injected collector
//! - Spans and events come from `tracing` at the call sites themselves
//!
//! Exports
//! - Models
//!   - `MetricRecord::{Counter{name, value}, Histogram{name, value}}`
//! - Layers
//!   - `MetricsLayer<C>` wrapping any `Service<RoutingRequest, Response=RouteResponse>`
//! - Services
//!   - `MetricsCollector: Service<MetricRecord, Response=()>`
//!   - Impl: `RecordingCollector` (keeps records in memory)
//!
//! Implementation strategy
//! - Everything is read off the `RouteResponse`: decision fallback, handler outcomes,
//!   batch accounting, confirmation suspension
//! - Collector errors never fail the request
//!
//! Testing strategy
//! - A fake routing service returning canned responses; assert the recorded metrics

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tower::util::BoxCloneSyncService;
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::trace;

use crate::model::{AgentResponse, ResponseBody, RouteResponse, RoutingRequest};

pub const ROUTES_TOTAL: &str = "routes_total";
pub const ROUTE_ERRORS: &str = "route_errors";
pub const FALLBACKS: &str = "fallbacks";
pub const HANDLER_FAILURES: &str = "handler_failures";
pub const CONFIRMATIONS_PENDING: &str = "confirmations_pending";
pub const PARALLEL_BATCHES: &str = "parallel_batches";
pub const HANDLER_LATENCY_MS: &str = "handler_latency_ms";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricRecord {
    Counter { name: &'static str, value: u64 },
    Histogram { name: &'static str, value: u64 },
}

pub trait MetricsCollector: Service<MetricRecord, Response = (), Error = BoxError> {}
impl<T> MetricsCollector for T where T: Service<MetricRecord, Response = (), Error = BoxError> {}

/// Boxed collector type alias.
pub type CollectorSvc = BoxCloneSyncService<MetricRecord, (), BoxError>;

fn handler_records(r: &AgentResponse, out: &mut Vec<MetricRecord>) {
    out.push(MetricRecord::Histogram {
        name: HANDLER_LATENCY_MS,
        value: r.duration.as_millis() as u64,
    });
    if !r.success {
        out.push(MetricRecord::Counter {
            name: HANDLER_FAILURES,
            value: 1,
        });
    }
}

/// Metric records an outcome produces, in a stable order.
pub fn records_for(response: &RouteResponse) -> Vec<MetricRecord> {
    let mut out = vec![MetricRecord::Counter {
        name: ROUTES_TOTAL,
        value: 1,
    }];
    match &response.body {
        ResponseBody::Answer { decision, response } => {
            if decision.fallback.is_some() {
                out.push(MetricRecord::Counter {
                    name: FALLBACKS,
                    value: 1,
                });
            }
            handler_records(response, &mut out);
        }
        ResponseBody::Batch(batch) => {
            out.push(MetricRecord::Counter {
                name: PARALLEL_BATCHES,
                value: 1,
            });
            for r in &batch.responses {
                handler_records(r, &mut out);
            }
        }
        ResponseBody::Confirmation { decision, .. } => {
            if decision.fallback.is_some() {
                out.push(MetricRecord::Counter {
                    name: FALLBACKS,
                    value: 1,
                });
            }
            out.push(MetricRecord::Counter {
                name: CONFIRMATIONS_PENDING,
                value: 1,
            });
        }
    }
    out
}

/// Layer that translates routing outcomes to metric updates via an injected collector.
#[derive(Clone)]
pub struct MetricsLayer<C> {
    collector: C,
}

impl<C> MetricsLayer<C> {
    pub fn new(collector: C) -> Self {
        Self { collector }
    }
}

#[derive(Clone)]
pub struct Metrics<S, C> {
    inner: S,
    collector: C,
}

impl<S, C> Layer<S> for MetricsLayer<C>
where
    C: Clone,
{
    type Service = Metrics<S, C>;
    fn layer(&self, inner: S) -> Self::Service {
        Metrics {
            inner,
            collector: self.collector.clone(),
        }
    }
}

impl<S, C> Service<RoutingRequest> for Metrics<S, C>
where
    S: Service<RoutingRequest, Response = RouteResponse, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
    C: MetricsCollector + Clone + Send + 'static,
    C::Future: Send + 'static,
{
    type Response = RouteResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: RoutingRequest) -> Self::Future {
        let mut collector = self.collector.clone();
        let fut = self.inner.call(req);
        Box::pin(async move {
            let out = fut.await;
            let records = match &out {
                Ok(resp) => records_for(resp),
                Err(_) => vec![
                    MetricRecord::Counter {
                        name: ROUTES_TOTAL,
                        value: 1,
                    },
                    MetricRecord::Counter {
                        name: ROUTE_ERRORS,
                        value: 1,
                    },
                ],
            };
            for record in records {
                trace!(?record, "metric");
                if let Ok(ready) = ServiceExt::ready(&mut collector).await {
                    let _ = ready.call(record).await;
                }
            }
            out
        })
    }
}

/// Collector keeping every record in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingCollector {
    records: Arc<Mutex<Vec<MetricRecord>>>,
}

impl RecordingCollector {
    pub fn records(&self) -> Vec<MetricRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Sum of a counter's values.
    pub fn counter(&self, name: &str) -> u64 {
        self.records()
            .iter()
            .filter_map(|r| match r {
                MetricRecord::Counter { name: n, value } if *n == name => Some(*value),
                _ => None,
            })
            .sum()
    }
}

impl Service<MetricRecord> for RecordingCollector {
    type Response = ();
    type Error = BoxError;
    type Future = std::future::Ready<Result<(), BoxError>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: MetricRecord) -> Self::Future {
        if let Ok(mut records) = self.records.lock() {
            records.push(req);
        }
        std::future::ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FallbackReason, ParallelBatchResult, RoutingDecision};
    use std::collections::HashMap;
    use std::time::Duration;
    use tower::service_fn;

    fn request() -> RoutingRequest {
        RoutingRequest::builder("u1", "s1").message("hi").build().unwrap()
    }

    #[tokio::test]
    async fn metrics_layer_records_fallback_and_latency() {
        let inner = service_fn(|_req: RoutingRequest| async move {
            let decision = RoutingDecision::new("health", 0.1, "weak match", "keyword").fall_back(
                "general",
                FallbackReason::LowConfidence {
                    confidence: 0.1,
                    floor: 0.3,
                },
            );
            Ok::<_, BoxError>(RouteResponse::answer(
                decision,
                AgentResponse::succeeded("general", "hello", 0.8, Duration::from_millis(12)),
            ))
        });
        let collector = RecordingCollector::default();
        let svc = MetricsLayer::new(collector.clone()).layer(inner);
        svc.oneshot(request()).await.unwrap();

        assert_eq!(collector.counter(ROUTES_TOTAL), 1);
        assert_eq!(collector.counter(FALLBACKS), 1);
        assert_eq!(collector.counter(HANDLER_FAILURES), 0);
        assert!(collector.records().contains(&MetricRecord::Histogram {
            name: HANDLER_LATENCY_MS,
            value: 12
        }));
    }

    #[test]
    fn batch_counts_each_failure() {
        let batch = ParallelBatchResult {
            responses: vec![
                AgentResponse::succeeded("a", "ok", 0.9, Duration::from_millis(3)),
                AgentResponse::failed("b", "timeout", Duration::from_millis(50)),
                AgentResponse::failed("c", "boom", Duration::from_millis(1)),
            ],
            summary: String::new(),
            confidences: HashMap::new(),
        };
        let records = records_for(&RouteResponse::batch(batch));
        let failures = records
            .iter()
            .filter(|r| matches!(r, MetricRecord::Counter { name, .. } if *name == HANDLER_FAILURES))
            .count();
        assert_eq!(failures, 2);
        assert!(records.contains(&MetricRecord::Counter {
            name: PARALLEL_BATCHES,
            value: 1
        }));
    }

    #[tokio::test]
    async fn errors_are_counted_and_passed_through() {
        let inner = service_fn(|_req: RoutingRequest| async move {
            Err::<RouteResponse, BoxError>("bad request".into())
        });
        let collector = RecordingCollector::default();
        let err = MetricsLayer::new(collector.clone())
            .layer(inner)
            .oneshot(request())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad request"));
        assert_eq!(collector.counter(ROUTE_ERRORS), 1);
    }
}
