//! Prometheus collectors for the hub and the HTTP request middleware.
//!
//! Everything registers into the default registry on first use; `/metrics`
//! serves whatever has been touched so far.

use std::rc::Rc;
use std::time::Instant;

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::StatusCode,
    Error, HttpResponse,
};
use futures::future::{ready, LocalBoxFuture, Ready};
use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{
    exponential_buckets, Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter,
    IntCounterVec, IntGaugeVec, Opts, TextEncoder,
};
use tracing::error;

const UNMATCHED_ROUTE: &str = "unmatched";

fn registered<C: Collector + Clone + 'static>(collector: C) -> C {
    prometheus::default_registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register hub metric");
    collector
}

static HTTP_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    registered(
        IntCounterVec::new(
            Opts::new(
                "realtime_hub_http_requests_total",
                "HTTP requests by route pattern and status",
            ),
            &["method", "route", "status"],
        )
        .expect("valid realtime_hub_http_requests_total"),
    )
});

static HTTP_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    let buckets = exponential_buckets(0.001, 2.5, 10).expect("valid latency buckets");
    registered(
        HistogramVec::new(
            HistogramOpts::new(
                "realtime_hub_http_request_duration_seconds",
                "Time to produce an HTTP response, including WebSocket handshakes",
            )
            .buckets(buckets),
            &["method", "route"],
        )
        .expect("valid realtime_hub_http_request_duration_seconds"),
    )
});

/// Open sessions on this instance, by channel (`chat`, `notification`)
pub static ACTIVE_CONNECTIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
    registered(
        IntGaugeVec::new(
            Opts::new(
                "realtime_hub_active_connections",
                "WebSocket connections open on this instance",
            ),
            &["channel"],
        )
        .expect("valid realtime_hub_active_connections"),
    )
});

pub static MESSAGES_RELAYED: Lazy<IntCounter> = Lazy::new(|| {
    registered(
        IntCounter::new(
            "realtime_hub_messages_relayed_total",
            "Chat messages persisted and relayed",
        )
        .expect("valid realtime_hub_messages_relayed_total"),
    )
});

/// Labelled by delivery path: `immediate`, `scheduled` or `broadcast`
pub static NOTIFICATIONS_DELIVERED: Lazy<IntCounterVec> = Lazy::new(|| {
    registered(
        IntCounterVec::new(
            Opts::new(
                "realtime_hub_notifications_delivered_total",
                "Notifications handed to the fanout",
            ),
            &["path"],
        )
        .expect("valid realtime_hub_notifications_delivered_total"),
    )
});

pub static BACKPLANE_PUBLISH_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    registered(
        IntCounter::new(
            "realtime_hub_backplane_publish_failures_total",
            "Frames that could not be published to other instances",
        )
        .expect("valid realtime_hub_backplane_publish_failures_total"),
    )
});

pub static SCHEDULER_POLL_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let buckets = exponential_buckets(0.005, 3.0, 8).expect("valid poll buckets");
    registered(
        Histogram::with_opts(
            HistogramOpts::new(
                "realtime_hub_scheduler_poll_seconds",
                "Duration of one scheduled-notification poll",
            )
            .buckets(buckets),
        )
        .expect("valid realtime_hub_scheduler_poll_seconds"),
    )
});

fn record_request(method: &str, route: &str, status: StatusCode, started: Instant) {
    HTTP_REQUESTS
        .with_label_values(&[method, route, status.as_str()])
        .inc();
    HTTP_LATENCY
        .with_label_values(&[method, route])
        .observe(started.elapsed().as_secs_f64());
}

/// `GET /metrics`
pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let mut body = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut body) {
        error!(error = %e, "Failed to encode metrics");
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(body)
}

/// Counts and times every request against its route pattern, so
/// `/api/v1/presence/alice` and `/api/v1/presence/bob` share one series.
pub struct RequestMetrics;

impl<S, B> Transform<S, ServiceRequest> for RequestMetrics
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestMetricsService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestMetricsService {
            inner: Rc::new(service),
        }))
    }
}

pub struct RequestMetricsService<S> {
    inner: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for RequestMetricsService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(inner);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let started = Instant::now();
        let method = req.method().clone();
        let route = req
            .match_pattern()
            .unwrap_or_else(|| UNMATCHED_ROUTE.to_string());
        let inner = Rc::clone(&self.inner);

        Box::pin(async move {
            let result = inner.call(req).await;
            let status = match &result {
                Ok(res) => res.status(),
                Err(e) => e.as_response_error().status_code(),
            };
            record_request(method.as_str(), &route, status, started);
            result
        })
    }
}
