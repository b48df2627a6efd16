// src/metrics/middleware.rs

//! The request interceptor: a tower middleware that times every request,
//! resolves its handler identity, forwards the response body pass-through
//! while observing it, and fans the finished observation out to every
//! registered collector.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::MatchedPath;
use http::{HeaderMap, Request, Response, StatusCode};
use http_body::{Frame, SizeHint};
use prometheus::{IntGauge, IntGaugeVec};
use tower::{Layer, Service};
use tracing::error;

use crate::filter::HandlerFilter;
use crate::labels;
use crate::metrics::{AsyncMetricFn, MetricFn, Observation, ObservedResponse};
use crate::routing::RouteTable;

/// Status recorded when the downstream application failed before any
/// response started.
const NEVER_RESPONDED_STATUS: u16 = 500;

type DispatchFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// The gauge tracking requests currently in flight.
#[derive(Clone)]
pub(crate) enum InprogressGauge {
    Plain(IntGauge),
    Labeled(IntGaugeVec),
}

impl InprogressGauge {
    fn inc(&self, method: &str, handler: &str) {
        match self {
            InprogressGauge::Plain(gauge) => gauge.inc(),
            InprogressGauge::Labeled(gauge) => {
                gauge.with_label_values(&[method, handler]).inc()
            }
        }
    }

    fn dec(&self, method: &str, handler: &str) {
        match self {
            InprogressGauge::Plain(gauge) => gauge.dec(),
            InprogressGauge::Labeled(gauge) => {
                gauge.with_label_values(&[method, handler]).dec()
            }
        }
    }
}

/// Immutable per-middleware state, shared by all in-flight requests.
pub(crate) struct Shared {
    pub(crate) routes: Option<RouteTable>,
    pub(crate) filter: HandlerFilter,
    pub(crate) should_group_status_codes: bool,
    pub(crate) should_group_untemplated: bool,
    pub(crate) should_ignore_method: bool,
    pub(crate) should_round_latency_decimals: bool,
    pub(crate) round_latency_decimals: u32,
    pub(crate) sync_metrics: Vec<MetricFn>,
    pub(crate) async_metrics: Vec<AsyncMetricFn>,
    pub(crate) inprogress: Option<InprogressGauge>,
}

impl Shared {
    /// Resolve the handler identity of a request.
    ///
    /// A configured route table is authoritative; without one the
    /// framework-provided matched path is used when present. Either way a
    /// miss falls back to the literal request path, untemplated.
    fn resolve_handler<B>(&self, request: &Request<B>) -> (String, bool) {
        if let Some(routes) = &self.routes {
            if let Some(template) = routes.resolve(request.method(), request.uri().path()) {
                return (template, true);
            }
        } else if let Some(matched) = request.extensions().get::<MatchedPath>() {
            return (matched.as_str().to_string(), true);
        }
        (request.uri().path().to_string(), false)
    }
}

/// Tower layer attaching the request interceptor to a service.
#[derive(Clone)]
pub struct MetricsLayer {
    shared: Arc<Shared>,
}

impl MetricsLayer {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            shared: Arc::clone(&self.shared),
        }
    }
}

/// The instrumented service produced by [`MetricsLayer`].
#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
    shared: Arc<Shared>,
}

impl<S> Service<Request<Body>> for MetricsService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let shared = Arc::clone(&self.shared);
        // Take the service that was driven to readiness, leave the clone.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let start = Instant::now();
            let (raw_handler, is_templated) = shared.resolve_handler(&request);
            let excluded = shared.filter.is_excluded(&raw_handler, is_templated);

            if excluded {
                // Resolution ran, the downstream still runs; only metric
                // emission is skipped.
                return inner.call(request).await;
            }

            let capture_body = shared.filter.should_capture_body(&raw_handler);
            let mut state = RequestState::new(
                Arc::clone(&shared),
                start,
                &request,
                raw_handler,
                is_templated,
                capture_body,
            );

            match inner.call(request).await {
                Ok(response) => {
                    state.observe_response_head(response.status(), response.headers());
                    let (parts, body) = response.into_parts();
                    let wrapped = InstrumentedBody {
                        inner: body,
                        state,
                        dispatch: None,
                    };
                    Ok(Response::from_parts(parts, Body::new(wrapped)))
                }
                Err(err) => {
                    // The observation survives downstream failures; the
                    // error itself is passed on untouched.
                    if let Some(dispatch) = state.finalize() {
                        dispatch.await;
                    }
                    Err(err)
                }
            }
        })
    }
}

/// Mutable per-request context, finalized exactly once on every exit path.
struct RequestState {
    shared: Arc<Shared>,
    start: Instant,
    method: String,
    raw_handler: String,
    is_templated: bool,
    modified_handler: String,
    request_headers: HeaderMap,
    capture_body: bool,
    captured: Vec<u8>,
    status: u16,
    response_headers: HeaderMap,
    saw_response: bool,
    response_start: Option<Instant>,
    inprogress_active: bool,
    finalized: bool,
}

impl RequestState {
    fn new<B>(
        shared: Arc<Shared>,
        start: Instant,
        request: &Request<B>,
        raw_handler: String,
        is_templated: bool,
        capture_body: bool,
    ) -> Self {
        let method = labels::method_label(request.method().as_str(), shared.should_ignore_method);
        let modified_handler = labels::handler_label(
            &raw_handler,
            is_templated,
            shared.should_group_untemplated,
        );

        let inprogress_active = if let Some(gauge) = &shared.inprogress {
            gauge.inc(&method, &modified_handler);
            true
        } else {
            false
        };

        Self {
            shared,
            start,
            method,
            raw_handler,
            is_templated,
            modified_handler,
            request_headers: request.headers().clone(),
            capture_body,
            captured: Vec::new(),
            status: NEVER_RESPONDED_STATUS,
            response_headers: HeaderMap::new(),
            saw_response: false,
            response_start: None,
            inprogress_active,
            finalized: false,
        }
    }

    fn observe_response_head(&mut self, status: StatusCode, headers: &HeaderMap) {
        self.status = status.as_u16();
        self.response_headers = headers.clone();
        self.saw_response = true;
        self.response_start = Some(Instant::now());
    }

    /// Build the observation, run the synchronous collectors, and return
    /// the joined asynchronous dispatch, if any. Later calls are no-ops.
    fn finalize(&mut self) -> Option<DispatchFuture> {
        if self.finalized {
            return None;
        }
        self.finalized = true;

        if self.inprogress_active {
            if let Some(gauge) = &self.shared.inprogress {
                gauge.dec(&self.method, &self.modified_handler);
            }
            self.inprogress_active = false;
        }

        let shared = Arc::clone(&self.shared);

        let mut duration = self.start.elapsed().as_secs_f64().max(0.0);
        if shared.should_round_latency_decimals {
            duration = labels::round_duration(duration, shared.round_latency_decimals);
        }
        let duration_without_streaming = self
            .response_start
            .map(|response_start| {
                response_start
                    .duration_since(self.start)
                    .as_secs_f64()
                    .max(0.0)
            })
            .unwrap_or(0.0);

        let response = self.saw_response.then(|| ObservedResponse {
            status: self.status,
            headers: std::mem::take(&mut self.response_headers),
            body: Bytes::from(std::mem::take(&mut self.captured)),
        });

        let observation = Arc::new(Observation {
            method: std::mem::take(&mut self.method),
            raw_status: self.status,
            modified_status: labels::status_label(self.status, shared.should_group_status_codes),
            raw_handler: std::mem::take(&mut self.raw_handler),
            is_templated: self.is_templated,
            modified_handler: std::mem::take(&mut self.modified_handler),
            modified_duration: duration,
            modified_duration_without_streaming: duration_without_streaming,
            request_headers: std::mem::take(&mut self.request_headers),
            response,
        });

        // Every synchronous collector runs, regardless of earlier failures;
        // failures surface once the full pass is done.
        let mut failures = Vec::new();
        for observe in &shared.sync_metrics {
            if let Err(failure) = observe(&observation) {
                failures.push(failure);
            }
        }
        for failure in failures {
            error!(
                error = %failure,
                handler = %observation.modified_handler,
                "metric collector failed"
            );
        }

        if shared.async_metrics.is_empty() {
            return None;
        }
        let futures: Vec<_> = shared
            .async_metrics
            .iter()
            .map(|observe| observe(Arc::clone(&observation)))
            .collect();
        Some(Box::pin(async move {
            futures_util::future::join_all(futures).await;
        }))
    }
}

impl Drop for RequestState {
    fn drop(&mut self) {
        // Cancellation safety net: the gauge is decremented and the
        // observation emitted through the synchronous collectors even when
        // the request future or the response body is dropped early. The
        // asynchronous dispatch is discarded since no caller remains to
        // await it.
        let _ = self.finalize();
    }
}

/// Response body wrapper. Chunks are forwarded downstream immediately;
/// completion of the stream finalizes the observation, and any asynchronous
/// collectors are awaited before the stream reports its end.
struct InstrumentedBody {
    inner: Body,
    state: RequestState,
    dispatch: Option<DispatchFuture>,
}

impl http_body::Body for InstrumentedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        loop {
            if let Some(dispatch) = this.dispatch.as_mut() {
                ready!(dispatch.as_mut().poll(cx));
                this.dispatch = None;
                return Poll::Ready(None);
            }

            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => {
                    if this.state.capture_body {
                        if let Some(data) = frame.data_ref() {
                            this.state.captured.extend_from_slice(data);
                        }
                    }
                    return Poll::Ready(Some(Ok(frame)));
                }
                Some(Err(err)) => {
                    // The stream failed mid-flight. Emit what was measured
                    // through the synchronous collectors and surface the
                    // error unchanged.
                    let _ = this.state.finalize();
                    return Poll::Ready(Some(Err(err)));
                }
                None => match this.state.finalize() {
                    Some(dispatch) => {
                        this.dispatch = Some(dispatch);
                    }
                    None => return Poll::Ready(None),
                },
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.state.finalized && self.dispatch.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
