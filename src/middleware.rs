//! Request scoping for HTTP services
//!
//! [`RequestLogging`] derives one nested composition per inbound request and
//! [`RequestScope::finish`] emits the access record and tears the scope down.
//! [`RequestLogging::filter`] plugs the same flow into a `warp` route, and
//! [`RequestLogging::wrap`] writes the record for requests the route rejects.

use crate::config::RequestsConfig;
use crate::context::Context;
use crate::error::{TeardownError, TelemetryResult};
use crate::fields::{with_fields, Field};
use crate::lifecycle::{compose, ContextOption, Teardown};
use crate::logger::{self, with_logger, LoggerHandle};
use crate::tracer::{start_span, Attributes, SpanGuard};
use chrono::{DateTime, Utc};
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::reject::{self, Rejection};
use warp::{Filter, Reply};

/// Produces request identifiers
pub type IdGenerator = Arc<dyn Fn() -> TelemetryResult<String> + Send + Sync>;

fn uuid_v4() -> TelemetryResult<String> {
    Ok(Uuid::new_v4().to_string())
}

/// Per-request context factory
#[derive(Clone)]
pub struct RequestLogging {
    base: Context,
    logger: Option<LoggerHandle>,
    request_id: bool,
    timestamp: bool,
    id_generator: IdGenerator,
}

impl RequestLogging {
    /// Scope requests under `base`; the request context inherits its logger,
    /// tracer, fields and attributes
    pub fn new(base: Context) -> Self {
        Self {
            base,
            logger: None,
            request_id: false,
            timestamp: false,
            id_generator: Arc::new(uuid_v4),
        }
    }

    pub fn from_config(base: Context, config: &RequestsConfig) -> Self {
        let mut logging = Self::new(base);
        logging.request_id = config.request_id;
        logging.timestamp = config.timestamp;
        logging
    }

    /// Log requests through `handle` instead of the base context's logger
    pub fn with_logger(mut self, handle: LoggerHandle) -> Self {
        self.logger = Some(handle);
        self
    }

    /// Attach a `req_id` field to every request context
    pub fn with_request_id(mut self) -> Self {
        self.request_id = true;
        self
    }

    /// Add an `at` field holding the request start time to the access record
    pub fn with_timestamp(mut self) -> Self {
        self.timestamp = true;
        self
    }

    pub fn with_id_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn() -> TelemetryResult<String> + Send + Sync + 'static,
    {
        self.id_generator = Arc::new(generator);
        self
    }

    /// Open the scope for one request
    pub fn begin(&self, method: &str, path: &str) -> RequestScope {
        let options = self.logger.clone().map(ContextOption::Logger);
        let (mut ctx, teardown) = compose(&self.base, options);

        if self.request_id {
            match (self.id_generator)() {
                Ok(id) => ctx = with_fields(&ctx, [Field::string("req_id", id)]),
                Err(err) => {
                    logger::warn(&ctx, "failed to generate request id", &[Field::error(&err)])
                }
            }
        }

        let at = self.timestamp.then(Utc::now);
        let (ctx, span) = start_span(
            &ctx,
            &format!("{method} {path}"),
            Attributes::from([("http.method", method), ("http.target", path)]),
        );

        RequestScope {
            ctx,
            teardown: Some(teardown),
            span,
            method: method.to_string(),
            path: path.to_string(),
            at,
            started: Instant::now(),
        }
    }

    /// `warp` filter extracting a [`RequestScope`] for every request
    pub fn filter(&self) -> impl Filter<Extract = (RequestScope,), Error = Infallible> + Clone {
        let logging = self.clone();
        warp::method()
            .and(warp::path::full())
            .map(move |method: warp::http::Method, path: warp::path::FullPath| {
                logging.begin(method.as_str(), path.as_str())
            })
    }

    /// Wrap a route built on [`RequestLogging::filter`] so rejected requests
    /// are logged too.
    ///
    /// Handlers still call [`RequestScope::finish`] for the requests they
    /// answer. When `route` rejects, its scope is dropped without a record;
    /// the wrapper then logs one at Error with the status warp will reply
    /// with, and passes the rejection on unchanged.
    pub fn wrap<F, R>(&self, route: F) -> impl Filter<Extract = (R,), Error = Rejection> + Clone
    where
        F: Filter<Extract = (R,), Error = Rejection> + Clone + Send + Sync + 'static,
        R: Reply + Send + 'static,
    {
        let timestamp = self.timestamp;
        let arrival = warp::method().and(warp::path::full()).map(
            move |method: warp::http::Method, path: warp::path::FullPath| Arrival {
                method: method.to_string(),
                path: path.as_str().to_string(),
                at: timestamp.then(Utc::now),
                started: Instant::now(),
            },
        );

        let outcome = route
            .map(|reply: R| Ok::<R, Rejection>(reply))
            .or_else(|rejection: Rejection| async move {
                Ok::<_, Infallible>((Err::<R, Rejection>(rejection),))
            });

        let logging = self.clone();
        arrival
            .and(outcome)
            .and_then(move |arrival: Arrival, outcome: Result<R, Rejection>| {
                let logging = logging.clone();
                async move {
                    if let Err(rejection) = &outcome {
                        logging.log_rejection(&arrival, rejection_status(rejection));
                    }
                    outcome
                }
            })
    }

    fn log_rejection(&self, arrival: &Arrival, status: StatusCode) {
        let ctx = match &self.logger {
            Some(handle) => with_logger(&self.base, handle.clone()),
            None => self.base.clone(),
        };
        let fields = access_fields(
            arrival.at,
            status.as_u16(),
            &arrival.method,
            arrival.started.elapsed(),
            None,
        );
        logger::error(&ctx, &arrival.path, &fields);
    }
}

/// Request facts captured before the wrapped route runs
struct Arrival {
    method: String,
    path: String,
    at: Option<DateTime<Utc>>,
    started: Instant,
}

/// Status warp's default handling replies with for `rejection`
fn rejection_status(rejection: &Rejection) -> StatusCode {
    if rejection.is_not_found() {
        StatusCode::NOT_FOUND
    } else if rejection.find::<reject::MethodNotAllowed>().is_some() {
        StatusCode::METHOD_NOT_ALLOWED
    } else if rejection.find::<reject::InvalidQuery>().is_some()
        || rejection.find::<reject::MissingHeader>().is_some()
        || rejection.find::<reject::InvalidHeader>().is_some()
    {
        StatusCode::BAD_REQUEST
    } else if rejection.find::<reject::PayloadTooLarge>().is_some() {
        StatusCode::PAYLOAD_TOO_LARGE
    } else if rejection.find::<reject::UnsupportedMediaType>().is_some() {
        StatusCode::UNSUPPORTED_MEDIA_TYPE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

/// Access record fields: `[at], status, method, duration[, error]`
fn access_fields(
    at: Option<DateTime<Utc>>,
    status: u16,
    method: &str,
    elapsed: Duration,
    error: Option<&dyn std::error::Error>,
) -> Vec<Field> {
    let mut fields = Vec::with_capacity(5);
    if let Some(at) = at {
        fields.push(Field::timestamp("at", at));
    }
    fields.push(Field::uint("status", u64::from(status)));
    fields.push(Field::string("method", method));
    fields.push(Field::duration("duration", elapsed));
    if let Some(err) = error {
        fields.push(Field::error(err));
    }
    fields
}

impl fmt::Debug for RequestLogging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestLogging")
            .field("request_id", &self.request_id)
            .field("timestamp", &self.timestamp)
            .field("logger", &self.logger)
            .finish()
    }
}

/// Context and bookkeeping for one in-flight request
///
/// Dropping an unfinished scope still ends its span and runs its teardown,
/// but emits no access record. Routes that can reject should go through
/// [`RequestLogging::wrap`], which logs the rejected request instead.
pub struct RequestScope {
    ctx: Context,
    teardown: Option<Teardown>,
    span: SpanGuard,
    method: String,
    path: String,
    at: Option<DateTime<Utc>>,
    started: Instant,
}

impl RequestScope {
    /// Context handlers should log and trace through
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Emit the access record, end the request span and tear the scope down.
    ///
    /// The record is logged at Error when `error` is given or `status >= 400`.
    pub fn finish(
        mut self,
        status: u16,
        error: Option<&dyn std::error::Error>,
    ) -> Result<(), TeardownError> {
        let fields = access_fields(
            self.at,
            status,
            &self.method,
            self.started.elapsed(),
            error,
        );

        if let Some(span) = self.span.span() {
            span.set_attributes(&Attributes::from([("http.status_code", status.to_string())]));
        }

        if error.is_some() || status >= 400 {
            logger::error(&self.ctx, &self.path, &fields);
        } else {
            logger::info(&self.ctx, &self.path, &fields);
        }

        self.span.end();
        match self.teardown.take() {
            Some(teardown) => teardown.run(),
            None => Ok(()),
        }
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        self.span.end();
        if let Some(teardown) = self.teardown.take() {
            if let Err(err) = teardown.run() {
                tracing::warn!(path = %self.path, error = %err, "Request teardown failed");
            }
        }
    }
}

impl fmt::Debug for RequestScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestScope")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("span", &self.span)
            .finish()
    }
}
