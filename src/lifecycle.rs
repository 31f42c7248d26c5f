//! Lifecycle composition
//!
//! [`compose`] applies an ordered list of [`ContextOption`]s to a base context
//! and collects the teardown actions they register into a single
//! [`Teardown`]. Every composition opens a cancellation scope: a child of the
//! base's scope when the base already carries one, otherwise a fresh root.
//!
//! Setup failures never abort composition. They are reported through the
//! best-effort logger and the remaining options still apply.

use crate::config::ObservabilityConfig;
use crate::context::{Cancellation, Context};
use crate::error::{TeardownError, TeardownFailure, TelemetryError, TelemetryResult};
use crate::fields::{with_fields, Field};
use crate::logger::{report_failure, with_logger, LoggerHandle, TracingLogger};
use crate::tracer::{
    with_attributes, with_tracer, with_tracer_handle, Attributes, TracerConfig, TracerHandle,
};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::Level;

type ActionFn = Box<dyn FnOnce() -> TelemetryResult<()> + Send>;
type SetupFn =
    Box<dyn FnOnce(&Context) -> TelemetryResult<(Context, Option<TeardownAction>)> + Send>;

/// Named release step registered during composition
pub struct TeardownAction {
    name: String,
    run: ActionFn,
}

impl TeardownAction {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce() -> TelemetryResult<()> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run(self) -> TelemetryResult<()> {
        (self.run)()
    }
}

impl fmt::Debug for TeardownAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeardownAction")
            .field("name", &self.name)
            .finish()
    }
}

/// Custom fallible composition step
///
/// Receives the context built so far and returns the derived context plus an
/// optional teardown action.
pub struct SetupStep {
    name: String,
    run: SetupFn,
}

impl SetupStep {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(&Context) -> TelemetryResult<(Context, Option<TeardownAction>)> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupStep").field("name", &self.name).finish()
    }
}

/// One step of a composition, applied in list order
pub enum ContextOption {
    Logger(LoggerHandle),
    /// Build an OpenTelemetry tracer; its provider shutdown joins the teardown
    Tracer(TracerConfig),
    TracerHandle(TracerHandle),
    Fields(Vec<Field>),
    Attributes(Attributes),
    Setup(SetupStep),
}

impl fmt::Debug for ContextOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextOption::Logger(handle) => f.debug_tuple("Logger").field(handle).finish(),
            ContextOption::Tracer(config) => f.debug_tuple("Tracer").field(config).finish(),
            ContextOption::TracerHandle(handle) => f
                .debug_struct("TracerHandle")
                .field("noop", &handle.is_noop())
                .finish(),
            ContextOption::Fields(fields) => f.debug_tuple("Fields").field(fields).finish(),
            ContextOption::Attributes(attrs) => f.debug_tuple("Attributes").field(attrs).finish(),
            ContextOption::Setup(step) => f.debug_tuple("Setup").field(step).finish(),
        }
    }
}

/// Release handle for one composition scope
///
/// Running it cancels the scope and then runs every registered action in
/// registration order, continuing past failures.
#[must_use = "a composed context must be torn down to release its resources"]
pub struct Teardown {
    tokens: Vec<CancellationToken>,
    actions: Vec<TeardownAction>,
}

impl Teardown {
    fn new(token: CancellationToken) -> Self {
        Self {
            tokens: vec![token],
            actions: Vec::new(),
        }
    }

    /// Register an extra action to run after those already registered
    pub fn push(&mut self, action: TeardownAction) {
        self.actions.push(action);
    }

    /// Take over a nested scope's teardown; it then runs as part of this one
    pub fn adopt(&mut self, nested: Teardown) {
        self.tokens.extend(nested.tokens);
        self.actions.extend(nested.actions);
    }

    /// Cancellation token of this scope
    pub fn cancellation_token(&self) -> CancellationToken {
        self.tokens[0].clone()
    }

    /// Number of registered actions
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn run(self) -> Result<(), TeardownError> {
        for token in &self.tokens {
            token.cancel();
        }

        let mut failures = Vec::new();
        for action in self.actions {
            let name = action.name.clone();
            tracing::debug!(action = %name, "Running teardown action");
            if let Err(source) = action.run() {
                failures.push(TeardownFailure {
                    action: name,
                    source,
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(TeardownError::new(failures))
        }
    }

    /// Scope guard that runs this teardown when dropped
    pub fn guard(self) -> TeardownGuard {
        TeardownGuard {
            teardown: Some(self),
        }
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Teardown")
            .field("actions", &self.actions)
            .field("scopes", &self.tokens.len())
            .finish()
    }
}

/// Runs the wrapped teardown on drop, logging any failure
#[derive(Debug)]
pub struct TeardownGuard {
    teardown: Option<Teardown>,
}

impl TeardownGuard {
    /// Run the teardown now and return its result
    pub fn finish(mut self) -> Result<(), TeardownError> {
        match self.teardown.take() {
            Some(teardown) => teardown.run(),
            None => Ok(()),
        }
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            if let Err(err) = teardown.run() {
                tracing::warn!(
                    failures = err.len(),
                    error = %err,
                    "Teardown finished with failures"
                );
            }
        }
    }
}

/// Apply `options` to `base` in order
///
/// Each option sees the context produced by the previous one. With no options
/// the returned context resolves every capability exactly like `base`.
pub fn compose<I>(base: &Context, options: I) -> (Context, Teardown)
where
    I: IntoIterator<Item = ContextOption>,
{
    let token = match base.cancellation_token() {
        Some(parent) => parent.child_token(),
        None => CancellationToken::new(),
    };

    let mut ctx = base.with_value(Cancellation(token.clone()));
    let mut teardown = Teardown::new(token);
    for option in options {
        ctx = apply(ctx, option, &mut teardown);
    }

    (ctx, teardown)
}

fn apply(ctx: Context, option: ContextOption, teardown: &mut Teardown) -> Context {
    match option {
        ContextOption::Logger(handle) => with_logger(&ctx, handle),
        ContextOption::Tracer(config) => {
            let (next, action) = with_tracer(&ctx, &config);
            if let Some(action) = action {
                teardown.push(action);
            }
            next
        }
        ContextOption::TracerHandle(handle) => with_tracer_handle(&ctx, handle),
        ContextOption::Fields(fields) => with_fields(&ctx, fields),
        ContextOption::Attributes(attrs) => with_attributes(&ctx, attrs),
        ContextOption::Setup(step) => {
            let name = step.name;
            match (step.run)(&ctx) {
                Ok((next, action)) => {
                    if let Some(action) = action {
                        teardown.push(action);
                    }
                    next
                }
                Err(err) => {
                    let failure = TelemetryError::setup(name, err.to_string());
                    report_failure(&ctx, Level::ERROR, "context setup step failed", &failure);
                    ctx
                }
            }
        }
    }
}

/// Builder over [`ContextOption`] lists
#[derive(Debug, Default)]
pub struct Composer {
    options: Vec<ContextOption>,
}

impl Composer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for a service described by `config`: a `tracing`-backed logger,
    /// the configured tracer (if any), static fields and attributes
    pub fn from_config(config: &ObservabilityConfig) -> Self {
        let mut composer = Self::new().with_logger(LoggerHandle::new(TracingLogger));

        if let Some(tracer) = config.tracer_config() {
            composer = composer.with_tracer(tracer);
        }

        let fields = config.static_fields();
        if !fields.is_empty() {
            composer = composer.with_fields(fields);
        }

        let attributes = config.static_attributes();
        if !attributes.is_empty() {
            composer = composer.with_attributes(attributes);
        }

        composer
    }

    pub fn with_option(mut self, option: ContextOption) -> Self {
        self.options.push(option);
        self
    }

    pub fn with_logger(self, handle: LoggerHandle) -> Self {
        self.with_option(ContextOption::Logger(handle))
    }

    pub fn with_tracer(self, config: TracerConfig) -> Self {
        self.with_option(ContextOption::Tracer(config))
    }

    pub fn with_tracer_handle(self, handle: TracerHandle) -> Self {
        self.with_option(ContextOption::TracerHandle(handle))
    }

    pub fn with_fields<I>(self, fields: I) -> Self
    where
        I: IntoIterator<Item = Field>,
    {
        self.with_option(ContextOption::Fields(fields.into_iter().collect()))
    }

    pub fn with_attributes(self, attributes: Attributes) -> Self {
        self.with_option(ContextOption::Attributes(attributes))
    }

    pub fn with_setup<F>(self, name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(&Context) -> TelemetryResult<(Context, Option<TeardownAction>)> + Send + 'static,
    {
        self.with_option(ContextOption::Setup(SetupStep::new(name, run)))
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    pub fn compose(self, base: &Context) -> (Context, Teardown) {
        compose(base, self.options)
    }

    /// Compose on top of [`Context::background`]
    pub fn build(self) -> (Context, Teardown) {
        self.compose(&Context::background())
    }
}
