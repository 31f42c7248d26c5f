//! Composition and teardown behaviour
//!
//! Tests focus on observable outcomes: which capabilities a composed context
//! resolves, what a failed setup leaves behind, and how teardown reports.

use context_observability::testing::{MemoryLogger, MemoryTracer};
use context_observability::{
    compose, fields, info, logger, start_span, tracer, warn, with_fields, Attributes, Composer,
    Context, ContextOption, ExporterKind, ObservabilityConfig, TeardownAction, TelemetryError,
    TracerConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::Level;

#[test]
fn test_hello_then_slow_scenario() {
    let memory = MemoryLogger::new();
    let (ctx, teardown) = compose(
        &Context::background(),
        [ContextOption::Logger(memory.handle())],
    );

    info(&ctx, "hello", &[]);
    let ctx2 = with_fields(&ctx, fields!["env" => "prod"]);
    warn(&ctx2, "slow", &fields!["at" => "T"]);

    let records = memory.records();
    assert_eq!(records.len(), 2);
    assert_eq!((records[0].level, records[0].message.as_str()), (Level::INFO, "hello"));
    assert!(records[0].fields.is_empty());
    assert_eq!((records[1].level, records[1].message.as_str()), (Level::WARN, "slow"));
    assert_eq!(records[1].fields, fields!["env" => "prod", "at" => "T"]);

    assert!(teardown.run().is_ok());
}

#[test]
fn test_failing_tracer_option_keeps_logger_and_degrades_tracer() {
    let memory = MemoryLogger::new();
    let upstream = MemoryTracer::new();

    // No tokio runtime here, so the OTLP exporter cannot be built
    let (ctx, teardown) = Composer::new()
        .with_tracer_handle(upstream.handle())
        .with_logger(memory.handle())
        .with_tracer(TracerConfig::new("svc").with_exporter(ExporterKind::OtlpHttp))
        .build();

    assert!(logger(&ctx).same_as(&memory.handle()));
    assert!(tracer(&ctx).is_noop());

    let (_child, guard) = start_span(&ctx, "shadowed", Attributes::new());
    assert!(!guard.is_recording());
    drop(guard);
    assert!(upstream.spans().is_empty());

    let record = memory.last().unwrap();
    assert_eq!(record.level, Level::ERROR);
    assert!(record.has_field("error"));
    assert!(teardown.is_empty());
    teardown.run().unwrap();
}

#[test]
fn test_teardown_failure_does_not_skip_later_actions() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);

    let (_ctx, teardown) = Composer::new()
        .with_setup("exporter", |ctx| {
            let action = TeardownAction::new("exporter", || {
                Err(TelemetryError::shutdown("collector unreachable"))
            });
            Ok((ctx.clone(), Some(action)))
        })
        .with_setup("buffer", move |ctx| {
            let action = TeardownAction::new("buffer", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            Ok((ctx.clone(), Some(action)))
        })
        .build();

    let err = teardown.run().unwrap_err();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(err.len(), 1);
    assert_eq!(err.failures()[0].action, "exporter");
    assert!(err.to_string().contains("collector unreachable"));
}

#[test]
fn test_root_teardown_cancels_whole_tree() {
    let (root, root_teardown) = Composer::new().build();
    let request = with_fields(&root, fields!["req_id" => "r1"]);
    let (nested, _nested_teardown) = compose(&request, []);
    let deeper = with_fields(&nested, fields!["step" => 2]);

    root_teardown.run().unwrap();

    for ctx in [&root, &request, &nested, &deeper] {
        assert!(ctx.is_cancelled());
    }
}

#[tokio::test]
async fn test_cancellation_is_observable_from_tasks() {
    let (root, teardown) = Composer::new().build();
    let (nested, nested_teardown) = compose(&root, []);

    let waiter = tokio::spawn(async move {
        nested.cancelled().await;
        "released"
    });

    teardown.run().unwrap();
    assert_eq!(waiter.await.unwrap(), "released");
    nested_teardown.run().unwrap();
}

#[test]
fn test_composer_from_config_attaches_static_fields_and_attributes() {
    let config = ObservabilityConfig::from_toml_str(
        r#"
service_name = "checkout"

[fields]
region = "eu-west-1"

[attributes]
tenant = "acme"
"#,
    )
    .unwrap();

    let (ctx, teardown) = Composer::from_config(&config).build();

    assert!(!logger(&ctx).is_noop());
    assert!(tracer(&ctx).is_noop());
    assert_eq!(
        context_observability::fields(&ctx),
        fields!["region" => "eu-west-1"]
    );
    assert_eq!(
        context_observability::attributes(&ctx).get("tenant"),
        Some("acme")
    );
    teardown.run().unwrap();
}

#[test]
fn test_composer_from_config_with_stdout_tracer() {
    let config =
        ObservabilityConfig::from_toml_str("service_name = \"stdout-svc\"\n[tracing]\n").unwrap();

    let (ctx, teardown) = Composer::from_config(&config).build();
    assert!(!tracer(&ctx).is_noop());
    assert_eq!(teardown.len(), 1);

    let (_child, mut span) = start_span(&ctx, "work", Attributes::new());
    assert!(span.is_recording());
    span.end();

    teardown.run().unwrap();
}

#[test]
fn test_guard_releases_on_scope_exit() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);

    let ctx = {
        let (ctx, teardown) = Composer::new()
            .with_setup("count", move |ctx| {
                let action = TeardownAction::new("count", move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                Ok((ctx.clone(), Some(action)))
            })
            .build();
        let _guard = teardown.guard();
        ctx
    };

    assert!(ctx.is_cancelled());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}
