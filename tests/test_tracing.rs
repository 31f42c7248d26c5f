//! Span and attribute behaviour through the public API

use context_observability::testing::MemoryTracer;
use context_observability::{
    attributes, current_span, in_span, in_span_async, start_span, with_attributes,
    with_tracer, with_tracer_handle, Attributes, Context, OtelSpan, TracerConfig,
};

fn traced() -> (Context, MemoryTracer) {
    let memory = MemoryTracer::new();
    let ctx = with_tracer_handle(&Context::background(), memory.handle());
    (ctx, memory)
}

#[test]
fn test_untraced_guard_can_end_repeatedly() {
    let ctx = Context::background();
    let (child, mut guard) = start_span(&ctx, "nothing", Attributes::new());

    guard.end();
    guard.end();
    guard.end();
    assert!(!guard.is_recording());
    assert!(current_span(&child).is_none());
    assert_eq!(child.depth(), ctx.depth());
}

#[test]
fn test_attributes_reach_live_span_immediately() {
    let (ctx, memory) = traced();
    let (span_ctx, _guard) = start_span(&ctx, "checkout", Attributes::new());

    let _enriched = with_attributes(&span_ctx, Attributes::from([("cart_size", "3")]));

    let span = memory.span("checkout").unwrap();
    assert_eq!(span.attributes.get("cart_size"), Some("3"));
    assert!(!span.ended());
}

#[test]
fn test_nested_spans_form_a_tree() {
    let (ctx, memory) = traced();

    in_span(&ctx, "request", Attributes::new(), |request| {
        in_span(request, "db", Attributes::new(), |_| {});
        in_span(request, "render", Attributes::new(), |_| {});
    });

    let request = memory.span("request").unwrap();
    let db = memory.span("db").unwrap();
    let render = memory.span("render").unwrap();
    assert_eq!(request.parent, None);
    assert_eq!(db.parent, Some(request.id));
    assert_eq!(render.parent, Some(request.id));
    assert!(memory.spans().iter().all(|s| s.end_count == 1));
}

#[test]
fn test_context_attributes_merge_under_call_site() {
    let (ctx, memory) = traced();
    let ctx = with_attributes(&ctx, Attributes::from([("tenant", "acme"), ("tier", "free")]));

    let (_child, _guard) = start_span(&ctx, "upgrade", Attributes::from([("tier", "pro")]));

    let span = memory.span("upgrade").unwrap();
    assert_eq!(span.attributes.get("tenant"), Some("acme"));
    assert_eq!(span.attributes.get("tier"), Some("pro"));
    // Call-site attributes stay local to the span
    assert_eq!(attributes(&ctx).get("tier"), Some("free"));
}

#[tokio::test]
async fn test_async_span_spans_await_points() {
    let (ctx, memory) = traced();

    let value = in_span_async(&ctx, "fetch", Attributes::new(), |child| async move {
        tokio::task::yield_now().await;
        current_span(&child).is_some()
    })
    .await;

    assert!(value);
    assert_eq!(memory.span("fetch").unwrap().end_count, 1);
}

#[test]
fn test_stdout_backend_links_parent_and_child() {
    let (ctx, action) = with_tracer(&Context::background(), &TracerConfig::new("linkage"));
    let action = action.unwrap();

    let (parent_ctx, mut parent) = start_span(&ctx, "parent", Attributes::new());
    let (child_ctx, mut child) = start_span(&parent_ctx, "child", Attributes::new());

    let parent_span = current_span(&parent_ctx).unwrap();
    let child_span = current_span(&child_ctx).unwrap();
    let parent_otel = parent_span.as_any().downcast_ref::<OtelSpan>().unwrap();
    let child_otel = child_span.as_any().downcast_ref::<OtelSpan>().unwrap();
    assert_eq!(parent_otel.trace_id(), child_otel.trace_id());

    child.end();
    parent.end();
    action.run().unwrap();
}
