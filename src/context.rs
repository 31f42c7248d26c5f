//! Immutable, hierarchical context store
//!
//! A [`Context`] is a linked list of attachments pointing from child to root.
//! Deriving a context allocates one node that points at its parent; published
//! nodes are never mutated, so any number of branches can read a shared parent
//! chain concurrently without locking.
//!
//! The generic "attach any value" primitive stays crate-private. Callers use the
//! typed capability API instead: [`crate::with_logger`], [`crate::with_fields`],
//! [`crate::with_tracer`], [`crate::with_attributes`] and [`crate::start_span`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct Node {
    parent: Option<Arc<Node>>,
    value: Arc<dyn Any + Send + Sync>,
}

impl Drop for Node {
    // Unlink uniquely owned ancestors one at a time; the default recursive
    // drop would use one stack frame per node.
    fn drop(&mut self) {
        let mut next = self.parent.take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut owned) => next = owned.parent.take(),
                Err(_) => break,
            }
        }
    }
}

/// Opaque per-request execution context carrying observability attachments
#[derive(Clone, Default)]
pub struct Context {
    head: Option<Arc<Node>>,
}

/// Cancellation signal of the composition scope that created a context
#[derive(Clone)]
pub(crate) struct Cancellation(pub(crate) CancellationToken);

impl Context {
    /// Create an empty root context
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a child carrying `value`; the receiver is left untouched
    pub(crate) fn with_value<T: Any + Send + Sync>(&self, value: T) -> Self {
        Self {
            head: Some(Arc::new(Node {
                parent: self.head.clone(),
                value: Arc::new(value),
            })),
        }
    }

    /// Nearest attachment of type `T`, walking from this context to the root
    pub(crate) fn value<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values::<T>().next()
    }

    /// Every attachment of type `T`, nearest first
    pub(crate) fn values<T: Any + Send + Sync>(&self) -> impl Iterator<Item = &T> + '_ {
        self.nodes()
            .filter_map(|node| node.value.as_ref().downcast_ref::<T>())
    }

    fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        let mut cursor = self.head.as_deref();
        std::iter::from_fn(move || {
            let node = cursor?;
            cursor = node.parent.as_deref();
            Some(node)
        })
    }

    /// Number of attachments between this context and the root
    pub fn depth(&self) -> usize {
        self.nodes().count()
    }

    /// Cancellation token of the nearest enclosing composition scope
    pub fn cancellation_token(&self) -> Option<CancellationToken> {
        self.value::<Cancellation>().map(|c| c.0.clone())
    }

    /// Whether the enclosing composition scope has been torn down
    pub fn is_cancelled(&self) -> bool {
        self.value::<Cancellation>()
            .map(|c| c.0.is_cancelled())
            .unwrap_or(false)
    }

    /// Resolves once the enclosing composition scope is torn down.
    ///
    /// A context outside any composition scope is never cancelled, so the
    /// returned future stays pending forever.
    pub async fn cancelled(&self) {
        match self.cancellation_token() {
            Some(token) => token.cancelled().await,
            None => std::future::pending::<()>().await,
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("depth", &self.depth())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Marker(&'static str);

    #[derive(Debug, PartialEq)]
    struct Other(u32);

    #[test]
    fn test_background_is_empty() {
        let ctx = Context::background();
        assert_eq!(ctx.depth(), 0);
        assert!(ctx.value::<Marker>().is_none());
        assert!(!ctx.is_cancelled());
        assert!(ctx.cancellation_token().is_none());
    }

    #[test]
    fn test_child_inherits_parent_values() {
        let parent = Context::background().with_value(Marker("root"));
        let child = parent.with_value(Other(7));

        assert_eq!(child.value::<Marker>(), Some(&Marker("root")));
        assert_eq!(child.value::<Other>(), Some(&Other(7)));
        assert_eq!(child.depth(), 2);
    }

    #[test]
    fn test_child_override_does_not_touch_parent() {
        let parent = Context::background().with_value(Marker("parent"));
        let child = parent.with_value(Marker("child"));

        assert_eq!(child.value::<Marker>(), Some(&Marker("child")));
        assert_eq!(parent.value::<Marker>(), Some(&Marker("parent")));
        assert_eq!(parent.depth(), 1);
    }

    #[test]
    fn test_values_walks_nearest_first() {
        let ctx = Context::background()
            .with_value(Marker("a"))
            .with_value(Other(1))
            .with_value(Marker("b"));

        let seen: Vec<_> = ctx.values::<Marker>().map(|m| m.0).collect();
        assert_eq!(seen, vec!["b", "a"]);
    }

    #[test]
    fn test_sibling_branches_are_independent() {
        let root = Context::background().with_value(Marker("root"));
        let left = root.with_value(Other(1));
        let right = root.with_value(Other(2));

        assert_eq!(left.value::<Other>(), Some(&Other(1)));
        assert_eq!(right.value::<Other>(), Some(&Other(2)));
        assert!(root.value::<Other>().is_none());
    }

    #[test]
    fn test_concurrent_reads_across_threads() {
        let root = Context::background().with_value(Marker("shared"));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ctx = root.with_value(Other(i));
                std::thread::spawn(move || {
                    assert_eq!(ctx.value::<Marker>(), Some(&Marker("shared")));
                    ctx.value::<Other>().map(|o| o.0)
                })
            })
            .collect();

        let mut results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        results.sort_unstable();
        assert_eq!(results, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_cancellation_is_inherited() {
        let token = CancellationToken::new();
        let scoped = Context::background().with_value(Cancellation(token.clone()));
        let derived = scoped.with_value(Marker("child"));

        assert!(!derived.is_cancelled());
        token.cancel();
        assert!(derived.is_cancelled());
        assert!(scoped.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves_after_cancel() {
        let token = CancellationToken::new();
        let ctx = Context::background().with_value(Cancellation(token.clone()));

        let waiter = tokio::spawn(async move { ctx.cancelled().await });
        token.cancel();
        waiter.await.unwrap();
    }

    #[test]
    fn test_dropping_a_very_deep_chain_does_not_overflow() {
        let worker = std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(|| {
                let mut ctx = Context::background();
                for _ in 0..200_000 {
                    ctx = ctx.with_value(Marker("layer"));
                }
                assert_eq!(ctx.depth(), 200_000);
                drop(ctx);
            })
            .unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn test_dropping_child_keeps_shared_parent_intact() {
        let parent = Context::background()
            .with_value(Marker("root"))
            .with_value(Marker("shared"));
        let child = parent.with_value(Marker("child"));
        drop(child);

        assert_eq!(parent.depth(), 2);
        assert_eq!(parent.value::<Marker>(), Some(&Marker("shared")));
    }

    #[test]
    fn test_debug_reports_depth() {
        let ctx = Context::background().with_value(Marker("x"));
        let rendered = format!("{ctx:?}");
        assert!(rendered.contains("depth: 1"));
    }
}
