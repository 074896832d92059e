//! Trace context propagation across asynchronous boundaries.
//!
//! Every workflow run carries a [`TraceContext`] holding the correlation id
//! and free-form attributes. The context is threaded explicitly through
//! call chains; [`scope`] additionally binds it to a task-local so deeply
//! nested code can recover it without plumbing. Child tasks must be
//! spawned inside a [`scope`] (or handed a [`TraceContext::child`]) to
//! inherit the parent context.

use std::collections::BTreeMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

tokio::task_local! {
    static CURRENT: TraceContext;
}

/// Correlation context for one workflow (or one agent run inside it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    /// Correlation id shared by every span of the run.
    pub correlation_id: String,
    /// When the traced operation started.
    pub start_time: DateTime<Utc>,
    /// Free-form key/value attributes.
    pub attributes: BTreeMap<String, String>,
    /// Classification tags.
    pub tags: Vec<String>,
    /// Span id of the parent operation, when this is a child context.
    pub parent_span_id: Option<String>,
}

impl TraceContext {
    /// Creates a root context with a fresh correlation id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4().simple().to_string(),
            start_time: Utc::now(),
            attributes: BTreeMap::new(),
            tags: Vec::new(),
            parent_span_id: None,
        }
    }

    /// Creates a child context: same correlation id, fresh start time,
    /// parented to this context's correlation id.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            start_time: Utc::now(),
            attributes: self.attributes.clone(),
            tags: self.tags.clone(),
            parent_span_id: Some(self.correlation_id.clone()),
        }
    }

    /// Adds an attribute, builder style.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Adds a tag, builder style.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `fut` with `ctx` bound as the task-local current context.
pub async fn scope<F>(ctx: TraceContext, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(ctx, fut).await
}

/// The current task-local context, if one is bound.
#[must_use]
pub fn current() -> Option<TraceContext> {
    CURRENT.try_with(Clone::clone).ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn child_shares_correlation_id() {
        let root = TraceContext::new().with_attribute("workflow", "w-1");
        let child = root.child();
        assert_eq!(child.correlation_id, root.correlation_id);
        assert_eq!(child.parent_span_id.as_deref(), Some(root.correlation_id.as_str()));
        assert_eq!(child.attributes.get("workflow").unwrap(), "w-1");
    }

    #[tokio::test]
    async fn scope_binds_current() {
        assert!(current().is_none());
        let ctx = TraceContext::new().with_tag("test");
        let seen = scope(ctx.clone(), async { current() }).await;
        assert_eq!(seen.unwrap().correlation_id, ctx.correlation_id);
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn nested_scopes_shadow() {
        let outer = TraceContext::new();
        let inner = outer.child().with_tag("inner");
        let outer_id = outer.correlation_id.clone();

        let observed = scope(outer, async move {
            let before = current().unwrap();
            let during = scope(inner, async { current().unwrap() }).await;
            (before, during)
        })
        .await;

        assert_eq!(observed.0.correlation_id, outer_id);
        assert!(observed.1.tags.contains(&"inner".to_string()));
    }
}
