use chrono::{DateTime, Utc};
use tracing::Span;
use uuid::Uuid;

/// Identity and logging handle of one externally triggered execution.
///
/// A context is created once per trigger (HTTP request, timer, device
/// event, ...) and passed by reference through flows, operators and the
/// store. It is never mutated; [`Context::child`] and [`Context::nested`]
/// derive new contexts that share the id and extend the tracing span.
#[derive(Debug, Clone)]
pub struct Context {
    id: Uuid,
    reason: String,
    created: DateTime<Utc>,
    depth: u32,
    span: Span,
}

impl Context {
    pub fn new(reason: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), reason)
    }

    /// Context for an id chosen by the caller, e.g. a correlation id
    /// received from a client
    pub fn with_id(id: Uuid, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let span = tracing::info_span!("execution", id = %id, reason = %reason);
        Self {
            id,
            reason,
            created: Utc::now(),
            depth: 0,
            span,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// True for the context of the trigger itself, false inside a flow
    pub fn is_root(&self) -> bool {
        self.depth == 0
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Same execution, with an additional log scope
    pub fn child(&self, scope: &str) -> Self {
        let span = tracing::debug_span!(parent: &self.span, "scope", name = %scope);
        Self {
            span,
            ..self.clone()
        }
    }

    /// Context for a flow running inside the current execution
    pub fn nested(&self, flow_id: &str) -> Self {
        let span = tracing::info_span!(parent: &self.span, "flow", flow = %flow_id);
        Self {
            depth: self.depth + 1,
            span,
            ..self.clone()
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new("")
    }
}
