use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::{body::Body, extract::Request, response::Response};
use tracing::Instrument;

use crate::context::{ExecMode, GatewayContext};
use crate::error::Result;
use crate::upstream::Dispatcher;

/// A named, prioritized unit of pipeline logic.
///
/// A policy receives the request, the per-request context and its
/// continuation. It may invoke the continuation at most once,
/// short-circuit by returning a response or rejection without invoking
/// it, or replace the continuation's outcome on the way back out.
#[async_trait]
pub trait Policy: Send + Sync {
    fn name(&self) -> &str;

    /// Priority declared in configuration, when any; lower runs earlier.
    /// The chain builder substitutes the gateway default when absent.
    fn priority(&self) -> Option<i32> {
        None
    }

    async fn handle(
        &self,
        req: Request<Body>,
        ctx: &mut GatewayContext,
        next: Next<'_>,
    ) -> Result<Response>;
}

/// Continuation cursor over the merged policy chain.
///
/// Each invocation runs the policy at `index`, handing it a cursor bound
/// to `index + 1`; past the end it runs the terminal dispatcher. The fast
/// and instrumented execution paths are a single branch here, so the fast
/// path adds no bookkeeping beyond the cursor itself.
pub struct Next<'a> {
    policies: &'a [Arc<dyn Policy>],
    index: usize,
    terminal: &'a dyn Dispatcher,
}

impl<'a> Next<'a> {
    pub fn new(policies: &'a [Arc<dyn Policy>], terminal: &'a dyn Dispatcher) -> Self {
        Self {
            policies,
            index: 0,
            terminal,
        }
    }

    pub async fn run(self, req: Request<Body>, ctx: &mut GatewayContext) -> Result<Response> {
        // Reaching this cursor position means the upstream policy invoked
        // its continuation.
        if self.index > 0 {
            if let Some(log) = ctx.trace_log.as_mut() {
                log.mark_continued(self.index - 1);
            }
        }

        let Some(policy) = self.policies.get(self.index) else {
            return self.terminal.dispatch(req, ctx).await;
        };
        let next = Next {
            policies: self.policies,
            index: self.index + 1,
            terminal: self.terminal,
        };

        match ctx.mode {
            ExecMode::Fast => policy.handle(req, ctx, next).await,
            ExecMode::Instrumented => {
                let entry = ctx.trace_log.as_mut().map(|log| log.enter(policy.name()));
                let started = Instant::now();
                let span = tracing::info_span!(
                    "policy",
                    name = %policy.name(),
                    request_id = %ctx.request_id,
                );
                let result = policy.handle(req, ctx, next).instrument(span).await;
                if let (Some(log), Some(entry)) = (ctx.trace_log.as_mut(), entry) {
                    log.complete(
                        entry,
                        started.elapsed(),
                        result.as_ref().err().map(|e| e.error_code()),
                    );
                }
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::pipeline::testutil::{test_ctx, test_request, ScriptedDispatcher};
    use std::sync::Mutex;

    struct RecordingPolicy {
        name: String,
        order: Arc<Mutex<Vec<String>>>,
        short_circuit: bool,
    }

    #[async_trait]
    impl Policy for RecordingPolicy {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(
            &self,
            req: Request<Body>,
            ctx: &mut GatewayContext,
            next: Next<'_>,
        ) -> Result<Response> {
            self.order.lock().unwrap().push(self.name.clone());
            if self.short_circuit {
                return Err(GatewayError::BadRequest("short circuit".into()));
            }
            next.run(req, ctx).await
        }
    }

    fn recording(
        name: &str,
        order: &Arc<Mutex<Vec<String>>>,
        short_circuit: bool,
    ) -> Arc<dyn Policy> {
        Arc::new(RecordingPolicy {
            name: name.to_string(),
            order: order.clone(),
            short_circuit,
        })
    }

    #[tokio::test]
    async fn test_policies_run_in_order_then_terminal() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let policies = vec![
            recording("first", &order, false),
            recording("second", &order, false),
        ];
        let terminal = ScriptedDispatcher::new(&[200]);
        let mut ctx = test_ctx(ExecMode::Fast);

        let response = Next::new(&policies, &terminal)
            .run(test_request(), &mut ctx)
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(terminal.calls(), 1);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_rest_of_chain() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let policies = vec![
            recording("first", &order, true),
            recording("second", &order, false),
        ];
        let terminal = ScriptedDispatcher::new(&[200]);
        let mut ctx = test_ctx(ExecMode::Fast);

        let result = Next::new(&policies, &terminal)
            .run(test_request(), &mut ctx)
            .await;

        assert!(result.is_err());
        assert_eq!(*order.lock().unwrap(), vec!["first"]);
        assert_eq!(terminal.calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_chain_runs_terminal_directly() {
        let policies: Vec<Arc<dyn Policy>> = Vec::new();
        let terminal = ScriptedDispatcher::new(&[204]);
        let mut ctx = test_ctx(ExecMode::Fast);

        let response = Next::new(&policies, &terminal)
            .run(test_request(), &mut ctx)
            .await
            .unwrap();

        assert_eq!(response.status(), 204);
    }

    #[tokio::test]
    async fn test_instrumented_path_records_continuation_use() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let policies = vec![
            recording("outer", &order, false),
            recording("inner", &order, true),
        ];
        let terminal = ScriptedDispatcher::new(&[200]);
        let mut ctx = test_ctx(ExecMode::Instrumented);

        let _ = Next::new(&policies, &terminal)
            .run(test_request(), &mut ctx)
            .await;

        let log = ctx.trace_log.as_ref().unwrap();
        let entries = log.entries();
        assert_eq!(entries.len(), 2);

        assert_eq!(entries[0].policy, "outer");
        assert!(entries[0].continued);
        assert_eq!(entries[0].error, Some("BAD_REQUEST"));

        assert_eq!(entries[1].policy, "inner");
        assert!(!entries[1].continued);
        assert_eq!(entries[1].error, Some("BAD_REQUEST"));
    }
}
