//! Execution of a single iteration.
//!
//! A [`Worker`] turns one [`IterationContext`] into exactly one
//! [`MetricSample`]: it builds the signed request, performs the call, runs the
//! checks and reports. Every failure path (encoding, transport, timeout,
//! malformed response) still yields a sample, so no dispatched iteration goes
//! unaccounted.
use std::{sync::Arc, time::Duration};

use tokio::time::Instant;
use typed_builder::TypedBuilder;

use crate::{
    data::TestData,
    metric::{CheckResult, FailureReason, IterationContext, Metric, MetricSample},
    request::RequestBuilder,
    transport::Transport,
};

/// The fixed set of named checks run against every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checks {
    pub expected_status: u16,
    pub max_latency: Duration,
}

impl Default for Checks {
    fn default() -> Self {
        Self {
            expected_status: 200,
            max_latency: Duration::from_millis(120),
        }
    }
}

impl Checks {
    pub fn status_check_name(&self) -> String {
        format!("status is {}", self.expected_status)
    }

    pub fn latency_check_name(&self) -> String {
        format!("response time <= {}ms", self.max_latency.as_millis())
    }

    /// `status` is `None` when no response was received.
    pub fn evaluate(&self, status: Option<u16>, latency: Duration) -> Vec<CheckResult> {
        vec![
            CheckResult::new(
                self.status_check_name(),
                status == Some(self.expected_status),
            ),
            CheckResult::new(self.latency_check_name(), latency <= self.max_latency),
        ]
    }
}

/// Runs iterations against the init endpoint.
///
/// Cheap to clone: every field is shared.
#[derive(Clone, TypedBuilder)]
pub struct Worker {
    requests: RequestBuilder,
    data: Arc<TestData>,
    transport: Arc<dyn Transport>,
    #[builder(default)]
    checks: Checks,
}

impl Worker {
    pub async fn run(&self, ctx: IterationContext) -> MetricSample {
        let account = self.data.next();
        let request = match self.requests.build(&account.phone_number, &account.token) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("Iteration {}: failed to encode payload: {e}", ctx.index);
                return MetricSample::failed(FailureReason::Encoding);
            }
        };
        tracing::debug!("Iteration {}: request id {}", ctx.index, request.iteration_id);

        let start = Instant::now();
        let result = self.transport.post(request.body).await;
        let latency = start.elapsed();

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("Iteration {}: {e}", ctx.index);
                return MetricSample {
                    success: false,
                    latency: Some(latency),
                    http_status: None,
                    failure: Some(e.reason()),
                    checks: self.checks.evaluate(None, latency),
                };
            }
        };

        let checks = self.checks.evaluate(Some(response.status), latency);
        let body = serde_json::from_slice::<serde_json::Value>(&response.body);
        let failure = match &body {
            Err(e) => {
                tracing::debug!(
                    "Iteration {}: status {}, body is not json: {e}",
                    ctx.index,
                    response.status
                );
                Some(FailureReason::MalformedResponse)
            }
            Ok(json) => {
                tracing::debug!(
                    "Iteration {}: status {}, response {json}",
                    ctx.index,
                    response.status
                );
                (!checks.iter().all(|c| c.passed)).then_some(FailureReason::ChecksFailed)
            }
        };

        MetricSample {
            success: failure.is_none(),
            latency: Some(latency),
            http_status: Some(response.status),
            failure,
            checks,
        }
    }
}
