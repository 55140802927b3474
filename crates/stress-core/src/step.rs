use std::time::{Duration, Instant};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::OnceCell;
use tracing::debug;
use url::Url;

use crate::client::{Outgoing, StepClient, Traced};
use crate::config::ResolvedStep;
use crate::error::RequestError;
use crate::hooks::RequestHandle;
use crate::result::ResultDetail;
use crate::share::Share;
use crate::tracer::Phases;

/// A validated step plus the client all workers share once it exists.
pub(crate) struct Step {
    index: usize,
    resolved: ResolvedStep,
    client: OnceCell<StepClient>,
}

impl Step {
    pub(crate) fn new(index: usize, resolved: ResolvedStep) -> Self {
        Self {
            index,
            resolved,
            client: OnceCell::new(),
        }
    }

    pub(crate) fn url(&self) -> &Url {
        &self.resolved.url
    }

    pub(crate) fn think_time(&self) -> Duration {
        self.resolved.think_time
    }

    async fn client(&self) -> Result<&StepClient, RequestError> {
        self.client
            .get_or_try_init(|| async {
                debug!(
                    step = self.index,
                    url = %self.resolved.url,
                    h2 = self.resolved.settings.h2,
                    keep_alive = self.resolved.settings.keep_alive,
                    "creating step client"
                );
                StepClient::new(self.resolved.settings.clone())
            })
            .await
    }

    /// Sends this step's request once and records what happened.
    ///
    /// Hook time is measured separately and kept out of `duration`. A
    /// transport failure lands on the detail; the caller moves on to the next
    /// step regardless.
    pub(crate) async fn execute(
        &self,
        share: &mut Share,
        worker: usize,
        iteration: usize,
    ) -> ResultDetail {
        let start = Instant::now();
        let step = &self.resolved;
        let mut request = RequestHandle::new(
            step.method.clone(),
            step.url.clone(),
            step.headers.clone(),
            step.body.clone(),
            worker,
            iteration,
        );

        let before_start = Instant::now();
        if step.hooks.has_before() {
            run_hook(|| step.hooks.run_before(&mut request, share));
        }
        let before_hook = before_start.elapsed();

        let (method, url, headers, body) = request.into_parts();
        let label_method = method.to_string();
        let label_url = url.to_string();
        let outgoing = Outgoing {
            method,
            url,
            headers,
            body,
        };
        let Traced { phases, outcome } = match self.client().await {
            Ok(client) => client.execute(outgoing, step.timeout).await,
            Err(e) => Traced {
                phases: Phases::default(),
                outcome: Err(e),
            },
        };

        let mut after_hook = Duration::ZERO;
        let (status, content_length, error) = match outcome {
            Ok(response) => {
                let after_start = Instant::now();
                if step.hooks.has_after() {
                    run_hook(|| step.hooks.run_after(&response, share));
                }
                after_hook = after_start.elapsed();
                (response.status().as_u16(), response.content_length(), None)
            }
            Err(e) => (0, 0, Some(e)),
        };

        ResultDetail {
            url: label_url,
            method: label_method,
            error,
            status,
            content_length,
            duration: start
                .elapsed()
                .saturating_sub(before_hook)
                .saturating_sub(after_hook),
            phases,
            before_hook,
            after_hook,
        }
    }
}

/// Runs a synchronous hook. On a multi-thread runtime the worker thread is
/// handed off first, so a blocking hook does not stall the other workers'
/// requests or inflate their phases.
fn run_hook<R>(hook: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(hook)
        }
        _ => hook(),
    }
}
