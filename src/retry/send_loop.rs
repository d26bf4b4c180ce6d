//! The resilient send loop.
//!
//! Bounded attempts, pluggable backoff, and event emission on
//! retry/success/exhaustion, plus redirect handling (307/308 preserving
//! method and body, 301/302/303 downgrading to GET) and `Retry-After`
//! honoring, built directly against `reqwest`.

use std::time::Duration;

use http::header::{
    CONNECTION, HeaderName, HeaderValue, KEEP_ALIVE, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE,
    TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use reqwest::{Client, Method, Request, Response};

#[cfg(feature = "metrics")]
use metrics::{counter, histogram};

#[cfg(feature = "tracing")]
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::clock::SharedClock;
use crate::error::PipelineError;

use super::backoff::{cap_to_deadline, parse_retry_after, ExponentialBackoff};
use super::config::RetryPolicy;
use super::events::RetryEvent;

const MAX_REDIRECTS: usize = 5;

/// Headers that must not survive a redirect rebuild (RFC 7230 §6.1).
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        *name,
        CONNECTION
            | KEEP_ALIVE
            | PROXY_AUTHENTICATE
            | PROXY_AUTHORIZATION
            | TE
            | TRAILER
            | TRANSFER_ENCODING
            | UPGRADE
    )
}

/// Executes `template` against `client`, retrying transient failures,
/// following 307/308 (method/body-preserving) and 301/302/303
/// (GET-downgrading) redirects, honoring `Retry-After`, and giving up once
/// `policy.max_retries` or `policy.retry_budget` is exhausted — whichever
/// comes first. Cancellation is observed at every suspension point and is
/// never counted against the retry budget.
pub async fn send_with_retries(
    client: &Client,
    template: Request,
    policy: &RetryPolicy,
    backoff: &ExponentialBackoff,
    clock: &SharedClock,
    cancel: &CancellationToken,
) -> Result<Response, PipelineError> {
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }

    let started_at = clock.now();
    let deadline = started_at + policy.retry_budget;

    let mut request = template;
    let mut attempt = 0usize;
    let mut redirects = 0usize;
    let mut last_error: Option<PipelineError> = None;

    loop {
        let remaining = deadline.saturating_duration_since(clock.now());
        if attempt > 0 && remaining.is_zero() {
            return Err(exhausted(policy, attempt, last_error, clock));
        }

        let mut attempt_request = request
            .try_clone()
            .ok_or_else(|| PipelineError::Terminal("request body is not replayable".into()))?;

        let attempt_timeout = match policy.per_request_timeout {
            Some(t) => t.min(remaining.max(Duration::from_millis(1))),
            None => remaining.max(Duration::from_millis(1)),
        };
        *attempt_request.timeout_mut() = Some(attempt_timeout);

        let send_result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            result = client.execute(attempt_request) => result,
        };

        let response = match send_result {
            Err(transport_err) => {
                let err = PipelineError::Transport(transport_err.to_string());
                if attempt + 1 >= policy.max_retries || !policy.is_retryable(None) {
                    return Err(exhausted(policy, attempt + 1, Some(err), clock));
                }
                let delay = cap_to_deadline(backoff.delay_for(attempt), remaining);

                #[cfg(feature = "metrics")]
                counter!("retry_attempts_total", "profile" => policy.profile_name.clone()).increment(1);

                #[cfg(feature = "tracing")]
                debug!(profile = %policy.profile_name, attempt = attempt + 1, delay_ms = delay.as_millis(), "retrying after transport error");

                policy.event_listeners.emit(&RetryEvent::Retry {
                    profile: policy.profile_name.clone(),
                    attempt: attempt + 1,
                    delay,
                    timestamp: clock.now(),
                });
                sleep_cancellable(delay, cancel).await?;
                last_error = Some(err);
                attempt += 1;
                continue;
            }
            Ok(response) => response,
        };

        let status = response.status().as_u16();

        match status {
            307 | 308 => {
                redirects += 1;
                if redirects > MAX_REDIRECTS {
                    return Err(PipelineError::Terminal("redirect loop exceeded bound".into()));
                }
                let Some(location) = response_location(&response) else {
                    return Ok(response);
                };
                policy.event_listeners.emit(&RetryEvent::Redirect {
                    profile: policy.profile_name.clone(),
                    status,
                    timestamp: clock.now(),
                });
                rebuild_preserving_method_and_body(&mut request, &location)?;
                continue;
            }
            301 | 302 | 303 => {
                redirects += 1;
                if redirects > MAX_REDIRECTS {
                    return Err(PipelineError::Terminal("redirect loop exceeded bound".into()));
                }
                let Some(location) = response_location(&response) else {
                    return Ok(response);
                };
                policy.event_listeners.emit(&RetryEvent::Redirect {
                    profile: policy.profile_name.clone(),
                    status,
                    timestamp: clock.now(),
                });
                rebuild_as_get(&mut request, &location);
                continue;
            }
            _ if policy.is_retryable(Some(status)) => {
                if attempt + 1 >= policy.max_retries {
                    return Err(exhausted(
                        policy,
                        attempt + 1,
                        Some(PipelineError::Terminal(format!("status {status}"))),
                        clock,
                    ));
                }
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| parse_retry_after(v, std::time::SystemTime::now()));
                let delay = cap_to_deadline(
                    retry_after.unwrap_or_else(|| backoff.delay_for(attempt)),
                    remaining,
                );

                #[cfg(feature = "metrics")]
                counter!("retry_attempts_total", "profile" => policy.profile_name.clone()).increment(1);

                #[cfg(feature = "tracing")]
                debug!(profile = %policy.profile_name, attempt = attempt + 1, status, delay_ms = delay.as_millis(), "retrying after status");

                policy.event_listeners.emit(&RetryEvent::Retry {
                    profile: policy.profile_name.clone(),
                    attempt: attempt + 1,
                    delay,
                    timestamp: clock.now(),
                });
                sleep_cancellable(delay, cancel).await?;
                last_error = Some(PipelineError::Terminal(format!("status {status}")));
                attempt += 1;
                continue;
            }
            _ => {
                #[cfg(feature = "metrics")]
                {
                    counter!("retry_calls_total", "profile" => policy.profile_name.clone(), "result" => "success")
                        .increment(1);
                    histogram!("retry_attempts", "profile" => policy.profile_name.clone())
                        .record((attempt + 1) as f64);
                }

                #[cfg(feature = "tracing")]
                {
                    if attempt > 0 {
                        debug!(profile = %policy.profile_name, attempts = attempt + 1, "request succeeded after retries");
                    }
                }

                policy.event_listeners.emit(&RetryEvent::Success {
                    profile: policy.profile_name.clone(),
                    attempts: attempt + 1,
                    timestamp: clock.now(),
                });
                return Ok(response);
            }
        }
    }
}

fn exhausted(
    policy: &RetryPolicy,
    attempts: usize,
    last_error: Option<PipelineError>,
    clock: &SharedClock,
) -> PipelineError {
    #[cfg(feature = "metrics")]
    counter!("retry_calls_total", "profile" => policy.profile_name.clone(), "result" => "budget_exhausted")
        .increment(1);

    #[cfg(feature = "tracing")]
    warn!(profile = %policy.profile_name, attempts, "retry budget exhausted");

    policy.event_listeners.emit(&RetryEvent::BudgetExhausted {
        profile: policy.profile_name.clone(),
        attempts,
        timestamp: clock.now(),
    });
    PipelineError::BudgetExhausted {
        source: Box::new(last_error.unwrap_or(PipelineError::Terminal("retry budget exhausted".into()))),
    }
}

async fn sleep_cancellable(delay: Duration, cancel: &CancellationToken) -> Result<(), PipelineError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

fn response_location(response: &Response) -> Option<String> {
    response
        .headers()
        .get(reqwest::header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Rebuilds `request` in place against `location`, preserving method,
/// headers (minus hop-by-hop), and the existing (replayable) body.
fn rebuild_preserving_method_and_body(request: &mut Request, location: &str) -> Result<(), PipelineError> {
    let new_url = request
        .url()
        .join(location)
        .map_err(|e| PipelineError::Terminal(format!("invalid redirect location: {e}")))?;
    *request.url_mut() = new_url;
    strip_hop_by_hop(request);
    Ok(())
}

/// Rebuilds `request` in place as a GET against `location`, dropping the
/// body, per the 301/302/303 downgrade rule.
fn rebuild_as_get(request: &mut Request, location: &str) {
    if let Ok(new_url) = request.url().join(location) {
        *request.url_mut() = new_url;
    }
    *request.method_mut() = Method::GET;
    *request.body_mut() = None;
    strip_hop_by_hop(request);
}

fn strip_hop_by_hop(request: &mut Request) {
    let hop_by_hop: Vec<HeaderName> = request
        .headers()
        .keys()
        .filter(|name| is_hop_by_hop(name))
        .cloned()
        .collect();
    for name in hop_by_hop {
        request.headers_mut().remove(name);
    }
}

/// Parses a header value as a `Retry-After` duration, exposed for callers
/// that need it outside the send loop (e.g. integration tests asserting on
/// `Retry-After: 0` handling).
pub fn retry_after_duration(value: &HeaderValue, now: std::time::SystemTime) -> Option<Duration> {
    value.to_str().ok().and_then(|v| parse_retry_after(v, now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn policy(max_retries: usize, budget: Duration) -> RetryPolicy {
        RetryPolicy::builder("test")
            .max_retries(max_retries)
            .retry_budget(budget)
            .build()
    }

    #[tokio::test]
    async fn succeeds_immediately_against_a_reachable_server() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = Client::builder().redirect(reqwest::redirect::Policy::none()).build().unwrap();
        let request = client.get(server.uri()).build().unwrap();
        let clock: SharedClock = Arc::new(ManualClock::new());
        let cancel = CancellationToken::new();
        let backoff = ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(10), Duration::ZERO);

        let response = send_with_retries(&client, request, &policy(3, Duration::from_secs(5)), &backoff, &clock, &cancel)
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn retries_a_503_then_succeeds() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = Client::builder().redirect(reqwest::redirect::Policy::none()).build().unwrap();
        let request = client.get(server.uri()).build().unwrap();
        let clock: SharedClock = Arc::new(ManualClock::new());
        let cancel = CancellationToken::new();
        let backoff = ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(5), Duration::ZERO);

        let response = send_with_retries(&client, request, &policy(3, Duration::from_secs(5)), &backoff, &clock, &cancel)
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn exhausts_budget_on_persistent_failure() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = Client::builder().redirect(reqwest::redirect::Policy::none()).build().unwrap();
        let request = client.get(server.uri()).build().unwrap();
        let clock: SharedClock = Arc::new(ManualClock::new());
        let cancel = CancellationToken::new();
        let backoff = ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(2), Duration::ZERO);

        let err = send_with_retries(&client, request, &policy(2, Duration::from_secs(5)), &backoff, &clock, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BudgetExhausted);
    }

    #[tokio::test]
    async fn cancellation_is_reported_even_before_the_first_send() {
        let server = wiremock::MockServer::start().await;
        let client = Client::builder().redirect(reqwest::redirect::Policy::none()).build().unwrap();
        let request = client.get(server.uri()).build().unwrap();
        let clock: SharedClock = Arc::new(ManualClock::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let backoff = ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(2), Duration::ZERO);

        let err = send_with_retries(&client, request, &policy(3, Duration::from_secs(5)), &backoff, &clock, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
