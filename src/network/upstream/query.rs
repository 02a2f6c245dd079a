/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Attempt loop shared by every transport

use crate::config::StalePolicy;
use crate::core::error::{DnsError, Result};
use crate::network::upstream::ServerIdentity;
use crate::network::upstream::message::{Request, Response};
use crate::network::upstream::validator::validate;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Context handed to each attempt
#[derive(Debug, Clone, Copy)]
pub(crate) struct Attempt {
    /// Zero based, not counting the stale retry
    pub number: u32,
    /// Set for the free repeat of a stale first attempt
    pub stale_retry: bool,
}

/// Run up to `retries` attempts of `attempt`
///
/// Each attempt races `timeout` and the caller's `cancel` signal. Answers
/// are validated here; a validation failure ends the loop. Retryable errors
/// move on to the next attempt, except that a first-attempt failure whose
/// stale reason is allowed by `policy` is repeated once for free. When the
/// budget runs out, the final attempt's error is returned, or
/// [`DnsError::NoResponse`] if it timed out.
pub(crate) async fn run<F, Fut>(
    server: &ServerIdentity,
    request: &Request,
    timeout: Duration,
    retries: u32,
    cancel: &CancellationToken,
    policy: &StalePolicy,
    mut attempt: F,
) -> Result<Response>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<Response>>,
{
    if retries == 0 {
        return Err(DnsError::config("retries must be at least 1"));
    }

    let mut number = 0;
    let mut stale_retry = false;
    let mut last_error = None;

    while number < retries {
        let current = Attempt {
            number,
            stale_retry,
        };
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DnsError::Cancelled),
            outcome = tokio::time::timeout(timeout, attempt(current)) => outcome,
        };

        match outcome {
            Ok(Ok(mut response)) => {
                validate(request, response.message_mut())?;
                return Ok(response);
            }
            Ok(Err(e)) if !e.is_retryable() => return Err(e),
            Ok(Err(e)) => {
                if number == 0 && !stale_retry && policy.allows(e.stale_reason()) {
                    debug!(
                        server = %server,
                        reason = ?e.stale_reason(),
                        "Stale connection on first attempt, retrying without charge"
                    );
                    stale_retry = true;
                    continue;
                }
                warn!(
                    server = %server,
                    attempt = number + 1,
                    retries,
                    error = %e,
                    "Upstream attempt failed"
                );
                last_error = Some(e);
            }
            Err(_) => {
                debug!(
                    server = %server,
                    attempt = number + 1,
                    retries,
                    timeout_ms = timeout.as_millis() as u64,
                    "Upstream attempt timed out"
                );
                last_error = None;
            }
        }
        number += 1;
    }

    Err(last_error.unwrap_or_else(|| DnsError::NoResponse {
        server: server.to_string(),
        qname: request.qname(),
    }))
}
