// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Checking whether HTTP services are up.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use reqwest::{blocking::Client, header::HeaderMap, StatusCode};
use thiserror::Error;
use tracing::{debug, info};

/// The pause between attempts to reach a service that isn't responding yet.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum AvailabilityError {
    #[error("No response from service at {url}: {last_error}")]
    NoResponse { url: String, last_error: String },

    #[error(
        "No response from service at {url} within {waited:?}: {last_error}"
    )]
    NoResponseWithinTimeout {
        url: String,
        waited: Duration,
        last_error: String,
    },
}

/// A response captured from a service.
#[derive(Clone, Debug)]
pub struct ServiceResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: String,
}

impl ServiceResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn text(&self) -> &str {
        &self.body
    }
}

/// A service to check, and how long it may take to start responding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceCheck {
    /// The service must respond to the first request.
    Immediate(String),

    /// The service may take up to the given duration to respond.
    WithTimeout(String, Duration),
}

impl ServiceCheck {
    pub fn url(&self) -> &str {
        match self {
            ServiceCheck::Immediate(url)
            | ServiceCheck::WithTimeout(url, _) => url,
        }
    }

    pub fn max_wait(&self) -> Option<Duration> {
        match self {
            ServiceCheck::Immediate(_) => None,
            ServiceCheck::WithTimeout(_, wait) => Some(*wait),
        }
    }
}

/// Issues GET requests to services until they respond.
///
/// Cloning a poller shares its underlying connection pool.
#[derive(Clone, Debug)]
pub struct ServicePoller {
    client: Client,
}

impl ServicePoller {
    /// Creates a poller whose requests have no timeout of their own. Only
    /// [`ServicePoller::await_response`] with a maximum wait bounds how long a
    /// request may take.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(None).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Gets a response from `url`.
    ///
    /// If `max_wait` is `None` the service is expected to respond to the
    /// first request. Otherwise transport errors (refused connections,
    /// timeouts, name resolution failures) are retried until the service
    /// responds or `max_wait` has elapsed, and no single attempt is allowed
    /// to outlast `max_wait`. Any HTTP status counts as a response.
    ///
    /// A request that can't be built (e.g. a malformed URL) fails right away
    /// with [`AvailabilityError::NoResponse`].
    pub fn await_response(
        &self,
        url: &str,
        max_wait: Option<Duration>,
    ) -> Result<ServiceResponse, AvailabilityError> {
        let Some(max_wait) = max_wait else {
            return self.fetch(url, None).map_err(|e| {
                AvailabilityError::NoResponse {
                    url: url.to_owned(),
                    last_error: e.to_string(),
                }
            });
        };

        info!(url, ?max_wait, "Waiting for service to respond");
        let deadline = Instant::now() + max_wait;
        let attempt = || {
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.fetch(url, Some(remaining)).map_err(|e| {
                if e.is_builder() {
                    return backoff::Error::permanent(e);
                }

                debug!(url, error = %e, "service not available yet");
                backoff::Error::transient(e)
            })
        };

        let backoff = backoff::ExponentialBackoff {
            initial_interval: RETRY_INTERVAL,
            max_interval: RETRY_INTERVAL,
            multiplier: 1.0,
            randomization_factor: 0.0,
            max_elapsed_time: Some(max_wait),
            ..Default::default()
        };

        backoff::retry(backoff, attempt).map_err(|e| match e {
            backoff::Error::Permanent(e) => AvailabilityError::NoResponse {
                url: url.to_owned(),
                last_error: e.to_string(),
            },
            backoff::Error::Transient { err, .. } => {
                AvailabilityError::NoResponseWithinTimeout {
                    url: url.to_owned(),
                    waited: max_wait,
                    last_error: err.to_string(),
                }
            }
        })
    }

    /// Checks each service in turn and returns their responses keyed by URL.
    /// Stops at the first service that fails to respond.
    pub fn await_all(
        &self,
        checks: &[ServiceCheck],
    ) -> Result<BTreeMap<String, ServiceResponse>, AvailabilityError> {
        let mut responses = BTreeMap::new();
        for check in checks {
            let response = self.await_response(check.url(), check.max_wait())?;
            responses.insert(check.url().to_owned(), response);
        }

        Ok(responses)
    }

    fn fetch(
        &self,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<ServiceResponse, reqwest::Error> {
        let mut request = self.client.get(url);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send()?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text()?;
        Ok(ServiceResponse { status, headers, body })
    }
}
