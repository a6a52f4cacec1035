// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Checking that a redeployed service behaves like the original.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tracing::info;

use crate::http::{AvailabilityError, ServicePoller, ServiceResponse};

#[derive(Debug, Error)]
pub enum CompareError {
    #[error("original service is unreachable")]
    OriginalUnreachable(#[source] AvailabilityError),

    #[error("original service returned {actual}, expected {expected}")]
    UnexpectedOriginalStatus { expected: StatusCode, actual: StatusCode },

    #[error("redeployed service is unreachable")]
    RedeployedUnreachable(#[source] AvailabilityError),

    #[error(
        "redeployed service returned {redeployed}, original returned \
        {original}"
    )]
    StatusMismatch { original: StatusCode, redeployed: StatusCode },

    #[error(
        "redeployed service returned a different response body\n\
        === original ===\n{original}\n=== redeployed ===\n{redeployed}"
    )]
    BodyMismatch { original: String, redeployed: String },
}

/// The matching responses from an original service and its redeployment.
#[derive(Clone, Debug)]
pub struct RedeployComparison {
    pub original: ServiceResponse,
    pub redeployed: ServiceResponse,
}

/// Forms the URL for the root of a service listening on `addr:port`.
pub fn service_url(addr: &str, port: u16) -> String {
    format!("http://{addr}:{port}/")
}

impl ServicePoller {
    /// Compares the response of a service that should already be up at
    /// `original_addr` with the response from its redeployment at
    /// `redeployed_addr`, which may take up to `max_wait_for_target` to start
    /// answering.
    ///
    /// The original must answer with `expected_status`. The redeployment must
    /// answer with the same status and body as the original.
    pub fn compare_redeployed(
        &self,
        original_addr: &str,
        redeployed_addr: &str,
        port: u16,
        expected_status: StatusCode,
        max_wait_for_target: Option<Duration>,
    ) -> Result<RedeployComparison, CompareError> {
        let original_url = service_url(original_addr, port);
        let original = self
            .await_response(&original_url, None)
            .map_err(CompareError::OriginalUnreachable)?;
        info!(url = original_url, "Response received from original service");

        if original.status() != expected_status {
            return Err(CompareError::UnexpectedOriginalStatus {
                expected: expected_status,
                actual: original.status(),
            });
        }

        let redeployed_url = service_url(redeployed_addr, port);
        let redeployed = self
            .await_response(&redeployed_url, max_wait_for_target)
            .map_err(CompareError::RedeployedUnreachable)?;
        info!(
            url = redeployed_url,
            "Response received from redeployed service"
        );

        // Compare against what the original actually said rather than the
        // expected status: the two only need to agree with each other.
        if redeployed.status() != original.status() {
            return Err(CompareError::StatusMismatch {
                original: original.status(),
                redeployed: redeployed.status(),
            });
        }

        if redeployed.text() != original.text() {
            return Err(CompareError::BodyMismatch {
                original: original.text().to_owned(),
                redeployed: redeployed.text().to_owned(),
            });
        }

        Ok(RedeployComparison { original, redeployed })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::http::test::{poller, unused_addr, StubService};
    use std::net::{SocketAddr, TcpListener};

    /// Starts an "original" service on 127.0.0.1 and a "redeployed" one on
    /// 127.0.0.2, both on the same port.
    fn service_pair(
        original: (u16, &str),
        redeployed: (u16, &str),
    ) -> (StubService, StubService) {
        let original = StubService::start(original.0, original.1);
        let port = original.addr().port();
        let listener =
            TcpListener::bind(SocketAddr::from(([127, 0, 0, 2], port)))
                .unwrap();
        let redeployed =
            StubService::serve(listener, redeployed.0, redeployed.1);
        (original, redeployed)
    }

    #[test]
    fn identical_services_compare_equal() {
        let (original, redeployed) =
            service_pair((200, "Hello, World!"), (200, "Hello, World!"));
        let comparison = poller()
            .compare_redeployed(
                "127.0.0.1",
                "127.0.0.2",
                original.addr().port(),
                StatusCode::OK,
                Some(Duration::from_secs(5)),
            )
            .unwrap();
        assert_eq!(comparison.redeployed.text(), "Hello, World!");
        assert_eq!(original.hits(), 1);
        assert_eq!(redeployed.hits(), 1);
    }

    #[test]
    fn differing_body_is_a_body_mismatch() {
        let (original, _redeployed) =
            service_pair((200, "Hello, World!"), (200, "Goodbye, World!"));
        let err = poller()
            .compare_redeployed(
                "127.0.0.1",
                "127.0.0.2",
                original.addr().port(),
                StatusCode::OK,
                None,
            )
            .unwrap_err();
        match err {
            CompareError::BodyMismatch { original, redeployed } => {
                assert_eq!(original, "Hello, World!");
                assert_eq!(redeployed, "Goodbye, World!");
            }
            other => panic!("expected a body mismatch, got {other:?}"),
        }
    }

    #[test]
    fn differing_status_is_a_status_mismatch() {
        let (original, _redeployed) =
            service_pair((200, "Hello, World!"), (500, "Hello, World!"));
        let err = poller()
            .compare_redeployed(
                "127.0.0.1",
                "127.0.0.2",
                original.addr().port(),
                StatusCode::OK,
                None,
            )
            .unwrap_err();
        match err {
            CompareError::StatusMismatch { original, redeployed } => {
                assert_eq!(original, StatusCode::OK);
                assert_eq!(redeployed, StatusCode::INTERNAL_SERVER_ERROR);
            }
            other => panic!("expected a status mismatch, got {other:?}"),
        }
    }

    #[test]
    fn redeployed_status_is_checked_against_original() {
        // Neither side returns the expected status, so the original check
        // fails first.
        let (original, redeployed) =
            service_pair((404, "missing"), (404, "missing"));
        let err = poller()
            .compare_redeployed(
                "127.0.0.1",
                "127.0.0.2",
                original.addr().port(),
                StatusCode::OK,
                None,
            )
            .unwrap_err();
        match err {
            CompareError::UnexpectedOriginalStatus { expected, actual } => {
                assert_eq!(expected, StatusCode::OK);
                assert_eq!(actual, StatusCode::NOT_FOUND);
            }
            other => panic!("expected an unexpected status, got {other:?}"),
        }
        assert_eq!(redeployed.hits(), 0);

        let comparison = poller()
            .compare_redeployed(
                "127.0.0.1",
                "127.0.0.2",
                original.addr().port(),
                StatusCode::NOT_FOUND,
                None,
            )
            .unwrap();
        assert_eq!(comparison.original.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn unreachable_original_is_reported() {
        let port = unused_addr().port();
        let err = poller()
            .compare_redeployed(
                "127.0.0.1",
                "127.0.0.2",
                port,
                StatusCode::OK,
                Some(Duration::from_secs(1)),
            )
            .unwrap_err();
        assert!(matches!(err, CompareError::OriginalUnreachable(_)));
    }

    #[test]
    fn unreachable_redeployment_is_reported() {
        let original = StubService::start(200, "Hello, World!");
        let err = poller()
            .compare_redeployed(
                "127.0.0.1",
                "127.0.0.2",
                original.addr().port(),
                StatusCode::OK,
                Some(Duration::from_millis(500)),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            CompareError::RedeployedUnreachable(
                AvailabilityError::NoResponseWithinTimeout { .. }
            )
        ));
    }

    #[test]
    fn redeployment_may_come_up_late() {
        let original = StubService::start(200, "Hello, World!");
        let port = original.addr().port();
        StubService::start_after(
            SocketAddr::from(([127, 0, 0, 2], port)),
            Duration::from_millis(500),
            200,
            "Hello, World!",
        );

        poller()
            .compare_redeployed(
                "127.0.0.1",
                "127.0.0.2",
                port,
                StatusCode::OK,
                Some(Duration::from_secs(10)),
            )
            .unwrap();
    }
}
