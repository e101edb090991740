//! Classification of control RPC failures.

use std::collections::HashMap;

use tonic::Code;
use tracing::debug;

use crate::ack::{AckRequestData, AckResponse};
use crate::error::Error;

/// Message the service uses when a stream is torn down by a local shutdown.
pub const SHUTDOWN_NOW_MESSAGE: &str = "Server shutdownNow invoked";

const TRANSIENT_FAILURE_PREFIX: &str = "TRANSIENT_";
const PERMANENT_FAILURE_PREFIX: &str = "PERMANENT_";
const PERMANENT_FAILURE_INVALID_ACK_ID: &str = "PERMANENT_FAILURE_INVALID_ACK_ID";

/// Outcome reported to completions for a failed control RPC.
pub fn failed_ack_response(err: &Error) -> AckResponse {
    match err.code() {
        Some(Code::FailedPrecondition) => AckResponse::FailedPrecondition,
        Some(Code::PermissionDenied) => AckResponse::PermissionDenied,
        _ => AckResponse::Other,
    }
}

/// Whether a failed control RPC or stream should be retried.
///
/// Errors that never reached the service are always retryable.
pub fn is_retryable(err: &Error) -> bool {
    let Error::Rpc { code, message, .. } = err else {
        return err.code().is_none();
    };
    match code {
        Code::DeadlineExceeded
        | Code::Internal
        | Code::Cancelled
        | Code::ResourceExhausted
        | Code::Aborted
        | Code::Unknown => true,
        Code::Unavailable => !message.contains(SHUTDOWN_NOW_MESSAGE),
        _ => false,
    }
}

/// Both classifications at once.
pub fn classify(err: &Error) -> (AckResponse, bool) {
    (failed_ack_response(err), is_retryable(err))
}

/// Ack requests of one failed RPC, sorted by what happens to them next.
#[derive(Debug, Default)]
pub struct AckFailures {
    /// Requests to send again.
    pub retry: Vec<AckRequestData>,
    /// Requests that failed for good, with the outcome to report.
    pub failed: Vec<(AckRequestData, AckResponse)>,
    /// Requests the service accepted despite the RPC failing.
    pub succeeded: Vec<AckRequestData>,
}

/// Split the members of a failed RPC using the per ack id reasons the service attached.
///
/// Without per ack id reasons every member shares the RPC level classification.
pub fn classify_ack_failures(err: &Error, requests: Vec<AckRequestData>) -> AckFailures {
    let mut failures = AckFailures::default();
    let metadata = match err {
        Error::Rpc { metadata, .. } if !metadata.is_empty() => metadata,
        _ => {
            let (response, retryable) = classify(err);
            if retryable {
                failures.retry = requests;
            } else {
                failures.failed = requests.into_iter().map(|r| (r, response)).collect();
            }
            return failures;
        }
    };

    for request in requests {
        match metadata.get(request.ack_id().as_str()) {
            None => failures.succeeded.push(request),
            Some(reason) => match reason_outcome(reason) {
                None => failures.retry.push(request),
                Some(response) => failures.failed.push((request, response)),
            },
        }
    }
    failures
}

// `None` means the reason is transient and the ack id should be retried. Unrecognized
// reasons are treated like `PERMANENT_` ones.
fn reason_outcome(reason: &str) -> Option<AckResponse> {
    if reason.starts_with(TRANSIENT_FAILURE_PREFIX) {
        return None;
    }
    match reason {
        PERMANENT_FAILURE_INVALID_ACK_ID => Some(AckResponse::Invalid),
        _ => {
            if !reason.starts_with(PERMANENT_FAILURE_PREFIX) {
                debug!(reason, "Unrecognized ack id failure reason");
            }
            Some(AckResponse::Other)
        }
    }
}

/// Convenience for building per ack id reasons in tests and simulations.
pub fn ack_id_reasons<I, K, V>(reasons: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    reasons
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
