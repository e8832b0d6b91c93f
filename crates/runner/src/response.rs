//! Status and body assertions on the HTTP exchange

use serde_json::Value;
use tracing::debug;

use crate::error::{RestamentError, RunResult};
use crate::matcher::json_eq;
use crate::transport::HttpResponse;

/// Check the status code, parse the body as JSON and compare it to `expected`.
///
/// The status is checked first, so a 500 with an HTML error page reports the
/// status mismatch rather than the parse failure.
pub fn assert_response(
    response: &HttpResponse,
    expected_status: u16,
    expected_body: Option<&Value>,
) -> RunResult<Value> {
    if response.status != expected_status {
        return Err(RestamentError::StatusMismatch {
            expected: expected_status,
            actual: response.status,
        });
    }

    let parsed: Value = serde_json::from_str(&response.body).map_err(|_| {
        RestamentError::NonJsonBody {
            body: response.body.clone(),
        }
    })?;

    if let Some(expected) = expected_body {
        if !json_eq(expected, &parsed) {
            return Err(RestamentError::BodyMismatch {
                expected: expected.clone(),
                actual: parsed,
            });
        }
    }

    debug!("Response matched (status {})", response.status);
    Ok(parsed)
}
