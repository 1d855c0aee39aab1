//! JSON responses and error mapping for the HTTP API.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::error;

use crate::prober::ProberError;

/// How a client should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    /// Fix the request
    Modify,
    /// Authenticate
    Auth,
    /// Retry later
    Wait,
    /// Give up
    Cancel,
}

impl ErrorType {
    pub fn for_status(status: StatusCode) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorType::Auth,
            StatusCode::TOO_MANY_REQUESTS | StatusCode::BAD_GATEWAY => ErrorType::Wait,
            s if s.is_client_error() => ErrorType::Modify,
            _ => ErrorType::Cancel,
        }
    }
}

/// An error to be returned to the API client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    request_id: &'a str,
    message: String,
    #[serde(rename = "type")]
    kind: ErrorType,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: Some(detail.into()),
        }
    }

    pub fn from_status(status: StatusCode) -> Self {
        Self {
            status,
            detail: None,
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn not_found() -> Self {
        Self::from_status(StatusCode::NOT_FOUND)
    }

    pub fn method_not_allowed() -> Self {
        Self::from_status(StatusCode::METHOD_NOT_ALLOWED)
    }

    pub fn too_many_requests() -> Self {
        Self::from_status(StatusCode::TOO_MANY_REQUESTS)
    }

    /// `"<code> <reason>[: <detail>]"`; server errors never expose details.
    pub fn message(&self) -> String {
        let reason = self.status.canonical_reason().unwrap_or("Unknown");
        match &self.detail {
            Some(detail) if !self.status.is_server_error() => {
                format!("{} {}: {}", self.status.as_u16(), reason, detail)
            }
            _ => format!("{} {}", self.status.as_u16(), reason),
        }
    }

    pub fn into_response(self, request_id: &str) -> Response<Full<Bytes>> {
        json_response(
            self.status,
            &ErrorBody {
                request_id,
                message: self.message(),
                kind: ErrorType::for_status(self.status),
            },
        )
    }
}

impl From<ProberError> for ApiError {
    fn from(e: ProberError) -> Self {
        match e {
            ProberError::Unavailable(detail) => ApiError::new(StatusCode::BAD_GATEWAY, detail),
            other => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        }
    }
}

/// Serialize `value` as a JSON response with `status`.
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let (status, body) = match serde_json::to_vec(value) {
        Ok(body) => (status, body),
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            (StatusCode::INTERNAL_SERVER_ERROR, b"{}".to_vec())
        }
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_error_type_mapping() {
        assert_eq!(ErrorType::for_status(StatusCode::BAD_REQUEST), ErrorType::Modify);
        assert_eq!(ErrorType::for_status(StatusCode::NOT_FOUND), ErrorType::Modify);
        assert_eq!(ErrorType::for_status(StatusCode::METHOD_NOT_ALLOWED), ErrorType::Modify);
        assert_eq!(ErrorType::for_status(StatusCode::FORBIDDEN), ErrorType::Auth);
        assert_eq!(ErrorType::for_status(StatusCode::TOO_MANY_REQUESTS), ErrorType::Wait);
        assert_eq!(ErrorType::for_status(StatusCode::BAD_GATEWAY), ErrorType::Wait);
        assert_eq!(
            ErrorType::for_status(StatusCode::INTERNAL_SERVER_ERROR),
            ErrorType::Cancel
        );
    }

    #[test]
    fn test_message_hides_server_error_details() {
        assert_eq!(
            ApiError::bad_request("invalid target").message(),
            "400 Bad Request: invalid target"
        );
        assert_eq!(ApiError::too_many_requests().message(), "429 Too Many Requests");
        assert_eq!(
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "secret").message(),
            "500 Internal Server Error"
        );
    }

    #[test]
    fn test_prober_error_mapping() {
        let err = ApiError::from(ProberError::Unavailable("refused".into()));
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
        let err = ApiError::from(ProberError::BadStatus(503));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_error_response_body() {
        let response = ApiError::too_many_requests().into_response("id@192.0.2.1");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            HeaderValue::from_static("application/json")
        );

        let json = body_json(response).await;
        assert_eq!(json["request_id"], "id@192.0.2.1");
        assert_eq!(json["message"], "429 Too Many Requests");
        assert_eq!(json["type"], "wait");
    }
}
