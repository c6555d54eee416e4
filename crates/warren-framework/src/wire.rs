//! Reply wire format.
//!
//! Success replies carry the handler's JSON value as the body. Error replies
//! carry a `null` body and describe the failure in headers:
//!
//! | header         | value                                                  |
//! |----------------|--------------------------------------------------------|
//! | `x-error`      | human readable message                                 |
//! | `x-error-kind` | `transient`, `permanent`, `invalid`, `route_not_found`, `aborted`, ... |
//! | `x-error-code` | optional application code                              |
//! | `x-error-data` | optional structured data                               |
//! | `x-service`    | name of the replying service                           |

use serde_json::Value;
use thiserror::Error;
use warren_core::{Headers, InboundMessage, OutboundReply, Reply};

pub const HEADER_ERROR: &str = "x-error";
pub const HEADER_ERROR_KIND: &str = "x-error-kind";
pub const HEADER_ERROR_CODE: &str = "x-error-code";
pub const HEADER_ERROR_DATA: &str = "x-error-data";
pub const HEADER_SERVICE: &str = "x-service";

/// Body of every error reply.
pub const NULL_BODY: &[u8] = b"null";

/// Error details carried by an error reply.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
    pub code: Option<i64>,
    pub data: Option<Value>,
    /// Service that produced the error, if it said so.
    pub service: Option<String>,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            code: None,
            data: None,
            service: None,
        }
    }

    pub fn with_code(mut self, code: Option<i64>) -> Self {
        self.code = code;
        self
    }

    pub fn with_data(mut self, data: Option<Value>) -> Self {
        self.data = data;
        self
    }

    /// Decodes an error reply. Returns `None` for success replies.
    pub fn from_headers(headers: &Headers) -> Option<Self> {
        let message = headers.get(HEADER_ERROR)?;
        let message = match message {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let kind = headers
            .get(HEADER_ERROR_KIND)
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        Some(Self {
            kind,
            message,
            code: headers.get(HEADER_ERROR_CODE).and_then(Value::as_i64),
            data: headers
                .get(HEADER_ERROR_DATA)
                .filter(|v| !v.is_null())
                .cloned(),
            service: headers
                .get(HEADER_SERVICE)
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    fn into_headers(self, service: &str) -> Headers {
        let mut headers = Headers::new();
        headers.insert(HEADER_ERROR.into(), Value::String(self.message));
        headers.insert(HEADER_ERROR_KIND.into(), Value::String(self.kind));
        if let Some(code) = self.code {
            headers.insert(HEADER_ERROR_CODE.into(), Value::from(code));
        }
        if let Some(data) = self.data {
            headers.insert(HEADER_ERROR_DATA.into(), data);
        }
        headers.insert(HEADER_SERVICE.into(), Value::String(service.to_string()));
        headers
    }
}

/// Encodes a successful result for `request`.
///
/// Returns `Ok(None)` when the request has no `reply_to`. A handler that
/// produced no reply body answers with `null`.
pub fn success_reply(
    request: &InboundMessage,
    reply: Option<Reply>,
    service: &str,
) -> Result<Option<OutboundReply>, serde_json::Error> {
    let Reply {
        payload,
        mut headers,
    } = reply.unwrap_or_default();
    let body = serde_json::to_vec(&payload)?;
    headers.insert(HEADER_SERVICE.into(), Value::String(service.to_string()));
    Ok(OutboundReply::to(request, body, headers))
}

/// Encodes an error reply for `request`.
///
/// Returns `None` when the request has no `reply_to`.
pub fn error_reply(request: &InboundMessage, error: RemoteError, service: &str) -> Option<OutboundReply> {
    OutboundReply::to(request, NULL_BODY.to_vec(), error.into_headers(service))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use warren_core::DeliveryTag;

    fn request() -> InboundMessage {
        InboundMessage::new("rpc.echo", "echo", b"{}".to_vec(), DeliveryTag::new(1))
            .with_correlation_id("abc")
            .with_reply_to("amq.gen-1")
    }

    #[test]
    fn test_success_reply() {
        let reply = success_reply(&request(), Some(Reply::new(json!({"v": 10}))), "svc")
            .unwrap()
            .unwrap();
        assert_eq!(reply.payload, br#"{"v":10}"#.to_vec());
        assert_eq!(reply.correlation_id.as_deref(), Some("abc"));
        assert!(RemoteError::from_headers(&reply.headers).is_none());
    }

    #[test]
    fn test_empty_success_is_null() {
        let reply = success_reply(&request(), None, "svc").unwrap().unwrap();
        assert_eq!(reply.payload, NULL_BODY.to_vec());
    }

    #[test]
    fn test_error_reply_headers_decode() {
        let error = RemoteError::new("permanent", "out of stock")
            .with_code(Some(409))
            .with_data(Some(json!({"sku": "A1"})));
        let reply = error_reply(&request(), error, "billing").unwrap();

        assert_eq!(reply.payload, NULL_BODY.to_vec());
        let decoded = RemoteError::from_headers(&reply.headers).unwrap();
        assert_eq!(decoded.kind, "permanent");
        assert_eq!(decoded.message, "out of stock");
        assert_eq!(decoded.code, Some(409));
        assert_eq!(decoded.data, Some(json!({"sku": "A1"})));
        assert_eq!(decoded.service.as_deref(), Some("billing"));
    }

    #[test]
    fn test_no_reply_without_reply_to() {
        let request = InboundMessage::new("q", "k", Vec::new(), DeliveryTag::new(1));
        assert!(error_reply(&request, RemoteError::new("invalid", "bad"), "svc").is_none());
    }
}
