//! Conversion of handler return values into wire responses.
//!
//! A handler produces a [`Payload`]; the pipeline runs it through the per-scope decorator
//! chain, serializes it with the owning scope's [`Serializer`] and assembles the final
//! `hyper` response from it together with the response state accumulated on the context.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Body, Response, StatusCode};
use mime::Mime;
use serde::Serialize;
use serde_json::Value;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::hooks::BoxFuture;

/// The provisional response body produced by a handler or hook.
pub enum Payload {
    /// No body; the response carries only status and headers.
    Empty,

    /// A JSON value, emitted through the scope's serializer as
    /// `application/json; charset=utf-8` by default.
    Json(Value),

    /// Plain text, emitted as `text/plain; charset=utf-8`.
    Text(String),

    /// Raw bytes, emitted as `application/octet-stream`.
    Binary(Bytes),

    /// A finite, non-restartable sequence of chunks, emitted as a chunked streaming
    /// response.
    Stream(BoxStream<'static, Result<Bytes>>),

    /// A pre-built response, passed through with its body untouched.
    Full(Response<Body>),
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Empty => f.write_str("Payload::Empty"),
            Payload::Json(v) => write!(f, "Payload::Json({})", v),
            Payload::Text(s) => write!(f, "Payload::Text({:?})", s),
            Payload::Binary(b) => write!(f, "Payload::Binary({} bytes)", b.len()),
            Payload::Stream(_) => f.write_str("Payload::Stream(..)"),
            Payload::Full(r) => write!(f, "Payload::Full({})", r.status()),
        }
    }
}

impl Payload {
    /// Builds a payload from an error's declared payload value: object payloads stay JSON,
    /// string payloads render as plain text.
    pub(crate) fn from_error_payload(value: &Value) -> Payload {
        match value {
            Value::String(s) => Payload::Text(s.clone()),
            other => Payload::Json(other.clone()),
        }
    }
}

/// Conversion of handler return values into a [`Payload`].
pub trait IntoPayload {
    /// Performs the conversion.
    fn into_payload(self) -> Result<Payload>;
}

impl IntoPayload for Payload {
    fn into_payload(self) -> Result<Payload> {
        Ok(self)
    }
}

impl IntoPayload for () {
    fn into_payload(self) -> Result<Payload> {
        Ok(Payload::Empty)
    }
}

impl IntoPayload for Value {
    fn into_payload(self) -> Result<Payload> {
        Ok(Payload::Json(self))
    }
}

impl IntoPayload for String {
    fn into_payload(self) -> Result<Payload> {
        Ok(Payload::Text(self))
    }
}

impl IntoPayload for &'static str {
    fn into_payload(self) -> Result<Payload> {
        Ok(Payload::Text(self.to_owned()))
    }
}

impl IntoPayload for Bytes {
    fn into_payload(self) -> Result<Payload> {
        Ok(Payload::Binary(self))
    }
}

impl IntoPayload for Vec<u8> {
    fn into_payload(self) -> Result<Payload> {
        Ok(Payload::Binary(Bytes::from(self)))
    }
}

impl IntoPayload for Response<Body> {
    fn into_payload(self) -> Result<Payload> {
        Ok(Payload::Full(self))
    }
}

impl<T> IntoPayload for Option<T>
where
    T: IntoPayload,
{
    fn into_payload(self) -> Result<Payload> {
        match self {
            Some(v) => v.into_payload(),
            None => Ok(Payload::Empty),
        }
    }
}

/// Serializes any `Serialize` value into a JSON payload.
pub fn json<T: Serialize>(value: T) -> Result<Payload> {
    Ok(Payload::Json(serde_json::to_value(value)?))
}

/// Serializes JSON payloads into bytes and a content type.
///
/// Replaceable per scope; the default is [`JsonSerializer`].
pub trait Serializer: Send + Sync {
    /// Produces the wire bytes and content type for a JSON payload.
    fn serialize(&self, value: &Value) -> Result<(Bytes, Mime)>;
}

/// The default serializer: `serde_json` with `application/json; charset=utf-8`.
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &Value) -> Result<(Bytes, Mime)> {
        let bytes = Bytes::from(serde_json::to_vec(value)?);
        Ok((bytes, json_utf8()))
    }
}

/// A per-scope body transform applied root-down before serialization.
pub type Decorator =
    Arc<dyn Fn(Payload, Context) -> BoxFuture<'static, Result<Payload>> + Send + Sync>;

pub(crate) fn json_utf8() -> Mime {
    "application/json; charset=utf-8".parse().unwrap()
}

/// A serialized body ready to be merged with the response state.
pub(crate) enum Built {
    /// Bytes or a stream plus the content type to apply when none is set.
    Assembled {
        body: Body,
        content_type: Option<Mime>,
        length: Option<u64>,
    },
    /// A pre-built response whose body passes through untouched.
    Prebuilt(Response<Body>),
}

/// Serializes a payload with the given serializer.
pub(crate) fn build_body(payload: Payload, serializer: &dyn Serializer) -> Result<Built> {
    let built = match payload {
        Payload::Empty => Built::Assembled {
            body: Body::empty(),
            content_type: None,
            length: Some(0),
        },
        Payload::Json(value) => {
            let (bytes, mime) = serializer.serialize(&value)?;
            let length = bytes.len() as u64;
            Built::Assembled {
                body: Body::from(bytes),
                content_type: Some(mime),
                length: Some(length),
            }
        }
        Payload::Text(text) => {
            let length = text.len() as u64;
            Built::Assembled {
                body: Body::from(text),
                content_type: Some(mime::TEXT_PLAIN_UTF_8),
                length: Some(length),
            }
        }
        Payload::Binary(bytes) => {
            let length = bytes.len() as u64;
            Built::Assembled {
                body: Body::from(bytes),
                content_type: Some(mime::APPLICATION_OCTET_STREAM),
                length: Some(length),
            }
        }
        Payload::Stream(stream) => Built::Assembled {
            body: Body::wrap_stream(stream),
            content_type: None,
            length: None,
        },
        Payload::Full(response) => Built::Prebuilt(response),
    };

    Ok(built)
}

/// Assembles the final response from the accumulated response state and a built body.
///
/// A content type already present in the response state wins over the serializer's choice.
pub(crate) fn assemble(status: StatusCode, mut headers: HeaderMap, built: Built) -> Response<Body> {
    match built {
        Built::Prebuilt(mut response) => {
            let (body_status, body_headers) = (response.status(), response.headers().clone());
            // The pre-built value is authoritative for anything it set itself.
            for (name, value) in body_headers.iter() {
                headers.insert(name, value.clone());
            }
            *response.headers_mut() = headers;
            *response.status_mut() = if body_status == StatusCode::OK {
                status
            } else {
                body_status
            };
            response
        }
        Built::Assembled {
            body,
            content_type,
            length,
        } => {
            if let Some(mime) = content_type {
                if !headers.contains_key(CONTENT_TYPE) {
                    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
                        headers.insert(CONTENT_TYPE, value);
                    }
                }
            }
            if let Some(length) = length {
                if !headers.contains_key(CONTENT_LENGTH) {
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
                }
            }

            let mut response = Response::new(body);
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assembled(built: Built) -> (Body, Option<Mime>, Option<u64>) {
        match built {
            Built::Assembled {
                body,
                content_type,
                length,
            } => (body, content_type, length),
            Built::Prebuilt(_) => panic!("expected an assembled body"),
        }
    }

    #[test]
    fn json_payloads_serialize_with_utf8_content_type() {
        let built = build_body(Payload::Json(json!({"ok": true})), &JsonSerializer).unwrap();
        let (_, mime, length) = assembled(built);
        assert_eq!(mime.unwrap().as_ref(), "application/json; charset=utf-8");
        assert_eq!(length, Some(11));
    }

    #[test]
    fn text_payloads_are_plain_utf8() {
        let built = build_body(Payload::Text("hi".into()), &JsonSerializer).unwrap();
        let (_, mime, length) = assembled(built);
        assert_eq!(mime, Some(mime::TEXT_PLAIN_UTF_8));
        assert_eq!(length, Some(2));
    }

    #[test]
    fn binary_payloads_are_octet_streams() {
        let built = build_body(Payload::Binary(Bytes::from_static(b"\x00\x01")), &JsonSerializer)
            .unwrap();
        let (_, mime, _) = assembled(built);
        assert_eq!(mime, Some(mime::APPLICATION_OCTET_STREAM));
    }

    #[test]
    fn assemble_does_not_override_a_user_set_content_type() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/hal+json"));
        let built = build_body(Payload::Json(json!({})), &JsonSerializer).unwrap();
        let response = assemble(StatusCode::OK, headers, built);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/hal+json"
        );
    }

    #[test]
    fn prebuilt_responses_keep_their_body_and_status() {
        let prebuilt = Response::builder()
            .status(StatusCode::IM_A_TEAPOT)
            .body(Body::from("tea"))
            .unwrap();
        let built = build_body(Payload::Full(prebuilt), &JsonSerializer).unwrap();
        let response = assemble(StatusCode::OK, HeaderMap::new(), built);
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    }

    #[test]
    fn error_payload_strings_render_as_text() {
        match Payload::from_error_payload(&json!("Page not found")) {
            Payload::Text(s) => assert_eq!(s, "Page not found"),
            other => panic!("unexpected payload: {:?}", other),
        }
    }
}
