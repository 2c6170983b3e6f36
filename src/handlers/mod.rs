pub mod chat;
pub mod documents;
pub mod health;
pub mod sessions;

use axum::body::Body;
use axum::extract::Request;
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;

const ENVELOPE_MARKER: &str = "x-error-envelope";
const MAX_ENVELOPE_BYTES: usize = 64 * 1024;

/// Fill the `path` field of error envelopes. `ApiError::into_response`
/// cannot see the request URI, so it marks its responses and this
/// middleware rewrites the JSON body with the real path.
pub async fn inject_error_path(req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    let response = next.run(req).await;

    if !response.headers().contains_key(ENVELOPE_MARKER) {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    parts.headers.remove(ENVELOPE_MARKER);

    let bytes = match axum::body::to_bytes(body, MAX_ENVELOPE_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return Response::from_parts(parts, Body::empty()),
    };

    match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(mut value) => {
            if let Some(object) = value.as_object_mut() {
                object.insert("path".to_string(), serde_json::Value::String(path));
            }
            let rewritten = serde_json::to_vec(&value).unwrap_or_else(|_| bytes.to_vec());
            parts.headers.remove(header::CONTENT_LENGTH);
            Response::from_parts(parts, Body::from(rewritten))
        }
        Err(_) => Response::from_parts(parts, Body::from(bytes)),
    }
}
