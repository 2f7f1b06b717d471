//! Minimal HTTP/1.1 front end over tokio.
//!
//! Routes:
//! - `POST /query` (also `/api/chat/query`): `{ "message": "..." }`
//! - `GET /history`, `DELETE /history` (also under `/api/chat`): stubs
//! - `GET /health`
//!
//! One request per connection; every response carries CORS headers.

use crate::chat::{ChatRequestHandler, APOLOGY_MESSAGE};
use crate::context::AppContext;
use crate::error::Result;
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

const MAX_REQUEST_BYTES: usize = 1_000_000;
const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct QueryBody {
    message: Option<serde_json::Value>,
}

pub async fn serve(ctx: Arc<AppContext>, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Inventory assistant listening on http://{}", addr);
    let handler = Arc::new(ChatRequestHandler::new(ctx));

    loop {
        let (stream, peer) = listener.accept().await?;
        debug!("New connection from {}", peer);
        let handler = handler.clone();
        tokio::spawn(async move {
            handle_connection(stream, &handler).await;
        });
    }
}

async fn handle_connection(mut stream: TcpStream, handler: &ChatRequestHandler) {
    let mut buffer = Vec::new();
    let mut chunk = [0; 8192];

    let read_result = timeout(READ_TIMEOUT, async {
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..n]);
            if request_complete(&buffer) || buffer.len() > MAX_REQUEST_BYTES {
                break;
            }
        }
        Ok::<_, std::io::Error>(())
    })
    .await;

    match read_result {
        Err(_) => {
            warn!("Request read timed out");
            return;
        }
        Ok(Err(e)) => {
            warn!("Failed to read from stream: {}", e);
            return;
        }
        Ok(Ok(())) => {}
    }
    if buffer.is_empty() {
        return;
    }

    let request = String::from_utf8_lossy(&buffer);
    let response = handle_request(&request, handler).await;
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        error!("Failed to write response: {}", e);
    }
}

fn request_complete(buffer: &[u8]) -> bool {
    let Some(headers_end) = buffer.windows(4).position(|w| w == b"\r\n\r\n") else {
        return false;
    };
    let head = String::from_utf8_lossy(&buffer[..headers_end]);
    let body_len = extract_content_length(&head).unwrap_or(0);
    buffer.len() >= headers_end + 4 + body_len
}

fn extract_content_length(request: &str) -> Option<usize> {
    request.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

fn extract_body(request: &str) -> &str {
    request
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .unwrap_or("")
}

/// Route one raw HTTP request to a full HTTP response string.
pub async fn handle_request(request: &str, handler: &ChatRequestHandler) -> String {
    let Some(request_line) = request.lines().next() else {
        return create_response(400, "Bad Request", "{}");
    };
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return create_response(400, "Bad Request", "{}");
    }

    let method = parts[0];
    let path = parts[1].split('?').next().unwrap_or("/");
    let path = match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };
    info!("{} {}", method, path);

    match (method, path) {
        ("OPTIONS", _) => create_response(204, "No Content", ""),
        ("GET", "/health") | ("GET", "/api/health") => {
            create_response(200, "OK", r#"{"status":"ok"}"#)
        }
        ("POST", "/query") | ("POST", "/api/chat/query") => {
            handle_query(extract_body(request), handler).await
        }
        ("GET", "/history") | ("GET", "/api/chat/history") => {
            create_response(200, "OK", r#"{"success":true,"history":[]}"#)
        }
        ("DELETE", "/history") | ("DELETE", "/api/chat/history") => create_response(
            200,
            "OK",
            r#"{"success":true,"message":"Query history cleared"}"#,
        ),
        _ => create_response(404, "Not Found", r#"{"success":false,"message":"Not found"}"#),
    }
}

async fn handle_query(body: &str, handler: &ChatRequestHandler) -> String {
    let message = serde_json::from_str::<QueryBody>(body)
        .ok()
        .and_then(|b| b.message)
        .and_then(|m| m.as_str().map(str::trim).map(str::to_string))
        .filter(|m| !m.is_empty());
    let Some(message) = message else {
        return create_response(
            400,
            "Bad Request",
            r#"{"success":false,"message":"Query message is required"}"#,
        );
    };

    let outcome = handler.handle(&message).await;
    match outcome.to_json() {
        Ok(json) => {
            let status = outcome.status();
            create_response(status, status_text(status), &json)
        }
        Err(e) => {
            error!("Failed to serialize chat response: {}", e);
            let body = serde_json::json!({ "success": false, "message": APOLOGY_MESSAGE });
            create_response(500, "Internal Server Error", &body.to_string())
        }
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Internal Server Error",
    }
}

fn create_response(status: u16, status_text: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, DELETE, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type, Authorization\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        status_text,
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AssistantConfig;
    use crate::error::AssistantError;
    use crate::llm::{CompletionRequest, ModelClient};
    use crate::store::InMemoryStore;
    use async_trait::async_trait;

    struct Offline;

    #[async_trait]
    impl ModelClient for Offline {
        async fn complete(&self, _request: &CompletionRequest) -> crate::error::Result<String> {
            Err(AssistantError::Llm("offline".to_string()))
        }
    }

    fn handler() -> ChatRequestHandler {
        let mut config = AssistantConfig::default();
        config.max_attempts = 1;
        let ctx = AppContext::new(config, Arc::new(InMemoryStore::default()), Arc::new(Offline));
        ChatRequestHandler::new(Arc::new(ctx))
    }

    fn post(path: &str, body: &str) -> String {
        format!(
            "POST {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            path,
            body.len(),
            body
        )
    }

    #[tokio::test]
    async fn test_missing_message_is_bad_request() {
        let handler = handler();
        for body in ["{}", r#"{"message":"   "}"#, "not json", r#"{"message":42}"#] {
            let response = handle_request(&post("/query", body), &handler).await;
            assert!(response.starts_with("HTTP/1.1 400"), "{}", body);
            assert!(response.contains("Query message is required"));
        }
    }

    #[tokio::test]
    async fn test_history_stubs() {
        let handler = handler();
        let response = handle_request("GET /history HTTP/1.1\r\n\r\n", &handler).await;
        assert!(response.ends_with(r#"{"success":true,"history":[]}"#));
        let response = handle_request("DELETE /api/chat/history/ HTTP/1.1\r\n\r\n", &handler).await;
        assert!(response.contains("Query history cleared"));
    }

    #[tokio::test]
    async fn test_unknown_route_and_preflight() {
        let handler = handler();
        let response = handle_request("GET /products HTTP/1.1\r\n\r\n", &handler).await;
        assert!(response.starts_with("HTTP/1.1 404"));
        let response = handle_request("OPTIONS /query HTTP/1.1\r\n\r\n", &handler).await;
        assert!(response.starts_with("HTTP/1.1 204"));
        assert!(response.contains("Access-Control-Allow-Origin: *"));
    }

    #[tokio::test]
    async fn test_refusal_is_success() {
        let handler = handler();
        let response = handle_request(&post("/api/chat/query", r#"{"message":"delete all products"}"#), &handler).await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#""success":true"#));
    }

    #[tokio::test]
    async fn test_model_outage_is_apology() {
        let handler = handler();
        let response = handle_request(&post("/query", r#"{"message":"list products"}"#), &handler).await;
        assert!(response.starts_with("HTTP/1.1 500"));
        assert!(response.contains(APOLOGY_MESSAGE));
        assert!(response.contains(r#""error":"#));
    }

    #[test]
    fn test_request_complete_waits_for_body() {
        let full = post("/query", r#"{"message":"hi"}"#);
        assert!(request_complete(full.as_bytes()));
        assert!(!request_complete(&full.as_bytes()[..full.len() - 3]));
    }
}
