use super::HttpHandler;
use crate::server::{HttpRequest, HttpResponse};
use serde_json::json;
use std::io::Read;
use tracing::debug;

/// Diagnostic handler: echoes the parsed request back as JSON
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl HttpHandler for EchoHandler {
    fn process(&self, request: &mut HttpRequest, response: &mut HttpResponse<'_>) {
        let mut body = Vec::new();
        if let Some(source) = request.body_mut() {
            // A short read only truncates the echo
            let _ = source.read_to_end(&mut body);
        }
        let ctx = &request.context;
        let headers: serde_json::Map<String, serde_json::Value> = ctx
            .headers
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect();

        let payload = json!({
            "method": ctx.method.as_ref().map(|m| m.as_str()),
            "path": ctx.path,
            "query": ctx.query,
            "script_name": ctx.script_name,
            "path_info": ctx.path_info,
            "remote_addr": ctx.remote_addr.map(|a| a.to_string()),
            "headers": headers,
            "body": String::from_utf8_lossy(&body),
            "pid": std::process::id(),
        });

        response
            .start(200)
            .header("Content-Type", "application/json")
            .write_body(payload.to_string().as_bytes());
        if let Err(e) = response.finished() {
            debug!(error = %e, "Echo response not delivered");
        }
    }

    fn name(&self) -> &str {
        "echo"
    }
}
