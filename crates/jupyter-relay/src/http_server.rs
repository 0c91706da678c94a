//! Administrative HTTP server.
//!
//! Endpoints:
//! - `PUT /api/connect`: point the relay at a runtime and notebook (`RoomRuntime` body)
//! - `DELETE /api/stop`: stop the kernel and leave the notebook
//! - `GET /api/healthz`: relay and connection status
//! - `POST /api/tools/{name}`: run a notebook tool with a JSON argument object
//!
//! Responses are JSON. Argument and index errors map to 400, execution
//! timeouts to 504, and everything else to 500.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{error, info, warn};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::RoomRuntime;
use crate::error::RelayError;
use crate::relay::Relay;
use crate::tools::ToolCall;

/// Bind `addr` and serve the admin API in the background.
///
/// Returns the bound address and the accept loop's task.
pub async fn start_http_server(
    relay: Arc<Relay>,
    addr: SocketAddr,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    info!("[relay-http] Listening on http://{}", local_addr);

    let task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let relay = relay.clone();
                    let io = TokioIo::new(stream);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| handle_request(req, relay.clone()));
                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            if !e.is_incomplete_message() && !e.is_canceled() {
                                error!("[relay-http] Connection error: {}", e);
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("[relay-http] Accept error: {}", e);
                }
            }
        }
    });

    Ok((local_addr, task))
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    relay: Arc<Relay>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/api/healthz") => json_response(StatusCode::OK, json!(relay.health().await)),
        (&Method::PUT, "/api/connect") => connect(req, &relay).await,
        (&Method::DELETE, "/api/stop") => {
            relay.stop().await;
            json_response(StatusCode::OK, json!({ "success": true }))
        }
        (_, "/api/healthz" | "/api/connect" | "/api/stop") => method_not_allowed(),
        (&Method::POST, _) if path.starts_with("/api/tools/") => {
            let name = path.trim_start_matches("/api/tools/").to_string();
            run_tool(req, &relay, &name).await
        }
        (_, _) if path.starts_with("/api/tools/") => method_not_allowed(),
        _ => json_response(
            StatusCode::NOT_FOUND,
            json!({ "success": false, "error": "Not Found" }),
        ),
    };

    Ok(response)
}

async fn connect(req: Request<hyper::body::Incoming>, relay: &Relay) -> Response<Full<Bytes>> {
    let body = match read_json(req).await {
        Ok(body) => body,
        Err(e) => return error_response(&e),
    };
    let target: RoomRuntime = match serde_json::from_value(body) {
        Ok(target) => target,
        Err(e) => {
            return error_response(&RelayError::InvalidArgument(format!(
                "invalid connect payload: {}",
                e
            )))
        }
    };

    match relay.connect(target).await {
        Ok(()) => json_response(StatusCode::OK, json!({ "success": true })),
        Err(e) => {
            error!("[relay-http] Failed to connect: {}", e);
            error_response(&e)
        }
    }
}

async fn run_tool(
    req: Request<hyper::body::Incoming>,
    relay: &Relay,
    name: &str,
) -> Response<Full<Bytes>> {
    let result = async {
        let args = read_json(req).await?;
        let call = ToolCall::parse(name, args)?;
        relay.tools().call(call).await
    }
    .await;

    match result {
        Ok(value) => json_response(StatusCode::OK, json!({ "success": true, "result": value })),
        Err(e) => {
            warn!("[relay-http] Tool {} failed: {}", name, e);
            error_response(&e)
        }
    }
}

/// Read the request body as JSON. An empty body reads as `null`.
async fn read_json(req: Request<hyper::body::Incoming>) -> Result<Value, RelayError> {
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|e| RelayError::InvalidArgument(format!("failed to read request body: {}", e)))?
        .to_bytes();
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| RelayError::InvalidArgument(format!("request body is not JSON: {}", e)))
}

fn status_for(err: &RelayError) -> StatusCode {
    if err.is_domain() {
        StatusCode::BAD_REQUEST
    } else if err.is_timeout() {
        StatusCode::GATEWAY_TIMEOUT
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn error_response(err: &RelayError) -> Response<Full<Bytes>> {
    json_response(
        status_for(err),
        json!({ "success": false, "error": err.to_string() }),
    )
}

fn method_not_allowed() -> Response<Full<Bytes>> {
    json_response(
        StatusCode::METHOD_NOT_ALLOWED,
        json!({ "success": false, "error": "Method Not Allowed" }),
    )
}

fn json_response(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("response builder should not fail")
}
