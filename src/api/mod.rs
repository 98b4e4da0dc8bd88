use crate::service::{ActionResponse, ParkingService, SetupError, SetupRequest};
use crate::stream::{serve_stream, StreamKind, MULTIPART_CONTENT_TYPE};
use crate::task::StopSignal;
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 64 * 1024;
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const STREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: StopSignal,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting, end every open stream and join the accept loop.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.stop();
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    service: Arc<ParkingService>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, service: Arc<ParkingService>) -> Self {
        Self { cfg, service }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = StopSignal::new();
        let shutdown_thread = shutdown.clone();
        let service = self.service;
        let join = std::thread::Builder::new()
            .name("api-accept".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, service, shutdown_thread) {
                    log::error!("parking api stopped: {}", err);
                }
            })?;
        log::info!("parking api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, service: Arc<ParkingService>, shutdown: StopSignal) -> Result<()> {
    loop {
        if shutdown.is_stopped() {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let service = service.clone();
                let shutdown = shutdown.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("api-conn-{}", peer))
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &service, &shutdown) {
                            log::warn!("parking api request from {} failed: {:#}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("could not spawn connection thread for {}: {}", peer, err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                if shutdown.wait_timeout(ACCEPT_POLL) {
                    break;
                }
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    service: &ParkingService,
    shutdown: &StopSignal,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_json(&mut stream, 400, &ActionResponse::failed(err.to_string()))?;
            return Err(err);
        }
    };
    log::debug!("{} {}", request.method, request.path);

    let route = Route::parse(&request.path);
    if route == Route::NotFound {
        write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#)?;
        return Ok(());
    }
    if request.method != route.method() {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }

    match route {
        Route::Health => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        Route::Setup => {
            let setup: SetupRequest = match serde_json::from_slice(&request.body) {
                Ok(setup) => setup,
                Err(err) => {
                    let reply = ActionResponse::failed(format!("invalid setup body: {}", err));
                    return write_json(&mut stream, 400, &reply);
                }
            };
            match service.setup(&setup) {
                Ok(summary) => write_json(
                    &mut stream,
                    200,
                    &ActionResponse::ok(format!(
                        "{} spots configured on {}",
                        summary.spots, summary.source
                    )),
                ),
                Err(err) => {
                    log::warn!("{}", err);
                    let status = match err {
                        SetupError::Invalid(_) => 400,
                        SetupError::Start(_) => 500,
                    };
                    write_json(&mut stream, status, &ActionResponse::failed(err.to_string()))
                }
            }
        }
        Route::Reserve(spot_id) => write_json(&mut stream, 200, &service.reserve(&spot_id)),
        Route::Status => write_json(&mut stream, 200, &service.status()),
        Route::Stream(kind) => {
            stream.set_write_timeout(Some(STREAM_WRITE_TIMEOUT))?;
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
                MULTIPART_CONTENT_TYPE
            );
            stream.write_all(header.as_bytes())?;
            let parts = serve_stream(&mut stream, kind, &service.stream_context(), shutdown)?;
            log::debug!("{} stream closed after {} parts", kind.as_str(), parts);
            Ok(())
        }
        Route::NotFound => Ok(()),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Route {
    Health,
    Setup,
    Reserve(String),
    Status,
    Stream(StreamKind),
    NotFound,
}

impl Route {
    fn parse(path: &str) -> Self {
        match path {
            "/health" => Self::Health,
            "/setup" | "/set_parking_data" => Self::Setup,
            "/parking_status" => Self::Status,
            "/video_feed" => Self::Stream(StreamKind::Status),
            "/inspection_feed" | "/yolo_feed" => Self::Stream(StreamKind::Inspection),
            _ => match path.strip_prefix("/reserve/") {
                Some(id) if !id.is_empty() && !id.contains('/') => Self::Reserve(id.to_string()),
                _ => Self::NotFound,
            },
        }
    }

    fn method(&self) -> &'static str {
        match self {
            Self::Setup | Self::Reserve(_) => "POST",
            _ => "GET",
        }
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before request headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };
    let text = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length '{}'", value))?,
        None => 0,
    };
    let total = header_end
        .checked_add(4)
        .and_then(|n| n.checked_add(content_length));
    if total.map_or(true, |n| n > MAX_REQUEST_BYTES) {
        return Err(anyhow!("request too large"));
    }
    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed mid-body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        body,
    })
}

fn write_json<T: Serialize>(stream: &mut TcpStream, status: u16, body: &T) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}
