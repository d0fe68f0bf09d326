//! HTTP server for the MJPEG stream and the stats endpoint.
//!
//! Uses `tiny_http`, which works on both host and ESP32 (via std::net).
//! The accept loop runs in its own thread; every `/stream` client gets a
//! thread of its own, bounded by `max_clients`.
//!
//! # Example `/stats` response
//!
//! ```json
//! {
//!   "wifi": "connected",
//!   "pipeline": {
//!     "uptime_secs": 3600,
//!     "frames_captured": 36000,
//!     "capture_failures": 2,
//!     "transcode_failures": 0,
//!     "frames_written": 35990,
//!     "write_failures": 0,
//!     "frames_streamed": 1200,
//!     "stream_clients": 1
//!   }
//! }
//! ```

use crate::camera::{FrameFeed, PipelineStats, StreamResponder, STREAM_CONTENT_TYPE};
use crate::wifi::ConnectivityHandle;
use log::{error, info, warn};
use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tiny_http::{Header, Method, Request, Response, Server};
use tokio_util::sync::CancellationToken;

/// Path of the MJPEG stream.
pub const DEFAULT_STREAM_PATH: &str = "/stream";

/// Path of the JSON stats.
pub const DEFAULT_STATS_PATH: &str = "/stats";

/// Stack for client threads; the stream loop itself needs little.
const CLIENT_STACK_SIZE: usize = 8 * 1024;

const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Headers built once at startup.
struct StaticHeaders {
    json: Header,
    location: Header,
    allow_get: Header,
}

impl StaticHeaders {
    fn new() -> io::Result<Self> {
        let header = |name: &str, value: &str| {
            Header::from_bytes(name.as_bytes(), value.as_bytes()).map_err(|()| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("bad header {}", name))
            })
        };
        Ok(Self {
            json: header("Content-Type", "application/json")?,
            location: header("Location", DEFAULT_STREAM_PATH)?,
            allow_get: header("Allow", "GET")?,
        })
    }
}

/// Everything a request handler needs.
struct ServerContext<F> {
    feed: F,
    responder: StreamResponder,
    stats: Arc<PipelineStats>,
    connectivity: Option<ConnectivityHandle>,
    max_clients: usize,
    headers: StaticHeaders,
}

/// HTTP stream server.
///
/// Drop it to stop the server and every open stream.
pub struct StreamServer {
    handle: Option<thread::JoinHandle<()>>,
    shutdown: CancellationToken,
    local_addr: Option<SocketAddr>,
}

impl StreamServer {
    /// Start serving.
    ///
    /// `feed` is cloned once per stream client. `connectivity`, when given,
    /// adds the WiFi state to `/stats`.
    pub fn start<F>(
        bind_addr: Option<IpAddr>,
        port: u16,
        feed: F,
        stats: Arc<PipelineStats>,
        connectivity: Option<ConnectivityHandle>,
        max_clients: usize,
    ) -> io::Result<Self>
    where
        F: FrameFeed + Clone + 'static,
    {
        let addr = match bind_addr {
            Some(ip) => format!("{}:{}", ip, port),
            None => format!("0.0.0.0:{}", port),
        };

        let server = Server::http(&addr)
            .map_err(|e| io::Error::new(io::ErrorKind::AddrInUse, format!("{}", e)))?;
        let local_addr = server.server_addr().to_ip();

        info!("Stream server listening on http://{}{}", addr, DEFAULT_STREAM_PATH);

        let context = ServerContext {
            feed,
            responder: StreamResponder::new(stats.clone()),
            stats,
            connectivity,
            max_clients,
            headers: StaticHeaders::new()?,
        };
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = thread::Builder::new()
            .name("http".to_string())
            .spawn(move || Self::run_server(server, context, token))?;

        Ok(Self {
            handle: Some(handle),
            shutdown,
            local_addr,
        })
    }

    /// Address actually bound, useful when started on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn run_server<F>(server: Server, context: ServerContext<F>, shutdown: CancellationToken)
    where
        F: FrameFeed + Clone + 'static,
    {
        let mut clients: Vec<thread::JoinHandle<()>> = Vec::new();

        while !shutdown.is_cancelled() {
            clients.retain(|client| !client.is_finished());

            match server.recv_timeout(ACCEPT_POLL) {
                Ok(Some(request)) => {
                    if let Some(client) = Self::handle_request(request, &context, &shutdown) {
                        clients.push(client);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Server error: {}", e);
                    break;
                }
            }
        }

        // Clients watch the same token
        shutdown.cancel();
        for client in clients {
            let _ = client.join();
        }
        info!("Stream server shut down");
    }

    fn handle_request<F>(
        request: Request,
        context: &ServerContext<F>,
        shutdown: &CancellationToken,
    ) -> Option<thread::JoinHandle<()>>
    where
        F: FrameFeed + Clone + 'static,
    {
        if request.method() != &Method::Get {
            let response = Response::from_string("Method Not Allowed")
                .with_status_code(405)
                .with_header(context.headers.allow_get.clone());
            let _ = request.respond(response);
            return None;
        }

        let path = request.url().split('?').next().unwrap_or("").to_string();
        match path.as_str() {
            DEFAULT_STREAM_PATH => Self::start_stream(request, context, shutdown),
            DEFAULT_STATS_PATH | "/stats/" => {
                let body = Self::stats_json(context);
                let response = Response::from_string(body)
                    .with_header(context.headers.json.clone())
                    .with_status_code(200);
                if let Err(e) = request.respond(response) {
                    warn!("Failed to send stats: {}", e);
                }
                None
            }
            "/" => {
                let response = Response::from_string("See /stream")
                    .with_status_code(302)
                    .with_header(context.headers.location.clone());
                if let Err(e) = request.respond(response) {
                    warn!("Failed to send redirect: {}", e);
                }
                None
            }
            _ => {
                let response = Response::from_string("Not Found").with_status_code(404);
                if let Err(e) = request.respond(response) {
                    warn!("Failed to send 404: {}", e);
                }
                None
            }
        }
    }

    fn stats_json<F>(context: &ServerContext<F>) -> String {
        let wifi = context
            .connectivity
            .as_ref()
            .map(|handle| handle.state().as_str());
        serde_json::json!({
            "wifi": wifi,
            "pipeline": context.stats.snapshot(),
        })
        .to_string()
    }

    fn start_stream<F>(
        request: Request,
        context: &ServerContext<F>,
        shutdown: &CancellationToken,
    ) -> Option<thread::JoinHandle<()>>
    where
        F: FrameFeed + Clone + 'static,
    {
        let Some(slot) = ClientSlot::claim(&context.stats, context.max_clients) else {
            warn!("Stream client rejected, {} already connected", context.max_clients);
            let _ = request.respond(Response::from_string("Busy").with_status_code(503));
            return None;
        };

        let remote = request.remote_addr().copied();
        let mut feed = context.feed.clone();
        let responder = context.responder.clone();
        let cancel = shutdown.clone();

        let spawned = thread::Builder::new()
            .name("stream".to_string())
            .stack_size(CLIENT_STACK_SIZE)
            .spawn(move || {
                let _slot = slot;
                let mut out = request.into_writer();
                // The leading CRLF of the first boundary ends the header block
                let header = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nAccess-Control-Allow-Origin: *\r\nCache-Control: no-cache\r\nConnection: close\r\n",
                    STREAM_CONTENT_TYPE
                );
                if let Err(e) = out.write_all(header.as_bytes()) {
                    warn!("Stream client {:?} gone before headers: {}", remote, e);
                    return;
                }
                match responder.serve(&mut feed, &mut out, &cancel) {
                    Ok(frames) => info!("Stream to {:?} closed after {} frames", remote, frames),
                    Err(e) => info!("Stream to {:?} ended: {}", remote, e),
                }
            });

        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                // Dropping the request answers it with a 500
                error!("Could not start stream thread: {}", e);
                None
            }
        }
    }

    /// Stop the server and wait for open streams to end.
    pub fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One counted stream client; gives its place back on drop.
struct ClientSlot {
    stats: Arc<PipelineStats>,
}

impl ClientSlot {
    fn claim(stats: &Arc<PipelineStats>, max_clients: usize) -> Option<Self> {
        stats
            .stream_clients
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max_clients).then_some(n + 1)
            })
            .ok()
            .map(|_| Self {
                stats: stats.clone(),
            })
    }
}

impl Drop for ClientSlot {
    fn drop(&mut self) {
        self.stats.stream_clients.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{
        Encoding, FrameSlot, OwnedFrame, PreparedFrame, SlotFeed, BOUNDARY,
    };
    use std::io::{BufRead, BufReader, Read};
    use std::net::TcpStream;

    fn server(max_clients: usize) -> (StreamServer, Arc<FrameSlot<OwnedFrame>>, Arc<PipelineStats>) {
        let slot = Arc::new(FrameSlot::new());
        let stats = Arc::new(PipelineStats::new());
        let feed = SlotFeed::new(slot.clone()).with_wait(Duration::from_millis(20));
        let server = StreamServer::start(
            Some("127.0.0.1".parse().unwrap()),
            0,
            feed,
            stats.clone(),
            None,
            max_clients,
        )
        .unwrap();
        (server, slot, stats)
    }

    fn get(addr: SocketAddr, path: &str) -> TcpStream {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        write!(stream, "GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).unwrap();
        stream
    }

    fn status_line(stream: TcpStream) -> String {
        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line).unwrap();
        line
    }

    #[test]
    fn test_stats_endpoint() {
        let (server, _slot, stats) = server(2);
        PipelineStats::record(&stats.frames_captured);
        let addr = server.local_addr().unwrap();

        let mut stream = get(addr, "/stats");
        let mut response = String::new();
        // tiny_http keeps the connection open; read what arrives
        let mut buf = [0u8; 1024];
        while !response.contains("frames_captured") {
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0);
            response.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("\"frames_captured\":1"));
    }

    #[test]
    fn test_unknown_path_is_404() {
        let (server, _slot, _stats) = server(2);
        let line = status_line(get(server.local_addr().unwrap(), "/nope"));
        assert!(line.starts_with("HTTP/1.1 404"));
    }

    #[test]
    fn test_client_limit() {
        let (server, _slot, _stats) = server(0);
        let line = status_line(get(server.local_addr().unwrap(), "/stream"));
        assert!(line.starts_with("HTTP/1.1 503"));
    }

    #[test]
    fn test_stream_delivers_frame() {
        let (mut server, slot, stats) = server(2);
        slot.lock().install(PreparedFrame::Captured(OwnedFrame::new(
            b"JPEG".to_vec(),
            Encoding::Jpeg,
        )));

        let mut reader = BufReader::new(get(server.local_addr().unwrap(), "/stream"));
        let mut seen = String::new();
        while !seen.contains("JPEG") {
            let mut line = String::new();
            assert!(reader.read_line(&mut line).unwrap() > 0);
            seen.push_str(&line);
        }
        assert!(seen.starts_with("HTTP/1.1 200 OK"));
        assert!(seen.contains(BOUNDARY));
        assert!(seen.contains("Content-Length: 4"));

        server.stop();
        assert_eq!(stats.snapshot().stream_clients, 0);
    }
}
