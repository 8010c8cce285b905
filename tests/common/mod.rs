#![allow(dead_code)]
//! Shared integration test utilities: logging setup and a threaded HTTP/1.1
//! test origin.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::Duration;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with debug-level output.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .with_target(false)
            .with_ansi(false)
            .try_init();
    });
}

type ResponseMap = HashMap<(String, String), (u16, String)>;

/// Threaded HTTP/1.1 origin used by the end-to-end tests.
///
/// Built-in routes:
/// - `/counter` — body is the 1-based count of requests received on it
/// - `/headers` — body is a JSON object of the received headers
/// - `/query-params` — body echoes the raw query string, `?` included
/// - `/timeout` — delays half a second before responding
/// - `/connection-close` — responds, `Connection: close`, closes
/// - `/quiet-connection-close` — responds with no body framing, closes
/// - `/abrupt-connection-close` — closes without responding
/// - any POST/PUT — echoes `{"verb", "payload", "type"}` as JSON
///
/// Additional static routes are registered with
/// [`add_response`](Self::add_response); everything else is a 404.
pub struct TestServer {
    port: u16,
    counter: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    responses: Arc<Mutex<ResponseMap>>,
    accept_thread: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    /// Binds an ephemeral port and starts accepting.
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let port = listener.local_addr().expect("local addr").port();
        let counter = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicBool::new(true));
        let responses: Arc<Mutex<ResponseMap>> = Arc::new(Mutex::new(HashMap::new()));

        let accept_thread = {
            let counter = Arc::clone(&counter);
            let running = Arc::clone(&running);
            let responses = Arc::clone(&responses);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    let Ok(stream) = stream else { break };
                    let counter = Arc::clone(&counter);
                    let responses = Arc::clone(&responses);
                    thread::spawn(move || handle_connection(stream, &counter, &responses));
                }
            })
        };

        Self {
            port,
            counter,
            running,
            responses,
            accept_thread: Some(accept_thread),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Registers a static `(method, path) -> (status, body)` response.
    pub fn add_response(&self, method: &str, path: &str, status: u16, body: &str) {
        self.responses
            .lock()
            .expect("responses lock")
            .insert((method.to_owned(), path.to_owned()), (status, body.to_owned()));
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // Unblock the accept loop.
        let _ = TcpStream::connect(("127.0.0.1", self.port));
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

struct ParsedRequest {
    method: String,
    path: String,
    query: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

fn handle_connection(
    mut stream: TcpStream,
    counter: &AtomicUsize,
    responses: &Mutex<ResponseMap>,
) {
    loop {
        let Some(request) = read_request(&mut stream) else {
            return;
        };

        let mapped = responses
            .lock()
            .expect("responses lock")
            .get(&(request.method.clone(), request.path.clone()))
            .cloned();
        if let Some((status, body)) = mapped {
            if write_response(&mut stream, status, &body, "text/plain", false).is_err() {
                return;
            }
            continue;
        }

        match request.path.as_str() {
            "/counter" => {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if write_response(&mut stream, 200, &n.to_string(), "text/plain", false).is_err()
                {
                    return;
                }
            }
            "/headers" => {
                let mut echoed = serde_json::Map::new();
                for (name, value) in &request.headers {
                    echoed.insert(
                        name.to_ascii_lowercase(),
                        serde_json::Value::String(value.clone()),
                    );
                }
                let body = serde_json::Value::Object(echoed).to_string();
                if write_response(&mut stream, 200, &body, "application/json", false).is_err() {
                    return;
                }
            }
            "/query-params" => {
                let body = if request.query.is_empty() {
                    String::new()
                } else {
                    format!("?{}", request.query)
                };
                if write_response(&mut stream, 200, &body, "text/plain", false).is_err() {
                    return;
                }
            }
            "/timeout" => {
                thread::sleep(Duration::from_millis(500));
                // The client has usually given up; delivery errors are fine.
                let _ = write_response(&mut stream, 200, "done", "text/plain", false);
            }
            "/connection-close" => {
                let _ = write_response(&mut stream, 200, "bye", "text/plain", true);
                return;
            }
            "/quiet-connection-close" => {
                // No Content-Length, no Connection header: EOF-framed body.
                let _ = stream.write_all(b"HTTP/1.1 200 OK\r\n\r\nbye");
                return;
            }
            "/abrupt-connection-close" => {
                return;
            }
            _ if request.method == "POST" || request.method == "PUT" => {
                let content_type = request
                    .headers
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
                    .map(|(_, value)| value.clone())
                    .unwrap_or_default();
                let body = serde_json::json!({
                    "verb": request.method,
                    "payload": String::from_utf8_lossy(&request.body),
                    "type": content_type,
                })
                .to_string();
                if write_response(&mut stream, 200, &body, "application/json", false).is_err() {
                    return;
                }
            }
            _ => {
                if write_response(&mut stream, 404, "", "text/plain", false).is_err() {
                    return;
                }
            }
        }
    }
}

/// Reads and parses one request; `None` on EOF or a malformed head.
fn read_request(stream: &mut TcpStream) -> Option<ParsedRequest> {
    let mut buf = Vec::new();
    let mut scratch = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut scratch).ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&scratch[..n]);
    };

    let head = std::str::from_utf8(&buf[..head_end]).ok()?;
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split(' ');
    let method = parts.next()?.to_owned();
    let target = parts.next()?.to_owned();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim().to_owned(), value.trim().to_owned()));
    }

    let content_length: usize = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse().ok())
        .unwrap_or(0);

    let mut body = buf[head_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut scratch).ok()?;
        if n == 0 {
            return None;
        }
        body.extend_from_slice(&scratch[..n]);
    }
    body.truncate(content_length);

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_owned(), query.to_owned()),
        None => (target, String::new()),
    };

    Some(ParsedRequest {
        method,
        path,
        query,
        headers,
        body,
    })
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    body: &str,
    content_type: &str,
    close: bool,
) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        204 => "No Content",
        404 => "Not Found",
        _ => "",
    };
    let mut head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n",
        body.len()
    );
    if close {
        head.push_str("Connection: close\r\n");
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes())?;
    stream.write_all(body.as_bytes())
}
