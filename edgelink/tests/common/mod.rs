//! In-process HTTP fixture shared by the integration tests.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// 1 KiB of deterministic content served under `/kib`.
pub fn kib_content() -> Vec<u8> {
    b"0123456789abcdef".repeat(64)
}

#[derive(Default)]
pub struct ServerState {
    /// Paths in the order requests arrived.
    pub requests: Mutex<Vec<String>>,
    /// Range header value per path, latest wins.
    pub ranges: Mutex<HashMap<String, String>>,
    pub uploads: Mutex<Vec<Vec<u8>>>,
    /// Extra content served at exact paths.
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    gate_open: Mutex<bool>,
    gate_cond: Condvar,
}

impl ServerState {
    pub fn hits(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.as_str() == path)
            .count()
    }

    /// Unblocks every request waiting under `/gated/`.
    pub fn open_gate(&self) {
        *self.gate_open.lock().unwrap() = true;
        self.gate_cond.notify_all();
    }

    pub fn serve_file(&self, path: &str, content: Vec<u8>) {
        self.files.lock().unwrap().insert(path.to_string(), content);
    }
}

pub struct TestServer {
    url: String,
    pub state: Arc<ServerState>,
}

impl TestServer {
    pub fn start() -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fixture server");
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState::default());

        let server_state = state.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let state = server_state.clone();
                std::thread::spawn(move || handle_connection(stream, &state));
            }
        });

        TestServer {
            url: format!("http://{addr}"),
            state,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.url)
    }
}

fn handle_connection(mut stream: TcpStream, state: &ServerState) {
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => raw.extend_from_slice(&buf[..n]),
            Err(_) => return,
        }
    }
    let header_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
        .unwrap();
    let head = String::from_utf8_lossy(&raw[..header_end]).into_owned();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default().to_string();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut content_length = 0usize;
    let mut range = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else { continue };
        match name.to_ascii_lowercase().as_str() {
            "content-length" => content_length = value.trim().parse().unwrap_or(0),
            "range" => range = Some(value.trim().to_string()),
            _ => {}
        }
    }

    let mut body = raw[header_end..].to_vec();
    while body.len() < content_length {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => body.extend_from_slice(&buf[..n]),
            Err(_) => return,
        }
    }

    state.requests.lock().unwrap().push(path.clone());
    if let Some(range) = &range {
        state
            .ranges
            .lock()
            .unwrap()
            .insert(path.clone(), range.clone());
    }

    let served = state.files.lock().unwrap().get(&path).cloned();

    match (method.as_str(), path.as_str()) {
        ("POST", "/upload") => {
            state.uploads.lock().unwrap().push(body);
            respond(&mut stream, "200 OK", b"{}");
        }
        ("GET", _) if served.is_some() => {
            respond_maybe_range(&mut stream, &served.unwrap(), range.as_deref());
        }
        ("GET", "/abc") => respond(&mut stream, "200 OK", b"abc"),
        ("GET", "/kib") => {
            respond_maybe_range(&mut stream, &kib_content(), range.as_deref());
        }
        ("GET", "/flaky") => {
            if state.hits("/flaky") == 1 {
                respond(&mut stream, "500 Internal Server Error", b"later");
            } else {
                respond(&mut stream, "200 OK", b"ok");
            }
        }
        ("GET", path) if path.starts_with("/gated/") => {
            let mut open = state.gate_open.lock().unwrap();
            while !*open {
                let (guard, result) = state
                    .gate_cond
                    .wait_timeout(open, Duration::from_secs(30))
                    .unwrap();
                open = guard;
                if result.timed_out() {
                    break;
                }
            }
            drop(open);
            respond(&mut stream, "200 OK", b"gated");
        }
        _ => respond(&mut stream, "404 Not Found", b"missing"),
    }
}

fn respond(stream: &mut TcpStream, status: &str, content: &[u8]) {
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        content.len()
    );
    _ = stream.write_all(header.as_bytes());
    _ = stream.write_all(content);
}

fn respond_maybe_range(stream: &mut TcpStream, content: &[u8], range: Option<&str>) {
    match range {
        Some(value) => {
            let from = value
                .strip_prefix("bytes=")
                .and_then(|spec| spec.strip_suffix('-'))
                .and_then(|start| start.parse::<usize>().ok())
                .unwrap_or(0);
            let tail = &content[from.min(content.len())..];
            let header = format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                tail.len()
            );
            _ = stream.write_all(header.as_bytes());
            _ = stream.write_all(tail);
        }
        None => respond(stream, "200 OK", content),
    }
}
