// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use nix::sys::signal;
use nix::unistd::Pid;
use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Minimal scripted HTTP server standing in for the orchestration server.
///
/// Responses are keyed by "METHOD /path" (query string ignored). Each key
/// holds a queue of bodies; queued bodies are served in order and the last
/// one sticks, so "STARTING, STARTING, RUNNING" keeps answering RUNNING.
/// Unknown paths get a 404. Every request line is recorded for assertions.
pub struct StubServer {
    addr: std::net::SocketAddr,
    responses: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
    requests: Arc<Mutex<Vec<String>>>,
    shutdown: Arc<AtomicBool>,
}

impl StubServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind stub server");
        let addr = listener.local_addr().expect("failed to read local addr");
        listener
            .set_nonblocking(true)
            .expect("failed to set nonblocking");

        let responses: Arc<Mutex<HashMap<String, VecDeque<String>>>> = Arc::default();
        let requests: Arc<Mutex<Vec<String>>> = Arc::default();
        let shutdown = Arc::new(AtomicBool::new(false));

        let (resp, reqs, stop) = (
            Arc::clone(&responses),
            Arc::clone(&requests),
            Arc::clone(&shutdown),
        );
        std::thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        if let Err(e) = handle_connection(stream, &resp, &reqs) {
                            eprintln!("[stub] connection error: {e}");
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(e) => {
                        eprintln!("[stub] accept error: {e}");
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            responses,
            requests,
            shutdown,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Queue a response body for "METHOD /path". Repeated calls build up the
    /// script; the final body is served forever.
    pub fn respond(&self, method_path: &str, body: &str) {
        self.responses
            .lock()
            .unwrap()
            .entry(method_path.to_string())
            .or_default()
            .push_back(body.to_string());
    }

    /// Request lines seen so far, as "METHOD /path?query".
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count_requests(&self, prefix: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.starts_with(prefix))
            .count()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

fn handle_connection(
    stream: TcpStream,
    responses: &Mutex<HashMap<String, VecDeque<String>>>,
    requests: &Mutex<Vec<String>>,
) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut reader = BufReader::new(stream.try_clone()?);

    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let target = parts.next().unwrap_or("").to_string();
    requests.lock().unwrap().push(format!("{method} {target}"));

    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some(value) = line
            .to_ascii_lowercase()
            .strip_prefix("content-length:")
            .map(str::trim)
        {
            content_length = value.parse().unwrap_or(0);
        }
    }
    if content_length > 0 {
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body)?;
    }

    let path = target.split('?').next().unwrap_or("").to_string();
    let key = format!("{method} {path}");
    let body = {
        let mut responses = responses.lock().unwrap();
        match responses.get_mut(&key) {
            Some(queue) if !queue.is_empty() => {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                }
            }
            _ => None,
        }
    };

    let mut stream = reader.into_inner();
    match body {
        Some(body) => write!(
            stream,
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )?,
        None => write!(
            stream,
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        )?,
    }
    stream.flush()
}

/// Check if a PID is still alive.
pub fn pid_is_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Wait until a PID is no longer alive, or timeout.
pub fn wait_for_pid_gone(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !pid_is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
