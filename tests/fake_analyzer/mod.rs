//! In-process fake of the Rspamd HTTP endpoint.
//!
//! Serves the three endpoints the daemon uses. Messages containing the
//! GTUBE marker are scored 100, everything else 0. Learn calls are
//! counted, and failures can be injected to exercise the error paths.
//! One request per connection keeps the HTTP handling trivial.

use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// Counters and knobs shared with the test body.
#[derive(Default)]
pub struct AnalyzerState {
    pub checks: AtomicU32,
    pub ham_learns: AtomicU32,
    pub spam_learns: AtomicU32,

    /// Respond 500 to this many check requests before succeeding.
    pub fail_checks: AtomicU32,
    /// Respond 500 to this many learn requests before succeeding.
    pub fail_learns: AtomicU32,
    /// Status code for successful learn responses, default 200.
    pub learn_status: AtomicU16,

    /// `password` header values received so far.
    pub passwords: Mutex<Vec<String>>,
}

pub struct FakeAnalyzer {
    url: String,
    state: Arc<AnalyzerState>,
    _handle: tokio::task::JoinHandle<()>,
}

impl FakeAnalyzer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();

        let state = Arc::new(AnalyzerState {
            learn_status: AtomicU16::new(200),
            ..AnalyzerState::default()
        });

        let accept_state = state.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _addr)) = listener.accept().await else {
                    break;
                };
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = handle_request(stream, &state).await;
                });
            }
        });

        Self {
            url: format!("http://127.0.0.1:{port}"),
            state,
            _handle: handle,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> &Arc<AnalyzerState> {
        &self.state
    }
}

async fn handle_request(
    stream: tokio::net::TcpStream,
    state: &AnalyzerState,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();

    // headers until the blank line
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            break;
        }

        if let Some((name, value)) = line.split_once(':') {
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse().unwrap_or(0);
            } else if name.eq_ignore_ascii_case("password") {
                state.passwords.lock().unwrap().push(value.to_string());
            }
        }
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;

    let (status, json) = respond(&path, &body, state);
    let response = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {json}",
        json.len()
    );

    let stream = reader.get_mut();
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

fn respond(path: &str, body: &[u8], state: &AnalyzerState) -> (&'static str, String) {
    match path {
        "/checkv2" => {
            if take_one(&state.fail_checks) {
                return ("500 Internal Server Error", r#"{"error":"injected"}"#.into());
            }

            state.checks.fetch_add(1, Ordering::Relaxed);

            let spam = contains(body, b"GTUBE");
            let json = if spam {
                r#"{"action":"reject","score":100.0,"is_skipped":false,
                    "symbols":{"GTUBE":{"name":"GTUBE","score":100.0}}}"#
            } else {
                r#"{"action":"no action","score":0.0,"is_skipped":false,
                    "symbols":{"R_DKIM_ALLOW":{"name":"R_DKIM_ALLOW","score":-0.2},
                               "ZERO_SCORE":{"name":"ZERO_SCORE","score":0.0}}}"#
            };
            ("200 OK", json.to_string())
        }
        "/learnham" | "/learnspam" => {
            if take_one(&state.fail_learns) {
                return ("500 Internal Server Error", r#"{"error":"injected"}"#.into());
            }

            let counter = if path == "/learnham" {
                &state.ham_learns
            } else {
                &state.spam_learns
            };
            counter.fetch_add(1, Ordering::Relaxed);

            match state.learn_status.load(Ordering::Relaxed) {
                208 => ("208 Already Reported", r#"{"error":"already learned"}"#.into()),
                _ => ("200 OK", r#"{"success":true}"#.into()),
            }
        }
        _ => ("404 Not Found", r#"{"error":"unknown endpoint"}"#.into()),
    }
}

/// Decrement-if-positive on an injected-failure counter.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
        .is_ok()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
