//! Single-shot loopback listener receiving the OAuth redirect.
//!
//! The listener binds `127.0.0.1`, walking forward from the configured port while ports are
//! taken. It lives until [`CallbackListener::wait_for_code`] returns; dropping it closes the
//! socket on every path, including errors during the code exchange that follows.

use crate::error::{Result, TallyError};
use reqwest::Url;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

const SUCCESS_HTML: &str =
    "<html><body><h1>Authorization complete</h1><p>You may close this window.</p></body></html>";
const DENIED_HTML: &str =
    "<html><body><h1>Authorization failed</h1><p>You may close this window and retry.</p></body></html>";
const REJECTED_HTML: &str = "<html><body><h1>Invalid authorization response</h1></body></html>";
const NOT_FOUND_HTML: &str = "<html><body><h1>Not found</h1></body></html>";

/// Upper bound for reading one request from a connected browser.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REQUEST_BYTES: usize = 8192;

/// Bound callback listener for one authorization attempt.
#[derive(Debug)]
pub struct CallbackListener {
    listener: TcpListener,
    port: u16,
    redirect_uri: String,
    path: String,
}

/// What a single callback request amounted to.
#[derive(Debug, PartialEq, Eq)]
enum CallbackOutcome {
    Code(String),
    Denied(String),
    /// Wrong path, wrong state, missing code: answer and keep listening.
    Ignored,
}

impl CallbackListener {
    /// Binds the first free port in `start_port..start_port + attempts`.
    ///
    /// # Errors
    /// * `CallbackPortExhausted` - every port in the range is in use
    /// * `Io` - binding failed for a reason other than the port being taken
    pub async fn bind(host: &str, start_port: u16, attempts: u16, path: &str) -> Result<Self> {
        let attempts = attempts.max(1);
        let last = start_port.saturating_add(attempts - 1);

        for port in start_port..=last {
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => {
                    let port = listener.local_addr()?.port();
                    let redirect_uri = format!("http://{}:{}{}", host, port, path);
                    info!(port, "OAuth callback listener bound");
                    return Ok(Self {
                        listener,
                        port,
                        redirect_uri,
                        path: path.to_string(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AddrInUse => {
                    warn!(port, "OAuth callback port in use, trying next port");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(TallyError::CallbackPortExhausted {
            first: start_port,
            last,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Redirect URI to register with the authorization request.
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Waits, without a deadline, for the redirect carrying `expected_state`.
    ///
    /// Consumes the listener; the socket is closed when this returns.
    ///
    /// # Errors
    /// * `AuthorizationExchange` - the user denied access (`error=` in the redirect)
    pub async fn wait_for_code(self, expected_state: &str) -> Result<String> {
        loop {
            let (socket, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    debug!(error = %e, "OAuth callback accept failed");
                    continue;
                }
            };
            debug!(%peer, "OAuth callback connection");

            match self.handle_connection(socket, expected_state).await {
                CallbackOutcome::Code(code) => return Ok(code),
                CallbackOutcome::Denied(reason) => {
                    return Err(TallyError::AuthorizationExchange(format!(
                        "authorization denied ({})",
                        reason
                    )));
                }
                CallbackOutcome::Ignored => continue,
            }
        }
    }

    async fn handle_connection(&self, mut socket: TcpStream, expected_state: &str) -> CallbackOutcome {
        let target = match read_request_target(&mut socket).await {
            Some(target) => target,
            None => {
                respond(&mut socket, "400 Bad Request", REJECTED_HTML).await;
                return CallbackOutcome::Ignored;
            }
        };

        let (status, body, outcome) = self.evaluate(&target, expected_state);
        respond(&mut socket, status, body).await;
        outcome
    }

    fn evaluate(
        &self,
        target: &str,
        expected_state: &str,
    ) -> (&'static str, &'static str, CallbackOutcome) {
        let Ok(url) = Url::parse(&format!("http://127.0.0.1{}", target)) else {
            return ("400 Bad Request", REJECTED_HTML, CallbackOutcome::Ignored);
        };

        if url.path() != self.path {
            debug!(path = url.path(), "Ignoring request to unexpected callback path");
            return ("404 Not Found", NOT_FOUND_HTML, CallbackOutcome::Ignored);
        }

        let mut code = None;
        let mut state = None;
        let mut error = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                "error" => error = Some(value.into_owned()),
                _ => {}
            }
        }

        if state.as_deref() != Some(expected_state) {
            warn!("OAuth callback state mismatch, ignoring request");
            return ("400 Bad Request", REJECTED_HTML, CallbackOutcome::Ignored);
        }

        if let Some(error) = error {
            warn!(error = %error, "Authorization denied by user or provider");
            return ("400 Bad Request", DENIED_HTML, CallbackOutcome::Denied(error));
        }

        match code.filter(|c| !c.is_empty()) {
            Some(code) => ("200 OK", SUCCESS_HTML, CallbackOutcome::Code(code)),
            None => ("400 Bad Request", REJECTED_HTML, CallbackOutcome::Ignored),
        }
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        debug!(port = self.port, "OAuth callback listener closed");
    }
}

/// Reads the request head and returns the target of a `GET` request line.
async fn read_request_target(socket: &mut TcpStream) -> Option<String> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let read_head = async {
        loop {
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..n]);
            if buffer.windows(4).any(|w| w == b"\r\n\r\n") || buffer.len() >= MAX_REQUEST_BYTES {
                break;
            }
        }
        Some(())
    };
    tokio::time::timeout(REQUEST_READ_TIMEOUT, read_head).await.ok()??;

    let request = String::from_utf8_lossy(&buffer);
    let mut parts = request.lines().next()?.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    (method == "GET" && target.starts_with('/')).then(|| target.to_string())
}

async fn respond(socket: &mut TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}
