use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) struct MockResponse {
    status: u16,
    body: Vec<u8>,
    content_type: &'static str,
    delay_ms: u64,
}

impl MockResponse {
    pub(crate) fn html(status: u16, body: impl Into<String>) -> Self {
        Self::bytes(status, "text/html; charset=utf-8", body.into().into_bytes())
    }

    /// Raw body bytes sent as-is under `content_type`.
    pub(crate) fn bytes(status: u16, content_type: &'static str, body: Vec<u8>) -> Self {
        Self { status, body, content_type, delay_ms: 0 }
    }

    pub(crate) fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "OK",
    }
}

fn read_request(stream: &mut TcpStream) -> String {
    let mut buffer = [0_u8; 8192];
    let bytes = stream.read(&mut buffer).unwrap_or(0);
    String::from_utf8_lossy(&buffer[..bytes]).to_string()
}

/// Serve `responses` in order, one connection each, and return the base url.
pub(crate) fn spawn_mock_server(responses: Vec<MockResponse>) -> (String, thread::JoinHandle<()>) {
    spawn_mock_server_with(responses, || {})
}

/// Like [`spawn_mock_server`], running `before_reply` after each request is
/// read and before its response is written.
pub(crate) fn spawn_mock_server_with<F>(
    responses: Vec<MockResponse>,
    mut before_reply: F,
) -> (String, thread::JoinHandle<()>)
where
    F: FnMut() + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0")
        .unwrap_or_else(|err| panic!("failed to bind test server: {err}"));
    let addr = listener.local_addr().unwrap_or_else(|err| panic!("failed to read local addr: {err}"));
    let handle = thread::spawn(move || {
        for response in responses {
            let (mut stream, _) =
                listener.accept().unwrap_or_else(|err| panic!("failed to accept connection: {err}"));
            let request = read_request(&mut stream);
            assert!(request.starts_with("GET "), "unexpected request: {request}");

            before_reply();
            if response.delay_ms > 0 {
                thread::sleep(Duration::from_millis(response.delay_ms));
            }

            let head = format!(
                "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                response.status,
                reason_phrase(response.status),
                response.content_type,
                response.body.len(),
            );
            // The client may already have given up on a delayed response.
            let _ = stream.write_all(head.as_bytes()).and_then(|()| stream.write_all(&response.body));
        }
    });
    (format!("http://{addr}"), handle)
}

/// A loopback address with nothing listening on it.
pub(crate) fn unused_local_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .unwrap_or_else(|err| panic!("failed to bind placeholder listener: {err}"));
    listener.local_addr().unwrap_or_else(|err| panic!("failed to read local addr: {err}"))
}
