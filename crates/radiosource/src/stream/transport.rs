//! Transport abstraction
//!
//! The connection state machine talks to the network only through
//! `Transport`, so redirects, playlists and retries can be exercised with
//! scripted responses. `HttpTransport` is the reqwest-backed implementation.

use std::io::{self, Read};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use reqwest::blocking::{Client, Response};
use reqwest::redirect::Policy;
use tracing::debug;

use crate::config::network::BODY_CHANNEL_BOUND;
use crate::config::SourceConfig;
use crate::error::{Result, SourceError};

/// One outbound GET
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub url: String,
    /// Resume offset, sent as `Range: bytes=<N>-`
    pub range_start: Option<u64>,
}

impl Request {
    pub fn new(url: &str, range_start: Option<u64>) -> Self {
        Self {
            url: url.to_string(),
            range_start,
        }
    }

    pub fn range_header(&self) -> Option<String> {
        self.range_start.map(|start| format!("bytes={start}-"))
    }
}

/// Status line and headers of a response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    /// Header names are stored lowercase
    pub headers: Vec<(String, String)>,
    pub content_length: Option<u64>,
}

impl ResponseHead {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, 200 | 206)
    }

    pub fn location(&self) -> Option<&str> {
        self.header("location")
    }
}

/// An open response whose body is read incrementally.
///
/// `read` returns `Ok(0)` on graceful close and an error of kind
/// `io::ErrorKind::TimedOut` when no data arrived within the poll timeout.
pub trait Connection: Read + Send {
    fn head(&self) -> &ResponseHead;
}

/// Opens connections
pub trait Transport: Send {
    fn open(&mut self, request: &Request) -> Result<Box<dyn Connection>>;
}

/// True for errors that only mean "nothing arrived within the poll timeout"
pub fn is_timeout(e: &io::Error) -> bool {
    if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) {
        return true;
    }
    e.get_ref()
        .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
        .is_some_and(|re| re.is_timeout())
}

/// reqwest-backed transport. Redirects are not followed automatically so the
/// state machine can count them against its attempt budget.
///
/// The connect timeout bounds the wait for the response head. The body is
/// read by a background thread and handed over through a bounded channel,
/// so a read on the connection waits at most the poll timeout.
pub struct HttpTransport {
    client: Client,
    poll_timeout: Duration,
    read_size: usize,
}

impl HttpTransport {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout())
            // Covers send() and, in the body thread, a single stalled read
            .timeout(config.connect_timeout())
            .redirect(Policy::none())
            .build()?;
        Ok(Self {
            client,
            poll_timeout: config.poll_timeout(),
            read_size: config.read_size.max(1),
        })
    }
}

impl Transport for HttpTransport {
    fn open(&mut self, request: &Request) -> Result<Box<dyn Connection>> {
        let mut builder = self.client.get(&request.url).header("Icy-MetaData", "1");
        if let Some(range) = request.range_header() {
            builder = builder.header("Range", range);
        }
        let response = builder.send()?;
        let head = head_from_response(&response);
        debug!(url = %request.url, status = head.status, "HTTP response");

        let (tx, rx) = bounded(BODY_CHANNEL_BOUND);
        let read_size = self.read_size;
        thread::Builder::new()
            .name("http-body".to_string())
            .spawn(move || read_body(response, tx, read_size))
            .map_err(|e| SourceError::Stream(format!("Failed to spawn body reader: {e}")))?;

        Ok(Box::new(HttpConnection {
            head,
            receiver: rx,
            current_chunk: Vec::new(),
            chunk_pos: 0,
            poll_timeout: self.poll_timeout,
        }))
    }
}

fn head_from_response(response: &Response) -> ResponseHead {
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.trim().to_string()))
        })
        .collect();

    ResponseHead {
        status: response.status().as_u16(),
        headers,
        content_length: response.content_length(),
    }
}

/// Body reader thread. Ends on close, on error, or once the connection is
/// dropped and the next send fails.
fn read_body(mut response: Response, tx: Sender<io::Result<Vec<u8>>>, read_size: usize) {
    let mut chunk_buffer = vec![0u8; read_size];
    loop {
        match response.read(&mut chunk_buffer) {
            Ok(0) => return,
            Ok(n) => {
                if tx.send(Ok(chunk_buffer[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(e) => {
                // Not a poll timeout: the stream stalled or broke
                let _ = tx.send(Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("stream read failed: {e}"),
                )));
                return;
            }
        }
    }
}

struct HttpConnection {
    head: ResponseHead,
    receiver: Receiver<io::Result<Vec<u8>>>,
    current_chunk: Vec<u8>,
    chunk_pos: usize,
    poll_timeout: Duration,
}

impl Read for HttpConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.chunk_pos >= self.current_chunk.len() {
            match self.receiver.recv_timeout(self.poll_timeout) {
                Ok(Ok(chunk)) => {
                    self.current_chunk = chunk;
                    self.chunk_pos = 0;
                }
                Ok(Err(e)) => return Err(e),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "no stream data within poll timeout",
                    ));
                }
                // Reader thread finished: the server closed the stream
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }

        let remaining = &self.current_chunk[self.chunk_pos..];
        let n = buf.len().min(remaining.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.chunk_pos += n;
        Ok(n)
    }
}

impl Connection for HttpConnection {
    fn head(&self) -> &ResponseHead {
        &self.head
    }
}
