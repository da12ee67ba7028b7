//! End-to-end tests of the reqwest transport and the source worker against a
//! local HTTP server.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use radiosource::config::SourceConfig;
use radiosource::stream::{
    HttpSource, HttpTransport, IcyHeaders, Pull, Request, SourceEvent, Transport,
};

/// What the server sends for one request
struct Reply {
    head: String,
    body: Vec<u8>,
    /// Keep the socket open after the body instead of closing it
    hold_open: bool,
}

impl Reply {
    fn new(status: &str, headers: &[(&str, &str)], body: Vec<u8>) -> Self {
        let mut head = format!("HTTP/1.1 {status}\r\nConnection: close\r\n");
        for (name, value) in headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str("\r\n");
        Self {
            head,
            body,
            hold_open: false,
        }
    }

    fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

type Handler = dyn Fn(usize, &str) -> Reply + Send + Sync;

/// Minimal HTTP server: one thread per connection, records lowercased requests
struct TestServer {
    port: u16,
    requests: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    fn start(handler: impl Fn(usize, &str) -> Reply + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let recorded = requests.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let handler = handler.clone();
                let recorded = recorded.clone();
                thread::spawn(move || serve(stream, handler, recorded));
            }
        });

        Self { port, requests }
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

fn serve(mut stream: TcpStream, handler: Arc<Handler>, recorded: Arc<Mutex<Vec<String>>>) {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => raw.push(byte[0]),
            _ => return,
        }
    }
    let request = String::from_utf8_lossy(&raw).to_ascii_lowercase();
    let index = {
        let mut all = recorded.lock().unwrap();
        all.push(request.clone());
        all.len() - 1
    };

    let reply = handler(index, &request);
    let _ = stream.write_all(reply.head.as_bytes());
    let _ = stream.write_all(&reply.body);
    let _ = stream.flush();
    if reply.hold_open {
        thread::sleep(Duration::from_secs(5));
    }
}

fn path_of(request: &str) -> &str {
    request.split_whitespace().nth(1).unwrap_or("/")
}

fn test_config() -> SourceConfig {
    SourceConfig {
        buffer_capacity: 4096,
        prefill_amount: Some(16),
        poll_timeout_ms: 200,
        connect_timeout_secs: 2,
        read_size: 256,
        ..Default::default()
    }
}

fn icy_block(text: &str) -> Vec<u8> {
    let mut body = text.as_bytes().to_vec();
    let units = body.len().div_ceil(16);
    body.resize(units * 16, 0);
    let mut out = vec![units as u8];
    out.extend(body);
    out
}

fn bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

fn pull_bytes(source: &HttpSource, want: usize) -> Vec<u8> {
    let end = Instant::now() + Duration::from_secs(10);
    let mut out = Vec::new();
    let mut buf = [0u8; 512];
    while out.len() < want && Instant::now() < end {
        if let Pull::Data { filled, .. } = source.pull(&mut buf, Duration::from_millis(100)) {
            out.extend_from_slice(&buf[..filled]);
            source.confirm_read(filled);
        }
    }
    out
}

// --- HttpTransport ---

#[test]
fn redirect_is_returned_not_followed() {
    let server = TestServer::start(|_, _| Reply::new("302 Found", &[("Location", "/new")], vec![]));
    let mut transport = HttpTransport::new(&test_config()).unwrap();

    let conn = transport
        .open(&Request::new(&server.url("/old"), None))
        .unwrap();
    assert_eq!(conn.head().status, 302);
    assert!(conn.head().is_redirect());
    assert_eq!(conn.head().location(), Some("/new"));
    assert_eq!(server.requests().len(), 1);
}

#[test]
fn request_carries_icy_and_range_headers() {
    let server = TestServer::start(|_, _| {
        Reply::new("206 Partial Content", &[("Content-Type", "audio/mpeg")], vec![1, 2, 3])
    });
    let mut transport = HttpTransport::new(&test_config()).unwrap();

    let conn = transport
        .open(&Request::new(&server.url("/stream"), Some(1234)))
        .unwrap();
    assert!(conn.head().is_success());

    let request = &server.requests()[0];
    assert!(request.starts_with("get /stream "));
    assert!(request.contains("icy-metadata: 1\r\n"));
    assert!(request.contains("range: bytes=1234-\r\n"));
    assert!(request.contains("user-agent: radiosource/"));
}

#[test]
fn icy_headers_and_body() {
    let server = TestServer::start(|_, _| {
        Reply::new(
            "200 OK",
            &[
                ("Content-Type", "audio/mpeg"),
                ("icy-metaint", "16000"),
                ("icy-name", "Local FM"),
                ("icy-br", "128"),
            ],
            b"abcdef".to_vec(),
        )
    });
    let mut transport = HttpTransport::new(&test_config()).unwrap();

    let mut conn = transport.open(&Request::new(&server.url("/"), None)).unwrap();
    let headers = IcyHeaders::from_head(conn.head());
    assert_eq!(headers.metaint, 16000);
    assert_eq!(headers.station_name.as_deref(), Some("Local FM"));
    assert_eq!(headers.bitrate, Some(128));

    let mut body = Vec::new();
    conn.read_to_end(&mut body).unwrap();
    assert_eq!(body, b"abcdef");
}

#[test]
fn idle_stream_read_times_out() {
    let server = TestServer::start(|_, _| {
        Reply::new("200 OK", &[("Content-Type", "audio/mpeg")], b"xy".to_vec()).hold_open()
    });
    let mut transport = HttpTransport::new(&test_config()).unwrap();

    let mut conn = transport.open(&Request::new(&server.url("/"), None)).unwrap();
    let mut buf = [0u8; 16];
    let mut got = Vec::new();
    let err = loop {
        match conn.read(&mut buf) {
            Ok(0) => panic!("stream closed early"),
            Ok(n) => got.extend_from_slice(&buf[..n]),
            Err(e) => break e,
        }
    };
    assert_eq!(got, b"xy");
    assert!(radiosource::stream::transport::is_timeout(&err));
}

#[test]
fn slow_response_head_is_within_connect_timeout() {
    let server = TestServer::start(|_, _| {
        thread::sleep(Duration::from_millis(600));
        Reply::new("200 OK", &[("Content-Type", "audio/mpeg")], b"late audio".to_vec())
    });
    let config = SourceConfig {
        poll_timeout_ms: 200,
        connect_timeout_secs: 5,
        ..test_config()
    };
    let mut transport = HttpTransport::new(&config).unwrap();

    let mut conn = transport.open(&Request::new(&server.url("/"), None)).unwrap();
    assert!(conn.head().is_success());

    let end = Instant::now() + Duration::from_secs(5);
    let mut body = Vec::new();
    let mut buf = [0u8; 16];
    while Instant::now() < end {
        match conn.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => body.extend_from_slice(&buf[..n]),
            Err(e) if radiosource::stream::transport::is_timeout(&e) => continue,
            Err(e) => panic!("read failed: {e}"),
        }
    }
    assert_eq!(body, b"late audio");
}

#[test]
fn source_connects_to_slow_server() {
    let server = TestServer::start(|_, _| {
        thread::sleep(Duration::from_millis(600));
        Reply::new("200 OK", &[("Content-Type", "audio/mpeg")], bytes(64, 3)).hold_open()
    });
    let config = SourceConfig {
        poll_timeout_ms: 200,
        connect_timeout_secs: 5,
        ..test_config()
    };

    let source = HttpSource::new(config).unwrap();
    source.set_url(&server.url("/stream"));
    source.start().unwrap();

    assert_eq!(pull_bytes(&source, 64), bytes(64, 3));
    assert_eq!(server.requests().len(), 1);
    source.stop();
}

// --- HttpSource end to end ---

#[test]
fn source_follows_redirect_and_strips_metadata() {
    let mut body = Vec::new();
    let mut expected = Vec::new();
    for (i, title) in ["Artist - First", "Artist - Second"].iter().enumerate() {
        let audio = bytes(32, i as u8 * 64);
        body.extend(&audio);
        expected.extend(&audio);
        body.extend(icy_block(&format!("StreamTitle='{title}';StreamUrl='';")));
    }
    let tail = bytes(32, 200);
    body.extend(&tail);
    expected.extend(&tail);

    let server = TestServer::start(move |_, request| match path_of(request) {
        "/listen" => Reply::new("302 Found", &[("Location", "/stream")], vec![]),
        _ => Reply::new(
            "200 OK",
            &[
                ("Content-Type", "audio/mpeg"),
                ("icy-metaint", "32"),
                ("icy-name", "Local FM"),
                ("icy-genre", "Test"),
            ],
            body.clone(),
        )
        .hold_open(),
    });

    let source = HttpSource::new(test_config()).unwrap();
    let events = source.subscribe();
    source.set_url(&server.url("/listen"));
    source.start().unwrap();

    assert_eq!(pull_bytes(&source, expected.len()), expected);

    let info = source.station_info();
    assert_eq!(info.name.as_deref(), Some("Local FM"));
    assert_eq!(info.genre.as_deref(), Some("Test"));
    assert_eq!(info.title.as_deref(), Some("Artist - Second"));
    assert_eq!(info.url, Some(server.url("/stream")));

    let seen: Vec<_> = events.try_iter().collect();
    assert!(seen.contains(&SourceEvent::Connected {
        url: server.url("/stream"),
        reconnect: false
    }));
    assert!(seen.contains(&SourceEvent::TrackInfo("Artist - First".to_string())));
    source.stop();
}

#[test]
fn source_resumes_with_range_after_close() {
    let server = TestServer::start(|index, _| {
        if index == 0 {
            Reply::new("200 OK", &[("Content-Type", "audio/mpeg")], bytes(40, 0))
        } else {
            Reply::new("206 Partial Content", &[], bytes(40, 40)).hold_open()
        }
    });

    let source = HttpSource::new(test_config()).unwrap();
    source.set_url(&server.url("/stream"));
    source.start().unwrap();

    assert_eq!(pull_bytes(&source, 80), bytes(80, 0));
    let requests = server.requests();
    assert!(requests.len() >= 2);
    assert!(requests[1].contains("range: bytes=40-\r\n"));
    assert!(!requests[0].contains("range:"));
    source.stop();
}

#[test]
fn source_plays_first_track_of_pls() {
    let server = TestServer::start(|_, request| {
        let port_line = request
            .lines()
            .find(|l| l.starts_with("host:"))
            .map(|l| l.trim_start_matches("host:").trim().to_string())
            .unwrap_or_default();
        match path_of(request) {
            "/radio.pls" => {
                let playlist = format!(
                    "[playlist]\nNumberOfEntries=1\nFile1=http://{port_line}/live\nTitle1=Live\n"
                );
                Reply::new("200 OK", &[("Content-Type", "audio/x-scpls")], playlist.into_bytes())
            }
            _ => Reply::new("200 OK", &[("Content-Type", "audio/aac")], bytes(64, 7)).hold_open(),
        }
    });

    let source = HttpSource::new(test_config()).unwrap();
    source.set_url(&server.url("/radio.pls"));
    source.start().unwrap();

    assert_eq!(pull_bytes(&source, 64), bytes(64, 7));
    assert_eq!(
        source.format().codec,
        radiosource::stream::CodecType::Aac
    );
    let paths: Vec<String> = server
        .requests()
        .iter()
        .map(|r| path_of(r).to_string())
        .collect();
    assert_eq!(paths, vec!["/radio.pls", "/live"]);
    source.stop();
}
