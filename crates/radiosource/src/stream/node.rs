//! HTTP source node
//!
//! Architecture:
//!   HttpSource (handle, any thread)
//!       │ set_url() ──► command queue (crossbeam bounded)
//!       ▼
//!   worker thread "http-source"
//!       Connector ─► Connection ─► IcyParser ─► RingBuffer
//!       ▲                                           │
//!       └── retries / playlist fallback             ▼
//!                                          pull() / confirm_read()
//!
//! The worker alternates between draining the command queue and one bounded
//! read from the open connection. It never holds a lock across network I/O.

use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use tracing::{debug, info, warn};

use crate::config::buffer::COMMAND_QUEUE_BOUND;
use crate::config::SourceConfig;
use crate::error::{Result, SourceError};
use crate::stream::connection::Connector;
use crate::stream::events::{EventBus, SourceEvent};
use crate::stream::format::{CodecType, StreamFormat};
use crate::stream::icy::IcyParser;
use crate::stream::metadata::{SharedStationInfo, StationInfo};
use crate::stream::playlist::Playlist;
use crate::stream::ring::{PrefillGate, RingBuffer, RingError};
use crate::stream::transport::{is_timeout, Connection, HttpTransport, Transport};

/// Lifecycle of the source node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Created, worker not started
    Idle,
    Running,
    /// Waiting for a command (connect failed or no tracks left)
    Paused,
    Stopped,
}

/// Outcome of a pull request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    /// `filled` bytes were copied; 0 for a format-only request
    Data { filled: usize, format: StreamFormat },
    /// The URL changed; downstream should drop what it buffered
    Flush,
    Timeout,
    Stopped,
}

/// Receives the raw stream, e.g. to save it to disk
pub trait Recorder: Send {
    /// Every chunk as received, before metadata is stripped
    fn on_data(&mut self, raw: &[u8]);
    /// A new title arrived after playback had started
    fn on_new_track(&mut self, title: &str, format: &StreamFormat);
}

enum Command {
    SetUrl(String),
    Terminate,
}

/// State shared between the handle and the worker
struct Shared {
    ring: RingBuffer,
    prefill: PrefillGate,
    station: SharedStationInfo,
    format: Mutex<StreamFormat>,
    state: Mutex<NodeState>,
    connected: AtomicBool,
    bytes_received: AtomicU64,
    events: EventBus,
    recorder: Mutex<Option<Box<dyn Recorder>>>,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn set_state(&self, state: NodeState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!(from = ?*current, to = ?state, "Source state");
            *current = state;
        }
    }
}

/// Network audio source: fetches one stream at a time and serves clean audio
/// bytes through `pull`.
///
/// All methods take `&self`, so the handle can be shared between a control
/// thread and the consumer thread. A source runs once: after `stop` it
/// cannot be restarted.
pub struct HttpSource {
    shared: Arc<Shared>,
    cmd_tx: Sender<Command>,
    /// Present until `start` moves it onto its thread
    worker: Mutex<Option<Worker>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    prefill_amount: usize,
}

impl HttpSource {
    /// Create a source backed by the reqwest HTTP transport.
    pub fn new(config: SourceConfig) -> Result<Self> {
        let config = config.validated();
        let transport = HttpTransport::new(&config)?;
        Ok(Self::with_transport(config, Box::new(transport)))
    }

    /// Create a source over any transport.
    pub fn with_transport(config: SourceConfig, transport: Box<dyn Transport>) -> Self {
        let config = config.validated();
        let prefill_amount = config.prefill();
        let (cmd_tx, cmd_rx) = bounded(COMMAND_QUEUE_BOUND);

        let shared = Arc::new(Shared {
            ring: RingBuffer::new(config.buffer_capacity),
            prefill: PrefillGate::new(true),
            station: Arc::new(Mutex::new(StationInfo::default())),
            format: Mutex::new(StreamFormat::default()),
            state: Mutex::new(NodeState::Idle),
            connected: AtomicBool::new(false),
            bytes_received: AtomicU64::new(0),
            events: EventBus::new(),
            recorder: Mutex::new(None),
        });

        let worker = Worker {
            shared: shared.clone(),
            cmd_rx,
            connector: Connector::new(transport, config.connect_attempts as usize),
            url: None,
            playlist: Playlist::default(),
            icy: IcyParser::default(),
            connection: None,
            byte_pos: 0,
            read_buf: vec![0u8; config.read_size],
            prefill_amount,
            config,
        };

        Self {
            shared,
            cmd_tx,
            worker: Mutex::new(Some(worker)),
            thread: Mutex::new(None),
            prefill_amount,
        }
    }

    /// Point the source at a new URL.
    ///
    /// Before `start` this takes effect immediately. Afterwards it is queued:
    /// the worker drops the current connection, clears the buffer, reports a
    /// one-shot `Pull::Flush` and waits for prefill again.
    pub fn set_url(&self, url: &str) {
        if let Some(worker) = lock(&self.worker).as_mut() {
            info!(url, "Setting url");
            worker.url = Some(url.to_string());
            return;
        }
        info!(url, "Posting set-url command");
        if self.cmd_tx.send(Command::SetUrl(url.to_string())).is_err() {
            warn!(url, "Source worker is gone, url ignored");
        }
        // A writer blocked on a full ring re-checks the queue
        self.shared.ring.wake();
    }

    /// Spawn the worker thread.
    pub fn start(&self) -> Result<()> {
        if self.state() == NodeState::Stopped {
            return Err(SourceError::Stopped);
        }
        let worker = lock(&self.worker)
            .take()
            .ok_or_else(|| SourceError::Stream("source already started".to_string()))?;

        self.shared.set_state(NodeState::Running);
        let handle = thread::Builder::new()
            .name("http-source".to_string())
            .spawn(move || worker.run())
            .map_err(|e| SourceError::Stream(format!("Failed to spawn source thread: {e}")))?;
        *lock(&self.thread) = Some(handle);
        Ok(())
    }

    /// Terminate the worker and wake every blocked caller. Idempotent.
    pub fn stop(&self) {
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            let _ = self.cmd_tx.send(Command::Terminate);
            self.shared.ring.set_stop_signal();
            self.shared.prefill.set_stop_signal();
            if handle.join().is_err() {
                warn!("Source worker panicked");
            }
        } else {
            self.shared.ring.set_stop_signal();
            self.shared.prefill.set_stop_signal();
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.set_state(NodeState::Stopped);
    }

    /// Fill `buf` with audio bytes.
    ///
    /// Blocks until prefill is satisfied and data is available, or `timeout`
    /// elapses. An empty `buf` only asks for the current format. Bytes
    /// returned in `Pull::Data` stay buffered until `confirm_read`.
    pub fn pull(&self, buf: &mut [u8], timeout: Duration) -> Pull {
        let started = Instant::now();
        if self.shared.ring.take_flush_pending() {
            return Pull::Flush;
        }

        match self.shared.prefill.wait_ready(timeout) {
            Ok(()) => {}
            Err(RingError::Stopped) => return Pull::Stopped,
            Err(_) => return Pull::Timeout,
        }
        let remaining = match timeout.checked_sub(started.elapsed()) {
            Some(remaining) if !remaining.is_zero() => remaining,
            _ => return Pull::Timeout,
        };

        if buf.is_empty() {
            return match self.shared.ring.wait_for_data(remaining) {
                Ok(()) => Pull::Data {
                    filled: 0,
                    format: self.format(),
                },
                Err(RingError::Stopped) => Pull::Stopped,
                Err(_) => Pull::Timeout,
            };
        }

        let read_started = Instant::now();
        let result = self.shared.ring.contig_read(buf, remaining);
        let took = read_started.elapsed();
        if took > remaining + Duration::from_millis(10) {
            warn!(
                took_ms = took.as_millis() as u64,
                timeout_ms = remaining.as_millis() as u64,
                "Ring read took more than timeout"
            );
        }

        match result {
            Ok(0) => Pull::Timeout,
            Ok(filled) => Pull::Data {
                filled,
                format: self.format(),
            },
            Err(RingError::Stopped) => Pull::Stopped,
            Err(_) => Pull::Timeout,
        }
    }

    /// Release `n` bytes returned by the last `pull`.
    pub fn confirm_read(&self, n: usize) {
        self.shared.ring.commit_contig_read(n);
    }

    /// Snapshot of what the station has told us
    pub fn station_info(&self) -> StationInfo {
        lock(&self.shared.station).clone()
    }

    pub fn shared_station_info(&self) -> SharedStationInfo {
        self.shared.station.clone()
    }

    pub fn format(&self) -> StreamFormat {
        *lock(&self.shared.format)
    }

    pub fn subscribe(&self) -> Receiver<SourceEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> NodeState {
        *lock(&self.shared.state)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Raw bytes received from the network since creation
    pub fn bytes_received(&self) -> u64 {
        self.shared.bytes_received.load(Ordering::Relaxed)
    }

    /// Bytes buffered and not yet confirmed by the consumer
    pub fn buffered(&self) -> usize {
        self.shared.ring.total_data_avail()
    }

    pub fn capacity(&self) -> usize {
        self.shared.ring.capacity()
    }

    pub fn prefill_amount(&self) -> usize {
        self.prefill_amount
    }

    pub fn set_recorder(&self, recorder: Box<dyn Recorder>) {
        *lock(&self.shared.recorder) = Some(recorder);
    }

    pub fn clear_recorder(&self) {
        lock(&self.shared.recorder).take();
    }
}

impl Drop for HttpSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the worker thread owns
struct Worker {
    shared: Arc<Shared>,
    cmd_rx: Receiver<Command>,
    connector: Connector,
    config: SourceConfig,
    url: Option<String>,
    playlist: Playlist,
    icy: IcyParser,
    connection: Option<Box<dyn Connection>>,
    /// Audio bytes committed on the current track; the resume offset
    byte_pos: u64,
    read_buf: Vec<u8>,
    prefill_amount: usize,
}

impl Worker {
    fn run(mut self) {
        info!("Source worker started");
        self.shared.ring.clear_stop_signal();
        self.shared.prefill.clear_stop_signal();

        while self.process_commands() {
            if self.connection.is_none() {
                if let Err(e) = self.connect(false) {
                    warn!(error = %e, "Connect failed, pausing");
                    self.drop_connection();
                    self.shared.set_state(NodeState::Paused);
                    continue;
                }
            }
            while self.cmd_rx.is_empty()
                && self.connection.is_some()
                && self.state() == NodeState::Running
            {
                self.recv();
            }
        }

        self.drop_connection();
        self.shared.set_state(NodeState::Stopped);
        info!("Source worker stopped");
    }

    fn state(&self) -> NodeState {
        *lock(&self.shared.state)
    }

    /// Apply queued commands. Blocks while paused. Returns false on terminate.
    fn process_commands(&mut self) -> bool {
        loop {
            let command = if self.state() == NodeState::Running {
                match self.cmd_rx.try_recv() {
                    Ok(command) => command,
                    Err(TryRecvError::Empty) => return true,
                    Err(TryRecvError::Disconnected) => return false,
                }
            } else {
                match self.cmd_rx.recv() {
                    Ok(command) => command,
                    Err(_) => return false,
                }
            };

            match command {
                Command::Terminate => return false,
                Command::SetUrl(url) => self.switch_url(url),
            }
        }
    }

    fn switch_url(&mut self, url: String) {
        self.drop_connection();
        self.playlist.clear();
        info!(url = %url, "Url set, switched to running state");
        self.url = Some(url);
        self.shared.ring.clear();
        self.shared.ring.set_flush_pending();
        self.shared.prefill.set_waiting(true);
        self.shared.set_state(NodeState::Running);
    }

    /// A command is queued or the ring was stopped
    fn interrupted(&self) -> bool {
        !self.cmd_rx.is_empty() || self.shared.ring.is_stopped()
    }

    fn connect(&mut self, reconnect: bool) -> Result<()> {
        let url = self.url.clone().ok_or(SourceError::NoUrl)?;
        info!(url = %url, reconnect, "Connecting");

        if !reconnect {
            self.drain()?;
            lock(&self.shared.format).reset();
            self.byte_pos = 0;
            *lock(&self.shared.station) = StationInfo::default();
        }

        self.shared.events.emit(SourceEvent::Connecting { reconnect });
        let resume_from = (self.byte_pos > 0).then_some(self.byte_pos);
        let established = self.connector.connect(&url, resume_from, &mut self.playlist)?;

        if established.track_url != url {
            self.url = Some(established.track_url.clone());
        }
        {
            let mut format = lock(&self.shared.format);
            if !reconnect {
                *format = StreamFormat::with_codec(established.codec);
            } else if established.codec != CodecType::Unknown && established.codec != format.codec {
                debug!(old = %format.codec, new = %established.codec, "Codec changed on resume");
                *format = StreamFormat::with_codec(established.codec);
            }
        }
        self.icy.reset(established.headers.metaint);
        {
            let mut station = lock(&self.shared.station);
            *station = station
                .with_headers(&established.headers)
                .with_default_url(&established.final_url);
        }

        self.connection = Some(established.connection);
        self.shared.connected.store(true, Ordering::SeqCst);
        self.shared.events.emit(SourceEvent::Connected {
            url: established.final_url,
            reconnect,
        });
        Ok(())
    }

    /// Wait until the consumer has taken every buffered byte of the previous
    /// track, then arm the prefill wait for the next one.
    fn drain(&self) -> Result<()> {
        let ring = &self.shared.ring;
        if self.shared.prefill.is_waiting() && ring.has_data() {
            warn!("Buffer still holds data while waiting for prefill, allowing read");
            self.shared.prefill.set_waiting(false);
        }
        debug!(buffered = ring.total_data_avail(), "Waiting for buffer to drain");
        loop {
            match ring.wait_for_empty(self.config.poll_timeout()) {
                Ok(()) => break,
                Err(RingError::TimedOut) if self.cmd_rx.is_empty() => continue,
                Err(RingError::TimedOut) | Err(RingError::Interrupted) => {
                    return Err(SourceError::Stream(
                        "connect interrupted by a pending command".to_string(),
                    ));
                }
                Err(RingError::Stopped) => return Err(SourceError::Stopped),
            }
        }
        debug!("Buffer drained");
        self.shared.prefill.set_waiting(true);
        Ok(())
    }

    fn drop_connection(&mut self) {
        if self.connection.take().is_some() {
            debug!("Connection closed");
        }
        self.connector.reset();
        self.shared.connected.store(false, Ordering::SeqCst);
    }

    /// One read cycle: a single chunk on success, otherwise reconnects on the
    /// current track, then the next playlist entry, then pause.
    fn recv(&mut self) {
        loop {
            for attempt in 0..self.config.recv_retries {
                if self.interrupted() {
                    return;
                }
                if self.connection.is_none() {
                    let reconnect = self.byte_pos > 0;
                    if let Err(e) = self.connect(reconnect) {
                        warn!(attempt, error = %e, "Reconnect failed");
                        continue;
                    }
                }

                let cmd_rx = &self.cmd_rx;
                let free = match self.shared.ring.reserve(
                    self.read_buf.len(),
                    self.config.poll_timeout(),
                    || !cmd_rx.is_empty(),
                ) {
                    Ok(free) => free,
                    Err(_) => return,
                };

                let Some(connection) = self.connection.as_mut() else {
                    continue;
                };
                match connection.read(&mut self.read_buf[..free]) {
                    Ok(n) if n > 0 => {
                        self.on_chunk(n);
                        return;
                    }
                    Err(e) if is_timeout(&e) => return,
                    Ok(_) => warn!(byte_pos = self.byte_pos, "Server closed the stream"),
                    Err(e) => warn!(
                        byte_pos = self.byte_pos,
                        error = %e,
                        "Error receiving http stream"
                    ),
                }
                warn!("Reconnecting and retrying...");
                self.drop_connection();
            }

            if self.interrupted() {
                return;
            }
            warn!(retries = self.config.recv_retries, "Network retries exhausted");
            self.drop_connection();
            if !self.next_track() {
                warn!("No more tracks, pausing");
                self.shared.set_state(NodeState::Paused);
                // Let the consumer drain what is left
                self.shared.prefill.set_waiting(false);
                self.shared.events.emit(SourceEvent::NoMoreTracks);
                return;
            }

            self.byte_pos = 0;
            if let Some(url) = &self.url {
                self.shared.events.emit(SourceEvent::NextTrack(url.clone()));
            }
            if let Err(e) = self.connect(false) {
                warn!(error = %e, "Connecting to next track failed");
            }
        }
    }

    fn next_track(&mut self) -> bool {
        if !self.config.auto_next_track {
            return false;
        }
        match self.playlist.next_track() {
            Some(url) => {
                info!(url = %url, "Trying next playlist track");
                self.url = Some(url);
                true
            }
            None => false,
        }
    }

    /// Route `n` freshly read bytes through the ICY parser into the ring.
    fn on_chunk(&mut self, n: usize) {
        let playback_started = self.byte_pos > 0;
        let chunk = &mut self.read_buf[..n];

        if let Some(recorder) = lock(&self.shared.recorder).as_mut() {
            recorder.on_data(chunk);
        }

        let mut titles = Vec::new();
        let audio = self.icy.process(chunk, |title| titles.push(title));
        self.byte_pos += audio as u64;
        self.shared
            .bytes_received
            .fetch_add(n as u64, Ordering::Relaxed);
        for title in titles {
            self.on_title(title, playback_started);
        }

        if self
            .shared
            .ring
            .commit_write(&self.read_buf[..audio])
            .is_err()
        {
            return;
        }

        if self.shared.prefill.is_waiting()
            && self.shared.ring.total_data_avail() >= self.prefill_amount
        {
            debug!(buffered = self.shared.ring.total_data_avail(), "Prefill complete");
            self.shared.prefill.set_waiting(false);
        }
    }

    fn on_title(&self, title: String, playback_started: bool) {
        {
            let mut station = lock(&self.shared.station);
            if station.title.as_deref() == Some(title.as_str()) {
                return;
            }
            *station = station.with_title(&title);
        }
        info!(title = %title, "Track title changed");

        if playback_started {
            let format = *lock(&self.shared.format);
            if let Some(recorder) = lock(&self.shared.recorder).as_mut() {
                recorder.on_new_track(&title, &format);
            }
        }
        self.shared.events.emit(SourceEvent::TrackInfo(title));
    }
}
