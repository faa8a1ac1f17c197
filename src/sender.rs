//! Sender engine: transfer sessions, demand negotiation, segment pacing
//!
//! One [`Sender`] serves one transport connection. Each `begin` call creates
//! an independent session keyed by (md5, total length); the engine then
//! paces strictly stop-and-wait, emitting the next segment only when the
//! previous one's response arrives. Session bookkeeping is mutated under a
//! single lock; outbound frames are sent after the lock is released so a
//! loopback transport can feed bytes straight back in.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::dispatch::KeyedDispatcher;
use crate::framer::StreamFramer;
use crate::logger::{NoopLogger, TransferLogger};
use crate::message::{DemandRequest, Frame, SessionKey, TransferRequest, TransferResponse};
use crate::protocol::{
    FunctionCode, ResultCode, DEFAULT_MIN_SEGMENT_SIZE, DEFAULT_SEGMENT_SIZE,
    DEFAULT_SHRINK_FACTOR,
};

/// Transport send callback: one complete encoded frame per call.
pub type SendBytes = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Clone)]
pub struct SenderConfig {
    /// Segment length proposed by the first demand.
    pub default_segment_size: u32,
    /// Multiplier applied (truncating) when the receiver rejects the size.
    pub shrink_factor: f64,
    /// Give up renegotiating once the shrunk length falls to this.
    pub min_segment_size: u32,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            default_segment_size: DEFAULT_SEGMENT_SIZE,
            shrink_factor: DEFAULT_SHRINK_FACTOR,
            min_segment_size: DEFAULT_MIN_SEGMENT_SIZE,
        }
    }
}

/// Lifecycle of one sender-side session. Terminal states are observed via
/// [`TransferLogger::session_done`]; the session itself is dropped on
/// reaching them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Demand sent, awaiting negotiation.
    Created,
    /// Negotiation accepted, segments in flight.
    Transferring,
    Completed,
    Cancelled,
    FailedInterrupted,
}

struct TransferSession {
    key: SessionKey,
    state: SessionState,
    segment_length: u32,
    segment_count: u16,
    segment_index: u16,
    path: PathBuf,
    // Opened lazily on first successful negotiation, rewound on restart.
    reader: Option<File>,
}

pub struct Sender {
    inner: Arc<SenderInner>,
    framer: Mutex<StreamFramer>,
    dispatcher: KeyedDispatcher,
}

struct SenderInner {
    config: SenderConfig,
    sessions: Mutex<Vec<TransferSession>>,
    send: SendBytes,
    logger: Arc<dyn TransferLogger>,
}

impl Sender {
    pub fn new(send: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        Self::with_config(send, SenderConfig::default(), Arc::new(NoopLogger))
    }

    pub fn with_config(
        send: impl Fn(&[u8]) + Send + Sync + 'static,
        config: SenderConfig,
        logger: Arc<dyn TransferLogger>,
    ) -> Self {
        Self {
            inner: Arc::new(SenderInner {
                config,
                sessions: Mutex::new(Vec::new()),
                send: Arc::new(send),
                logger,
            }),
            framer: Mutex::new(StreamFramer::new()),
            dispatcher: KeyedDispatcher::new(),
        }
    }

    /// Start sending `path`: read it whole, hash it, track a session and
    /// emit the initial Demand Request. Fails only if the file cannot be
    /// read; no session is created then. Identical files deliberately get
    /// independent sessions per call.
    pub fn begin(&self, path: &Path) -> Result<SessionKey> {
        if self.inner.config.default_segment_size == 0 {
            anyhow::bail!("default_segment_size must be nonzero");
        }
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read source file {}", path.display()))?;
        let key = SessionKey::new(md5::compute(&bytes).0, bytes.len() as u32);

        let session = TransferSession {
            key,
            state: SessionState::Created,
            segment_length: self.inner.config.default_segment_size,
            segment_count: 0,
            segment_index: 0,
            path: path.to_path_buf(),
            reader: None,
        };
        let demand = DemandRequest {
            key,
            segment_max_length: session.segment_length,
        }
        .encode();
        self.inner.sessions.lock().push(session);

        self.inner
            .logger
            .demand_sent(&key, self.inner.config.default_segment_size);
        (self.inner.send)(&demand);
        Ok(key)
    }

    /// Ask the receiver to abort the transfer for `key`. The session is
    /// dropped once the Cancelled response comes back. Returns false when no
    /// such session is tracked.
    pub fn cancel(&self, key: &SessionKey) -> bool {
        let tracked = self
            .inner
            .sessions
            .lock()
            .iter()
            .any(|s| s.key == *key);
        if tracked {
            (self.inner.send)(&TransferRequest::cancel(*key).encode());
        }
        tracked
    }

    /// State of a tracked session; `None` once it ended (sessions are
    /// dropped on reaching a terminal state).
    pub fn session_state(&self, key: &SessionKey) -> Option<SessionState> {
        self.inner
            .sessions
            .lock()
            .iter()
            .find(|s| s.key == *key)
            .map(|s| s.state)
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Feed raw transport bytes. Complete frames are handed to per-key
    /// workers so one session's responses are processed in arrival order.
    /// Errors are framing failures and fatal for the connection.
    pub fn input(&self, bytes: &[u8]) -> Result<()> {
        let frames = {
            let mut framer = self.framer.lock();
            framer.push(bytes);
            let mut out = Vec::new();
            while let Some(frame) = framer.next_frame()? {
                out.push(frame);
            }
            out
        };
        for raw in frames {
            let frame = Frame::decode(&raw)?;
            let inner = Arc::clone(&self.inner);
            self.dispatcher
                .dispatch(frame.key(), move || inner.process(frame));
        }
        Ok(())
    }

    /// Synchronously process one decoded frame (the dispatch-free path).
    pub fn process(&self, frame: Frame) {
        self.inner.process(frame);
    }

    /// Wait for all dispatched frame processing to finish.
    pub fn drain(&self) {
        self.dispatcher.shutdown();
    }
}

impl SenderInner {
    fn process(&self, frame: Frame) {
        // A sender only ever consumes responses.
        if let Frame::Response(resp) = frame {
            self.on_response(&resp);
        }
    }

    fn on_response(&self, resp: &TransferResponse) {
        let mut out: Option<Vec<u8>> = None;
        {
            let mut sessions = self.sessions.lock();
            // Stray responses after a session ended are a normal race.
            let Some(pos) = sessions.iter().position(|s| s.key == resp.key) else {
                return;
            };

            match resp.result {
                ResultCode::Continue => match self.next_segment(&mut sessions[pos]) {
                    Ok(bytes) => out = Some(bytes),
                    Err(_) => self.finish(&mut sessions, pos, SessionState::FailedInterrupted, resp.result),
                },
                ResultCode::Completed => {
                    self.finish(&mut sessions, pos, SessionState::Completed, resp.result)
                }
                ResultCode::Cancelled => {
                    self.finish(&mut sessions, pos, SessionState::Cancelled, resp.result)
                }
                ResultCode::SegmentSizeTooLarge => {
                    let session = &mut sessions[pos];
                    let shrunk = (session.segment_length as f64 * self.config.shrink_factor) as u32;
                    if shrunk <= self.config.min_segment_size {
                        self.finish(&mut sessions, pos, SessionState::FailedInterrupted, resp.result);
                    } else {
                        session.segment_length = shrunk;
                        out = Some(
                            DemandRequest {
                                key: session.key,
                                segment_max_length: shrunk,
                            }
                            .encode(),
                        );
                        self.logger.demand_sent(&session.key, shrunk);
                    }
                }
                ResultCode::InsufficientDiskSpace
                | ResultCode::FileSizeTooLarge
                | ResultCode::InvalidTransferTask
                | ResultCode::InvalidSegmentIndex
                | ResultCode::SameFileTransmitting
                | ResultCode::InvalidCancelCommand => {
                    self.finish(&mut sessions, pos, SessionState::FailedInterrupted, resp.result)
                }
                ResultCode::Md5Mismatching => {
                    // Full restart: same key and path, fresh negotiation. The
                    // read cursor is kept and rewound when the new run opens.
                    let session = &mut sessions[pos];
                    session.state = SessionState::Created;
                    session.segment_index = 0;
                    session.segment_count = 0;
                    out = Some(
                        DemandRequest {
                            key: session.key,
                            segment_max_length: session.segment_length,
                        }
                        .encode(),
                    );
                    self.logger.demand_sent(&session.key, session.segment_length);
                }
            }
        }
        if let Some(bytes) = out {
            (self.send)(&bytes);
        }
    }

    fn finish(
        &self,
        sessions: &mut Vec<TransferSession>,
        pos: usize,
        state: SessionState,
        code: ResultCode,
    ) {
        // Removing the session releases its read handle.
        let session = sessions.remove(pos);
        self.logger.session_done(&session.key, state, code);
    }

    /// Build the next Send-function request, advancing the session cursor.
    /// On the first Continue after negotiation this also fixes the segment
    /// count and positions the read cursor at the start.
    fn next_segment(&self, session: &mut TransferSession) -> Result<Vec<u8>> {
        if session.state == SessionState::Created {
            let total = session.key.total_length as u64;
            let seg = session.segment_length as u64;
            session.segment_count = ((total + seg - 1) / seg) as u16;
            session.segment_index = 0;
            session.state = SessionState::Transferring;
            match session.reader.as_mut() {
                Some(file) => {
                    file.seek(SeekFrom::Start(0))?;
                }
                None => {
                    let file = File::open(&session.path).with_context(|| {
                        format!("failed to open source file {}", session.path.display())
                    })?;
                    session.reader = Some(file);
                }
            }
        }

        let Some(reader) = session.reader.as_mut() else {
            anyhow::bail!("segment requested before negotiation for {}", session.key);
        };
        let mut data = vec![0u8; session.segment_length as usize];
        let n = read_full(reader, &mut data)?;
        data.truncate(n);

        let request = TransferRequest {
            key: session.key,
            function: FunctionCode::Send,
            segment_count: session.segment_count,
            segment_index: session.segment_index,
            data,
        };
        self.logger.segment_sent(
            &session.key,
            session.segment_index,
            session.segment_count,
            request.data.len() as u32,
        );
        session.segment_index += 1;
        Ok(request.encode())
    }
}

// Read until the buffer is full or the file ends; short only on EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
