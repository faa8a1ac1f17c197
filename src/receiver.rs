//! Receiver engine: admission control, segment validation, completion
//!
//! One [`Receiver`] serves one transport connection. It keeps no per-task
//! state of its own - everything is derived from the [`TransferStore`] - so
//! a restarted receiver resumes exactly where its cache left off. Every
//! inbound request produces exactly one response frame.

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::dispatch::KeyedDispatcher;
use crate::framer::StreamFramer;
use crate::logger::{NoopLogger, TransferLogger};
use crate::message::{DemandRequest, Frame, TransferRequest, TransferResponse};
use crate::protocol::{
    FunctionCode, ResultCode, DEFAULT_MAX_FILE_SIZE, DEFAULT_MAX_SEGMENT_SIZE,
};
use crate::sender::SendBytes;
use crate::store::{TaskState, TransferStore};

#[derive(Clone)]
pub struct ReceiverConfig {
    /// Largest segment length a demand may negotiate.
    pub max_segment_size: u32,
    /// Largest total file length this receiver admits.
    pub max_file_size: u32,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

pub struct Receiver {
    inner: Arc<ReceiverInner>,
    framer: Mutex<StreamFramer>,
    dispatcher: KeyedDispatcher,
}

struct ReceiverInner {
    config: ReceiverConfig,
    store: Arc<dyn TransferStore>,
    // Serializes the state-check/create-cache window so two demands for one
    // key cannot both observe Nonexistent.
    admission: Mutex<()>,
    send: SendBytes,
    logger: Arc<dyn TransferLogger>,
}

impl Receiver {
    pub fn new(store: Arc<dyn TransferStore>, send: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        Self::with_config(store, send, ReceiverConfig::default(), Arc::new(NoopLogger))
    }

    pub fn with_config(
        store: Arc<dyn TransferStore>,
        send: impl Fn(&[u8]) + Send + Sync + 'static,
        config: ReceiverConfig,
        logger: Arc<dyn TransferLogger>,
    ) -> Self {
        Self {
            inner: Arc::new(ReceiverInner {
                config,
                store,
                admission: Mutex::new(()),
                send: Arc::new(send),
                logger,
            }),
            framer: Mutex::new(StreamFramer::new()),
            dispatcher: KeyedDispatcher::new(),
        }
    }

    /// Feed raw transport bytes. Complete frames are handed to per-key
    /// workers so one transfer's requests are processed in arrival order.
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

impl ReceiverInner {
    fn process(&self, frame: Frame) {
        let response = match frame {
            Frame::Demand(req) => self.on_demand(&req),
            Frame::Transfer(req) => self.on_transfer(&req),
            // Responses are sender-bound; nothing for a receiver to do.
            Frame::Response(_) => return,
        };
        if response.result.is_error() {
            self.logger.rejected(&response.key, response.result);
        }
        (self.send)(&response.encode());
    }

    fn on_demand(&self, req: &DemandRequest) -> TransferResponse {
        let key = req.key;
        if req.segment_max_length > self.config.max_segment_size {
            return TransferResponse::new(key, ResultCode::SegmentSizeTooLarge);
        }
        if key.total_length > self.config.max_file_size {
            return TransferResponse::new(key, ResultCode::FileSizeTooLarge);
        }

        let _admission = self.admission.lock();
        match self.store.task_state(&key) {
            // Re-demand of a finished transfer is idempotent.
            TaskState::Completed => TransferResponse::new(key, ResultCode::Completed),
            TaskState::Transmitting => {
                TransferResponse::new(key, ResultCode::SameFileTransmitting)
            }
            TaskState::Nonexistent => match self.store.create_cache(&key) {
                Ok(true) => {
                    self.logger.task_admitted(&key);
                    TransferResponse::new(key, ResultCode::Continue)
                }
                Ok(false) => TransferResponse::new(key, ResultCode::InsufficientDiskSpace),
                Err(err) => TransferResponse::with_message(
                    key,
                    ResultCode::InsufficientDiskSpace,
                    err.to_string(),
                ),
            },
        }
    }

    fn on_transfer(&self, req: &TransferRequest) -> TransferResponse {
        let key = req.key;
        let state = self.store.task_state(&key);

        if req.function == FunctionCode::Cancel {
            // Cancel only aborts a transfer that is actually in flight.
            return if state == TaskState::Transmitting {
                self.store.cancel_cache(&key);
                self.logger.task_cancelled(&key);
                TransferResponse::new(key, ResultCode::Cancelled)
            } else {
                TransferResponse::new(key, ResultCode::InvalidCancelCommand)
            };
        }

        if state == TaskState::Nonexistent {
            return TransferResponse::new(key, ResultCode::InvalidTransferTask);
        }
        // A verified cache accepts no further appends; answering Completed
        // keeps a retransmitted tail segment harmless.
        if state == TaskState::Completed {
            return TransferResponse::new(key, ResultCode::Completed);
        }
        if req.segment_index >= req.segment_count {
            return TransferResponse::new(key, ResultCode::InvalidSegmentIndex);
        }

        match self.store.append_segment(req) {
            Ok(code) => {
                self.logger
                    .segment_stored(&key, req.segment_index, req.segment_count);
                TransferResponse::new(key, code)
            }
            Err(err) => TransferResponse::with_message(
                key,
                ResultCode::InsufficientDiskSpace,
                err.to_string(),
            ),
        }
    }
}
