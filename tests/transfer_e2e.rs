use anyhow::Result;
use apeftp::{
    DirectoryStore, Frame, FunctionCode, Receiver, ReceiverConfig, ResultCode, Sender,
    SenderConfig, TransferRequest, TransferStore,
};
use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type Queue = Arc<Mutex<VecDeque<Vec<u8>>>>;

fn queue() -> Queue {
    Arc::new(Mutex::new(VecDeque::new()))
}

fn push_to(q: &Queue) -> impl Fn(&[u8]) + Send + Sync + 'static {
    let q = Arc::clone(q);
    move |bytes: &[u8]| q.lock().unwrap().push_back(bytes.to_vec())
}

fn pop(q: &Queue) -> Option<Vec<u8>> {
    q.lock().unwrap().pop_front()
}

fn write_file(path: &Path, size: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(path)?;
    if size == 0 {
        return Ok(());
    }
    let mut buf = vec![0u8; 1024 * 64];
    let mut remaining = size;
    let mut val: u8 = 0;
    while remaining > 0 {
        for b in buf.iter_mut() {
            *b = val;
            val = val.wrapping_add(1);
        }
        let n = remaining.min(buf.len());
        f.write_all(&buf[..n])?;
        remaining -= n;
    }
    Ok(())
}

/// Shuttle frames between the two engines until both directions go quiet,
/// decoding each frame for the observer on the way through.
fn pump(
    sender: &Sender,
    receiver: &Receiver,
    to_receiver: &Queue,
    to_sender: &Queue,
    mut observe: impl FnMut(&Frame),
) {
    loop {
        if let Some(raw) = pop(to_receiver) {
            let frame = Frame::decode(&raw).unwrap();
            observe(&frame);
            receiver.process(frame);
            continue;
        }
        if let Some(raw) = pop(to_sender) {
            let frame = Frame::decode(&raw).unwrap();
            observe(&frame);
            sender.process(frame);
            continue;
        }
        break;
    }
}

#[test]
fn two_segment_transfer_completes() -> Result<()> {
    let src = tempfile::tempdir()?;
    let cache = tempfile::tempdir()?;
    let source = src.path().join("payload.bin");
    write_file(&source, 1_000_000)?;

    let to_receiver = queue();
    let to_sender = queue();
    let store = Arc::new(DirectoryStore::new(cache.path()));
    let sender = Sender::new(push_to(&to_receiver));
    let receiver = Receiver::new(
        Arc::clone(&store) as Arc<dyn TransferStore>,
        push_to(&to_sender),
    );

    let key = sender.begin(&source)?;
    let mut segment_sizes = Vec::new();
    let mut final_result = None;
    pump(&sender, &receiver, &to_receiver, &to_sender, |frame| {
        match frame {
            Frame::Transfer(t) if t.function == FunctionCode::Send => {
                segment_sizes.push(t.data.len())
            }
            Frame::Response(r) if r.result != ResultCode::Continue => {
                final_result = Some(r.result)
            }
            _ => {}
        }
    });

    assert_eq!(segment_sizes, vec![524_288, 475_712]);
    assert_eq!(final_result, Some(ResultCode::Completed));
    assert_eq!(sender.session_state(&key), None);
    assert_eq!(sender.active_sessions(), 0);

    let staged = std::fs::read(store.cached_file(&key))?;
    assert_eq!(staged, std::fs::read(&source)?);
    Ok(())
}

#[test]
fn renegotiation_shrinks_until_accepted() -> Result<()> {
    let src = tempfile::tempdir()?;
    let cache = tempfile::tempdir()?;
    let source = src.path().join("payload.bin");
    write_file(&source, 3000)?;

    let to_receiver = queue();
    let to_sender = queue();
    let store = Arc::new(DirectoryStore::new(cache.path()));
    let sender = Sender::with_config(
        push_to(&to_receiver),
        SenderConfig {
            default_segment_size: 4096,
            ..SenderConfig::default()
        },
        Arc::new(apeftp::NoopLogger),
    );
    let receiver = Receiver::with_config(
        Arc::clone(&store) as Arc<dyn TransferStore>,
        push_to(&to_sender),
        ReceiverConfig {
            max_segment_size: 1024,
            ..ReceiverConfig::default()
        },
        Arc::new(apeftp::NoopLogger),
    );

    let key = sender.begin(&source)?;
    let mut demanded = Vec::new();
    let mut final_result = None;
    pump(&sender, &receiver, &to_receiver, &to_sender, |frame| {
        match frame {
            Frame::Demand(d) => demanded.push(d.segment_max_length),
            Frame::Response(r) if r.result != ResultCode::Continue => {
                final_result = Some(r.result)
            }
            _ => {}
        }
    });

    // 4096 shrinks by 0.75 until it fits under the receiver's 1024 cap
    assert_eq!(demanded, vec![4096, 3072, 2304, 1728, 1296, 972]);
    assert_eq!(final_result, Some(ResultCode::Completed));
    assert_eq!(sender.session_state(&key), None);
    assert_eq!(std::fs::read(store.cached_file(&key))?, std::fs::read(&source)?);
    Ok(())
}

#[test]
fn renegotiation_floor_gives_up() -> Result<()> {
    let src = tempfile::tempdir()?;
    let cache = tempfile::tempdir()?;
    let source = src.path().join("payload.bin");
    write_file(&source, 64)?;

    let to_receiver = queue();
    let to_sender = queue();
    let store = Arc::new(DirectoryStore::new(cache.path()));
    let sender = Sender::new(push_to(&to_receiver));
    // a receiver that accepts no segment size at all
    let receiver = Receiver::with_config(
        Arc::clone(&store) as Arc<dyn TransferStore>,
        push_to(&to_sender),
        ReceiverConfig {
            max_segment_size: 0,
            ..ReceiverConfig::default()
        },
        Arc::new(apeftp::NoopLogger),
    );

    let key = sender.begin(&source)?;
    pump(&sender, &receiver, &to_receiver, &to_sender, |_| {});

    assert_eq!(sender.session_state(&key), None);
    assert_eq!(
        store.task_state(&key),
        apeftp::TaskState::Nonexistent,
        "nothing was ever admitted"
    );
    Ok(())
}

/// Store that sabotages the first run: the last segment of the first attempt
/// is appended with a flipped byte, and the poisoned cache is discarded when
/// verification fails so the sender's restart can be admitted afresh.
struct FlakyStore {
    inner: DirectoryStore,
    poison: AtomicBool,
}

impl TransferStore for FlakyStore {
    fn create_cache(&self, key: &apeftp::SessionKey) -> Result<bool> {
        self.inner.create_cache(key)
    }
    fn task_state(&self, key: &apeftp::SessionKey) -> apeftp::TaskState {
        self.inner.task_state(key)
    }
    fn append_segment(&self, request: &TransferRequest) -> Result<ResultCode> {
        if self.poison.load(Ordering::SeqCst) && request.is_last_segment() {
            let mut corrupted = request.clone();
            corrupted.data[0] ^= 0xFF;
            let code = self.inner.append_segment(&corrupted)?;
            assert_eq!(code, ResultCode::Md5Mismatching);
            self.poison.store(false, Ordering::SeqCst);
            self.inner.cancel_cache(&request.key);
            return Ok(code);
        }
        self.inner.append_segment(request)
    }
    fn cancel_cache(&self, key: &apeftp::SessionKey) -> bool {
        self.inner.cancel_cache(key)
    }
}

#[test]
fn md5_mismatch_restarts_and_recovers() -> Result<()> {
    let src = tempfile::tempdir()?;
    let cache = tempfile::tempdir()?;
    let source = src.path().join("payload.bin");
    write_file(&source, 700_000)?;

    let to_receiver = queue();
    let to_sender = queue();
    let store = Arc::new(FlakyStore {
        inner: DirectoryStore::new(cache.path()),
        poison: AtomicBool::new(true),
    });
    let sender = Sender::new(push_to(&to_receiver));
    let receiver = Receiver::new(
        Arc::clone(&store) as Arc<dyn TransferStore>,
        push_to(&to_sender),
    );

    let key = sender.begin(&source)?;
    let mut demands = 0;
    let mut mismatches = 0;
    let mut first_indices = Vec::new();
    pump(&sender, &receiver, &to_receiver, &to_sender, |frame| {
        match frame {
            Frame::Demand(_) => demands += 1,
            Frame::Transfer(t) if t.function == FunctionCode::Send && t.segment_index == 0 => {
                first_indices.push(t.segment_count)
            }
            Frame::Response(r) if r.result == ResultCode::Md5Mismatching => mismatches += 1,
            _ => {}
        }
    });

    assert_eq!(mismatches, 1);
    assert_eq!(demands, 2, "restart renegotiates from scratch");
    assert_eq!(first_indices.len(), 2, "both runs start at segment 0");
    assert_eq!(store.inner.task_state(&key), apeftp::TaskState::Completed);
    assert_eq!(
        std::fs::read(store.inner.cached_file(&key))?,
        std::fs::read(&source)?
    );
    Ok(())
}

#[test]
fn cancel_mid_transfer_discards_cache() -> Result<()> {
    let src = tempfile::tempdir()?;
    let cache = tempfile::tempdir()?;
    let source = src.path().join("payload.bin");
    write_file(&source, 1_000_000)?;

    let to_receiver = queue();
    let to_sender = queue();
    let store = Arc::new(DirectoryStore::new(cache.path()));
    let sender = Sender::new(push_to(&to_receiver));
    let receiver = Receiver::new(
        Arc::clone(&store) as Arc<dyn TransferStore>,
        push_to(&to_sender),
    );

    let key = sender.begin(&source)?;
    // demand -> Continue -> first segment, then stop pumping
    let demand = pop(&to_receiver).unwrap();
    receiver.process(Frame::decode(&demand).unwrap());
    let cont = pop(&to_sender).unwrap();
    sender.process(Frame::decode(&cont).unwrap());
    assert_eq!(
        sender.session_state(&key),
        Some(apeftp::SessionState::Transferring)
    );

    assert!(sender.cancel(&key));
    let mut saw_cancelled = false;
    pump(&sender, &receiver, &to_receiver, &to_sender, |frame| {
        if let Frame::Response(r) = frame {
            if r.result == ResultCode::Cancelled {
                saw_cancelled = true;
            }
        }
    });

    assert!(saw_cancelled);
    assert_eq!(sender.session_state(&key), None);
    assert_eq!(store.task_state(&key), apeftp::TaskState::Nonexistent);
    Ok(())
}

#[test]
fn redemand_after_completion_is_idempotent() -> Result<()> {
    let src = tempfile::tempdir()?;
    let cache = tempfile::tempdir()?;
    let source = src.path().join("payload.bin");
    write_file(&source, 20_000)?;

    let to_receiver = queue();
    let to_sender = queue();
    let store = Arc::new(DirectoryStore::new(cache.path()));
    let sender = Sender::new(push_to(&to_receiver));
    let receiver = Receiver::new(
        Arc::clone(&store) as Arc<dyn TransferStore>,
        push_to(&to_sender),
    );

    let key = sender.begin(&source)?;
    pump(&sender, &receiver, &to_receiver, &to_sender, |_| {});
    assert_eq!(store.task_state(&key), apeftp::TaskState::Completed);
    let staged_before = std::fs::read(store.cached_file(&key))?;

    // a second send of the same file completes instantly off the cache
    let key2 = sender.begin(&source)?;
    assert_eq!(key2, key);
    let mut results = Vec::new();
    pump(&sender, &receiver, &to_receiver, &to_sender, |frame| {
        if let Frame::Response(r) = frame {
            results.push(r.result);
        }
    });
    assert_eq!(results, vec![ResultCode::Completed]);
    assert_eq!(sender.active_sessions(), 0);
    assert_eq!(std::fs::read(store.cached_file(&key))?, staged_before);
    Ok(())
}

#[test]
fn chunked_wire_with_dispatched_processing() -> Result<()> {
    let src = tempfile::tempdir()?;
    let cache = tempfile::tempdir()?;
    let source = src.path().join("payload.bin");
    write_file(&source, 300_000)?;

    let to_receiver = queue();
    let to_sender = queue();
    let store = Arc::new(DirectoryStore::new(cache.path()));
    let sender = Sender::new(push_to(&to_receiver));
    let receiver = Receiver::new(
        Arc::clone(&store) as Arc<dyn TransferStore>,
        push_to(&to_sender),
    );

    let key = sender.begin(&source)?;

    // Feed the raw wire bytes in awkward 7-byte slices through the real
    // framing + per-key dispatch path and wait for the exchange to settle.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        let mut idle = true;
        if let Some(raw) = pop(&to_receiver) {
            for chunk in raw.chunks(7) {
                receiver.input(chunk)?;
            }
            idle = false;
        }
        if let Some(raw) = pop(&to_sender) {
            for chunk in raw.chunks(7) {
                sender.input(chunk)?;
            }
            idle = false;
        }
        if idle {
            if store.task_state(&key) == apeftp::TaskState::Completed
                && sender.active_sessions() == 0
            {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "transfer did not settle in time"
            );
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    assert_eq!(std::fs::read(store.cached_file(&key))?, std::fs::read(&source)?);
    Ok(())
}
