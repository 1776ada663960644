use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::byte_string::InfoHash;
use crate::peer::peer_message::Bitfield;
use crate::storage::piece_map::PieceDataMap;

/// Percent-complete per queued torrent, published every batch.
pub type CheckerStats = HashMap<InfoHash, f64>;
pub type CheckerStatsFn = Box<dyn Fn(CheckerStats) + Send>;
pub type CheckerCompleteFn = Box<dyn FnOnce(Result<Bitfield, CheckerError>) + Send>;

#[derive(Debug)]
pub enum CheckerError {
    Cancelled,
    Io(io::Error),
}

// Cancellation is only honored at batch boundaries.
const BATCH_SIZE: u64 = 10;

struct Entry {
    info_hash: InfoHash,
    data_map: PieceDataMap,
    piece_count: u64,
    cancelled: Arc<AtomicBool>,
    on_complete: CheckerCompleteFn,
}

#[derive(Default)]
struct CheckerState {
    queue: VecDeque<Entry>,
    running: Option<(InfoHash, Arc<AtomicBool>)>,
}

/// Background worker that hash-verifies a torrent's on-disk pieces and
/// reports the result as a bitfield.
///
/// Entries are processed in FIFO order, one at a time. The state mutex is
/// only taken at enqueue/dequeue/cancel boundaries, never while hashing.
pub struct Checker {
    state: Arc<Mutex<CheckerState>>,
    shutting_down: Arc<AtomicBool>,
    join_handle: Option<thread::JoinHandle<()>>,
}

impl Checker {
    pub fn new(on_stats_update: Option<CheckerStatsFn>) -> Checker {
        let state = Arc::new(Mutex::new(CheckerState::default()));
        let shutting_down = Arc::new(AtomicBool::new(false));

        let worker_state = state.clone();
        let worker_shutdown = shutting_down.clone();
        let join_handle = thread::Builder::new()
            .name(String::from("checker"))
            .spawn(move || Self::main_loop(worker_state, worker_shutdown, on_stats_update))
            .expect("failed to spawn the checker thread");

        Checker {
            state,
            shutting_down,
            join_handle: Some(join_handle),
        }
    }

    /// Queues a torrent for verification. A queued entry with the same info
    /// hash is replaced.
    pub fn check(
        &self,
        info_hash: InfoHash,
        data_map: PieceDataMap,
        piece_count: u64,
        on_complete: CheckerCompleteFn,
    ) {
        if self.shutting_down.load(Ordering::Relaxed) {
            return;
        }
        let mut state = self.state.lock().expect("checker state lock poisoned");
        state.queue.retain(|entry| entry.info_hash != info_hash);
        state.queue.push_back(Entry {
            info_hash,
            data_map,
            piece_count,
            cancelled: Arc::new(AtomicBool::new(false)),
            on_complete,
        });
    }

    /// Marks an entry (queued or running) so the next batch boundary aborts
    /// it.
    pub fn cancel(&self, info_hash: InfoHash) {
        let state = self.state.lock().expect("checker state lock poisoned");
        for entry in &state.queue {
            if entry.info_hash == info_hash {
                entry.cancelled.store(true, Ordering::Relaxed);
            }
        }
        if let Some((running_hash, cancelled)) = &state.running {
            if *running_hash == info_hash {
                cancelled.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Stops the worker and joins its thread. Queued entries are dropped
    /// without their callback.
    pub fn shutdown(&mut self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.join().ok();
        }
    }

    fn main_loop(
        state: Arc<Mutex<CheckerState>>,
        shutting_down: Arc<AtomicBool>,
        on_stats_update: Option<CheckerStatsFn>,
    ) {
        loop {
            if shutting_down.load(Ordering::Relaxed) {
                state
                    .lock()
                    .expect("checker state lock poisoned")
                    .queue
                    .clear();
                return;
            }

            let next = {
                let mut state = state.lock().expect("checker state lock poisoned");
                let entry = state.queue.pop_front();
                if let Some(entry) = &entry {
                    state.running = Some((entry.info_hash, entry.cancelled.clone()));
                }
                entry
            };

            let entry = match next {
                Some(entry) => entry,
                None => {
                    thread::sleep(Duration::from_secs(1));
                    continue;
                }
            };

            let Entry {
                info_hash,
                mut data_map,
                piece_count,
                cancelled,
                on_complete,
            } = entry;

            let result = Self::check_pieces(
                info_hash,
                &mut data_map,
                piece_count,
                &cancelled,
                &shutting_down,
                &on_stats_update,
            );
            on_complete(result);

            state.lock().expect("checker state lock poisoned").running = None;
        }
    }

    fn check_pieces(
        info_hash: InfoHash,
        data_map: &mut PieceDataMap,
        piece_count: u64,
        cancelled: &AtomicBool,
        shutting_down: &AtomicBool,
        on_stats_update: &Option<CheckerStatsFn>,
    ) -> Result<Bitfield, CheckerError> {
        let mut bitfield = Bitfield::new(piece_count);

        for index in 0..piece_count {
            if index % BATCH_SIZE == 0 {
                if cancelled.load(Ordering::Relaxed) || shutting_down.load(Ordering::Relaxed) {
                    return Err(CheckerError::Cancelled);
                }
                if let Some(on_stats_update) = on_stats_update {
                    let mut stats = CheckerStats::new();
                    stats.insert(info_hash, index as f64 * 100.0 / piece_count as f64);
                    on_stats_update(stats);
                }
            }

            let valid = data_map
                .check_piece(index as u32)
                .map_err(CheckerError::Io)?;
            bitfield.set(index, valid);
        }

        Ok(bitfield)
    }
}

impl Drop for Checker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
