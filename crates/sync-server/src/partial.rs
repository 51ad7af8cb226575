//! Partial-request buffers for paginated push submissions.
//!
//! Multi-page submissions accumulate raw payload fragments keyed by request
//! id. Abandoned submissions would otherwise pin memory forever, so a
//! background sweeper drops buffers older than a fixed TTL. A given request
//! id is only ever touched by one logical submission, so sweep and
//! insert/delete may interleave freely.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Buffers older than this are considered abandoned.
pub const BUFFER_TTL: Duration = Duration::from_secs(20 * 60);
/// How often the sweeper wakes up.
pub const SWEEP_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct PartialRequest {
    created_at: Instant,
    payload: String,
}

/// In-flight multi-page submissions, keyed by request id.
#[derive(Debug, Default)]
pub struct PartialRequests {
    buffers: HashMap<String, PartialRequest>,
}

impl PartialRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a fresh buffer for page 0 of a submission. Re-opening an existing
    /// id resets it; last write wins.
    pub fn open(&mut self, request_id: &str) {
        self.buffers.insert(
            request_id.to_string(),
            PartialRequest {
                created_at: Instant::now(),
                payload: String::new(),
            },
        );
    }

    /// Append a raw payload fragment. Returns false when no buffer exists for
    /// the id, which means a duplicate or out-of-order page.
    pub fn append(&mut self, request_id: &str, fragment: &str) -> bool {
        match self.buffers.get_mut(request_id) {
            Some(buffer) => {
                buffer.payload.push_str(fragment);
                true
            }
            None => false,
        }
    }

    /// Remove and return the assembled payload for the final page.
    pub fn take(&mut self, request_id: &str) -> Option<String> {
        self.buffers.remove(request_id).map(|b| b.payload)
    }

    /// Drop buffers older than `ttl`. Returns how many were removed.
    pub fn sweep(&mut self, ttl: Duration) -> usize {
        let before = self.buffers.len();
        self.buffers.retain(|request_id, buffer| {
            let keep = buffer.created_at.elapsed() <= ttl;
            if !keep {
                info!("cleaning up unfinished partial request '{}'", request_id);
            }
            keep
        });
        before - self.buffers.len()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

/// Background task that periodically sweeps abandoned partial-request
/// buffers. Explicit lifecycle: `start` spawns the task, `stop` (or drop)
/// aborts it.
pub struct BufferSweeper {
    handle: Option<JoinHandle<()>>,
}

impl BufferSweeper {
    pub fn start(buffers: Arc<Mutex<PartialRequests>>) -> Self {
        Self::with_period(buffers, SWEEP_PERIOD, BUFFER_TTL)
    }

    pub fn with_period(
        buffers: Arc<Mutex<PartialRequests>>,
        period: Duration,
        ttl: Duration,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick fires immediately; skip it so a fresh buffer is
            // never swept before its first continuation page arrives.
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = buffers.lock().await.sweep(ttl);
                if removed > 0 {
                    debug!("swept {} abandoned partial request buffer(s)", removed);
                }
            }
        });

        Self {
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for BufferSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
