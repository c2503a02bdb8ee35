//! Eviction of completed records and idle clients.

use std::io;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use corelib::{MemoryFootprint, SequenceNumber};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use metrics::{counter, gauge};
use tracing::{debug, error, info, warn};

use super::{ResultTracker, RpcState};

/// A COMPLETED record offered to a forced-eviction predicate.
#[derive(Debug, Clone, Copy)]
pub struct EvictionCandidate<'a> {
    pub client_id: &'a str,
    pub seq_no: SequenceNumber,
    /// Time since the record last changed.
    pub age: Duration,
    pub footprint: usize,
}

impl ResultTracker {
    /// Evict COMPLETED records below their client's watermark, along with all
    /// COMPLETED records of clients idle longer than the inactivity TTL.
    /// Idle clients left without records or abandoned drivers are dropped.
    /// Returns the number of records evicted.
    pub fn gc_results(&self) -> usize {
        self.gc_results_with(|_| false)
    }

    /// [`gc_results`](Self::gc_results), additionally evicting every
    /// COMPLETED record `force` selects. Records still waiting on a driver are
    /// never offered.
    pub fn gc_results_with(&self, mut force: impl FnMut(&EvictionCandidate<'_>) -> bool) -> usize {
        let now = Instant::now();
        let ttl = self.config.client_inactivity_ttl();
        let mut evicted = 0;
        let mut dropped_clients = 0;

        let mut clients = self.clients.lock();
        clients.retain(|client_id, client| {
            let inactive = now.saturating_duration_since(client.last_heard_from) >= ttl;
            let stale_before = client.stale_before_seq_no;
            client.records.retain(|&seq_no, record| {
                if record.state != RpcState::Completed {
                    return true;
                }
                let evict = seq_no < stale_before
                    || inactive
                    || force(&EvictionCandidate {
                        client_id,
                        seq_no,
                        age: now.saturating_duration_since(record.last_updated),
                        footprint: record.memory_footprint(),
                    });
                if evict {
                    evicted += 1;
                }
                !evict
            });
            let drop_client = inactive && client.records.is_empty() && client.abandoned.is_empty();
            if drop_client {
                dropped_clients += 1;
            }
            !drop_client
        });
        drop(clients);

        counter!("rpc.result_tracker.evicted").increment(evicted as u64);
        gauge!("rpc.result_tracker.memory_bytes").set(self.budget.consumption() as f64);
        if evicted > 0 || dropped_clients > 0 {
            debug!(evicted, dropped_clients, "result tracker GC pass");
        }
        evicted
    }

    /// One scheduled GC pass: a regular pass, then forced eviction of records
    /// older than the memory-pressure minimum age while the budget is over
    /// its limit.
    pub fn run_gc_pass(&self) -> usize {
        let mut evicted = self.gc_results();
        if self.budget.limit_exceeded() {
            let min_age = self.config.memory_pressure_min_age();
            evicted += self.gc_results_with(|candidate| candidate.age >= min_age);
            if self.budget.limit_exceeded() {
                warn!(
                    consumption = self.budget.consumption(),
                    limit = ?self.budget.limit(),
                    "result tracker still over its memory limit after forced eviction"
                );
            }
        }
        evicted
    }

    /// Run [`run_gc_pass`](Self::run_gc_pass) every `gc_interval` on a
    /// background thread until the returned handle is dropped or the tracker
    /// goes away.
    pub fn start_gc_thread(self: &Arc<Self>) -> io::Result<GcThreadHandle> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let tracker = Arc::downgrade(self);
        let interval = self.config.gc_interval();
        let thread = thread::Builder::new()
            .name("result-tracker-gc".to_string())
            .spawn(move || gc_loop(tracker, stop_rx, interval))?;
        info!(interval = ?interval, "started result tracker GC thread");
        Ok(GcThreadHandle {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

fn gc_loop(tracker: Weak<ResultTracker>, stop: Receiver<()>, interval: Duration) {
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        let Some(tracker) = tracker.upgrade() else {
            break;
        };
        tracker.run_gc_pass();
    }
    debug!("result tracker GC thread exiting");
}

/// Stops and joins the GC thread on drop.
pub struct GcThreadHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl GcThreadHandle {
    pub fn stop(self) {}
}

impl Drop for GcThreadHandle {
    fn drop(&mut self) {
        // Disconnecting the channel wakes the thread.
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("result tracker GC thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RpcContext;
    use bytes::Bytes;
    use corelib::{ErrorStatus, RequestId, ResultTrackerConfig};

    struct NullContext;

    impl RpcContext for NullContext {
        fn reply_success(&self, _response: Bytes) {}
        fn reply_failure(&self, _status: ErrorStatus) {}
    }

    fn complete(tracker: &ResultTracker, client: &str, seq_no: SequenceNumber, first_incomplete: SequenceNumber) {
        let rid = RequestId::new(client, seq_no, first_incomplete, 0);
        assert_eq!(tracker.track_rpc(&rid, Arc::new(NullContext)), RpcState::New);
        tracker
            .record_completion_and_respond(&rid, Bytes::from(vec![7u8; 256]))
            .unwrap();
    }

    #[test]
    fn test_gc_evicts_below_watermark_only() {
        let tracker = ResultTracker::new(ResultTrackerConfig::default());
        complete(&tracker, "c", 0, 0);
        complete(&tracker, "c", 1, 0);
        complete(&tracker, "c", 2, 2);

        assert_eq!(tracker.gc_results(), 2);
        assert_eq!(tracker.record_state("c", 0), None);
        assert_eq!(tracker.record_state("c", 1), None);
        assert_eq!(tracker.record_state("c", 2), Some(RpcState::Completed));
    }

    #[test]
    fn test_gc_never_offers_in_progress_records() {
        let tracker = ResultTracker::new(ResultTrackerConfig::default());
        let rid = RequestId::new("c", 0, 0, 0);
        tracker.track_rpc(&rid, Arc::new(NullContext));

        let mut offered = 0;
        tracker.gc_results_with(|_| {
            offered += 1;
            true
        });
        assert_eq!(offered, 0);
        assert_eq!(tracker.record_state("c", 0), Some(RpcState::InProgress));
    }

    #[test]
    fn test_inactive_client_is_dropped() {
        let config = ResultTrackerConfig {
            client_inactivity_ttl_ms: 0,
            ..ResultTrackerConfig::default()
        };
        let tracker = ResultTracker::new(config);
        complete(&tracker, "idle", 5, 0);
        assert_eq!(tracker.gc_results(), 1);
        assert_eq!(tracker.client_count(), 0);
        assert_eq!(tracker.budget().consumption(), 0);
    }

    #[test]
    fn test_memory_pressure_forces_eviction() {
        let config = ResultTrackerConfig {
            memory_limit_bytes: Some(1),
            memory_pressure_min_age_ms: 0,
            ..ResultTrackerConfig::default()
        };
        let tracker = ResultTracker::new(config);
        complete(&tracker, "c", 0, 0);
        assert!(tracker.budget().limit_exceeded());

        assert_eq!(tracker.run_gc_pass(), 1);
        assert_eq!(tracker.record_state("c", 0), None);
    }

    #[test]
    fn test_gc_thread_stops_on_drop() {
        let config = ResultTrackerConfig {
            gc_interval_ms: 5,
            ..ResultTrackerConfig::default()
        };
        let tracker = Arc::new(ResultTracker::new(config));
        complete(&tracker, "c", 0, 0);
        complete(&tracker, "c", 1, 1);

        let handle = tracker.start_gc_thread().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while tracker.record_state("c", 0).is_some() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        handle.stop();
        assert_eq!(tracker.record_state("c", 0), None);
        assert_eq!(tracker.record_state("c", 1), Some(RpcState::Completed));
    }
}
