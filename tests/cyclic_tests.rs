use hvbusd::bridge::{Bridge, RequestOrigin, RequestQueue};
use hvbusd::config::BusTimings;
use hvbusd::cyclic::{CyclicCache, PollScheduler};
use hvbusd::engine::BusEngine;
use hvbusd::error::BusError;
use hvbusd::frame::Payload;
use hvbusd::registry::Value;
use hvbusd::transport::{MockExchange, MockTransport};
use hvbusd::*;
use std::fs;
use std::sync::Arc;

const OWN_ADDRESS: u8 = 0xFF;

fn fast_timings() -> BusTimings {
    BusTimings {
        quiet_ms: 1,
        recovery_ms: 0,
        echo_timeout_ms: 1,
        reply_timeout_ms: 5,
        send_retries: 2,
    }
}

fn status_registry() -> CommandRegistry {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("boiler.csv"),
        "boiler,BOILER_STATUS,read,08,b5,0a,30,,temp:num:2:0.1:0\n",
    )
    .unwrap();
    loader::load_dir(dir.path()).unwrap()
}

struct Harness {
    scheduler: PollScheduler,
    cache: Arc<CyclicCache>,
    queue: Arc<RequestQueue>,
    handle: std::thread::JoinHandle<()>,
    mock: MockTransport,
}

impl Harness {
    fn start(registry: &CommandRegistry, script: Vec<MockExchange>, now_ms: u64) -> Self {
        let mock = MockTransport::new(script);
        let engine = BusEngine::new(Box::new(mock.clone()), fast_timings());
        let queue = RequestQueue::new(8);
        let handle =
            Bridge::new(engine, Arc::clone(&queue), OWN_ADDRESS, fast_timings()).spawn().unwrap();
        let (scheduler, cache) = PollScheduler::new(registry.cyclic_entries(), now_ms);
        Self {
            scheduler,
            cache,
            queue,
            handle,
            mock,
        }
    }

    /// One full poll round: tick, run every due command over the bus at
    /// poll priority, feed the outcomes back.
    fn poll_round(&mut self, now_ms: u64) -> usize {
        let due = self.scheduler.tick(now_ms);
        let count = due.len();
        for def in due {
            let name = def.name.clone();
            let result = match self
                .queue
                .enqueue(RequestOrigin::Poll, def, Payload::new())
            {
                Ok(rx) => rx.blocking_recv().unwrap_or(Err(BusError::EngineDown)),
                Err(err) => Err(err),
            };
            self.scheduler.complete(&name, result, now_ms);
        }
        count
    }

    fn stop(self) {
        self.queue.close();
        self.handle.join().unwrap();
    }
}

fn cached_number(cache: &CyclicCache, name: &str) -> Option<f64> {
    let entry = cache.get(name)?;
    let values = entry.values.as_ref()?;
    match values[0].1 {
        Value::Number(n) => Some(n),
        _ => None,
    }
}

#[test]
fn test_boiler_status_refreshes_across_two_intervals() {
    let registry = status_registry();
    let mut harness = Harness::start(
        &registry,
        vec![
            MockExchange::reply(&[215, 0]),
            MockExchange::reply(&[230, 0]),
        ],
        0,
    );

    // First round at startup
    assert_eq!(harness.poll_round(0), 1);
    assert_eq!(cached_number(&harness.cache, "BOILER_STATUS"), Some(21.5));

    // Not due again before the 30 s interval has elapsed
    assert_eq!(harness.poll_round(29_999), 0);

    // Second round one interval later picks up the new reading
    assert_eq!(harness.poll_round(30_000), 1);
    assert_eq!(cached_number(&harness.cache, "BOILER_STATUS"), Some(23.0));
    assert_eq!(harness.mock.attempts(), 2);

    harness.stop();
}

#[test]
fn test_no_response_poll_keeps_stale_value() {
    let registry = status_registry();
    let mut harness = Harness::start(
        &registry,
        vec![
            MockExchange::reply(&[215, 0]),
            // Second poll: three silent attempts exhaust the retry budget
            MockExchange::silent(),
            MockExchange::silent(),
            MockExchange::silent(),
        ],
        0,
    );

    harness.poll_round(0);
    harness.poll_round(30_000);

    let entry = harness.cache.get("BOILER_STATUS").unwrap();
    assert_eq!(cached_number(&harness.cache, "BOILER_STATUS"), Some(21.5));
    assert_eq!(entry.updated_ms, Some(0));
    assert_eq!(entry.last_error, Some(BusError::NoResponse { attempts: 3 }));

    harness.stop();
}

#[test]
fn test_cache_reads_cause_no_bus_traffic() {
    let registry = status_registry();
    let mut harness = Harness::start(&registry, vec![MockExchange::reply(&[215, 0])], 0);

    harness.poll_round(0);
    assert_eq!(harness.mock.attempts(), 1);

    for _ in 0..100 {
        assert_eq!(cached_number(&harness.cache, "BOILER_STATUS"), Some(21.5));
    }
    let snapshot = harness.cache.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(harness.mock.attempts(), 1);

    harness.stop();
}

#[test]
fn test_rejected_poll_submission_is_recorded_as_failure() {
    let registry = status_registry();
    // Queue with no dispatcher and zero capacity on the poll class
    let mock = MockTransport::new(vec![]);
    let queue = RequestQueue::new(0);
    let (mut scheduler, cache) = PollScheduler::new(registry.cyclic_entries(), 0);

    for def in scheduler.tick(0) {
        let name = def.name.clone();
        let result = match queue.enqueue(RequestOrigin::Poll, def, Payload::new()) {
            Ok(rx) => rx.blocking_recv().unwrap_or(Err(BusError::EngineDown)),
            Err(err) => Err(err),
        };
        scheduler.complete(&name, result, 0);
    }

    let entry = cache.get("BOILER_STATUS").unwrap();
    assert_eq!(entry.last_error, Some(BusError::Busy));
    assert!(entry.values.is_none());
    assert_eq!(mock.attempts(), 0);
}
