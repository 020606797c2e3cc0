use hvbusd::bridge::{Bridge, RequestOrigin, RequestQueue};
use hvbusd::config::BusTimings;
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

fn boiler_registry() -> CommandRegistry {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("boiler.csv"),
        "boiler,OUTSIDE_TEMP,read,08,b5,09,60,,value:num:2:0.1:0\n\
         boiler,RETURN_TEMP,read,08,b5,0b,0,,value:num:2:0.1:0\n",
    )
    .unwrap();
    loader::load_dir(dir.path()).unwrap()
}

fn start_bridge(
    script: Vec<MockExchange>,
    capacity: usize,
) -> (Arc<RequestQueue>, std::thread::JoinHandle<()>, MockTransport) {
    let mock = MockTransport::new(script);
    let engine = BusEngine::new(Box::new(mock.clone()), fast_timings());
    let queue = RequestQueue::new(capacity);
    let handle = Bridge::new(engine, Arc::clone(&queue), OWN_ADDRESS, fast_timings()).spawn().unwrap();
    (queue, handle, mock)
}

fn number(result: TransactionResult) -> f64 {
    match result.unwrap().remove(0).1 {
        Value::Number(n) => n,
        other => panic!("expected number, got {:?}", other),
    }
}

#[test]
fn test_requests_serialize_in_submission_order() {
    let registry = boiler_registry();
    let (queue, handle, _mock) = start_bridge(
        vec![
            MockExchange::reply(&[10, 0]),
            MockExchange::reply(&[20, 0]),
            MockExchange::reply(&[30, 0]),
        ],
        8,
    );

    let outside = registry.lookup("OUTSIDE_TEMP").unwrap();
    let ret = registry.lookup("RETURN_TEMP").unwrap();

    let r1 = queue
        .enqueue(RequestOrigin::Client, Arc::clone(&outside), Payload::new())
        .unwrap();
    let r2 = queue
        .enqueue(RequestOrigin::Client, ret, Payload::new())
        .unwrap();
    let r3 = queue
        .enqueue(RequestOrigin::Client, outside, Payload::new())
        .unwrap();

    assert_eq!(number(r1.blocking_recv().unwrap()), 1.0);
    assert_eq!(number(r2.blocking_recv().unwrap()), 2.0);
    assert_eq!(number(r3.blocking_recv().unwrap()), 3.0);

    queue.close();
    handle.join().unwrap();
}

#[test]
fn test_client_request_overtakes_queued_polls() {
    let registry = boiler_registry();
    let mock = MockTransport::new(vec![
        MockExchange::reply(&[10, 0]),
        MockExchange::reply(&[20, 0]),
        MockExchange::reply(&[30, 0]),
    ]);
    let engine = BusEngine::new(Box::new(mock.clone()), fast_timings());
    let queue = RequestQueue::new(8);

    // Everything queued before the dispatcher starts, so the dequeue
    // order is fully determined by priority
    let def = registry.lookup("OUTSIDE_TEMP").unwrap();
    let poll_a = queue
        .enqueue(RequestOrigin::Poll, Arc::clone(&def), Payload::new())
        .unwrap();
    let poll_b = queue
        .enqueue(RequestOrigin::Poll, Arc::clone(&def), Payload::new())
        .unwrap();
    let client = queue
        .enqueue(RequestOrigin::Client, def, Payload::new())
        .unwrap();

    let handle = Bridge::new(engine, Arc::clone(&queue), OWN_ADDRESS, fast_timings()).spawn().unwrap();

    assert_eq!(number(client.blocking_recv().unwrap()), 1.0);
    assert_eq!(number(poll_a.blocking_recv().unwrap()), 2.0);
    assert_eq!(number(poll_b.blocking_recv().unwrap()), 3.0);

    queue.close();
    handle.join().unwrap();
}

#[test]
fn test_full_queue_rejects_busy_without_bus_traffic() {
    let registry = boiler_registry();
    // No dispatcher thread at all: requests must pile up
    let mock = MockTransport::new(vec![]);
    let queue = RequestQueue::new(2);
    let def = registry.lookup("OUTSIDE_TEMP").unwrap();

    for _ in 0..2 {
        queue
            .enqueue(RequestOrigin::Client, Arc::clone(&def), Payload::new())
            .unwrap();
    }
    let rejected = queue.enqueue(RequestOrigin::Client, def, Payload::new());
    assert!(matches!(rejected, Err(BusError::Busy)));

    assert_eq!(queue.depths().0, 2);
    assert!(mock.sent().is_empty());
    assert_eq!(mock.attempts(), 0);
}

#[test]
fn test_device_fault_shuts_the_bridge_down() {
    let registry = boiler_registry();
    let mock = MockTransport::new(vec![MockExchange::fault()]);
    let engine = BusEngine::new(Box::new(mock), fast_timings());
    let queue = RequestQueue::new(8);
    let def = registry.lookup("OUTSIDE_TEMP").unwrap();

    // Both queued before the dispatcher starts: the fault on the first
    // must drain the second with EngineDown
    let first = queue
        .enqueue(RequestOrigin::Client, Arc::clone(&def), Payload::new())
        .unwrap();
    let queued = queue
        .enqueue(RequestOrigin::Poll, Arc::clone(&def), Payload::new())
        .unwrap();

    let handle = Bridge::new(engine, Arc::clone(&queue), OWN_ADDRESS, fast_timings())
        .spawn()
        .unwrap();

    assert!(matches!(
        first.blocking_recv().unwrap(),
        Err(BusError::DeviceFault(_))
    ));
    assert_eq!(queued.blocking_recv().unwrap(), Err(BusError::EngineDown));
    handle.join().unwrap();

    let late = queue.enqueue(RequestOrigin::Client, def, Payload::new());
    assert!(matches!(late, Err(BusError::EngineDown)));
}
