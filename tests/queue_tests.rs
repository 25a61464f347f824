use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aircon_lan::{
    CommandQueue, DeviceApi, Error, QueueEvent, RetryConfig, Result, SetCommand, StatusRecord,
    Switch,
};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Records every send with its start and end time. Scripted outcomes are
/// consumed in order; once they run out every send succeeds.
#[derive(Default)]
struct RecordingDevice {
    outcomes: Mutex<VecDeque<Result<()>>>,
    sends: Mutex<Vec<(SetCommand, Instant, Instant)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    latency: Duration,
}

impl RecordingDevice {
    fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Default::default()
        }
    }

    fn script(self, outcomes: Vec<Result<()>>) -> Self {
        *self.outcomes.lock().unwrap() = outcomes.into();
        self
    }

    fn sent(&self) -> Vec<SetCommand> {
        self.sends.lock().unwrap().iter().map(|(c, _, _)| c.clone()).collect()
    }
}

#[async_trait]
impl DeviceApi for RecordingDevice {
    async fn update_state(&self) -> Result<StatusRecord> {
        Ok(StatusRecord::default())
    }

    async fn send_set_command(&self, command: &SetCommand) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let start = Instant::now();
        tokio::time::sleep(self.latency).await;
        let outcome = self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()));
        self.sends
            .lock()
            .unwrap()
            .push((command.clone(), start, Instant::now()));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    fn is_available(&self) -> bool {
        true
    }

    fn cleanup(&self) {}
}

fn power(on: bool) -> SetCommand {
    SetCommand {
        power: Some(Switch::from(on)),
        ..Default::default()
    }
}

fn target(celsius: f64) -> SetCommand {
    SetCommand {
        target_temperature: Some(celsius),
        ..Default::default()
    }
}

fn timeout() -> Error {
    Error::Timeout {
        seq: 1,
        after: Duration::from_millis(100),
    }
}

fn retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        delay_ms: 5,
        exponential: false,
    }
}

fn drain(events: &mut broadcast::Receiver<QueueEvent>) -> Vec<QueueEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn commands_run_in_order_without_overlap() {
    let device = Arc::new(RecordingDevice::with_latency(Duration::from_millis(20)));
    let queue = CommandQueue::new(device.clone(), retry(0));

    let first = queue.submit(power(true));
    let second = queue.submit(target(24.0));
    let third = queue.submit(power(false));
    assert!(first.id() < second.id() && second.id() < third.id());

    let (a, b, c) = tokio::join!(third.wait(), first.wait(), second.wait());
    a.unwrap();
    b.unwrap();
    c.unwrap();

    assert_eq!(device.sent(), vec![power(true), target(24.0), power(false)]);
    assert_eq!(device.max_in_flight.load(Ordering::SeqCst), 1);

    let sends = device.sends.lock().unwrap();
    for pair in sends.windows(2) {
        assert!(pair[0].2 <= pair[1].1, "next send started before previous ended");
    }
}

#[tokio::test]
async fn enqueue_while_busy_is_not_dropped() {
    let device = Arc::new(RecordingDevice::with_latency(Duration::from_millis(30)));
    let queue = Arc::new(CommandQueue::new(device.clone(), retry(0)));

    let busy = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.enqueue_command(power(true)).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    queue.enqueue_command(target(20.0)).await.unwrap();
    busy.await.unwrap().unwrap();

    assert_eq!(device.sent(), vec![power(true), target(20.0)]);
}

#[tokio::test]
async fn transient_failure_is_retried_then_executed() {
    let device = Arc::new(RecordingDevice::default().script(vec![Err(timeout())]));
    let queue = CommandQueue::new(device.clone(), retry(2));
    let mut events = queue.subscribe();

    queue.enqueue_command(power(true)).await.unwrap();

    assert_eq!(device.sent().len(), 2);
    let events = drain(&mut events);
    assert_eq!(events.len(), 2, "{events:?}");
    assert!(matches!(
        events[0],
        QueueEvent::Error {
            attempt: 1,
            will_retry: true,
            ..
        }
    ));
    assert!(matches!(events[1], QueueEvent::Executed { .. }));
    assert!(events[1].is_terminal());
    assert_eq!(events[0].id(), events[1].id());
}

#[tokio::test]
async fn exhausted_retries_emit_max_retries_reached() {
    let device = Arc::new(RecordingDevice::default().script(vec![
        Err(timeout()),
        Err(timeout()),
        Err(timeout()),
    ]));
    let queue = CommandQueue::new(device.clone(), retry(2));
    let mut events = queue.subscribe();

    let err = queue.enqueue_command(power(true)).await.unwrap_err();
    assert!(matches!(err, Error::QueueExhausted { attempts: 3 }), "got {err:?}");
    assert_eq!(device.sent().len(), 3);

    let events = drain(&mut events);
    let terminal: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminal.len(), 1, "{events:?}");
    assert!(matches!(
        terminal[0],
        QueueEvent::MaxRetriesReached { attempts: 3, .. }
    ));

    // The queue keeps going after a terminal failure.
    queue.enqueue_command(target(25.0)).await.unwrap();
}

#[tokio::test]
async fn non_transient_failure_is_not_retried() {
    let device = Arc::new(
        RecordingDevice::default().script(vec![Err(Error::Parse("garbage".to_string()))]),
    );
    let queue = CommandQueue::new(device.clone(), retry(3));
    let mut events = queue.subscribe();

    let err = queue.enqueue_command(power(true)).await.unwrap_err();
    assert!(matches!(err, Error::Parse(_)));
    assert_eq!(device.sent().len(), 1);

    let events = drain(&mut events);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0],
        QueueEvent::Error {
            will_retry: false,
            ..
        }
    ));
}

#[tokio::test]
async fn shutdown_rejects_queued_commands() {
    let device = Arc::new(RecordingDevice::with_latency(Duration::from_millis(50)));
    let queue = CommandQueue::new(device.clone(), retry(0));

    let first = queue.submit(power(true));
    let second = queue.submit(target(22.0));
    tokio::time::sleep(Duration::from_millis(10)).await;
    queue.shutdown();
    queue.shutdown();

    assert!(matches!(first.wait().await, Err(Error::Closed)));
    assert!(matches!(second.wait().await, Err(Error::Closed)));
    assert!(matches!(
        queue.enqueue_command(power(false)).await,
        Err(Error::Closed)
    ));
}
