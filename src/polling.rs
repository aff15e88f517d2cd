use tokio::time::{interval_at, Duration, Instant, Interval, MissedTickBehavior};

use crate::command::Command;
use crate::session::ProtocolSession;

/// Shortest period the scheduler accepts. Shorter ones, zero included, are raised to it.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Issues the read cycle on a fixed period.
///
/// Ticks only queue the writes and never wait for them or for responses. A command
/// that cannot be queued is reported to the session's error handlers and the rest
/// of the cycle still goes out. Dropping the scheduler cancels the timer.
#[derive(Debug)]
pub struct PollingScheduler {
    interval: Interval,
    period: Duration,
}

impl PollingScheduler {
    /// The first tick fires one `period` from now.
    pub fn new(period: Duration) -> Self {
        let period = period.max(MIN_PERIOD);
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval, period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn cycle(&self) -> &'static [Command] {
        &Command::POLL_CYCLE
    }

    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }

    /// Restart the period, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.interval.reset();
    }

    /// Queue one cycle. Returns how many commands could not be queued.
    pub fn poll(&self, session: &mut ProtocolSession) -> usize {
        let mut failures = 0;
        for command in self.cycle() {
            if let Err(err) = session.issue(command.code()) {
                tracing::warn!(command = ?command, %err, "poll failed");
                session.bus_mut().report(&err);
                failures += 1;
            }
        }
        failures
    }
}

#[tokio::test(start_paused = true)]
async fn test_zero_period_is_raised_to_the_minimum() {
    let start = Instant::now();
    let mut poller = PollingScheduler::new(Duration::ZERO);
    assert_eq!(poller.period(), MIN_PERIOD);

    poller.tick().await;
    poller.tick().await;
    assert!(start.elapsed() >= 2 * MIN_PERIOD);
    assert!(start.elapsed() < Duration::from_millis(10));
}

#[tokio::test(start_paused = true)]
async fn test_first_tick_comes_one_period_after_start() {
    let start = Instant::now();
    let mut poller = PollingScheduler::new(Duration::from_millis(1000));
    poller.tick().await;
    assert!(start.elapsed() >= Duration::from_millis(1000));
    assert!(start.elapsed() < Duration::from_millis(1010));
}

#[tokio::test]
async fn test_poll_reports_commands_that_cannot_be_queued() {
    let errors = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut bus = crate::event_bus::EventBus::new();
    let sink = errors.clone();
    bus.on_error(move |err| sink.lock().unwrap().push(err.clone()));
    let mut session = ProtocolSession::new(bus, Duration::from_secs(5));

    let poller = PollingScheduler::new(Duration::from_millis(1000));
    assert_eq!(poller.poll(&mut session), Command::POLL_CYCLE.len());
    assert_eq!(
        *errors.lock().unwrap(),
        vec![crate::error::BmsError::NotStarted; Command::POLL_CYCLE.len()]
    );
}
