mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{concat, response, MockConnector, PACK, SOC, TEMPERATURE};
use dalyread::{BmsClient, BmsError, ClientConfig, ReconnectPolicy, SessionState, TelemetryKind};
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};

fn client(connector: &MockConnector) -> BmsClient<MockConnector> {
    BmsClient::new(connector.clone(), ClientConfig::default())
}

fn record_errors(client: &mut BmsClient<MockConnector>) -> Arc<Mutex<Vec<BmsError>>> {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    client.on_error(move |err| sink.lock().unwrap().push(err.clone()));
    errors
}

#[tokio::test(start_paused = true)]
async fn publishes_notifications_until_shutdown() {
    let connector = MockConnector::new(&[true]);
    let mut client = client(&connector);
    let seen = Arc::new(Mutex::new(Vec::new()));
    for kind in TelemetryKind::ALL {
        let seen = seen.clone();
        client.subscribe(kind, move |event| seen.lock().unwrap().push(event.command));
    }
    let mut state = client.watch_state();
    let (stop, shutdown) = oneshot::channel();

    let (result, ()) = tokio::join!(client.run(shutdown), async {
        state.wait_for(|s| *s == SessionState::Connected).await.unwrap();
        let buffer = concat(&[response(0x90, SOC), response(0x94, PACK), response(0x92, TEMPERATURE)]);
        connector.sender().send(Ok(buffer)).await.unwrap();
        sleep(Duration::from_millis(10)).await;
        stop.send(()).unwrap();
    });

    assert_eq!(result, Ok(()));
    assert_eq!(*seen.lock().unwrap(), vec![0x90, 0x94, 0x92]);
    assert_eq!(client.state(), SessionState::Disconnected);
    assert!(!client.is_started());
    assert_eq!(connector.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn polls_the_read_cycle_every_period() {
    let connector = MockConnector::new(&[true]);
    let mut client = client(&connector);
    let mut state = client.watch_state();
    let (stop, shutdown) = oneshot::channel();

    let (result, ()) = tokio::join!(client.run(shutdown), async {
        state.wait_for(|s| *s == SessionState::Connected).await.unwrap();
        sleep(Duration::from_millis(2500)).await;
        stop.send(()).unwrap();
    });

    assert_eq!(result, Ok(()));
    assert_eq!(
        connector.writer.commands(),
        vec![0x90, 0x93, 0x94, 0x92, 0x90, 0x93, 0x94, 0x92]
    );
}

#[tokio::test(start_paused = true)]
async fn failed_writes_are_reported_and_polling_goes_on() {
    let connector = MockConnector::new(&[true]);
    connector.writer.fail.store(true, Ordering::SeqCst);
    let mut client = client(&connector);
    let errors = record_errors(&mut client);
    let mut state = client.watch_state();
    let (stop, shutdown) = oneshot::channel();

    let (result, ()) = tokio::join!(client.run(shutdown), async {
        state.wait_for(|s| *s == SessionState::Connected).await.unwrap();
        sleep(Duration::from_millis(1500)).await;
        connector.writer.fail.store(false, Ordering::SeqCst);
        sleep(Duration::from_millis(1000)).await;
        stop.send(()).unwrap();
    });

    assert_eq!(result, Ok(()));
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 4);
    assert!(errors.iter().all(|e| matches!(e, BmsError::TransportWrite(_))));
    assert_eq!(connector.writer.commands(), vec![0x90, 0x93, 0x94, 0x92]);
}

#[tokio::test(start_paused = true)]
async fn stuck_writes_do_not_block_the_loop() {
    let connector = MockConnector::new(&[true]);
    connector.writer.hang.store(true, Ordering::SeqCst);
    let mut client = client(&connector);
    let errors = record_errors(&mut client);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    client.subscribe(TelemetryKind::PackStatus, move |event| {
        sink.lock().unwrap().push(event.command)
    });
    let mut state = client.watch_state();
    let (stop, shutdown) = oneshot::channel();
    let mut stopped_at = None;

    let (result, ()) = tokio::join!(client.run(shutdown), async {
        state.wait_for(|s| *s == SessionState::Connected).await.unwrap();
        // the first cycle is queued at 1000 ms and its first write never completes
        sleep(Duration::from_millis(1100)).await;
        connector.sender().send(Ok(concat(&[response(0x94, PACK)]))).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(*seen.lock().unwrap(), vec![0x94]);

        // the stuck write times out at 6000 ms and is reported while the loop runs on
        sleep(Duration::from_millis(5300)).await;
        stopped_at = Some(Instant::now());
        stop.send(()).unwrap();
    });

    assert_eq!(result, Ok(()));
    assert!(stopped_at.unwrap().elapsed() < Duration::from_millis(10));
    assert!(connector.writer.commands().is_empty());
    assert!(errors
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, BmsError::TransportWrite(msg) if msg.contains("timed out"))));
    assert_eq!(client.state(), SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn initial_connect_failure_is_not_retried() {
    let connector = MockConnector::new(&[false, true]);
    let mut client = client(&connector);
    let errors = record_errors(&mut client);
    let (_stop, shutdown) = oneshot::channel();

    let result = client.run(shutdown).await;
    sleep(Duration::from_secs(10)).await;

    assert!(matches!(result, Err(BmsError::ConnectFailure(_))));
    assert_eq!(connector.attempts(), 1);
    assert_eq!(client.state(), SessionState::Disconnected);
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_five_failed_reconnects() {
    let connector = MockConnector::new(&[true, false, false, false, false, false, true]);
    let mut client = client(&connector);
    let errors = record_errors(&mut client);
    let mut state = client.watch_state();
    let (_stop, shutdown) = oneshot::channel();

    let (result, ()) = tokio::join!(client.run(shutdown), async {
        state.wait_for(|s| *s == SessionState::Connected).await.unwrap();
        connector.drop_links();
    });

    assert_eq!(result, Err(BmsError::RetriesExhausted { attempts: 5 }));
    // one initial connect plus five retries, the sixth retry never happens
    assert_eq!(connector.attempts(), 6);
    sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.attempts(), 6);
    assert_eq!(client.state(), SessionState::Disconnected);

    // the lost link, each failed attempt, then giving up
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 7);
    assert!(matches!(errors[0], BmsError::UnexpectedDisconnect(_)));
    assert!(errors[1..6].iter().all(|e| matches!(e, BmsError::ConnectFailure(_))));
    assert_eq!(errors[6], BmsError::RetriesExhausted { attempts: 5 });
}

#[tokio::test(start_paused = true)]
async fn hung_reconnect_attempts_time_out_and_use_up_the_budget() {
    let connector = MockConnector::new(&[true]);
    let mut client = client(&connector);
    let errors = record_errors(&mut client);
    let mut state = client.watch_state();
    let (_stop, shutdown) = oneshot::channel();
    let start = Instant::now();

    let (result, ()) = tokio::join!(client.run(shutdown), async {
        state.wait_for(|s| *s == SessionState::Connected).await.unwrap();
        connector.hang.store(true, Ordering::SeqCst);
        connector.drop_links();
    });

    assert_eq!(result, Err(BmsError::RetriesExhausted { attempts: 5 }));
    assert_eq!(connector.attempts(), 6);
    let policy = ReconnectPolicy::default();
    assert!(start.elapsed() >= (policy.delay + policy.connect_timeout) * 5);

    let errors = errors.lock().unwrap();
    let timeouts = errors.iter().filter(|e| matches!(e, BmsError::ConnectFailure(_))).count();
    assert_eq!(timeouts, 5);
}

#[tokio::test(start_paused = true)]
async fn shutdown_abandons_a_hung_reconnect_attempt() {
    let connector = MockConnector::new(&[true]);
    let mut client = client(&connector);
    let mut state = client.watch_state();
    let (stop, shutdown) = oneshot::channel();
    let mut stopped_at = None;

    let (result, ()) = tokio::join!(client.run(shutdown), async {
        state.wait_for(|s| *s == SessionState::Connected).await.unwrap();
        connector.hang.store(true, Ordering::SeqCst);
        connector.drop_links();
        while connector.attempts() < 2 {
            sleep(Duration::from_millis(100)).await;
        }
        stopped_at = Some(Instant::now());
        stop.send(()).unwrap();
    });

    assert_eq!(result, Ok(()));
    assert!(stopped_at.unwrap().elapsed() < Duration::from_millis(10));
    assert_eq!(connector.attempts(), 2);
    assert_eq!(client.state(), SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn reconnects_and_resumes_publishing() {
    let connector = MockConnector::new(&[true, false, true]);
    let mut client = client(&connector);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    client.subscribe(TelemetryKind::PackStatus, move |event| {
        sink.lock().unwrap().push(event.command)
    });
    let mut state = client.watch_state();
    let (stop, shutdown) = oneshot::channel();

    let (result, ()) = tokio::join!(client.run(shutdown), async {
        state.wait_for(|s| *s == SessionState::Connected).await.unwrap();
        connector.drop_links();
        state.wait_for(|s| *s == SessionState::Reconnecting).await.unwrap();
        state.wait_for(|s| *s == SessionState::Connected).await.unwrap();
        connector.sender().send(Ok(concat(&[response(0x94, PACK)]))).await.unwrap();
        sleep(Duration::from_millis(10)).await;
        stop.send(()).unwrap();
    });

    assert_eq!(result, Ok(()));
    assert_eq!(connector.attempts(), 3);
    assert_eq!(*seen.lock().unwrap(), vec![0x94]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_a_pending_reconnect() {
    let connector = MockConnector::new(&[true]);
    let mut client = client(&connector);
    let mut state = client.watch_state();
    let (stop, shutdown) = oneshot::channel();

    let (result, ()) = tokio::join!(client.run(shutdown), async {
        state.wait_for(|s| *s == SessionState::Connected).await.unwrap();
        connector.drop_links();
        state.wait_for(|s| *s == SessionState::Reconnecting).await.unwrap();
        stop.send(()).unwrap();
    });

    assert_eq!(result, Ok(()));
    assert_eq!(connector.attempts(), 1);
    assert_eq!(client.state(), SessionState::Disconnected);
    sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn fetch_once_reads_each_polled_command() {
    let connector = MockConnector::new(&[true]);
    let mut client = client(&connector);

    let (result, ()) = tokio::join!(client.fetch_once(), async {
        // answer each request as it is written
        for (command, payload) in [(0x90, SOC), (0x93, common::MOSFET), (0x94, PACK), (0x92, TEMPERATURE)] {
            while connector.writer.commands().last() != Some(&command) {
                tokio::task::yield_now().await;
            }
            connector.sender().send(Ok(concat(&[response(command, payload)]))).await.unwrap();
        }
    });

    let commands: Vec<u8> = result.unwrap().iter().map(|e| e.command).collect();
    assert_eq!(commands, vec![0x90, 0x93, 0x94, 0x92]);
    assert_eq!(client.state(), SessionState::Disconnected);
    assert_eq!(connector.disconnects.load(Ordering::SeqCst), 1);
}
