//! Push notification manager against a scripted streaming backend.

use flagsync_engine::{
    feedback_channel, flags_queue, segments_queue, ConnectionState, FeedbackEvent,
    FeedbackReceiver, FlagUpdate, FlagsQueue, HttpFetchers, NotificationProcessor,
    PushNotificationManager, SegmentUpdate, SegmentsQueue, SyncConfig,
};
use flagsync_testkit::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;

struct Harness {
    http: Arc<FakeHttpClient>,
    push: PushNotificationManager,
    feedback: FeedbackReceiver,
    flags: FlagsQueue,
    segments: SegmentsQueue,
}

impl Harness {
    fn new(config: SyncConfig) -> Self {
        init_tracing();
        let http = Arc::new(FakeHttpClient::new());
        let fetchers = Arc::new(HttpFetchers::from_config(&config, http.clone()).unwrap());
        let (flags_tx, flags) = flags_queue();
        let (segments_tx, segments) = segments_queue();
        let (feedback_tx, feedback) = feedback_channel();
        let push = PushNotificationManager::new(
            &config,
            fetchers,
            http.clone(),
            NotificationProcessor::new(flags_tx, segments_tx),
            feedback_tx,
        )
        .unwrap();
        Self {
            http,
            push,
            feedback,
            flags,
            segments,
        }
    }

    fn standard() -> Self {
        Self::new(test_config("user-1"))
    }

    /// Scripts a successful auth and stream, starts, and waits for UP.
    async fn connect(&mut self) -> StreamFeeder {
        self.http.respond_ok(AUTH_PATH, auth_body(&standard_token()));
        let stream = self.http.open_stream();
        self.push.start();
        assert_eq!(self.next_feedback().await, FeedbackEvent::PushSubsystemUp);
        assert_eq!(self.push.state(), ConnectionState::Connected);
        stream
    }

    async fn next_feedback(&mut self) -> FeedbackEvent {
        tokio::time::timeout(Duration::from_secs(3600), self.feedback.recv())
            .await
            .expect("feedback within an hour")
            .expect("feedback channel open")
    }

    async fn assert_quiet(&mut self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(self.feedback.try_recv(), Err(TryRecvError::Empty));
    }
}

#[tokio::test(start_paused = true)]
async fn connects_with_token_channels() {
    let mut h = Harness::standard();
    let _stream = h.connect().await;

    let streams: Vec<_> = h
        .http
        .requests()
        .into_iter()
        .filter(|r| r.request.url.path() == STREAMING_PATH)
        .collect();
    assert_eq!(streams.len(), 1);
    let request = &streams[0].request;
    assert_eq!(request.header("content-type"), Some("text/event-stream"));

    let query: Vec<(String, String)> = request.url.query_pairs().into_owned().collect();
    assert!(query.contains(&("v".to_string(), "1.1".to_string())));
    assert!(query.contains(&("accessToken".to_string(), standard_token())));
    let channels = &query.iter().find(|(k, _)| k == "channel").unwrap().1;
    assert!(channels.contains(FLAGS_CHANNEL));
    assert!(channels.contains("[?occupancy=metrics.publishers]control_pri"));
}

#[tokio::test(start_paused = true)]
async fn keep_alive_timeout_reports_one_retryable_error() {
    let mut h = Harness::standard();
    let stream = h.connect().await;

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(stream.keep_alive());
    }
    let silent_since = Instant::now();

    assert_eq!(h.next_feedback().await, FeedbackEvent::PushRetryableError);
    assert!(silent_since.elapsed() >= Duration::from_secs(70));
    assert_eq!(h.push.state(), ConnectionState::Retrying);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.feedback.try_recv(), Err(TryRecvError::Empty));
    assert!(stream.is_closed());
}

#[tokio::test(start_paused = true)]
async fn pause_disconnects_silently_and_resume_reconnects() {
    let mut h = Harness::new(
        test_config("user-1").with_background_disconnect_delay(Duration::ZERO),
    );
    let first = h.connect().await;

    h.push.pause();
    assert_eq!(h.push.state(), ConnectionState::Disconnected);
    h.assert_quiet().await;
    assert!(first.is_closed());

    let _second = h.http.open_stream();
    h.push.resume();
    assert_eq!(h.next_feedback().await, FeedbackEvent::PushSubsystemUp);
    assert_eq!(h.http.requests_to(AUTH_PATH), 2);
    assert_eq!(h.http.requests_to(STREAMING_PATH), 2);
}

#[tokio::test(start_paused = true)]
async fn resume_before_background_delay_keeps_connection() {
    let mut h = Harness::standard();
    let stream = h.connect().await;

    h.push.pause();
    tokio::time::sleep(Duration::from_secs(30)).await;
    h.push.resume();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(h.push.state(), ConnectionState::Connected);
    assert!(!stream.is_closed());
    assert_eq!(h.http.requests_to(AUTH_PATH), 1);
    assert_eq!(h.feedback.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test(start_paused = true)]
async fn keep_alive_is_not_monitored_while_paused() {
    let mut h = Harness::standard();
    let stream = h.connect().await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    h.push.pause();
    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(h.feedback.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(h.push.state(), ConnectionState::Connected);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.feedback.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(h.push.state(), ConnectionState::Disconnected);
    assert!(stream.is_closed());

    let _second = h.http.open_stream();
    h.push.resume();
    assert_eq!(h.next_feedback().await, FeedbackEvent::PushSubsystemUp);
    assert_eq!(h.http.requests_to(AUTH_PATH), 2);
}

#[tokio::test(start_paused = true)]
async fn keep_alive_is_rearmed_on_resume() {
    let mut h = Harness::standard();
    let stream = h.connect().await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    h.push.pause();
    tokio::time::sleep(Duration::from_secs(30)).await;
    h.push.resume();
    let resumed_at = Instant::now();

    assert_eq!(h.next_feedback().await, FeedbackEvent::PushRetryableError);
    assert!(resumed_at.elapsed() >= Duration::from_secs(70));
    assert!(eventually(Duration::from_secs(1), || stream.is_closed()).await);
}

#[tokio::test(start_paused = true)]
async fn stream_loss_while_paused_is_silent() {
    let mut h = Harness::standard();
    let stream = h.connect().await;

    h.push.pause();
    stream.close();
    h.assert_quiet().await;
    assert_eq!(h.push.state(), ConnectionState::Disconnected);

    let _second = h.http.open_stream();
    h.push.resume();
    assert_eq!(h.next_feedback().await, FeedbackEvent::PushSubsystemUp);
}

#[tokio::test(start_paused = true)]
async fn token_refresh_waits_for_resume() {
    let mut h = Harness::new(
        test_config("user-1")
            .with_keep_alive_timeout(Duration::from_secs(10_000))
            .with_token_refresh_margin(Duration::from_secs(600)),
    );
    let first = h.connect().await;

    tokio::time::sleep(Duration::from_secs(2_990)).await;
    h.push.pause();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.feedback.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(h.http.requests_to(AUTH_PATH), 1);
    assert!(!first.is_closed());

    let _second = h.http.open_stream();
    h.push.resume();
    assert_eq!(h.next_feedback().await, FeedbackEvent::PushSubsystemUp);
    assert_eq!(h.http.requests_to(AUTH_PATH), 2);
    assert!(eventually(Duration::from_secs(1), || first.is_closed()).await);
}

#[tokio::test(start_paused = true)]
async fn start_while_paused_connects_on_resume() {
    let mut h = Harness::standard();
    h.http.respond_ok(AUTH_PATH, auth_body(&standard_token()));
    let _stream = h.http.open_stream();

    h.push.pause();
    h.push.start();
    h.assert_quiet().await;
    assert_eq!(h.http.requests_to(AUTH_PATH), 0);

    h.push.resume();
    assert_eq!(h.next_feedback().await, FeedbackEvent::PushSubsystemUp);
    assert_eq!(h.push.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn malformed_message_is_dropped() {
    let mut h = Harness::standard();
    let stream = h.connect().await;

    stream.send_block(["data:{not json"]);
    stream.send_block(["event:message", "data:{\"channel\":\"x_splits\"}"]);
    stream.send_block(flags_update(1000));

    assert_eq!(
        h.flags.recv().await,
        Some(FlagUpdate::Changed { change_number: 1000 })
    );
    assert_eq!(h.push.state(), ConnectionState::Connected);
    h.assert_quiet().await;
}

#[tokio::test(start_paused = true)]
async fn notifications_reach_their_queues() {
    let mut h = Harness::standard();
    let stream = h.connect().await;

    stream.send_block(flag_kill(12, "checkout", "off"));
    stream.send_block(segments_update(7, Some(&["beta"])));

    assert_eq!(
        h.flags.recv().await,
        Some(FlagUpdate::Killed {
            change_number: 12,
            flag_name: "checkout".to_string(),
            default_treatment: "off".to_string(),
        })
    );
    let SegmentUpdate {
        change_number,
        segments,
        ..
    } = h.segments.recv().await.unwrap();
    assert_eq!(change_number, Some(7));
    assert_eq!(segments, Some(vec!["beta".to_string()]));
}

#[tokio::test(start_paused = true)]
async fn occupancy_and_control_toggle_availability() {
    let mut h = Harness::standard();
    let stream = h.connect().await;

    stream.send_block(occupancy(CONTROL_PRI, 0));
    assert_eq!(h.next_feedback().await, FeedbackEvent::PushSubsystemDown);
    stream.send_block(occupancy(CONTROL_SEC, 0));
    stream.send_block(occupancy(CONTROL_PRI, 2));
    assert_eq!(h.next_feedback().await, FeedbackEvent::PushSubsystemUp);

    stream.send_block(control("STREAMING_PAUSED"));
    assert_eq!(h.next_feedback().await, FeedbackEvent::PushSubsystemDown);
    stream.send_block(control("STREAMING_RESUMED"));
    assert_eq!(h.next_feedback().await, FeedbackEvent::PushSubsystemUp);
    assert_eq!(h.push.state(), ConnectionState::Connected);

    stream.send_block(control("STREAMING_DISABLED"));
    assert_eq!(h.next_feedback().await, FeedbackEvent::PushSubsystemDown);
    assert_eq!(h.push.state(), ConnectionState::Disabled);

    h.push.start();
    h.assert_quiet().await;
    assert_eq!(h.http.requests_to(AUTH_PATH), 1);
}

#[tokio::test(start_paused = true)]
async fn streaming_error_events_are_classified() {
    let mut h = Harness::standard();
    let stream = h.connect().await;

    stream.send_block(error_event(40142, 401, "Token expired"));
    assert_eq!(h.next_feedback().await, FeedbackEvent::PushRetryableError);
    assert_eq!(h.push.state(), ConnectionState::Retrying);

    let stream = h.http.open_stream();
    h.push.start();
    assert_eq!(h.next_feedback().await, FeedbackEvent::PushSubsystemUp);

    stream.send_block(error_event(40003, 400, "Bad request"));
    assert_eq!(h.next_feedback().await, FeedbackEvent::PushNonRetryableError);
    assert_eq!(h.push.state(), ConnectionState::Disabled);
}

#[tokio::test(start_paused = true)]
async fn stream_status_decides_recoverability() {
    let mut h = Harness::standard();
    h.http.respond_ok(AUTH_PATH, auth_body(&standard_token()));
    h.http.reject_stream(503);
    h.push.start();
    assert_eq!(h.next_feedback().await, FeedbackEvent::PushRetryableError);

    h.http.reject_stream(401);
    h.push.start();
    assert_eq!(h.next_feedback().await, FeedbackEvent::PushNonRetryableError);
    assert_eq!(h.push.state(), ConnectionState::Disabled);
}

#[tokio::test(start_paused = true)]
async fn auth_outcomes_map_to_feedback() {
    let mut h = Harness::standard();
    h.http.respond(AUTH_PATH, 500, "");
    h.http.respond(AUTH_PATH, 200, auth_disabled_body());
    h.push.start();
    assert_eq!(h.next_feedback().await, FeedbackEvent::PushRetryableError);
    h.push.start();
    assert_eq!(h.next_feedback().await, FeedbackEvent::PushSubsystemDown);
    assert_eq!(h.push.state(), ConnectionState::Disabled);

    let mut h = Harness::standard();
    h.http.respond(AUTH_PATH, 401, "");
    h.push.start();
    assert_eq!(h.next_feedback().await, FeedbackEvent::PushNonRetryableError);

    let mut h = Harness::standard();
    h.http.respond_ok(AUTH_PATH, auth_body("not-a-token"));
    h.push.start();
    assert_eq!(h.next_feedback().await, FeedbackEvent::PushNonRetryableError);
}

#[tokio::test(start_paused = true)]
async fn token_is_refreshed_before_expiry() {
    let mut h = Harness::new(
        test_config("user-1")
            .with_keep_alive_timeout(Duration::from_secs(10_000))
            .with_token_refresh_margin(Duration::from_secs(600)),
    );
    let first = h.connect().await;
    let connected_at = Instant::now();
    let _second = h.http.open_stream();

    assert_eq!(h.next_feedback().await, FeedbackEvent::PushSubsystemUp);
    assert!(connected_at.elapsed() >= Duration::from_secs(3000));
    assert_eq!(h.http.requests_to(AUTH_PATH), 2);
    assert!(eventually(Duration::from_secs(1), || first.is_closed()).await);
    assert_eq!(h.push.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn stop_closes_stream_and_ignores_late_events() {
    let mut h = Harness::standard();
    let stream = h.connect().await;

    h.push.stop();
    h.push.stop();
    assert_eq!(h.push.state(), ConnectionState::Disconnected);
    stream.send_block(flags_update(5));
    h.assert_quiet().await;
    assert!(stream.is_closed());
    assert!(h.flags.try_recv().is_err());
}
