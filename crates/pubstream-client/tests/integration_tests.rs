//! Integration tests for pubstream-client
//!
//! These tests run the in-process stub broker and drive the client against it
//! over real HTTP connections, so framing is exercised across actual socket
//! reads rather than hand-built chunks.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pubstream_client::testing::{wait_for, ScriptEnd, ScriptedStream, StubBroker};
use pubstream_client::{
    ClientError, ClientHandle, ConnectionCredential, Dispatcher, DispatcherState, Message,
    NextFrame, PublishResult, PublishRoute, Publisher, RetryConfig, StreamReader,
    SubscribeRequest, TerminationReason, TlsVerification, WireFormat,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Helpers
// =============================================================================

type Inbox = Arc<Mutex<Vec<Message>>>;

fn inbox() -> (Inbox, impl FnMut(&Message) + Send + 'static) {
    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = messages.clone();
    (messages, move |m: &Message| sink.lock().unwrap().push(m.clone()))
}

fn ids(inbox: &Inbox) -> Vec<String> {
    inbox.lock().unwrap().iter().map(|m| m.id.clone()).collect()
}

fn fast_retry(attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts: attempts,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        backoff_multiplier: 2.0,
    }
}

async fn wait_for_state(rx: &mut watch::Receiver<DispatcherState>, state: DispatcherState) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for dispatcher state")
        .expect("dispatcher dropped");
}

fn line(id: &str, topic: &str, payload: &str) -> String {
    format!(
        "{{\"Id\":\"{}\",\"Topic\":\"{}\",\"Payload\":\"{}\",\"Timestamp\":0}}\n",
        id, topic, payload
    )
}

// =============================================================================
// Publish / Subscribe Round Trips
// =============================================================================

#[tokio::test]
async fn test_publish_reaches_ndjson_subscriber() {
    let broker = StubBroker::start().await.unwrap();
    let handle = broker.handle().unwrap();

    let (received, handler) = inbox();
    let mut dispatcher = Dispatcher::new().subscribe(["Test"], handler).unwrap();
    let mut state = dispatcher.watch_state();

    let cancel = CancellationToken::new();
    let run = {
        let handle = handle.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let request = SubscribeRequest::topics(["Test"]);
            dispatcher.run(&handle, &request, cancel).await
        })
    };

    wait_for_state(&mut state, DispatcherState::Streaming).await;

    let result = Publisher::new(handle).publish("Test", "hello").await.unwrap();
    let (message, broker_reference) = match result {
        PublishResult::Delivered {
            message,
            broker_reference,
        } => (message, broker_reference),
        other => panic!("expected delivery, got {:?}", other),
    };
    assert_eq!(broker_reference.as_deref(), Some(message.id.as_str()));

    assert!(
        wait_for(
            || {
                let received = received.clone();
                async move { !received.lock().unwrap().is_empty() }
            },
            Duration::from_secs(5)
        )
        .await
    );

    {
        let received = received.lock().unwrap();
        assert_eq!(received[0].topic, "Test");
        assert_eq!(received[0].payload, "hello");
        assert_eq!(received[0].id, message.id);
    }

    cancel.cancel();
    let reason = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(reason, TerminationReason::Cancelled));
}

#[tokio::test]
async fn test_topic_path_publish_reaches_sse_subscriber() {
    let broker = StubBroker::start().await.unwrap();
    let handle = broker.handle().unwrap();

    let (received, handler) = inbox();
    let mut dispatcher = Dispatcher::new().subscribe(["Test"], handler).unwrap();
    let mut state = dispatcher.watch_state();

    let cancel = CancellationToken::new();
    let run = {
        let handle = handle.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let request = SubscribeRequest::topic_path("Test").format(WireFormat::Sse);
            dispatcher.run(&handle, &request, cancel).await
        })
    };

    wait_for_state(&mut state, DispatcherState::Streaming).await;

    let result = Publisher::new(handle)
        .publish_to(PublishRoute::TopicPath, "Test", "via path")
        .await
        .unwrap();
    assert!(result.is_delivered());

    assert!(
        wait_for(
            || {
                let received = received.clone();
                async move { !received.lock().unwrap().is_empty() }
            },
            Duration::from_secs(5)
        )
        .await
    );
    assert_eq!(received.lock().unwrap()[0].payload, "via path");

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "Test");

    cancel.cancel();
    assert!(matches!(run.await.unwrap(), TerminationReason::Cancelled));
}

#[tokio::test]
async fn test_unsubscribed_topics_are_dropped() {
    let broker = StubBroker::start().await.unwrap();
    let handle = broker.handle().unwrap();

    let (received, handler) = inbox();
    let mut dispatcher = Dispatcher::new().subscribe(["Test"], handler).unwrap();
    let mut state = dispatcher.watch_state();

    let cancel = CancellationToken::new();
    let run = {
        let handle = handle.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let request = SubscribeRequest::topics(["Test", "Other"]);
            dispatcher.run(&handle, &request, cancel).await
        })
    };

    wait_for_state(&mut state, DispatcherState::Streaming).await;

    let publisher = Publisher::new(handle);
    publisher.publish("Other", "ignored").await.unwrap();
    publisher.publish("Test", "kept").await.unwrap();

    assert!(
        wait_for(
            || {
                let received = received.clone();
                async move { !received.lock().unwrap().is_empty() }
            },
            Duration::from_secs(5)
        )
        .await
    );

    cancel.cancel();
    run.await.unwrap();

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload, "kept");
}

#[tokio::test]
async fn test_broker_closing_stream_is_clean_shutdown() {
    let broker = StubBroker::start().await.unwrap();
    let handle = broker.handle().unwrap();

    let mut dispatcher = Dispatcher::new().subscribe(["Test"], |_| {}).unwrap();
    let mut state = dispatcher.watch_state();

    let run = tokio::spawn(async move {
        let request = SubscribeRequest::topics(["Test"]);
        let reason = dispatcher
            .run(&handle, &request, CancellationToken::new())
            .await;
        (reason, dispatcher.state())
    });

    wait_for_state(&mut state, DispatcherState::Streaming).await;
    broker.close_streams();

    let (reason, final_state) = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(reason, TerminationReason::CleanShutdown));
    assert_eq!(final_state, DispatcherState::Idle);
}

// =============================================================================
// Framing Over Real Connections
// =============================================================================

#[tokio::test]
async fn test_message_split_across_reads() {
    let broker = StubBroker::start().await.unwrap();
    let path = broker.script(
        "split",
        ScriptedStream::new([
            "{\"Id\":1,\"Topic\":\"T\",\"Payload\":\"a\",\"Timestamp\":0}\n{\"Id\":2,\"To",
            "pic\":\"T\",\"Payload\":\"b\",\"Timestamp\":0}\n",
        ]),
    );

    let handle = broker.handle().unwrap();
    let mut reader = StreamReader::open(
        &handle,
        &SubscribeRequest::path(path),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let mut ids = Vec::new();
    loop {
        match reader.next_frame().await {
            NextFrame::Message { message, .. } => ids.push(message.id),
            NextFrame::EndOfStream => break,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
    assert_eq!(ids, vec!["1", "2"]);
}

#[tokio::test]
async fn test_malformed_frame_does_not_end_stream() {
    let broker = StubBroker::start().await.unwrap();
    let path = broker.script(
        "malformed",
        ScriptedStream::new(["{not json}\n".to_string(), line("3", "T", "ok")]),
    );

    let handle = broker.handle().unwrap();
    let mut reader = StreamReader::open(
        &handle,
        &SubscribeRequest::path(path),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    match reader.next_frame().await {
        NextFrame::Malformed(err) => assert_eq!(err.raw_payload, "{not json}"),
        other => panic!("expected malformed frame, got {:?}", other),
    }
    match reader.next_frame().await {
        NextFrame::Message { message, .. } => assert_eq!(message.id, "3"),
        other => panic!("expected message, got {:?}", other),
    }
    assert!(matches!(reader.next_frame().await, NextFrame::EndOfStream));
}

#[tokio::test]
async fn test_sse_script_carries_event_metadata() {
    let broker = StubBroker::start().await.unwrap();
    let path = broker.script(
        "sse",
        ScriptedStream::new([
            ": keep-alive\n\n",
            "event: message\nid: 42\ndata: {\"Id\":\"7\",\"Topic\":\"T\",",
            "\"Payload\":\"x\"}\n\n",
        ])
        .format(WireFormat::Sse),
    );

    let handle = broker.handle().unwrap();
    let request = SubscribeRequest::path(path).format(WireFormat::Sse);
    let mut reader = StreamReader::open(&handle, &request, CancellationToken::new())
        .await
        .unwrap();

    match reader.next_frame().await {
        NextFrame::Message { message, meta } => {
            assert_eq!(message.id, "7");
            assert_eq!(message.timestamp, 0);
            assert_eq!(meta.event.as_deref(), Some("message"));
            assert_eq!(meta.id.as_deref(), Some("42"));
        }
        other => panic!("expected message, got {:?}", other),
    }
    assert!(matches!(reader.next_frame().await, NextFrame::EndOfStream));
}

#[tokio::test]
async fn test_dispatch_preserves_wire_order() {
    let broker = StubBroker::start().await.unwrap();
    let path = broker.script(
        "order",
        ScriptedStream::new([line("1", "A", "x"), line("2", "B", "y"), line("3", "A", "z")]),
    );

    let (a, mut a_handler) = inbox();
    let (b, mut b_handler) = inbox();
    let order = Arc::new(Mutex::new(Vec::new()));
    let (a_order, b_order) = (order.clone(), order.clone());

    let mut dispatcher = Dispatcher::new()
        .subscribe(["A"], move |m: &Message| {
            a_order.lock().unwrap().push(m.id.clone());
            a_handler(m);
        })
        .unwrap()
        .subscribe(["B"], move |m: &Message| {
            b_order.lock().unwrap().push(m.id.clone());
            b_handler(m);
        })
        .unwrap();

    let handle = broker.handle().unwrap();
    let reason = dispatcher
        .run(&handle, &SubscribeRequest::path(path), CancellationToken::new())
        .await;

    assert!(matches!(reason, TerminationReason::CleanShutdown));
    assert_eq!(*order.lock().unwrap(), vec!["1", "2", "3"]);
    assert_eq!(ids(&a), vec!["1", "3"]);
    assert_eq!(ids(&b), vec!["2"]);
}

// =============================================================================
// Termination
// =============================================================================

#[tokio::test]
async fn test_cancel_while_waiting_for_bytes() {
    let broker = StubBroker::start().await.unwrap();
    let path = broker.script(
        "silent",
        ScriptedStream::new(Vec::<&'static str>::new()).then(ScriptEnd::HoldOpen),
    );

    let handle = broker.handle().unwrap();
    let cancel = CancellationToken::new();
    let mut reader = StreamReader::open(&handle, &SubscribeRequest::path(path), cancel.clone())
        .await
        .unwrap();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let frame = tokio::time::timeout(Duration::from_secs(2), reader.next_frame())
        .await
        .expect("cancellation did not interrupt the read");
    assert!(matches!(frame, NextFrame::Cancelled));
    assert!(matches!(reader.next_frame().await, NextFrame::Cancelled));
}

#[tokio::test]
async fn test_aborted_connection_is_connection_lost() {
    let broker = StubBroker::start().await.unwrap();
    let path = broker.script(
        "abort",
        ScriptedStream::new([line("1", "Test", "before")]).then(ScriptEnd::Abort),
    );

    let (received, handler) = inbox();
    let mut dispatcher = Dispatcher::new().subscribe(["Test"], handler).unwrap();

    let handle = broker.handle().unwrap();
    let reason = dispatcher
        .run(&handle, &SubscribeRequest::path(path), CancellationToken::new())
        .await;

    assert!(matches!(reason, TerminationReason::ConnectionLost(_)));
    assert!(reason.is_retryable());
    assert_eq!(dispatcher.state(), DispatcherState::Failed);
    assert_eq!(ids(&received), vec!["1"]);
}

#[tokio::test]
async fn test_reconnect_keeps_delivering_until_cancelled() {
    let broker = StubBroker::start().await.unwrap();
    let path = broker.script(
        "flaky",
        ScriptedStream::new([line("1", "Test", "again")]).then(ScriptEnd::Abort),
    );

    let (received, handler) = inbox();
    let mut dispatcher = Dispatcher::new().subscribe(["Test"], handler).unwrap();

    let handle = broker.handle().unwrap();
    let cancel = CancellationToken::new();
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let request = SubscribeRequest::path(path);
            dispatcher
                .run_with_reconnect(&handle, &request, &fast_retry(3), cancel)
                .await
        })
    };

    assert!(
        wait_for(
            || {
                let received = received.clone();
                async move { received.lock().unwrap().len() >= 2 }
            },
            Duration::from_secs(5)
        )
        .await
    );

    cancel.cancel();
    let reason = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(reason, TerminationReason::Cancelled));
}

#[tokio::test]
async fn test_reconnect_gives_up_when_broker_is_gone() {
    let broker = StubBroker::start().await.unwrap();
    let handle = broker.handle().unwrap();
    broker.shutdown().await;

    let mut dispatcher = Dispatcher::new().subscribe(["Test"], |_| {}).unwrap();
    let reason = tokio::time::timeout(
        Duration::from_secs(5),
        dispatcher.run_with_reconnect(
            &handle,
            &SubscribeRequest::topics(["Test"]),
            &fast_retry(3),
            CancellationToken::new(),
        ),
    )
    .await
    .unwrap();

    assert!(matches!(
        reason,
        TerminationReason::ConnectionLost(ClientError::Transport(_))
    ));
}

#[tokio::test]
async fn test_reconnect_stops_on_missing_stream() {
    let broker = StubBroker::start().await.unwrap();
    let handle = broker.handle().unwrap();

    let mut dispatcher = Dispatcher::new().subscribe(["Test"], |_| {}).unwrap();
    let reason = tokio::time::timeout(
        Duration::from_secs(2),
        dispatcher.run_with_reconnect(
            &handle,
            &SubscribeRequest::path("scripts/missing"),
            &RetryConfig::infinite(),
            CancellationToken::new(),
        ),
    )
    .await
    .expect("reconnect kept retrying a 404");

    assert!(matches!(
        reason,
        TerminationReason::ConnectionLost(ClientError::Server { status: 404, .. })
    ));
    assert!(!reason.is_retryable());
    assert_eq!(dispatcher.state(), DispatcherState::Failed);
}

#[tokio::test]
async fn test_oversized_frame_is_not_reconnected() {
    let broker = StubBroker::start().await.unwrap();
    let path = broker.script(
        "oversized",
        ScriptedStream::new([line("1", "Test", "small"), "x".repeat(4096)])
            .then(ScriptEnd::HoldOpen),
    );

    let (received, handler) = inbox();
    let mut dispatcher = Dispatcher::new().subscribe(["Test"], handler).unwrap();

    let handle = broker.handle().unwrap();
    let request = SubscribeRequest::path(path).max_frame_bytes(1024);
    let reason = tokio::time::timeout(
        Duration::from_secs(2),
        dispatcher.run_with_reconnect(
            &handle,
            &request,
            &RetryConfig::infinite(),
            CancellationToken::new(),
        ),
    )
    .await
    .expect("oversized frame did not end the subscription");

    assert!(matches!(
        reason,
        TerminationReason::ConnectionLost(ClientError::FrameTooLarge { limit: 1024, .. })
    ));
    assert_eq!(ids(&received), vec!["1"]);
}

#[tokio::test]
async fn test_cancel_while_connecting() {
    // Accepts connections but never answers, so the request stays in flight
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let silent = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let handle = ClientHandle::configure(
        ConnectionCredential::basic("user", "secret"),
        &format!("http://{}", addr),
        TlsVerification::Enabled,
    )
    .unwrap();

    let mut dispatcher = Dispatcher::new().subscribe(["Test"], |_| {}).unwrap();
    let mut state = dispatcher.watch_state();

    let cancel = CancellationToken::new();
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let reason = dispatcher
                .run(&handle, &SubscribeRequest::topics(["Test"]), cancel)
                .await;
            (reason, dispatcher.state())
        })
    };

    wait_for_state(&mut state, DispatcherState::Connecting).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let (reason, final_state) = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("run did not return after cancellation")
        .unwrap();
    assert!(matches!(reason, TerminationReason::Cancelled));
    assert_eq!(final_state, DispatcherState::Idle);

    silent.abort();
}

// =============================================================================
// Credentials
// =============================================================================

#[tokio::test]
async fn test_wrong_credentials_reject_publish() {
    let broker = StubBroker::start_with_credentials("user", "secret")
        .await
        .unwrap();
    let handle = broker
        .handle_with(ConnectionCredential::basic("user", "wrong"))
        .unwrap();

    let result = Publisher::new(handle).publish("Test", "hello").await.unwrap();
    match &result {
        PublishResult::Rejected { status, .. } => assert_eq!(*status, 401),
        other => panic!("expected rejection, got {:?}", other),
    }
    assert!(matches!(
        result.into_result(),
        Err(ClientError::PublishRejected { status: 401, .. })
    ));
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn test_wrong_credentials_are_configuration_error_on_subscribe() {
    let broker = StubBroker::start_with_credentials("user", "secret")
        .await
        .unwrap();
    let handle = broker
        .handle_with(ConnectionCredential::basic("user", "wrong"))
        .unwrap();

    let mut dispatcher = Dispatcher::new().subscribe(["Test"], |_| {}).unwrap();
    let reason = dispatcher
        .run_with_reconnect(
            &handle,
            &SubscribeRequest::topics(["Test"]),
            &fast_retry(3),
            CancellationToken::new(),
        )
        .await;

    assert!(matches!(
        reason,
        TerminationReason::ConfigurationError(ClientError::Configuration(_))
    ));
    assert!(!reason.is_retryable());
}

#[tokio::test]
async fn test_matching_credentials_publish() {
    let broker = StubBroker::start_with_credentials("user", "secret")
        .await
        .unwrap();
    let handle = broker.handle().unwrap();

    let message = pubstream_client::publish(&handle, "Test", "hello")
        .await
        .unwrap()
        .into_result()
        .unwrap();

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].id, message.id);
    assert_eq!(published[0].payload, "hello");
}

// =============================================================================
// Request Options
// =============================================================================

#[tokio::test]
async fn test_exclusive_subscription_sends_header() {
    let broker = StubBroker::start().await.unwrap();
    let handle = broker.handle().unwrap();

    let request = SubscribeRequest::topic_path("Test").exclusive(true);
    let reader = StreamReader::open(&handle, &request, CancellationToken::new())
        .await
        .unwrap();

    assert!(reader.is_open());
    assert_eq!(broker.exclusive_subscriptions(), 1);
    assert_eq!(broker.subscriber_count(), 1);
}

#[tokio::test]
async fn test_publish_with_retry_reports_transport_failure() {
    let broker = StubBroker::start().await.unwrap();
    let handle = broker.handle().unwrap();
    broker.shutdown().await;

    let err = Publisher::new(handle)
        .publish_with_retry(PublishRoute::Broadcast, "Test", "hello", &fast_retry(2))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Transport(_)));
    assert!(err.is_retryable());
}
