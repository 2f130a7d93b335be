// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    ChangeEvent, ChannelConfig, ChannelMessage, ChannelStatus, PostgresChangeFilter,
    RealtimeChannel, RealtimeClient, RealtimeConfig,
    message::{EVENT_CLOSE, EVENT_ERROR, EVENT_LEAVE, EVENT_REPLY, Frame},
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn test_config() -> RealtimeConfig {
    RealtimeConfig {
        heartbeat_interval: Duration::from_secs(25),
        timeout: Duration::from_secs(60),
        retry_interval: Duration::from_millis(100),
        join_timeout: Duration::from_secs(10),
    }
}

async fn listen() -> (TcpListener, Url) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to random port.");
    let address = listener.local_addr().expect("Failed to get local address.");
    let url = format!("ws://{address}/realtime/v1/websocket?apikey=anon&vsn=1.0.0");
    (listener, url.parse().unwrap())
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = tokio::time::timeout(TIMEOUT, listener.accept())
        .await
        .expect("client did not connect")
        .unwrap();
    accept_async(stream).await.unwrap()
}

/// Next frame from the client, skipping heartbeats.
async fn recv_frame(ws: &mut WebSocketStream<TcpStream>) -> Frame {
    loop {
        let message = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .expect("no frame from client")
            .expect("client closed the connection")
            .unwrap();
        if let Message::Text(text) = message {
            let frame: Frame = serde_json::from_str(text.as_str()).unwrap();
            if frame.topic != "phoenix" {
                return frame;
            }
        }
    }
}

async fn send_frame(ws: &mut WebSocketStream<TcpStream>, frame: &Frame) {
    ws.send(Message::text(serde_json::to_string(frame).unwrap()))
        .await
        .unwrap();
}

async fn reply_ok(ws: &mut WebSocketStream<TcpStream>, join: &Frame) {
    let reply = Frame {
        topic: join.topic.clone(),
        event: EVENT_REPLY.to_owned(),
        payload: json!({ "status": "ok", "response": {} }),
        reference: join.reference.clone(),
        join_ref: join.join_ref.clone(),
    };
    send_frame(ws, &reply).await;
}

async fn next_message(channel: &mut RealtimeChannel) -> Option<ChannelMessage> {
    tokio::time::timeout(TIMEOUT, channel.next())
        .await
        .expect("no message on channel")
}

fn messages_config() -> ChannelConfig {
    ChannelConfig {
        postgres_changes: vec![PostgresChangeFilter::table("messages").event(ChangeEvent::Insert)],
        ..Default::default()
    }
}

#[tokio::test]
async fn join_and_receive_changes() {
    let _ = tracing_subscriber::fmt::try_init();
    let (listener, url) = listen().await;
    let client = RealtimeClient::connect_to(url, "token", test_config(), CancellationToken::new());
    let mut channel = client.channel("private-messages", messages_config());
    assert_eq!(channel.topic(), "realtime:private-messages");

    let mut ws = accept(&listener).await;
    let join = recv_frame(&mut ws).await;
    assert_eq!(join.event, "phx_join");
    assert_eq!(join.topic, "realtime:private-messages");
    assert_eq!(join.payload["access_token"], "token");
    assert_eq!(
        join.payload["config"]["postgres_changes"][0]["table"],
        "messages"
    );
    reply_ok(&mut ws, &join).await;

    assert_eq!(
        next_message(&mut channel).await,
        Some(ChannelMessage::Status(ChannelStatus::Subscribed))
    );

    let change = Frame {
        topic: join.topic.clone(),
        event: "postgres_changes".to_owned(),
        payload: json!({
            "data": {
                "schema": "public",
                "table": "messages",
                "commit_timestamp": "2025-03-01T10:00:00Z",
                "eventType": "INSERT",
                "new": { "content": "hello" },
                "old": {}
            }
        }),
        reference: None,
        join_ref: None,
    };
    send_frame(&mut ws, &change).await;

    match next_message(&mut channel).await {
        Some(ChannelMessage::PostgresChange(change)) => {
            assert_eq!(change.event, ChangeEvent::Insert);
            assert_eq!(change.new["content"], "hello");
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test]
async fn rejoin_after_connection_drop() {
    let _ = tracing_subscriber::fmt::try_init();
    let (listener, url) = listen().await;
    let client = RealtimeClient::connect_to(url, "token", test_config(), CancellationToken::new());
    let mut channel = client.channel("notifications", ChannelConfig::default());

    let mut ws = accept(&listener).await;
    let join = recv_frame(&mut ws).await;
    reply_ok(&mut ws, &join).await;
    assert_eq!(
        next_message(&mut channel).await,
        Some(ChannelMessage::Status(ChannelStatus::Subscribed))
    );

    // Server goes away
    drop(ws);
    assert_eq!(
        next_message(&mut channel).await,
        Some(ChannelMessage::Status(ChannelStatus::ChannelError))
    );

    // Client reconnects and rejoins on its own
    let mut ws = accept(&listener).await;
    let rejoin = recv_frame(&mut ws).await;
    assert_eq!(rejoin.event, "phx_join");
    assert_eq!(rejoin.topic, "realtime:notifications");
    assert_ne!(rejoin.reference, join.reference);
    reply_ok(&mut ws, &rejoin).await;
    assert_eq!(
        next_message(&mut channel).await,
        Some(ChannelMessage::Status(ChannelStatus::Subscribed))
    );
}

#[tokio::test]
async fn presence_is_tracked_after_join_and_channel_leaves_on_drop() {
    let _ = tracing_subscriber::fmt::try_init();
    let (listener, url) = listen().await;
    let client = RealtimeClient::connect_to(url, "token", test_config(), CancellationToken::new());
    let mut channel = client.channel("public", ChannelConfig::default());
    channel.track(json!({ "user_id": "resident-1" }));

    let mut ws = accept(&listener).await;
    let join = recv_frame(&mut ws).await;
    reply_ok(&mut ws, &join).await;
    assert_eq!(
        next_message(&mut channel).await,
        Some(ChannelMessage::Status(ChannelStatus::Subscribed))
    );

    let track = recv_frame(&mut ws).await;
    assert_eq!(track.event, "presence");
    assert_eq!(track.payload["event"], "track");
    assert_eq!(track.payload["payload"]["user_id"], "resident-1");

    drop(channel);
    let leave = recv_frame(&mut ws).await;
    assert_eq!(leave.event, EVENT_LEAVE);
    assert_eq!(leave.topic, "realtime:public");
    assert_eq!(leave.join_ref, join.join_ref);
    assert!(client.topics().is_empty());
}

#[tokio::test]
async fn replacing_a_channel_ends_the_previous_stream() {
    let (_listener, url) = listen().await;
    let client = RealtimeClient::connect_to(url, "token", test_config(), CancellationToken::new());

    let mut first = client.channel("public-chat", ChannelConfig::default());
    let _second = client.channel("public-chat", ChannelConfig::default());

    assert_eq!(next_message(&mut first).await, None);
    assert_eq!(client.topics(), vec!["realtime:public-chat".to_owned()]);

    // Dropping the replaced channel must not unregister its successor
    drop(first);
    assert_eq!(client.topics(), vec!["realtime:public-chat".to_owned()]);
}

#[tokio::test]
async fn leave_all_ends_every_channel() {
    let (listener, url) = listen().await;
    let client = RealtimeClient::connect_to(url, "token", test_config(), CancellationToken::new());
    let mut chat = client.channel("public-chat", ChannelConfig::default());

    let mut ws = accept(&listener).await;
    let join = recv_frame(&mut ws).await;
    reply_ok(&mut ws, &join).await;
    assert_eq!(
        next_message(&mut chat).await,
        Some(ChannelMessage::Status(ChannelStatus::Subscribed))
    );

    client.leave_all();
    assert!(client.topics().is_empty());
    assert_eq!(next_message(&mut chat).await, None);
    let leave = recv_frame(&mut ws).await;
    assert_eq!(leave.event, EVENT_LEAVE);
    assert_eq!(leave.join_ref, join.join_ref);
}

#[tokio::test]
async fn frames_of_a_replaced_join_are_dropped() {
    let _ = tracing_subscriber::fmt::try_init();
    let (listener, url) = listen().await;
    let client = RealtimeClient::connect_to(url, "token", test_config(), CancellationToken::new());
    let mut first = client.channel("public-chat", ChannelConfig::default());

    let mut ws = accept(&listener).await;
    let first_join = recv_frame(&mut ws).await;
    reply_ok(&mut ws, &first_join).await;
    assert_eq!(
        next_message(&mut first).await,
        Some(ChannelMessage::Status(ChannelStatus::Subscribed))
    );

    drop(first);
    let leave = recv_frame(&mut ws).await;
    assert_eq!(leave.event, EVENT_LEAVE);
    assert_eq!(leave.join_ref, first_join.join_ref);

    let mut second = client.channel("public-chat", ChannelConfig::default());
    let second_join = recv_frame(&mut ws).await;
    assert_eq!(second_join.event, "phx_join");
    assert_ne!(second_join.join_ref, first_join.join_ref);
    reply_ok(&mut ws, &second_join).await;
    assert_eq!(
        next_message(&mut second).await,
        Some(ChannelMessage::Status(ChannelStatus::Subscribed))
    );

    // The server acknowledges the leave of the first join
    for event in [EVENT_CLOSE, EVENT_ERROR] {
        let stale = Frame {
            topic: first_join.topic.clone(),
            event: event.to_owned(),
            payload: json!({}),
            reference: leave.reference.clone(),
            join_ref: first_join.join_ref.clone(),
        };
        send_frame(&mut ws, &stale).await;
    }
    let broadcast = Frame {
        topic: second_join.topic.clone(),
        event: "broadcast".to_owned(),
        payload: json!({ "event": "chat", "payload": { "text": "still here" } }),
        reference: None,
        join_ref: None,
    };
    send_frame(&mut ws, &broadcast).await;

    assert_eq!(
        next_message(&mut second).await,
        Some(ChannelMessage::Broadcast {
            event: "chat".to_owned(),
            payload: json!({ "text": "still here" }),
        })
    );

    // Frames of the current join still close the channel
    let close = Frame {
        topic: second_join.topic.clone(),
        event: EVENT_CLOSE.to_owned(),
        payload: json!({}),
        reference: None,
        join_ref: second_join.join_ref.clone(),
    };
    send_frame(&mut ws, &close).await;
    assert_eq!(
        next_message(&mut second).await,
        Some(ChannelMessage::Status(ChannelStatus::Closed))
    );
}
