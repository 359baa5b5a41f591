use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::backoff::ExponentialBackoff;
use super::polling::fetch_snapshot;
use super::stomp::{self, Frame};
use super::{PresenceStrategy, Shutdown};
use crate::api::{ApiClient, ApiError};
use crate::models::{PresenceState, PresenceUpdate, UserId};
use crate::utils::truncate_string;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SeedFetch<'a> = BoxFuture<'a, Result<BTreeSet<UserId>, ApiError>>;

const SUBSCRIPTION_ID: &str = "sub-0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSettings {
    /// `ws(s)://host/ws`. The token travels in the CONNECT frame, never in this URL.
    pub endpoint: String,
    pub topic: String,
    /// Announce destination sent once per connect, if any
    pub connect_destination: Option<String>,
    pub activity_destination: String,
    pub activity_interval: Duration,
    /// Seed the online set with one REST fetch after each connect
    pub seed_snapshot: bool,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:8080/ws".to_string(),
            topic: "/topic/presence".to_string(),
            connect_destination: Some("/app/presence/connect".to_string()),
            activity_destination: "/app/presence/activity".to_string(),
            activity_interval: Duration::from_secs(30),
            seed_snapshot: true,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

enum SessionEnd {
    Stopped,
    Lost(String),
}

/// STOMP subscription to the presence topic with reconnect backoff.
pub struct SubscriptionStrategy {
    client: ApiClient,
    settings: SubscriptionSettings,
    host: String,
}

impl SubscriptionStrategy {
    pub fn new(client: ApiClient, settings: SubscriptionSettings) -> Self {
        let host = reqwest::Url::parse(&settings.endpoint)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            client,
            settings,
            host,
        }
    }

    async fn send(socket: &mut Socket, frame: Frame) -> Result<(), String> {
        socket
            .send(Message::Text(frame.encode()))
            .await
            .map_err(|e| format!("Failed to send {} frame: {}", frame.command, e))
    }

    /// One socket lifetime: connect, subscribe, pump frames until closed or stopped.
    async fn session(
        &self,
        token: &str,
        state: &watch::Sender<PresenceState>,
        backoff: &mut ExponentialBackoff,
        shutdown: &Shutdown,
    ) -> SessionEnd {
        debug!(url = %self.settings.endpoint, "Opening presence socket");
        let mut socket = tokio::select! {
            _ = shutdown.wait() => return SessionEnd::Stopped,
            result = connect_async(self.settings.endpoint.as_str()) => match result {
                Ok((socket, _)) => socket,
                Err(e) => return SessionEnd::Lost(format!("WebSocket connect failed: {}", e)),
            },
        };

        if let Err(e) = Self::send(&mut socket, Frame::connect(&self.host, Some(token), 0)).await {
            return SessionEnd::Lost(e);
        }

        let mut activity: Option<Interval> = None;
        // Polled alongside the socket so a slow fetch never blocks frames or shutdown
        let mut seed: Option<SeedFetch<'_>> = None;
        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    let _ = Self::send(&mut socket, Frame::disconnect("disconnect-0")).await;
                    let _ = socket.close(None).await;
                    return SessionEnd::Stopped;
                }
                result = seeded(&mut seed) => {
                    seed = None;
                    match result {
                        Ok(online) => state.send_modify(|s| s.online = online),
                        Err(e) => warn!(error = %e, "Initial presence fetch failed"),
                    }
                }
                _ = tick(&mut activity) => {
                    let body = serde_json::json!({ "ts": chrono::Utc::now().timestamp_millis() });
                    let frame = Frame::send_json(&self.settings.activity_destination, &body);
                    if let Err(e) = Self::send(&mut socket, frame).await {
                        return SessionEnd::Lost(e);
                    }
                }
                message = socket.next() => {
                    let text = match message {
                        None => return SessionEnd::Lost("Presence socket closed".to_string()),
                        Some(Err(e)) => return SessionEnd::Lost(format!("Presence socket error: {}", e)),
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                            return SessionEnd::Lost(format!("Presence socket closed by server: {}", reason));
                        }
                        Some(Ok(_)) => continue,
                    };

                    let frame = match Frame::decode(&text) {
                        Ok(Some(frame)) => frame,
                        Ok(None) => continue,
                        Err(e) => {
                            warn!(error = %e, "Ignoring malformed STOMP frame");
                            continue;
                        }
                    };

                    match frame.command.as_str() {
                        stomp::CONNECTED => {
                            if let Err(e) = self.on_connected(&mut socket, state, backoff).await {
                                return SessionEnd::Lost(e);
                            }
                            let period = self.settings.activity_interval.max(Duration::from_millis(1));
                            let mut ticker = interval_at(Instant::now() + period, period);
                            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                            activity = Some(ticker);
                            if self.settings.seed_snapshot {
                                seed = Some(fetch_snapshot(&self.client).boxed());
                            }
                        }
                        stomp::MESSAGE => match serde_json::from_str::<PresenceUpdate>(&frame.body) {
                            Ok(update) => {
                                debug!(kind = %update.kind, "Presence update");
                                state.send_modify(|s| s.apply_update(update));
                            }
                            Err(e) => warn!(
                                error = %e,
                                body = %truncate_string(&frame.body, 200),
                                "Ignoring unparseable presence message"
                            ),
                        },
                        stomp::ERROR => {
                            let message = frame
                                .header("message")
                                .map(str::to_string)
                                .unwrap_or_else(|| frame.body.clone());
                            warn!(server_message = %message, "STOMP error frame");
                            state.send_modify(|s| s.error = Some(message));
                        }
                        other => debug!(command = other, "Ignoring STOMP frame"),
                    }
                }
            }
        }
    }

    async fn on_connected(
        &self,
        socket: &mut Socket,
        state: &watch::Sender<PresenceState>,
        backoff: &mut ExponentialBackoff,
    ) -> Result<(), String> {
        backoff.reset();
        state.send_modify(|s| {
            s.connected = true;
            s.error = None;
        });
        info!(url = %self.settings.endpoint, "Presence subscription connected");

        Self::send(socket, Frame::subscribe(SUBSCRIPTION_ID, &self.settings.topic)).await?;
        if let Some(ref destination) = self.settings.connect_destination {
            Self::send(socket, Frame::send_json(destination, &serde_json::json!({}))).await?;
        }
        Ok(())
    }
}

async fn seeded(seed: &mut Option<SeedFetch<'_>>) -> Result<BTreeSet<UserId>, ApiError> {
    match seed {
        Some(fetch) => fetch.await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[async_trait]
impl PresenceStrategy for SubscriptionStrategy {
    fn mode(&self) -> &'static str {
        "subscription"
    }

    async fn run(&self, state: watch::Sender<PresenceState>, shutdown: Shutdown) {
        let mut backoff = ExponentialBackoff::new(self.settings.backoff_base, self.settings.backoff_max);

        loop {
            // Read per attempt so reconnects pick up a renewed token
            let Some(token) = self.client.store().token() else {
                debug!("No access token, presence subscription idle");
                break;
            };

            match self.session(&token, &state, &mut backoff, &shutdown).await {
                SessionEnd::Stopped => break,
                SessionEnd::Lost(reason) => {
                    state.send_modify(|s| s.mark_failed(reason.clone()));
                    if shutdown.is_triggered() {
                        break;
                    }
                    let delay = backoff.next_delay();
                    info!(
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Presence connection lost, reconnecting"
                    );
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }

        state.send_modify(|s| s.connected = false);
        debug!("Presence subscription stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::{Arc, Mutex};

    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    use super::*;
    use crate::api::paths;
    use crate::auth::{CredentialRecord, RefreshSettings};
    use crate::models::UserId;
    use crate::presence::{PresenceMode, PresenceTracker};
    use crate::testing::{harness, json_response, profile, Harness, ScriptedTransport};

    type ServerSocket = WebSocketStream<TcpStream>;

    const WAIT: Duration = Duration::from_secs(5);

    fn set(ids: &[&str]) -> BTreeSet<UserId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn logged_in() -> Harness {
        let transport = Arc::new(ScriptedTransport::new(|req| match req.path.as_str() {
            paths::PRESENCE => Ok(json_response(200, r#"{"online":["u0"]}"#)),
            _ => Ok(json_response(404, "")),
        }));
        let h = harness(transport, RefreshSettings::default());
        h.store.set(&CredentialRecord::new("T1", profile("a@b.com"))).expect("set");
        h
    }

    fn settings(addr: std::net::SocketAddr) -> SubscriptionSettings {
        SubscriptionSettings {
            endpoint: format!("ws://{}/ws", addr),
            connect_destination: None,
            seed_snapshot: false,
            backoff_base: Duration::from_millis(20),
            backoff_max: Duration::from_millis(100),
            ..SubscriptionSettings::default()
        }
    }

    fn start(h: &Harness, settings: SubscriptionSettings) -> PresenceTracker {
        PresenceTracker::start(PresenceMode::Subscription(settings), h.client.clone())
    }

    async fn accept(listener: &TcpListener) -> ServerSocket {
        let (stream, _) = timeout(WAIT, listener.accept()).await.expect("client connects").expect("accept");
        tokio_tungstenite::accept_async(stream).await.expect("handshake")
    }

    async fn read_frame(ws: &mut ServerSocket) -> Frame {
        loop {
            let message = timeout(WAIT, ws.next())
                .await
                .expect("frame in time")
                .expect("socket open")
                .expect("read");
            if let Message::Text(text) = message {
                if let Some(frame) = Frame::decode(&text).expect("valid frame") {
                    return frame;
                }
            }
        }
    }

    async fn send_frame(ws: &mut ServerSocket, frame: Frame) {
        ws.send(Message::Text(frame.encode())).await.expect("send");
    }

    fn connected() -> Frame {
        Frame::new(stomp::CONNECTED).with_header("version", "1.2")
    }

    fn presence_message(body: &str) -> Frame {
        Frame::new(stomp::MESSAGE)
            .with_header("destination", "/topic/presence")
            .with_header("subscription", SUBSCRIPTION_ID)
            .with_body(body)
    }

    /// Accept, answer CONNECTED and consume the SUBSCRIBE that follows
    async fn handshake(listener: &TcpListener) -> ServerSocket {
        let mut ws = accept(listener).await;
        assert_eq!(read_frame(&mut ws).await.command, stomp::CONNECT);
        send_frame(&mut ws, connected()).await;
        assert_eq!(read_frame(&mut ws).await.command, stomp::SUBSCRIBE);
        ws
    }

    async fn read_until_disconnect(ws: &mut ServerSocket) {
        loop {
            if read_frame(ws).await.command == stomp::DISCONNECT {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_connect_subscribe_and_replace() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let h = logged_in();
        let tracker = start(
            &h,
            SubscriptionSettings {
                connect_destination: Some("/app/presence/connect".to_string()),
                seed_snapshot: true,
                ..settings(listener.local_addr().expect("addr"))
            },
        );
        let mut rx = tracker.subscribe();

        let (stream, _) = timeout(WAIT, listener.accept()).await.expect("connects").expect("accept");
        let uri = Arc::new(Mutex::new(String::new()));
        let seen_uri = uri.clone();
        let mut ws = tokio_tungstenite::accept_hdr_async(
            stream,
            move |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
                *seen_uri.lock().expect("lock") = req.uri().to_string();
                Ok(response)
            },
        )
        .await
        .expect("handshake");
        assert_eq!(uri.lock().expect("lock").as_str(), "/ws");

        let connect = read_frame(&mut ws).await;
        assert_eq!(connect.command, stomp::CONNECT);
        assert_eq!(connect.header("Authorization"), Some("Bearer T1"));
        assert_eq!(connect.header("accept-version"), Some("1.2"));
        send_frame(&mut ws, connected()).await;

        let subscribe = read_frame(&mut ws).await;
        assert_eq!(subscribe.command, stomp::SUBSCRIBE);
        assert_eq!(subscribe.header("destination"), Some("/topic/presence"));
        let announce = read_frame(&mut ws).await;
        assert_eq!(announce.command, stomp::SEND);
        assert_eq!(announce.header("destination"), Some("/app/presence/connect"));
        assert_eq!(announce.body, "{}");

        timeout(WAIT, rx.wait_for(|s| s.connected && s.online == set(&["u0"])))
            .await
            .expect("seeded")
            .expect("open");

        send_frame(&mut ws, presence_message(r#"{"type":"PRESENCE_UPDATE","online":["u1","u2"]}"#)).await;
        timeout(WAIT, rx.wait_for(|s| s.online == set(&["u1", "u2"])))
            .await
            .expect("first update")
            .expect("open");

        send_frame(
            &mut ws,
            presence_message(r#"{"type":"PRESENCE_UPDATE","left":["u1"],"online":["u2"]}"#),
        )
        .await;
        timeout(WAIT, rx.wait_for(|s| s.online == set(&["u2"])))
            .await
            .expect("second update")
            .expect("open");

        let stopping = tokio::spawn(tracker.stop());
        read_until_disconnect(&mut ws).await;
        timeout(WAIT, stopping).await.expect("stopped").expect("join");
        assert!(!rx.borrow().connected);
    }

    #[tokio::test]
    async fn test_reconnects_after_server_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let h = logged_in();
        let tracker = start(&h, settings(listener.local_addr().expect("addr")));
        let mut rx = tracker.subscribe();

        let ws = handshake(&listener).await;
        timeout(WAIT, rx.wait_for(|s| s.connected)).await.expect("connected").expect("open");
        drop(ws);
        timeout(WAIT, rx.wait_for(|s| !s.connected)).await.expect("disconnected").expect("open");

        let mut ws = handshake(&listener).await;
        send_frame(&mut ws, presence_message(r#"{"type":"PRESENCE_UPDATE","online":["u9"]}"#)).await;
        timeout(WAIT, rx.wait_for(|s| s.connected && s.online == set(&["u9"])))
            .await
            .expect("reconnected")
            .expect("open");

        let stopping = tokio::spawn(tracker.stop());
        read_until_disconnect(&mut ws).await;
        timeout(WAIT, stopping).await.expect("stopped").expect("join");
    }

    #[tokio::test]
    async fn test_message_without_online_keeps_set() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let h = logged_in();
        let tracker = start(&h, settings(listener.local_addr().expect("addr")));
        let mut rx = tracker.subscribe();

        let mut ws = handshake(&listener).await;
        send_frame(&mut ws, presence_message(r#"{"type":"PRESENCE_UPDATE","online":["u1"]}"#)).await;
        send_frame(&mut ws, presence_message(r#"{"type":"PRESENCE_UPDATE","joined":["u2"]}"#)).await;
        let state = timeout(WAIT, rx.wait_for(|s| s.last_event.as_ref().is_some_and(|e| e.joined.is_some())))
            .await
            .expect("second message")
            .expect("open")
            .clone();
        assert_eq!(state.online, set(&["u1"]));

        let stopping = tokio::spawn(tracker.stop());
        read_until_disconnect(&mut ws).await;
        timeout(WAIT, stopping).await.expect("stopped").expect("join");
    }

    #[tokio::test]
    async fn test_error_frame_is_recorded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let h = logged_in();
        let tracker = start(&h, settings(listener.local_addr().expect("addr")));
        let mut rx = tracker.subscribe();

        let mut ws = handshake(&listener).await;
        send_frame(&mut ws, Frame::new(stomp::ERROR).with_header("message", "Access denied")).await;
        timeout(WAIT, rx.wait_for(|s| s.error.as_deref() == Some("Access denied")))
            .await
            .expect("error recorded")
            .expect("open");

        let stopping = tokio::spawn(tracker.stop());
        read_until_disconnect(&mut ws).await;
        timeout(WAIT, stopping).await.expect("stopped").expect("join");
    }

    #[tokio::test]
    async fn test_activity_heartbeat() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let h = logged_in();
        let tracker = start(
            &h,
            SubscriptionSettings {
                activity_interval: Duration::from_millis(50),
                ..settings(listener.local_addr().expect("addr"))
            },
        );

        let mut ws = handshake(&listener).await;
        let activity = read_frame(&mut ws).await;
        assert_eq!(activity.command, stomp::SEND);
        assert_eq!(activity.header("destination"), Some("/app/presence/activity"));
        let body: serde_json::Value = serde_json::from_str(&activity.body).expect("json body");
        assert!(body["ts"].as_i64().is_some());

        let stopping = tokio::spawn(tracker.stop());
        read_until_disconnect(&mut ws).await;
        timeout(WAIT, stopping).await.expect("stopped").expect("join");
    }

    #[tokio::test]
    async fn test_stop_during_backoff() {
        // Bind then release a port so nothing is listening on it
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind")
            .local_addr()
            .expect("addr");
        let h = logged_in();
        let tracker = start(
            &h,
            SubscriptionSettings {
                backoff_base: Duration::from_secs(10),
                backoff_max: Duration::from_secs(10),
                ..settings(addr)
            },
        );
        let mut rx = tracker.subscribe();

        timeout(WAIT, rx.wait_for(|s| s.error.is_some())).await.expect("connect failed").expect("open");
        timeout(Duration::from_secs(1), tracker.stop()).await.expect("stop is prompt");
        assert!(!rx.borrow().connected);
    }

    #[tokio::test]
    async fn test_no_token_never_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let transport = Arc::new(ScriptedTransport::new(|_| Ok(json_response(404, ""))));
        let h = harness(transport, RefreshSettings::default());
        let tracker = start(&h, settings(listener.local_addr().expect("addr")));

        assert!(timeout(Duration::from_millis(200), listener.accept()).await.is_err());
        assert!(!tracker.snapshot().connected);
        tracker.stop().await;
    }

    fn assert_gap(gap: Duration, expected_ms: u64) {
        let expected = Duration::from_millis(expected_ms);
        assert!(
            gap >= expected && gap < expected + Duration::from_millis(100),
            "reconnect after {:?}, expected {:?}",
            gap,
            expected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_delay_grows_then_resets_after_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let h = logged_in();
        let tracker = start(
            &h,
            SubscriptionSettings {
                backoff_base: Duration::from_millis(500),
                backoff_max: Duration::from_secs(30),
                activity_interval: Duration::from_secs(3600),
                ..settings(listener.local_addr().expect("addr"))
            },
        );
        let mut rx = tracker.subscribe();
        let mut gaps = Vec::new();

        // Two sessions dropped before CONNECTED
        let mut ws = accept(&listener).await;
        for _ in 0..2 {
            assert_eq!(read_frame(&mut ws).await.command, stomp::CONNECT);
            let dropped = Instant::now();
            drop(ws);
            ws = accept(&listener).await;
            gaps.push(dropped.elapsed());
        }

        assert_eq!(read_frame(&mut ws).await.command, stomp::CONNECT);
        send_frame(&mut ws, connected()).await;
        assert_eq!(read_frame(&mut ws).await.command, stomp::SUBSCRIBE);
        timeout(WAIT, rx.wait_for(|s| s.connected)).await.expect("connected").expect("open");
        let dropped = Instant::now();
        drop(ws);
        let mut ws = accept(&listener).await;
        gaps.push(dropped.elapsed());

        assert_gap(gaps[0], 500);
        assert_gap(gaps[1], 1000);
        assert_gap(gaps[2], 500);

        let stopping = tokio::spawn(tracker.stop());
        read_until_disconnect(&mut ws).await;
        timeout(WAIT, stopping).await.expect("stopped").expect("join");
    }

    #[tokio::test]
    async fn test_slow_seed_does_not_block_frames_or_stop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let transport = Arc::new(
            ScriptedTransport::new(|_| Ok(json_response(200, r#"["u0"]"#)))
                .with_delay(Duration::from_secs(60)),
        );
        let h = harness(transport.clone(), RefreshSettings::default());
        h.store.set(&CredentialRecord::new("T1", profile("a@b.com"))).expect("set");
        let tracker = start(
            &h,
            SubscriptionSettings {
                seed_snapshot: true,
                ..settings(listener.local_addr().expect("addr"))
            },
        );
        let mut rx = tracker.subscribe();

        let mut ws = handshake(&listener).await;
        timeout(WAIT, async {
            while transport.count(paths::PRESENCE) == 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("seed fetch started");

        send_frame(&mut ws, presence_message(r#"{"type":"PRESENCE_UPDATE","online":["u1"]}"#)).await;
        timeout(WAIT, rx.wait_for(|s| s.online == set(&["u1"])))
            .await
            .expect("update while seeding")
            .expect("open");

        let stopping = tokio::spawn(tracker.stop());
        read_until_disconnect(&mut ws).await;
        timeout(Duration::from_secs(1), stopping).await.expect("stop is prompt").expect("join");
    }
}
