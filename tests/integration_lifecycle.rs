//! End-to-end lifecycle tests: a real client connecting to local TCP
//! endpoints, with response events injected through the sender's
//! channel-event surface the way a transport codec would deliver them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use connex::prelude::{Channel, Client, ClientConfig, ConnexError, Request, ResponseHandler};
use http::{HeaderMap, HeaderValue, StatusCode};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

#[derive(Default)]
struct CaptureState {
    connected: Vec<Channel>,
    pooled: Vec<Channel>,
    offered: Vec<Channel>,
    retries: usize,
}

#[derive(Clone, Default)]
struct Capture {
    state: Arc<Mutex<CaptureState>>,
}

impl Capture {
    fn handler(&self) -> Box<dyn ResponseHandler> {
        Box::new(CaptureHandler {
            state: Arc::clone(&self.state),
        })
    }

    fn latest_channel(&self) -> Option<Channel> {
        let state = self.state.lock().expect("capture state");
        state.pooled.last().or(state.connected.last()).cloned()
    }

    fn connected_count(&self) -> usize {
        self.state.lock().expect("capture state").connected.len()
    }

    fn pooled_count(&self) -> usize {
        self.state.lock().expect("capture state").pooled.len()
    }

    fn offered_count(&self) -> usize {
        self.state.lock().expect("capture state").offered.len()
    }

    fn retries(&self) -> usize {
        self.state.lock().expect("capture state").retries
    }
}

struct CaptureHandler {
    state: Arc<Mutex<CaptureState>>,
}

impl ResponseHandler for CaptureHandler {
    fn on_connect_success(&mut self, _address: SocketAddr, channel: &Channel) {
        self.state
            .lock()
            .expect("capture state")
            .connected
            .push(channel.clone());
    }

    fn on_connection_pooled(&mut self, channel: &Channel) {
        self.state
            .lock()
            .expect("capture state")
            .pooled
            .push(channel.clone());
    }

    fn on_connection_offer(&mut self, channel: &Channel) {
        self.state
            .lock()
            .expect("capture state")
            .offered
            .push(channel.clone());
    }

    fn on_retry(&mut self) {
        self.state.lock().expect("capture state").retries += 1;
    }
}

/// Accepts connections and drains whatever the client writes. Counts
/// accepted connections and completed request heads (terminated by a
/// blank line); responses are injected by the tests, never written to
/// the socket.
struct SilentServer {
    address: SocketAddr,
    accepted: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
}

impl SilentServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("local addr");
        let accepted = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(AtomicUsize::new(0));
        let accepted_outer = Arc::clone(&accepted);
        let requests_outer = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                accepted_outer.fetch_add(1, Ordering::SeqCst);
                let requests = Arc::clone(&requests_outer);
                tokio::spawn(async move {
                    let mut chunk = [0_u8; 4096];
                    let mut window: Vec<u8> = Vec::new();
                    loop {
                        let Ok(read) = stream.read(&mut chunk).await else {
                            return;
                        };
                        if read == 0 {
                            return;
                        }
                        window.extend_from_slice(&chunk[..read]);
                        let mut heads = 0;
                        while let Some(position) = window
                            .windows(4)
                            .position(|candidate| candidate == b"\r\n\r\n")
                        {
                            heads += 1;
                            window.drain(..position + 4);
                        }
                        if heads > 0 {
                            requests.fetch_add(heads, Ordering::SeqCst);
                        }
                    }
                });
            }
        });
        Self {
            address,
            accepted,
            requests,
        }
    }

    fn uri(&self, path: &str) -> String {
        format!("http://{}{path}", self.address)
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    fn requests_seen(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn respond_ok(client: &Client, channel: &Channel, body: &'static [u8]) {
    client
        .sender()
        .channel_read_response(channel, StatusCode::OK, &HeaderMap::new());
    client
        .sender()
        .channel_read_chunk(channel, Bytes::from_static(body), true);
}

#[tokio::test(flavor = "multi_thread")]
async fn sequential_requests_reuse_the_pooled_connection() {
    let server = SilentServer::start().await;
    let client = Client::new(ClientConfig::default());
    let capture = Capture::default();

    let first = client.execute_with_handler(
        Request::get(&server.uri("/first")).build().expect("request"),
        capture.handler(),
    );
    wait_until(|| server.requests_seen() == 1).await;
    let channel = capture.latest_channel().expect("connected channel");

    respond_ok(&client, &channel, b"one");
    let response = first.await.expect("first response");
    assert_eq!(response.body().as_ref(), b"one");
    assert_eq!(capture.offered_count(), 1);

    let second = client.execute_with_handler(
        Request::get(&server.uri("/second")).build().expect("request"),
        capture.handler(),
    );
    wait_until(|| server.requests_seen() == 2).await;
    assert_eq!(capture.pooled_count(), 1);
    let reused = capture.latest_channel().expect("pooled channel");
    assert_eq!(reused.id(), channel.id());

    respond_ok(&client, &reused, b"two");
    let response = second.await.expect("second response");
    assert_eq!(response.body().as_ref(), b"two");

    // one TCP connection served both exchanges
    assert_eq!(server.accepted(), 1);
    assert_eq!(capture.connected_count(), 1);

    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn per_host_admission_rejects_while_the_connection_is_in_flight() {
    let server = SilentServer::start().await;
    let config = ClientConfig::builder()
        .max_connections_per_host(Some(1))
        .acquire_free_channel_timeout(Duration::ZERO)
        .build();
    let client = Client::new(config);
    let capture = Capture::default();

    let first = client.execute_with_handler(
        Request::get(&server.uri("/hold")).build().expect("request"),
        capture.handler(),
    );
    wait_until(|| server.requests_seen() == 1).await;

    // the only slot is taken and nothing is pooled yet
    let rejected = client
        .execute(Request::get(&server.uri("/more")).build().expect("request"))
        .await
        .unwrap_err();
    assert!(matches!(
        rejected,
        ConnexError::TooManyConnectionsPerHost { max: 1 }
    ));

    // finishing the first exchange pools its channel; the next request
    // rides it without needing a new slot
    let channel = capture.latest_channel().expect("channel");
    respond_ok(&client, &channel, b"held");
    first.await.expect("first response");

    let third = client.execute_with_handler(
        Request::get(&server.uri("/pooled")).build().expect("request"),
        capture.handler(),
    );
    wait_until(|| server.requests_seen() == 2).await;
    respond_ok(&client, &channel, b"reused");
    third.await.expect("third response");
    assert_eq!(server.accepted(), 1);

    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn cross_host_redirect_connects_to_the_new_target() {
    let origin = SilentServer::start().await;
    let target = SilentServer::start().await;
    let client = Client::new(ClientConfig::builder().follow_redirect(true).build());
    let capture = Capture::default();

    let future = client.execute_with_handler(
        Request::post(&origin.uri("/submit"))
            .body(Bytes::from_static(b"form-data"))
            .build()
            .expect("request"),
        capture.handler(),
    );
    wait_until(|| origin.requests_seen() == 1).await;
    let origin_channel = capture.latest_channel().expect("origin channel");

    let mut headers = HeaderMap::new();
    headers.insert(
        "location",
        HeaderValue::from_str(&target.uri("/landing")).expect("location"),
    );
    client
        .sender()
        .channel_read_response(&origin_channel, StatusCode::FOUND, &headers);
    client
        .sender()
        .channel_read_chunk(&origin_channel, Bytes::new(), true);

    // the replay opens a second connection, to the new host
    wait_until(|| target.requests_seen() == 1).await;
    assert_eq!(capture.connected_count(), 2);
    let target_channel = capture.latest_channel().expect("target channel");
    assert_ne!(target_channel.id(), origin_channel.id());

    respond_ok(&client, &target_channel, b"landed");
    let response = future.await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body().as_ref(), b"landed");

    // the drained origin channel and the target channel both went back
    wait_until(|| capture.offered_count() == 2).await;

    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_close_is_recovered_by_a_transparent_reconnect() {
    let server = SilentServer::start().await;
    let client = Client::new(ClientConfig::default());
    let capture = Capture::default();

    let future = client.execute_with_handler(
        Request::get(&server.uri("/flaky")).build().expect("request"),
        capture.handler(),
    );
    wait_until(|| server.requests_seen() == 1).await;
    let first_channel = capture.latest_channel().expect("first channel");

    // the server drops the connection mid-exchange
    client.sender().channel_inactive(&first_channel);

    wait_until(|| server.requests_seen() == 2).await;
    assert_eq!(capture.retries(), 1);
    assert_eq!(capture.connected_count(), 2);
    let second_channel = capture.latest_channel().expect("second channel");
    assert_ne!(second_channel.id(), first_channel.id());

    respond_ok(&client, &second_channel, b"recovered");
    let response = future.await.expect("response");
    assert_eq!(response.body().as_ref(), b"recovered");

    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn closing_the_client_fails_in_flight_exchanges() {
    let server = SilentServer::start().await;
    let client = Client::new(ClientConfig::default());
    let capture = Capture::default();

    let future = client.execute_with_handler(
        Request::get(&server.uri("/pending")).build().expect("request"),
        capture.handler(),
    );
    wait_until(|| server.requests_seen() == 1).await;
    let channel = capture.latest_channel().expect("channel");

    client.close();
    assert!(!channel.is_open());

    // the codec observes the teardown and reports it
    client.sender().channel_inactive(&channel);
    let error = future.await.unwrap_err();
    assert!(matches!(error, ConnexError::ClientClosed));
}

#[tokio::test(flavor = "multi_thread")]
async fn keep_alive_disabled_closes_the_channel_after_each_exchange() {
    let server = SilentServer::start().await;
    let client = Client::new(ClientConfig::builder().keep_alive(false).build());
    let capture = Capture::default();

    let first = client.execute_with_handler(
        Request::get(&server.uri("/one")).build().expect("request"),
        capture.handler(),
    );
    wait_until(|| server.requests_seen() == 1).await;
    let channel = capture.latest_channel().expect("channel");
    respond_ok(&client, &channel, b"one");
    first.await.expect("first response");
    assert!(!channel.is_open());
    assert_eq!(capture.offered_count(), 0);

    let second = client.execute_with_handler(
        Request::get(&server.uri("/two")).build().expect("request"),
        capture.handler(),
    );
    wait_until(|| server.requests_seen() == 2).await;
    let channel = capture.latest_channel().expect("channel");
    respond_ok(&client, &channel, b"two");
    second.await.expect("second response");

    assert_eq!(server.accepted(), 2);
    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_discards_the_channel_instead_of_pooling_it() {
    let server = SilentServer::start().await;
    let client = Client::new(ClientConfig::default());
    let capture = Capture::default();

    let future = client.execute_with_handler(
        Request::get(&server.uri("/slow")).build().expect("request"),
        capture.handler(),
    );
    wait_until(|| server.requests_seen() == 1).await;
    let channel = capture.latest_channel().expect("channel");

    assert!(future.cancel());
    assert!(!channel.is_open());
    let error = future.await.unwrap_err();
    assert!(matches!(error, ConnexError::Cancelled));

    // nothing reusable was left behind
    assert_eq!(client.client_stats().total_idle_connection_count(), 0);

    client.close();
}
