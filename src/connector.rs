use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::time::timeout;
use tracing::debug;

use crate::ConnexResult;
use crate::error::ConnexError;
use crate::future::Exchange;

/// Resolves the target authority into the ranked address list the
/// connector walks through.
pub(crate) async fn resolve_addresses(host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
    let addresses: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
    Ok(addresses)
}

/// Connect-with-fallback over a ranked address list.
///
/// Each address is attempted in order; the exchange handler observes
/// every attempt and its outcome. Only after the whole list fails does
/// the connect fail, wrapping the last underlying cause. A client that
/// started closing terminates the connect immediately instead of
/// burning through the remaining addresses.
pub(crate) struct ChannelConnector {
    authority: String,
    local_address: Option<IpAddr>,
    remote_addresses: Vec<SocketAddr>,
    connect_timeout: Duration,
}

impl ChannelConnector {
    pub(crate) fn new(
        authority: String,
        local_address: Option<IpAddr>,
        remote_addresses: Vec<SocketAddr>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            authority,
            local_address,
            remote_addresses,
            connect_timeout,
        }
    }

    pub(crate) async fn connect(
        &self,
        exchange: &Exchange,
        client_closed: &AtomicBool,
    ) -> ConnexResult<TcpStream> {
        let mut last_error: Option<std::io::Error> = None;

        for address in &self.remote_addresses {
            if client_closed.load(Ordering::Acquire) {
                // not an address-level failure; the whole connect ends here
                return Err(ConnexError::ClientClosed);
            }

            exchange.handler(|handler| handler.on_connect_attempt(*address));
            match self.attempt(*address).await {
                Ok(stream) => return Ok(stream),
                Err(error) => {
                    debug!(%address, error = %error, "connect attempt failed");
                    exchange.handler(|handler| handler.on_connect_failure(*address, &error));
                    last_error = Some(error);
                }
            }
        }

        Err(ConnexError::Connect {
            authority: self.authority.clone(),
            source: last_error.unwrap_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "no addresses resolved",
                )
            }),
        })
    }

    async fn attempt(&self, address: SocketAddr) -> std::io::Result<TcpStream> {
        let socket = if address.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(local) = self.local_address {
            socket.bind(SocketAddr::new(local, 0))?;
        }

        match timeout(self.connect_timeout, socket.connect(address)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ResponseHandler;
    use crate::request::Request;
    use std::sync::{Arc, Mutex, Weak};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct RecordingState {
        attempts: Vec<SocketAddr>,
        failures: Vec<SocketAddr>,
    }

    struct RecordingHandler {
        state: Arc<Mutex<RecordingState>>,
    }

    impl ResponseHandler for RecordingHandler {
        fn on_connect_attempt(&mut self, address: SocketAddr) {
            self.state.lock().expect("state").attempts.push(address);
        }

        fn on_connect_failure(&mut self, address: SocketAddr, _error: &std::io::Error) {
            self.state.lock().expect("state").failures.push(address);
        }
    }

    fn recording_exchange() -> (Exchange, Arc<Mutex<RecordingState>>) {
        let state = Arc::new(Mutex::new(RecordingState::default()));
        let handler = RecordingHandler {
            state: Arc::clone(&state),
        };
        let request = Request::get("http://example.com/").build().expect("request");
        let (exchange, _future) = Exchange::new(request, Box::new(handler), 5, Weak::new());
        (exchange, state)
    }

    async fn unused_local_address() -> SocketAddr {
        // bind, note the port, drop the listener: connecting afterwards
        // is refused
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("local addr")
    }

    #[tokio::test]
    async fn falls_back_across_addresses_until_one_connects() {
        let dead = unused_local_address().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let live = listener.local_addr().expect("local addr");

        let connector = ChannelConnector::new(
            "example.com:80".to_owned(),
            None,
            vec![dead, live],
            Duration::from_secs(2),
        );
        let (exchange, state) = recording_exchange();
        let closed = AtomicBool::new(false);

        let stream = connector
            .connect(&exchange, &closed)
            .await
            .expect("second address connects");
        assert_eq!(stream.peer_addr().expect("peer"), live);

        let state = state.lock().expect("state");
        assert_eq!(state.attempts, vec![dead, live]);
        assert_eq!(state.failures, vec![dead]);
    }

    #[tokio::test]
    async fn exhausted_address_list_surfaces_wrapped_connect_error() {
        let dead_a = unused_local_address().await;
        let dead_b = unused_local_address().await;

        let connector = ChannelConnector::new(
            "example.com:80".to_owned(),
            None,
            vec![dead_a, dead_b],
            Duration::from_secs(2),
        );
        let (exchange, state) = recording_exchange();
        let closed = AtomicBool::new(false);

        let error = connector.connect(&exchange, &closed).await.unwrap_err();
        assert!(matches!(error, ConnexError::Connect { .. }));
        assert_eq!(state.lock().expect("state").failures.len(), 2);
    }

    #[tokio::test]
    async fn closing_client_terminates_the_connect_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let live = listener.local_addr().expect("local addr");

        let connector = ChannelConnector::new(
            "example.com:80".to_owned(),
            None,
            vec![live],
            Duration::from_secs(2),
        );
        let (exchange, state) = recording_exchange();
        let closed = AtomicBool::new(true);

        let error = connector.connect(&exchange, &closed).await.unwrap_err();
        assert!(matches!(error, ConnexError::ClientClosed));
        assert!(state.lock().expect("state").attempts.is_empty());
    }

    #[tokio::test]
    async fn empty_address_list_fails_with_connect_error() {
        let connector = ChannelConnector::new(
            "example.com:80".to_owned(),
            None,
            Vec::new(),
            Duration::from_secs(2),
        );
        let (exchange, _state) = recording_exchange();
        let closed = AtomicBool::new(false);

        let error = connector.connect(&exchange, &closed).await.unwrap_err();
        assert!(matches!(error, ConnexError::Connect { .. }));
    }
}
