use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use tracing::{debug, trace};

use crate::channel::{Channel, ChannelOwner, DrainAction, DrainingState};
use crate::config::ClientConfig;
use crate::connector::{ChannelConnector, resolve_addresses};
use crate::error::ConnexError;
use crate::future::{ChannelState, Exchange, ResponseFuture};
use crate::handler::{FilterDecision, ResponseHandler};
use crate::intercept::{DrainPlan, ExchangeAction, on_status_received};
use crate::manager::ChannelManager;
use crate::partition::explicit_port;
use crate::request::Request;
use crate::util::connection_wants_close;

/// Drives submitted requests through the connection-lifecycle machinery
/// and receives channel events from the transport/codec collaborator.
///
/// The event surface (`channel_read_response`, `channel_read_chunk`,
/// `channel_inactive`, `channel_error`) may be called from any I/O
/// task; distinct channels may deliver concurrently. Events for a
/// channel whose owner is `Idle` (discarded) are dropped.
pub struct RequestSender {
    config: ClientConfig,
    manager: Arc<ChannelManager>,
    closed: AtomicBool,
}

impl RequestSender {
    pub(crate) fn new(config: ClientConfig, manager: Arc<ChannelManager>) -> Arc<Self> {
        Arc::new(Self {
            config,
            manager,
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn manager(&self) -> &Arc<ChannelManager> {
        &self.manager
    }

    pub(crate) fn submit(
        self: &Arc<Self>,
        request: Request,
        handler: Box<dyn ResponseHandler>,
    ) -> ResponseFuture {
        let (exchange, future) = Exchange::new(
            request.clone(),
            handler,
            self.config.max_request_retry,
            Arc::downgrade(&self.manager),
        );
        if self.is_closed() {
            self.abort(None, &exchange, ConnexError::ClientClosed);
        } else {
            self.spawn_execute(request, exchange);
        }
        future
    }

    pub(crate) fn spawn_execute(self: &Arc<Self>, request: Request, exchange: Exchange) {
        let sender = Arc::clone(self);
        tokio::spawn(async move {
            sender.execute(request, exchange).await;
        });
    }

    /// One send pass: reuse the attached channel, lease a pooled one,
    /// or admit and connect a new one, then write the request.
    async fn execute(self: Arc<Self>, request: Request, exchange: Exchange) {
        if self.is_closed() {
            self.abort(None, &exchange, ConnexError::ClientClosed);
            return;
        }
        if exchange.is_done() {
            return;
        }

        // a secured target behind a proxy tunnels through CONNECT until
        // the tunnel is established, after which CONNECT is disallowed
        // for the rest of the exchange
        let force_connect =
            request.proxy().is_some() && request.is_secured() && exchange.is_connect_allowed();
        let wire_request = if force_connect {
            request.connect_request()
        } else {
            request.clone()
        };
        exchange.set_target_request(request.clone());
        exchange.set_current_request(wire_request);

        if let Some(channel) = exchange
            .channel()
            .filter(|channel| exchange.is_reuse_channel() && channel.is_active())
        {
            debug!(channel = channel.id(), "reusing exchange channel");
            exchange.set_channel_state(ChannelState::Pooled);
            self.send_on_open_channel(&channel, &exchange).await;
            return;
        }

        exchange.handler(|handler| handler.on_connection_pool_attempt());
        let partition = exchange.partition_key();
        if let Some(channel) = self.manager.poll(&partition) {
            debug!(channel = channel.id(), partition = %partition, "using pooled channel");
            exchange.handler(|handler| handler.on_connection_pooled(&channel));
            exchange.set_channel_state(ChannelState::Pooled);
            self.send_on_open_channel(&channel, &exchange).await;
            return;
        }

        self.send_with_new_channel(request, exchange).await;
    }

    async fn send_on_open_channel(self: &Arc<Self>, channel: &Channel, exchange: &Exchange) {
        exchange.attach_channel(channel.clone(), false);
        // the owner must be in place before the active check: a close
        // event arriving in between must find the exchange to recover
        channel.set_owner(ChannelOwner::InFlight(exchange.clone()));

        if channel.is_active() {
            self.write_request(channel, exchange).await;
        } else {
            // closed in between; the close notification may have fired
            // before the exchange was registered
            self.handle_unexpected_closed_channel(channel, exchange);
        }
    }

    async fn send_with_new_channel(self: &Arc<Self>, request: Request, exchange: Exchange) {
        if !self.manager.is_open() {
            self.abort(None, &exchange, ConnexError::PoolAlreadyClosed);
            return;
        }

        if let Err(error) = exchange.acquire_partition_lock_lazily(&self.manager).await {
            self.abort(None, &exchange, error);
            return;
        }

        let (host, port) = match request.proxy() {
            Some(proxy) => (proxy.host().to_owned(), proxy.port()),
            None => (
                request.uri().host().unwrap_or_default().to_owned(),
                explicit_port(request.uri()),
            ),
        };
        let authority = format!("{host}:{port}");

        let addresses = match resolve_addresses(&host, port).await {
            Ok(addresses) => addresses,
            Err(source) => {
                self.abort(None, &exchange, ConnexError::Connect { authority, source });
                return;
            }
        };

        if exchange.is_done() {
            return;
        }

        let connector = ChannelConnector::new(
            authority,
            request.local_address(),
            addresses,
            self.config.connect_timeout,
        );
        match connector.connect(&exchange, &self.closed).await {
            Ok(stream) => self.on_connect_success(stream, &request, &exchange).await,
            Err(error) => self.on_connect_failure(&exchange, error),
        }
    }

    async fn on_connect_success(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        request: &Request,
        exchange: &Exchange,
    ) {
        let channel = Channel::from_tcp(stream);

        // slot custody transfers from the exchange to the channel: the
        // permit is released by the close hook, exactly once, whichever
        // path ends up closing the channel
        let permit = exchange.take_partition_lock();
        self.manager.register_open_channel(&channel, permit);

        if request.is_secured() && request.proxy().is_none() {
            // direct TLS; a tunneled target gets its TLS stage after CONNECT
            self.manager.add_tls_stage(&channel);
        }

        if let Some(address) = channel.remote_address() {
            exchange.handler(|handler| handler.on_connect_success(address, &channel));
        }

        if exchange.is_done() {
            channel.set_discard();
            channel.close();
            return;
        }

        debug!(channel = channel.id(), uri = %request.uri(), "using new channel");
        self.send_on_open_channel(&channel, exchange).await;
    }

    fn on_connect_failure(self: &Arc<Self>, exchange: &Exchange, error: ConnexError) {
        let can_retry = exchange.increment_retry_and_check();
        debug!(error = %error, can_retry, "failed to connect");
        if can_retry && exchange.channel_state() != ChannelState::New && self.retry(exchange) {
            return;
        }
        self.abort(None, exchange, error);
    }

    async fn write_request(self: &Arc<Self>, channel: &Channel, exchange: &Exchange) {
        // a pooled channel the server closed underneath us; the close
        // event drives recovery
        if !channel.is_active() {
            return;
        }

        let current = exchange.current_request();
        let write_body = !exchange.dont_write_body_expect_continue()
            && current.method() != Method::CONNECT
            && current.body().is_some();

        if !exchange.headers_written_on_continue() {
            exchange.handler(|handler| handler.on_request_send(&current));
            let head = self.config.request_codec.encode_head(&current);
            if let Err(source) = channel.write_all(&head).await {
                self.handle_io_error(channel, exchange, source);
                return;
            }
        }

        if write_body
            && let Some(body) = current.body()
            && let Err(source) = channel.write_all(body).await
        {
            self.handle_io_error(channel, exchange, source);
        }
    }

    // channel event surface, called by the transport/codec collaborator

    /// Status line and headers of a response arrived on the channel.
    pub fn channel_read_response(
        self: &Arc<Self>,
        channel: &Channel,
        status: StatusCode,
        headers: &HeaderMap,
    ) {
        let Some(exchange) = channel.current_exchange() else {
            trace!(channel = channel.id(), "dropping response event on unowned channel");
            return;
        };
        exchange.touch();
        if exchange.is_done() {
            return;
        }

        if connection_wants_close(headers) {
            exchange.set_keep_alive(false);
        }

        match on_status_received(&self.config, &exchange, status, headers) {
            Ok(action) => self.execute_action(channel, &exchange, status, headers, action),
            Err(error) => self.abort(Some(channel), &exchange, error),
        }
    }

    fn execute_action(
        self: &Arc<Self>,
        channel: &Channel,
        exchange: &Exchange,
        status: StatusCode,
        headers: &HeaderMap,
        action: ExchangeAction,
    ) {
        match action {
            ExchangeAction::Deliver => {
                exchange.assembly_begin(status, headers);
                exchange.handler(|handler| {
                    handler.on_status(status);
                    handler.on_headers(headers);
                });
            }
            ExchangeAction::WriteBodyAfterContinue => {
                exchange.set_headers_written_on_continue(true);
                exchange.set_dont_write_body_expect_continue(false);
                let sender = Arc::clone(self);
                let channel = channel.clone();
                let exchange = exchange.clone();
                tokio::spawn(async move {
                    sender.write_request(&channel, &exchange).await;
                });
            }
            ExchangeAction::ReplayWithAuth {
                request,
                proxy,
                drain,
            } => {
                if proxy {
                    exchange.set_in_proxy_auth(true);
                } else {
                    exchange.set_in_auth(true);
                }
                self.replay_after_drain(channel, exchange, request, drain);
            }
            ExchangeAction::ReplayRedirect { request, drain } => {
                self.replay_after_drain(channel, exchange, request, drain);
            }
            ExchangeAction::EstablishTunnel { request } => {
                self.manager
                    .update_pipeline_for_tunneling(channel, request.is_secured());
                exchange.set_connect_allowed(false);
                exchange.set_channel_state(ChannelState::New);
                exchange.set_reuse_channel(true);
                exchange.assembly_reset();
                channel.set_owner(ChannelOwner::Draining(DrainingState {
                    exchange: exchange.clone(),
                    action: DrainAction::SendNextRequest { request },
                }));
            }
        }
    }

    /// Arms the drain for a protocol-flow replay (redirect or auth) and
    /// kicks off the next request per the drain plan.
    fn replay_after_drain(
        self: &Arc<Self>,
        channel: &Channel,
        exchange: &Exchange,
        request: Request,
        drain: DrainPlan,
    ) {
        exchange.set_channel_state(ChannelState::New);
        exchange.touch();
        exchange.assembly_reset();
        exchange.set_target_request(request.clone());

        match drain {
            DrainPlan::ReuseChannel => {
                // the next request waits for the tail of this response
                exchange.set_reuse_channel(true);
                channel.set_owner(ChannelOwner::Draining(DrainingState {
                    exchange: exchange.clone(),
                    action: DrainAction::SendNextRequest { request },
                }));
            }
            DrainPlan::OfferChannel {
                keep_alive,
                partition,
            } => {
                exchange.set_reuse_channel(false);
                self.manager
                    .drain_channel_and_offer(channel, exchange, keep_alive, partition);
                self.spawn_execute(request, exchange.clone());
            }
            DrainPlan::CloseChannel => {
                exchange.set_reuse_channel(false);
                self.manager.close_channel(channel);
                self.spawn_execute(request, exchange.clone());
            }
        }
    }

    /// A body chunk arrived; `last` marks the final chunk of the
    /// current response (responses without a body deliver one empty
    /// last chunk).
    pub fn channel_read_chunk(self: &Arc<Self>, channel: &Channel, chunk: Bytes, last: bool) {
        if !last {
            if let Some(exchange) = channel.current_exchange() {
                exchange.touch();
                if !exchange.is_done() {
                    exchange.assembly_append_body(&chunk);
                    exchange.handler(|handler| handler.on_body_chunk(&chunk, false));
                }
            }
            return;
        }

        match channel.take_owner() {
            ChannelOwner::Idle => {
                trace!(channel = channel.id(), "dropping chunk on unowned channel");
            }
            ChannelOwner::Draining(state) => match state.action {
                DrainAction::OfferToPool {
                    keep_alive,
                    partition,
                } => {
                    self.manager.try_to_offer_channel_to_pool(
                        channel,
                        &state.exchange,
                        keep_alive,
                        &partition,
                    );
                }
                DrainAction::SendNextRequest { request } => {
                    self.spawn_execute(request, state.exchange);
                }
            },
            ChannelOwner::InFlight(exchange) => {
                exchange.touch();
                if !exchange.is_done() {
                    exchange.assembly_append_body(&chunk);
                    exchange.handler(|handler| handler.on_body_chunk(&chunk, true));
                }
                self.finish_exchange(channel, &exchange);
            }
        }
    }

    fn finish_exchange(self: &Arc<Self>, channel: &Channel, exchange: &Exchange) {
        // hand-back strictly precedes completion delivery, so by the
        // time the caller observes the response the channel is already
        // poolable (or closed)
        let keep_alive = exchange.is_keep_alive();
        let partition = exchange.partition_key();
        self.manager
            .try_to_offer_channel_to_pool(channel, exchange, keep_alive, &partition);
        exchange.done();
    }

    /// The channel went inactive (remote close or local teardown).
    pub fn channel_inactive(self: &Arc<Self>, channel: &Channel) {
        channel.set_inactive();
        match channel.take_owner() {
            ChannelOwner::Idle => {
                self.manager.close_channel(channel);
            }
            ChannelOwner::Draining(state) => {
                self.manager.close_channel(channel);
                if let DrainAction::SendNextRequest { request } = state.action {
                    // the channel died before the drain finished; the
                    // queued request has to find a different channel
                    let exchange = state.exchange;
                    exchange.set_reuse_channel(false);
                    if !self.is_closed()
                        && exchange.increment_retry_and_check()
                        && exchange.is_replay_possible()
                    {
                        exchange.set_channel_state(ChannelState::Reconnected);
                        exchange.handler(|handler| handler.on_retry());
                        self.spawn_execute(request, exchange);
                    } else {
                        let error = if self.is_closed() {
                            ConnexError::ClientClosed
                        } else {
                            ConnexError::RemotelyClosed
                        };
                        self.abort(None, &exchange, error);
                    }
                }
            }
            ChannelOwner::InFlight(exchange) => {
                self.handle_unexpected_closed_channel(channel, &exchange);
            }
        }
    }

    fn handle_unexpected_closed_channel(self: &Arc<Self>, channel: &Channel, exchange: &Exchange) {
        if exchange.is_done() {
            self.manager.close_channel(channel);
            return;
        }
        if self.is_closed() {
            self.manager.close_channel(channel);
            self.abort(None, exchange, ConnexError::ClientClosed);
            return;
        }
        if exchange.increment_retry_and_check() && self.retry(exchange) {
            let _ = exchange.take_pending_error();
            self.manager.close_channel(channel);
        } else {
            let error = exchange
                .take_pending_error()
                .unwrap_or(ConnexError::RemotelyClosed);
            self.abort(Some(channel), exchange, error);
        }
    }

    /// Transparent reconnect-and-replay, gated by `is_replay_possible`.
    fn retry(self: &Arc<Self>, exchange: &Exchange) -> bool {
        if self.is_closed() {
            return false;
        }
        if !exchange.is_replay_possible() {
            debug!("unable to recover exchange");
            return false;
        }

        exchange.set_channel_state(ChannelState::Reconnected);
        debug!(exchange = ?exchange, "trying to recover request");
        exchange.handler(|handler| handler.on_retry());
        exchange.assembly_reset();
        self.spawn_execute(exchange.target_request(), exchange.clone());
        true
    }

    /// An I/O error surfaced on the channel while an exchange was in
    /// flight.
    pub fn channel_error(self: &Arc<Self>, channel: &Channel, error: std::io::Error) {
        let Some(exchange) = channel.current_exchange() else {
            channel.set_inactive();
            self.manager.close_channel(channel);
            return;
        };
        self.handle_io_error(channel, &exchange, error);
    }

    fn handle_io_error(
        self: &Arc<Self>,
        channel: &Channel,
        exchange: &Exchange,
        error: std::io::Error,
    ) {
        exchange.touch();

        for filter in &self.config.io_exception_filters {
            let FilterDecision::Replay(new_request) =
                filter.filter(&error, &exchange.current_request())
            else {
                continue;
            };
            if exchange.increment_retry_and_check() && exchange.is_replay_possible() {
                debug!("replaying request after io error");
                exchange.set_keep_alive(false);
                channel.take_owner();
                self.manager.close_channel(channel);
                exchange.set_channel_state(ChannelState::New);
                exchange.assembly_reset();
                exchange.handler(|handler| handler.on_retry());
                self.spawn_execute(new_request, exchange.clone());
                return;
            }
        }

        channel.take_owner();
        exchange.set_pending_error(ConnexError::Io { source: error });
        self.handle_unexpected_closed_channel(channel, exchange);
    }

    fn abort(&self, channel: Option<&Channel>, exchange: &Exchange, error: ConnexError) {
        if let Some(channel) = channel {
            self.manager.close_channel(channel);
        }
        if !exchange.is_done() {
            exchange.set_channel_state(ChannelState::Closed);
            debug!(error = %error, "aborting exchange");
            exchange.abort(error);
        }
    }
}
