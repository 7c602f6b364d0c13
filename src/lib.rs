//! `connex` is the connection-lifecycle core of an asynchronous HTTP
//! client: admission control for new connections, a partitioned
//! keep-alive channel pool with background eviction, and the
//! retry/redirect/auth state machine that decides when an exchange may
//! be resumed on a different connection.
//!
//! Wire-level framing and TLS handshakes are the transport/codec
//! collaborator's job: it takes request bytes off the channel and
//! reports response events back through [`RequestSender`]'s event
//! surface.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use connex::prelude::{Client, ClientConfig, Request};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new(
//!         ClientConfig::builder()
//!             .max_connections(Some(100))
//!             .max_connections_per_host(Some(8))
//!             .acquire_free_channel_timeout(Duration::from_millis(500))
//!             .pooled_connection_idle_timeout(Some(Duration::from_secs(60)))
//!             .follow_redirect(true)
//!             .build(),
//!     );
//!
//!     let response = client
//!         .execute(Request::get("http://api.example.com/v1/items").build()?)
//!         .await?;
//!     println!("status={}", response.status());
//!
//!     client.close();
//!     Ok(())
//! }
//! ```
//!
//! # Recommended Defaults
//!
//! - Leave keep-alive on; the pool is the point of this crate.
//! - Configure both a global and a per-host connection cap for anything
//!   that talks to more than one backend.
//! - Give `acquire_free_channel_timeout` a small positive value; zero
//!   means admission failures surface immediately.

mod channel;
mod client;
mod config;
mod connector;
mod error;
mod future;
mod handler;
mod intercept;
mod manager;
mod partition;
mod pool;
mod request;
mod semaphore;
mod sender;
mod util;

pub use crate::channel::{
    Channel, HTTP_CODEC_STAGE, SSL_STAGE, WS_DECODER_STAGE, WS_ENCODER_STAGE,
};
pub use crate::client::Client;
pub use crate::config::{ClientConfig, ClientConfigBuilder, PoolLeaseOrder};
pub use crate::error::{ConnexError, ConnexErrorCode};
pub use crate::future::{Response, ResponseFuture};
pub use crate::handler::{Authenticator, FilterDecision, IoExceptionFilter, ResponseHandler};
pub use crate::manager::{ClientStats, HostStats};
pub use crate::partition::{PartitionKey, Partitioning};
pub use crate::request::{Proxy, Request, RequestBuilder, RequestCodec};
pub use crate::sender::RequestSender;

pub type ConnexResult<T> = std::result::Result<T, ConnexError>;

pub mod prelude {
    pub use crate::{
        Authenticator, Channel, Client, ClientConfig, ClientStats, ConnexError, ConnexErrorCode,
        ConnexResult, FilterDecision, HostStats, IoExceptionFilter, PartitionKey, Partitioning,
        PoolLeaseOrder, Proxy, Request, RequestBuilder, RequestCodec, RequestSender, Response,
        ResponseFuture, ResponseHandler,
    };
}
