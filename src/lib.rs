//! A SOCKS5 proxy engine
//!
//! ## SOCKS5 Implementation
//!
//! - Features:
//!     - CONNECT, BIND and UDP ASSOCIATE
//!     - No Authentication
//!     - Username/Password Authentication through a pluggable authenticator
//!     - Explicit per-session state machine with a shared session registry
//!     - Coupled relay pipes: when one direction ends both sockets close
//!     - Session lifecycle hooks and a pluggable transport (e.g. TLS)
//!     - Client side of the protocol for CONNECT, BIND and UDP ASSOCIATE
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)
//!
//! # Example
//! ```no_run
//! use socksrelay::{Socks5Server, auth::UserPass};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut server = Socks5Server::new("127.0.0.1:1080")
//!         .with_auth(Some(UserPass::new("user", "secret")));
//!     server.run().await
//! }
//! ```

pub mod address;
pub mod auth;
pub mod client;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod hooks;
pub mod method;
pub mod pipe;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;
pub mod transport;
pub mod udp;

// Re-export main types at crate root for convenience
pub use address::{Address, TargetAddress};
pub use auth::{AuthOutcome, Authenticator, UserPass};
pub use client::Socks5Client;
pub use config::Config;
pub use error::{ErrorKind, Result, SocksError};
pub use hooks::{HookAbort, SessionHooks};
pub use method::{Method, MethodRegistry};
pub use protocol::{AuthMethod, Command, ReplyCode, Version};
pub use server::{ShutdownHandle, Socks5Server};
pub use session::{Session, SessionHandle, SessionRegistry, SessionState};
