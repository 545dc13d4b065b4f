use crate::session::BoxedStream;
use async_trait::async_trait;
use std::io;
use tokio::net::TcpStream;

/// Acceptor turns an accepted TCP connection into the stream a session runs
/// over. A TLS terminator implements this to hand back the decrypted stream.
#[async_trait]
pub trait Acceptor: Send + Sync {
    async fn accept(&self, stream: TcpStream) -> io::Result<BoxedStream>;
}

/// PlainAcceptor passes the TCP stream through untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainAcceptor;

#[async_trait]
impl Acceptor for PlainAcceptor {
    async fn accept(&self, stream: TcpStream) -> io::Result<BoxedStream> {
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
