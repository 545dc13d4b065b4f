use std::net::IpAddr;
use std::time::Duration;

/// Default per-pipe copy buffer: large, to favour throughput over syscalls
pub const DEFAULT_BUFFER_SIZE: usize = 5 * 1024 * 1024;

/// Config holds the tunables the protocol engine needs at runtime
#[derive(Debug, Clone)]
pub struct Config {
    /// Bounds CONNECT (resolution + connect) and the BIND accept wait.
    /// None waits forever.
    pub command_timeout: Option<Duration>,

    /// Copy buffer size of each relay pipe
    pub buffer_size: usize,

    /// Address BIND listeners and UDP relay sockets are opened on.
    /// None uses the local address of the client's control connection.
    pub bind_ip: Option<IpAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command_timeout: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            bind_ip: None,
        }
    }
}

/// Config implementation block
impl Config {
    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// with_buffer_size sets the pipe buffer size; zero is bumped to one byte
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    pub fn with_bind_ip(mut self, bind_ip: Option<IpAddr>) -> Self {
        self.bind_ip = bind_ip;
        self
    }
}
