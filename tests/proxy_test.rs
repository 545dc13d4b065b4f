use socksrelay::codec::CommandRequest;
use socksrelay::hooks::{HookAbort, SessionHooks};
use socksrelay::{
    Address, Config, ReplyCode, SessionHandle, SessionRegistry, ShutdownHandle, Socks5Client,
    Socks5Server, SocksError, TargetAddress, UserPass,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

struct Proxy {
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    sessions: Arc<SessionRegistry>,
    task: JoinHandle<anyhow::Result<()>>,
}

async fn start_proxy(server: Socks5Server) -> Proxy {
    let mut server = server;
    let addr = server.bind().await.unwrap();
    let shutdown = server.shutdown_handle();
    let sessions = server.sessions();
    let task = tokio::spawn(async move { server.run().await });
    Proxy {
        addr,
        shutdown,
        sessions,
        task,
    }
}

async fn plain_proxy() -> Proxy {
    start_proxy(Socks5Server::new("127.0.0.1:0")).await
}

async fn auth_proxy() -> Proxy {
    start_proxy(
        Socks5Server::new("127.0.0.1:0").with_auth(Some(UserPass::new("alice", "secret"))),
    )
    .await
}

async fn tcp_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

async fn udp_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

fn connect_request(cmd: u8, target: SocketAddr) -> Vec<u8> {
    let SocketAddr::V4(target) = target else {
        panic!("IPv4 only");
    };
    let mut request = vec![0x05, cmd, 0x00, 0x01];
    request.extend_from_slice(&target.ip().octets());
    request.extend_from_slice(&target.port().to_be_bytes());
    request
}

/// read_to_end collects everything the proxy sends until it closes; a
/// reset counts as a close
async fn read_to_end(stream: &mut TcpStream) -> Vec<u8> {
    let mut rest = Vec::new();
    let mut buf = [0u8; 1024];
    timeout(WAIT, async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => rest.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => break,
                Err(e) => panic!("read failed: {e}"),
            }
        }
    })
    .await
    .expect("proxy left the connection open");
    rest
}

async fn wait_until_empty(sessions: &SessionRegistry) {
    timeout(WAIT, async {
        while !sessions.is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sessions left open");
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn connect_echoes_payloads_unmodified() {
    let proxy = plain_proxy().await;
    let echo = tcp_echo_server().await;
    let client = Socks5Client::new(proxy.addr);

    for len in [0, 1, 1_000_000] {
        let stream = client.connect(echo).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let data = payload(len);

        let sent = data.clone();
        let write = tokio::spawn(async move {
            writer.write_all(&sent).await.unwrap();
            writer
        });

        let mut echoed = vec![0u8; len];
        timeout(WAIT, reader.read_exact(&mut echoed))
            .await
            .expect("echo timed out")
            .unwrap();
        assert_eq!(echoed, data, "payload of {len} bytes");
        write.await.unwrap();
    }

    wait_until_empty(&proxy.sessions).await;
}

#[tokio::test]
async fn connect_reply_carries_bound_address() {
    let proxy = plain_proxy().await;
    let echo = tcp_echo_server().await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    stream.write_all(&connect_request(0x01, echo)).await.unwrap();

    let mut reply = [0u8; 12];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..2], &[0x05, 0x00]);
    assert_eq!(&reply[2..6], &[0x05, 0x00, 0x00, 0x01]);
    assert_eq!(&reply[6..10], &[127, 0, 0, 1]);
    assert_ne!(u16::from_be_bytes([reply[10], reply[11]]), 0);
}

#[tokio::test]
async fn connect_refused_maps_reply_and_closes() {
    let proxy = plain_proxy().await;
    let target = closed_port().await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    stream.write_all(&connect_request(0x01, target)).await.unwrap();

    let bytes = read_to_end(&mut stream).await;
    assert_eq!(&bytes[..2], &[0x05, 0x00]);
    assert_eq!(bytes[3], 0x05);
    assert_eq!(bytes.len(), 2 + 10);

    let client = Socks5Client::new(proxy.addr);
    let result = client.connect(target).await;
    assert!(matches!(
        result,
        Err(SocksError::Rejected(ReplyCode::ConnectionRefused))
    ));
    wait_until_empty(&proxy.sessions).await;
}

#[tokio::test]
async fn no_acceptable_method_gets_ff_then_close() {
    let proxy = auth_proxy().await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    assert_eq!(read_to_end(&mut stream).await, vec![0x05, 0xFF]);
    wait_until_empty(&proxy.sessions).await;
}

#[tokio::test]
async fn selection_picks_first_supported_offer() {
    let proxy = auth_proxy().await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await.unwrap();
    assert_eq!(response, [0x05, 0x02]);
}

#[tokio::test]
async fn username_password_success_and_failure() {
    let proxy = auth_proxy().await;
    let echo = tcp_echo_server().await;

    let client = Socks5Client::new(proxy.addr).with_credentials(UserPass::new("alice", "secret"));
    let mut stream = client.connect(echo).await.unwrap();
    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    stream
        .write_all(&[0x01, 0x05, b'a', b'l', b'i', b'c', b'e', 0x03, b'b', b'a', b'd'])
        .await
        .unwrap();
    assert_eq!(read_to_end(&mut stream).await, vec![0x05, 0x02, 0x01, 0x01]);

    let wrong = Socks5Client::new(proxy.addr).with_credentials(UserPass::new("alice", "nope"));
    assert!(matches!(
        wrong.connect(echo).await,
        Err(SocksError::Authentication(_))
    ));
}

#[tokio::test]
async fn unsupported_command_and_address_type() {
    let proxy = plain_proxy().await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    stream
        .write_all(&connect_request(0x04, "127.0.0.1:80".parse().unwrap()))
        .await
        .unwrap();
    let bytes = read_to_end(&mut stream).await;
    assert_eq!(&bytes[2..4], &[0x05, 0x07]);

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    // Nothing after ATYP: its length is unknown to the proxy
    stream.write_all(&[0x05, 0x01, 0x00, 0x05]).await.unwrap();
    let bytes = read_to_end(&mut stream).await;
    assert_eq!(&bytes[2..4], &[0x05, 0x08]);
}

#[tokio::test]
async fn wrong_version_closes_without_reply() {
    let proxy = plain_proxy().await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
    assert!(read_to_end(&mut stream).await.is_empty());
    wait_until_empty(&proxy.sessions).await;
}

#[tokio::test]
async fn bind_relays_the_inbound_connection() {
    let proxy = plain_proxy().await;
    let client = Socks5Client::new(proxy.addr);

    let pending = client
        .bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let listen_addr = pending.listen_addr().to_socket_addr().unwrap();
    assert_ne!(listen_addr.port(), 0);

    let mut peer = TcpStream::connect(listen_addr).await.unwrap();
    let (mut relayed, peer_addr) = timeout(WAIT, pending.accept()).await.unwrap().unwrap();
    assert_eq!(peer_addr, TargetAddress::from(peer.local_addr().unwrap()));

    peer.write_all(b"from peer").await.unwrap();
    let mut buf = [0u8; 9];
    relayed.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"from peer");

    relayed.write_all(b"to peer").await.unwrap();
    let mut buf = [0u8; 7];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"to peer");
}

/// start_bind negotiates NO AUTH, sends BIND and returns the control
/// stream with the announced listen address
async fn start_bind(proxy: &Proxy) -> (TcpStream, SocketAddr) {
    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut selection = [0u8; 2];
    stream.read_exact(&mut selection).await.unwrap();
    assert_eq!(selection, [0x05, 0x00]);

    stream
        .write_all(&connect_request(0x02, SocketAddr::from(([127, 0, 0, 1], 0))))
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);

    let ip = Ipv4Addr::new(reply[4], reply[5], reply[6], reply[7]);
    let port = u16::from_be_bytes([reply[8], reply[9]]);
    (stream, SocketAddr::from((ip, port)))
}

#[tokio::test]
async fn bind_client_hangup_releases_the_listener() {
    let proxy = plain_proxy().await;
    let (stream, listen_addr) = start_bind(&proxy).await;
    assert_eq!(proxy.sessions.len(), 1);

    drop(stream);
    wait_until_empty(&proxy.sessions).await;

    timeout(WAIT, async {
        while TcpStream::connect(listen_addr).await.is_ok() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("BIND listener still accepting");
}

#[tokio::test]
async fn bind_accept_timeout_replies_ttl_expired() {
    let config = Config::default().with_command_timeout(Some(Duration::from_millis(200)));
    let proxy = start_proxy(Socks5Server::new("127.0.0.1:0").with_config(config)).await;

    let (mut stream, _) = start_bind(&proxy).await;
    let second = read_to_end(&mut stream).await;
    assert_eq!(&second[..2], &[0x05, 0x06]);
    wait_until_empty(&proxy.sessions).await;
}

#[derive(Default)]
struct RecordTargets(Mutex<Vec<TargetAddress>>);

impl SessionHooks for RecordTargets {
    fn on_command_received(
        &self,
        _session: &SessionHandle,
        request: &CommandRequest,
    ) -> Result<(), HookAbort> {
        self.0.lock().unwrap().push(request.target.clone());
        Ok(())
    }
}

#[tokio::test]
async fn proxy_resolves_domain_targets() {
    let hooks = Arc::new(RecordTargets::default());
    let proxy = start_proxy(Socks5Server::new("127.0.0.1:0").with_hooks(hooks.clone())).await;
    let echo = tcp_echo_server().await;

    let mut stream = Socks5Client::new(proxy.addr)
        .connect(TargetAddress::domain("localhost", echo.port()))
        .await
        .unwrap();
    stream.write_all(b"by name").await.unwrap();
    let mut buf = [0u8; 7];
    timeout(WAIT, stream.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"by name");

    let targets = hooks.0.lock().unwrap().clone();
    assert_eq!(targets, vec![TargetAddress::domain("localhost", echo.port())]);
}

#[tokio::test]
async fn client_can_resolve_names_itself() {
    let hooks = Arc::new(RecordTargets::default());
    let proxy = start_proxy(Socks5Server::new("127.0.0.1:0").with_hooks(hooks.clone())).await;
    let echo = tcp_echo_server().await;

    let mut stream = Socks5Client::new(proxy.addr)
        .with_local_resolution(true)
        .connect(TargetAddress::domain("127.0.0.1", echo.port()))
        .await
        .unwrap();
    stream.write_all(b"local").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(WAIT, stream.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"local");

    let targets = hooks.0.lock().unwrap().clone();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].address, Address::IPv4(Ipv4Addr::LOCALHOST));
    assert_eq!(targets[0].port, echo.port());
}

#[tokio::test]
async fn udp_associate_round_trip() {
    let proxy = plain_proxy().await;
    let echo = udp_echo_server().await;
    let client = Socks5Client::new(proxy.addr);

    let udp = client.udp_associate().await.unwrap();
    udp.send_to(b"ping", &echo.into()).await.unwrap();
    let (source, payload) = timeout(WAIT, udp.recv_from()).await.unwrap().unwrap();
    assert_eq!(source, TargetAddress::from(echo));
    assert_eq!(payload, b"ping");

    // Closing the control connection ends the association
    drop(udp);
    wait_until_empty(&proxy.sessions).await;
}

#[tokio::test]
async fn target_close_closes_client_side() {
    let proxy = plain_proxy().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1];
        let _ = stream.read_exact(&mut buf).await;
        // Dropping the stream closes the target side
    });

    let mut stream = Socks5Client::new(proxy.addr).connect(target).await.unwrap();
    stream.write_all(b"x").await.unwrap();
    assert!(read_to_end(&mut stream).await.is_empty());
    wait_until_empty(&proxy.sessions).await;
}

#[tokio::test]
async fn shutdown_closes_live_sessions() {
    let proxy = plain_proxy().await;
    let echo = tcp_echo_server().await;

    let mut stream = Socks5Client::new(proxy.addr).connect(echo).await.unwrap();
    assert_eq!(proxy.sessions.len(), 1);

    assert_eq!(proxy.shutdown.shutdown(), 1);
    assert!(read_to_end(&mut stream).await.is_empty());
    assert!(proxy.sessions.is_empty());

    timeout(WAIT, proxy.task).await.unwrap().unwrap().unwrap();
}

struct DenyAll;

impl SessionHooks for DenyAll {
    fn on_session_create(&self, session: &SessionHandle) -> Result<(), HookAbort> {
        Err(HookAbort(format!("{} is not allowed", session.peer_addr())))
    }
}

#[tokio::test]
async fn admission_hook_drops_without_reply() {
    let proxy = start_proxy(Socks5Server::new("127.0.0.1:0").with_hooks(Arc::new(DenyAll))).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    assert!(read_to_end(&mut stream).await.is_empty());
    wait_until_empty(&proxy.sessions).await;
}
