use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use hickory_proto::op::Message;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{Instant, timeout, timeout_at};
use tokio_rustls::client::TlsStream;

use crate::error::ConnError;
use crate::proto_utils::header_only;
use crate::tls::TlsSettings;

pub const MIN_UDP_SIZE: u16 = 512;
const MAX_TCP_FRAME: usize = 64 * 1024;

/// Upstream protocol class. Each class has its own slot in the transport cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Tcp,
    TcpTls,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::TcpTls => "tcp-tls",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Stream {
    Udp(UdpSocket),
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// One live connection to one upstream.
///
/// Owned by exactly one holder at a time: the transport's cache or a single
/// in-flight query. Dropping it closes the socket.
pub struct PersistConn {
    stream: Stream,
    proto: Protocol,
    udp_size: u16,
    write_deadline: Option<Instant>,
    read_deadline: Option<Instant>,
    used: Instant,
}

impl fmt::Debug for PersistConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistConn")
            .field("proto", &self.proto)
            .field("local_addr", &self.local_addr().ok())
            .field("udp_size", &self.udp_size)
            .finish()
    }
}

impl PersistConn {
    /// Open a new connection. `dial_timeout` bounds the TCP connect and the
    /// TLS handshake separately; UDP sockets are only bound and connected.
    pub async fn dial(
        addr: SocketAddr,
        proto: Protocol,
        tls: Option<&TlsSettings>,
        dial_timeout: Duration,
    ) -> io::Result<Self> {
        let stream = match proto {
            Protocol::Udp => Stream::Udp(connect_udp(addr).await?),
            Protocol::Tcp => Stream::Tcp(connect_tcp(addr, dial_timeout).await?),
            Protocol::TcpTls => {
                let tls = tls.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "tcp-tls without tls settings")
                })?;
                let tcp = connect_tcp(addr, dial_timeout).await?;
                let handshake = tls.connector().connect(tls.server_name().clone(), tcp);
                let stream = timeout(dial_timeout, handshake)
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tls handshake timed out"))??;
                Stream::Tls(Box::new(stream))
            }
        };
        Ok(Self {
            stream,
            proto,
            udp_size: MIN_UDP_SIZE,
            write_deadline: None,
            read_deadline: None,
            used: Instant::now(),
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.proto
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.stream {
            Stream::Udp(s) => s.local_addr(),
            Stream::Tcp(s) => s.local_addr(),
            Stream::Tls(s) => s.get_ref().0.local_addr(),
        }
    }

    /// Receive buffer size for UDP replies, never below 512.
    pub fn set_udp_size(&mut self, size: u16) {
        self.udp_size = size.max(MIN_UDP_SIZE);
    }

    pub fn udp_size(&self) -> u16 {
        self.udp_size
    }

    pub fn set_write_deadline(&mut self, at: Instant) {
        self.write_deadline = Some(at);
    }

    pub fn set_read_deadline(&mut self, at: Instant) {
        self.read_deadline = Some(at);
    }

    pub(crate) fn touch(&mut self) {
        self.used = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.used.elapsed()
    }

    pub async fn write_msg(&mut self, msg: &Message) -> Result<(), ConnError> {
        let buf = msg.to_vec().map_err(|source| ConnError::Codec {
            source,
            partial: None,
        })?;
        let deadline = self.write_deadline;
        with_deadline(deadline, self.write_raw(&buf)).await?;
        Ok(())
    }

    pub async fn read_msg(&mut self) -> Result<Message, ConnError> {
        let deadline = self.read_deadline;
        let buf = with_deadline(deadline, self.read_raw()).await?;
        Message::from_vec(&buf).map_err(|source| ConnError::Codec {
            source,
            partial: header_only(&buf).map(Box::new),
        })
    }

    async fn write_raw(&mut self, buf: &[u8]) -> io::Result<()> {
        match &mut self.stream {
            Stream::Udp(s) => {
                s.send(buf).await?;
                Ok(())
            }
            Stream::Tcp(s) => write_framed(s, buf).await,
            Stream::Tls(s) => write_framed(s.as_mut(), buf).await,
        }
    }

    async fn read_raw(&mut self) -> io::Result<Vec<u8>> {
        let size = self.udp_size() as usize;
        match &mut self.stream {
            Stream::Udp(s) => {
                let mut buf = vec![0u8; size];
                let len = s.recv(&mut buf).await?;
                buf.truncate(len);
                Ok(buf)
            }
            Stream::Tcp(s) => read_framed(s).await,
            Stream::Tls(s) => read_framed(s.as_mut()).await,
        }
    }
}

async fn with_deadline<T, F>(deadline: Option<Instant>, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match deadline {
        Some(at) => timeout_at(at, fut)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "i/o deadline exceeded"))?,
        None => fut.await,
    }
}

async fn connect_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let (domain, bind) = if addr.is_ipv4() {
        (Domain::IPV4, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
    } else {
        (Domain::IPV6, SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)))
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(SockProtocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&bind.into())?;
    let socket = UdpSocket::from_std(socket.into())?;
    socket.connect(addr).await?;
    Ok(socket)
}

async fn connect_tcp(addr: SocketAddr, dial_timeout: Duration) -> io::Result<TcpStream> {
    let stream = timeout(dial_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tcp connect timed out"))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// RFC 1035 4.2.2: two-byte length prefix, one write so small queries leave
/// in a single segment.
pub(crate) async fn write_framed<S>(stream: &mut S, msg: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let len = u16::try_from(msg.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "dns message exceeds 65535 bytes"))?;
    let mut out = Vec::with_capacity(2 + msg.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(msg);
    stream.write_all(&out).await?;
    stream.flush().await
}

pub(crate) async fn read_framed<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_TCP_FRAME {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad dns frame length"));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}
