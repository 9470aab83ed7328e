mod config;
mod error;
mod forward;
mod health;
mod metrics;
mod persistent;
mod proto_utils;
mod proxy;
#[cfg(test)]
mod testing;
mod tls;
mod transport;
mod watcher;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use arc_swap::ArcSwap;
use bytes::BytesMut;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::load_config;
use crate::forward::Forwarder;
use crate::metrics::{ForwardMetrics, MetricsSink};
use crate::persistent::Protocol;

const MAX_UDP_PACKET: usize = 4096;
const MAX_TCP_FRAME: usize = 64 * 1024;

type SharedForwarder = Arc<ArcSwap<Forwarder>>;

#[derive(Parser, Debug)]
#[command(author, version, about = "kixfwd DNS forwarder with persistent upstream connections", long_about = None)]
struct Args {
    /// 配置文件路径（JSON）
    #[arg(short = 'c', long = "config", default_value = "config/forward.json")]
    config: PathBuf,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// UDP worker 数量（默认 CPU 核心数）
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
    /// 周期性输出转发统计（秒），0 表示关闭
    #[arg(long = "stats-interval", default_value_t = 0)]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let cfg = load_config(&args.config).context("load initial config")?;
    let bind_addr: SocketAddr = cfg.settings.bind_udp.parse().context("parse bind addr")?;
    let bind_tcp: SocketAddr = cfg
        .settings
        .bind_tcp
        .parse()
        .context("parse tcp bind addr")?;

    // 统计跨热加载保留
    let stats = Arc::new(ForwardMetrics::new());
    let metrics: Arc<dyn MetricsSink> = stats.clone();

    let forwarder = Forwarder::from_config(&cfg.forward, Arc::clone(&metrics))
        .context("build forwarder")?;
    let upstreams = forwarder.upstreams();
    let forwarder: SharedForwarder = Arc::new(ArcSwap::from_pointee(forwarder));

    watcher::spawn(
        args.config.clone(),
        forwarder.clone(),
        Arc::clone(&metrics),
        Handle::current(),
    );

    // UDP worker 数量：默认为 CPU 核心数，最少 1 个
    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else {
        num_cpus::get().max(1)
    };

    info!(bind_udp = %bind_addr, bind_tcp = %bind_tcp, udp_workers = udp_workers, upstreams = ?upstreams, "dns forwarder started");

    let mut handles = Vec::with_capacity(udp_workers + 2);

    #[cfg(unix)]
    {
        // On Unix create individual sockets with SO_REUSEPORT so kernel distributes packets
        for worker_id in 0..udp_workers {
            let forwarder = forwarder.clone();
            let std_socket = create_reuseport_udp_socket(bind_addr)
                .with_context(|| format!("create udp socket for worker {}", worker_id))?;
            let socket = UdpSocket::from_std(std_socket)?;
            handles.push(tokio::spawn(async move {
                if let Err(err) = run_udp_worker(worker_id, Arc::new(socket), forwarder).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            }));
        }
    }

    #[cfg(not(unix))]
    {
        // Non-Unix: one shared socket, several workers
        use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
        let domain = if bind_addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket =
            Socket::new(domain, Type::DGRAM, Some(SockProtocol::UDP)).context("create socket")?;
        let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
        let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
        socket.set_nonblocking(true).context("set nonblocking")?;
        socket.bind(&bind_addr.into()).context("bind socket")?;

        let udp_socket = Arc::new(UdpSocket::from_std(socket.into()).context("from_std")?);
        for worker_id in 0..udp_workers {
            let forwarder = forwarder.clone();
            let socket = Arc::clone(&udp_socket);
            handles.push(tokio::spawn(async move {
                if let Err(err) = run_udp_worker(worker_id, socket, forwarder).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            }));
        }
    }

    // TCP listener
    let tcp_listener = TcpListener::bind(bind_tcp)
        .await
        .context("bind tcp listener")?;
    let tcp_forwarder = forwarder.clone();
    handles.push(tokio::spawn(async move {
        if let Err(err) = run_tcp(tcp_listener, tcp_forwarder).await {
            error!(error = %err, "tcp server exited");
        }
    }));

    if args.stats_interval > 0 {
        let interval = Duration::from_secs(args.stats_interval);
        let stats = Arc::clone(&stats);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                info!(target = "stats", snapshot = %stats.snapshot(), "forward stats");
            }
        }));
    }

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");
    for h in &handles {
        h.abort();
    }
    forwarder.load().stop();

    Ok(())
}

fn init_tracing(debug: bool) {
    // 默认禁用 JSON，非 debug 仅 warn
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_level(debug);

    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

// 在 Unix 上创建带 SO_REUSEPORT 的 UDP socket
#[cfg(unix)]
fn create_reuseport_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    use libc::{SO_REUSEPORT, SOL_SOCKET, c_int, c_void, setsockopt, socklen_t};
    use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
    use std::os::unix::io::AsRawFd;

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(SockProtocol::UDP))?;
    socket.set_reuse_address(true)?;
    let val: c_int = 1;
    let fd = socket.as_raw_fd();
    // SAFETY: fd is a live socket owned by `socket`; val outlives the call.
    let ret = unsafe {
        setsockopt(
            fd,
            SOL_SOCKET,
            SO_REUSEPORT,
            &val as *const _ as *const c_void,
            std::mem::size_of_val(&val) as socklen_t,
        )
    };
    if ret != 0 {
        // non-fatal: continue without reuseport
        debug!(addr = %addr, "SO_REUSEPORT unavailable");
    }
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// 每个请求一个任务：上游往返期间接收循环不阻塞
async fn run_udp_worker(
    worker_id: usize,
    socket: Arc<UdpSocket>,
    forwarder: SharedForwarder,
) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(MAX_UDP_PACKET);

    loop {
        buf.resize(MAX_UDP_PACKET, 0);
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                buf.truncate(len);
                let packet = buf.split().freeze();

                // 在途请求持有当前 Forwarder，热加载不影响已发出的查询
                let forwarder = forwarder.load_full();
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    match forwarder.handle_packet(&packet, peer, Protocol::Udp).await {
                        Ok(resp) => {
                            let _ = socket.send_to(&resp, peer).await;
                        }
                        Err(err) => {
                            debug!(worker_id, peer = %peer, error = %err, "dropped udp packet");
                        }
                    }
                });
            }
            Err(_) => {
                // 继续接收，不退出
                buf.clear();
            }
        }
    }
}

async fn run_tcp(listener: TcpListener, forwarder: SharedForwarder) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let forwarder = forwarder.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_tcp_conn(stream, peer, forwarder).await {
                debug!(peer = %peer, error = %err, "tcp connection closed");
            }
        });
    }
}

async fn handle_tcp_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    forwarder: SharedForwarder,
) -> anyhow::Result<()> {
    let mut len_buf = [0u8; 2];

    loop {
        if let Err(err) = stream.read_exact(&mut len_buf).await {
            if err.kind() != std::io::ErrorKind::UnexpectedEof {
                return Err(err.into());
            }
            return Ok(());
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 || frame_len > MAX_TCP_FRAME {
            return Ok(());
        }

        let mut buf = vec![0u8; frame_len];
        if stream.read_exact(&mut buf).await.is_err() {
            return Ok(());
        }

        let resp = match forwarder
            .load_full()
            .handle_packet(&buf, peer, Protocol::Tcp)
            .await
        {
            Ok(r) => r,
            Err(_) => return Ok(()),
        };

        if resp.len() <= u16::MAX as usize {
            let len_bytes = (resp.len() as u16).to_be_bytes();
            if stream.write_all(&len_bytes).await.is_err() {
                return Ok(());
            }
            if stream.write_all(&resp).await.is_err() {
                return Ok(());
            }
        }
    }
}
