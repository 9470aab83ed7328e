use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use hickory_proto::op::Message;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::ForwardError;
use crate::metrics::MetricsSink;
use crate::persistent::{MIN_UDP_SIZE, Protocol};
use crate::proto_utils::{client_size, fresh_id, rcode_label};
use crate::tls::TlsSettings;
use crate::transport::Transport;

/// Upper bound for writing one query.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// 上游协议选择选项 / Upstream protocol preferences.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    /// Always use TCP; wins over `prefer_udp`.
    pub force_tcp: bool,
    pub prefer_udp: bool,
}

/// An inbound query together with how the client sent it.
#[derive(Debug, Clone)]
pub struct Request {
    pub msg: Message,
    pub proto: Protocol,
    pub peer: SocketAddr,
}

impl Request {
    pub fn new(msg: Message, proto: Protocol, peer: SocketAddr) -> Self {
        Self { msg, proto, peer }
    }

    /// Largest reply the client accepts.
    pub fn size(&self) -> u16 {
        client_size(&self.msg, self.proto)
    }
}

pub fn select_protocol(client: Protocol, opts: Options) -> Protocol {
    if opts.force_tcp {
        Protocol::Tcp
    } else if opts.prefer_udp {
        Protocol::Udp
    } else {
        client
    }
}

/// One upstream. All network access goes through its [`Transport`].
pub struct Proxy {
    addr: SocketAddr,
    transport: Transport,
    read_timeout: Duration,
    metrics: Arc<dyn MetricsSink>,
    fails: AtomicU32,
    probe: Notify,
}

impl Proxy {
    pub fn new(
        addr: SocketAddr,
        tls: Option<TlsSettings>,
        expire: Duration,
        read_timeout: Duration,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            addr,
            transport: Transport::new(addr, tls, expire, Arc::clone(&metrics)),
            read_timeout,
            metrics,
            fails: AtomicU32::new(0),
            probe: Notify::new(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub(crate) fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    /// Down once the health checker flagged the transport.
    pub fn down(&self) -> bool {
        !self.transport.is_healthy()
    }

    pub fn fails(&self) -> u32 {
        self.fails.load(Ordering::Relaxed)
    }

    /// Count a failed probe; flag the transport once more than `max_fails`
    /// probes failed in a row. `max_fails == 0` never flags it.
    pub fn record_failure(&self, max_fails: u32) {
        let fails = self.fails.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        if max_fails > 0 && fails > max_fails && self.transport.is_healthy() {
            self.transport.set_healthy(false);
            tracing::warn!(upstream = %self.addr, fails, "upstream marked down");
        }
    }

    pub fn record_success(&self) {
        self.fails.store(0, Ordering::Relaxed);
        if !self.transport.is_healthy() {
            self.transport.set_healthy(true);
            tracing::info!(upstream = %self.addr, "upstream back up");
        }
    }

    /// Ask the health checker to start probing this upstream.
    pub fn request_probe(&self) {
        self.probe.notify_one();
    }

    pub(crate) async fn probe_requested(&self) {
        self.probe.notified().await
    }

    pub fn stop(&self) {
        self.transport.stop();
    }

    /// Forward `req` to this upstream and wait for the matching reply.
    ///
    /// The query leaves with a fresh random id; replies carrying any other id
    /// are dropped, and the returned reply carries the client's id again. On a
    /// write or read error the connection is closed instead of going back to
    /// the cache, and an EOF on a reused connection surfaces as
    /// [`ForwardError::CachedClosed`].
    pub async fn connect(&self, req: &Request, opts: Options) -> Result<Message, ForwardError> {
        let start = Instant::now();
        let proto = select_protocol(req.proto, opts);

        let (mut pc, cached) = self.transport.dial(proto).await?;

        // Set buffer size correctly for this client.
        pc.set_udp_size(req.size().max(MIN_UDP_SIZE));
        pc.set_write_deadline(Instant::now() + MAX_TIMEOUT);

        let origin_id = req.msg.id();
        let mut query = req.msg.clone();
        query.set_id(fresh_id(origin_id));

        if let Err(err) = pc.write_msg(&query).await {
            drop(pc);
            if cached && err.is_closed() {
                return Err(ForwardError::CachedClosed);
            }
            return Err(ForwardError::Write {
                addr: self.addr,
                source: err,
            });
        }

        pc.set_read_deadline(Instant::now() + self.read_timeout);
        let mut reply = loop {
            match pc.read_msg().await {
                Ok(msg) if msg.id() == query.id() => break msg,
                Ok(msg) => {
                    // out-of-order reply from an earlier query on this connection
                    trace!(upstream = %self.addr, got = msg.id(), want = query.id(), "dropped mismatched reply");
                }
                Err(mut err) => {
                    drop(pc);
                    if cached && err.is_closed() {
                        debug!(upstream = %self.addr, proto = %proto, "cached connection closed by upstream");
                        return Err(ForwardError::CachedClosed);
                    }
                    err.restore_id(origin_id);
                    return Err(ForwardError::Read {
                        addr: self.addr,
                        source: err,
                    });
                }
            }
        };
        reply.set_id(origin_id);

        self.transport.yield_conn(pc);

        let rc = rcode_label(reply.response_code());
        self.metrics.request(self.addr, &rc, start.elapsed());

        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnError;
    use crate::metrics::{ForwardMetrics, NoopMetrics};
    use crate::testing::{UpstreamScript, query, tcp_upstream, udp_upstream};
    use crate::transport::DEFAULT_EXPIRE;
    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::RecordType;

    const CLIENT: &str = "127.0.0.1:40000";

    fn proxy(addr: SocketAddr, metrics: Arc<dyn MetricsSink>) -> Proxy {
        Proxy::new(addr, None, DEFAULT_EXPIRE, Duration::from_millis(300), metrics)
    }

    fn request(id: u16, proto: Protocol) -> Request {
        Request::new(query(id, "example.org."), proto, CLIENT.parse().unwrap())
    }

    #[test]
    fn force_tcp_wins_over_prefer_udp() {
        let both = Options {
            force_tcp: true,
            prefer_udp: true,
        };
        assert_eq!(select_protocol(Protocol::Udp, both), Protocol::Tcp);
        let udp = Options {
            force_tcp: false,
            prefer_udp: true,
        };
        assert_eq!(select_protocol(Protocol::Tcp, udp), Protocol::Udp);
        assert_eq!(select_protocol(Protocol::Tcp, Options::default()), Protocol::Tcp);
        assert_eq!(select_protocol(Protocol::Udp, Options::default()), Protocol::Udp);
    }

    #[tokio::test]
    async fn connect_rewrites_and_restores_the_id() {
        let up = udp_upstream(UpstreamScript::Answer).await;
        let metrics = Arc::new(ForwardMetrics::new());
        let p = proxy(up.addr, metrics.clone());

        let req = request(0x1234, Protocol::Udp);
        let reply = p.connect(&req, Options::default()).await.expect("reply");

        assert_eq!(reply.id(), 0x1234);
        assert_eq!(req.msg.id(), 0x1234);
        assert_eq!(reply.answers().len(), 1);
        assert_eq!(reply.answers()[0].record_type(), RecordType::A);

        let seen = up.seen_ids();
        assert_eq!(seen.len(), 1);
        assert_ne!(seen[0], 0x1234);

        // the connection is now cached for udp
        let (_, cached) = p.transport().dial(Protocol::Udp).await.unwrap();
        assert!(cached);

        assert_eq!(metrics.request_count(up.addr), 1);
        assert_eq!(metrics.rcode_count("NOERROR", up.addr), 1);
        assert_eq!(metrics.duration_count(up.addr, "NOERROR"), 1);
    }

    #[tokio::test]
    async fn reused_connection_gets_a_new_id_each_time() {
        let up = udp_upstream(UpstreamScript::Answer).await;
        let p = proxy(up.addr, Arc::new(NoopMetrics));
        for _ in 0..5 {
            let reply = p.connect(&request(7, Protocol::Udp), Options::default()).await.unwrap();
            assert_eq!(reply.id(), 7);
        }
        assert!(up.seen_ids().iter().all(|id| *id != 7));
    }

    #[tokio::test]
    async fn mismatched_reply_is_skipped() {
        let up = udp_upstream(UpstreamScript::MismatchFirst).await;
        let p = proxy(up.addr, Arc::new(NoopMetrics));
        let reply = p
            .connect(&request(0x4242, Protocol::Udp), Options::default())
            .await
            .expect("matching reply after the stale one");
        assert_eq!(reply.id(), 0x4242);
        assert_eq!(reply.answers().len(), 1);
    }

    #[tokio::test]
    async fn mismatched_reply_is_skipped_over_tcp() {
        let up = tcp_upstream(UpstreamScript::MismatchFirst).await;
        let p = proxy(up.addr, Arc::new(NoopMetrics));
        let reply = p
            .connect(&request(0x4242, Protocol::Tcp), Options::default())
            .await
            .expect("reply");
        assert_eq!(reply.id(), 0x4242);
    }

    #[tokio::test]
    async fn late_duplicate_on_reused_connection_is_skipped() {
        let up = udp_upstream(UpstreamScript::AnswerThenDuplicate).await;
        let p = proxy(up.addr, Arc::new(NoopMetrics));

        for id in 1..=3u16 {
            let reply = p
                .connect(&request(id, Protocol::Udp), Options::default())
                .await
                .expect("reply");
            assert_eq!(reply.id(), id);
        }
        // every query after the first went out on the cached socket, where the
        // previous query's duplicate answer was still queued
        let seen = up.seen_ids();
        assert_eq!(seen.len(), 3);
        let (_, cached) = p.transport().dial(Protocol::Udp).await.unwrap();
        assert!(cached);
    }

    #[tokio::test]
    async fn reset_cached_tcp_connection_reports_cached_closed() {
        let up = tcp_upstream(UpstreamScript::AnswerOnceThenReset).await;
        let p = proxy(up.addr, Arc::new(NoopMetrics));

        p.connect(&request(1, Protocol::Tcp), Options::default())
            .await
            .expect("first query");
        up.closed.notified().await;
        // let the RST land before the next write
        tokio::time::sleep(Duration::from_millis(20)).await;

        match p.connect(&request(2, Protocol::Tcp), Options::default()).await {
            Err(ForwardError::CachedClosed) => {}
            other => panic!("expected CachedClosed, got {other:?}"),
        }
        let (_, cached) = p.transport().dial(Protocol::Tcp).await.unwrap();
        assert!(!cached);
    }

    #[tokio::test]
    async fn stale_tcp_connection_reports_cached_closed() {
        let up = tcp_upstream(UpstreamScript::AnswerOnceThenClose).await;
        let p = proxy(up.addr, Arc::new(NoopMetrics));

        p.connect(&request(1, Protocol::Tcp), Options::default())
            .await
            .expect("first query");
        up.closed.notified().await;

        match p.connect(&request(2, Protocol::Tcp), Options::default()).await {
            Err(ForwardError::CachedClosed) => {}
            other => panic!("expected CachedClosed, got {other:?}"),
        }

        // the dead connection was not put back; the next attempt dials fresh
        let reply = p
            .connect(&request(3, Protocol::Tcp), Options::default())
            .await
            .expect("fresh connection");
        assert_eq!(reply.id(), 3);
    }

    #[tokio::test]
    async fn eof_on_fresh_connection_is_a_plain_read_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // accept and hang up straight away
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });
        let p = proxy(addr, Arc::new(NoopMetrics));
        match p.connect(&request(9, Protocol::Tcp), Options::default()).await {
            Err(ForwardError::Read { source, .. }) => assert!(source.is_closed()),
            Err(ForwardError::Write { source, .. }) => assert!(source.is_closed()),
            other => panic!("expected read/write error, got {other:?}"),
        }
        let (_, cached) = p.transport().dial(Protocol::Tcp).await.unwrap();
        assert!(!cached);
    }

    #[tokio::test]
    async fn read_timeout_discards_the_connection() {
        let up = udp_upstream(UpstreamScript::Silent).await;
        let metrics = Arc::new(ForwardMetrics::new());
        let p = proxy(up.addr, metrics.clone());
        match p.connect(&request(5, Protocol::Udp), Options::default()).await {
            Err(ForwardError::Read {
                source: ConnError::Io(err),
                ..
            }) => assert_eq!(err.kind(), std::io::ErrorKind::TimedOut),
            other => panic!("expected timeout, got {other:?}"),
        }
        let (_, cached) = p.transport().dial(Protocol::Udp).await.unwrap();
        assert!(!cached);
        assert_eq!(metrics.request_count(up.addr), 0);
    }

    #[tokio::test]
    async fn undecodable_reply_carries_partial_with_original_id() {
        let up = udp_upstream(UpstreamScript::Garbled).await;
        let p = proxy(up.addr, Arc::new(NoopMetrics));
        let err = p
            .connect(&request(0x0bad, Protocol::Udp), Options::default())
            .await
            .unwrap_err();
        let partial = err.partial_reply().expect("partial reply");
        assert_eq!(partial.id(), 0x0bad);
        assert_eq!(partial.response_code(), ResponseCode::Refused);
    }

    #[tokio::test]
    async fn force_tcp_sends_udp_clients_over_tcp() {
        let up = tcp_upstream(UpstreamScript::Answer).await;
        let p = proxy(up.addr, Arc::new(NoopMetrics));
        let opts = Options {
            force_tcp: true,
            prefer_udp: true,
        };
        let reply = p.connect(&request(11, Protocol::Udp), opts).await.expect("tcp reply");
        assert_eq!(reply.id(), 11);
        let (_, cached) = p.transport().dial(Protocol::Tcp).await.unwrap();
        assert!(cached);
    }

    #[tokio::test]
    async fn probe_counters_flip_health() {
        let p = proxy("127.0.0.1:9".parse().unwrap(), Arc::new(NoopMetrics));
        p.record_failure(2);
        p.record_failure(2);
        assert!(!p.down());
        p.record_failure(2);
        assert!(p.down());
        p.record_success();
        assert!(!p.down());
        assert_eq!(p.fails(), 0);

        for _ in 0..10 {
            p.record_failure(0);
        }
        assert!(!p.down());
    }
}
