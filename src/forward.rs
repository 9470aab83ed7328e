//! Forwarding handler: picks upstreams by policy and drives
//! [`Proxy::connect`] with fail-over.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::Name;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ForwardConfig, Policy, parse_upstream, parse_zone};
use crate::error::ForwardError;
use crate::health::{self, HealthCheck};
use crate::metrics::MetricsSink;
use crate::persistent::Protocol;
use crate::proto_utils::{error_reply, matches_question, truncate_for_udp};
use crate::proxy::{Options, Proxy, Request};
use crate::tls::{TlsSettings, client_config};

/// Overall budget for one query across every upstream tried.
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Forwarder {
    from: Name,
    except: Vec<Name>,
    proxies: Vec<Arc<Proxy>>,
    policy: Policy,
    opts: Options,
    max_fails: u32,
    timeout: Duration,
    next: AtomicUsize,
    probers: Vec<JoinHandle<()>>,
}

impl Forwarder {
    /// Build one proxy (and one prober) per upstream. Must run inside a tokio
    /// runtime.
    pub fn from_config(cfg: &ForwardConfig, metrics: Arc<dyn MetricsSink>) -> anyhow::Result<Self> {
        let from = parse_zone(&cfg.from)?;
        let except = cfg
            .except
            .iter()
            .map(|z| parse_zone(z))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let upstreams = cfg
            .upstreams
            .iter()
            .map(|raw| parse_upstream(raw))
            .collect::<anyhow::Result<Vec<_>>>()?;
        if upstreams.is_empty() {
            anyhow::bail!("forward.upstreams is empty");
        }

        // 所有 TLS 上游共享一个 ClientConfig
        let tls_cfg = cfg.tls.clone().unwrap_or_default();
        let client_tls = if upstreams.iter().any(|u| u.tls) {
            Some(client_config(&tls_cfg).context("build tls client config")?)
        } else {
            None
        };

        let mut proxies = Vec::with_capacity(upstreams.len());
        let mut probers = Vec::with_capacity(upstreams.len());
        for up in upstreams {
            let tls = match (&client_tls, up.tls) {
                (Some(config), true) => Some(TlsSettings::for_upstream(
                    Arc::clone(config),
                    tls_cfg.server_name.as_deref(),
                    up.addr,
                )?),
                _ => None,
            };
            let proxy = Arc::new(Proxy::new(
                up.addr,
                tls,
                cfg.expire(),
                cfg.read_timeout(),
                Arc::clone(&metrics),
            ));
            let hc = HealthCheck {
                interval: cfg.health_check(),
                max_fails: cfg.max_fails,
                proto: if cfg.force_tcp {
                    Protocol::Tcp
                } else {
                    Protocol::Udp
                },
            };
            probers.push(health::spawn(Arc::clone(&proxy), hc));
            proxies.push(proxy);
        }

        info!(
            target = "forward",
            from = %from,
            upstreams = proxies.len(),
            policy = ?cfg.policy,
            "forwarder ready"
        );

        Ok(Self {
            from,
            except,
            proxies,
            policy: cfg.policy,
            opts: cfg.options(),
            max_fails: cfg.max_fails,
            timeout: DEFAULT_FORWARD_TIMEOUT,
            next: AtomicUsize::new(0),
            probers,
        })
    }

    #[cfg(test)]
    pub fn proxies(&self) -> &[Arc<Proxy>] {
        &self.proxies
    }

    pub fn upstreams(&self) -> Vec<SocketAddr> {
        self.proxies.iter().map(|p| p.addr()).collect()
    }

    /// Whether `qname` should be forwarded: inside `from`, outside every
    /// `except` zone.
    pub fn matches(&self, qname: &Name) -> bool {
        self.from.zone_of(qname) && !self.except.iter().any(|zone| zone.zone_of(qname))
    }

    fn order(&self) -> Vec<usize> {
        let n = self.proxies.len();
        match self.policy {
            Policy::Random => {
                let mut idx: Vec<usize> = (0..n).collect();
                fastrand::shuffle(&mut idx);
                idx
            }
            Policy::RoundRobin => {
                let start = self.next.fetch_add(1, Ordering::Relaxed) % n.max(1);
                (0..n).map(|i| (start + i) % n).collect()
            }
            Policy::Sequential => (0..n).collect(),
        }
    }

    /// Forward `req` to the first upstream that answers.
    ///
    /// Down upstreams are skipped. A reused connection the upstream already
    /// closed is retried on the same upstream with a fresh connection; any
    /// other failure asks that upstream's prober to start checking it and
    /// moves on.
    pub async fn forward(&self, req: &Request) -> Result<Message, ForwardError> {
        let start = Instant::now();
        let mut last_err: Option<ForwardError> = None;

        for idx in self.order() {
            if start.elapsed() >= self.timeout {
                break;
            }
            let proxy = &self.proxies[idx];
            if proxy.down() {
                debug!(upstream = %proxy.addr(), "skipping unhealthy upstream");
                continue;
            }

            let res = loop {
                match proxy.connect(req, self.opts).await {
                    Err(ForwardError::CachedClosed) if start.elapsed() < self.timeout => {
                        debug!(upstream = %proxy.addr(), "cached connection closed, redialing");
                    }
                    other => break other,
                }
            };

            match res {
                Ok(reply) => {
                    if !matches_question(&req.msg, &reply) {
                        warn!(upstream = %proxy.addr(), id = req.msg.id(), "reply does not match question");
                        return Ok(error_reply(&req.msg, ResponseCode::FormErr));
                    }
                    return Ok(reply);
                }
                // flagged down after the check above
                Err(ForwardError::Unhealthy(_)) => continue,
                Err(err) => {
                    warn!(upstream = %proxy.addr(), error = %err, "upstream query failed");
                    if self.max_fails != 0 {
                        proxy.request_probe();
                    }
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or(ForwardError::NoHealthyUpstream))
    }

    /// Answer `req`: REFUSED outside the forwarded zones, SERVFAIL when every
    /// upstream failed.
    pub async fn serve(&self, req: &Request) -> Message {
        let Some(qname) = req.msg.queries().first().map(|q| q.name()) else {
            return error_reply(&req.msg, ResponseCode::FormErr);
        };
        if !self.matches(qname) {
            return error_reply(&req.msg, ResponseCode::Refused);
        }

        match self.forward(req).await {
            Ok(reply) => reply,
            Err(err) => {
                debug!(peer = %req.peer, qname = %qname, error = %err, "forward failed");
                // 上游回复无法完整解码时沿用其头部的 rcode
                let rcode = err
                    .partial_reply()
                    .map(|m| m.response_code())
                    .filter(|rc| *rc != ResponseCode::NoError)
                    .unwrap_or(ResponseCode::ServFail);
                error_reply(&req.msg, rcode)
            }
        }
    }

    /// Decode, serve and encode one packet from a listener. UDP replies larger
    /// than the client accepts are truncated with TC set.
    pub async fn handle_packet(
        &self,
        packet: &[u8],
        peer: SocketAddr,
        proto: Protocol,
    ) -> anyhow::Result<Bytes> {
        let msg = Message::from_vec(packet).context("decode query")?;
        let req = Request::new(msg, proto, peer);
        let mut reply = self.serve(&req).await;

        let mut buf = reply.to_vec().context("encode reply")?;
        if proto == Protocol::Udp && buf.len() > req.size() as usize {
            truncate_for_udp(&mut reply);
            buf = reply.to_vec().context("encode truncated reply")?;
        }
        Ok(Bytes::from(buf))
    }

    /// Stop every transport and prober.
    pub fn stop(&self) {
        for proxy in &self.proxies {
            proxy.stop();
        }
        for prober in &self.probers {
            prober.abort();
        }
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.stop();
    }
}
