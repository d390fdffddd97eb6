//! The per-host watcher: configuration, the probe cycle, and the
//! single-task scheduling loop that drives it.

use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{error, info, warn};

use crate::error::WatchError;
use crate::packet::{EchoRequest, IcmpKind, Message};
use crate::transport::{self, Channel, IcmpChannel, MAX_REPLY_LEN};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_TTL: u32 = 64;
pub const DEFAULT_SOURCE: &str = "0.0.0.0";

// Effectively never: tokio clamps timer deadlines to roughly 2.2 years out,
// so an unconfigured timeout cannot fire within a process lifetime.
const NO_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

// Completed cycles queued for the receive callback. Enqueue and dequeue both
// happen on the watcher's own loop, so with one cycle in flight at a time
// this depth is never reached; it becomes the backpressure bound if cycles
// ever overlap.
const RECV_QUEUE_DEPTH: usize = 5;

/// One successful probe: the decoded reply and the wall-clock round trip
/// measured from just before send to just after the reply was read.
#[derive(Debug, Clone)]
pub struct ProbeStat {
    pub message: Message,
    pub peer: IpAddr,
    pub duration: Duration,
}

/// Per-watcher context handed to every callback.
#[derive(Debug, Clone)]
pub struct ProbeContext<'a> {
    pub addr: &'a str,
    pub target: Option<IpAddr>,
    pub sequence: u16,
    pub ttl: u32,
}

/// Notification hooks for the reporting side. The watcher has no opinion on
/// what consumers do with these; the default just logs.
pub trait Events: Send + Sync {
    fn on_timeout(&self, ctx: &ProbeContext<'_>);
    fn on_recv(&self, ctx: &ProbeContext<'_>, stat: &ProbeStat);
    fn on_error(&self, ctx: &ProbeContext<'_>, err: &WatchError);
}

/// Default callbacks: structured log lines via tracing.
pub struct LogEvents;

impl Events for LogEvents {
    fn on_timeout(&self, ctx: &ProbeContext<'_>) {
        warn!(addr = ctx.addr, "timeout");
    }

    fn on_recv(&self, ctx: &ProbeContext<'_>, stat: &ProbeStat) {
        info!(
            addr = ctx.addr,
            peer = %stat.peer,
            icmp_seq = ctx.sequence,
            ttl = ctx.ttl,
            rtt = ?stat.duration,
            "reply"
        );
    }

    fn on_error(&self, ctx: &ProbeContext<'_>, err: &WatchError) {
        error!(
            addr = ctx.addr,
            icmp_seq = ctx.sequence,
            ttl = ctx.ttl,
            error = %err,
            "probe failed"
        );
    }
}

/// Availability watcher for a single host.
///
/// Configure with the setters before calling [`Watcher::run`]; the setters
/// take `&mut self`, so reconfiguring a running watcher is rejected at
/// compile time. [`Watcher::stop`] is safe from any task, any number of
/// times.
pub struct Watcher {
    interval: Duration,
    timeout: Duration,
    read_deadline: Duration,
    size: usize,
    ttl: u32,
    source: String,
    privileged: bool,

    addr: String,
    target: OnceLock<IpAddr>,

    ident: u16,
    // Tags every outbound request. Currently constant for the watcher's
    // lifetime; with one probe in flight at a time the identifier alone
    // correlates replies.
    sequence: u16,

    stopped: AtomicBool,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,

    events: Arc<dyn Events>,
}

impl Watcher {
    /// New watcher with defaults. The echo identifier is drawn once from
    /// `rng` and never changes; seed the rng to make it deterministic.
    pub fn new<R: Rng>(addr: impl Into<String>, rng: &mut R) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            interval: DEFAULT_INTERVAL,
            timeout: NO_TIMEOUT,
            read_deadline: Duration::ZERO,
            size: 0,
            ttl: DEFAULT_TTL,
            source: DEFAULT_SOURCE.to_string(),
            privileged: false,
            addr: addr.into(),
            target: OnceLock::new(),
            ident: rng.random(),
            sequence: 0,
            stopped: AtomicBool::new(false),
            stop_tx,
            stop_rx,
            events: Arc::new(LogEvents),
        }
    }

    /// New watcher with the target resolved up front.
    pub async fn resolved<R: Rng>(addr: impl Into<String>, rng: &mut R) -> Result<Self, WatchError> {
        let w = Self::new(addr, rng);
        w.resolve().await?;
        Ok(w)
    }

    /// Look up the target address. Runs at most once; later calls are no-ops.
    pub async fn resolve(&self) -> Result<(), WatchError> {
        if self.target.get().is_some() {
            return Ok(());
        }
        let ip = transport::resolve(&self.addr).await?;
        let _ = self.target.set(ip);
        Ok(())
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Resolved target address, if resolution has happened.
    pub fn target(&self) -> Option<IpAddr> {
        self.target.get().copied()
    }

    pub fn ident(&self) -> u16 {
        self.ident
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Global timeout: fires the timeout callback when no useful reply has
    /// been seen for this long. Defaults to effectively never.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Per-cycle bound on waiting for a reply. A zero deadline makes every
    /// cycle time out immediately.
    pub fn set_read_deadline(&mut self, deadline: Duration) {
        self.read_deadline = deadline;
    }

    pub fn set_ttl(&mut self, ttl: u32) {
        self.ttl = ttl;
    }

    /// Payload size in bytes of each echo request.
    pub fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    /// Local address probe sockets bind to.
    pub fn set_source(&mut self, source: impl Into<String>) {
        self.source = source.into();
    }

    /// true sends privileged raw ICMP; false sends unprivileged datagram
    /// ICMP. Raw sockets require super-user privileges.
    pub fn set_privileged(&mut self, privileged: bool) {
        self.privileged = privileged;
    }

    pub fn set_events(&mut self, events: Arc<dyn Events>) {
        self.events = events;
    }

    /// Request the loop to stop. Idempotent and safe to call concurrently;
    /// the signal fires exactly once. A cycle already waiting on a reply
    /// finishes first, so stop latency is bounded by the read deadline.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            let _ = self.stop_tx.send(true);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Resolve if needed, open the channel, and run the probe loop until
    /// stopped. Resolution and channel-open failures are fatal: the loop
    /// never starts and the error is returned for the caller to act on.
    pub async fn run(&self) -> Result<(), WatchError> {
        self.resolve().await?;
        let ip = match self.target.get() {
            Some(ip) => *ip,
            None => return Err(WatchError::Resolve(self.addr.clone())),
        };

        let channel = match IcmpChannel::open(ip.is_ipv4(), self.privileged, &self.source) {
            Ok(c) => c,
            Err(err) => {
                self.stop();
                return Err(err);
            }
        };
        channel.set_ttl(self.ttl).map_err(WatchError::Transport)?;

        self.run_with(Arc::new(channel)).await
    }

    /// The scheduling loop, on a caller-supplied channel. One watcher, one
    /// loop: it interleaves the interval ticker (each tick runs one probe
    /// cycle inline), the global timeout ticker, completed results, and the
    /// stop signal.
    pub async fn run_with(&self, channel: Arc<dyn Channel>) -> Result<(), WatchError> {
        self.resolve().await?;

        let mut stop = self.stop_rx.clone();
        if *stop.borrow() {
            return Ok(());
        }

        let start = Instant::now();
        let mut timeout = interval_at(start + self.timeout, self.timeout);
        let mut ticker = interval_at(start + self.interval, self.interval);
        // Drop ticks missed while a cycle was blocking, like a ticker whose
        // consumer was busy: no catch-up bursts, cadence just drifts.
        timeout.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let (recv_tx, mut recv_rx) = mpsc::channel::<ProbeStat>(RECV_QUEUE_DEPTH);

        loop {
            tokio::select! {
                _ = stop.changed() => return Ok(()),
                _ = timeout.tick() => {
                    self.events.on_timeout(&self.context());
                }
                _ = ticker.tick() => {
                    match self.probe_once(&channel).await {
                        // this loop is the only producer and consumer, so
                        // the queue cannot be full here
                        Ok(stat) => { let _ = recv_tx.try_send(stat); }
                        Err(err) => self.events.on_error(&self.context(), &err),
                    }
                }
                Some(stat) = recv_rx.recv() => {
                    self.events.on_recv(&self.context(), &stat);
                }
            }
        }
    }

    /// One probe cycle: encode, send, wait for a reply bounded by the read
    /// deadline, classify. Runs on the blocking pool and is awaited inline
    /// by the loop, so exactly one cycle is in flight at a time.
    async fn probe_once(&self, channel: &Arc<dyn Channel>) -> Result<ProbeStat, WatchError> {
        let ip = match self.target.get() {
            Some(ip) => *ip,
            None => return Err(WatchError::Resolve(self.addr.clone())),
        };
        let v4 = ip.is_ipv4();
        let request = EchoRequest {
            ident: self.ident,
            seq: self.sequence,
            size: self.size,
        };
        let deadline = self.read_deadline;
        let channel = Arc::clone(channel);

        tokio::task::spawn_blocking(move || {
            let wire = request.encode(v4);

            let sent_at = std::time::Instant::now();
            let n = channel.send(&wire, ip)?;
            if n != wire.len() {
                return Err(WatchError::ShortWrite {
                    written: n,
                    expected: wire.len(),
                });
            }

            let mut buf = [0u8; MAX_REPLY_LEN];
            let (n, peer) = channel.recv(&mut buf, deadline).map_err(WatchError::from_recv)?;
            let duration = sent_at.elapsed();

            let message = Message::parse(&buf[..n], v4)?;
            match message.kind {
                IcmpKind::EchoReply => Ok(ProbeStat { message, peer, duration }),
                kind => Err(WatchError::UnexpectedReply { kind, peer }),
            }
        })
        .await
        .map_err(|e| WatchError::Io(io::Error::other(e)))?
    }

    fn context(&self) -> ProbeContext<'_> {
        ProbeContext {
            addr: &self.addr,
            target: self.target.get().copied(),
            sequence: self.sequence,
            ttl: self.ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn defaults() {
        let mut rng = StdRng::seed_from_u64(0);
        let w = Watcher::new("example.com", &mut rng);
        assert_eq!(w.interval, DEFAULT_INTERVAL);
        assert_eq!(w.ttl, DEFAULT_TTL);
        assert_eq!(w.source, DEFAULT_SOURCE);
        assert_eq!(w.size, 0);
        assert_eq!(w.read_deadline, Duration::ZERO);
        assert!(!w.privileged);
        assert_eq!(w.sequence(), 0);
        assert!(w.target().is_none());
        assert!(!w.is_stopped());
    }

    #[test]
    fn identifier_is_deterministic_under_seeded_rng() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        let w1 = Watcher::new("a", &mut a);
        let w2 = Watcher::new("b", &mut b);
        assert_eq!(w1.ident(), w2.ident());

        // stays put no matter how often it is read
        let before = w1.ident();
        for _ in 0..100 {
            assert_eq!(w1.ident(), before);
        }
    }

    #[test]
    fn stop_is_idempotent() {
        let mut rng = StdRng::seed_from_u64(0);
        let w = Watcher::new("example.com", &mut rng);
        w.stop();
        w.stop();
        w.stop();
        assert!(w.is_stopped());
        assert!(*w.stop_rx.borrow());
    }

    #[test]
    fn stop_from_many_threads() {
        let mut rng = StdRng::seed_from_u64(0);
        let w = Arc::new(Watcher::new("example.com", &mut rng));
        std::thread::scope(|s| {
            for _ in 0..16 {
                let w = Arc::clone(&w);
                s.spawn(move || w.stop());
            }
        });
        assert!(w.is_stopped());
    }

    #[tokio::test]
    async fn run_fails_fast_on_unresolvable_addr() {
        let mut rng = StdRng::seed_from_u64(0);
        let w = Watcher::new("", &mut rng);
        let err = w.run().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, WatchError::Resolve(_)));
    }
}
