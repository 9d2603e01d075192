//! Dial synchronization and the ranked dial executor.
//!
//! The [`DialSync`] ensures that, per remote peer, at most one
//! address-ranked dial sequence runs at a time: concurrent callers share a
//! lazily-created per-peer worker and all observe the same outcome. A
//! caller abandoning its dial (dropping the future) only removes that
//! caller from the wait set; the worker's lifetime is governed by a
//! reference count, and its cancellation carries a typed cause.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use multiaddr::Multiaddr;
use peermesh_common::{EventType, LogEvent};
use peermesh_types::{Direction, PeerId};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::addr;
use crate::conn::Connection;
use crate::dial_ranker::{default_ranking, no_delay_ranking};
use crate::error::{DialAttempt, GatePhase, NetworkError, NetworkResult};
use crate::rcmgr::ConnScopeHandle;
use crate::swarm::SwarmInner;

/// Per-call dial options.
#[derive(Debug, Clone, Copy, Default)]
pub struct DialOpts {
    /// Refuse relayed paths; only direct addresses are attempted.
    pub force_direct: bool,
    /// Rendezvous dial: attempt every address immediately, with no
    /// ranking delays.
    pub simultaneous_connect: bool,
}

/// Why a per-peer dial worker was told to stop.
#[derive(Debug, Clone)]
pub enum DialCancelCause {
    /// Another caller's dial already produced the connection.
    ConcurrentDialSucceeded,
    /// The last interested caller observed this failure.
    Failed(NetworkError),
    /// Every caller went away before a result was produced.
    Abandoned,
}

struct DialRequest {
    opts: DialOpts,
    resp: oneshot::Sender<NetworkResult<Connection>>,
}

/// Per-peer dial coordination record.
struct ActiveDial {
    ref_cnt: usize,
    cancel: CancellationToken,
    cause: Arc<Mutex<Option<DialCancelCause>>>,
    req_tx: mpsc::UnboundedSender<DialRequest>,
}

/// Ensures at most one ranked dial sequence per peer at any time.
pub(crate) struct DialSync {
    dials: Mutex<HashMap<PeerId, ActiveDial>>,
}

/// Decrements the reference count when a caller leaves the wait set, even
/// when its future is simply dropped. The last guard out tears the record
/// down: stores the cancellation cause, cancels the worker, and removes the
/// record (closing the request channel).
struct DialRefGuard<'a> {
    sync: &'a DialSync,
    peer: PeerId,
    outcome: Option<Result<(), NetworkError>>,
}

impl Drop for DialRefGuard<'_> {
    fn drop(&mut self) {
        let mut dials = self.sync.dials.lock().unwrap();
        let Some(entry) = dials.get_mut(&self.peer) else {
            return;
        };
        entry.ref_cnt -= 1;
        if entry.ref_cnt == 0 {
            let entry = dials.remove(&self.peer).unwrap();
            let cause = match self.outcome.take() {
                Some(Ok(())) => DialCancelCause::ConcurrentDialSucceeded,
                Some(Err(e)) => DialCancelCause::Failed(e),
                None => DialCancelCause::Abandoned,
            };
            *entry.cause.lock().unwrap() = Some(cause);
            entry.cancel.cancel();
            // dropping the entry closes the request channel; the worker
            // drains and exits
        }
    }
}

impl DialSync {
    pub(crate) fn new() -> Self {
        Self {
            dials: Mutex::new(HashMap::new()),
        }
    }

    /// Cancel every in-flight dial. Used at swarm shutdown; waiting callers
    /// observe canceled attempts instead of running out their timeouts.
    pub(crate) fn cancel_all(&self) {
        let dials = self.dials.lock().unwrap();
        for entry in dials.values() {
            *entry.cause.lock().unwrap() =
                Some(DialCancelCause::Failed(NetworkError::SwarmClosed));
            entry.cancel.cancel();
        }
    }

    /// Dial `peer`, sharing any dial already in flight for it.
    pub(crate) async fn dial(
        &self,
        swarm: &Arc<SwarmInner>,
        peer: PeerId,
        opts: DialOpts,
    ) -> NetworkResult<Connection> {
        let req_tx = {
            let mut dials = self.dials.lock().unwrap();
            let entry = dials.entry(peer).or_insert_with(|| {
                // The worker's context is detached from any individual
                // caller: it is only canceled when the last caller leaves.
                let (req_tx, req_rx) = mpsc::unbounded_channel();
                let cancel = CancellationToken::new();
                let cause = Arc::new(Mutex::new(None));
                swarm.tracker.spawn(dial_worker(
                    swarm.clone(),
                    peer,
                    req_rx,
                    cancel.clone(),
                    cause.clone(),
                ));
                ActiveDial {
                    ref_cnt: 0,
                    cancel,
                    cause,
                    req_tx,
                }
            });
            entry.ref_cnt += 1;
            entry.req_tx.clone()
        };

        let mut guard = DialRefGuard {
            sync: self,
            peer,
            outcome: None,
        };

        let (resp_tx, resp_rx) = oneshot::channel();
        if req_tx
            .send(DialRequest {
                opts,
                resp: resp_tx,
            })
            .is_err()
        {
            return Err(NetworkError::ChannelClosed);
        }

        let result = match resp_rx.await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::DialCanceled),
        };
        guard.outcome = Some(result.as_ref().map(|_| ()).map_err(Clone::clone));
        result
    }
}

/// Per-peer worker: serves dial requests one ranked sequence at a time,
/// fanning each outcome out to every caller that joined while it ran.
async fn dial_worker(
    swarm: Arc<SwarmInner>,
    peer: PeerId,
    mut reqs: mpsc::UnboundedReceiver<DialRequest>,
    cancel: CancellationToken,
    cause: Arc<Mutex<Option<DialCancelCause>>>,
) {
    debug!("dial worker for {} started", peer.short());
    let mut reqs_open = true;

    while reqs_open {
        let first = tokio::select! {
            req = reqs.recv() => match req {
                Some(req) => req,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };
        let opts = first.opts;
        let mut waiters = vec![first.resp];

        // An existing live connection satisfies the dial immediately.
        if let Some(conn) = swarm.best_conn_to(&peer) {
            debug!("reusing existing connection {} for dial", conn.debug_id());
            for w in waiters.drain(..) {
                let _ = w.send(Ok(conn.clone()));
            }
            continue;
        }

        swarm.metrics.inc_dials_started();
        LogEvent::new(EventType::DialStarted).with_peer(&peer).emit();
        let started = Instant::now();

        let attempt_cancel = cancel.child_token();
        let mut dial = Box::pin(dial_ranked(swarm.clone(), peer, opts, attempt_cancel));
        let result = loop {
            if reqs_open {
                tokio::select! {
                    res = &mut dial => break res,
                    req = reqs.recv() => match req {
                        // Callers joining mid-dial share this outcome.
                        Some(req) => waiters.push(req.resp),
                        None => reqs_open = false,
                    },
                }
            } else {
                break dial.await;
            }
        };

        match &result {
            Ok(conn) => {
                LogEvent::new(EventType::DialSucceeded)
                    .with_peer(&peer)
                    .with_correlation_id(conn.debug_id())
                    .with_duration(started.elapsed())
                    .emit();
            }
            Err(e) => {
                swarm.metrics.inc_dials_failed();
                LogEvent::new(EventType::DialFailed)
                    .with_peer(&peer)
                    .with_duration(started.elapsed())
                    .with_error(e.to_string())
                    .emit();
            }
        }

        for w in waiters.drain(..) {
            let _ = w.send(result.clone());
        }
    }

    debug!(
        "dial worker for {} stopped: {:?}",
        peer.short(),
        cause.lock().unwrap()
    );
}

/// One ranked dial sequence: gate the peer, collect and gate candidate
/// addresses, rank them into delay tiers, race the attempts, and admit the
/// winner into the registry. Per-candidate failures are aggregated so the
/// caller can tell gating rejections from timeouts from dead addresses.
async fn dial_ranked(
    swarm: Arc<SwarmInner>,
    peer: PeerId,
    opts: DialOpts,
    cancel: CancellationToken,
) -> NetworkResult<Connection> {
    if !swarm.gater.intercept_peer_dial(&peer) {
        swarm.metrics.inc_gate_rejections();
        return Err(NetworkError::GatingRejected {
            phase: GatePhase::PeerDial,
            reason: 0,
        });
    }

    let known = swarm.address_book.get(&peer).await;
    if known.is_empty() {
        return Err(NetworkError::NoAddresses(peer));
    }

    let mut failures: Vec<DialAttempt> = Vec::new();
    let mut candidates = Vec::new();
    for a in known {
        if opts.force_direct && addr::is_relay(&a) {
            continue;
        }
        if !swarm.gater.intercept_addr_dial(&peer, &a) {
            swarm.metrics.inc_gate_rejections();
            failures.push(DialAttempt {
                addr: a,
                error: Box::new(NetworkError::GatingRejected {
                    phase: GatePhase::AddrDial,
                    reason: 0,
                }),
            });
            continue;
        }
        if swarm.transports.for_dialing(&a).is_none() {
            failures.push(DialAttempt {
                addr: a.clone(),
                error: Box::new(NetworkError::NoTransport(a)),
            });
            continue;
        }
        candidates.push(a);
    }

    if candidates.is_empty() {
        if failures.is_empty() {
            return Err(NetworkError::NoAddresses(peer));
        }
        return Err(NetworkError::DialFailed {
            peer,
            attempts: failures,
        });
    }

    let ranked = if opts.simultaneous_connect {
        no_delay_ranking(&candidates)
    } else {
        default_ranking(&candidates, &swarm.config.ranker)
    };

    let mut attempts = FuturesUnordered::new();
    for ad in ranked {
        attempts.push(dial_attempt(
            swarm.clone(),
            peer,
            ad.addr,
            ad.delay,
            cancel.clone(),
        ));
    }

    let mut winner = None;
    while let Some((a, res)) = attempts.next().await {
        match res {
            Ok(conn) => {
                winner = Some(conn);
                break;
            }
            Err(e) => failures.push(DialAttempt {
                addr: a,
                error: Box::new(e),
            }),
        }
    }

    let Some(conn) = winner else {
        // A canceled sequence reports cancellation, not a failure of every
        // individually-canceled candidate.
        if cancel.is_cancelled() {
            return Err(NetworkError::DialCanceled);
        }
        return Err(NetworkError::DialFailed {
            peer,
            attempts: failures,
        });
    };

    // Stop the losers; any attempt that still completes gets closed. The
    // winner is unaffected: cancellation only reaches the attempt futures.
    cancel.cancel();
    if !attempts.is_empty() {
        swarm.tracker.spawn(async move {
            while let Some((_, res)) = attempts.next().await {
                if let Ok(extra) = res {
                    let _ = extra.close().await;
                }
            }
        });
    }

    swarm.add_conn(&conn).await?;
    Ok(conn)
}

/// One candidate attempt: wait out the ranking delay, dial raw, admit with
/// the resource manager, and upgrade.
async fn dial_attempt(
    swarm: Arc<SwarmInner>,
    peer: PeerId,
    addr: Multiaddr,
    delay: Duration,
    cancel: CancellationToken,
) -> (Multiaddr, NetworkResult<Connection>) {
    let res = dial_attempt_inner(&swarm, peer, &addr, delay, &cancel).await;
    (addr, res)
}

async fn dial_attempt_inner(
    swarm: &Arc<SwarmInner>,
    peer: PeerId,
    addr: &Multiaddr,
    delay: Duration,
    cancel: &CancellationToken,
) -> NetworkResult<Connection> {
    if !delay.is_zero() {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(NetworkError::DialCanceled),
        }
    }
    if cancel.is_cancelled() {
        return Err(NetworkError::DialCanceled);
    }

    let transport = swarm
        .transports
        .for_dialing(addr)
        .ok_or_else(|| NetworkError::NoTransport(addr.clone()))?;

    swarm.metrics.inc_dial_attempts();
    debug!("dialing {} at {}", peer.short(), addr);

    let raw = tokio::select! {
        res = tokio::time::timeout(swarm.config.dial_timeout, transport.dial(addr)) => {
            match res {
                Ok(dialed) => dialed?,
                Err(_) => return Err(NetworkError::Timeout(format!("dial {}", addr))),
            }
        }
        _ = cancel.cancelled() => return Err(NetworkError::DialCanceled),
    };

    let scope = ConnScopeHandle::new(
        swarm
            .rcmgr
            .open_connection(Direction::Outbound, false, addr)?,
    );

    tokio::select! {
        res = tokio::time::timeout(
            swarm.config.dial_timeout,
            swarm.upgrade(Direction::Outbound, raw, Some(peer), scope),
        ) => {
            match res {
                Ok(upgraded) => upgraded,
                Err(_) => Err(NetworkError::Timeout(format!("upgrade {}", addr))),
            }
        }
        _ = cancel.cancelled() => Err(NetworkError::DialCanceled),
    }
}
