//! Dial-candidate ranking.
//!
//! Orders the candidate addresses of an outbound dial into delay-staggered
//! tiers approximating a Happy Eyeballs (RFC 8305) strategy: the ranking
//! dramatically reduces simultaneous dial attempts while adding no latency
//! in the common case.
//!
//! Addresses are partitioned into private, public, and relay groups. Private
//! and public groups are dialed in parallel; relay addresses wait a fixed
//! offset whenever a direct public alternative exists. Within each group,
//! QUIC-class addresses lead, IPv6 leads IPv4 for the fastest class, and
//! TCP trails the last QUIC dial so that a QUIC connection wins when both
//! are available.
//!
//! The delay tiers are policy, not structure: they come from
//! [`DialRankerConfig`], whose defaults are the conventional 250ms public /
//! 30ms private increments.

use std::time::Duration;

use multiaddr::Multiaddr;

use crate::addr;

/// A dial candidate with its scheduled start delay.
///
/// Ordering of equal delays carries no meaning; ties are broken by the
/// lexicographic address string purely for determinism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrDelay {
    /// The address to dial.
    pub addr: Multiaddr,
    /// How long to wait before starting this attempt.
    pub delay: Duration,
}

/// Delay tiers for [`default_ranking`].
#[derive(Debug, Clone)]
pub struct DialRankerConfig {
    /// Delay of TCP dials relative to the last QUIC dial, public networks.
    pub public_tcp_delay: Duration,
    /// Delay of TCP dials relative to the last QUIC dial, private networks.
    pub private_tcp_delay: Duration,
    /// Delay between successive QUIC tiers, public networks.
    pub public_quic_delay: Duration,
    /// Delay between successive QUIC tiers, private networks.
    pub private_quic_delay: Duration,
    /// Extra delay for relay addresses when a direct public address exists.
    pub relay_delay: Duration,
    /// Delay for unrecognized transports, public networks.
    pub public_other_delay: Duration,
    /// Delay for unrecognized transports, private networks.
    pub private_other_delay: Duration,
}

impl Default for DialRankerConfig {
    fn default() -> Self {
        // 250ms is the RFC 8305 estimate of one RTT.
        Self {
            public_tcp_delay: Duration::from_millis(250),
            private_tcp_delay: Duration::from_millis(30),
            public_quic_delay: Duration::from_millis(250),
            private_quic_delay: Duration::from_millis(30),
            relay_delay: Duration::from_millis(500),
            public_other_delay: Duration::from_secs(1),
            private_other_delay: Duration::from_millis(100),
        }
    }
}

/// Rank every address with zero delay.
///
/// Used for simultaneous-connect (rendezvous) dials, where both sides must
/// attempt all addresses at once.
pub fn no_delay_ranking(addrs: &[Multiaddr]) -> Vec<AddrDelay> {
    addrs
        .iter()
        .map(|a| AddrDelay {
            addr: a.clone(),
            delay: Duration::ZERO,
        })
        .collect()
}

/// Rank dial candidates into delay-staggered tiers.
pub fn default_ranking(addrs: &[Multiaddr], cfg: &DialRankerConfig) -> Vec<AddrDelay> {
    let (relay, rest) = partition(addrs.to_vec(), addr::is_relay);
    let (private, rest) = partition(rest, addr::is_private);
    let (public, other) = partition(rest, addr::is_ip);

    // Relay dials wait only when a direct public alternative exists.
    let relay_offset = if public.is_empty() {
        Duration::ZERO
    } else {
        cfg.relay_delay
    };

    let mut res = Vec::with_capacity(addrs.len());
    res.extend(group_delays(
        private,
        cfg.private_tcp_delay,
        cfg.private_quic_delay,
        cfg.private_other_delay,
        Duration::ZERO,
    ));
    res.extend(group_delays(
        public,
        cfg.public_tcp_delay,
        cfg.public_quic_delay,
        cfg.public_other_delay,
        Duration::ZERO,
    ));
    res.extend(group_delays(
        relay,
        cfg.public_tcp_delay,
        cfg.public_quic_delay,
        cfg.public_other_delay,
        relay_offset,
    ));

    if !other.is_empty() {
        // Unrecognized transports trail everything being raced; when they
        // are the only candidates there is nothing to wait for.
        let delay = if res.is_empty() {
            Duration::ZERO
        } else {
            let max_delay = res.iter().map(|ad| ad.delay).max().unwrap_or(Duration::ZERO);
            max_delay + cfg.public_other_delay
        };
        for a in other {
            res.push(AddrDelay { addr: a, delay });
        }
    }

    res
}

fn partition<F>(addrs: Vec<Multiaddr>, pred: F) -> (Vec<Multiaddr>, Vec<Multiaddr>)
where
    F: Fn(&Multiaddr) -> bool,
{
    let mut matched = Vec::new();
    let mut rest = Vec::new();
    for a in addrs {
        if pred(&a) {
            matched.push(a);
        } else {
            rest.push(a);
        }
    }
    (matched, rest)
}

/// Rank one group of addresses.
///
/// `offset` shifts the whole group; it implements the relay delay.
fn group_delays(
    mut addrs: Vec<Multiaddr>,
    tcp_delay: Duration,
    quic_delay: Duration,
    other_delay: Duration,
    offset: Duration,
) -> Vec<AddrDelay> {
    if addrs.is_empty() {
        return Vec::new();
    }

    addrs.sort_by(|a, b| {
        addr::dial_score(a)
            .cmp(&addr::dial_score(b))
            .then_with(|| a.to_string().cmp(&b.to_string()))
    });

    // A lone candidate has nothing to race against.
    if addrs.len() == 1 {
        return vec![AddrDelay {
            addr: addrs.pop().unwrap(),
            delay: offset,
        }];
    }

    // Happy Eyeballs reordering: when both IPv6 and IPv4 candidates exist
    // for QUIC (and, separately, TCP), the best IPv4 address moves to the
    // slot right behind the best IPv6 one.
    let mut happy_eyeballs_quic = false;
    let mut happy_eyeballs_tcp = false;
    let mut tcp_start;
    {
        let mut i = 0;
        if addr::is_quic(&addrs[0]) && addr::is_ip6(&addrs[0]) {
            for j in 1..addrs.len() {
                if addr::is_quic(&addrs[j]) && addr::is_ip4(&addrs[j]) {
                    if j > 1 {
                        let a = addrs.remove(j);
                        addrs.insert(1, a);
                    }
                    happy_eyeballs_quic = true;
                    i = j + 1;
                    break;
                }
            }
        }

        tcp_start = i;
        while tcp_start < addrs.len() && !addr::is_tcp(&addrs[tcp_start]) {
            tcp_start += 1;
        }

        if tcp_start < addrs.len() && addr::is_ip6(&addrs[tcp_start]) {
            for j in (tcp_start + 1)..addrs.len() {
                if addr::is_tcp(&addrs[j]) && addr::is_ip4(&addrs[j]) {
                    if j > tcp_start + 1 {
                        let a = addrs.remove(j);
                        addrs.insert(tcp_start + 1, a);
                    }
                    happy_eyeballs_tcp = true;
                    break;
                }
            }
        }
    }

    let mut res = Vec::with_capacity(addrs.len());
    let mut tcp_first_dial_delay = Duration::ZERO;
    let mut last_quic_or_tcp_delay = Duration::ZERO;
    for (i, a) in addrs.into_iter().enumerate() {
        let mut delay = Duration::ZERO;
        if addr::is_quic(&a) {
            // IPv6 first, then after one tier the best IPv4, then the rest.
            if i == 1 {
                delay = quic_delay;
            }
            if i > 1 {
                delay = if happy_eyeballs_quic {
                    quic_delay * 2
                } else {
                    quic_delay
                };
            }
            last_quic_or_tcp_delay = delay;
            tcp_first_dial_delay = delay + tcp_delay;
        } else if addr::is_tcp(&a) {
            if i == tcp_start + 1 {
                delay = tcp_delay;
            }
            if i > tcp_start + 1 {
                delay = if happy_eyeballs_tcp {
                    tcp_delay * 2
                } else {
                    tcp_delay
                };
            }
            delay += tcp_first_dial_delay;
            last_quic_or_tcp_delay = delay;
        } else {
            delay = last_quic_or_tcp_delay + other_delay;
        }
        res.push(AddrDelay {
            addr: a,
            delay: offset + delay,
        });
    }
    res
}
