//! Per-port state: transport, fd array, timers, pending TC queue, peer
//! delay measurement.
//!
//! A port is driven entirely from the outside: the poll loop feeds it
//! `(fd_index)` readiness through [`crate::p2p::event`] and applies the
//! resulting FSM event through [`crate::p2p::dispatch`].

use std::collections::VecDeque;
use std::os::fd::RawFd;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::fsm::PortState;
use crate::msg::PortIdentity;
use crate::pdelay::PdelayState;
use crate::tc::TcTxd;
use crate::timer;
use crate::tmv::{Tmv, NSEC_PER_SEC};
use crate::transport::{self, Transport, UdpTransport};

// ---------------------------------------------------------------------------
// Fd array
//
// Fixed per-port descriptor layout, indexed by the poll loop. Slot order is
// load-bearing: the event dispatcher switches on the index.
// ---------------------------------------------------------------------------

pub const FD_EVENT: usize = 0;
pub const FD_GENERAL: usize = 1;
pub const FD_ANNOUNCE_TIMER: usize = 2;
pub const FD_SYNC_RX_TIMER: usize = 3;
pub const FD_DELAY_TIMER: usize = 4;
pub const FD_QUALIFICATION_TIMER: usize = 5;
pub const FD_MANNO_TIMER: usize = 6;
pub const FD_SYNC_TX_TIMER: usize = 7;
pub const FD_RTNL: usize = 8;
pub const N_POLLFD: usize = 9;

const TIMER_FD_SLOTS: [usize; 6] = [
    FD_ANNOUNCE_TIMER,
    FD_SYNC_RX_TIMER,
    FD_DELAY_TIMER,
    FD_QUALIFICATION_TIMER,
    FD_MANNO_TIMER,
    FD_SYNC_TX_TIMER,
];

/// Per-port descriptor set. `-1` marks an unused slot.
#[derive(Debug, Clone, Copy)]
pub struct FdArray {
    pub fd: [RawFd; N_POLLFD],
}

impl Default for FdArray {
    fn default() -> Self {
        FdArray { fd: [-1; N_POLLFD] }
    }
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// Suppresses repeats of a log line for a fixed window.
#[derive(Debug)]
pub(crate) struct RateLimit {
    interval: Tmv,
    last: Option<Tmv>,
}

impl RateLimit {
    pub(crate) fn new(interval_secs: i64) -> RateLimit {
        RateLimit { interval: Tmv::from_nanos(interval_secs * NSEC_PER_SEC), last: None }
    }

    /// True when the caller may log now.
    pub(crate) fn ready(&mut self, now: Tmv) -> bool {
        match self.last {
            Some(prev) if now - prev < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Plain counters bumped on the forwarding paths. Single-threaded, so no
/// atomics needed.
#[derive(Debug, Default, Clone)]
pub struct PortStats {
    pub rx_msgs: u64,
    pub event_forwarded: u64,
    pub general_forwarded: u64,
    pub fup_corrected: u64,
    pub parked: u64,
    pub pruned: u64,
    pub unicast_dropped: u64,
    pub recv_errors: u64,
    pub send_faults: u64,
    pub pdelay_exchanges: u64,
}

/// Point-in-time view of one port, serialized into the stats log.
#[derive(Debug, Clone, Serialize)]
pub struct PortSnapshot {
    pub name: String,
    pub number: u16,
    pub state: PortState,
    pub link_up: bool,
    pub rx_msgs: u64,
    pub event_forwarded: u64,
    pub general_forwarded: u64,
    pub fup_corrected: u64,
    pub parked: u64,
    pub pruned: u64,
    pub pending: usize,
    pub unicast_dropped: u64,
    pub recv_errors: u64,
    pub send_faults: u64,
    pub pdelay_exchanges: u64,
    /// Smoothed peer propagation delay, when at least one exchange finished.
    pub peer_delay_ns: Option<i64>,
}

// ---------------------------------------------------------------------------
// Port options / port
// ---------------------------------------------------------------------------

/// Knobs a port is created with; all have config-file defaults.
#[derive(Debug, Clone)]
pub struct PortOptions {
    pub interface: String,
    pub domain: u8,
    /// Added to every egress timestamp, nanoseconds.
    pub tx_timestamp_offset: i64,
    /// Subtracted from every ingress timestamp, nanoseconds.
    pub rx_timestamp_offset: i64,
    pub log_min_pdelay_req_interval: i8,
    /// EWMA window for the peer delay filter.
    pub delay_filter_length: i64,
}

impl Default for PortOptions {
    fn default() -> Self {
        PortOptions {
            interface: String::new(),
            domain: 0,
            tx_timestamp_offset: 0,
            rx_timestamp_offset: 0,
            log_min_pdelay_req_interval: 0,
            delay_filter_length: 8,
        }
    }
}

pub struct Port {
    name: String,
    number: u16,
    state: PortState,
    pub transport: Box<dyn Transport>,
    pub fda: FdArray,
    pub tx_timestamp_offset: Tmv,
    pub rx_timestamp_offset: Tmv,
    pub link_status: bool,
    pub(crate) ifindex: i32,
    pub port_identity: PortIdentity,
    pub domain: u8,
    pub log_min_pdelay_req_interval: i8,
    pub(crate) tc_transmitted: VecDeque<Box<TcTxd>>,
    pub(crate) pdelay: PdelayState,
    pub(crate) unicast_warn: RateLimit,
    pub stats: PortStats,
}

impl Port {
    /// Builds a port around an already-open transport. Timers and the RTNL
    /// slot stay unset; [`Port::open`] fills them for real deployments.
    pub fn new(
        number: u16,
        transport: Box<dyn Transport>,
        clock_identity: [u8; 8],
        opts: &PortOptions,
    ) -> Result<Port> {
        Ok(Port {
            name: opts.interface.clone(),
            number,
            state: PortState::Initializing,
            transport,
            fda: FdArray::default(),
            tx_timestamp_offset: Tmv::from_nanos(opts.tx_timestamp_offset),
            rx_timestamp_offset: Tmv::from_nanos(opts.rx_timestamp_offset),
            link_status: true,
            ifindex: -1,
            port_identity: PortIdentity { clock_identity, port_number: number },
            domain: opts.domain,
            log_min_pdelay_req_interval: opts.log_min_pdelay_req_interval,
            tc_transmitted: VecDeque::new(),
            pdelay: PdelayState::new(opts.delay_filter_length)?,
            unicast_warn: RateLimit::new(600),
            stats: PortStats::default(),
        })
    }

    /// Opens the UDP transport on the configured interface, creates the
    /// timer fds, and wires everything into the fd array.
    pub fn open(number: u16, clock_identity: [u8; 8], opts: &PortOptions) -> Result<Port> {
        let udp = UdpTransport::open(&opts.interface)
            .with_context(|| format!("opening transport on {}", opts.interface))?;
        let event_fd = udp.event_fd();
        let general_fd = udp.general_fd();

        let mut port = Port::new(number, Box::new(udp), clock_identity, opts)?;
        port.fda.fd[FD_EVENT] = event_fd;
        port.fda.fd[FD_GENERAL] = general_fd;
        for &slot in &TIMER_FD_SLOTS {
            port.fda.fd[slot] = timer::create()?;
        }
        match crate::rtnl::open(&opts.interface) {
            Ok((fd, ifindex)) => {
                port.fda.fd[FD_RTNL] = fd;
                port.ifindex = ifindex;
            }
            Err(e) => {
                tracing::warn!("port {}: link monitoring unavailable: {:#}", number, e);
            }
        }
        Ok(port)
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: PortState) {
        self.state = state;
    }

    /// Stops all timers and releases the port's pending TC state. This is
    /// the only cancellation path for parked descriptors.
    pub fn disable(&mut self, pool: &mut crate::tc::TxdPool) {
        for &slot in &TIMER_FD_SLOTS {
            timer::clear(self.fda.fd[slot]);
        }
        crate::tc::flush(self, pool);
        self.pdelay.cancel();
    }

    /// Arms the peer delay timer for the next request.
    pub fn set_delay_tmo(&mut self) {
        timer::set_log(self.fda.fd[FD_DELAY_TIMER], self.log_min_pdelay_req_interval);
    }

    pub fn clr_tmo(&mut self, fd_index: usize) {
        timer::clear(self.fda.fd[fd_index]);
    }

    /// Number of pending unmatched event descriptors.
    pub fn pending_txd(&self) -> usize {
        self.tc_transmitted.len()
    }

    pub fn peer_delay(&self) -> Option<Tmv> {
        self.pdelay.delay()
    }

    pub fn snapshot(&self) -> PortSnapshot {
        PortSnapshot {
            name: self.name.clone(),
            number: self.number,
            state: self.state,
            link_up: self.link_status,
            rx_msgs: self.stats.rx_msgs,
            event_forwarded: self.stats.event_forwarded,
            general_forwarded: self.stats.general_forwarded,
            fup_corrected: self.stats.fup_corrected,
            parked: self.stats.parked,
            pruned: self.stats.pruned,
            pending: self.tc_transmitted.len(),
            unicast_dropped: self.stats.unicast_dropped,
            recv_errors: self.stats.recv_errors,
            send_faults: self.stats.send_faults,
            pdelay_exchanges: self.stats.pdelay_exchanges,
            peer_delay_ns: self.pdelay.delay().map(Tmv::nanos),
        }
    }

    /// Resolves the first interface's MAC into an EUI-64 clock identity.
    pub fn clock_identity_from_interface(interface: &str) -> Result<[u8; 8]> {
        let mac = transport::interface_hwaddr(interface)?;
        Ok([mac[0], mac[1], mac[2], 0xFF, 0xFE, mac[3], mac[4], mac[5]])
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        for &slot in &TIMER_FD_SLOTS {
            timer::close(self.fda.fd[slot]);
        }
        timer::close(self.fda.fd[FD_RTNL]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmv;

    #[test]
    fn test_rate_limit_window() {
        let mut rl = RateLimit::new(600);
        let t0 = Tmv::from_nanos(0);
        assert!(rl.ready(t0));
        assert!(!rl.ready(t0 + Tmv::from_nanos(599 * NSEC_PER_SEC)));
        assert!(rl.ready(t0 + Tmv::from_nanos(600 * NSEC_PER_SEC)));
    }

    #[test]
    fn test_rate_limit_first_use_fires() {
        let mut rl = RateLimit::new(1);
        assert!(rl.ready(tmv::now()));
    }
}
