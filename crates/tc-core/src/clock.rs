//! The clock: a set of sibling ports, the shared descriptor pool, and the
//! poll loop gluing them to the event dispatcher.

use anyhow::{ensure, Context, Result};

use crate::fsm::FsmEvent;
use crate::p2p;
use crate::port::{Port, PortOptions, PortSnapshot, N_POLLFD};
use crate::tc::TxdPool;

pub struct Clock {
    ports: Vec<Port>,
    pool: TxdPool,
}

impl Clock {
    pub fn new() -> Clock {
        Clock { ports: Vec::new(), pool: TxdPool::new() }
    }

    /// Opens one port per entry, numbered from 1. The clock identity is
    /// derived from the first interface's MAC address.
    pub fn open(port_opts: &[PortOptions]) -> Result<Clock> {
        ensure!(!port_opts.is_empty(), "a transparent clock needs at least one port");
        let identity = Port::clock_identity_from_interface(&port_opts[0].interface)
            .with_context(|| format!("deriving clock identity from {}", port_opts[0].interface))?;

        let mut clock = Clock::new();
        for (i, opts) in port_opts.iter().enumerate() {
            let number = (i + 1) as u16;
            let port = Port::open(number, identity, opts)
                .with_context(|| format!("creating port {} ({})", number, opts.interface))?;
            tracing::info!("port {}: {} ready", number, opts.interface);
            clock.add_port(port);
        }
        Ok(clock)
    }

    pub fn add_port(&mut self, port: Port) {
        self.ports.push(port);
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    pub fn pool(&self) -> &TxdPool {
        &self.pool
    }

    /// Kicks every port out of INITIALIZING.
    pub fn init(&mut self) {
        for q in 0..self.ports.len() {
            self.apply(q, FsmEvent::InitComplete);
        }
    }

    /// Handles readiness of one port descriptor: runs the event dispatcher
    /// and applies the resulting FSM event.
    pub fn handle(&mut self, q: usize, fd_index: usize) {
        let ev = p2p::event(&mut self.ports, &mut self.pool, q, fd_index);
        self.apply(q, ev);
    }

    fn apply(&mut self, q: usize, ev: FsmEvent) {
        p2p::dispatch(&mut self.ports[q], &mut self.pool, ev, 0);
        // A port parked back in INITIALIZING (fault cleared, re-enabled)
        // restarts immediately; there is no separate initialization work.
        if self.ports[q].state() == crate::fsm::PortState::Initializing {
            p2p::dispatch(&mut self.ports[q], &mut self.pool, FsmEvent::InitComplete, 0);
        }
    }

    /// Polls every port descriptor once and dispatches whatever is ready.
    /// Returns false on poll timeout.
    #[cfg(unix)]
    pub fn poll(&mut self, timeout_ms: i32) -> Result<bool> {
        let mut pollfds: Vec<libc::pollfd> = Vec::new();
        let mut index: Vec<(usize, usize)> = Vec::new();
        for (q, port) in self.ports.iter().enumerate() {
            for fd_index in 0..N_POLLFD {
                let fd = port.fda.fd[fd_index];
                if fd < 0 {
                    continue;
                }
                pollfds.push(libc::pollfd { fd, events: libc::POLLIN | libc::POLLPRI, revents: 0 });
                index.push((q, fd_index));
            }
        }

        let n = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as _, timeout_ms) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err).context("poll");
        }
        if n == 0 {
            return Ok(false);
        }

        for (i, pfd) in pollfds.iter().enumerate() {
            if pfd.revents != 0 {
                let (q, fd_index) = index[i];
                self.handle(q, fd_index);
            }
        }
        Ok(true)
    }

    pub fn snapshots(&self) -> Vec<PortSnapshot> {
        self.ports.iter().map(Port::snapshot).collect()
    }

    /// Releases every pending descriptor and drains the descriptor pool.
    pub fn cleanup(&mut self) {
        for q in 0..self.ports.len() {
            crate::tc::flush(&mut self.ports[q], &mut self.pool);
        }
        let freed = self.pool.cleanup();
        tracing::debug!("released {} pooled descriptors", freed);
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::PortState;
    use crate::testutil::{mock_port, recv_msg, sync_frame};
    use crate::msg::PortIdentity;
    use crate::tmv::Tmv;

    fn two_port_clock() -> Clock {
        let mut clock = Clock::new();
        let (mut a, _) = mock_port(1);
        let (mut b, _) = mock_port(2);
        a.set_state(PortState::Initializing);
        b.set_state(PortState::Initializing);
        clock.add_port(a);
        clock.add_port(b);
        clock
    }

    #[test]
    fn test_init_brings_ports_to_listening() {
        let mut clock = two_port_clock();
        clock.init();
        assert!(clock.ports().iter().all(|p| p.state() == PortState::Listening));
    }

    #[test]
    fn test_cleanup_drains_pool() {
        let mut clock = two_port_clock();
        clock.init();
        let pid = PortIdentity { clock_identity: [1; 8], port_number: 1 };
        let msg = recv_msg(&sync_frame(0, 5, pid, 0), Some(Tmv::from_nanos(10)), 0);
        crate::tc::fwd_event(&mut clock.ports, &mut clock.pool, 0, &msg).unwrap();
        assert_eq!(clock.ports[1].pending_txd(), 1);
        assert_eq!(clock.pool.allocated(), 1);

        clock.cleanup();
        assert_eq!(clock.ports[1].pending_txd(), 0);
        assert_eq!(clock.pool.allocated(), 0);
    }
}
