//! Per-port event dispatch for the peer-to-peer transparent clock role.
//!
//! [`event`] turns one ready file descriptor into an FSM event;
//! [`dispatch`] applies that event to the port state machine and performs
//! the transition side effects. The two calls together are the port's
//! entire surface to the daemon poll loop.

use crate::fsm::{self, FsmEvent, PortState};
use crate::msg::{MsgType, PtpMessage, RecvError};
use crate::pdelay;
use crate::port::{
    Port, FD_ANNOUNCE_TIMER, FD_DELAY_TIMER, FD_MANNO_TIMER, FD_QUALIFICATION_TIMER, FD_RTNL,
    FD_SYNC_RX_TIMER, FD_SYNC_TX_TIMER,
};
use crate::rtnl;
use crate::tc::{self, TxdPool};
use crate::timer;
use crate::tmv;

/// Applies `event` to the port state machine and handles the side effects
/// of any transition. `mdiff` is the master-changed hint; the TC state
/// machine subset has no use for it.
pub fn dispatch(p: &mut Port, pool: &mut TxdPool, event: FsmEvent, _mdiff: i32) {
    let next = fsm::transition(p.state(), event);
    if next == p.state() {
        return;
    }
    tracing::info!("port {}: {} to {} on {}", p.number(), p.state(), next, event);
    p.set_state(next);

    match next {
        PortState::Faulty | PortState::Disabled => {
            p.disable(pool);
        }
        PortState::Listening => {
            p.clr_tmo(FD_ANNOUNCE_TIMER);
            // Set the peer delay timer, but not on the management port.
            if p.number() != 0 {
                p.set_delay_tmo();
            }
        }
        _ => {}
    }
}

/// A peer delay request is pointless on a port that cannot talk.
fn p2p_delay_request(p: &mut Port) -> anyhow::Result<()> {
    match p.state() {
        PortState::Initializing | PortState::Faulty | PortState::Disabled => Ok(()),
        _ => pdelay::port_delay_request(p),
    }
}

/// Handles readiness of `ports[q].fda.fd[fd_index]` and returns the FSM
/// event to feed back through [`dispatch`].
pub fn event(ports: &mut [Port], pool: &mut TxdPool, q: usize, fd_index: usize) -> FsmEvent {
    match fd_index {
        FD_ANNOUNCE_TIMER | FD_SYNC_RX_TIMER | FD_QUALIFICATION_TIMER | FD_MANNO_TIMER
        | FD_SYNC_TX_TIMER => {
            let p = &mut ports[q];
            timer::drain(p.fda.fd[fd_index]);
            tracing::error!("port {}: unexpected timer expiration", p.number());
            return FsmEvent::None;
        }
        FD_DELAY_TIMER => {
            let p = &mut ports[q];
            tracing::debug!("port {}: delay timeout", p.number());
            timer::drain(p.fda.fd[FD_DELAY_TIMER]);
            p.set_delay_tmo();
            tc::prune(p, pool);
            return match p2p_delay_request(p) {
                Ok(()) => FsmEvent::None,
                Err(e) => {
                    tracing::warn!("port {}: peer delay request failed: {:#}", p.number(), e);
                    FsmEvent::FaultDetected
                }
            };
        }
        FD_RTNL => {
            let p = &mut ports[q];
            tracing::debug!("port {}: received link status notification", p.number());
            if let Some(up) = rtnl::link_status(p.fda.fd[FD_RTNL], p.ifindex) {
                p.link_status = up;
            }
            return if p.link_status {
                FsmEvent::FaultCleared
            } else {
                FsmEvent::FaultDetected
            };
        }
        _ => {}
    }

    // Transport descriptor: pull one frame off the wire.
    let fd = ports[q].fda.fd[fd_index];
    let domain = ports[q].domain;
    let mut m = PtpMessage::allocate();

    let cnt = match ports[q].transport.recv(fd, &mut m) {
        Ok(n) => n,
        Err(e) => {
            let p = &mut ports[q];
            tracing::error!("port {}: recv message failed: {:#}", p.number(), e);
            p.stats.recv_errors += 1;
            return FsmEvent::FaultDetected;
        }
    };
    if let Err(err) = m.post_recv(cnt, domain) {
        let p = &mut ports[q];
        match err {
            RecvError::BadMessage => {
                p.stats.recv_errors += 1;
                tracing::error!("port {}: bad message", p.number());
            }
            RecvError::MissingTimestamp => {
                p.stats.recv_errors += 1;
                tracing::error!("port {}: received event message without timestamp", p.number());
            }
            RecvError::Ignore => {
                tracing::debug!("port {}: ignoring message", p.number());
            }
        }
        return FsmEvent::None;
    }
    ports[q].stats.rx_msgs += 1;

    if let Some(ts) = m.hwts {
        m.hwts = Some(ts - ports[q].rx_timestamp_offset);
    }
    if m.is_unicast() {
        let p = &mut ports[q];
        p.stats.unicast_dropped += 1;
        if p.unicast_warn.ready(tmv::now()) {
            tracing::warn!("port {}: cannot handle unicast messages", p.number());
        }
        return FsmEvent::None;
    }

    let msg_type = m.msg_type().expect("post_recv validated the type");
    let msg = m.into_rc();
    let mut event = FsmEvent::None;
    match msg_type {
        MsgType::Sync => {
            if let Err(e) = tc::fwd_event(ports, pool, q, &msg) {
                tracing::warn!("port {}: sync forward failed: {:#}", ports[q].number(), e);
                event = FsmEvent::FaultDetected;
            }
        }
        MsgType::DelayReq | MsgType::DelayResp => {
            // End-to-end machinery; not valid through a P2P transparent clock.
        }
        MsgType::PdelayReq => {
            if let Err(e) = pdelay::process_pdelay_req(&mut ports[q], &msg) {
                tracing::warn!("port {}: pdelay_req handling failed: {:#}", ports[q].number(), e);
                event = FsmEvent::FaultDetected;
            }
        }
        MsgType::PdelayResp => {
            if let Err(e) = pdelay::process_pdelay_resp(&mut ports[q], &msg) {
                tracing::warn!("port {}: pdelay_resp handling failed: {:#}", ports[q].number(), e);
                event = FsmEvent::FaultDetected;
            }
        }
        MsgType::FollowUp => {
            if let Err(e) = tc::fwd_folup(ports, pool, q, &msg) {
                tracing::warn!("port {}: follow-up forward failed: {:#}", ports[q].number(), e);
                event = FsmEvent::FaultDetected;
            }
        }
        MsgType::PdelayRespFollowUp => {
            pdelay::process_pdelay_resp_fup(&mut ports[q], &msg);
        }
        MsgType::Announce | MsgType::Signaling | MsgType::Management => {
            if let Err(e) = tc::forward(ports, pool, q, &msg) {
                tracing::warn!("port {}: forward failed: {:#}", ports[q].number(), e);
                event = FsmEvent::FaultDetected;
            }
        }
    }
    event
}
