//! Peer-to-peer delay measurement.
//!
//! Each port runs its own PDELAY_REQ/RESP exchange against its link
//! neighbor and answers the neighbor's requests with a two-step response.
//! The measured propagation delay is smoothed through the EWMA filter; the
//! raw estimate for a two-step peer is
//!
//! ```text
//! delay = ((t4 - t1) - (t3 - t2) - corrections) / 2
//! ```
//!
//! with t1/t4 local event timestamps and t2/t3 the peer's receipt and
//! response-origin timestamps. One-step peers fold their turnaround into
//! the correction field, leaving `((t4 - t1) - correction) / 2`.

use anyhow::{anyhow, ensure, Result};

use crate::filter::Ewma;
use crate::msg::{MsgRc, MsgType, PortIdentity, PtpMessage, WireTimestamp, FLAG_TWO_STEP};
use crate::port::Port;
use crate::tmv::Tmv;
use crate::transport::SendKind;

/// PDELAY messages advertise no interval.
const LOG_INTERVAL_NONE: i8 = 0x7F;

// ---------------------------------------------------------------------------
// Per-port requester state
// ---------------------------------------------------------------------------

pub struct PdelayState {
    pub(crate) filter: Ewma,
    seq: u16,
    req: Option<MsgRc>,
    resp: Option<MsgRc>,
    valid: bool,
    missing: u64,
    peer_portid: Option<PortIdentity>,
}

impl PdelayState {
    pub(crate) fn new(filter_length: i64) -> Result<PdelayState> {
        Ok(PdelayState {
            filter: Ewma::new(filter_length)?,
            seq: 0,
            req: None,
            resp: None,
            valid: false,
            missing: 0,
            peer_portid: None,
        })
    }

    fn next_seq(&mut self) -> u16 {
        let s = self.seq;
        self.seq = self.seq.wrapping_add(1);
        s
    }

    pub(crate) fn delay(&self) -> Option<Tmv> {
        self.valid.then(|| self.filter.value())
    }

    /// Drops any half-finished exchange, keeping the smoothed estimate.
    pub(crate) fn cancel(&mut self) {
        self.req = None;
        self.resp = None;
    }
}

// ---------------------------------------------------------------------------
// Requester side
// ---------------------------------------------------------------------------

/// Sends the next PDELAY_REQ and records its transmit timestamp as t1.
pub fn port_delay_request(p: &mut Port) -> Result<()> {
    if p.pdelay.req.take().is_some() {
        p.pdelay.missing += 1;
        tracing::debug!(
            "port {}: peer delay response missing ({} so far)",
            p.number(),
            p.pdelay.missing
        );
    }
    p.pdelay.resp = None;

    let seq = p.pdelay.next_seq();
    let mut req =
        PtpMessage::build(MsgType::PdelayReq, p.domain, p.port_identity, seq, LOG_INTERVAL_NONE);
    req.pre_send()?;
    p.transport.send(SendKind::Event, &mut req)?;
    ensure!(req.hwts.is_some(), "missing transmit timestamp on peer delay request");
    p.pdelay.req = Some(req.into_rc());
    Ok(())
}

// ---------------------------------------------------------------------------
// Responder side
// ---------------------------------------------------------------------------

/// Answers a neighbor's PDELAY_REQ with a two-step response pair.
pub fn process_pdelay_req(p: &mut Port, msg: &MsgRc) -> Result<()> {
    let (t2, seq, peer_pid, req_correction) = {
        let m = msg.borrow();
        let t2 = m.hwts.ok_or_else(|| anyhow!("peer delay request without timestamp"))?;
        (t2, m.header.sequence_id, m.header.source_port_identity, m.header.correction)
    };

    let mut resp =
        PtpMessage::build(MsgType::PdelayResp, p.domain, p.port_identity, seq, LOG_INTERVAL_NONE);
    resp.header.flags[0] = FLAG_TWO_STEP;
    resp.pre_send()?;
    resp.set_body_ts(WireTimestamp::from_tmv(t2));
    resp.set_requesting_port_identity(peer_pid);
    p.transport.send(SendKind::Event, &mut resp)?;
    let t3 = resp
        .hwts
        .ok_or_else(|| anyhow!("missing transmit timestamp on peer delay response"))?
        + p.tx_timestamp_offset;

    // The neighbor needs the request's correction reflected back to keep
    // its (t3 - t2) arithmetic honest.
    let mut fup = PtpMessage::build(
        MsgType::PdelayRespFollowUp,
        p.domain,
        p.port_identity,
        seq,
        LOG_INTERVAL_NONE,
    );
    fup.header.correction = req_correction;
    fup.pre_send()?;
    fup.set_body_ts(WireTimestamp::from_tmv(t3));
    fup.set_requesting_port_identity(peer_pid);
    p.transport.send(SendKind::General, &mut fup)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Response handling
// ---------------------------------------------------------------------------

/// Handles a PDELAY_RESP addressed to this port. Two-step responses park
/// until the matching follow-up arrives; one-step responses finish the
/// measurement immediately.
pub fn process_pdelay_resp(p: &mut Port, msg: &MsgRc) -> Result<()> {
    let (seq, two_step, source_pid, t4, correction, rpid) = {
        let m = msg.borrow();
        let Some(rpid) = m.requesting_port_identity() else {
            return Ok(());
        };
        (
            m.header.sequence_id,
            m.is_two_step(),
            m.header.source_port_identity,
            m.hwts,
            m.header.correction,
            rpid,
        )
    };
    if rpid != p.port_identity {
        // Someone else's exchange on the shared segment.
        return Ok(());
    }
    let Some(req) = p.pdelay.req.clone() else {
        tracing::debug!("port {}: unmatched peer delay response", p.number());
        return Ok(());
    };
    if seq != req.borrow().header.sequence_id {
        tracing::debug!("port {}: stale peer delay response (seq {})", p.number(), seq);
        return Ok(());
    }
    if let Some(prev) = p.pdelay.peer_portid {
        if prev != source_pid {
            tracing::warn!("port {}: multiple peer delay responders on link", p.number());
        }
    }
    p.pdelay.peer_portid = Some(source_pid);

    if two_step {
        p.pdelay.resp = Some(msg.clone());
        return Ok(());
    }

    let t4 = t4.ok_or_else(|| anyhow!("peer delay response without timestamp"))?;
    let t1 = req
        .borrow()
        .hwts
        .ok_or_else(|| anyhow!("peer delay request lost its timestamp"))?;
    let turnaround = Tmv::from_time_interval(correction);
    finish(p, ((t4 - t1) - turnaround) / 2);
    p.pdelay.req = None;
    Ok(())
}

/// Completes a two-step exchange once the responder's follow-up arrives.
pub fn process_pdelay_resp_fup(p: &mut Port, msg: &MsgRc) {
    let (seq, t3, fup_correction, rpid) = {
        let m = msg.borrow();
        let Some(rpid) = m.requesting_port_identity() else {
            return;
        };
        (m.header.sequence_id, m.pdu_ts.to_tmv(), m.header.correction, rpid)
    };
    if rpid != p.port_identity {
        return;
    }
    let (Some(req), Some(resp)) = (p.pdelay.req.clone(), p.pdelay.resp.clone()) else {
        tracing::debug!("port {}: unmatched peer delay follow-up", p.number());
        return;
    };
    if seq != req.borrow().header.sequence_id {
        tracing::debug!("port {}: stale peer delay follow-up (seq {})", p.number(), seq);
        return;
    }

    let (t1, t4, t2, resp_correction) = {
        let rq = req.borrow();
        let rs = resp.borrow();
        let (Some(t1), Some(t4)) = (rq.hwts, rs.hwts) else {
            return;
        };
        (t1, t4, rs.pdu_ts.to_tmv(), rs.header.correction)
    };
    let corrections = Tmv::from_time_interval(resp_correction + fup_correction);
    finish(p, ((t4 - t1) - (t3 - t2) - corrections) / 2);
    p.pdelay.req = None;
    p.pdelay.resp = None;
}

fn finish(p: &mut Port, raw: Tmv) {
    if raw.nanos() < 0 {
        tracing::debug!("port {}: negative peer delay sample {} ns", p.number(), raw.nanos());
    }
    let avg = p.pdelay.filter.sample(raw);
    p.pdelay.valid = true;
    p.stats.pdelay_exchanges += 1;
    tracing::debug!(
        "port {}: peer delay {} ns (raw {} ns)",
        p.number(),
        avg.nanos(),
        raw.nanos()
    );
}
