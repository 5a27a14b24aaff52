//! Transparent clock forwarding and SYNC/FOLLOW_UP pairing.
//!
//! Every frame received on one port is relayed out of every eligible
//! sibling port. For two-step event traffic the interesting part is the
//! pairing: the SYNC leg yields a per-egress residence time the moment it
//! leaves the device, the FOLLOW_UP leg carries the correction field that
//! must absorb it, and the two can arrive in either order. Whichever leg
//! shows up second completes the pair and triggers exactly one corrected
//! FOLLOW_UP per `(ingress, egress, source identity, sequence)` tuple.
//!
//! Unmatched legs wait in a per-egress FIFO of [`TcTxd`] descriptors,
//! recycled through a process-wide pool and aged out after one second.

use std::collections::VecDeque;

use anyhow::{anyhow, Result};

use crate::fsm::{FsmEvent, PortState};
use crate::msg::{MsgRc, MsgType, PortIdentity};
use crate::p2p;
use crate::port::Port;
use crate::tmv::{self, Tmv, NSEC_PER_SEC};
use crate::transport::SendKind;

/// Pending descriptors older than this are dropped by [`prune`].
const TXD_TIMEOUT_NS: i64 = NSEC_PER_SEC;

// ---------------------------------------------------------------------------
// Descriptors and the recycling pool
// ---------------------------------------------------------------------------

/// One unmatched event leg parked on an egress port.
///
/// Holds a message reference until retired; `residence` is meaningful only
/// when the parked leg is the SYNC.
pub struct TcTxd {
    pub(crate) msg: Option<MsgRc>,
    pub(crate) residence: Tmv,
    pub(crate) ingress_port: u16,
}

/// Free list recycling descriptor allocations across all ports.
///
/// `limit` bounds the number of live descriptors; hitting it is reported as
/// an allocation failure, which the forwarding paths treat as an egress
/// fault.
pub struct TxdPool {
    free: Vec<Box<TcTxd>>,
    allocated: usize,
    limit: Option<usize>,
}

impl TxdPool {
    pub fn new() -> TxdPool {
        TxdPool { free: Vec::new(), allocated: 0, limit: None }
    }

    pub fn with_limit(limit: usize) -> TxdPool {
        TxdPool { free: Vec::new(), allocated: 0, limit: Some(limit) }
    }

    fn allocate(&mut self) -> Option<Box<TcTxd>> {
        if let Some(mut txd) = self.free.pop() {
            txd.msg = None;
            txd.residence = Tmv::ZERO;
            txd.ingress_port = 0;
            return Some(txd);
        }
        if let Some(limit) = self.limit {
            if self.allocated >= limit {
                return None;
            }
        }
        self.allocated += 1;
        Some(Box::new(TcTxd { msg: None, residence: Tmv::ZERO, ingress_port: 0 }))
    }

    fn free(&mut self, mut txd: Box<TcTxd>) {
        txd.msg = None;
        self.free.push(txd);
    }

    /// Total descriptors ever allocated and still owned by the pool or a
    /// queue.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Drains the free list at shutdown; returns how many descriptors were
    /// released. Descriptors still parked on a queue must be flushed first.
    pub fn cleanup(&mut self) -> usize {
        let n = self.free.len();
        self.allocated -= n;
        self.free.clear();
        n
    }
}

impl Default for TxdPool {
    fn default() -> Self {
        TxdPool::new()
    }
}

// ---------------------------------------------------------------------------
// Egress eligibility and matching
// ---------------------------------------------------------------------------

/// The management port (number 0) and ports in a non-forwarding state never
/// carry TC output.
fn blocked(p: &Port) -> bool {
    if p.number() == 0 {
        return true;
    }
    match p.state() {
        PortState::Initializing
        | PortState::Faulty
        | PortState::Disabled
        | PortState::Passive => true,
        PortState::Listening
        | PortState::PreMaster
        | PortState::Master
        | PortState::Uncalibrated
        | PortState::Slave
        | PortState::GrandMaster => false,
    }
}

enum TcMatch {
    Mismatch,
    /// Parked SYNC, incoming FOLLOW_UP.
    SyncFup,
    /// Parked FOLLOW_UP, incoming SYNC.
    FupSync,
}

fn tc_match(
    ingress_port: u16,
    in_type: MsgType,
    in_seq: u16,
    in_spid: &PortIdentity,
    txd: &TcTxd,
) -> TcMatch {
    if ingress_port != txd.ingress_port {
        return TcMatch::Mismatch;
    }
    let parked = match &txd.msg {
        Some(m) => m.borrow(),
        None => return TcMatch::Mismatch,
    };
    if in_seq != parked.header.sequence_id {
        return TcMatch::Mismatch;
    }
    if *in_spid != parked.header.source_port_identity {
        return TcMatch::Mismatch;
    }
    match (parked.msg_type(), in_type) {
        (Some(MsgType::Sync), MsgType::FollowUp) => TcMatch::SyncFup,
        (Some(MsgType::FollowUp), MsgType::Sync) => TcMatch::FupSync,
        _ => TcMatch::Mismatch,
    }
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Pairs `msg` against the egress port's pending queue, or parks it.
///
/// On a match the FOLLOW_UP leg is sent with its correction field bumped by
/// the SYNC leg's residence. The correction is patched into the wire buffer
/// for the send and restored afterwards, so a FOLLOW_UP shared between
/// several egress queues always starts from its original value.
fn complete(p: &mut Port, pool: &mut TxdPool, ingress_port: u16, msg: &MsgRc, residence: Tmv) {
    let (in_type, in_seq, in_spid) = {
        let m = msg.borrow();
        let Some(t) = m.msg_type() else { return };
        (t, m.header.sequence_id, m.header.source_port_identity)
    };

    let mut hit: Option<(usize, TcMatch)> = None;
    for (i, txd) in p.tc_transmitted.iter().enumerate() {
        match tc_match(ingress_port, in_type, in_seq, &in_spid, txd) {
            TcMatch::Mismatch => continue,
            m => {
                hit = Some((i, m));
                break;
            }
        }
    }

    let Some((i, kind)) = hit else {
        let Some(mut txd) = pool.allocate() else {
            tracing::error!("low memory, TC failed to forward event");
            p2p::dispatch(p, pool, FsmEvent::FaultDetected, 0);
            return;
        };
        txd.msg = Some(msg.clone());
        txd.residence = residence;
        txd.ingress_port = ingress_port;
        p.tc_transmitted.push_back(txd);
        p.stats.parked += 1;
        return;
    };

    let txd = p.tc_transmitted.remove(i).expect("matched index in bounds");
    let (fup, residence) = match kind {
        TcMatch::SyncFup => (msg.clone(), txd.residence),
        TcMatch::FupSync => (txd.msg.clone().expect("parked descriptor holds a message"), residence),
        TcMatch::Mismatch => unreachable!(),
    };

    let sent = {
        let mut f = fup.borrow_mut();
        let c1 = f.wire_correction();
        f.set_wire_correction(c1 + residence.to_time_interval());
        let r = p.transport.send(SendKind::General, &mut f);
        f.set_wire_correction(c1);
        r
    };
    pool.free(txd);
    p.stats.fup_corrected += 1;

    if let Err(e) = sent {
        tracing::warn!("port {}: corrected follow-up send failed: {:#}", p.number(), e);
        p.stats.send_faults += 1;
        p2p::dispatch(p, pool, FsmEvent::FaultDetected, 0);
    }
}

// ---------------------------------------------------------------------------
// Public forwarding entry points
// ---------------------------------------------------------------------------

/// Relays a general message out of every eligible sibling of `ports[q]`.
///
/// Egress failures fault the affected port and never block its siblings.
pub fn forward(ports: &mut [Port], pool: &mut TxdPool, q: usize, msg: &MsgRc) -> Result<()> {
    msg.borrow_mut().pre_send()?;
    for i in 0..ports.len() {
        if i == q || blocked(&ports[i]) {
            continue;
        }
        let p = &mut ports[i];
        match p.transport.send(SendKind::General, &mut msg.borrow_mut()) {
            Ok(_) => p.stats.general_forwarded += 1,
            Err(e) => {
                // Egress port is faulty; keep going on the others.
                tracing::warn!("port {}: send failed: {:#}", p.number(), e);
                p.stats.send_faults += 1;
                p2p::dispatch(p, pool, FsmEvent::FaultDetected, 0);
            }
        }
    }
    Ok(())
}

/// Relays a SYNC out of every eligible sibling, capturing per-egress
/// residence and feeding each into the pairing step.
pub fn fwd_event(ports: &mut [Port], pool: &mut TxdPool, q: usize, msg: &MsgRc) -> Result<()> {
    let q_num = ports[q].number();
    let ingress = {
        let mut m = msg.borrow_mut();
        m.host_ts = tmv::now();
        m.pre_send()?;
        m.hwts.ok_or_else(|| anyhow!("event message without ingress timestamp"))?
    };

    for i in 0..ports.len() {
        if i == q || blocked(&ports[i]) {
            continue;
        }
        let p = &mut ports[i];
        let egress = {
            let mut m = msg.borrow_mut();
            match p.transport.send(SendKind::Event, &mut m) {
                Ok(_) => m.hwts,
                Err(e) => {
                    tracing::warn!("port {}: event send failed: {:#}", p.number(), e);
                    None
                }
            }
        };
        let Some(egress) = egress else {
            p.stats.send_faults += 1;
            p2p::dispatch(p, pool, FsmEvent::FaultDetected, 0);
            continue;
        };
        let residence = (egress + p.tx_timestamp_offset) - ingress;
        p.stats.event_forwarded += 1;
        complete(p, pool, q_num, msg, residence);
    }
    Ok(())
}

/// Relays a FOLLOW_UP, re-serializing its precise origin timestamp, and
/// runs the pairing step on every eligible sibling.
pub fn fwd_folup(ports: &mut [Port], pool: &mut TxdPool, q: usize, msg: &MsgRc) -> Result<()> {
    let q_num = ports[q].number();
    {
        let mut m = msg.borrow_mut();
        m.host_ts = tmv::now();
        m.refresh_follow_up_origin();
        m.pre_send()?;
    }
    for i in 0..ports.len() {
        if i == q || blocked(&ports[i]) {
            continue;
        }
        complete(&mut ports[i], pool, q_num, msg, Tmv::ZERO);
    }
    Ok(())
}

/// Drops expired descriptors from the head of the port's pending queue.
///
/// The queue is age-ordered (tail insertion, monotonic host stamps), so the
/// scan stops at the first live entry.
pub fn prune(q: &mut Port, pool: &mut TxdPool) {
    let now = tmv::now();
    while let Some(txd) = q.tc_transmitted.front() {
        let host_ts = txd
            .msg
            .as_ref()
            .map(|m| m.borrow().host_ts)
            .unwrap_or(Tmv::ZERO);
        if (now - host_ts).nanos() < TXD_TIMEOUT_NS {
            break;
        }
        let txd = q.tc_transmitted.pop_front().expect("front just observed");
        pool.free(txd);
        q.stats.pruned += 1;
    }
}

/// Releases every pending descriptor on the port. Called on port disable
/// and teardown.
pub fn flush(q: &mut Port, pool: &mut TxdPool) {
    let mut queue = std::mem::take(&mut q.tc_transmitted);
    for txd in queue.drain(..) {
        pool.free(txd);
    }
}

/// Sanity accessor for tests and stats: the pending queue in FIFO order.
pub(crate) fn pending(q: &Port) -> &VecDeque<Box<TcTxd>> {
    &q.tc_transmitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{folup_frame, mock_ports, recv_msg, sync_frame};
    use crate::transport::SendKind;
    use std::rc::Rc;

    fn pid_a() -> PortIdentity {
        PortIdentity { clock_identity: [0xA1; 8], port_number: 1 }
    }

    fn sent_general(handles: &crate::testutil::MockHandles) -> Vec<Vec<u8>> {
        handles
            .sent
            .borrow()
            .frames
            .iter()
            .filter(|f| f.kind == SendKind::General)
            .map(|f| f.data.clone())
            .collect()
    }

    fn sent_event(handles: &crate::testutil::MockHandles) -> Vec<Vec<u8>> {
        handles
            .sent
            .borrow()
            .frames
            .iter()
            .filter(|f| f.kind == SendKind::Event)
            .map(|f| f.data.clone())
            .collect()
    }

    fn frame_correction(frame: &[u8]) -> i64 {
        i64::from_be_bytes(frame[8..16].try_into().unwrap())
    }

    #[test]
    fn test_sync_then_follow_up_correction() {
        let (mut ports, handles) = mock_ports(&[1, 2]);
        let mut pool = TxdPool::new();

        // SYNC seq 42 in at 1000 ns, out of port 2 at 1400 ns: 400 ns inside.
        let sync = recv_msg(&sync_frame(0, 42, pid_a(), 0), Some(Tmv::from_nanos(1000)), 0);
        handles[1].tx_ts.borrow_mut().push_back(Some(Tmv::from_nanos(1400)));
        fwd_event(&mut ports, &mut pool, 0, &sync).unwrap();
        assert_eq!(sent_event(&handles[1]).len(), 1);
        assert_eq!(ports[1].pending_txd(), 1);

        let fup = recv_msg(&folup_frame(0, 42, pid_a(), 0x100), None, 0);
        fwd_folup(&mut ports, &mut pool, 0, &fup).unwrap();

        let corrected = sent_general(&handles[1]);
        assert_eq!(corrected.len(), 1);
        assert_eq!(frame_correction(&corrected[0]), 0x100 + (400 << 16));
        assert_eq!(frame_correction(&corrected[0]), 0x0190_0100);
        assert_eq!(ports[1].pending_txd(), 0);
        // The shared follow-up handle still carries its original correction.
        assert_eq!(fup.borrow().wire_correction(), 0x100);
    }

    #[test]
    fn test_reordered_follow_up_then_sync() {
        let (mut ports, handles) = mock_ports(&[1, 2]);
        let mut pool = TxdPool::new();

        let fup = recv_msg(&folup_frame(0, 42, pid_a(), 0x100), None, 0);
        fwd_folup(&mut ports, &mut pool, 0, &fup).unwrap();
        assert_eq!(ports[1].pending_txd(), 1, "follow-up parks until its sync egresses");
        assert!(sent_general(&handles[1]).is_empty());

        let sync = recv_msg(&sync_frame(0, 42, pid_a(), 0), Some(Tmv::from_nanos(1000)), 0);
        handles[1].tx_ts.borrow_mut().push_back(Some(Tmv::from_nanos(1250)));
        fwd_event(&mut ports, &mut pool, 0, &sync).unwrap();

        let corrected = sent_general(&handles[1]);
        assert_eq!(corrected.len(), 1);
        // The parked FOLLOW_UP is the frame that goes out, not the sync.
        let msg = recv_msg(&corrected[0], None, 0);
        assert_eq!(msg.borrow().msg_type(), Some(MsgType::FollowUp));
        assert_eq!(frame_correction(&corrected[0]), 0x100 + (250 << 16));
        assert_eq!(ports[1].pending_txd(), 0);
    }

    #[test]
    fn test_tx_timestamp_offset_enters_residence() {
        let (mut ports, handles) = mock_ports(&[1, 2]);
        ports[1].tx_timestamp_offset = Tmv::from_nanos(50);
        let mut pool = TxdPool::new();
        let sync = recv_msg(&sync_frame(0, 1, pid_a(), 0), Some(Tmv::from_nanos(1000)), 0);
        handles[1].tx_ts.borrow_mut().push_back(Some(Tmv::from_nanos(1400)));
        fwd_event(&mut ports, &mut pool, 0, &sync).unwrap();
        assert_eq!(pending(&ports[1])[0].residence, Tmv::from_nanos(450));
    }

    #[test]
    fn test_blocked_states_receive_nothing() {
        let (mut ports, handles) = mock_ports(&[1, 2, 3]);
        ports[0].set_state(PortState::Slave);
        ports[1].set_state(PortState::Passive);
        ports[2].set_state(PortState::Master);
        let mut pool = TxdPool::new();

        let sync = recv_msg(&sync_frame(0, 7, pid_a(), 0), Some(Tmv::from_nanos(100)), 0);
        fwd_event(&mut ports, &mut pool, 0, &sync).unwrap();

        assert!(handles[1].sent.borrow().frames.is_empty(), "PASSIVE egress is blocked");
        assert_eq!(sent_event(&handles[2]).len(), 1);
    }

    #[test]
    fn test_management_port_is_never_an_egress() {
        let (mut ports, handles) = mock_ports(&[1, 0, 3]);
        let mut pool = TxdPool::new();
        let ann = {
            let mut m = crate::msg::PtpMessage::build(MsgType::Announce, 0, pid_a(), 2, 1);
            m.pre_send().unwrap();
            recv_msg(m.wire(), None, 0)
        };
        forward(&mut ports, &mut pool, 0, &ann).unwrap();
        assert!(handles[1].sent.borrow().frames.is_empty());
        assert_eq!(handles[2].sent.borrow().frames.len(), 1);
    }

    #[test]
    fn test_send_failure_faults_only_that_egress() {
        let (mut ports, handles) = mock_ports(&[1, 2, 3]);
        handles[1].fail_sends.set(true);
        let mut pool = TxdPool::new();

        let sync = recv_msg(&sync_frame(0, 9, pid_a(), 0), Some(Tmv::from_nanos(100)), 0);
        fwd_event(&mut ports, &mut pool, 0, &sync).unwrap();

        assert_eq!(ports[1].state(), PortState::Faulty);
        assert_eq!(ports[2].state(), PortState::Listening);
        assert_eq!(sent_event(&handles[2]).len(), 1);
        assert_eq!(ports[2].pending_txd(), 1);
    }

    #[test]
    fn test_missing_tx_timestamp_faults_egress() {
        let (mut ports, handles) = mock_ports(&[1, 2]);
        handles[1].tx_ts.borrow_mut().push_back(None);
        let mut pool = TxdPool::new();
        let sync = recv_msg(&sync_frame(0, 9, pid_a(), 0), Some(Tmv::from_nanos(100)), 0);
        fwd_event(&mut ports, &mut pool, 0, &sync).unwrap();
        assert_eq!(ports[1].state(), PortState::Faulty);
        assert_eq!(ports[1].pending_txd(), 0);
    }

    #[test]
    fn test_corrected_follow_up_send_failure_still_retires_descriptor() {
        let (mut ports, handles) = mock_ports(&[1, 2]);
        let mut pool = TxdPool::new();
        let sync = recv_msg(&sync_frame(0, 3, pid_a(), 0), Some(Tmv::from_nanos(100)), 0);
        fwd_event(&mut ports, &mut pool, 0, &sync).unwrap();
        assert_eq!(ports[1].pending_txd(), 1);

        handles[1].fail_sends.set(true);
        let fup = recv_msg(&folup_frame(0, 3, pid_a(), 0), None, 0);
        fwd_folup(&mut ports, &mut pool, 0, &fup).unwrap();
        assert_eq!(ports[1].state(), PortState::Faulty);
        assert_eq!(ports[1].pending_txd(), 0);
    }

    #[test]
    fn test_exactly_once_per_tuple() {
        let (mut ports, handles) = mock_ports(&[1, 2]);
        let mut pool = TxdPool::new();
        let sync = recv_msg(&sync_frame(0, 11, pid_a(), 0), Some(Tmv::from_nanos(100)), 0);
        handles[1].tx_ts.borrow_mut().push_back(Some(Tmv::from_nanos(300)));
        fwd_event(&mut ports, &mut pool, 0, &sync).unwrap();

        let fup = recv_msg(&folup_frame(0, 11, pid_a(), 0), None, 0);
        fwd_folup(&mut ports, &mut pool, 0, &fup).unwrap();
        assert_eq!(sent_general(&handles[1]).len(), 1);

        // A duplicated follow-up finds no pending sync and parks instead of
        // producing a second corrected frame.
        let dup = recv_msg(&folup_frame(0, 11, pid_a(), 0), None, 0);
        fwd_folup(&mut ports, &mut pool, 0, &dup).unwrap();
        assert_eq!(sent_general(&handles[1]).len(), 1);
        assert_eq!(ports[1].pending_txd(), 1);
    }

    #[test]
    fn test_first_match_wins_on_duplicate_keys() {
        let (mut ports, handles) = mock_ports(&[1, 2]);
        let mut pool = TxdPool::new();

        // Two distinct syncs with the same (source, sequence) key.
        for tx in [1400i64, 1700] {
            let sync = recv_msg(&sync_frame(0, 5, pid_a(), 0), Some(Tmv::from_nanos(1000)), 0);
            handles[1].tx_ts.borrow_mut().push_back(Some(Tmv::from_nanos(tx)));
            fwd_event(&mut ports, &mut pool, 0, &sync).unwrap();
        }
        assert_eq!(ports[1].pending_txd(), 2);

        let fup = recv_msg(&folup_frame(0, 5, pid_a(), 0), None, 0);
        fwd_folup(&mut ports, &mut pool, 0, &fup).unwrap();
        let corrected = sent_general(&handles[1]);
        assert_eq!(corrected.len(), 1);
        assert_eq!(frame_correction(&corrected[0]), 400 << 16, "oldest sync wins");
        assert_eq!(ports[1].pending_txd(), 1);
    }

    #[test]
    fn test_shared_follow_up_corrects_each_egress_independently() {
        let (mut ports, handles) = mock_ports(&[1, 2, 3]);
        let mut pool = TxdPool::new();

        let sync = recv_msg(&sync_frame(0, 21, pid_a(), 0), Some(Tmv::from_nanos(1000)), 0);
        handles[1].tx_ts.borrow_mut().push_back(Some(Tmv::from_nanos(1400)));
        handles[2].tx_ts.borrow_mut().push_back(Some(Tmv::from_nanos(1900)));
        fwd_event(&mut ports, &mut pool, 0, &sync).unwrap();

        let fup = recv_msg(&folup_frame(0, 21, pid_a(), 0x40), None, 0);
        fwd_folup(&mut ports, &mut pool, 0, &fup).unwrap();

        let out2 = sent_general(&handles[1]);
        let out3 = sent_general(&handles[2]);
        assert_eq!(frame_correction(&out2[0]), 0x40 + (400 << 16));
        assert_eq!(frame_correction(&out3[0]), 0x40 + (900 << 16), "no cross-egress bleed");
    }

    #[test]
    fn test_cascaded_hops_accumulate_correction() {
        // Round-trip law: two transparent clocks in series, each holding the
        // frame for 400 ns, add exactly 2 × (400 << 16) to the correction.
        fn run_hop(fup_wire: &[u8]) -> Vec<u8> {
            let (mut ports, handles) = mock_ports(&[1, 2]);
            let mut pool = TxdPool::new();
            let sync = recv_msg(&sync_frame(0, 42, PortIdentity { clock_identity: [0xA1; 8], port_number: 1 }, 0), Some(Tmv::from_nanos(1000)), 0);
            handles[1].tx_ts.borrow_mut().push_back(Some(Tmv::from_nanos(1400)));
            fwd_event(&mut ports, &mut pool, 0, &sync).unwrap();
            let fup = recv_msg(fup_wire, None, 0);
            fwd_folup(&mut ports, &mut pool, 0, &fup).unwrap();
            let out = handles[1]
                .sent
                .borrow()
                .frames
                .iter()
                .rev()
                .find(|f| f.kind == SendKind::General)
                .map(|f| f.data.clone())
                .expect("corrected follow-up emitted");
            out
        }

        let original = folup_frame(0, 42, pid_a(), 0x100);
        let after_one = run_hop(&original);
        let after_two = run_hop(&after_one);
        assert_eq!(frame_correction(&after_two), 0x100 + 2 * (400 << 16));
    }

    #[test]
    fn test_pool_recycles_descriptors() {
        let (mut ports, handles) = mock_ports(&[1, 2]);
        let mut pool = TxdPool::new();

        for seq in 0..1000u16 {
            let sync = recv_msg(&sync_frame(0, seq, pid_a(), 0), Some(Tmv::from_nanos(100)), 0);
            handles[1].tx_ts.borrow_mut().push_back(Some(Tmv::from_nanos(200)));
            fwd_event(&mut ports, &mut pool, 0, &sync).unwrap();
            let fup = recv_msg(&folup_frame(0, seq, pid_a(), 0), None, 0);
            fwd_folup(&mut ports, &mut pool, 0, &fup).unwrap();
        }

        // Never more than one pending pair at a time, so one descriptor
        // serves the entire run.
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.cleanup(), 1);
        assert_eq!(pool.allocated(), 0);
    }

    #[test]
    fn test_pool_limit_reports_low_memory_as_fault() {
        let (mut ports, handles) = mock_ports(&[1, 2]);
        let mut pool = TxdPool::with_limit(0);
        let sync = recv_msg(&sync_frame(0, 2, pid_a(), 0), Some(Tmv::from_nanos(100)), 0);
        handles[1].tx_ts.borrow_mut().push_back(Some(Tmv::from_nanos(300)));
        fwd_event(&mut ports, &mut pool, 0, &sync).unwrap();
        assert_eq!(ports[1].state(), PortState::Faulty);
        assert_eq!(ports[1].pending_txd(), 0);
    }

    #[test]
    fn test_prune_removes_only_expired_head() {
        let (mut ports, handles) = mock_ports(&[1, 2]);
        let mut pool = TxdPool::new();

        for seq in [1u16, 2, 3] {
            let sync = recv_msg(&sync_frame(0, seq, pid_a(), 0), Some(Tmv::from_nanos(100)), 0);
            handles[1].tx_ts.borrow_mut().push_back(Some(Tmv::from_nanos(200)));
            fwd_event(&mut ports, &mut pool, 0, &sync).unwrap();
        }
        assert_eq!(ports[1].pending_txd(), 3);

        // Backdate: entries parked 1200 ms and 1100 ms ago are expired; the
        // third is 300 ms in the future of the first two's epoch.
        let now = tmv::now();
        let ages_ms = [1200i64, 1100, -300];
        for (txd, age) in ports[1].tc_transmitted.iter().zip(ages_ms) {
            txd.msg.as_ref().unwrap().borrow_mut().host_ts =
                now - Tmv::from_nanos(age * 1_000_000);
        }

        prune(&mut ports[1], &mut pool);
        assert_eq!(ports[1].pending_txd(), 1);
        let head = &pending(&ports[1])[0];
        assert_eq!(head.msg.as_ref().unwrap().borrow().header.sequence_id, 3);
        assert_eq!(ports[1].stats.pruned, 2);
    }

    #[test]
    fn test_prune_keeps_fresh_entries() {
        let (mut ports, handles) = mock_ports(&[1, 2]);
        let mut pool = TxdPool::new();
        let sync = recv_msg(&sync_frame(0, 1, pid_a(), 0), Some(Tmv::from_nanos(100)), 0);
        handles[1].tx_ts.borrow_mut().push_back(Some(Tmv::from_nanos(200)));
        fwd_event(&mut ports, &mut pool, 0, &sync).unwrap();
        prune(&mut ports[1], &mut pool);
        assert_eq!(ports[1].pending_txd(), 1);
    }

    #[test]
    fn test_flush_releases_message_references() {
        let (mut ports, _handles) = mock_ports(&[1, 2]);
        let mut pool = TxdPool::new();
        let sync = recv_msg(&sync_frame(0, 1, pid_a(), 0), Some(Tmv::from_nanos(100)), 0);
        fwd_event(&mut ports, &mut pool, 0, &sync).unwrap();
        assert_eq!(Rc::strong_count(&sync), 2, "parked descriptor holds one reference");

        flush(&mut ports[1], &mut pool);
        assert_eq!(ports[1].pending_txd(), 0);
        assert_eq!(Rc::strong_count(&sync), 1);
    }

    #[test]
    fn test_forward_never_echoes_to_ingress() {
        let (mut ports, handles) = mock_ports(&[1, 2]);
        let mut pool = TxdPool::new();
        let ann = {
            let mut m = crate::msg::PtpMessage::build(MsgType::Announce, 0, pid_a(), 2, 1);
            m.pre_send().unwrap();
            recv_msg(m.wire(), None, 0)
        };
        forward(&mut ports, &mut pool, 0, &ann).unwrap();
        assert!(handles[0].sent.borrow().frames.is_empty());
        assert_eq!(handles[1].sent.borrow().frames.len(), 1);
    }

    #[test]
    fn test_different_ingress_port_does_not_match() {
        let (mut ports, handles) = mock_ports(&[1, 2, 3]);
        let mut pool = TxdPool::new();

        // Sync enters through port 1, parks on port 3.
        ports[1].set_state(PortState::Passive);
        let sync = recv_msg(&sync_frame(0, 6, pid_a(), 0), Some(Tmv::from_nanos(100)), 0);
        handles[2].tx_ts.borrow_mut().push_back(Some(Tmv::from_nanos(200)));
        fwd_event(&mut ports, &mut pool, 0, &sync).unwrap();
        assert_eq!(ports[2].pending_txd(), 1);

        // The matching follow-up arriving through port 2 is a different
        // tuple and must not complete the parked descriptor.
        ports[1].set_state(PortState::Listening);
        let fup = recv_msg(&folup_frame(0, 6, pid_a(), 0), None, 0);
        fwd_folup(&mut ports, &mut pool, 1, &fup).unwrap();
        assert_eq!(sent_general(&handles[2]).len(), 0);
        assert_eq!(ports[2].pending_txd(), 2);
    }
}
