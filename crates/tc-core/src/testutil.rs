//! Shared test fixtures: a scriptable in-memory transport and frame
//! builders.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::rc::Rc;

use anyhow::{anyhow, bail, Result};

use crate::fsm::PortState;
use crate::msg::{MsgRc, MsgType, PortIdentity, PtpMessage, FLAG_TWO_STEP};
use crate::port::{Port, PortOptions};
use crate::tmv::Tmv;
use crate::transport::{SendKind, Transport};

pub(crate) struct SentFrame {
    pub kind: SendKind,
    pub data: Vec<u8>,
}

#[derive(Default)]
pub(crate) struct SentLog {
    pub frames: Vec<SentFrame>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct SentKindCount {
    pub event: usize,
    pub general: usize,
}

impl SentLog {
    pub fn counts(&self) -> SentKindCount {
        SentKindCount {
            event: self.frames.iter().filter(|f| f.kind == SendKind::Event).count(),
            general: self.frames.iter().filter(|f| f.kind == SendKind::General).count(),
        }
    }
}

/// Shared knobs for one [`MockTransport`], kept by the test after the
/// transport itself is boxed into the port.
#[derive(Clone)]
pub(crate) struct MockHandles {
    pub sent: Rc<RefCell<SentLog>>,
    pub rx: Rc<RefCell<VecDeque<(Vec<u8>, Option<Tmv>)>>>,
    /// Timestamps handed out for event sends, in order. Empty queue means
    /// `Some(Tmv::ZERO)`.
    pub tx_ts: Rc<RefCell<VecDeque<Option<Tmv>>>>,
    pub fail_sends: Rc<Cell<bool>>,
    pub fail_recv: Rc<Cell<bool>>,
}

impl MockHandles {
    fn new() -> MockHandles {
        MockHandles {
            sent: Rc::new(RefCell::new(SentLog::default())),
            rx: Rc::new(RefCell::new(VecDeque::new())),
            tx_ts: Rc::new(RefCell::new(VecDeque::new())),
            fail_sends: Rc::new(Cell::new(false)),
            fail_recv: Rc::new(Cell::new(false)),
        }
    }
}

pub(crate) struct MockTransport {
    handles: MockHandles,
}

impl Transport for MockTransport {
    fn send(&mut self, kind: SendKind, msg: &mut PtpMessage) -> Result<usize> {
        if self.handles.fail_sends.get() {
            bail!("simulated send failure");
        }
        self.handles
            .sent
            .borrow_mut()
            .frames
            .push(SentFrame { kind, data: msg.wire().to_vec() });
        if kind == SendKind::Event {
            msg.hwts = self
                .handles
                .tx_ts
                .borrow_mut()
                .pop_front()
                .unwrap_or(Some(Tmv::ZERO));
        }
        Ok(msg.wire().len())
    }

    fn recv(&mut self, _fd: RawFd, msg: &mut PtpMessage) -> Result<usize> {
        if self.handles.fail_recv.get() {
            bail!("simulated recv failure");
        }
        let (data, ts) = self
            .handles
            .rx
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("rx queue empty"))?;
        msg.recv_buffer()[..data.len()].copy_from_slice(&data);
        msg.hwts = ts;
        Ok(data.len())
    }
}

pub(crate) const TEST_CLOCK_ID: [u8; 8] = [0xAB, 0xAB, 0xAB, 0xFF, 0xFE, 0xAB, 0xAB, 0xAB];

/// One port in LISTENING with a scriptable transport.
pub(crate) fn mock_port(number: u16) -> (Port, MockHandles) {
    let handles = MockHandles::new();
    let transport = MockTransport { handles: handles.clone() };
    let opts = PortOptions { interface: format!("mock{}", number), ..PortOptions::default() };
    let mut port =
        Port::new(number, Box::new(transport), TEST_CLOCK_ID, &opts).expect("mock port");
    port.set_state(PortState::Listening);
    (port, handles)
}

/// A sibling set of ports with the given port numbers, all LISTENING.
pub(crate) fn mock_ports(numbers: &[u16]) -> (Vec<Port>, Vec<MockHandles>) {
    let mut ports = Vec::new();
    let mut handles = Vec::new();
    for &n in numbers {
        let (p, h) = mock_port(n);
        ports.push(p);
        handles.push(h);
    }
    (ports, handles)
}

/// Convenience wrapper used by tests that only send: returns the port and
/// its sent-frame log, with `tx_ts` preloaded.
pub(crate) fn test_port(number: u16, tx_ts: &[Option<Tmv>]) -> (Port, Rc<RefCell<SentLog>>) {
    let (port, handles) = mock_port(number);
    handles.tx_ts.borrow_mut().extend(tx_ts.iter().cloned());
    (port, handles.sent)
}

/// A two-step SYNC frame.
pub(crate) fn sync_frame(domain: u8, seq: u16, pid: PortIdentity, correction: i64) -> Vec<u8> {
    let mut m = PtpMessage::build(MsgType::Sync, domain, pid, seq, 0);
    m.header.flags[0] = FLAG_TWO_STEP;
    m.header.correction = correction;
    m.pre_send().unwrap();
    m.wire().to_vec()
}

/// A FOLLOW_UP frame with the given correction.
pub(crate) fn folup_frame(domain: u8, seq: u16, pid: PortIdentity, correction: i64) -> Vec<u8> {
    let mut m = PtpMessage::build(MsgType::FollowUp, domain, pid, seq, 0);
    m.header.correction = correction;
    m.pre_send().unwrap();
    m.wire().to_vec()
}

/// Parses a frame the way the receive path would, returning the shared
/// handle the forwarding functions take.
pub(crate) fn recv_msg(frame: &[u8], hwts: Option<Tmv>, domain: u8) -> MsgRc {
    let mut m = PtpMessage::allocate();
    m.recv_buffer()[..frame.len()].copy_from_slice(frame);
    m.hwts = hwts;
    m.post_recv(frame.len(), domain).expect("test frame parses");
    m.into_rc()
}
