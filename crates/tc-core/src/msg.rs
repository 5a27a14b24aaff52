//! PTP message parsing and serialization.
//!
//! A [`PtpMessage`] keeps the raw wire image alongside a parsed header. The
//! transparent clock mostly passes frames through untouched: the only fields
//! ever rewritten on a forwarded frame are the 64-bit correction field and,
//! for FOLLOW_UP, the precise origin timestamp. Both are patched directly
//! into the wire buffer in network byte order.
//!
//! Common header layout (34 bytes, all multi-byte fields big-endian):
//!   Byte    0        = majorSdoId (high nibble) | messageType (low nibble)
//!   Byte    1        = minorVersionPTP | versionPTP
//!   Bytes   2 ..  3  = messageLength
//!   Byte    4        = domainNumber
//!   Byte    5        = minorSdoId
//!   Bytes   6 ..  7  = flagField          (bit 0x02 = two-step, 0x04 = unicast)
//!   Bytes   8 .. 15  = correctionField    (i64, nanoseconds × 2^16)
//!   Bytes  16 .. 19  = messageTypeSpecific
//!   Bytes  20 .. 27  = sourcePortIdentity.clockIdentity
//!   Bytes  28 .. 29  = sourcePortIdentity.portNumber
//!   Bytes  30 .. 31  = sequenceId
//!   Byte   32        = controlField
//!   Byte   33        = logMessageInterval
//!
//! Timestamp-bearing bodies put a 48-bit-seconds + 32-bit-nanoseconds
//! timestamp at bytes 34..44; PDELAY_RESP and PDELAY_RESP_FOLLOW_UP append
//! a requestingPortIdentity at bytes 44..54.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{ensure, Result};

use crate::tmv::{Tmv, NSEC_PER_SEC};

/// Shared-ownership message handle. The event loop holds one reference; a
/// pending TC descriptor holds one more for as long as it is parked.
pub type MsgRc = Rc<RefCell<PtpMessage>>;

pub const HDR_LEN: usize = 34;
/// Largest frame the transport will deliver.
pub const MAX_MSG_LEN: usize = 1500;

pub const PTP_VERSION: u8 = 2;

const OFF_LENGTH: usize = 2;
const OFF_DOMAIN: usize = 4;
const OFF_FLAGS: usize = 6;
const OFF_CORRECTION: usize = 8;
const OFF_SPID: usize = 20;
const OFF_SEQID: usize = 30;
const OFF_CONTROL: usize = 32;
const OFF_LOG_INTERVAL: usize = 33;
const OFF_BODY_TS: usize = 34;
const OFF_REQ_PID: usize = 44;

/// flagField\[0\] bits.
pub const FLAG_TWO_STEP: u8 = 0x02;
pub const FLAG_UNICAST: u8 = 0x04;

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Sync = 0x0,
    DelayReq = 0x1,
    PdelayReq = 0x2,
    PdelayResp = 0x3,
    FollowUp = 0x8,
    DelayResp = 0x9,
    PdelayRespFollowUp = 0xA,
    Announce = 0xB,
    Signaling = 0xC,
    Management = 0xD,
}

impl MsgType {
    pub fn from_nibble(n: u8) -> Option<MsgType> {
        Some(match n {
            0x0 => MsgType::Sync,
            0x1 => MsgType::DelayReq,
            0x2 => MsgType::PdelayReq,
            0x3 => MsgType::PdelayResp,
            0x8 => MsgType::FollowUp,
            0x9 => MsgType::DelayResp,
            0xA => MsgType::PdelayRespFollowUp,
            0xB => MsgType::Announce,
            0xC => MsgType::Signaling,
            0xD => MsgType::Management,
            _ => return None,
        })
    }

    /// Event messages are hardware-timestamped at ingress and egress.
    pub fn is_event(self) -> bool {
        matches!(
            self,
            MsgType::Sync | MsgType::DelayReq | MsgType::PdelayReq | MsgType::PdelayResp
        )
    }

    /// Minimum on-wire length for this type.
    fn min_len(self) -> usize {
        match self {
            MsgType::Sync | MsgType::DelayReq | MsgType::FollowUp => 44,
            MsgType::DelayResp
            | MsgType::PdelayReq
            | MsgType::PdelayResp
            | MsgType::PdelayRespFollowUp => 54,
            MsgType::Announce => 64,
            MsgType::Signaling => 44,
            MsgType::Management => 48,
        }
    }

    /// Legacy controlField value carried in byte 32.
    fn control(self) -> u8 {
        match self {
            MsgType::Sync => 0,
            MsgType::DelayReq => 1,
            MsgType::FollowUp => 2,
            MsgType::DelayResp => 3,
            MsgType::Management => 4,
            _ => 5,
        }
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MsgType::Sync => "SYNC",
            MsgType::DelayReq => "DELAY_REQ",
            MsgType::PdelayReq => "PDELAY_REQ",
            MsgType::PdelayResp => "PDELAY_RESP",
            MsgType::FollowUp => "FOLLOW_UP",
            MsgType::DelayResp => "DELAY_RESP",
            MsgType::PdelayRespFollowUp => "PDELAY_RESP_FOLLOW_UP",
            MsgType::Announce => "ANNOUNCE",
            MsgType::Signaling => "SIGNALING",
            MsgType::Management => "MANAGEMENT",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Identities and timestamps
// ---------------------------------------------------------------------------

/// `clockIdentity` + `portNumber`, the sender identity in every PTP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortIdentity {
    pub clock_identity: [u8; 8],
    pub port_number: u16,
}

/// 48-bit seconds + 32-bit nanoseconds, as carried in message bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireTimestamp {
    pub sec: u64,
    pub nsec: u32,
}

impl WireTimestamp {
    pub fn to_tmv(self) -> Tmv {
        Tmv::from_nanos(self.sec as i64 * NSEC_PER_SEC + self.nsec as i64)
    }

    pub fn from_tmv(t: Tmv) -> WireTimestamp {
        let (sec, nsec) = t.to_timespec();
        WireTimestamp { sec: sec as u64 & 0xFFFF_FFFF_FFFF, nsec: nsec as u32 }
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Parsed common header, host byte order.
#[derive(Debug, Clone, Default)]
pub struct Header {
    pub msg_type: Option<MsgType>,
    pub major_sdo_id: u8,
    pub version: u8,
    pub message_length: u16,
    pub domain: u8,
    pub flags: [u8; 2],
    pub correction: i64,
    pub source_port_identity: PortIdentity,
    pub sequence_id: u16,
    pub control: u8,
    pub log_message_interval: i8,
}

// ---------------------------------------------------------------------------
// Receive classification
// ---------------------------------------------------------------------------

/// Why an inbound frame was not accepted. Maps onto the classic errno
/// trichotomy: `BadMessage` ≙ EBADMSG, `MissingTimestamp` ≙ ETIME,
/// `Ignore` ≙ EPROTO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    BadMessage,
    MissingTimestamp,
    Ignore,
}

// ---------------------------------------------------------------------------
// PtpMessage
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PtpMessage {
    pub header: Header,
    /// Kernel timestamp of the most recent ingress or egress through the
    /// transport. `None` when the stamp was not captured.
    pub hwts: Option<Tmv>,
    /// Monotonic host time when the core first saw the message. Only used
    /// for pending-queue age-out.
    pub host_ts: Tmv,
    /// Body timestamp parsed at receive time (origin timestamp for SYNC,
    /// precise origin for FOLLOW_UP, request receipt for PDELAY_RESP, ...).
    pub pdu_ts: WireTimestamp,
    buf: Vec<u8>,
}

impl PtpMessage {
    /// Fresh message ready for `Transport::recv`.
    pub fn allocate() -> PtpMessage {
        PtpMessage {
            header: Header::default(),
            hwts: None,
            host_ts: Tmv::ZERO,
            pdu_ts: WireTimestamp::default(),
            buf: vec![0u8; MAX_MSG_LEN],
        }
    }

    pub fn into_rc(self) -> MsgRc {
        Rc::new(RefCell::new(self))
    }

    /// Buffer for the transport to read a frame into.
    pub fn recv_buffer(&mut self) -> &mut [u8] {
        self.buf.resize(MAX_MSG_LEN, 0);
        &mut self.buf[..]
    }

    /// Current wire image.
    pub fn wire(&self) -> &[u8] {
        &self.buf
    }

    pub fn msg_type(&self) -> Option<MsgType> {
        self.header.msg_type
    }

    pub fn is_unicast(&self) -> bool {
        self.header.flags[0] & FLAG_UNICAST != 0
    }

    pub fn is_two_step(&self) -> bool {
        self.header.flags[0] & FLAG_TWO_STEP != 0
    }

    pub fn source_pid_eq(&self, other: &PtpMessage) -> bool {
        self.header.source_port_identity == other.header.source_port_identity
    }

    /// Parses and validates a frame of `cnt` bytes received into the buffer.
    ///
    /// `expected_domain` filters traffic from other PTP domains; event
    /// messages must carry a receive timestamp by the time this runs.
    pub fn post_recv(&mut self, cnt: usize, expected_domain: u8) -> Result<(), RecvError> {
        if cnt < HDR_LEN {
            return Err(RecvError::BadMessage);
        }
        self.buf.truncate(cnt);

        let b = &self.buf;
        // Full byte kept so minorVersionPTP survives pass-through untouched.
        let version = b[1];
        if version & 0x0F != PTP_VERSION {
            return Err(RecvError::Ignore);
        }
        let msg_type = MsgType::from_nibble(b[0] & 0x0F).ok_or(RecvError::BadMessage)?;
        let message_length = u16::from_be_bytes([b[OFF_LENGTH], b[OFF_LENGTH + 1]]);
        if message_length as usize > cnt || (message_length as usize) < msg_type.min_len() {
            return Err(RecvError::BadMessage);
        }
        let domain = b[OFF_DOMAIN];
        if domain != expected_domain {
            return Err(RecvError::Ignore);
        }
        if msg_type.is_event() && self.hwts.is_none() {
            return Err(RecvError::MissingTimestamp);
        }

        let mut clock_identity = [0u8; 8];
        clock_identity.copy_from_slice(&b[OFF_SPID..OFF_SPID + 8]);
        self.header = Header {
            msg_type: Some(msg_type),
            major_sdo_id: b[0] >> 4,
            version,
            message_length,
            domain,
            flags: [b[OFF_FLAGS], b[OFF_FLAGS + 1]],
            correction: i64::from_be_bytes(b[OFF_CORRECTION..OFF_CORRECTION + 8].try_into().unwrap()),
            source_port_identity: PortIdentity {
                clock_identity,
                port_number: u16::from_be_bytes([b[OFF_SPID + 8], b[OFF_SPID + 9]]),
            },
            sequence_id: u16::from_be_bytes([b[OFF_SEQID], b[OFF_SEQID + 1]]),
            control: b[OFF_CONTROL],
            log_message_interval: b[OFF_LOG_INTERVAL] as i8,
        };

        if matches!(
            msg_type,
            MsgType::Sync
                | MsgType::FollowUp
                | MsgType::DelayReq
                | MsgType::PdelayReq
                | MsgType::PdelayResp
                | MsgType::PdelayRespFollowUp
        ) {
            self.pdu_ts = self.read_body_ts();
        }

        Ok(())
    }

    /// Re-serializes the header into the wire buffer. Body bytes are left as
    /// built or as received.
    pub fn pre_send(&mut self) -> Result<()> {
        ensure!(self.buf.len() >= HDR_LEN, "message shorter than a PTP header");
        let h = &self.header;
        let msg_type = h.msg_type.ok_or_else(|| anyhow::anyhow!("untyped message"))?;
        let b = &mut self.buf;
        b[0] = (h.major_sdo_id << 4) | (msg_type as u8);
        b[1] = h.version;
        b[OFF_LENGTH..OFF_LENGTH + 2].copy_from_slice(&h.message_length.to_be_bytes());
        b[OFF_DOMAIN] = h.domain;
        b[OFF_FLAGS] = h.flags[0];
        b[OFF_FLAGS + 1] = h.flags[1];
        b[OFF_CORRECTION..OFF_CORRECTION + 8].copy_from_slice(&h.correction.to_be_bytes());
        b[OFF_SPID..OFF_SPID + 8].copy_from_slice(&h.source_port_identity.clock_identity);
        b[OFF_SPID + 8..OFF_SPID + 10]
            .copy_from_slice(&h.source_port_identity.port_number.to_be_bytes());
        b[OFF_SEQID..OFF_SEQID + 2].copy_from_slice(&h.sequence_id.to_be_bytes());
        b[OFF_CONTROL] = h.control;
        b[OFF_LOG_INTERVAL] = h.log_message_interval as u8;
        Ok(())
    }

    /// Reads the correction field straight from the wire image.
    pub fn wire_correction(&self) -> i64 {
        i64::from_be_bytes(self.buf[OFF_CORRECTION..OFF_CORRECTION + 8].try_into().unwrap())
    }

    /// Writes the correction field straight into the wire image.
    pub fn set_wire_correction(&mut self, c: i64) {
        self.buf[OFF_CORRECTION..OFF_CORRECTION + 8].copy_from_slice(&c.to_be_bytes());
    }

    fn read_body_ts(&self) -> WireTimestamp {
        let b = &self.buf;
        if b.len() < OFF_BODY_TS + 10 {
            return WireTimestamp::default();
        }
        let sec_msb = u16::from_be_bytes([b[OFF_BODY_TS], b[OFF_BODY_TS + 1]]) as u64;
        let sec_lsb = u32::from_be_bytes(b[OFF_BODY_TS + 2..OFF_BODY_TS + 6].try_into().unwrap());
        let nsec = u32::from_be_bytes(b[OFF_BODY_TS + 6..OFF_BODY_TS + 10].try_into().unwrap());
        WireTimestamp { sec: (sec_msb << 32) | sec_lsb as u64, nsec }
    }

    /// Writes the body timestamp (bytes 34..44) as a 16/32/32 split.
    pub fn set_body_ts(&mut self, ts: WireTimestamp) {
        let b = &mut self.buf;
        let sec_msb = (ts.sec >> 32) as u16;
        let sec_lsb = (ts.sec & 0xFFFF_FFFF) as u32;
        b[OFF_BODY_TS..OFF_BODY_TS + 2].copy_from_slice(&sec_msb.to_be_bytes());
        b[OFF_BODY_TS + 2..OFF_BODY_TS + 6].copy_from_slice(&sec_lsb.to_be_bytes());
        b[OFF_BODY_TS + 6..OFF_BODY_TS + 10].copy_from_slice(&ts.nsec.to_be_bytes());
    }

    /// Rewrites a FOLLOW_UP's preciseOriginTimestamp from the timestamp
    /// parsed at receive time, so re-serialization is deterministic.
    pub fn refresh_follow_up_origin(&mut self) {
        let ts = self.pdu_ts;
        self.set_body_ts(ts);
    }

    pub fn requesting_port_identity(&self) -> Option<PortIdentity> {
        let b = &self.buf;
        if b.len() < OFF_REQ_PID + 10 {
            return None;
        }
        let mut clock_identity = [0u8; 8];
        clock_identity.copy_from_slice(&b[OFF_REQ_PID..OFF_REQ_PID + 8]);
        Some(PortIdentity {
            clock_identity,
            port_number: u16::from_be_bytes([b[OFF_REQ_PID + 8], b[OFF_REQ_PID + 9]]),
        })
    }

    pub fn set_requesting_port_identity(&mut self, pid: PortIdentity) {
        let b = &mut self.buf;
        b[OFF_REQ_PID..OFF_REQ_PID + 8].copy_from_slice(&pid.clock_identity);
        b[OFF_REQ_PID + 8..OFF_REQ_PID + 10].copy_from_slice(&pid.port_number.to_be_bytes());
    }

    /// Builds an outbound message with a zeroed body of the type's minimum
    /// length. The caller fills body fields, then `pre_send`s.
    pub fn build(
        msg_type: MsgType,
        domain: u8,
        source_port_identity: PortIdentity,
        sequence_id: u16,
        log_message_interval: i8,
    ) -> PtpMessage {
        let len = msg_type.min_len();
        PtpMessage {
            header: Header {
                msg_type: Some(msg_type),
                major_sdo_id: 0,
                version: PTP_VERSION,
                message_length: len as u16,
                domain,
                flags: [0, 0],
                correction: 0,
                source_port_identity,
                sequence_id,
                control: msg_type.control(),
                log_message_interval,
            },
            hwts: None,
            host_ts: Tmv::ZERO,
            pdu_ts: WireTimestamp::default(),
            buf: vec![0u8; len],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_frame(domain: u8, seq: u16, pid: PortIdentity) -> Vec<u8> {
        let mut m = PtpMessage::build(MsgType::Sync, domain, pid, seq, 0);
        m.header.flags[0] = FLAG_TWO_STEP;
        m.pre_send().unwrap();
        m.wire().to_vec()
    }

    fn recv_from(frame: &[u8], hwts: Option<Tmv>, domain: u8) -> Result<PtpMessage, RecvError> {
        let mut m = PtpMessage::allocate();
        m.recv_buffer()[..frame.len()].copy_from_slice(frame);
        m.hwts = hwts;
        m.post_recv(frame.len(), domain).map(|_| m)
    }

    fn pid(clock: u8, port: u16) -> PortIdentity {
        PortIdentity { clock_identity: [clock; 8], port_number: port }
    }

    #[test]
    fn test_sync_round_trip() {
        let frame = sync_frame(1, 42, pid(0xAA, 7));
        let m = recv_from(&frame, Some(Tmv::from_nanos(1000)), 1).unwrap();
        assert_eq!(m.msg_type(), Some(MsgType::Sync));
        assert_eq!(m.header.sequence_id, 42);
        assert_eq!(m.header.domain, 1);
        assert_eq!(m.header.source_port_identity, pid(0xAA, 7));
        assert!(m.is_two_step());
        assert!(!m.is_unicast());
    }

    #[test]
    fn test_correction_is_big_endian_on_the_wire() {
        let mut m = PtpMessage::build(MsgType::FollowUp, 0, pid(1, 1), 9, 0);
        m.header.correction = 0x0000_0000_0190_0100;
        m.pre_send().unwrap();
        assert_eq!(
            &m.wire()[8..16],
            &[0x00, 0x00, 0x00, 0x00, 0x01, 0x90, 0x01, 0x00]
        );
        assert_eq!(m.wire_correction(), 0x0190_0100);
    }

    #[test]
    fn test_set_wire_correction_preserves_sign() {
        let mut m = PtpMessage::build(MsgType::FollowUp, 0, pid(1, 1), 9, 0);
        m.pre_send().unwrap();
        m.set_wire_correction(-5 << 16);
        assert_eq!(m.wire_correction(), -5 << 16);
    }

    #[test]
    fn test_short_frame_is_bad() {
        assert_eq!(recv_from(&[0u8; 20], None, 0).unwrap_err(), RecvError::BadMessage);
    }

    #[test]
    fn test_wrong_version_is_ignored() {
        let mut frame = sync_frame(0, 1, pid(1, 1));
        frame[1] = 1;
        let err = recv_from(&frame, Some(Tmv::ZERO), 0).unwrap_err();
        assert_eq!(err, RecvError::Ignore);
    }

    #[test]
    fn test_other_domain_is_ignored() {
        let frame = sync_frame(3, 1, pid(1, 1));
        let err = recv_from(&frame, Some(Tmv::ZERO), 0).unwrap_err();
        assert_eq!(err, RecvError::Ignore);
    }

    #[test]
    fn test_event_without_timestamp_is_etime() {
        let frame = sync_frame(0, 1, pid(1, 1));
        let err = recv_from(&frame, None, 0).unwrap_err();
        assert_eq!(err, RecvError::MissingTimestamp);
        // General messages do not need one.
        let mut fup = PtpMessage::build(MsgType::FollowUp, 0, pid(1, 1), 1, 0);
        fup.pre_send().unwrap();
        let frame = fup.wire().to_vec();
        assert!(recv_from(&frame, None, 0).is_ok());
    }

    #[test]
    fn test_truncated_length_field_is_bad() {
        let mut frame = sync_frame(0, 1, pid(1, 1));
        frame[2] = 0xFF;
        frame[3] = 0xFF;
        assert_eq!(
            recv_from(&frame, Some(Tmv::ZERO), 0).unwrap_err(),
            RecvError::BadMessage
        );
    }

    #[test]
    fn test_body_timestamp_round_trip() {
        let mut m = PtpMessage::build(MsgType::FollowUp, 0, pid(1, 1), 1, 0);
        let ts = WireTimestamp { sec: 0x1_2345_6789, nsec: 987_654_321 };
        m.set_body_ts(ts);
        m.pre_send().unwrap();
        let frame = m.wire().to_vec();
        let got = recv_from(&frame, None, 0).unwrap();
        assert_eq!(got.pdu_ts, ts);
    }

    #[test]
    fn test_refresh_follow_up_origin_is_deterministic() {
        let mut m = PtpMessage::build(MsgType::FollowUp, 0, pid(1, 1), 1, 0);
        m.set_body_ts(WireTimestamp { sec: 77, nsec: 500 });
        m.pre_send().unwrap();
        let frame = m.wire().to_vec();
        let mut got = recv_from(&frame, None, 0).unwrap();
        got.refresh_follow_up_origin();
        assert_eq!(got.wire(), &frame[..]);
    }

    #[test]
    fn test_requesting_port_identity_round_trip() {
        let mut m = PtpMessage::build(MsgType::PdelayResp, 0, pid(2, 1), 5, 0x7F);
        m.set_requesting_port_identity(pid(9, 3));
        m.pre_send().unwrap();
        let frame = m.wire().to_vec();
        let got = recv_from(&frame, Some(Tmv::ZERO), 0).unwrap();
        assert_eq!(got.requesting_port_identity(), Some(pid(9, 3)));
    }

    #[test]
    fn test_wire_timestamp_tmv_conversion() {
        let ts = WireTimestamp { sec: 2, nsec: 500_000_000 };
        assert_eq!(ts.to_tmv(), Tmv::from_nanos(2_500_000_000));
        assert_eq!(WireTimestamp::from_tmv(Tmv::from_nanos(2_500_000_000)), ts);
    }
}
