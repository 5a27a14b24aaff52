pub mod clock;
pub mod filter;
pub mod fsm;
pub mod msg;
pub mod p2p;
pub mod pdelay;
pub mod port;
pub mod rtnl;
pub mod tc;
pub mod timer;
pub mod tmv;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use clock::Clock;
pub use filter::Ewma;
pub use fsm::{FsmEvent, PortState};
pub use msg::{MsgRc, MsgType, PortIdentity, PtpMessage};
pub use port::{Port, PortOptions, PortSnapshot};
pub use tc::TxdPool;
pub use tmv::Tmv;
pub use transport::{SendKind, Transport, UdpTransport};
