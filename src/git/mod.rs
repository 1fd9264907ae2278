//! Git smart-HTTP client: pkt-line framing plus a remote-helper protocol
//! implementation used by build steps that clone repositories.

pub mod pktline;
pub mod remote_helper;

pub use pktline::PktLine;
pub use remote_helper::RemoteHelper;
