//! # pv-core
//!
//! Shared library for the process-variable access server containing the wire
//! protocol codec, the channel state machine and the discovery policies.
//!
//! It has no dependencies on sockets, threads or the async runtime, so every
//! rule in it can be tested with plain values.
//!
//! # Architecture overview (for beginners)
//!
//! Clients find a server by broadcasting a SEARCH datagram naming a data
//! point, or by hearing the server's periodic beacons.  They then open a TCP
//! session and create channels, each binding the session to one named point.
//!
//! - **`protocol`** – How bytes travel over the network: the 16-byte header
//!   (and its large-array form), command and status codes, the beacon
//!   datagram.
//!
//! - **`domain`** – The rules: which state a channel may move to, which
//!   address families discovery answers, how fast beacons slow down.

pub mod domain;
pub mod protocol;

pub use domain::address_policy::{FamilyMode, FamilyPolicy, IgnoreList};
pub use domain::backoff::BeaconSchedule;
pub use domain::channel_state::{ChannelEvent, ChannelList, ChannelState, TransitionError};
pub use protocol::codec::{decode_header, encode_header, ProtocolError};
pub use protocol::messages::{AccessRights, Command, Header};
