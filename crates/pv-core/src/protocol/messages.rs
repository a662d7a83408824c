//! Command codes, the message header and the fixed-layout payloads of the
//! process-variable access protocol.
//!
//! Every message on the wire starts with a 16-byte big-endian header.  The
//! meaning of `data_type`, `element_count`, `cid` and `available` depends on
//! the command; the per-command notes on [`Command`] spell out the reuse.
//!
//! # Why so many overloaded fields? (for beginners)
//!
//! The protocol predates variable-length headers.  Instead of adding fields,
//! each command reuses the four generic slots.  A SEARCH reply, for example,
//! carries the server's TCP port in `data_type` and the freshly allocated
//! server id in `cid`.  The header type therefore keeps the raw numbers and
//! leaves interpretation to the code that handles each command.

use serde::{Deserialize, Serialize};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Major protocol revision advertised in reports.
pub const MAJOR_PROTOCOL_REVISION: u16 = 4;

/// Minor protocol revision spoken by this server.
pub const MINOR_PROTOCOL_REVISION: u16 = 13;

/// Size of the legacy header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Size of the large-array header: legacy header plus two `u32` extensions.
pub const LARGE_HEADER_SIZE: usize = HEADER_SIZE + 8;

/// Marker stored in the 16-bit payload-size slot of a large-array header.
pub const LARGE_PAYLOAD_MARKER: u16 = 0xFFFF;

/// Default TCP/UDP port of the server.
pub const DEFAULT_SERVER_PORT: u16 = 5064;

/// Default UDP port beacons are sent to.
pub const DEFAULT_BEACON_PORT: u16 = 5065;

/// Size of the small TCP buffer class.
pub const MAX_TCP: usize = 16384;

/// Receive capacity of a UDP session.
pub const MAX_UDP_RECV: usize = 0xFFFF + 16;

/// Largest datagram the server composes.
pub const MAX_UDP_SEND: usize = 1024;

/// Size of one `STRING` element.
pub const MAX_STRING_SIZE: usize = 40;

/// Highest priority a client may request.
pub const MAX_PRIORITY: u16 = 99;

/// Longest accepted host or user name.
pub const MAX_NAME_LEN: usize = 512;

/// Longest diagnostic text carried in an ERROR message.
pub const MAX_DIAGNOSTIC_LEN: usize = 512;

/// SEARCH `data_type` asking for a NOT_FOUND reply on a miss.
pub const DO_REPLY: u16 = 10;

/// SEARCH `data_type` asking for silence on a miss.
pub const DONT_REPLY: u16 = 5;

/// VERSION `data_type` telling the client that `cid` carries a sequence number.
pub const SEQUENCE_NO_IS_VALID: u16 = 1;

/// Sentinel for "no id" in `cid`/`available` slots.
pub const NO_ID: u32 = u32::MAX;

/// Minor versions older than this are not served.
pub fn version_supported(minor: u16) -> bool {
    minor >= 4
}

/// Whether the peer understands the large-array header.
pub fn large_array_supported(minor: u16) -> bool {
    minor >= 9
}

/// Whether the peer expects sequence numbers in UDP replies.
pub fn sequence_numbers_supported(minor: u16) -> bool {
    minor >= 11
}

// ── Command codes ─────────────────────────────────────────────────────────────

/// All command codes of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum Command {
    /// Minor version exchange; `element_count` is the minor version.
    Version = 0,
    /// Subscribe; `available` is the client's subscription id.
    EventAdd = 1,
    /// Unsubscribe by subscription id.
    EventCancel = 2,
    /// Deprecated read, errors delivered as ERROR messages.
    Read = 3,
    /// Fire-and-forget write.
    Write = 4,
    Snapshot = 5,
    /// Name resolution; `available` carries the client's channel id.
    Search = 6,
    Build = 7,
    /// Client flow control on.
    EventsOff = 8,
    /// Client flow control off.
    EventsOn = 9,
    ReadSync = 10,
    Error = 11,
    ClearChannel = 12,
    /// Beacon.
    RsrvIsUp = 13,
    NotFound = 14,
    /// Read with status in `cid`.
    ReadNotify = 15,
    ReadBuild = 16,
    RepeaterConfirm = 17,
    /// Claim a channel; `available` is the client minor version.
    CreateChan = 18,
    WriteNotify = 19,
    ClientName = 20,
    HostName = 21,
    AccessRights = 22,
    Echo = 23,
    RepeaterRegister = 24,
    Signal = 25,
    CreateChanFail = 26,
    ServerDisconn = 27,
}

impl TryFrom<u16> for Command {
    type Error = ();

    fn try_from(value: u16) -> Result<Self, ()> {
        use Command::*;
        Ok(match value {
            0 => Version,
            1 => EventAdd,
            2 => EventCancel,
            3 => Read,
            4 => Write,
            5 => Snapshot,
            6 => Search,
            7 => Build,
            8 => EventsOff,
            9 => EventsOn,
            10 => ReadSync,
            11 => Error,
            12 => ClearChannel,
            13 => RsrvIsUp,
            14 => NotFound,
            15 => ReadNotify,
            16 => ReadBuild,
            17 => RepeaterConfirm,
            18 => CreateChan,
            19 => WriteNotify,
            20 => ClientName,
            21 => HostName,
            22 => AccessRights,
            23 => Echo,
            24 => RepeaterRegister,
            25 => Signal,
            26 => CreateChanFail,
            27 => ServerDisconn,
            _ => return Err(()),
        })
    }
}

// ── Header ────────────────────────────────────────────────────────────────────

/// Decoded message header.
///
/// `payload_size` and `element_count` are always held at full width; the
/// codec decides between the legacy and the large-array wire form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Raw command code; unknown codes are kept so they can be reported.
    pub command: u16,
    /// Payload length in bytes, always a multiple of 8 on the wire.
    pub payload_size: u32,
    pub data_type: u16,
    pub element_count: u32,
    pub cid: u32,
    pub available: u32,
}

impl Header {
    /// Builds a header for a known command with an empty payload.
    pub fn new(command: Command) -> Self {
        Self {
            command: command as u16,
            ..Self::default()
        }
    }

    /// The typed command, if the code is known.
    pub fn kind(&self) -> Option<Command> {
        Command::try_from(self.command).ok()
    }

    pub fn with_payload_size(mut self, payload_size: u32) -> Self {
        self.payload_size = payload_size;
        self
    }

    pub fn with_data_type(mut self, data_type: u16) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn with_element_count(mut self, element_count: u32) -> Self {
        self.element_count = element_count;
        self
    }

    pub fn with_cid(mut self, cid: u32) -> Self {
        self.cid = cid;
        self
    }

    pub fn with_available(mut self, available: u32) -> Self {
        self.available = available;
        self
    }
}

// ── Access rights ─────────────────────────────────────────────────────────────

/// Rights bits sent in ACCESS_RIGHTS replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessRights(pub u32);

impl AccessRights {
    pub const NONE: AccessRights = AccessRights(0);
    pub const READ: u32 = 1 << 0;
    pub const WRITE: u32 = 1 << 1;
    pub const READ_WRITE: AccessRights = AccessRights(Self::READ | Self::WRITE);

    pub fn new(read: bool, write: bool) -> Self {
        let mut bits = 0;
        if read {
            bits |= Self::READ;
        }
        if write {
            bits |= Self::WRITE;
        }
        AccessRights(bits)
    }

    pub fn can_read(self) -> bool {
        self.0 & Self::READ != 0
    }

    pub fn can_write(self) -> bool {
        self.0 & Self::WRITE != 0
    }

    /// Two-letter form used by the diagnostic report, e.g. `"rw"` or `"r-"`.
    pub fn as_report_str(self) -> &'static str {
        match (self.can_read(), self.can_write()) {
            (true, true) => "rw",
            (true, false) => "r-",
            (false, true) => "-w",
            (false, false) => "--",
        }
    }
}

// ── Monitor request payload ───────────────────────────────────────────────────

/// Event-mask bits of an EVENT_ADD request.
pub mod event_mask {
    pub const VALUE: u16 = 1 << 0;
    pub const LOG: u16 = 1 << 1;
    pub const ALARM: u16 = 1 << 2;
    pub const PROPERTY: u16 = 1 << 3;
}

/// Size of the EVENT_ADD payload.
pub const MONITOR_REQUEST_SIZE: usize = 16;

/// Payload of an EVENT_ADD request: three deprecated deadband floats, the
/// event mask and two bytes of padding.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MonitorRequest {
    pub low: f32,
    pub high: f32,
    pub to: f32,
    pub mask: u16,
}
