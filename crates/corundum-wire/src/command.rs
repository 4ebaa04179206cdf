//! Protocol command and operation tags.

/// The command tag carried by every message header.
///
/// Tag values are part of the on-disk and on-wire format; they must
/// never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    // === Liveness ===
    Ping = 1,
    Pong = 2,

    // === Normal operation ===
    Request = 3,
    Prepare = 4,
    PrepareOk = 5,
    Reply = 6,
    Commit = 7,

    // === View change ===
    StartViewChange = 8,
    DoViewChange = 9,
    StartView = 10,
    RequestStartView = 11,

    // === Repair ===
    RequestPrepare = 12,
    RequestHeaders = 13,
    Headers = 14,
    RequestReply = 15,

    // === Grid ===
    RequestBlock = 16,
    Block = 17,

    // === State sync ===
    RequestSyncCheckpoint = 18,
    SyncCheckpoint = 19,
}

impl Command {
    /// Returns the single-byte tag for serialization.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Creates a `Command` from its byte tag.
    ///
    /// Returns `None` for unknown tags — unknown commands make a
    /// message invalid, they are never interpreted.
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            1 => Command::Ping,
            2 => Command::Pong,
            3 => Command::Request,
            4 => Command::Prepare,
            5 => Command::PrepareOk,
            6 => Command::Reply,
            7 => Command::Commit,
            8 => Command::StartViewChange,
            9 => Command::DoViewChange,
            10 => Command::StartView,
            11 => Command::RequestStartView,
            12 => Command::RequestPrepare,
            13 => Command::RequestHeaders,
            14 => Command::Headers,
            15 => Command::RequestReply,
            16 => Command::RequestBlock,
            17 => Command::Block,
            18 => Command::RequestSyncCheckpoint,
            19 => Command::SyncCheckpoint,
            _ => return None,
        })
    }

    /// Human-readable name for logging.
    pub fn name(self) -> &'static str {
        match self {
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::Request => "request",
            Command::Prepare => "prepare",
            Command::PrepareOk => "prepare_ok",
            Command::Reply => "reply",
            Command::Commit => "commit",
            Command::StartViewChange => "start_view_change",
            Command::DoViewChange => "do_view_change",
            Command::StartView => "start_view",
            Command::RequestStartView => "request_start_view",
            Command::RequestPrepare => "request_prepare",
            Command::RequestHeaders => "request_headers",
            Command::Headers => "headers",
            Command::RequestReply => "request_reply",
            Command::RequestBlock => "request_block",
            Command::Block => "block",
            Command::RequestSyncCheckpoint => "request_sync_checkpoint",
            Command::SyncCheckpoint => "sync_checkpoint",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The application operation tag of a prepare or reply.
///
/// Values below [`Operation::APPLICATION_MIN`] are reserved for the
/// protocol; the state machine sees only application operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Operation(u8);

impl Operation {
    /// The log root and upgrade padding.
    pub const NOOP: Operation = Operation(0);
    /// Client session registration.
    pub const REGISTER: Operation = Operation(1);
    /// Release upgrade announcement.
    pub const UPGRADE: Operation = Operation(2);

    /// First tag available to the application state machine.
    pub const APPLICATION_MIN: u8 = 16;

    pub const fn new(tag: u8) -> Self {
        Self(tag)
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// Returns true for operations handled by the state machine rather
    /// than the replication protocol itself.
    pub fn is_application(self) -> bool {
        self.0 >= Self::APPLICATION_MIN
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Operation::NOOP => write!(f, "noop"),
            Operation::REGISTER => write!(f, "register"),
            Operation::UPGRADE => write!(f, "upgrade"),
            Operation(tag) => write!(f, "application:{tag}"),
        }
    }
}
