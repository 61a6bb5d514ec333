//! Operation codes understood by the command daemon.
//!
//! Codes are `0x5a00 + n`. Unknown codes are legal on the wire and are
//! forwarded untouched; only the streaming set changes framing.

use std::fmt;

use crate::envelope::CommandDescriptor;

/// Identifies the command kind carried by an envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationCode(pub u64);

const BASE: u64 = 0x5a00;

impl OperationCode {
    pub const POOL_CREATE: Self = Self(BASE);
    pub const POOL_DESTROY: Self = Self(BASE + 0x01);
    pub const POOL_IMPORT: Self = Self(BASE + 0x02);
    pub const POOL_EXPORT: Self = Self(BASE + 0x03);
    pub const POOL_CONFIGS: Self = Self(BASE + 0x04);
    pub const POOL_STATS: Self = Self(BASE + 0x05);
    pub const POOL_SCAN: Self = Self(BASE + 0x07);
    pub const POOL_GET_HISTORY: Self = Self(BASE + 0x0a);
    pub const OBJSET_STATS: Self = Self(BASE + 0x12);
    pub const DATASET_LIST_NEXT: Self = Self(BASE + 0x14);
    pub const SNAPSHOT_LIST_NEXT: Self = Self(BASE + 0x15);
    pub const SET_PROP: Self = Self(BASE + 0x16);
    pub const CREATE: Self = Self(BASE + 0x17);
    pub const DESTROY: Self = Self(BASE + 0x18);
    pub const ROLLBACK: Self = Self(BASE + 0x19);
    pub const RENAME: Self = Self(BASE + 0x1a);
    pub const RECV: Self = Self(BASE + 0x1b);
    pub const SEND: Self = Self(BASE + 0x1c);
    pub const SNAPSHOT: Self = Self(BASE + 0x3a);
    pub const SEND_NEW: Self = Self(BASE + 0x40);
    pub const RECV_NEW: Self = Self(BASE + 0x46);

    const NAMED: [(Self, &'static str); 21] = [
        (Self::POOL_CREATE, "pool-create"),
        (Self::POOL_DESTROY, "pool-destroy"),
        (Self::POOL_IMPORT, "pool-import"),
        (Self::POOL_EXPORT, "pool-export"),
        (Self::POOL_CONFIGS, "pool-configs"),
        (Self::POOL_STATS, "pool-stats"),
        (Self::POOL_SCAN, "pool-scan"),
        (Self::POOL_GET_HISTORY, "pool-get-history"),
        (Self::OBJSET_STATS, "objset-stats"),
        (Self::DATASET_LIST_NEXT, "dataset-list-next"),
        (Self::SNAPSHOT_LIST_NEXT, "snapshot-list-next"),
        (Self::SET_PROP, "set-prop"),
        (Self::CREATE, "create"),
        (Self::DESTROY, "destroy"),
        (Self::ROLLBACK, "rollback"),
        (Self::RENAME, "rename"),
        (Self::RECV, "recv"),
        (Self::SEND, "send"),
        (Self::SNAPSHOT, "snapshot"),
        (Self::SEND_NEW, "send-new"),
        (Self::RECV_NEW, "recv-new"),
    ];

    /// Human-readable name, or `"unknown"`.
    pub fn name(self) -> &'static str {
        Self::NAMED
            .iter()
            .find(|(code, _)| *code == self)
            .map(|(_, name)| *name)
            .unwrap_or("unknown")
    }

    /// Look up a code by its [`name`](Self::name).
    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMED
            .iter()
            .find(|(_, candidate)| candidate.eq_ignore_ascii_case(name))
            .map(|(code, _)| *code)
    }

    /// True for commands that stream through a caller-supplied descriptor.
    pub fn is_streaming(self) -> bool {
        matches!(
            self,
            Self::SEND | Self::RECV | Self::SEND_NEW | Self::RECV_NEW
        )
    }
}

impl fmt::Display for OperationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#x})", self.name(), self.0)
    }
}

impl From<u64> for OperationCode {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Whether a descriptor hand-off accompanies this request.
///
/// `SEND` with a non-zero `guid` is an estimate and carries no descriptor.
pub fn requires_descriptor(op: OperationCode, desc: &CommandDescriptor) -> bool {
    match op {
        OperationCode::SEND => desc.guid == 0,
        other => other.is_streaming(),
    }
}
