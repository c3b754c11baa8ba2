use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction branch identifier: format id, global transaction id and
/// branch qualifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    pub format_id: u16,
    pub global_id: Bytes,
    pub branch_id: Bytes,
}

impl Xid {
    pub fn new(format_id: u16, global_id: impl Into<Bytes>, branch_id: impl Into<Bytes>) -> Self {
        Self {
            format_id,
            global_id: global_id.into(),
            branch_id: branch_id.into(),
        }
    }

    /// Broker generated xid for a local (`tx.select`) transaction
    pub fn local(channel_key: u64, sequence: u64) -> Self {
        Self::new(
            0,
            Bytes::from(format!("local-{}", channel_key)),
            Bytes::from(sequence.to_string()),
        )
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Xid{{format={}, gid={}, bqual={}}}",
            self.format_id,
            String::from_utf8_lossy(&self.global_id),
            String::from_utf8_lossy(&self.branch_id)
        )
    }
}
