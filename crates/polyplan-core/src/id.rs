//! Strongly-typed identifiers used across the workspace.
//!
//! Downstream crates (optimizer, platform, exec) should *not* use raw integers for IDs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

macro_rules! new_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(v: u64) -> Self {
                Self(v)
            }
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

new_id!(OperatorId);
new_id!(ChannelId);
new_id!(LoopId);
new_id!(SegmentId);
new_id!(InstanceId);
new_id!(LineageId);
new_id!(ContextId);

/// Name of a registered execution platform.
///
/// Platforms are addressed by name everywhere (pins, permitted sets, assignments),
/// so this is a cheap-to-clone shared string rather than a counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlatformId(Arc<str>);

impl PlatformId {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlatformId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PlatformId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Reference to one slot of one operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotRef {
    pub operator: OperatorId,
    pub index: usize,
}

impl SlotRef {
    pub const fn new(operator: OperatorId, index: usize) -> Self {
        Self { operator, index }
    }
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.operator, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_display_with_type_name() {
        assert_eq!(OperatorId::new(7).to_string(), "OperatorId(7)");
        assert_eq!(SlotRef::new(OperatorId::new(2), 1).to_string(), "OperatorId(2)#1");
    }

    #[test]
    fn platform_ids_compare_by_name() {
        assert_eq!(PlatformId::new("java"), PlatformId::from("java".to_string()));
        assert!(PlatformId::new("a") < PlatformId::new("b"));
    }

    #[test]
    fn platform_ids_serialize_as_plain_strings() {
        let id = PlatformId::new("spark");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"spark\"");
        let back: PlatformId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
