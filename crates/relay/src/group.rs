use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    A,
    B,
}

impl Side {
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

/// Which way a frame travels inside a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    AToB,
    BToA,
}

impl Direction {
    pub fn from_source(side: Side) -> Self {
        match side {
            Side::A => Self::AToB,
            Side::B => Self::BToA,
        }
    }

    pub fn destination(self) -> Side {
        match self {
            Self::AToB => Side::B,
            Self::BToA => Side::A,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AToB => "a_to_b",
            Self::BToA => "b_to_a",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GroupMode {
    Inactive,
    Active,
    Degraded,
}

/// A pair of bridged dongles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub dongle_a: String,
    pub dongle_b: String,
    /// Operator toggle; a disabled group is `INACTIVE` regardless of agents.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Group {
    pub fn new(id: impl Into<String>, dongle_a: impl Into<String>, dongle_b: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            dongle_a: dongle_a.into(),
            dongle_b: dongle_b.into(),
            enabled: true,
        }
    }

    pub fn side_of(&self, dongle_id: &str) -> Option<Side> {
        if self.dongle_a == dongle_id {
            Some(Side::A)
        } else if self.dongle_b == dongle_id {
            Some(Side::B)
        } else {
            None
        }
    }

    pub fn dongle(&self, side: Side) -> &str {
        match side {
            Side::A => &self.dongle_a,
            Side::B => &self.dongle_b,
        }
    }
}

/// Derived health of a group, as published to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupState {
    pub group_id: String,
    pub mode: GroupMode,
    pub offline_side: Option<Side>,
}

impl GroupState {
    /// Derives the mode from the toggle and which sides' agents are online.
    ///
    /// With both sides offline the group is `DEGRADED` and no single side is
    /// named.
    pub fn derive(group: &Group, a_online: bool, b_online: bool) -> Self {
        let (mode, offline_side) = if !group.enabled {
            (GroupMode::Inactive, None)
        } else {
            match (a_online, b_online) {
                (true, true) => (GroupMode::Active, None),
                (false, true) => (GroupMode::Degraded, Some(Side::A)),
                (true, false) => (GroupMode::Degraded, Some(Side::B)),
                (false, false) => (GroupMode::Degraded, None),
            }
        };
        Self {
            group_id: group.id.clone(),
            mode,
            offline_side,
        }
    }
}
