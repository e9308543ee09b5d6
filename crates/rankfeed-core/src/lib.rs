//! Core domain model for the ranking feed ingestor.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

pub const CRATE_NAME: &str = "rankfeed-core";

/// Longest character name the upstream ranking ever reports.
pub const MAX_NAME_LEN: usize = 25;

/// Label used for job and world codes missing from the lookup tables.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Highest level a record may carry; the store keeps levels in a signed 32-bit column.
pub const MAX_LEVEL: u32 = i32::MAX as u32;

/// Job class resolved from the upstream numeric `jobID`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobClass {
    Beginner,
    Warrior,
    Magician,
    Bowman,
    Thief,
    Pirate,
    Noblesse,
    DawnWarrior,
    BlazeWizard,
    WindArcher,
    NightWalker,
    ThunderBreaker,
    Aran,
    Evan,
    Mercedes,
    Phantom,
    Mihile,
    Luminous,
    Kaiser,
    AngelicBuster,
    /// Code missing, out of range or not in the table; the raw value is kept for diagnostics.
    Unknown(Option<i64>),
}

impl JobClass {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Beginner,
            1 => Self::Warrior,
            2 => Self::Magician,
            3 => Self::Bowman,
            4 => Self::Thief,
            5 => Self::Pirate,
            10 => Self::Noblesse,
            11 => Self::DawnWarrior,
            12 => Self::BlazeWizard,
            13 => Self::WindArcher,
            14 => Self::NightWalker,
            15 => Self::ThunderBreaker,
            21 => Self::Aran,
            22 => Self::Evan,
            23 => Self::Mercedes,
            24 => Self::Phantom,
            202 => Self::Mihile,
            203 => Self::Luminous,
            204 => Self::Kaiser,
            205 => Self::AngelicBuster,
            other => Self::Unknown(Some(other.into())),
        }
    }

    /// Like [`Self::from_code`], for a code that may be absent or negative on the wire.
    pub fn from_raw(code: Option<i64>) -> Self {
        match code {
            Some(code) => u32::try_from(code).map_or(Self::Unknown(Some(code)), Self::from_code),
            None => Self::Unknown(None),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Beginner => "Beginner",
            Self::Warrior => "Warrior",
            Self::Magician => "Magician",
            Self::Bowman => "Bowman",
            Self::Thief => "Thief",
            Self::Pirate => "Pirate",
            Self::Noblesse => "Noblesse",
            Self::DawnWarrior => "Dawn Warrior",
            Self::BlazeWizard => "Blaze Wizard",
            Self::WindArcher => "Wind Archer",
            Self::NightWalker => "Night Walker",
            Self::ThunderBreaker => "Thunder Breaker",
            Self::Aran => "Aran",
            Self::Evan => "Evan",
            Self::Mercedes => "Mercedes",
            Self::Phantom => "Phantom",
            Self::Mihile => "Mihile",
            Self::Luminous => "Luminous",
            Self::Kaiser => "Kaiser",
            Self::AngelicBuster => "Angelic Buster",
            Self::Unknown(_) => UNKNOWN_LABEL,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }
}

impl fmt::Display for JobClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for JobClass {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Game world resolved from the upstream numeric `worldID`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum World {
    Scania,
    Bera,
    Aurora,
    Elysium,
    Kronos,
    Hyperion,
    Unknown(Option<i64>),
}

impl World {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Scania,
            1 => Self::Bera,
            17 => Self::Aurora,
            18 => Self::Elysium,
            45 => Self::Kronos,
            46 => Self::Hyperion,
            other => Self::Unknown(Some(other.into())),
        }
    }

    /// Like [`Self::from_code`], for a code that may be absent or negative on the wire.
    pub fn from_raw(code: Option<i64>) -> Self {
        match code {
            Some(code) => u32::try_from(code).map_or(Self::Unknown(Some(code)), Self::from_code),
            None => Self::Unknown(None),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scania => "Scania",
            Self::Bera => "Bera",
            Self::Aurora => "Aurora",
            Self::Elysium => "Elysium",
            Self::Kronos => "Kronos",
            Self::Hyperion => "Hyperion",
            Self::Unknown(_) => UNKNOWN_LABEL,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }
}

impl fmt::Display for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for World {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One ranked character as observed at scrape time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterRecord {
    pub name: String,
    pub level: u32,
    pub job: JobClass,
    pub world: World,
    /// Avatar hash when the upstream URL carries one, otherwise the raw URL.
    pub image_ref: String,
    pub scraped_at: DateTime<Utc>,
}

impl CharacterRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::new(&self.name, self.world.as_str())
    }
}

/// `(name, world)`: identifies a character across repeated scrapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
    pub name: String,
    pub world: String,
}

impl NaturalKey {
    pub fn new(name: impl Into<String>, world: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            world: world.into(),
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.world)
    }
}

/// Lifecycle of one bulk-scrape invocation. There is deliberately no partial state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ScrapeJobStatus {
    Running,
    Completed,
    Failed,
}

impl ScrapeJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for ScrapeJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checks the name constraints shared by parsing and the single-character trigger.
pub fn is_valid_character_name(name: &str) -> bool {
    let trimmed = name.trim();
    !trimmed.is_empty() && trimmed.chars().count() <= MAX_NAME_LEN
}
