//! Static configuration: the user roster the scale is queried for, session
//! timing, and the TOML file both are loaded from.
//!
//! ```toml
//! address = "C8:B2:1E:00:11:22"
//!
//! [timing]
//! query_interval_ms = 1500
//!
//! [[users]]
//! id = 1
//! name = "Pedro"
//! gender = "male"
//! age = 50
//! height = 181
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bluetooth::DeviceAddress;
use crate::errors::{Result, ScaleError};

/// Highest user slot the scale knows about.
pub const MAX_USERS: usize = 8;

const DEFAULT_SETTLE_MS: u64 = 1_000;
const DEFAULT_QUERY_INTERVAL_MS: u64 = 1_500;
const DEFAULT_LINGER_MS: u64 = 2_000;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    /// Byte used in the per-user query command.
    pub fn wire_byte(self) -> u8 {
        match self {
            Gender::Male => 0x01,
            Gender::Female => 0x00,
        }
    }
}

impl FromStr for Gender {
    type Err = ScaleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "male" | "m" => Ok(Gender::Male),
            "female" | "f" => Ok(Gender::Female),
            other => Err(ScaleError::Config(format!("unknown gender {other:?}"))),
        }
    }
}

/// One person the scale stores readings for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: u8,
    pub name: String,
    pub gender: Gender,
    /// Age in years.
    pub age: u8,
    /// Height in centimetres.
    #[serde(rename = "height")]
    pub height_cm: u8,
}

impl UserProfile {
    pub fn new(id: u8, name: impl Into<String>, gender: Gender, age: u8, height_cm: u8) -> Self {
        Self {
            id,
            name: name.into(),
            gender,
            age,
            height_cm,
        }
    }
}

/// Validated, ordered set of user profiles.
///
/// Order is preserved: the session queries users in roster order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    profiles: Vec<UserProfile>,
}

impl Roster {
    /// Build a roster of 1 to 8 profiles with unique ids in `1..=8`, each with
    /// a non-zero age and height.
    pub fn new(profiles: Vec<UserProfile>) -> Result<Self> {
        if profiles.is_empty() {
            return Err(ScaleError::Config("roster must contain at least one user".into()));
        }
        if profiles.len() > MAX_USERS {
            return Err(ScaleError::Config(format!(
                "roster has {} users, the scale supports at most {MAX_USERS}",
                profiles.len()
            )));
        }

        let mut seen = HashSet::new();
        for profile in &profiles {
            if profile.id == 0 || usize::from(profile.id) > MAX_USERS {
                return Err(ScaleError::Config(format!(
                    "user id {} out of range (1-{MAX_USERS})",
                    profile.id
                )));
            }
            if profile.age == 0 || profile.height_cm == 0 {
                return Err(ScaleError::Config(format!(
                    "user {} needs a non-zero age and height",
                    profile.id
                )));
            }
            if !seen.insert(profile.id) {
                return Err(ScaleError::Config(format!("duplicate user id {}", profile.id)));
            }
        }

        Ok(Self { profiles })
    }

    pub fn iter(&self) -> impl Iterator<Item = &UserProfile> {
        self.profiles.iter()
    }

    pub fn get(&self, id: u8) -> Option<&UserProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    pub fn contains(&self, id: u8) -> bool {
        self.get(id).is_some()
    }

    /// User that readings are attributed to when a frame names nobody we know.
    pub fn fallback_id(&self) -> u8 {
        // new() rejects empty rosters
        self.profiles.iter().map(|p| p.id).min().unwrap_or(1)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// Fixed delays of one protocol session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    /// Wait after the init command.
    pub settle: Duration,
    /// Wait after each per-user query.
    pub query_interval: Duration,
    /// Extra wait for late notifications after the last query.
    pub linger: Duration,
    /// Wall-clock limit for connect plus session. `None` means unbounded.
    pub cycle_budget: Option<Duration>,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(DEFAULT_SETTLE_MS),
            query_interval: Duration::from_millis(DEFAULT_QUERY_INTERVAL_MS),
            linger: Duration::from_millis(DEFAULT_LINGER_MS),
            cycle_budget: None,
        }
    }
}

/// `[timing]` table of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub settle_ms: u64,
    pub query_interval_ms: u64,
    pub linger_ms: u64,
    pub cycle_budget_secs: Option<u64>,
    pub poll_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_ms: DEFAULT_SETTLE_MS,
            query_interval_ms: DEFAULT_QUERY_INTERVAL_MS,
            linger_ms: DEFAULT_LINGER_MS,
            cycle_budget_secs: None,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

impl TimingConfig {
    pub fn session(&self) -> SessionTiming {
        SessionTiming {
            settle: Duration::from_millis(self.settle_ms),
            query_interval: Duration::from_millis(self.query_interval_ms),
            linger: Duration::from_millis(self.linger_ms),
            cycle_budget: self.cycle_budget_secs.map(Duration::from_secs),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Contents of a scale config file.
#[derive(Debug, Clone, Deserialize)]
pub struct ScaleConfig {
    pub address: String,
    #[serde(default)]
    pub timing: TimingConfig,
    pub users: Vec<UserProfile>,
}

impl ScaleConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn roster(&self) -> Result<Roster> {
        Roster::new(self.users.clone())
    }

    pub fn device_address(&self) -> Result<DeviceAddress> {
        let address = self.address.parse::<DeviceAddress>()?;
        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: u8) -> UserProfile {
        UserProfile::new(id, format!("user{id}"), Gender::Male, 30, 180)
    }

    #[test]
    fn roster_keeps_order_and_picks_lowest_fallback() {
        let roster = Roster::new(vec![profile(4), profile(2), profile(7)]).unwrap();
        let ids: Vec<u8> = roster.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![4, 2, 7]);
        assert_eq!(roster.fallback_id(), 2);
        assert!(roster.contains(7));
        assert!(!roster.contains(1));
    }

    #[test]
    fn roster_rejects_bad_input() {
        assert!(Roster::new(vec![]).is_err());
        assert!(Roster::new(vec![profile(0)]).is_err());
        assert!(Roster::new(vec![profile(9)]).is_err());
        assert!(Roster::new(vec![profile(1), profile(1)]).is_err());
        let too_many: Vec<_> = (1..=8).chain([8]).map(profile).collect();
        assert!(Roster::new(too_many).is_err());
        let full: Vec<_> = (1..=8).map(profile).collect();
        assert_eq!(Roster::new(full).unwrap().len(), 8);
    }

    #[test]
    fn roster_rejects_zero_age_or_height() {
        let no_height = UserProfile::new(1, "Pedro", Gender::Male, 50, 0);
        let no_age = UserProfile::new(2, "Sofia", Gender::Female, 0, 167);
        assert!(matches!(Roster::new(vec![no_height]), Err(ScaleError::Config(_))));
        assert!(matches!(Roster::new(vec![no_age]), Err(ScaleError::Config(_))));
        assert!(Roster::new(vec![UserProfile::new(3, "Diogo", Gender::Male, 1, 1)]).is_ok());
    }

    #[test]
    fn gender_wire_bytes() {
        assert_eq!(Gender::Male.wire_byte(), 0x01);
        assert_eq!(Gender::Female.wire_byte(), 0x00);
    }

    #[test]
    fn gender_from_str() {
        assert_eq!("Male".parse::<Gender>().unwrap(), Gender::Male);
        assert_eq!(" f ".parse::<Gender>().unwrap(), Gender::Female);
        assert!("x".parse::<Gender>().is_err());
    }

    #[test]
    fn parses_config_file() {
        let config = ScaleConfig::from_toml_str(
            r#"
            address = "c8:b2:1e:00:11:22"

            [timing]
            linger_ms = 500
            cycle_budget_secs = 40

            [[users]]
            id = 1
            name = "Pedro"
            gender = "male"
            age = 50
            height = 181

            [[users]]
            id = 2
            name = "Sofia"
            gender = "female"
            age = 53
            height = 167
            "#,
        )
        .unwrap();

        let roster = config.roster().unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster.get(2).unwrap().gender, Gender::Female);
        assert_eq!(roster.get(2).unwrap().height_cm, 167);

        let timing = config.timing.session();
        assert_eq!(timing.linger, Duration::from_millis(500));
        assert_eq!(timing.settle, Duration::from_millis(DEFAULT_SETTLE_MS));
        assert_eq!(timing.cycle_budget, Some(Duration::from_secs(40)));
        assert_eq!(config.timing.poll_interval(), Duration::from_secs(30));

        assert_eq!(
            config.device_address().unwrap().to_string(),
            "C8:B2:1E:00:11:22"
        );
    }

    #[test]
    fn timing_table_is_optional() {
        let config = ScaleConfig::from_toml_str(
            r#"
            address = "C8:B2:1E:00:11:22"
            users = [{ id = 3, name = "Diogo", gender = "male", age = 21, height = 184 }]
            "#,
        )
        .unwrap();
        assert_eq!(config.timing.session(), SessionTiming::default());
    }

    #[test]
    fn sample_config_is_valid() {
        let config = ScaleConfig::from_toml_str(include_str!("../demos/scale.toml")).unwrap();
        assert_eq!(config.roster().unwrap().len(), 2);
        assert_eq!(config.timing, TimingConfig::default());
        assert!(config.device_address().is_ok());
    }

    #[test]
    fn unknown_gender_is_a_parse_error() {
        let err = ScaleConfig::from_toml_str(
            r#"
            address = "C8:B2:1E:00:11:22"
            users = [{ id = 1, name = "X", gender = "other", age = 21, height = 184 }]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ScaleError::ConfigParse(_)));
    }
}
