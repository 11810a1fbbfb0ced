use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

const OPENDREAM_PREFIX: &str = "opendream-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineType {
    Byond,
    OpenDream,
}

impl EngineType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Byond => "byond",
            Self::OpenDream => "opendream",
        }
    }

    fn key_prefix(self) -> &'static str {
        match self {
            Self::Byond => "",
            Self::OpenDream => OPENDREAM_PREFIX,
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineVersion {
    pub engine: EngineType,
    pub major: u32,
    pub minor: u32,
    pub patch: Option<u32>,
}

impl EngineVersion {
    #[must_use]
    pub fn byond(major: u32, minor: u32) -> Self {
        Self {
            engine: EngineType::Byond,
            major,
            minor,
            patch: None,
        }
    }

    #[must_use]
    pub fn with_patch(mut self, patch: u32) -> Self {
        self.patch = Some(patch);
        self
    }

    /// Whether this version is at least `major.minor`, ignoring the patch.
    #[must_use]
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }

    /// Canonical identity string of this version.
    ///
    /// A patch of zero is dropped so builds sharing an effective minor
    /// version share a key; `allow_patch == false` drops it unconditionally.
    #[must_use]
    pub fn key(&self, allow_patch: bool) -> String {
        let prefix = self.engine.key_prefix();
        match self.patch {
            Some(patch) if allow_patch && patch != 0 => {
                format!("{prefix}{}.{}.{patch}", self.major, self.minor)
            }
            _ => format!("{prefix}{}.{}", self.major, self.minor),
        }
    }

    /// Key for a user supplied build: the nominal `major.minor` plus the
    /// smallest discriminator `N >= 1` for which `is_taken` returns false.
    pub fn custom_key(&self, mut is_taken: impl FnMut(&str) -> bool) -> (Self, String) {
        let mut discriminator = 1;
        loop {
            let candidate = Self {
                patch: Some(discriminator),
                ..self.clone()
            };
            let key = candidate.key(true);
            if !is_taken(&key) {
                return (candidate, key);
            }
            discriminator += 1;
        }
    }
}

impl Ord for EngineVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.engine as u8)
            .cmp(&(other.engine as u8))
            .then(self.major.cmp(&other.major))
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.unwrap_or(0).cmp(&other.patch.unwrap_or(0)))
    }
}

impl PartialOrd for EngineVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key(true))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionComponent {
    Major,
    Minor,
    Patch,
}

impl fmt::Display for VersionComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Major => write!(f, "major"),
            Self::Minor => write!(f, "minor"),
            Self::Patch => write!(f, "patch"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionParseError {
    #[error("Expected MAJOR.MINOR[.PATCH] format, got: {input}")]
    InvalidFormat { input: String },
    #[error("Invalid {component} version: {value}")]
    InvalidComponent {
        component: VersionComponent,
        value: String,
    },
}

fn parse_component(component: VersionComponent, value: &str) -> Result<u32, VersionParseError> {
    value
        .parse()
        .map_err(|_| VersionParseError::InvalidComponent {
            component,
            value: value.to_string(),
        })
}

impl FromStr for EngineVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (engine, rest) = match trimmed.get(..OPENDREAM_PREFIX.len()) {
            Some(head) if head.eq_ignore_ascii_case(OPENDREAM_PREFIX) => (
                EngineType::OpenDream,
                &trimmed[OPENDREAM_PREFIX.len()..],
            ),
            _ => (EngineType::Byond, trimmed),
        };

        let invalid = || VersionParseError::InvalidFormat {
            input: trimmed.to_string(),
        };

        let mut parts = rest.split('.');
        let major_str = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        let minor_str = parts.next().ok_or_else(invalid)?;
        let patch_str = parts.next();
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self {
            engine,
            major: parse_component(VersionComponent::Major, major_str)?,
            minor: parse_component(VersionComponent::Minor, minor_str)?,
            patch: patch_str
                .map(|p| parse_component(VersionComponent::Patch, p))
                .transpose()?,
        })
    }
}
