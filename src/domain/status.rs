use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use url::Url;

/// Static configuration for one monitored backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub category: String,
    /// Endpoint probed in fan-out mode. `None` means the service is unmonitored.
    #[serde(default)]
    pub health_url: Option<Url>,
    /// Operator-facing web UI of the backend
    #[serde(default)]
    pub web_url: Option<Url>,
    /// Per-descriptor probe timeout, overriding the poller default
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl ServiceDescriptor {
    pub fn new(name: &str, category: &str) -> Self {
        Self {
            name: name.to_string(),
            category: category.to_string(),
            health_url: None,
            web_url: None,
            timeout: None,
        }
    }

    pub fn with_health_url(mut self, url: Url) -> Self {
        self.health_url = Some(url);
        self
    }

    pub fn with_web_url(mut self, url: Url) -> Self {
        self.web_url = Some(url);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Effective probe timeout for this descriptor
    pub fn probe_timeout(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }
}

/// Parse a configured URL, assuming `https://` when the scheme is missing
pub fn normalize_url(raw: &str) -> Result<Url, url::ParseError> {
    let raw = raw.trim();
    match Url::parse(raw) {
        Ok(url) if url.has_host() => Ok(url),
        Ok(_) | Err(url::ParseError::RelativeUrlWithoutBase) => {
            Url::parse(&format!("https://{}", raw))
        }
        Err(e) => Err(e),
    }
}

/// Binary-plus-unknown health of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Up,
    Down,
    Unknown,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Up => "UP",
            HealthState::Down => "DOWN",
            HealthState::Unknown => "UNKNOWN",
        }
    }

    pub fn from_flag(up: bool) -> Self {
        if up {
            HealthState::Up
        } else {
            HealthState::Down
        }
    }

    /// Interpret a display status such as "✅ Up" or "❌ Down"
    pub fn from_display(status: &str) -> Self {
        let lowered = status.to_lowercase();
        if lowered.contains("up") {
            HealthState::Up
        } else if lowered.contains("unknown") {
            HealthState::Unknown
        } else {
            HealthState::Down
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Health of one descriptor as of one poll cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub name: String,
    pub state: HealthState,
    pub last_checked: DateTime<Utc>,
}

/// One category row group of the board
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryGroup {
    pub category: String,
    pub services: Vec<StatusSnapshot>,
}

/// Category-grouped view of all descriptors, replaced as a whole each cycle.
///
/// Categories appear in the order they are first declared by the descriptor
/// configuration, and services keep their configured order within a category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBoard {
    /// Poll cycle that produced this board; 0 before the first completed cycle
    pub cycle: u64,
    pub groups: Vec<CategoryGroup>,
}

impl StatusBoard {
    /// Board shown before any cycle completes: every service `Unknown`
    pub fn pending(descriptors: &[ServiceDescriptor]) -> Self {
        let now = Utc::now();
        Self::build(0, descriptors, |_| HealthState::Unknown, now)
    }

    /// Build a board by resolving each descriptor's state with `resolve`
    pub fn build<F>(
        cycle: u64,
        descriptors: &[ServiceDescriptor],
        mut resolve: F,
        checked_at: DateTime<Utc>,
    ) -> Self
    where
        F: FnMut(&ServiceDescriptor) -> HealthState,
    {
        let mut groups: Vec<CategoryGroup> = Vec::new();
        for descriptor in descriptors {
            let snapshot = StatusSnapshot {
                name: descriptor.name.clone(),
                state: resolve(descriptor),
                last_checked: checked_at,
            };
            match groups.iter_mut().find(|g| g.category == descriptor.category) {
                Some(group) => group.services.push(snapshot),
                None => groups.push(CategoryGroup {
                    category: descriptor.category.clone(),
                    services: vec![snapshot],
                }),
            }
        }
        Self { cycle, groups }
    }

    /// Board from an aggregate `{serviceName: bool}` map. Missing keys are `Down`.
    /// The backend checks health itself, so descriptors need no health URL here.
    pub fn from_aggregate(
        cycle: u64,
        descriptors: &[ServiceDescriptor],
        statuses: &HashMap<String, bool>,
        checked_at: DateTime<Utc>,
    ) -> Self {
        Self::build(
            cycle,
            descriptors,
            |d| HealthState::from_flag(statuses.get(&d.name).copied().unwrap_or(false)),
            checked_at,
        )
    }

    /// Board from a pre-grouped `{category: [{name, status}]}` response.
    /// Services absent from their category are `Down`.
    pub fn from_grouped(
        cycle: u64,
        descriptors: &[ServiceDescriptor],
        grouped: &HashMap<String, Vec<GroupedStatus>>,
        checked_at: DateTime<Utc>,
    ) -> Self {
        Self::build(
            cycle,
            descriptors,
            |d| {
                grouped
                    .get(&d.category)
                    .and_then(|entries| entries.iter().find(|e| e.name == d.name))
                    .map(|e| HealthState::from_display(&e.status))
                    .unwrap_or(HealthState::Down)
            },
            checked_at,
        )
    }

    pub fn category(&self, category: &str) -> Option<&CategoryGroup> {
        self.groups.iter().find(|g| g.category == category)
    }

    pub fn get(&self, name: &str) -> Option<&StatusSnapshot> {
        self.groups
            .iter()
            .flat_map(|g| g.services.iter())
            .find(|s| s.name == name)
    }

    pub fn state_of(&self, name: &str) -> Option<HealthState> {
        self.get(name).map(|s| s.state)
    }

    pub fn categories(&self) -> Vec<&str> {
        self.groups.iter().map(|g| g.category.as_str()).collect()
    }

    /// (up, down, unknown)
    pub fn counts(&self) -> (usize, usize, usize) {
        self.groups
            .iter()
            .flat_map(|g| g.services.iter())
            .fold((0, 0, 0), |(up, down, unknown), s| match s.state {
                HealthState::Up => (up + 1, down, unknown),
                HealthState::Down => (up, down + 1, unknown),
                HealthState::Unknown => (up, down, unknown + 1),
            })
    }
}

/// Entry of the grouped `/ping` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupedStatus {
    pub name: String,
    pub status: String,
}
