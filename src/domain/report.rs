use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{OpsdeckError, Result};

/// Literal phrase the operator must type before an artifact is deleted
pub const DELETE_CONFIRMATION_PHRASE: &str = "delete";

/// Date format used on the wire and in artifact names
pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportType {
    Daily,
    Weekly,
    Monthly,
}

impl ReportType {
    pub const ALL: [ReportType; 3] = [ReportType::Daily, ReportType::Weekly, ReportType::Monthly];

    /// Path segment and listing key
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportType::Daily => "daily",
            ReportType::Weekly => "weekly",
            ReportType::Monthly => "monthly",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReportType::Daily => "Daily Report",
            ReportType::Weekly => "Weekly Report",
            ReportType::Monthly => "Monthly Report",
        }
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ReportType {
    type Err = OpsdeckError;

    /// Accepts "daily", "Daily", "Daily-Report" and similar
    fn from_str(s: &str) -> Result<Self> {
        let head = s.trim().split('-').next().unwrap_or_default().to_lowercase();
        match head.as_str() {
            "daily" => Ok(ReportType::Daily),
            "weekly" => Ok(ReportType::Weekly),
            "monthly" => Ok(ReportType::Monthly),
            _ => Err(OpsdeckError::Validation(format!("unknown report type: {}", s))),
        }
    }
}

/// Period a report covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportSpan {
    /// Scheduled report anchored at one date
    Single(NaiveDate),
    /// Custom report over an inclusive date range
    Range { start: NaiveDate, end: NaiveDate },
}

impl fmt::Display for ReportSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportSpan::Single(date) => write!(f, "{}", date.format(DATE_FORMAT)),
            ReportSpan::Range { start, end } => write!(
                f,
                "{}..{}",
                start.format(DATE_FORMAT),
                end.format(DATE_FORMAT)
            ),
        }
    }
}

/// What the operator asked to generate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRequest {
    pub report_type: ReportType,
    pub span: ReportSpan,
}

impl ReportRequest {
    pub fn single(report_type: ReportType, date: NaiveDate) -> Self {
        Self {
            report_type,
            span: ReportSpan::Single(date),
        }
    }

    pub fn range(report_type: ReportType, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            report_type,
            span: ReportSpan::Range { start, end },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let ReportSpan::Range { start, end } = self.span {
            if start > end {
                return Err(OpsdeckError::Validation(format!(
                    "start date {} is after end date {}",
                    start.format(DATE_FORMAT),
                    end.format(DATE_FORMAT)
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ReportRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.report_type.label(), self.span)
    }
}

/// Per-job lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobPhase {
    Requested,
    Generating,
    Ready {
        /// Artifact file name, when the backend reported one
        artifact: Option<String>,
        message: String,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportJob {
    pub id: Uuid,
    pub request: ReportRequest,
    pub phase: JobPhase,
    pub requested_at: DateTime<Utc>,
}

impl ReportJob {
    pub fn new(request: ReportRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            phase: JobPhase::Requested,
            requested_at: Utc::now(),
        }
    }
}

/// Report workflow states, rendered directly by the console
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkflowState {
    #[default]
    Idle,
    /// Operator picked a type/date; waiting for explicit confirmation
    Confirming(ReportRequest),
    /// Submission in flight. A second submission is refused.
    Requested(ReportJob),
    Succeeded(ReportJob),
    Failed(ReportJob),
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Idle => "IDLE",
            WorkflowState::Confirming(_) => "CONFIRMING",
            WorkflowState::Requested(_) => "REQUESTED",
            WorkflowState::Succeeded(_) => "SUCCEEDED",
            WorkflowState::Failed(_) => "FAILED",
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, WorkflowState::Requested(_))
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Wire shape of `GET /schedule/files`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactIndex {
    #[serde(default)]
    pub daily: Vec<String>,
    #[serde(default)]
    pub weekly: Vec<String>,
    #[serde(default)]
    pub monthly: Vec<String>,
}

impl ArtifactIndex {
    pub fn names(&self, report_type: ReportType) -> &[String] {
        match report_type {
            ReportType::Daily => &self.daily,
            ReportType::Weekly => &self.weekly,
            ReportType::Monthly => &self.monthly,
        }
    }
}

/// A generated report file held by the external store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportArtifact {
    pub report_type: ReportType,
    pub file_name: String,
    pub created_at: Option<NaiveDate>,
}

impl ReportArtifact {
    pub fn new(report_type: ReportType, file_name: &str) -> Self {
        Self {
            report_type,
            file_name: file_name.to_string(),
            created_at: date_in_name(file_name),
        }
    }
}

/// First `YYYY-MM-DD` embedded in a file name
pub fn date_in_name(name: &str) -> Option<NaiveDate> {
    const LEN: usize = 10;
    if name.len() < LEN {
        return None;
    }
    (0..=name.len() - LEN)
        .filter(|&i| name.is_char_boundary(i) && name.is_char_boundary(i + LEN))
        .find_map(|i| NaiveDate::parse_from_str(&name[i..i + LEN], DATE_FORMAT).ok())
}

/// Reject names that could escape the artifact directory
pub fn validate_file_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(OpsdeckError::Validation("file name is empty".to_string()));
    }
    if trimmed.contains('/') || trimmed.contains('\\') || trimmed == ".." || trimmed == "." {
        return Err(OpsdeckError::Validation(format!(
            "invalid artifact file name: {}",
            name
        )));
    }
    Ok(())
}

/// Listing view criteria
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactFilter {
    pub report_type: Option<ReportType>,
    /// Case-insensitive substring of the file name
    pub query: String,
}

impl ArtifactFilter {
    pub fn of_type(report_type: ReportType) -> Self {
        Self {
            report_type: Some(report_type),
            query: String::new(),
        }
    }

    pub fn with_query(mut self, query: &str) -> Self {
        self.query = query.to_string();
        self
    }

    pub fn matches(&self, artifact: &ReportArtifact) -> bool {
        if let Some(report_type) = self.report_type {
            if artifact.report_type != report_type {
                return false;
            }
        }
        let query = self.query.trim().to_lowercase();
        query.is_empty() || artifact.file_name.to_lowercase().contains(&query)
    }
}

/// Snapshot of the artifact store, replaced as a whole on refresh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactListing {
    pub artifacts: Vec<ReportArtifact>,
    pub fetched_at: DateTime<Utc>,
}

impl ArtifactListing {
    pub fn from_index(index: &ArtifactIndex, fetched_at: DateTime<Utc>) -> Self {
        let artifacts = ReportType::ALL
            .iter()
            .flat_map(|t| index.names(*t).iter().map(move |n| ReportArtifact::new(*t, n)))
            .collect();
        Self {
            artifacts,
            fetched_at,
        }
    }

    pub fn filtered(&self, filter: &ArtifactFilter) -> Vec<&ReportArtifact> {
        self.artifacts.iter().filter(|a| filter.matches(a)).collect()
    }

    pub fn contains(&self, report_type: ReportType, file_name: &str) -> bool {
        self.artifacts
            .iter()
            .any(|a| a.report_type == report_type && a.file_name == file_name)
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> ArtifactIndex {
        ArtifactIndex {
            daily: vec!["schedule-2024-01-01-Monitoring_Report.pdf".into()],
            weekly: vec![
                "weekly-report-2024-01-01.pdf".into(),
                "schedule-2024-01-08-Weekly-Monitoring_Report.pdf".into(),
            ],
            monthly: vec![],
        }
    }

    #[test]
    fn test_report_type_parsing() {
        assert_eq!("Daily-Report".parse::<ReportType>().unwrap(), ReportType::Daily);
        assert_eq!("weekly".parse::<ReportType>().unwrap(), ReportType::Weekly);
        assert_eq!("MONTHLY".parse::<ReportType>().unwrap(), ReportType::Monthly);
        assert!("yearly".parse::<ReportType>().is_err());
    }

    #[test]
    fn test_range_must_be_ordered() {
        let d = |s: &str| NaiveDate::parse_from_str(s, DATE_FORMAT).unwrap();
        assert!(ReportRequest::range(ReportType::Daily, d("2024-01-01"), d("2024-01-07"))
            .validate()
            .is_ok());
        assert!(ReportRequest::range(ReportType::Daily, d("2024-01-08"), d("2024-01-07"))
            .validate()
            .is_err());
    }

    #[test]
    fn test_listing_filters_by_type_and_name() {
        let listing = ArtifactListing::from_index(&index(), Utc::now());
        assert_eq!(listing.len(), 3);

        let weekly = listing.filtered(&ArtifactFilter::of_type(ReportType::Weekly));
        assert_eq!(weekly.len(), 2);

        let hits = listing.filtered(&ArtifactFilter::of_type(ReportType::Weekly).with_query("MONITORING"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_name, "schedule-2024-01-08-Weekly-Monitoring_Report.pdf");

        let everything = listing.filtered(&ArtifactFilter::default().with_query("2024-01-01"));
        assert_eq!(everything.len(), 2);
    }

    #[test]
    fn test_date_in_name() {
        assert_eq!(
            date_in_name("weekly-report-2024-01-01.pdf"),
            NaiveDate::from_ymd_opt(2024, 1, 1)
        );
        assert_eq!(date_in_name("report.pdf"), None);
        assert_eq!(date_in_name("ü-2024-02-29-ü"), NaiveDate::from_ymd_opt(2024, 2, 29));
    }

    #[test]
    fn test_file_name_rejects_traversal() {
        assert!(validate_file_name("weekly-report-2024-01-01.pdf").is_ok());
        assert!(validate_file_name("../secrets").is_err());
        assert!(validate_file_name("a/b.pdf").is_err());
        assert!(validate_file_name("  ").is_err());
    }
}
