//! Downstream posting parser: turns published `JobPosting` messages into
//! structured job records, plus the message-bus consumer that drives it.

use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use hirewire_core::{JobPosting, JOB_POSTINGS_SUBJECT};
use regex::Regex;
use scraper::Html;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hirewire-parse";

pub const PROCESSING_QUEUE_GROUP: &str = "processing-service";
pub const SOURCE_NAME: &str = "hackernews";

const COMMON_TECH: &[&str] = &[
    "python",
    "javascript",
    "typescript",
    "java",
    "golang",
    "rust",
    "ruby",
    "php",
    "react",
    "angular",
    "vue",
    "node",
    "django",
    "flask",
    "spring",
    "aws",
    "azure",
    "gcp",
    "kubernetes",
    "docker",
    "terraform",
    "sql",
    "mongodb",
    "postgresql",
    "mysql",
    "redis",
];

static COMPANY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:company|at):\s*([^,|\n]+)").expect("valid company regex"));
static LOCATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:location|remote):\s*([^,|\n]+)").expect("valid location regex")
});
static TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:position|role|title):\s*([^,|\n]+)").expect("valid title regex")
});
static TECH_STACK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:tech stack|technologies|skills):\s*([^|\n]+)").expect("valid tech regex")
});
static EXPERIENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:experience|yoe|years):\s*([^,|\n]+)").expect("valid experience regex")
});
static SALARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(\d+(?:,\d{3})*(?:\.\d{2})?)([kK])?\s*-\s*\$(\d+(?:,\d{3})*(?:\.\d{2})?)([kK])?")
        .expect("valid salary regex")
});
static REMOTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:remote|wfh|work[- ]from[- ]home)\b").expect("valid remote regex")
});
static COMMON_TECH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)\b(?:{})\b", COMMON_TECH.join("|"))).expect("valid tech list regex")
});
static SENIOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:senior|sr|lead|staff|principal)\b|\b\d+\+").expect("valid senior regex")
});
static JUNIOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:junior|jr|entry)\b").expect("valid junior regex"));
static MID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:mid|intermediate)\b").expect("valid mid regex"));
static BLANK_LINES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("valid blank line regex"));
static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperienceLevel {
    Senior,
    #[serde(rename = "Mid-Level")]
    MidLevel,
    Junior,
    #[serde(rename = "Not Specified")]
    NotSpecified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemotePolicy {
    Remote,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedJob {
    pub id: Uuid,
    pub posting_id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    pub technologies: Vec<String>,
    pub experience_level: ExperienceLevel,
    pub compensation_min: Option<f64>,
    pub compensation_max: Option<f64>,
    pub compensation_currency: String,
    pub compensation_period: String,
    pub remote_policy: RemotePolicy,
    pub source: String,
    pub source_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub raw_data: String,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("decoding job posting: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Deterministic record id: the same posting always maps to the same UUID.
pub fn parsed_job_id(posting_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, posting_id.as_bytes())
}

/// Strips comment markup down to text, keeping paragraph breaks as newlines.
pub fn html_to_text(html: &str) -> String {
    let with_breaks = html.replace("<p>", "\n<p>");
    let fragment = Html::parse_fragment(&with_breaks);
    fragment.root_element().text().collect::<String>()
}

pub fn normalize_text(text: &str) -> String {
    let text = BLANK_LINES_RE.replace_all(text, "\n");
    let text = WHITESPACE_RE.replace_all(&text, " ");
    text.replace(['\u{2013}', '\u{2014}', '\u{2015}'], "-")
        .trim()
        .to_string()
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn labelled(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| text_or_none(m.as_str()))
}

pub fn classify_experience(text: &str) -> Option<ExperienceLevel> {
    if SENIOR_RE.is_match(text) {
        Some(ExperienceLevel::Senior)
    } else if JUNIOR_RE.is_match(text) {
        Some(ExperienceLevel::Junior)
    } else if MID_RE.is_match(text) {
        Some(ExperienceLevel::MidLevel)
    } else {
        None
    }
}

/// `"Senior Rust Engineer"` → (`Senior`, `"Rust Engineer"`). A leading word
/// that is not a level keeps the whole part as the title.
fn split_level_and_title(part: &str) -> (Option<ExperienceLevel>, String) {
    let part = part.trim();
    let Some((first, rest)) = part.split_once(' ') else {
        return (None, part.to_string());
    };
    match classify_experience(first) {
        Some(level) if !rest.trim().is_empty() => (Some(level), rest.trim().to_string()),
        _ => (None, part.to_string()),
    }
}

pub fn extract_technologies(text: &str) -> Vec<String> {
    let mut technologies: Vec<String> = labelled(&TECH_STACK_RE, text)
        .map(|list| list.split(',').map(str::to_string).collect())
        .unwrap_or_default();

    let mentioned: HashSet<String> = COMMON_TECH_RE
        .find_iter(text)
        .map(|m| m.as_str().to_ascii_lowercase())
        .collect();
    technologies.extend(
        COMMON_TECH
            .iter()
            .filter(|tech| mentioned.contains(**tech))
            .map(|tech| tech.to_string()),
    );

    dedup_lowercase(technologies)
}

fn dedup_lowercase(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter_map(|item| text_or_none(&item.to_lowercase()))
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

fn parse_amount(digits: &str, thousands: bool) -> Option<f64> {
    let value = digits.replace(',', "").parse::<f64>().ok()?;
    Some(if thousands { value * 1000.0 } else { value })
}

/// `$120k - $150k` → (120000, 150000).
pub fn extract_compensation(text: &str) -> (Option<f64>, Option<f64>) {
    let Some(caps) = SALARY_RE.captures(text) else {
        return (None, None);
    };
    let min = caps
        .get(1)
        .and_then(|m| parse_amount(m.as_str(), caps.get(2).is_some()));
    let max = caps
        .get(3)
        .and_then(|m| parse_amount(m.as_str(), caps.get(4).is_some()));
    (min, max)
}

pub fn parse_job_posting(raw: &str) -> Result<ParsedJob, ParseError> {
    parse_job_posting_at(raw, Utc::now())
}

pub fn parse_job_posting_at(raw: &str, now: DateTime<Utc>) -> Result<ParsedJob, ParseError> {
    let posting: JobPosting = serde_json::from_str(raw)?;

    let plain = html_to_text(&posting.raw_text);
    let clean = normalize_text(&plain);
    let header = plain
        .lines()
        .map(normalize_text)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    let parts: Vec<&str> = header.split(" | ").collect();

    let mut company = if parts.len() > 1 {
        parts[0].trim().to_string()
    } else {
        String::new()
    };
    let mut location = parts.get(1).map(|p| p.trim().to_string()).unwrap_or_default();
    let (mut experience, mut title) = parts
        .get(2)
        .map(|p| split_level_and_title(p))
        .unwrap_or((None, String::new()));
    let mut technologies = parts
        .get(4)
        .map(|p| dedup_lowercase(p.split(',').map(str::to_string).collect()))
        .unwrap_or_default();

    if title.is_empty() {
        title = labelled(&TITLE_RE, &plain)
            .or_else(|| text_or_none(&posting.title))
            .unwrap_or_default();
    }
    if company.is_empty() {
        company = labelled(&COMPANY_RE, &plain).unwrap_or_default();
    }
    if location.is_empty() {
        location = labelled(&LOCATION_RE, &plain).unwrap_or_default();
    }
    if technologies.is_empty() {
        technologies = extract_technologies(&plain);
    }
    if experience.is_none() {
        experience = labelled(&EXPERIENCE_RE, &plain)
            .and_then(|value| classify_experience(&value))
            .or_else(|| classify_experience(&plain));
    }

    let (compensation_min, compensation_max) = extract_compensation(&clean);
    let remote_policy =
        if location.to_lowercase().contains("remote") || REMOTE_RE.is_match(&plain) {
            RemotePolicy::Remote
        } else {
            RemotePolicy::Unknown
        };

    Ok(ParsedJob {
        id: parsed_job_id(&posting.id),
        source_url: format!("https://news.ycombinator.com/item?id={}", posting.id),
        posting_id: posting.id,
        title,
        company,
        location,
        description: clean,
        technologies,
        experience_level: experience.unwrap_or(ExperienceLevel::NotSpecified),
        compensation_min,
        compensation_max,
        compensation_currency: "USD".to_string(),
        compensation_period: "yearly".to_string(),
        remote_policy,
        source: SOURCE_NAME.to_string(),
        created_at: posting.posted_at,
        updated_at: now,
        raw_data: raw.to_string(),
    })
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub received: u64,
    pub parsed: u64,
    pub failed: u64,
}

/// Parses one message payload. Failures are logged, never propagated, so a
/// bad message cannot stop the consumer.
pub fn handle_payload(payload: &[u8], stats: &mut ConsumerStats) -> Option<ParsedJob> {
    stats.received += 1;
    let raw = String::from_utf8_lossy(payload);
    match parse_job_posting(&raw) {
        Ok(job) => {
            stats.parsed += 1;
            info!(
                id = %job.id,
                posting_id = %job.posting_id,
                company = %job.company,
                title = %job.title,
                remote = ?job.remote_policy,
                technologies = job.technologies.len(),
                "processed job posting"
            );
            Some(job)
        }
        Err(err) => {
            stats.failed += 1;
            error!(error = %err, "failed to process job posting");
            None
        }
    }
}

/// Queue-group subscriber on the postings subject.
pub struct PostingConsumer {
    client: async_nats::Client,
}

impl PostingConsumer {
    pub async fn connect(url: &str, connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = async_nats::ConnectOptions::new()
            .connection_timeout(connect_timeout)
            .connect(url)
            .await
            .with_context(|| format!("connecting to NATS at {url}"))?;
        Ok(Self { client })
    }

    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<ConsumerStats> {
        let mut subscriber = self
            .client
            .queue_subscribe(JOB_POSTINGS_SUBJECT, PROCESSING_QUEUE_GROUP.to_string())
            .await
            .with_context(|| format!("subscribing to {JOB_POSTINGS_SUBJECT}"))?;
        info!(
            subject = JOB_POSTINGS_SUBJECT,
            queue_group = PROCESSING_QUEUE_GROUP,
            "registered subscription"
        );

        let mut stats = ConsumerStats::default();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = subscriber.next() => {
                    let Some(message) = message else {
                        warn!("subscription closed by server");
                        break;
                    };
                    debug!(subject = %message.subject, bytes = message.payload.len(), "received message");
                    handle_payload(&message.payload, &mut stats);
                }
            }
        }

        if let Err(err) = subscriber.unsubscribe().await {
            warn!(error = %err, "failed to unsubscribe");
        }
        info!(
            received = stats.received,
            parsed = stats.parsed,
            failed = stats.failed,
            "posting consumer stopped"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn posting_json(id: &str, raw_text: &str) -> String {
        let posting = JobPosting {
            id: id.to_string(),
            title: String::new(),
            description: raw_text.to_string(),
            posted_at: Utc
                .with_ymd_and_hms(2026, 10, 1, 15, 0, 0)
                .single()
                .expect("ts"),
            raw_text: raw_text.to_string(),
            parent_id: Some(1),
        };
        serde_json::to_string(&posting).expect("encode")
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0)
            .single()
            .expect("ts")
    }

    #[test]
    fn pipe_delimited_header_is_split_into_fields() {
        let raw = posting_json(
            "45000010",
            "Acme Robotics | Remote (US) | Senior Rust Engineer | Full-time | Rust, Tokio, Postgres<p>We build robots. $150k - $190k + equity.",
        );
        let job = parse_job_posting_at(&raw, now()).expect("parse");

        assert_eq!(job.company, "Acme Robotics");
        assert_eq!(job.location, "Remote (US)");
        assert_eq!(job.title, "Rust Engineer");
        assert_eq!(job.experience_level, ExperienceLevel::Senior);
        assert_eq!(job.technologies.first().map(String::as_str), Some("rust"));
        assert!(job.technologies.contains(&"tokio".to_string()));
        assert_eq!(job.compensation_min, Some(150_000.0));
        assert_eq!(job.compensation_max, Some(190_000.0));
        assert_eq!(job.remote_policy, RemotePolicy::Remote);
        assert_eq!(job.source, "hackernews");
        assert_eq!(job.updated_at, now());
        assert_eq!(job.id, parsed_job_id("45000010"));
    }

    #[test]
    fn labelled_fields_fill_missing_header_parts() {
        let raw = posting_json(
            "45000011",
            "We are hiring!<p>Company: Widget Co<p>Location: Berlin, Germany<p>Role: Backend Developer<p>Tech stack: Go, Kafka<p>Experience: junior welcome",
        );
        let job = parse_job_posting_at(&raw, now()).expect("parse");

        assert_eq!(job.company, "Widget Co");
        assert_eq!(job.location, "Berlin");
        assert_eq!(job.title, "Backend Developer");
        assert_eq!(job.technologies, vec!["go".to_string(), "kafka".to_string()]);
        assert_eq!(job.experience_level, ExperienceLevel::Junior);
        assert_eq!(job.remote_policy, RemotePolicy::Unknown);
        assert_eq!(job.compensation_min, None);
    }

    #[test]
    fn html_entities_and_dashes_are_normalized() {
        let text = normalize_text(&html_to_text(
            "Foo&#x2F;Bar \u{2014} Onsite<p><p>  Apply at <a href=\"https:&#x2F;&#x2F;foo.example\">foo.example</a>",
        ));
        assert_eq!(text, "Foo/Bar - Onsite Apply at foo.example");
    }

    #[test]
    fn common_technologies_match_whole_words_once() {
        let techs = extract_technologies("We use Python, python and JavaScript on AWS. Not javaish.");
        assert_eq!(techs, vec!["python", "javascript", "aws"]);
    }

    #[test]
    fn experience_falls_back_to_free_text() {
        assert_eq!(classify_experience("looking for a tech lead"), Some(ExperienceLevel::Senior));
        assert_eq!(classify_experience("mid-level engineers"), Some(ExperienceLevel::MidLevel));
        assert_eq!(classify_experience("amidst the chaos"), None);
    }

    #[test]
    fn invalid_payload_is_counted_not_fatal() {
        let mut stats = ConsumerStats::default();
        assert!(handle_payload(b"not json", &mut stats).is_none());
        let raw = posting_json("1", "Acme | NYC | Engineer");
        assert!(handle_payload(raw.as_bytes(), &mut stats).is_some());
        assert_eq!(
            stats,
            ConsumerStats {
                received: 2,
                parsed: 1,
                failed: 1
            }
        );
    }
}
