use chrono::{DateTime, Utc};
use serde::Deserialize;
use strum::{AsRefStr, EnumString};

use crate::categories::Category;
use crate::error::PipelineError;

const DOCTYPE_MARKER: &str = "<!DOCTYPE html>";
const HTML_OPEN_MARKER: &str = "<html";
const HTML_CLOSE_MARKER: &str = "</html>";
const REPORT_ID_LEN: usize = 5;

/// Language tagged fences go first so their tag is removed with them.
const FENCES: [&str; 5] = ["```html", "```HTML", "```json", "```JSON", "```"];

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// A standalone HTML document.
    Html,

    /// A single JSON object.
    Json,
}

impl Default for ReportFormat {
    fn default() -> Self {
        Self::Html
    }
}

/// How deep the analysis should go.
#[derive(Debug, Copy, Clone, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Tier {
    Standard,
    #[strum(serialize = "deep_dive", serialize = "deep-dive")]
    DeepDive,
}

impl Tier {
    /// Parses the tier given by a caller, anything unknown is treated as standard.
    pub fn from_request(tier: Option<&str>) -> Self {
        tier.and_then(|t| t.trim().parse().ok())
            .unwrap_or(Self::Standard)
    }
}

/// The instruction payload sent along with the image.
#[derive(Debug, Clone)]
pub struct Instructions {
    pub system: String,
    pub user: String,
}

/// The sanitised output of the inference service.
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Html(String),
    Json(serde_json::Value),
}

impl Artifact {
    pub fn size(&self) -> usize {
        match self {
            Self::Html(html) => html.len(),
            Self::Json(value) => value.to_string().len(),
        }
    }
}

/// Generates a short report identifier such as `VV-3KQ9Z`.
pub fn generate_report_id(prefix: &str) -> String {
    let suffix: String = uuid::Uuid::new_v4()
        .to_simple()
        .to_string()
        .chars()
        .take(REPORT_ID_LEN)
        .collect();

    format!("{}-{}", prefix, suffix.to_ascii_uppercase())
}

/// Builds the category specific instructions for a single report.
///
/// The prompt content itself is owned by the products, this only frames
/// the request so the output can be located again by `extract_artifact`.
pub fn build_instructions(
    category: &Category,
    tier: Tier,
    report_id: &str,
    now: DateTime<Utc>,
) -> Instructions {
    let depth = match tier {
        Tier::Standard => "This is a STANDARD analysis. Be thorough but concise.",
        Tier::DeepDive => "This is a DEEP DIVE analysis. Expand every section with maximum detail \
            and finish with a verdict and the reasoning behind it.",
    };

    let output = match category.format {
        ReportFormat::Html => "Output ONLY valid HTML starting with <!DOCTYPE html>. \
            No markdown. No code fences. No preamble.",
        ReportFormat::Json => "Return ONLY a single valid JSON object. \
            No preamble. No markdown fences.",
    };

    let system = format!(
        "You are a buyer intelligence analyst for {domain}. Work only from what is visible \
        in the screenshot and never invent data.\n{depth}\n{output}\n\n\
        Report ID: {report_id}\nDate: {date}\nCategory: {category}",
        domain = category.domain,
        depth = depth,
        output = output,
        report_id = report_id,
        date = now.format("%-d %b %Y"),
        category = category.name,
    );

    let user = format!(
        "Analyse this {} listing and generate the complete buyer intelligence report as {}.",
        category.name.replace('_', " "),
        match category.format {
            ReportFormat::Html => "standalone HTML",
            ReportFormat::Json => "a JSON object",
        },
    );

    Instructions { system, user }
}

/// Strips fences and any text surrounding the report.
pub fn extract_artifact(raw: &str, format: ReportFormat) -> Result<Artifact, PipelineError> {
    let cleaned = strip_fences(raw);

    match format {
        ReportFormat::Html => {
            let start = cleaned
                .find(DOCTYPE_MARKER)
                .or_else(|| cleaned.find(HTML_OPEN_MARKER));
            let end = cleaned.rfind(HTML_CLOSE_MARKER);

            let html = match (start, end) {
                (Some(start), Some(end)) if start < end => {
                    &cleaned[start..end + HTML_CLOSE_MARKER.len()]
                },
                _ => cleaned.as_str(),
            };

            if html.is_empty() {
                return Err(invalid_format());
            }

            Ok(Artifact::Html(html.to_string()))
        },
        ReportFormat::Json => {
            let start = cleaned.find('{').ok_or_else(invalid_format)?;
            let end = cleaned.rfind('}').ok_or_else(invalid_format)?;
            if end < start {
                return Err(invalid_format());
            }

            let value: serde_json::Value = serde_json::from_str(&cleaned[start..=end])
                .map_err(|_| invalid_format())?;

            Ok(Artifact::Json(value))
        },
    }
}

fn strip_fences(raw: &str) -> String {
    let mut cleaned = raw.to_string();
    for fence in FENCES {
        cleaned = cleaned.replace(fence, "");
    }

    cleaned.trim().to_string()
}

fn invalid_format() -> PipelineError {
    PipelineError::InferenceFailure(
        "Analysis returned invalid format. Please try again.".to_string(),
    )
}
