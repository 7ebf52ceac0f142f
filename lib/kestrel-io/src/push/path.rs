use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use indexmap::IndexMap;

use super::PushError;

const BASE64_SUFFIX: &str = "@base64";

/// Job and labels decoded from a push URL.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GroupingKey {
    /// Job name.
    pub job: String,

    /// Labels from the path, in path order, excluding `job`.
    pub labels: IndexMap<String, String>,
}

/// Returns `true` if `name` is a valid label name that is not reserved.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    let starts_well = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    starts_well && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && !name.starts_with("__")
}

/// Parses the grouping part of a push path.
///
/// `rest` is everything after `/metrics/`, in the form `job/<job>[/<label>/<value>...]`. Either `job` or a label name
/// may carry the `@base64` suffix, in which case its value is URL-safe base64.
pub fn parse_grouping_path(rest: &str) -> Result<GroupingKey, PushError> {
    let rest = rest.trim_start_matches('/');
    let mut segments = rest.split('/');

    let (job_marker, encoded_job) = match (segments.next(), segments.next()) {
        (Some(marker), Some(job)) => (marker, job),
        _ => {
            return Err(PushError::InvalidPath {
                reason: "path must start with job/<job>".to_string(),
            })
        }
    };
    let job = match job_marker {
        "job" => encoded_job.to_string(),
        "job@base64" => decode_base64_segment(encoded_job)?,
        other => {
            return Err(PushError::InvalidPath {
                reason: format!("expected 'job' segment, found '{}'", other),
            })
        }
    };
    if job.is_empty() {
        return Err(PushError::InvalidPath {
            reason: "job name is required".to_string(),
        });
    }

    let remaining = segments.collect::<Vec<_>>();
    // Tolerate a single trailing slash.
    let remaining = match remaining.split_last() {
        Some((last, init)) if last.is_empty() => init,
        _ => &remaining[..],
    };
    if remaining.len() % 2 != 0 {
        return Err(PushError::InvalidPath {
            reason: "odd number of label segments".to_string(),
        });
    }

    let mut labels = IndexMap::new();
    for pair in remaining.chunks_exact(2) {
        let (raw_name, raw_value) = (pair[0], pair[1]);
        let (name, value) = match raw_name.strip_suffix(BASE64_SUFFIX) {
            Some(name) => (name, decode_base64_segment(raw_value)?),
            None => (raw_name, raw_value.to_string()),
        };

        if !is_valid_label_name(name) {
            return Err(PushError::InvalidPath {
                reason: format!("invalid label name '{}'", name),
            });
        }
        if name == "job" || labels.contains_key(name) {
            return Err(PushError::InvalidPath {
                reason: format!("duplicate label '{}'", name),
            });
        }
        labels.insert(name.to_string(), value);
    }

    Ok(GroupingKey { job, labels })
}

fn decode_base64_segment(encoded: &str) -> Result<String, PushError> {
    let trimmed = encoded.trim_end_matches('=');
    if trimmed.is_empty() {
        return Ok(String::new());
    }

    let bytes = URL_SAFE_NO_PAD.decode(trimmed).map_err(|e| PushError::InvalidPath {
        reason: format!("invalid base64 value '{}': {}", encoded, e),
    })?;
    String::from_utf8(bytes).map_err(|_| PushError::InvalidPath {
        reason: format!("base64 value '{}' is not valid UTF-8", encoded),
    })
}
