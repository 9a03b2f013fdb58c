//! Job id generation and output-file naming conventions.
//!
//! Batch job ids embed a creation timestamp and an index so that output
//! files written by the remote service (which include the id in their
//! filename prefix) can be matched back to their job.

use crate::error::CoreError;
use crate::types::Timestamp;

/// Maximum length of a job id.
pub const MAX_JOB_ID_LEN: usize = 128;

/// Image extensions recognised as generation outputs.
pub const OUTPUT_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

/// Generate a short random job id (first 8 hex chars of a v4 UUID).
pub fn generate_job_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Generate a batch job id.
///
/// Convention: `{prefix}_{YYYYmmdd_HHMMSS}_{index:04}`
///
/// # Examples
///
/// ```
/// use chrono::TimeZone;
/// use genqueue_core::naming::batch_job_id;
///
/// let at = chrono::Utc.with_ymd_and_hms(2025, 3, 9, 14, 5, 0).unwrap();
/// assert_eq!(batch_job_id("batch", at, 7), "batch_20250309_140500_0007");
/// ```
pub fn batch_job_id(prefix: &str, created_at: Timestamp, index: usize) -> String {
    format!(
        "{prefix}_{}_{index:04}",
        created_at.format("%Y%m%d_%H%M%S")
    )
}

/// Validate a caller-supplied job id.
///
/// Rules:
/// - Must not be empty.
/// - Must not exceed `MAX_JOB_ID_LEN` characters.
/// - Must contain only alphanumeric, hyphen, underscore, or dot characters,
///   so it can appear verbatim in output filenames.
pub fn validate_job_id(id: &str) -> Result<(), CoreError> {
    if id.is_empty() {
        return Err(CoreError::Validation("Job id must not be empty".to_string()));
    }
    if id.len() > MAX_JOB_ID_LEN {
        return Err(CoreError::Validation(format!(
            "Job id must not exceed {MAX_JOB_ID_LEN} characters"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(CoreError::Validation(format!(
            "Job id \"{id}\" may only contain alphanumeric, hyphen, underscore, or dot characters"
        )));
    }
    Ok(())
}

/// Whether `file_name` looks like a generation output belonging to `job_id`.
pub fn is_output_for_job(file_name: &str, job_id: &str) -> bool {
    if !file_name.contains(job_id) {
        return false;
    }
    file_name
        .rsplit_once('.')
        .map(|(_, ext)| OUTPUT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn generated_ids_are_short_and_distinct() {
        let a = generate_job_id();
        let b = generate_job_id();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
        assert!(validate_job_id(&a).is_ok());
    }

    #[test]
    fn batch_id_pads_index() {
        let at = chrono::Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 58).unwrap();
        assert_eq!(batch_job_id("gen", at, 42), "gen_20241231_235958_0042");
    }

    #[test]
    fn empty_id_rejected() {
        assert!(validate_job_id("").is_err());
    }

    #[test]
    fn id_with_slash_rejected() {
        assert!(validate_job_id("../etc").is_err());
    }

    #[test]
    fn id_too_long_rejected() {
        assert!(validate_job_id(&"a".repeat(MAX_JOB_ID_LEN + 1)).is_err());
    }

    #[test]
    fn output_match_requires_id_and_image_extension() {
        assert!(is_output_for_job("job-7_00001_.png", "job-7"));
        assert!(is_output_for_job("JOB-7.JPG", "JOB-7"));
        assert!(!is_output_for_job("job-7.json", "job-7"));
        assert!(!is_output_for_job("job-8_00001_.png", "job-7"));
        assert!(!is_output_for_job("job-7", "job-7"));
    }
}
