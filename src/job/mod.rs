//! Job identity: id generation, identifier validation, and filename parsing.
//!
//! Job ids are lower-cased ULIDs: 26 characters of Crockford base32,
//! filesystem- and URL-safe, and lexicographically ordered by creation time.
//! That ordering is what gives the registry its FIFO scan order.

use std::path::PathBuf;

use regex_lite::Regex;
use thiserror::Error;

/// Length of a lower-cased ULID identifier.
pub const ID_LENGTH: usize = 26;

/// Errors from identifier and filename validation.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("filename must be a name and an extension: {0}")]
    InvalidFilename(String),

    #[error("file extension not permitted: {0}")]
    ExtensionNotPermitted(String),
}

/// One uploaded file's journey from staging to a finished artifact.
///
/// `id` and `extension` are immutable after ingestion; lifecycle state lives
/// in the [`StateStore`](crate::state::StateStore), and paths are derived on
/// demand from the configured directory layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub extension: String,
}

impl Job {
    /// File name used in every staging directory: `<id>.<extension>`.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.id, self.extension)
    }

    /// Location of the job's bytes inside `dir`.
    pub fn path_in(&self, dir: &std::path::Path) -> PathBuf {
        dir.join(self.file_name())
    }
}

/// Generate a new job id (lower-cased ULID, filesystem-safe).
pub fn generate_job_id() -> String {
    ulid::Ulid::new().to_string().to_lowercase()
}

/// Validate an externally supplied identifier before it touches the state
/// store or the filesystem.
///
/// Must be exactly [`ID_LENGTH`] characters of the lower-case Crockford
/// base32 alphabet (digits and letters except `i`, `l`, `o`, `u`).
pub fn validate_identifier(id: &str) -> Result<(), JobError> {
    if id.len() != ID_LENGTH {
        return Err(JobError::InvalidIdentifier(format!(
            "identifier must be {} characters, got {}",
            ID_LENGTH,
            id.len()
        )));
    }

    for c in id.chars() {
        let valid = c.is_ascii_digit()
            || (c.is_ascii_lowercase() && !matches!(c, 'i' | 'l' | 'o' | 'u'));
        if !valid {
            return Err(JobError::InvalidIdentifier(format!(
                "identifier contains invalid character: {c:?}"
            )));
        }
    }

    Ok(())
}

/// Split an uploaded filename into its extension, lower-cased.
///
/// The filename must contain a base name and an extension; path separators
/// are rejected outright.
pub fn parse_extension(filename: &str) -> Result<String, JobError> {
    let pattern = Regex::new(r"^[^/\\]+\.(\w+)$").map_err(|_| {
        JobError::InvalidFilename(filename.to_string())
    })?;

    let captures = pattern
        .captures(filename)
        .ok_or_else(|| JobError::InvalidFilename(filename.to_string()))?;

    Ok(captures[1].to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_ids_are_valid_and_unique() {
        let mut seen = HashSet::new();
        for _ in 0..500 {
            let id = generate_job_id();
            validate_identifier(&id).unwrap();
            assert!(seen.insert(id.clone()), "duplicate id generated: {id}");
        }
    }

    #[test]
    fn id_length_is_fixed() {
        assert_eq!(generate_job_id().len(), ID_LENGTH);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(validate_identifier("short").is_err());
        assert!(validate_identifier(&"a".repeat(27)).is_err());
    }

    #[test]
    fn rejects_invalid_characters() {
        // Correct length, but uppercase and excluded letters are not in the
        // lower-case Crockford alphabet
        assert!(validate_identifier(&"A".repeat(26)).is_err());
        assert!(validate_identifier(&"i".repeat(26)).is_err());
        assert!(validate_identifier("../../../../../../etc/pass").is_err());
    }

    #[test]
    fn parses_simple_filename() {
        assert_eq!(parse_extension("photo.PNG").unwrap(), "png");
        assert_eq!(parse_extension("archive.tar.jpg").unwrap(), "jpg");
    }

    #[test]
    fn rejects_bare_names_and_paths() {
        assert!(parse_extension("noextension").is_err());
        assert!(parse_extension(".hidden").is_err());
        assert!(parse_extension("dir/photo.png").is_err());
        assert!(parse_extension("dir\\photo.png").is_err());
        assert!(parse_extension("").is_err());
    }

    #[test]
    fn job_paths_derive_from_id_and_extension() {
        let job = Job {
            id: "01jm5k3v8q0000000000000000".to_string(),
            extension: "png".to_string(),
        };
        assert_eq!(job.file_name(), "01jm5k3v8q0000000000000000.png");
        assert_eq!(
            job.path_in(std::path::Path::new("storage/queue")),
            PathBuf::from("storage/queue/01jm5k3v8q0000000000000000.png")
        );
    }
}
