//! Compile-once JSON Schema validation.
//!
//! A [`Validator`] is immutable after construction: build it once from a
//! configured schema path (or none, for a permissive default) and share it
//! across every message the owning bridge processes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("couldn't read schema file {path}")]
    Io {
        path: camino::Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("schema file is not valid JSON")]
    SchemaJson(#[source] serde_json::Error),
    #[error("schema document does not compile")]
    Compile(String),
}

/// Outcome of validating a message, distinguished so callers can log the two
/// failure modes differently even though both result in the message being
/// dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    MalformedJson,
    SchemaViolation,
}

impl Validity {
    pub fn is_valid(self) -> bool {
        matches!(self, Validity::Valid)
    }
}

pub struct Validator {
    compiled: Option<jsonschema::Validator>,
}

impl Validator {
    /// Build a validator from the schema file at `path`. `None` (an unconfigured
    /// bridge) yields a validator that accepts any well-formed JSON document.
    pub fn new(path: Option<&camino::Utf8Path>) -> Result<Self, SchemaError> {
        let Some(path) = path else {
            return Ok(Self { compiled: None });
        };

        let contents = std::fs::read_to_string(path).map_err(|source| SchemaError::Io { path: path.to_owned(), source })?;
        let schema: serde_json::Value = serde_json::from_str(&contents).map_err(SchemaError::SchemaJson)?;
        let compiled = jsonschema::validator_for(&schema).map_err(|error| SchemaError::Compile(error.to_string()))?;

        Ok(Self { compiled: Some(compiled) })
    }

    /// Validate raw bytes as JSON against the compiled schema. Returns `true`
    /// iff the bytes parse as JSON *and* conform.
    pub fn validate(&self, bytes: &[u8]) -> bool {
        self.check(bytes).is_valid()
    }

    /// Same as [`Validator::validate`] but distinguishes malformed JSON from a
    /// schema violation, so callers can log the two cases differently.
    pub fn check(&self, bytes: &[u8]) -> Validity {
        let Ok(document) = serde_json::from_slice::<serde_json::Value>(bytes) else {
            return Validity::MalformedJson;
        };

        match &self.compiled {
            None => Validity::Valid,
            Some(compiled) if compiled.is_valid(&document) => Validity::Valid,
            Some(_) => Validity::SchemaViolation,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn write_schema(dir: &tempfile::TempDir, contents: &str) -> camino::Utf8PathBuf {
        let path = camino::Utf8PathBuf::try_from(dir.path().join("schema.json")).unwrap();
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn permissive_when_unconfigured() {
        let validator = Validator::new(None).unwrap();
        assert!(validator.validate(br#"{"anything":true}"#));
        assert_eq!(validator.check(b"not json"), Validity::MalformedJson);
    }

    #[test]
    fn accepts_conforming_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_schema(
            &dir,
            r#"{"type":"object","properties":{"lala":{"type":"integer"}},"required":["lala"]}"#,
        );
        let validator = Validator::new(Some(&path)).unwrap();
        assert!(validator.validate(br#"{"lala":1}"#));
    }

    #[test]
    fn rejects_schema_violation_distinctly_from_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_schema(
            &dir,
            r#"{"type":"object","properties":{"lala":{"type":"integer"}},"required":["lala"]}"#,
        );
        let validator = Validator::new(Some(&path)).unwrap();

        assert_eq!(validator.check(br#"{"lala":"not-a-number"}"#), Validity::SchemaViolation);
        assert_eq!(validator.check(b"{not json"), Validity::MalformedJson);
    }
}
