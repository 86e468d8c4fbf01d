// cms_importer/src/reader.rs
// Loads the JSON export files.

use std::path::Path;

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{ImporterError, Result};

/// One element of an export file, untyped.
pub type SourceRecord = Map<String, Value,>;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Reads `path` and returns its top-level array elements.
///
/// Elements are returned as raw values; an element that is not an object is
/// rejected later as a single bad record rather than failing the whole file.
pub async fn read_records(path: &Path,) -> Result<Vec<Value,>,> {
    let bytes = tokio::fs::read(path,)
        .await
        .map_err(|source| ImporterError::IoError {
            path: path.to_path_buf(),
            source,
        },)?;

    let records = parse_records(&bytes,).map_err(|message| ImporterError::ParseError {
        path: path.to_path_buf(),
        message,
    },)?;
    debug!("Read {} records from {}", records.len(), path.display());
    Ok(records,)
}

fn parse_records(bytes: &[u8],) -> std::result::Result<Vec<Value,>, String,> {
    let bytes = bytes.strip_prefix(UTF8_BOM,).unwrap_or(bytes,);
    match serde_json::from_slice::<Value,>(bytes,).map_err(|e| e.to_string(),)? {
        Value::Array(records,) => Ok(records,),
        other => Err(format!("expected a JSON array, found {}", kind(&other)),),
    }
}

fn kind(value: &Value,) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_,) => "a boolean",
        Value::Number(_,) => "a number",
        Value::String(_,) => "a string",
        Value::Array(_,) => "an array",
        Value::Object(_,) => "an object",
    }
}

/// Borrows `value` as a record, or explains why it is not one.
pub fn as_record(value: &Value,) -> Result<&SourceRecord,> {
    value.as_object().ok_or_else(|| {
        ImporterError::InvalidRecord(format!("expected a JSON object, found {}", kind(value)),)
    },)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::json;
    use tempfile::NamedTempFile;

    use super::*;

    #[tokio::test]
    async fn reads_array_with_byte_order_mark() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"\xEF\xBB\xBF[{\"CountryId\": 1}, {\"CountryId\": 2}]",)
            .unwrap();

        let records = read_records(file.path(),).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1], json!({"CountryId": 2}));
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let err = read_records(Path::new("/nonexistent/countries.json",),)
            .await
            .unwrap_err();
        assert!(matches!(err, ImporterError::IoError { .. }));
        assert!(err.is_job_level());
    }

    #[tokio::test]
    async fn non_array_is_a_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(br#"{"CountryId": 1}"#,).unwrap();

        let err = read_records(file.path(),).await.unwrap_err();
        match err {
            ImporterError::ParseError { message, .. } => {
                assert!(message.contains("an object"), "{}", message)
            },
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn malformed_json_is_reported() {
        assert!(parse_records(b"[{\"CountryId\": ").is_err());
    }

    #[test]
    fn scalar_elements_are_invalid_records() {
        let err = as_record(&json!(42)).unwrap_err();
        assert!(matches!(err, ImporterError::InvalidRecord(_)));
    }
}
