// cms_importer/src/error.rs
// Error taxonomy for import jobs and store backends.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error,)]
pub enum ImporterError {
    /// The source file could not be opened or read. Aborts the job.
    #[error("Unable to open file {}: {source}", path.display())]
    IoError {
        path:   PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The source file is not a JSON array. Aborts the job.
    #[error("Failed to parse {}: {message}", path.display())]
    ParseError { path: PathBuf, message: String, },
    #[error("Lookup in '{collection}' for key '{key}' failed: {source}")]
    LookupError {
        collection: String,
        key:        String,
        #[source]
        source:     Box<ImporterError,>,
    },
    #[error("Creating '{key}' in '{collection}' failed: {source}")]
    CreateError {
        collection: String,
        key:        String,
        #[source]
        source:     Box<ImporterError,>,
    },
    #[error("Updating '{field}' on {collection}#{id} failed: {source}")]
    LinkError {
        collection: String,
        id:         String,
        field:      String,
        #[source]
        source:     Box<ImporterError,>,
    },
    #[error("Record has no usable natural key in field '{0}'")]
    MissingNaturalKey(String,),
    #[error("Invalid record: {0}")]
    InvalidRecord(String,),
    #[error("Failed to connect to store: {0}")]
    ConnectionError(String,),
    #[error("Store error: {0}")]
    DatabaseError(String,),
    #[error("Invalid configuration: {0}")]
    ConfigurationError(String,),
    #[error("{0} records failed to import")]
    RecordsFailed(usize,),
    #[error("Other error: {0}")]
    Other(String,),
}

impl ImporterError {
    pub fn is_transient(&self,) -> bool {
        match self {
            ImporterError::ConnectionError(_,) => true,
            ImporterError::DatabaseError(msg,) => {
                let m = msg.to_lowercase();
                m.contains("timeout",)
                    || m.contains("timed out",)
                    || m.contains("too many clients",)
                    || m.contains("busy",)
                    || m.contains("locked",)
                    || m.contains("connection reset",)
                    || m.contains("service unavailable",)
            },
            ImporterError::LookupError { source, .. }
            | ImporterError::CreateError { source, .. }
            | ImporterError::LinkError { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Job-level errors stop the whole job; everything else is scoped to one record.
    pub fn is_job_level(&self,) -> bool {
        matches!(
            self,
            ImporterError::IoError { .. }
                | ImporterError::ParseError { .. }
                | ImporterError::ConfigurationError(_,)
        )
    }
}

pub type Result<T,> = std::result::Result<T, ImporterError,>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_errors_inherit_transience() {
        let err = ImporterError::CreateError {
            collection: "countries".to_string(),
            key:        "1".to_string(),
            source:     Box::new(ImporterError::ConnectionError("refused".to_string(),),),
        };
        assert!(err.is_transient());

        let err = ImporterError::LookupError {
            collection: "countries".to_string(),
            key:        "1".to_string(),
            source:     Box::new(ImporterError::DatabaseError("400 Bad Request".to_string(),),),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn busy_database_is_transient() {
        assert!(ImporterError::DatabaseError("database is locked".to_string()).is_transient());
        assert!(!ImporterError::MissingNaturalKey("CountryId".to_string()).is_transient());
    }
}
