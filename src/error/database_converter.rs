use crate::error::AppError;
use diesel::result::{DatabaseErrorKind, Error as DieselError};

/// Utility for converting database errors to structured AppError variants.
pub struct DatabaseErrorConverter;

impl DatabaseErrorConverter {
    /// Converts a Diesel error to an appropriate AppError variant.
    ///
    /// # Arguments
    /// * `error` - The Diesel error to convert
    /// * `operation` - Description of the database operation that failed
    pub fn convert_diesel_error(error: DieselError, operation: &str) -> AppError {
        match error {
            DieselError::DatabaseError(kind, info) => {
                Self::convert_database_error(kind, info.message(), info.table_name(), operation)
            }
            DieselError::NotFound => AppError::NotFound {
                entity: "resource".to_string(),
                field: "id".to_string(),
                value: "unknown".to_string(),
            },
            other => AppError::Database {
                operation: operation.to_string(),
                source: anyhow::Error::from(other),
            },
        }
    }

    fn convert_database_error(
        kind: DatabaseErrorKind,
        message: &str,
        table: Option<&str>,
        operation: &str,
    ) -> AppError {
        match kind {
            DatabaseErrorKind::UniqueViolation => AppError::Duplicate {
                entity: table.unwrap_or("row").to_string(),
                detail: message.to_string(),
            },
            DatabaseErrorKind::CheckViolation => AppError::Validation {
                field: table.unwrap_or("row").to_string(),
                reason: format!("Check constraint failed: {}", message),
            },
            DatabaseErrorKind::SerializationFailure => AppError::Database {
                operation: operation.to_string(),
                source: anyhow::Error::msg(format!("Serialization failure: {}", message)),
            },
            _ => AppError::Database {
                operation: operation.to_string(),
                source: anyhow::Error::msg(format!("Database error: {}", message)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockDatabaseErrorInfo {
        message: String,
        table_name: Option<String>,
    }

    impl diesel::result::DatabaseErrorInformation for MockDatabaseErrorInfo {
        fn message(&self) -> &str {
            &self.message
        }

        fn details(&self) -> Option<&str> {
            None
        }

        fn hint(&self) -> Option<&str> {
            None
        }

        fn table_name(&self) -> Option<&str> {
            self.table_name.as_deref()
        }

        fn column_name(&self) -> Option<&str> {
            None
        }

        fn constraint_name(&self) -> Option<&str> {
            None
        }

        fn statement_position(&self) -> Option<i32> {
            None
        }
    }

    #[test]
    fn test_convert_not_found_error() {
        let result = DatabaseErrorConverter::convert_diesel_error(DieselError::NotFound, "find job");
        assert!(matches!(result, AppError::NotFound { .. }));
    }

    #[test]
    fn test_convert_unique_violation() {
        let info = MockDatabaseErrorInfo {
            message: "duplicate key value violates unique constraint \"rate_limit_buckets_pkey\""
                .to_string(),
            table_name: Some("rate_limit_buckets".to_string()),
        };
        let error = DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, Box::new(info));

        match DatabaseErrorConverter::convert_diesel_error(error, "insert bucket") {
            AppError::Duplicate { entity, detail } => {
                assert_eq!(entity, "rate_limit_buckets");
                assert!(detail.contains("duplicate key"));
            }
            other => panic!("Expected Duplicate error, got: {:?}", other),
        }
    }

    #[test]
    fn test_convert_check_violation() {
        let info = MockDatabaseErrorInfo {
            message: "new row for relation \"jobs\" violates check constraint \"jobs_priority_check\""
                .to_string(),
            table_name: Some("jobs".to_string()),
        };
        let error = DieselError::DatabaseError(DatabaseErrorKind::CheckViolation, Box::new(info));

        match DatabaseErrorConverter::convert_diesel_error(error, "insert job") {
            AppError::Validation { field, reason } => {
                assert_eq!(field, "jobs");
                assert!(reason.contains("jobs_priority_check"));
            }
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }
}
