//! Error type for Civo API calls.
//!
//! The API reports failures as a JSON body of `{code, reason}`. A small
//! set of codes act as sentinels the CSI driver branches on (volume
//! already gone, snapshot in use, quota exceeded); everything else is
//! opaque and propagated as-is.

use thiserror::Error;

/// Error returned by every [`CivoApi`](crate::CivoApi) operation.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The HTTP request itself failed (connection, TLS, decoding).
    #[error("request to the Civo API failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The API answered with an error body.
    #[error("Civo API error {code}: {reason}")]
    Api {
        /// HTTP status of the response.
        status: u16,
        /// Machine-readable error code, e.g. `database_volume_not_found`.
        code: String,
        /// Human-readable explanation.
        reason: String,
    },
}

impl ClientError {
    /// Builds an API-level error, mostly useful for fakes and tests.
    pub fn api(status: u16, code: impl Into<String>, reason: impl Into<String>) -> Self {
        ClientError::Api {
            status,
            code: code.into(),
            reason: reason.into(),
        }
    }

    fn code(&self) -> Option<&str> {
        match self {
            ClientError::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    /// The referenced volume does not exist.
    pub fn is_volume_not_found(&self) -> bool {
        self.code() == Some("database_volume_not_found")
    }

    /// A lookup matched nothing.
    pub fn is_zero_matches(&self) -> bool {
        self.code() == Some("zero_matches")
    }

    /// The referenced snapshot does not exist.
    pub fn is_snapshot_not_found(&self) -> bool {
        matches!(
            self.code(),
            Some("database_snapshot_not_found") | Some("database_volume_snapshot_not_found")
        )
    }

    /// The snapshot is in use and cannot be deleted right now.
    pub fn is_snapshot_in_use(&self) -> bool {
        self.code() == Some("database_snapshot_cannot_delete_in_use")
    }

    /// Creating another snapshot would exceed the account quota.
    pub fn is_snapshot_quota_exceeded(&self) -> bool {
        self.code() == Some("database_volume_snapshot_limit_exceeded")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_codes_classify() {
        let err = ClientError::api(404, "database_volume_not_found", "no such volume");
        assert!(err.is_volume_not_found());
        assert!(!err.is_zero_matches());

        let err = ClientError::api(404, "zero_matches", "no matches");
        assert!(err.is_zero_matches());

        let err = ClientError::api(404, "database_snapshot_not_found", "gone");
        assert!(err.is_snapshot_not_found());
        let err = ClientError::api(404, "database_volume_snapshot_not_found", "gone");
        assert!(err.is_snapshot_not_found());

        let err = ClientError::api(409, "database_snapshot_cannot_delete_in_use", "in use");
        assert!(err.is_snapshot_in_use());

        let err = ClientError::api(403, "database_volume_snapshot_limit_exceeded", "quota");
        assert!(err.is_snapshot_quota_exceeded());
    }

    #[test]
    fn unrelated_codes_are_opaque() {
        let err = ClientError::api(500, "internal_server_error", "boom");
        assert!(!err.is_volume_not_found());
        assert!(!err.is_snapshot_not_found());
        assert!(!err.is_snapshot_in_use());
        assert!(!err.is_snapshot_quota_exceeded());
        assert_eq!(
            err.to_string(),
            "Civo API error internal_server_error: boom"
        );
    }
}
