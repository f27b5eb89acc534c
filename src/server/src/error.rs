//! Translation of build failures into registry V2 error envelopes.
//!
//! All error responses carry a JSON body of the form
//! `{"errors":[{"code":...,"message":...}]}` so that clients can show
//! something meaningful to their users.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use nixery_core::NixeryError;

#[derive(Serialize)]
struct WireError {
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct WireErrors {
    errors: Vec<WireError>,
}

/// An error response in the registry protocol.
#[derive(Debug)]
pub struct RegistryError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl RegistryError {
    pub fn manifest_unknown(message: String) -> RegistryError {
        RegistryError {
            status: StatusCode::NOT_FOUND,
            code: "MANIFEST_UNKNOWN",
            message,
        }
    }

    pub fn blob_unknown() -> RegistryError {
        RegistryError {
            status: StatusCode::NOT_FOUND,
            code: "BLOB_UNKNOWN",
            message: "blob not known to registry".to_string(),
        }
    }

    pub fn unknown(message: &str) -> RegistryError {
        RegistryError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "UNKNOWN",
            message: message.to_string(),
        }
    }

    pub fn manifest_upload() -> RegistryError {
        RegistryError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "MANIFEST_UPLOAD",
            message: "could not upload manifest to blob store".to_string(),
        }
    }

    /// Map a build pipeline failure onto the protocol error set.
    pub fn from_build_failure(err: &NixeryError) -> RegistryError {
        match err {
            NixeryError::PackagesNotFound { pkgs } => RegistryError::manifest_unknown(format!(
                "Could not find Nix packages: [{}]",
                pkgs.join(" ")
            )),
            _ => RegistryError::unknown("image build failure"),
        }
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let body = WireErrors {
            errors: vec![WireError {
                code: self.code,
                message: self.message,
            }],
        };

        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_envelope() {
        let err = RegistryError::from_build_failure(&NixeryError::PackagesNotFound {
            pkgs: vec!["does-not-exist".to_string()],
        });

        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.code, "MANIFEST_UNKNOWN");
        assert_eq!(
            err.message,
            "Could not find Nix packages: [does-not-exist]"
        );
    }

    #[test]
    fn test_multiple_missing_packages_are_space_separated() {
        let err = RegistryError::from_build_failure(&NixeryError::PackagesNotFound {
            pkgs: vec!["foo".to_string(), "bar".to_string()],
        });
        assert_eq!(err.message, "Could not find Nix packages: [foo bar]");
    }

    #[test]
    fn test_other_failures_are_opaque_500s() {
        let err = RegistryError::from_build_failure(&NixeryError::Storage("disk gone".to_string()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code, "UNKNOWN");
        // Internal details stay out of client responses
        assert!(!err.message.contains("disk gone"));
    }
}
