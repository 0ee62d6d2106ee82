//! Admission decisions and their translation to review responses.

use json_patch::Patch;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use serde::Serialize;

use crate::error::AdmissionError;

/// Outcome of one mutator invocation.
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    Allowed(String),
    /// Rejected by policy; the reason reaches the user verbatim
    Denied(String),
    Patched { patch: Patch, reason: String },
}

impl Decision {
    pub fn allowed(reason: impl Into<String>) -> Self {
        Decision::Allowed(reason.into())
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Decision::Denied(reason.into())
    }

    /// Diff the decoded object against its desired copy.
    ///
    /// An empty diff is `Allowed(unchanged)`, so re-applying a mutator to its
    /// own output converges without any marker on the object.
    pub fn from_diff<T: Serialize>(
        original: &T,
        desired: &T,
        unchanged: &str,
        changed: &str,
    ) -> Result<Self, AdmissionError> {
        let before = serde_json::to_value(original)
            .map_err(|e| AdmissionError::Internal(format!("marshal original: {}", e)))?;
        let after = serde_json::to_value(desired)
            .map_err(|e| AdmissionError::Internal(format!("marshal mutated: {}", e)))?;
        let patch = json_patch::diff(&before, &after);
        if patch.0.is_empty() {
            Ok(Decision::Allowed(unchanged.to_string()))
        } else {
            Ok(Decision::Patched {
                patch,
                reason: changed.to_string(),
            })
        }
    }

    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Allowed(_) => "allowed",
            Decision::Denied(_) => "denied",
            Decision::Patched { .. } => "patched",
        }
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, Decision::Denied(_))
    }

    /// Build the review returned to the API server.
    pub fn into_review(
        self,
        request: &AdmissionRequest<DynamicObject>,
    ) -> Result<AdmissionReview<DynamicObject>, AdmissionError> {
        let response = AdmissionResponse::from(request);
        let response = match self {
            Decision::Allowed(_) => response,
            Decision::Denied(reason) => response.deny(reason),
            Decision::Patched { patch, .. } => response
                .with_patch(patch)
                .map_err(|e| AdmissionError::Internal(format!("encode patch: {}", e)))?,
        };
        Ok(response.into_review())
    }
}
