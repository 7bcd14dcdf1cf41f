// Identity: who is on the other end of a relay connection
//
// The relay never owns identity records. It resolves them through the
// `IdentityStore` seam once per connection and caches the result.

pub(crate) mod credential;
mod store;
mod verifier;

pub use credential::{issue_credential, Claims, CredentialError, DEFAULT_CREDENTIAL_TTL_SECS};
pub use store::MemoryIdentityStore;
pub use verifier::{IdentityVerifier, VerifyError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of a registered user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Patient,
    Guardian,
    Doctor,
}

impl Role {
    /// Guardians and doctors both watch exactly one linked patient
    pub fn is_caregiver(&self) -> bool {
        matches!(self, Role::Guardian | Role::Doctor)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Guardian => "guardian",
            Role::Doctor => "doctor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A verified user as seen by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Opaque user id
    pub id: String,
    /// Display name
    pub name: String,
    pub role: Role,
    /// Patient this guardian/doctor is linked to (never set for patients)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_patient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Key handed out to caregivers for linking (patients only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_key: Option<String>,
}

impl Identity {
    pub fn patient(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: Role::Patient,
            linked_patient_id: None,
            email: None,
            patient_key: None,
        }
    }

    pub fn guardian(id: impl Into<String>, name: impl Into<String>, patient_id: impl Into<String>) -> Self {
        Self::caregiver(id, name, Role::Guardian, patient_id)
    }

    pub fn doctor(id: impl Into<String>, name: impl Into<String>, patient_id: impl Into<String>) -> Self {
        Self::caregiver(id, name, Role::Doctor, patient_id)
    }

    fn caregiver(
        id: impl Into<String>,
        name: impl Into<String>,
        role: Role,
        patient_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role,
            linked_patient_id: Some(patient_id.into()),
            email: None,
            patient_key: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// True if this caregiver is linked to the given patient
    pub fn is_linked_to(&self, patient_id: &str) -> bool {
        self.role.is_caregiver() && self.linked_patient_id.as_deref() == Some(patient_id)
    }

    /// Profile safe to hand to linked parties
    pub fn public_profile(&self) -> PublicProfile {
        PublicProfile {
            id: self.id.clone(),
            name: self.name.clone(),
            role: self.role,
            email: self.email.clone(),
        }
    }

    /// What a caregiver may see about their patient
    pub fn patient_info(&self) -> PatientInfo {
        PatientInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            role: self.role,
            email: self.email.clone(),
            patient_key: self.patient_key.clone(),
        }
    }
}

/// Linked patient's profile as returned to a guardian or doctor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientInfo {
    pub id: String,
    pub name: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_key: Option<String>,
}

/// Non-sensitive subset of an identity, as served by the REST reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicProfile {
    pub id: String,
    pub name: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Read-only view of the external identity store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Resolve a user id to its record
    async fn find_by_id(&self, id: &str) -> Option<Identity>;

    /// Every guardian/doctor linked to the given patient
    async fn linked_to(&self, patient_id: &str) -> Vec<Identity>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_wire_names() {
        assert_eq!(serde_json::to_string(&Role::Doctor).unwrap(), "\"doctor\"");
        let role: Role = serde_json::from_str("\"guardian\"").unwrap();
        assert_eq!(role, Role::Guardian);
        assert!(serde_json::from_str::<Role>("\"admin\"").is_err());
    }

    #[test]
    fn test_is_linked_to() {
        let guardian = Identity::guardian("g1", "Gail", "p1");
        assert!(guardian.is_linked_to("p1"));
        assert!(!guardian.is_linked_to("p2"));

        // A patient record carrying a stray link is still not a caregiver
        let mut patient = Identity::patient("p2", "Pat");
        patient.linked_patient_id = Some("p1".to_string());
        assert!(!patient.is_linked_to("p1"));
    }

    #[test]
    fn test_identity_json_uses_camel_case() {
        let json = r#"{"id":"d1","name":"Dr Who","role":"doctor","linkedPatientId":"p1"}"#;
        let identity: Identity = serde_json::from_str(json).unwrap();
        assert_eq!(identity, Identity::doctor("d1", "Dr Who", "p1"));
    }
}
