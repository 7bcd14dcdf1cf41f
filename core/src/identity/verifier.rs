// Identity verifier: bearer credential in, identity record out

use super::credential::{self, CredentialError};
use super::{Identity, IdentityStore};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("No identity record for subject {0}")]
    NotFound(String),
}

impl From<CredentialError> for VerifyError {
    fn from(err: CredentialError) -> Self {
        VerifyError::Unauthenticated(err.to_string())
    }
}

/// Resolves bearer credentials against the identity store.
///
/// Stateless apart from the secret; one verification per connection upgrade
/// or REST request, never retried.
#[derive(Clone)]
pub struct IdentityVerifier {
    secret: String,
    store: Arc<dyn IdentityStore>,
}

impl IdentityVerifier {
    pub fn new(secret: impl Into<String>, store: Arc<dyn IdentityStore>) -> Self {
        Self {
            secret: secret.into(),
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn IdentityStore> {
        &self.store
    }

    /// Verify a credential and resolve its subject
    pub async fn verify(&self, credential: Option<&str>) -> Result<Identity, VerifyError> {
        let credential = credential
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| VerifyError::Unauthenticated("No token provided".to_string()))?;

        let claims = credential::decode(&self.secret, credential, credential::unix_now())?;

        self.store
            .find_by_id(&claims.sub)
            .await
            .ok_or(VerifyError::NotFound(claims.sub))
    }

    /// Verify an `Authorization` header value of the form `Bearer <credential>`
    pub async fn verify_bearer(&self, header: Option<&str>) -> Result<Identity, VerifyError> {
        let credential = header.map(|h| h.strip_prefix("Bearer ").unwrap_or(h).trim());
        self.verify(credential).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::credential::{encode, issue_credential, Claims};
    use crate::identity::MockIdentityStore;

    const SECRET: &str = "verifier-secret";

    fn verifier_with(known: Vec<Identity>) -> IdentityVerifier {
        let mut store = MockIdentityStore::new();
        store
            .expect_find_by_id()
            .returning(move |id| known.iter().find(|u| u.id == id).cloned());
        IdentityVerifier::new(SECRET, Arc::new(store))
    }

    #[tokio::test]
    async fn test_valid_credential_resolves_identity() {
        let verifier = verifier_with(vec![Identity::guardian("g1", "Gail", "p1")]);
        let credential = issue_credential(SECRET, "g1", 60);

        let identity = verifier.verify(Some(&credential)).await.unwrap();
        assert_eq!(identity.id, "g1");
        assert_eq!(identity.linked_patient_id.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn test_missing_credential() {
        let verifier = verifier_with(vec![]);
        assert!(matches!(
            verifier.verify(None).await,
            Err(VerifyError::Unauthenticated(_))
        ));
        assert!(matches!(
            verifier.verify(Some("  ")).await,
            Err(VerifyError::Unauthenticated(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_credential() {
        let verifier = verifier_with(vec![Identity::patient("p1", "Pat")]);
        let expired = encode(
            SECRET,
            &Claims {
                sub: "p1".to_string(),
                exp: 1,
            },
        );
        assert_eq!(
            verifier.verify(Some(&expired)).await,
            Err(VerifyError::Unauthenticated("Credential expired".to_string()))
        );
    }

    #[tokio::test]
    async fn test_unknown_subject() {
        let verifier = verifier_with(vec![]);
        let credential = issue_credential(SECRET, "ghost", 60);
        assert_eq!(
            verifier.verify(Some(&credential)).await,
            Err(VerifyError::NotFound("ghost".to_string()))
        );
    }

    #[tokio::test]
    async fn test_store_not_consulted_for_bad_signature() {
        let mut store = MockIdentityStore::new();
        store.expect_find_by_id().never();
        let verifier = IdentityVerifier::new(SECRET, Arc::new(store));

        let credential = issue_credential("someone-else", "p1", 60);
        assert!(verifier.verify(Some(&credential)).await.is_err());
    }

    #[tokio::test]
    async fn test_bearer_header() {
        let verifier = verifier_with(vec![Identity::patient("p1", "Pat")]);
        let credential = issue_credential(SECRET, "p1", 60);
        let header = format!("Bearer {}", credential);

        assert_eq!(verifier.verify_bearer(Some(&header)).await.unwrap().id, "p1");
        assert!(verifier.verify_bearer(None).await.is_err());
    }
}
