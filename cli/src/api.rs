// REST client for the relay's read-only directory endpoints
//
// `driftguard patient-info` and `driftguard linked` call these against the
// relay's HTTP port with the user's bearer credential.

use anyhow::{Context, Result};
use driftguard_core::identity::{Identity, PatientInfo, PublicProfile};
use hyper::{Body, Method, Request, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub connections: usize,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    message: String,
}

/// Check the relay is up
pub async fn get_health(api_url: &str) -> Result<HealthResponse> {
    get_json(api_url, "/health", None).await
}

/// The caller's own profile
pub async fn get_profile(api_url: &str, token: &str) -> Result<Identity> {
    get_json(api_url, "/api/profile", Some(token)).await
}

/// The patient a guardian or doctor is linked to
pub async fn get_patient_info(api_url: &str, token: &str) -> Result<PatientInfo> {
    get_json(api_url, "/api/patient/patient-info", Some(token)).await
}

/// Every guardian and doctor linked to the calling patient
pub async fn get_linked_guardians(api_url: &str, token: &str) -> Result<Vec<PublicProfile>> {
    get_json(api_url, "/api/patient/linked-guardians", Some(token)).await
}

async fn get_json<T: DeserializeOwned>(api_url: &str, path: &str, token: Option<&str>) -> Result<T> {
    let client = hyper::Client::new();
    let mut req = Request::builder()
        .method(Method::GET)
        .uri(format!("{}{}", api_url.trim_end_matches('/'), path));
    if let Some(token) = token {
        req = req.header("authorization", format!("Bearer {}", token));
    }
    let req = req.body(Body::empty())?;

    let resp = client
        .request(req)
        .await
        .with_context(|| format!("Cannot reach relay at {}", api_url))?;

    // Check HTTP status before attempting to parse
    let status = resp.status();
    let body_bytes = hyper::body::to_bytes(resp.into_body()).await?;

    if !status.is_success() {
        let message = serde_json::from_slice::<ErrorResponse>(&body_bytes)
            .map(|e| e.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&body_bytes).into_owned());
        match status {
            StatusCode::UNAUTHORIZED => anyhow::bail!("Rejected by relay: {}", message),
            _ => anyhow::bail!("Request failed with status {}: {}", status, message),
        }
    }

    serde_json::from_slice(&body_bytes).with_context(|| format!("Failed to parse response from {}", path))
}
