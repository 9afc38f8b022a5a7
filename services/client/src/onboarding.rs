//! Sign-in: research ID validation, disclaimer acknowledgment, and login.

use paco_core::{
    Credentials,
    api::{AccessToken, ApiError, PacoApi},
};
use tracing::info;

/// Shown to the participant before sign-in. Acknowledging it is recorded by
/// the backend as part of `sign_in`.
pub const DISCLAIMER: &str = "\
PaCo is a research tool for educational purposes only. It is not intended to
provide individualized medical advice, make diagnoses or treatment
recommendations, or act as a substitute for a trained healthcare provider.
The information provided by PaCo may be wrong or incomplete. Always check with
your healthcare provider before making decisions about your health.

If you are having a medical emergency, please stop and call 911.

Your interactions with PaCo may be recorded and analyzed for research purposes.
All data will be anonymized and used solely for improving health education tools.";

#[derive(Debug, thiserror::Error)]
pub enum OnboardingError {
    /// The backend does not accept this research ID.
    #[error("{0}")]
    Rejected(String),
    #[error("the disclaimer must be acknowledged to continue")]
    DisclaimerRefused,
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignedIn {
    pub credentials: Credentials,
    pub token: AccessToken,
}

/// Walks a participant through the three sign-in steps in order. Any failure
/// stops the walk; the caller decides whether to prompt again.
pub async fn sign_in(api: &dyn PacoApi, research_id: &str) -> Result<SignedIn, OnboardingError> {
    let research_id = research_id.trim();
    if research_id.is_empty() {
        return Err(OnboardingError::Rejected(
            "Please enter a Research ID".to_string(),
        ));
    }

    let validation = api.validate_research_id(research_id).await?;
    if !validation.valid {
        let message = if validation.message.is_empty() {
            "Invalid Research ID".to_string()
        } else {
            validation.message
        };
        return Err(OnboardingError::Rejected(message));
    }

    let acknowledgment = api.acknowledge_disclaimer(research_id).await?;
    if !acknowledgment.success {
        return Err(OnboardingError::DisclaimerRefused);
    }

    let token = api.login(research_id).await?;
    info!(research_id, expires_at = %token.expires_at, "Signed in.");
    Ok(SignedIn {
        credentials: Credentials {
            token: token.access_token.clone(),
            research_id: token.research_id.clone(),
        },
        token,
    })
}
