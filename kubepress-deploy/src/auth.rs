//! Azure AD credentials
//!
//! Either pre-acquired bearer tokens or an application secret exchanged for
//! tokens through the OAuth2 client-credentials grant.

use crate::{DeployError, Result};
use serde::Deserialize;
use std::fmt;
use tracing::debug;

pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

/// API a token is requested for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    ResourceManager,
    Graph,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::ResourceManager => "https://management.azure.com/.default",
            Scope::Graph => "https://graph.microsoft.com/.default",
        }
    }
}

#[derive(Clone)]
pub enum Credential {
    StaticToken {
        arm: String,
        graph: Option<String>,
    },
    ClientSecret {
        tenant_id: String,
        client_id: String,
        client_secret: String,
        authority: String,
    },
}

// Secrets stay out of logs
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::StaticToken { graph, .. } => f
                .debug_struct("StaticToken")
                .field("graph", &graph.is_some())
                .finish(),
            Credential::ClientSecret {
                tenant_id,
                client_id,
                ..
            } => f
                .debug_struct("ClientSecret")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .finish(),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl Credential {
    pub fn client_secret(tenant_id: &str, client_id: &str, client_secret: &str) -> Self {
        Credential::ClientSecret {
            tenant_id: tenant_id.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            authority: DEFAULT_AUTHORITY.to_string(),
        }
    }

    /// Bearer token for `scope`
    pub async fn token(&self, scope: Scope) -> Result<String> {
        match self {
            Credential::StaticToken { arm, graph } => match scope {
                Scope::ResourceManager => Ok(arm.clone()),
                Scope::Graph => graph
                    .clone()
                    .ok_or_else(|| DeployError::Auth("no Microsoft Graph token configured".into())),
            },
            Credential::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
                authority,
            } => {
                let url = format!(
                    "{}/{}/oauth2/v2.0/token",
                    authority.trim_end_matches('/'),
                    tenant_id
                );
                debug!(%url, scope = scope.as_str(), "Requesting token");

                let response = reqwest::Client::new()
                    .post(&url)
                    .form(&[
                        ("grant_type", "client_credentials"),
                        ("client_id", client_id.as_str()),
                        ("client_secret", client_secret.as_str()),
                        ("scope", scope.as_str()),
                    ])
                    .send()
                    .await
                    .map_err(|e| DeployError::Auth(e.to_string()))?;

                if !response.status().is_success() {
                    let status = response.status().as_u16();
                    let message = response.text().await.unwrap_or_default();
                    return Err(DeployError::Auth(format!(
                        "token request failed with {}: {}",
                        status, message
                    )));
                }
                let token: TokenResponse = response
                    .json()
                    .await
                    .map_err(|e| DeployError::Auth(e.to_string()))?;
                Ok(token.access_token)
            }
        }
    }
}
