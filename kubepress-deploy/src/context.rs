//! Clients and settings shared by every provisioner

use crate::auth::{Credential, Scope};
use crate::client::RestClient;
use crate::kubernetes::ClusterClient;
use crate::{DeployError, Result};
use kubepress_common::ResourceId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub const ARM_ENDPOINT: &str = "https://management.azure.com";
pub const GRAPH_ENDPOINT: &str = "https://graph.microsoft.com/v1.0";

/// Upper bounds for long-running operations
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub provisioning: Duration,
    pub deletion: Duration,
    /// How long a `LoadBalancer` service may take to get an address
    pub load_balancer: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            provisioning: Duration::from_secs(30 * 60),
            deletion: Duration::from_secs(30 * 60),
            load_balancer: Duration::from_secs(5 * 60),
        }
    }
}

pub struct DeployContext {
    pub arm: RestClient,
    pub graph: RestClient,
    subscription_id: String,
    clusters: RwLock<HashMap<ResourceId, ClusterClient>>,
    pub timeouts: Timeouts,
}

impl DeployContext {
    pub fn new(arm: RestClient, graph: RestClient, subscription_id: &str) -> Self {
        Self {
            arm,
            graph,
            subscription_id: subscription_id.to_string(),
            clusters: RwLock::new(HashMap::new()),
            timeouts: Timeouts::default(),
        }
    }

    /// Acquire tokens and build clients for the public Azure cloud
    pub async fn connect(credential: &Credential, subscription_id: &str) -> Result<Self> {
        if subscription_id.trim().is_empty() {
            return Err(DeployError::Auth("subscription id is required".into()));
        }

        let arm_token = credential.token(Scope::ResourceManager).await?;
        let arm = RestClient::new(ARM_ENDPOINT)?.with_token(&arm_token);

        // Graph is only needed for service-principal identities
        let graph = match credential.token(Scope::Graph).await {
            Ok(token) => RestClient::new(GRAPH_ENDPOINT)?.with_token(&token),
            Err(e) => {
                warn!(error = %e, "No Microsoft Graph token; identity resources will fail");
                RestClient::new(GRAPH_ENDPOINT)?
            }
        };

        info!(subscription = subscription_id, "Connected to Azure");
        Ok(Self::new(arm, graph, subscription_id))
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// `/subscriptions/{id}/resourceGroups/{group}`
    pub fn resource_group_path(&self, group: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}",
            self.subscription_id,
            urlencoding::encode(group)
        )
    }

    /// ARM path of a resource inside a resource group, with its api-version
    pub fn resource_path(
        &self,
        group: &str,
        resource_type: &str,
        name: &str,
        api_version: &str,
    ) -> String {
        format!(
            "{}/providers/{}/{}?api-version={}",
            self.resource_group_path(group),
            resource_type,
            urlencoding::encode(name),
            api_version
        )
    }

    pub async fn register_cluster(&self, provider: ResourceId, client: ClusterClient) {
        self.clusters.write().await.insert(provider, client);
    }

    /// Client registered for a Kubernetes provider
    pub async fn cluster(&self, provider: &ResourceId) -> Result<ClusterClient> {
        self.clusters
            .read()
            .await
            .get(provider)
            .cloned()
            .ok_or_else(|| DeployError::NotConnected(provider.to_string()))
    }

    pub async fn remove_cluster(&self, provider: &ResourceId) -> Option<ClusterClient> {
        self.clusters.write().await.remove(provider)
    }
}
