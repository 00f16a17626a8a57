//! Agent catalog collaborator
//!
//! The catalog is keyed storage owned by the surrounding service; the
//! orchestration core only reads agent entries and pushes aggregate usage
//! stats. `CatalogStore` is the seam, `InMemoryCatalog` the implementation
//! used by tests and the local daemon.
//!
//! Catalog entries are immutable once referenced by a running instance: a
//! re-registration produces a new agent id rather than mutating in place,
//! so in-flight instances never observe their backing image changing.

use crate::utils::errors::{HubError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Pricing function frozen per instance at creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BillingModel {
    /// Flat price per completed task execution
    PerRequest { price: f64 },

    /// Rate per minute of Running time
    PerMinute { rate: f64 },

    /// Rate per hour of Running time
    PerHour { rate: f64 },

    /// Hourly base rate plus a per-task component
    Hybrid { hourly_rate: f64, per_request: f64 },
}

impl BillingModel {
    /// Cost of one completed task under this model
    pub fn request_cost(&self) -> f64 {
        match self {
            BillingModel::PerRequest { price } => *price,
            BillingModel::Hybrid { per_request, .. } => *per_request,
            BillingModel::PerMinute { .. } | BillingModel::PerHour { .. } => 0.0,
        }
    }

    /// Cost of `active` time spent in Running under this model
    pub fn time_cost(&self, active: Duration) -> f64 {
        let secs = active.as_secs_f64();
        match self {
            BillingModel::PerRequest { .. } => 0.0,
            BillingModel::PerMinute { rate } => rate * secs / 60.0,
            BillingModel::PerHour { rate } => rate * secs / 3600.0,
            BillingModel::Hybrid { hourly_rate, .. } => hourly_rate * secs / 3600.0,
        }
    }
}

/// Catalog entry for a marketplace agent (read-only to the core)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique agent identifier
    pub agent_id: String,

    /// Human-readable name
    pub name: String,

    /// Endpoints the worker serves; execute() validates against this list
    pub endpoints: Vec<String>,

    /// Declared capabilities, surfaced in discovery
    pub capabilities: Vec<String>,

    /// Runtime image reference for the compute unit
    pub image_ref: String,

    /// Pricing model snapshot source
    pub billing: BillingModel,

    /// Upper bound on concurrent instances across all customers
    pub max_instances: usize,
}

impl Agent {
    pub fn declares_endpoint(&self, endpoint: &str) -> bool {
        self.endpoints.iter().any(|e| e == endpoint)
    }
}

/// Filters for catalog listing
#[derive(Debug, Clone, Default)]
pub struct AgentFilters {
    pub capability: Option<String>,
    pub name_pattern: Option<String>,
    pub limit: Option<usize>,
}

/// Catalog storage seam
///
/// Usage stat delivery is at-least-once; the catalog side is expected to
/// tolerate duplicates.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get_agent(&self, agent_id: &str) -> Result<Agent>;

    async fn list_agents(&self, filters: &AgentFilters) -> Result<Vec<Agent>>;

    async fn record_usage_stats(
        &self,
        agent_id: &str,
        success: bool,
        latency: Duration,
    ) -> Result<()>;
}

/// Per-agent aggregate maintained by the in-memory catalog
#[derive(Debug, Clone, Default)]
pub struct UsageStats {
    pub total_tasks: u64,
    pub failed_tasks: u64,
    pub total_latency: Duration,
}

/// In-memory catalog used by tests and the local daemon
#[derive(Default)]
pub struct InMemoryCatalog {
    agents: RwLock<HashMap<String, Agent>>,
    stats: RwLock<HashMap<String, UsageStats>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, agent: Agent) {
        self.agents.write().insert(agent.agent_id.clone(), agent);
    }

    pub fn usage_stats(&self, agent_id: &str) -> Option<UsageStats> {
        self.stats.read().get(agent_id).cloned()
    }
}

#[async_trait]
impl CatalogStore for InMemoryCatalog {
    async fn get_agent(&self, agent_id: &str) -> Result<Agent> {
        self.agents
            .read()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| HubError::agent_not_found(agent_id))
    }

    async fn list_agents(&self, filters: &AgentFilters) -> Result<Vec<Agent>> {
        let agents = self.agents.read();
        let mut out: Vec<Agent> = agents
            .values()
            .filter(|a| {
                filters
                    .capability
                    .as_ref()
                    .map_or(true, |c| a.capabilities.contains(c))
            })
            .filter(|a| {
                filters
                    .name_pattern
                    .as_ref()
                    .map_or(true, |p| a.name.contains(p.as_str()))
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        if let Some(limit) = filters.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn record_usage_stats(
        &self,
        agent_id: &str,
        success: bool,
        latency: Duration,
    ) -> Result<()> {
        let mut stats = self.stats.write();
        let entry = stats.entry(agent_id.to_string()).or_default();
        entry.total_tasks += 1;
        if !success {
            entry.failed_tasks += 1;
        }
        entry.total_latency += latency;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_agent(id: &str) -> Agent {
        Agent {
            agent_id: id.to_string(),
            name: format!("agent-{}", id),
            endpoints: vec!["/analyze".to_string()],
            capabilities: vec!["nlp".to_string()],
            image_ref: "agenthub/sample:latest".to_string(),
            billing: BillingModel::PerRequest { price: 0.05 },
            max_instances: 3,
        }
    }

    #[tokio::test]
    async fn test_get_and_list() {
        let catalog = InMemoryCatalog::new();
        catalog.insert(sample_agent("a1"));
        catalog.insert(sample_agent("a2"));

        let agent = catalog.get_agent("a1").await.unwrap();
        assert_eq!(agent.name, "agent-a1");

        let all = catalog.list_agents(&AgentFilters::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let filtered = catalog
            .list_agents(&AgentFilters {
                capability: Some("vision".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn test_missing_agent() {
        let catalog = InMemoryCatalog::new();
        let err = catalog.get_agent("nope").await.unwrap_err();
        assert!(matches!(err, HubError::NotFound { kind: "agent", .. }));
    }

    #[tokio::test]
    async fn test_usage_stats_accumulate() {
        let catalog = InMemoryCatalog::new();
        catalog.insert(sample_agent("a1"));

        catalog
            .record_usage_stats("a1", true, Duration::from_millis(120))
            .await
            .unwrap();
        catalog
            .record_usage_stats("a1", false, Duration::from_millis(80))
            .await
            .unwrap();

        let stats = catalog.usage_stats("a1").unwrap();
        assert_eq!(stats.total_tasks, 2);
        assert_eq!(stats.failed_tasks, 1);
        assert_eq!(stats.total_latency, Duration::from_millis(200));
    }

    #[test]
    fn test_billing_model_costs() {
        let per_req = BillingModel::PerRequest { price: 0.05 };
        assert_eq!(per_req.request_cost(), 0.05);
        assert_eq!(per_req.time_cost(Duration::from_secs(3600)), 0.0);

        let per_min = BillingModel::PerMinute { rate: 0.6 };
        assert!((per_min.time_cost(Duration::from_secs(60)) - 0.6).abs() < 1e-9);

        let hybrid = BillingModel::Hybrid {
            hourly_rate: 1.2,
            per_request: 0.01,
        };
        assert!((hybrid.time_cost(Duration::from_secs(1800)) - 0.6).abs() < 1e-9);
        assert_eq!(hybrid.request_cost(), 0.01);
    }

    #[test]
    fn test_billing_model_serde_tag() {
        let json = serde_json::to_value(&BillingModel::PerHour { rate: 2.0 }).unwrap();
        assert_eq!(json["type"], "per_hour");
    }
}
