//! In-memory Store: the persistence abstraction every other component
//! talks to. A real deployment would back this with a pooled database
//! connection; the trait boundary is what the rest of the engine is
//! written against, so swapping the backend never touches component
//! logic (see §5/§9 of the design notes this crate implements).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::{FlowError, FlowResult};
use crate::model::*;

/// Partial update for [`Flow`]; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct FlowPatch {
    pub name: Option<String>,
    pub nodes: Option<Vec<FlowNode>>,
    pub edges: Option<Vec<FlowEdge>>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_flow(&self, flow: Flow) -> FlowResult<Flow>;
    async fn update_flow(&self, flow_id: &str, patch: FlowPatch) -> FlowResult<Flow>;
    async fn get_flow(&self, flow_id: &str) -> FlowResult<Flow>;
    async fn list_flows(&self, author_user_id: &str) -> FlowResult<Vec<Flow>>;
    async fn set_flow_status(&self, flow_id: &str, status: FlowStatus) -> FlowResult<Flow>;

    /// Triggers for `brand_id` whose owning flow is `published`, in the
    /// order they were registered — the matcher's iteration order.
    async fn published_triggers(&self, brand_id: i64) -> FlowResult<Vec<Trigger>>;

    fn node_detail(&self, node_type: &str) -> Option<NodeDetail>;
    fn all_node_details(&self) -> Vec<NodeDetail>;
    fn node_details_by_category(&self, category: &str) -> Vec<NodeDetail>;

    async fn get_user(&self, key: &UserKey) -> FlowResult<Option<User>>;
    async fn create_user(&self, user: User) -> FlowResult<User>;
    async fn save_user(&self, user: User) -> FlowResult<User>;

    async fn get_context(&self, key: &UserKey, flow_id: &str, variable: &str) -> FlowResult<Option<String>>;
    async fn all_context(&self, key: &UserKey, flow_id: &str) -> FlowResult<HashMap<String, String>>;
    async fn upsert_context(&self, ctx: FlowUserContext) -> FlowResult<()>;

    async fn insert_webhook(&self, message: WebhookMessage) -> FlowResult<String>;
    async fn mark_webhook(&self, id: &str, status: WebhookStatus) -> FlowResult<()>;

    async fn insert_delay(&self, delay: Delay) -> FlowResult<Delay>;
    async fn pending_delays(&self) -> FlowResult<Vec<Delay>>;
    async fn mark_delay_processed(&self, id: &str) -> FlowResult<()>;
    /// The single outstanding (unprocessed) delay for a user, if any —
    /// used when a reply interrupts a wait.
    async fn active_delay_for_user(&self, key: &UserKey) -> FlowResult<Option<Delay>>;

    async fn record_transaction(&self, tx: UserTransaction) -> FlowResult<()>;

    async fn flow_settings(&self, flow_id: &str, node_id: &str) -> FlowResult<Option<FlowSettings>>;

    /// Acquires the per-user serialization lock. Every inbound event for
    /// the same `(brand, channel, channel_account_id, identifier)` key
    /// must hold this for the duration of its state transition; ordering
    /// across distinct users is never promised.
    async fn lock_user(&self, key: &UserKey) -> tokio::sync::OwnedMutexGuard<()>;
}

#[derive(Default)]
pub struct MemoryStore {
    flows: DashMap<String, Flow>,
    node_details: DashMap<String, NodeDetail>,
    users: DashMap<UserKey, User>,
    context: DashMap<(i64, String, String, String), FlowUserContext>,
    webhooks: DashMap<String, WebhookMessage>,
    delays: DashMap<String, Delay>,
    transactions: DashMap<String, UserTransaction>,
    flow_settings: DashMap<(String, String), FlowSettings>,
    user_locks: DashMap<UserKey, Arc<Mutex<()>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let details = DashMap::new();
        for nd in default_node_details() {
            details.insert(nd.node_type.clone(), nd);
        }
        Self {
            node_details: details,
            ..Default::default()
        }
    }

    /// Re-derives the flow's triggers from its start node. Called on
    /// every create/update so the trigger table never drifts from the
    /// graph it was built from.
    fn derive_trigger(flow: &Flow) -> Option<Trigger> {
        let start = flow.start_node()?;
        let trigger_type = match start.node_type()? {
            NodeType::TriggerKeyword => TriggerType::Keyword,
            NodeType::TriggerTemplate => TriggerType::Template,
            _ => return None,
        };
        let trigger_values: Vec<String> = match trigger_type {
            TriggerType::Keyword => start
                .extra
                .get("triggerValues")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|x| x.as_str().map(String::from)).collect())
                .unwrap_or_default(),
            TriggerType::Template => start
                .expected_answers
                .iter()
                .map(|a| a.expected_input.clone())
                .collect(),
        };
        Some(Trigger {
            flow_id: flow.flow_id.clone(),
            node_id: start.id.clone(),
            brand_id: flow.brand_id,
            trigger_type,
            trigger_values,
        })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_flow(&self, mut flow: Flow) -> FlowResult<Flow> {
        flow.status = FlowStatus::Draft;
        flow.created_at = Utc::now();
        flow.updated_at = Utc::now();
        self.flows.insert(flow.flow_id.clone(), flow.clone());
        Ok(flow)
    }

    async fn update_flow(&self, flow_id: &str, patch: FlowPatch) -> FlowResult<Flow> {
        let mut flow = self
            .flows
            .get(flow_id)
            .map(|f| f.clone())
            .ok_or_else(|| FlowError::NotFound(format!("flow {flow_id}")))?;
        if let Some(name) = patch.name {
            flow.name = name;
        }
        if let Some(nodes) = patch.nodes {
            flow.nodes = nodes;
        }
        if let Some(edges) = patch.edges {
            flow.edges = edges;
        }
        flow.updated_at = Utc::now();
        self.flows.insert(flow_id.to_string(), flow.clone());
        Ok(flow)
    }

    async fn get_flow(&self, flow_id: &str) -> FlowResult<Flow> {
        self.flows
            .get(flow_id)
            .map(|f| f.clone())
            .ok_or_else(|| FlowError::NotFound(format!("flow {flow_id}")))
    }

    async fn list_flows(&self, author_user_id: &str) -> FlowResult<Vec<Flow>> {
        Ok(self
            .flows
            .iter()
            .filter(|f| f.author_user_id == author_user_id)
            .map(|f| f.clone())
            .collect())
    }

    async fn set_flow_status(&self, flow_id: &str, status: FlowStatus) -> FlowResult<Flow> {
        if status == FlowStatus::Draft {
            return Err(FlowError::ValidationRule(
                "status cannot be reset to draft via the status endpoint".into(),
            ));
        }
        let mut entry = self
            .flows
            .get_mut(flow_id)
            .ok_or_else(|| FlowError::NotFound(format!("flow {flow_id}")))?;
        entry.status = status;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn published_triggers(&self, brand_id: i64) -> FlowResult<Vec<Trigger>> {
        let mut triggers = Vec::new();
        for flow in self.flows.iter() {
            if flow.brand_id != brand_id || flow.status != FlowStatus::Published {
                continue;
            }
            if let Some(trigger) = Self::derive_trigger(&flow) {
                triggers.push(trigger);
            }
        }
        triggers.sort_by(|a, b| a.flow_id.cmp(&b.flow_id));
        Ok(triggers)
    }

    fn node_detail(&self, node_type: &str) -> Option<NodeDetail> {
        self.node_details.get(node_type).map(|d| d.clone())
    }

    fn all_node_details(&self) -> Vec<NodeDetail> {
        self.node_details.iter().map(|d| d.clone()).collect()
    }

    fn node_details_by_category(&self, category: &str) -> Vec<NodeDetail> {
        self.node_details
            .iter()
            .filter(|d| d.category == category)
            .map(|d| d.clone())
            .collect()
    }

    async fn get_user(&self, key: &UserKey) -> FlowResult<Option<User>> {
        Ok(self.users.get(key).map(|u| u.clone()))
    }

    async fn create_user(&self, mut user: User) -> FlowResult<User> {
        user.created_at = Utc::now();
        user.updated_at = Utc::now();
        let key = user.key();
        self.users.insert(key, user.clone());
        Ok(user)
    }

    async fn save_user(&self, mut user: User) -> FlowResult<User> {
        user.updated_at = Utc::now();
        let key = user.key();
        self.users.insert(key, user.clone());
        Ok(user)
    }

    async fn get_context(&self, key: &UserKey, flow_id: &str, variable: &str) -> FlowResult<Option<String>> {
        Ok(self
            .context
            .get(&(key.brand_id, key.user_identifier.clone(), flow_id.to_string(), variable.to_string()))
            .map(|c| c.variable_value.clone()))
    }

    async fn all_context(&self, key: &UserKey, flow_id: &str) -> FlowResult<HashMap<String, String>> {
        Ok(self
            .context
            .iter()
            .filter(|e| e.key().0 == key.brand_id && e.key().1 == key.user_identifier && e.key().2 == flow_id)
            .map(|e| (e.variable_name.clone(), e.variable_value.clone()))
            .collect())
    }

    async fn upsert_context(&self, ctx: FlowUserContext) -> FlowResult<()> {
        let key = (ctx.brand_id, ctx.user_identifier.clone(), ctx.flow_id.clone(), ctx.variable_name.clone());
        self.context.insert(key, ctx);
        Ok(())
    }

    async fn insert_webhook(&self, message: WebhookMessage) -> FlowResult<String> {
        let id = message.id.clone();
        self.webhooks.insert(id.clone(), message);
        Ok(id)
    }

    async fn mark_webhook(&self, id: &str, status: WebhookStatus) -> FlowResult<()> {
        if let Some(mut entry) = self.webhooks.get_mut(id) {
            entry.metadata.status = status;
        }
        Ok(())
    }

    async fn insert_delay(&self, delay: Delay) -> FlowResult<Delay> {
        self.delays.insert(delay.id.clone(), delay.clone());
        Ok(delay)
    }

    async fn pending_delays(&self) -> FlowResult<Vec<Delay>> {
        let now = Utc::now();
        Ok(self
            .delays
            .iter()
            .filter(|d| d.is_due(now))
            .map(|d| d.clone())
            .collect())
    }

    async fn mark_delay_processed(&self, id: &str) -> FlowResult<()> {
        if let Some(mut entry) = self.delays.get_mut(id) {
            entry.processed = true;
        }
        Ok(())
    }

    async fn active_delay_for_user(&self, key: &UserKey) -> FlowResult<Option<Delay>> {
        Ok(self
            .delays
            .iter()
            .find(|d| {
                !d.processed
                    && d.user_identifier == key.user_identifier
                    && d.brand_id == key.brand_id
                    && d.channel == key.channel
                    && d.channel_account_id == key.channel_account_id
            })
            .map(|d| d.clone()))
    }

    async fn record_transaction(&self, tx: UserTransaction) -> FlowResult<()> {
        self.transactions.insert(tx.id.clone(), tx);
        Ok(())
    }

    async fn flow_settings(&self, flow_id: &str, node_id: &str) -> FlowResult<Option<FlowSettings>> {
        Ok(self
            .flow_settings
            .get(&(flow_id.to_string(), node_id.to_string()))
            .map(|s| s.clone()))
    }

    async fn lock_user(&self, key: &UserKey) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = self
            .user_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }
}
