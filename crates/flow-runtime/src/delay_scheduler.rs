//! Background worker polling for due delays. Each tick fetches every
//! delay whose `delay_completes_at` has passed and re-enters the
//! orchestrator with a synthetic `delay_complete` event — the same
//! pipeline a real inbound message takes. A delay is marked `processed`
//! only after its synthetic event has been handled, so a failure leaves
//! it for the next tick instead of silently losing it.

use std::sync::Arc;
use std::time::Duration;

use flow_core::{Store, UserKey};
use flow_channels::NormalizedEvent;
use tokio::sync::Notify;
use tracing::{error, info};

use crate::orchestrator::Orchestrator;

pub struct DelayScheduler {
    store: Arc<dyn Store>,
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    stop: Arc<Notify>,
}

impl DelayScheduler {
    pub fn new(store: Arc<dyn Store>, orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self { store, orchestrator, interval, stop: Arc::new(Notify::new()) }
    }

    pub fn stop_handle(&self) -> Arc<Notify> {
        self.stop.clone()
    }

    /// Runs until `stop_handle().notify_one()` is called. Errors from a
    /// single pass are logged and never abort the loop.
    pub async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.stop.notified() => {
                    info!("delay scheduler stopping");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(err) = self.process_expired_delays().await {
                        error!(error = %err, "delay scheduler pass failed");
                    }
                }
            }
        }
    }

    async fn process_expired_delays(&self) -> flow_core::FlowResult<()> {
        let due = self.store.pending_delays().await?;
        for delay in due {
            if let Err(err) = self.fire(&delay).await {
                error!(delay_id = %delay.id, error = %err, "failed to fire delay_complete");
                continue;
            }
            self.store.mark_delay_processed(&delay.id).await?;
        }
        Ok(())
    }

    async fn fire(&self, delay: &flow_core::Delay) -> flow_core::FlowResult<()> {
        let key = UserKey {
            brand_id: delay.brand_id,
            channel: delay.channel.clone(),
            channel_account_id: delay.channel_account_id.clone(),
            user_identifier: delay.user_identifier.clone(),
        };
        let event = NormalizedEvent { user_state_id: Some(delay.user_identifier.clone()), ..Default::default() };
        self.orchestrator.handle(key, None, "delay_complete", event).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_dispatch::ChannelDispatcher;
    use crate::node_walker::NodeWalker;
    use flow_core::{Delay, Flow, FlowEdge, FlowNode, FlowStatus, MemoryStore};
    use std::sync::Arc;

    struct NoopDispatcher;

    #[async_trait::async_trait]
    impl ChannelDispatcher for NoopDispatcher {
        async fn dispatch(&self, _request: crate::channel_dispatch::ProcessNodeRequest) -> flow_core::FlowResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn expired_delay_is_processed_and_marked() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let walker = NodeWalker::new(store.clone(), Arc::new(NoopDispatcher));
        let orchestrator = Arc::new(Orchestrator::new(store.clone(), walker));

        let delay_node = FlowNode {
            id: "d1".into(),
            node_type_name: "delay".into(),
            delay_result: vec!["d1__not_interrupted".into(), "d1__interrupted".into()],
            ..Default::default()
        };
        let flow = Flow {
            flow_id: "f1".into(),
            brand_id: 1,
            author_user_id: "a".into(),
            name: "f".into(),
            status: FlowStatus::Published,
            nodes: vec![delay_node.clone(), FlowNode { id: "M".into(), node_type_name: "message".into(), ..Default::default() }],
            edges: vec![FlowEdge { id: "e1".into(), source_node_id: "d1__not_interrupted".into(), target_node_id: "M".into() }],
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        store.create_flow(flow).await.unwrap();
        store.set_flow_status("f1", FlowStatus::Published).await.unwrap();

        let key = UserKey { brand_id: 1, channel: "sms".into(), channel_account_id: "acct".into(), user_identifier: "u1".into() };
        store
            .create_user(flow_core::User {
                user_identifier: key.user_identifier.clone(),
                brand_id: key.brand_id,
                channel: key.channel.clone(),
                channel_account_id: key.channel_account_id.clone(),
                lead_id: None,
                is_in_automation: true,
                current_flow_id: Some("f1".into()),
                current_node_id: Some("d1".into()),
                validation: Default::default(),
                delay_node_data: Some(delay_node.clone()),
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let past = chrono::Utc::now() - chrono::Duration::seconds(10);
        store
            .insert_delay(Delay {
                id: "delay-1".into(),
                user_identifier: key.user_identifier.clone(),
                brand_id: key.brand_id,
                channel: key.channel.clone(),
                channel_account_id: key.channel_account_id.clone(),
                flow_id: "f1".into(),
                delay_node_id: "d1".into(),
                delay_node_data: delay_node,
                delay_started_at: past,
                delay_completes_at: past,
                processed: false,
            })
            .await
            .unwrap();

        let scheduler = DelayScheduler::new(store.clone(), orchestrator, Duration::from_secs(20));
        scheduler.process_expired_delays().await.unwrap();

        assert!(store.pending_delays().await.unwrap().is_empty());
        let user = store.get_user(&key).await.unwrap().unwrap();
        assert!(user.delay_node_data.is_none());
    }
}
