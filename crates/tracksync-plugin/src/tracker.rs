use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracksync_core::model::{Subscription, Update};
use tracksync_core::tracker::{CallRequest, SubscribeRequest, Tracker, WebhookRequest};
use tracksync_core::Result;

use crate::client::TcpDialer;
use crate::redial::{Redialer, RetryPolicy};
use crate::wire::{self, UnsubscribeParams, WebhookParams};

/// A tracker implemented out of process and reached over the wire protocol.
pub struct PluginTracker {
    name: String,
    rpc: Redialer,
}

impl PluginTracker {
    pub fn new(name: impl Into<String>, rpc: Redialer) -> Self {
        Self {
            name: name.into(),
            rpc,
        }
    }

    /// Dial the plugin at `address`.
    pub async fn connect(name: &str, address: &str, policy: RetryPolicy) -> Result<Self> {
        let rpc = Redialer::connect(Arc::new(TcpDialer::new(address)), policy).await?;
        Ok(Self::new(name, rpc))
    }

    async fn invoke<P, R>(&self, cancel: &CancellationToken, method: &str, params: P) -> Result<R>
    where
        P: Serialize + Send,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let value = self
            .rpc
            .call(cancel, &wire::method(&self.name, method), params)
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl Tracker for PluginTracker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, cancel: &CancellationToken, request: CallRequest) -> Result<String> {
        self.invoke(cancel, wire::CALL, request).await
    }

    async fn subscribe(
        &self,
        cancel: &CancellationToken,
        request: SubscribeRequest,
    ) -> Result<String> {
        self.invoke(cancel, wire::SUBSCRIBE, request).await
    }

    async fn unsubscribe(&self, cancel: &CancellationToken, tracker_ref: &str) -> Result<()> {
        let params = UnsubscribeParams {
            tracker_ref: tracker_ref.to_string(),
        };
        let _: serde_json::Value = self.invoke(cancel, wire::UNSUBSCRIBE, params).await?;
        Ok(())
    }

    async fn handle_webhook(
        &self,
        cancel: &CancellationToken,
        subscription: &Subscription,
        request: WebhookRequest,
    ) -> Result<Option<Update>> {
        let params = WebhookParams {
            subscription: subscription.clone(),
            request,
        };
        self.invoke(cancel, wire::HANDLE_WEBHOOK, params).await
    }
}
