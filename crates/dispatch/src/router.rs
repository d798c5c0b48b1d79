use {
    async_trait::async_trait,
    bambooclaw_channels::{ChannelRegistry, Delivery},
    bambooclaw_common::Reply,
};

/// Delivers replies to the channel an event came from.
#[async_trait]
pub trait ReplyRouter: Send + Sync {
    async fn route(&self, channel: &str, reply: &Reply) -> anyhow::Result<Delivery>;
}

#[async_trait]
impl ReplyRouter for ChannelRegistry {
    async fn route(&self, channel: &str, reply: &Reply) -> anyhow::Result<Delivery> {
        Ok(self.send(channel, reply).await?)
    }
}
