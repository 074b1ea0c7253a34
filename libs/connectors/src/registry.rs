use std::collections::HashMap;
use std::sync::Arc;

use ucm_core::{ChannelType, ConnectorError, ConnectorResult};

use crate::connector::ChannelConnector;

/// Channel tag to connector lookup. Built once at startup; the set of
/// registered channels is the deployment's capability surface.
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    connectors: HashMap<ChannelType, Arc<dyn ChannelConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, connector: Arc<dyn ChannelConnector>) -> Self {
        self.connectors.insert(connector.channel(), connector);
        self
    }

    pub fn get(&self, channel: ChannelType) -> ConnectorResult<Arc<dyn ChannelConnector>> {
        self.connectors
            .get(&channel)
            .cloned()
            .ok_or(ConnectorError::ChannelNotRegistered(channel.as_str()))
    }

    pub fn channels(&self) -> Vec<ChannelType> {
        let mut channels: Vec<_> = self.connectors.keys().copied().collect();
        channels.sort_by_key(|c| c.as_str());
        channels
    }
}
