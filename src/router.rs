//! Source type to destination channel mapping.

use crate::config::RoutingConfig;
use crate::error::{PipelineError, Result};
use crate::types::{ChannelName, SourceType};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Router {
    channels: HashMap<SourceType, ChannelName>,
}

impl Router {
    pub fn new(config: &RoutingConfig) -> Self {
        let channels = SourceType::ALL
            .iter()
            .map(|source_type| (*source_type, config.channel_for(*source_type).to_string()))
            .collect();
        Self { channels }
    }

    /// Router over an explicit table. Source types missing from the table
    /// fail with `UnknownSourceType`.
    pub fn with_channels(channels: HashMap<SourceType, ChannelName>) -> Self {
        Self { channels }
    }

    pub fn route(&self, source_type: SourceType) -> Result<&str> {
        self.channels
            .get(&source_type)
            .map(String::as_str)
            .ok_or_else(|| PipelineError::UnknownSourceType(source_type.to_string()))
    }

    /// Routes a source type given by name, as received from an adapter.
    pub fn route_name(&self, source_type: &str) -> Result<&str> {
        self.route(source_type.parse()?)
    }
}
