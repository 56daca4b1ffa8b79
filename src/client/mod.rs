//! Client construction and the thin public façades over the engine.

use std::sync::Arc;
use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::cluster::Cluster;
use crate::connection::BrokerConnector;
use crate::protocol::messages::{DescribedGroup, ListedGroup};
use crate::protocol::primitives::String_;

pub mod consumer;
pub mod error;
pub mod grouped;
pub mod producer;

use error::{Error, Result};

/// Default cap for a single wire frame.
const DEFAULT_MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Default attempt budget for routed operations.
const DEFAULT_MAX_ATTEMPTS: usize = 4;

/// Default cadence of the background metadata refresh.
const DEFAULT_METADATA_REFRESH: Duration = Duration::from_secs(300);

/// Builder for [`Client`].
#[derive(Debug)]
pub struct ClientBuilder {
    seeds: Vec<String>,
    client_id: String,
    max_message_size: usize,
    max_attempts: usize,
    backoff_config: BackoffConfig,
    metadata_refresh: Option<Duration>,
}

impl ClientBuilder {
    /// Create a new [`ClientBuilder`] with the list of seed brokers.
    pub fn new(seeds: Vec<String>) -> Self {
        Self {
            seeds,
            client_id: env!("CARGO_PKG_NAME").to_owned(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_config: BackoffConfig::default(),
            metadata_refresh: Some(DEFAULT_METADATA_REFRESH),
        }
    }

    /// Cadence of the background metadata refresh; `None` disables it and
    /// leaves refreshes to error-driven retries.
    pub fn metadata_refresh(mut self, interval: Option<Duration>) -> Self {
        self.metadata_refresh = interval;
        self
    }

    /// The client ID announced in every request header.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Maximum size of a single response frame.
    pub fn max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Attempt budget for operations that retry through leadership changes.
    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Backoff schedule between retries.
    pub fn backoff_config(mut self, backoff_config: BackoffConfig) -> Self {
        self.backoff_config = backoff_config;
        self
    }

    /// Connect to the cluster: bootstrap off the seeds and take the first
    /// metadata snapshot.
    pub async fn build(self) -> Result<Client> {
        if self.seeds.is_empty() {
            return Err(Error::Configuration("empty seed broker list".to_owned()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Configuration(
                "max_attempts must be at least 1".to_owned(),
            ));
        }

        let connector = Arc::new(BrokerConnector::new(
            String_(self.client_id),
            self.max_message_size,
        ));
        let cluster = Arc::new(Cluster::new(
            connector,
            self.seeds,
            self.backoff_config,
            self.max_attempts,
        ));
        cluster.bootstrap().await?;
        if let Some(interval) = self.metadata_refresh {
            cluster.start_background_refresh(interval);
        }

        Ok(Client { cluster })
    }
}

/// A name and its partition IDs, as reported by cluster metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub name: String,
    pub partitions: Vec<i32>,
}

/// Entry point to the engine: owns the cluster model and hands out façades.
#[derive(Debug)]
pub struct Client {
    cluster: Arc<Cluster>,
}

impl Client {
    pub(crate) fn cluster(&self) -> Arc<Cluster> {
        Arc::clone(&self.cluster)
    }

    /// The topics the cluster currently knows, with their routable
    /// partitions.
    pub async fn list_topics(&self) -> Result<Vec<Topic>> {
        self.cluster.refresh_metadata().await?;
        let state = self.cluster.state();
        Ok(state
            .topic_names()
            .into_iter()
            .map(|name| Topic {
                partitions: state.partitions(&name),
                name,
            })
            .collect())
    }

    /// List consumer groups across every broker of the cluster.
    pub async fn list_groups(&self) -> Result<Vec<ListedGroup>> {
        self.cluster.list_groups().await
    }

    /// Describe a consumer group on its coordinator broker.
    pub async fn describe_group(&self, group: &str) -> Result<DescribedGroup> {
        self.cluster.describe_group(group).await
    }
}

/// Consumer instance names: `<client id>-<random>`, unique enough to tell
/// group members apart in logs and commit metadata.
pub(crate) fn instance_name(client_id: &str) -> String {
    format!("{client_id}-{:08x}", rand::random::<u32>())
}

/// Validate the timing relation of group liveness settings.
pub(crate) fn validate_group_timing(
    heartbeat_interval: Duration,
    session_timeout: Duration,
) -> Result<()> {
    if heartbeat_interval.is_zero() || session_timeout.is_zero() {
        return Err(Error::Configuration(
            "heartbeat_interval and session_timeout must be positive".to_owned(),
        ));
    }
    if heartbeat_interval >= session_timeout {
        return Err(Error::Configuration(format!(
            "heartbeat_interval ({heartbeat_interval:?}) must be shorter than session_timeout ({session_timeout:?})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_empty_seed_list_is_configuration_error() {
        let err = ClientBuilder::new(vec![]).build().await.unwrap_err();
        assert_matches!(err, Error::Configuration(_));
    }

    #[test]
    fn test_group_timing_validation() {
        validate_group_timing(Duration::from_secs(10), Duration::from_secs(30)).unwrap();

        let err = validate_group_timing(Duration::from_secs(30), Duration::from_secs(30))
            .unwrap_err();
        assert_matches!(err, Error::Configuration(_));

        let err =
            validate_group_timing(Duration::ZERO, Duration::from_secs(30)).unwrap_err();
        assert_matches!(err, Error::Configuration(_));
    }
}
