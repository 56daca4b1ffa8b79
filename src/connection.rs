//! Connection management: establishing, caching, and replacing the channel to
//! each broker.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
};

use thiserror::Error;
use tokio::{io::BufStream, net::TcpStream, sync::Mutex};
use tracing::{debug, info, warn};

use crate::messenger::{Messenger, RequestError};
use crate::protocol::messages::{MetadataRequest, MetadataResponse};
use crate::protocol::primitives::String_;

/// Port assumed for seed hosts given without one.
pub const DEFAULT_BROKER_PORT: u16 = 9092;

/// A live channel to one broker.
pub type BrokerConnection = Arc<Messenger<BufStream<TcpStream>>>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("error connecting to broker \"{broker}\": {error}")]
    Transport {
        broker: String,
        error: std::io::Error,
    },

    #[error("no broker in {0:?} answered a metadata request")]
    NoBrokers(Vec<String>),

    #[error("error getting cluster metadata: {0}")]
    Metadata(RequestError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Split `"host[:port]"`, falling back to [`DEFAULT_BROKER_PORT`].
pub(crate) fn parse_seed(seed: &str) -> (String, u16) {
    match seed.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_owned(), port),
            Err(_) => (seed.to_owned(), DEFAULT_BROKER_PORT),
        },
        None => (seed.to_owned(), DEFAULT_BROKER_PORT),
    }
}

struct CachedConnection {
    connection: BrokerConnection,
    last_used: u64,
}

/// Creates and caches one [`Messenger`] per broker.
///
/// Poisoned channels are evicted on access, so a leadership-change retry gets
/// a fresh socket. Requests that any live broker can answer are routed to the
/// least recently used connection to spread the load.
pub struct BrokerConnector {
    client_id: String_,
    max_message_size: usize,
    connections: Mutex<HashMap<i32, CachedConnection>>,
    use_counter: AtomicU64,
}

impl BrokerConnector {
    pub fn new(client_id: String_, max_message_size: usize) -> Self {
        Self {
            client_id,
            max_message_size,
            connections: Mutex::new(HashMap::new()),
            use_counter: AtomicU64::new(0),
        }
    }

    async fn connect(&self, host: &str, port: u16) -> Result<BrokerConnection> {
        let address = format!("{host}:{port}");
        info!(address = address.as_str(), "Establishing new connection");

        let stream = TcpStream::connect(&address)
            .await
            .map_err(|error| Error::Transport {
                broker: address,
                error,
            })?;

        Ok(Arc::new(Messenger::new(
            BufStream::new(stream),
            self.max_message_size,
            self.client_id.clone(),
        )))
    }

    /// Walk the seed list until one broker answers a metadata request.
    ///
    /// The bootstrap connection is thrown away afterwards; real connections
    /// are keyed by the broker IDs the response reveals.
    pub async fn bootstrap(&self, seeds: &[String]) -> Result<MetadataResponse> {
        for seed in seeds {
            let (host, port) = parse_seed(seed);

            let connection = match self.connect(&host, port).await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!(seed = seed.as_str(), %e, "Could not connect to bootstrap host");
                    continue;
                }
            };

            match connection.request(MetadataRequest { topics: vec![] }).await {
                Ok(response) => {
                    debug!(seed = seed.as_str(), "Metadata gathered from bootstrap host");
                    connection.close("bootstrap connection done");
                    return Ok(response);
                }
                Err(e) => {
                    warn!(seed = seed.as_str(), %e, "Bootstrap host did not answer metadata request");
                    connection.close("bootstrap connection failed");
                }
            }
        }

        Err(Error::NoBrokers(seeds.to_vec()))
    }

    /// Get the cached connection for a broker, dialing it if necessary.
    pub async fn get(&self, broker_id: i32, host: &str, port: u16) -> Result<BrokerConnection> {
        let stamp = self.use_counter.fetch_add(1, Ordering::Relaxed);
        let mut connections = self.connections.lock().await;

        match connections.get_mut(&broker_id) {
            Some(cached) if cached.connection.is_poisoned() => {
                debug!(broker_id, "Evicting poisoned connection");
                connections.remove(&broker_id);
            }
            Some(cached) => {
                cached.last_used = stamp;
                return Ok(Arc::clone(&cached.connection));
            }
            None => {}
        }

        let connection = self.connect(host, port).await?;
        connections.insert(
            broker_id,
            CachedConnection {
                connection: Arc::clone(&connection),
                last_used: stamp,
            },
        );
        Ok(connection)
    }

    /// Pick a connection among `brokers` for a request any broker can
    /// answer, preferring the least recently used live connection.
    ///
    /// Brokers without a cached connection are dialed only when every cached
    /// one is gone.
    pub async fn any(&self, brokers: &[(i32, String, u16)]) -> Result<BrokerConnection> {
        let stamp = self.use_counter.fetch_add(1, Ordering::Relaxed);

        {
            let mut connections = self.connections.lock().await;
            connections.retain(|_, cached| !cached.connection.is_poisoned());

            let candidate = brokers
                .iter()
                .filter_map(|(id, _, _)| connections.get(id).map(|c| (*id, c.last_used)))
                .min_by_key(|(_, last_used)| *last_used)
                .map(|(id, _)| id);

            if let Some(id) = candidate {
                let cached = connections.get_mut(&id).expect("candidate is cached");
                cached.last_used = stamp;
                return Ok(Arc::clone(&cached.connection));
            }
        }

        for (id, host, port) in brokers {
            match self.get(*id, host, *port).await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    warn!(broker_id = id, %e, "Failed to connect to broker");
                    continue;
                }
            }
        }

        Err(Error::NoBrokers(
            brokers.iter().map(|(_, h, p)| format!("{h}:{p}")).collect(),
        ))
    }

    /// Drop the cached connection of a broker, if any.
    pub async fn invalidate(&self, broker_id: i32, reason: &str) {
        let mut connections = self.connections.lock().await;
        if let Some(cached) = connections.remove(&broker_id) {
            debug!(broker_id, reason, "Invalidating broker connection");
            cached.connection.close(reason);
        }
    }

    /// Drop connections to brokers that are no longer part of the cluster.
    pub async fn retain(&self, alive: &[i32]) {
        let mut connections = self.connections.lock().await;
        connections.retain(|broker_id, cached| {
            let keep = alive.contains(broker_id) && !cached.connection.is_poisoned();
            if !keep {
                debug!(broker_id, "Removing connection from pool");
                cached.connection.close("broker left the cluster");
            }
            keep
        });
    }
}

impl std::fmt::Debug for BrokerConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnector")
            .field("client_id", &self.client_id)
            .field("max_message_size", &self.max_message_size)
            .finish_non_exhaustive()
    }
}
