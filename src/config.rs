use std::sync::Arc;
use std::time::Duration;

use crate::server::providers::DEFAULT_PROVIDER_TTL;
use crate::{Dht, Swarm};

/// Default number of peers returned in a closer peers response.
pub const DEFAULT_CLOSER_PEER_COUNT: usize = 20;
/// Default number of requests a query keeps in flight, Kademlia's alpha.
pub const DEFAULT_CONCURRENCY: usize = 3;
/// Default query width, Kademlia's k.
pub const DEFAULT_QUERY_PEER_COUNT: usize = 20;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_PROVIDED_KEYS: usize = 2000;
pub const DEFAULT_MAX_PROVIDERS_PER_KEY: usize = 500;
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
/// Dht Configurations
pub struct Config {
    /// Maximum number of peers returned in response to FindNode and
    /// GetProviders requests.
    ///
    /// Defaults to [DEFAULT_CLOSER_PEER_COUNT]
    pub closer_peer_count: usize,
    /// How long a provider record stays valid.
    ///
    /// Defaults to [DEFAULT_PROVIDER_TTL]
    pub provider_ttl: Duration,
    /// How many peers a query asks in parallel.
    ///
    /// Defaults to [DEFAULT_CONCURRENCY]
    pub concurrency: usize,
    /// How many closest known peers seed a query, and how many of the
    /// closest candidates it visits before it considers itself exhausted.
    ///
    /// Defaults to [DEFAULT_QUERY_PEER_COUNT]
    pub query_peer_count: usize,
    /// Deadline of a single request to a remote peer.
    ///
    /// The longer this duration is, the longer queries take to give up on
    /// unresponsive peers. The shorter it is, the more answers from busy
    /// peers are missed.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Maximum number of content keys to store providers for.
    ///
    /// Defaults to [DEFAULT_MAX_PROVIDED_KEYS]
    pub max_provided_keys: usize,
    /// Maximum number of providers to store per content key.
    ///
    /// Defaults to [DEFAULT_MAX_PROVIDERS_PER_KEY]
    pub max_providers_per_key: usize,
    /// Period of the expired provider records purge.
    ///
    /// Defaults to [DEFAULT_MAINTENANCE_INTERVAL]
    pub maintenance_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            closer_peer_count: DEFAULT_CLOSER_PEER_COUNT,
            provider_ttl: DEFAULT_PROVIDER_TTL,
            concurrency: DEFAULT_CONCURRENCY,
            query_peer_count: DEFAULT_QUERY_PEER_COUNT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_provided_keys: DEFAULT_MAX_PROVIDED_KEYS,
            max_providers_per_key: DEFAULT_MAX_PROVIDERS_PER_KEY,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
        }
    }
}

#[derive(Debug, Default, Clone)]
/// Create a [Dht] with custom settings.
pub struct DhtBuilder(Config);

impl DhtBuilder {
    /// Set [Config::closer_peer_count]
    pub fn closer_peer_count(&mut self, count: usize) -> &mut Self {
        self.0.closer_peer_count = count;

        self
    }

    /// Set [Config::provider_ttl]
    pub fn provider_ttl(&mut self, ttl: Duration) -> &mut Self {
        self.0.provider_ttl = ttl;

        self
    }

    /// Set [Config::concurrency], zero is treated as one.
    pub fn concurrency(&mut self, concurrency: usize) -> &mut Self {
        self.0.concurrency = concurrency.max(1);

        self
    }

    /// Set [Config::query_peer_count], zero is treated as one.
    pub fn query_peer_count(&mut self, count: usize) -> &mut Self {
        self.0.query_peer_count = count.max(1);

        self
    }

    /// Set [Config::request_timeout]
    pub fn request_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.0.request_timeout = timeout;

        self
    }

    /// Set [Config::max_provided_keys]
    pub fn max_provided_keys(&mut self, max: usize) -> &mut Self {
        self.0.max_provided_keys = max;

        self
    }

    /// Set [Config::max_providers_per_key]
    pub fn max_providers_per_key(&mut self, max: usize) -> &mut Self {
        self.0.max_providers_per_key = max;

        self
    }

    /// Set [Config::maintenance_interval]
    pub fn maintenance_interval(&mut self, interval: Duration) -> &mut Self {
        self.0.maintenance_interval = interval;

        self
    }

    /// Create a stopped [Dht] running on top of `swarm`.
    pub fn build(&self, swarm: Arc<dyn Swarm>) -> Dht {
        Dht::new(swarm, self.0.clone())
    }
}
