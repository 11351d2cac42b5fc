//! Explicit runtime configuration.
//!
//! There are no process-wide defaults mutated at startup: the caller
//! constructs a [`Config`], adjusts what it needs, and passes it into
//! constructors. CLIs are consumers of this value, not contributors to
//! hidden state.

use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::{conn, meta::ControllerRef, pubsub, scheduler};

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The registry URL does not parse.
    #[error("invalid registry URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The registry URL parses but misses a host.
    #[error("registry URL has no host: {0}")]
    MissingHost(String),

    /// Robot kind and id must both be set for operations that target a
    /// specific controller.
    #[error("robot kind and id must be specified")]
    MissingRef,
}

/// Default registry and broker URL.
pub const DEFAULT_REGISTRY_URL: &str = "mqtt://localhost:1883/robo/";

/// Options recognized at the core boundary.
#[derive(Debug, Clone)]
pub struct Config {
    /// Controller registry URL (operator side), scheme + host + topic
    /// prefix.
    pub registry_url: String,
    /// Broker URL the controller side registers on; usually the same
    /// endpoint as the registry.
    pub broker_url: String,
    /// The controller to serve or connect to.
    pub reference: ControllerRef,
    /// How long discovery listens for retained metadata.
    pub discover_timeout: Duration,
    /// How long a command waits for its reply.
    pub command_expiration: Duration,
    /// Control loop iteration interval.
    pub loop_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry_url: DEFAULT_REGISTRY_URL.into(),
            broker_url: DEFAULT_REGISTRY_URL.into(),
            reference: ControllerRef::default(),
            discover_timeout: pubsub::DEFAULT_DISCOVER_TIMEOUT,
            command_expiration: conn::DEFAULT_COMMAND_EXPIRATION,
            loop_interval: scheduler::DEFAULT_INTERVAL,
        }
    }
}

impl Config {
    /// Parses the registry URL into its broker endpoint.
    ///
    /// # Errors
    ///
    /// See [`ConfigError`].
    pub fn registry_endpoint(&self) -> Result<BrokerEndpoint, ConfigError> {
        BrokerEndpoint::parse(&self.registry_url)
    }

    /// Parses the controller-side broker URL into its endpoint.
    ///
    /// # Errors
    ///
    /// See [`ConfigError`].
    pub fn broker_endpoint(&self) -> Result<BrokerEndpoint, ConfigError> {
        BrokerEndpoint::parse(&self.broker_url)
    }

    /// Ensures the controller reference is usable.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingRef`] when kind or id is empty.
    pub fn require_ref(&self) -> Result<&ControllerRef, ConfigError> {
        if self.reference.is_valid() {
            Ok(&self.reference)
        } else {
            Err(ConfigError::MissingRef)
        }
    }
}

/// A broker address split out of a registry URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    /// URL scheme; `mqtt` if the URL had none.
    pub scheme: String,
    /// `host[:port]`.
    pub authority: String,
    /// Topic prefix from the URL path, without the leading slash.
    pub topic_prefix: String,
}

impl BrokerEndpoint {
    /// Splits `scheme://host:port/prefix/` into its parts.
    ///
    /// # Errors
    ///
    /// See [`ConfigError`].
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(raw)?;
        let host = url.host_str().ok_or_else(|| ConfigError::MissingHost(raw.to_string()))?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let topic_prefix = url.path().trim_start_matches('/').to_string();
        Ok(Self { scheme: url.scheme().to_string(), authority, topic_prefix })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.registry_url, "mqtt://localhost:1883/robo/");
        assert_eq!(config.broker_url, config.registry_url);
        assert_eq!(config.discover_timeout, Duration::from_millis(500));
        assert_eq!(config.command_expiration, Duration::from_secs(1));
        assert_eq!(config.loop_interval, Duration::from_millis(100));
        assert!(config.require_ref().is_err());
    }

    #[test]
    fn endpoint_splits_the_default_url() {
        let endpoint = BrokerEndpoint::parse("mqtt://localhost:1883/robo/").expect("parse");
        assert_eq!(endpoint.scheme, "mqtt");
        assert_eq!(endpoint.authority, "localhost:1883");
        assert_eq!(endpoint.topic_prefix, "robo/");
    }

    #[test]
    fn endpoint_without_path_has_empty_prefix() {
        let endpoint = BrokerEndpoint::parse("tcp://broker.local:1883").expect("parse");
        assert_eq!(endpoint.authority, "broker.local:1883");
        assert_eq!(endpoint.topic_prefix, "");
    }

    #[test]
    fn bad_urls_are_rejected() {
        assert!(BrokerEndpoint::parse("not a url").is_err());
        assert!(matches!(
            BrokerEndpoint::parse("mqtt:no-host"),
            Err(ConfigError::MissingHost(_))
        ));
    }
}
