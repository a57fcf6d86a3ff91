//! Name-keyed registry of codecs and channel types.
//!
//! The host builds one `Registry` at startup (usually from whatever plugin
//! loader it has), then hands it to clients and servers. Nothing in this
//! crate inspects types dynamically; it only looks implementations up by
//! name and calls them through the [`Codec`] and [`Channel`] traits.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::config::{DEFAULT_CHANNEL, DEFAULT_CODEC};
use crate::error::{ProtocolError, Result};
use crate::protocol::codec::{Codec, StdCodec};
use crate::transport::{Channel, SessionChannel};

/// Creates a fresh, uninitialized codec instance.
pub type CodecFactory = Arc<dyn Fn() -> Box<dyn Codec> + Send + Sync>;

/// Opens a channel to the given address.
pub type ChannelFactory =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<Arc<dyn Channel>>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Registry {
    codecs: HashMap<String, CodecFactory>,
    channels: HashMap<String, ChannelFactory>,
}

impl Registry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `std` codec and the `tcp` channel installed.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_codec(DEFAULT_CODEC, || Box::new(StdCodec::new()));
        registry.register_channel(DEFAULT_CHANNEL, |address| {
            async move {
                let channel = SessionChannel::connect(&address).await?;
                Ok(Arc::new(channel) as Arc<dyn Channel>)
            }
            .boxed()
        });
        registry
    }

    /// Add or replace a codec.
    pub fn register_codec<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Codec> + Send + Sync + 'static,
    {
        self.codecs.insert(name.to_string(), Arc::new(factory));
        self
    }

    /// Add or replace a channel type.
    pub fn register_channel<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(String) -> BoxFuture<'static, Result<Arc<dyn Channel>>> + Send + Sync + 'static,
    {
        self.channels.insert(name.to_string(), Arc::new(factory));
        self
    }

    pub fn has_codec(&self, name: &str) -> bool {
        self.codecs.contains_key(name)
    }

    /// Registered codec names, sorted.
    pub fn codec_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.codecs.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn create_codec(&self, name: &str) -> Result<Box<dyn Codec>> {
        self.codecs
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| ProtocolError::UnknownCodec(name.to_string()))
    }

    pub async fn open_channel(&self, name: &str, address: &str) -> Result<Arc<dyn Channel>> {
        let factory = self
            .channels
            .get(name)
            .cloned()
            .ok_or_else(|| ProtocolError::UnknownChannel(name.to_string()))?;
        factory(address.to_string()).await
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut channels: Vec<&String> = self.channels.keys().collect();
        channels.sort();
        f.debug_struct("Registry")
            .field("codecs", &self.codec_names())
            .field("channels", &channels)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let registry = Registry::with_defaults();
        assert_eq!(registry.codec_names(), vec!["std".to_string()]);
        assert_eq!(registry.create_codec("std").unwrap().name(), "std");
    }

    #[test]
    fn test_unknown_codec() {
        let registry = Registry::new();
        assert!(matches!(
            registry.create_codec("rot13"),
            Err(ProtocolError::UnknownCodec(name)) if name == "rot13"
        ));
    }

    #[test]
    fn test_names_are_sorted() {
        let mut registry = Registry::new();
        registry
            .register_codec("b", || Box::new(StdCodec::named("b")))
            .register_codec("a", || Box::new(StdCodec::named("a")));
        assert_eq!(registry.codec_names(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_unknown_channel() {
        let registry = Registry::new();
        let result = registry.open_channel("carrier-pigeon", "nowhere").await;
        assert!(matches!(result, Err(ProtocolError::UnknownChannel(_))));
    }
}
