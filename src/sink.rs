//! Capture sink: where diverted messages are uploaded.

use crate::error::Error;
use crate::routing::{Destination, Resolution, RoutingTable};
use crate::swift::Connection;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Trait defining the object store interface.
#[async_trait]
pub trait CaptureSink: Send + Sync {
    /// Stores `message` under `key` in the destination's container.
    async fn put(&self, destination: &Destination, key: &str, message: &[u8])
    -> Result<(), Error>;

    /// Checks that the destination's account and container are usable.
    async fn account_reachable(&self, destination: &Destination) -> Result<(), Error>;
}

/// Capture sink backed by OpenStack Swift.
///
/// Every call authenticates on its own, no connection outlives the call.
#[derive(Debug, Default)]
pub struct SwiftSink;

#[async_trait]
impl CaptureSink for SwiftSink {
    async fn put(
        &self,
        destination: &Destination,
        key: &str,
        message: &[u8],
    ) -> Result<(), Error> {
        let store = &destination.store;
        let connection = Connection::connect(store).await?;
        connection.put_container(&store.container).await?;
        connection
            .put_object(&store.container, key, message.to_vec())
            .await
    }

    async fn account_reachable(&self, destination: &Destination) -> Result<(), Error> {
        let store = &destination.store;
        let connection = Connection::connect(store).await?;
        connection.put_container(&store.container).await?;

        let containers = connection.containers().await?;
        if !containers.contains(&store.container) {
            return Err(Error::Store(format!(
                "missing container {} for {}",
                store.container, destination.name
            )));
        }
        Ok(())
    }
}

static DELIVERIES: AtomicU64 = AtomicU64::new(0);

/// Host name as used in object keys, escaped the Maildir way.
fn maildir_hostname() -> String {
    let name = match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            log::warn!("Unable to get hostname, using default. {e}");
            "localhost".to_string()
        }
    };
    name.replace('/', "\\057").replace(':', "\\072")
}

/// Generates a unique object key for a message of `size` bytes.
///
/// Maildir naming: time, microseconds, pid, per-process delivery counter and
/// host make the key unique across workers, processes and machines.
pub fn object_key(size: usize) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let delivery = DELIVERIES.fetch_add(1, Ordering::Relaxed);

    format!(
        "cur/{}.M{}P{}Q{}.{},S={}",
        now.as_secs(),
        now.subsec_micros(),
        std::process::id(),
        delivery,
        maildir_hostname(),
        size
    )
}

/// Maps recipients to destinations and uploads to each of them.
#[derive(Debug)]
pub struct Uploader<S> {
    routing: Arc<RoutingTable>,
    sink: S,
}

impl<S: CaptureSink> Uploader<S> {
    pub fn new(routing: Arc<RoutingTable>, sink: S) -> Self {
        Self { routing, sink }
    }

    #[cfg(test)]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Uploads `message` once per unique destination of `recipients`.
    ///
    /// All destinations are attempted even if some fail; any failure is
    /// reported afterwards. Returns the generated keys in destination order.
    pub async fn upload(
        &self,
        recipients: &[String],
        message: &[u8],
        resolution: Resolution,
    ) -> Result<Vec<String>, Error> {
        if recipients.is_empty() {
            // Uploading would silently store the message nowhere.
            return Err(Error::NoRecipients);
        }

        let destinations = self.routing.destinations_for(recipients, resolution)?;
        let mut keys = Vec::with_capacity(destinations.len());
        let mut failed = Vec::new();

        for destination in destinations {
            let key = object_key(message.len());
            match self.sink.put(destination, &key, message).await {
                Ok(()) => {
                    log::info!(
                        "upload {} OK ({:?}): {key}",
                        destination.name,
                        destination.store.container
                    );
                    keys.push(key);
                }
                Err(e) => {
                    log::error!("upload {} FAILED: {e}", destination.name);
                    failed.push(destination.name.clone());
                }
            }
        }

        if !failed.is_empty() {
            return Err(Error::CaptureSink { failed });
        }
        Ok(keys)
    }

    /// Checks every destination the recipients resolve to.
    pub async fn test_connect(&self, recipients: &[String]) -> Result<(), Error> {
        let destinations = self
            .routing
            .destinations_for(recipients, Resolution::WithDefault)?;

        for destination in destinations {
            self.sink.account_reachable(destination).await?;
            log::info!(
                "conn to {} OK ({:?})",
                destination.name,
                destination.store.container
            );
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// A sink remembering what was uploaded, failing for chosen destinations.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        pub failing: Vec<String>,
        pub uploads: Mutex<Vec<(String, String, Vec<u8>)>>,
    }

    impl RecordingSink {
        pub fn failing(names: &[&str]) -> Self {
            Self {
                failing: names.iter().map(|n| n.to_string()).collect(),
                ..Self::default()
            }
        }

        pub fn uploads(&self) -> Vec<(String, String, Vec<u8>)> {
            self.uploads.lock().map(|u| u.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl CaptureSink for RecordingSink {
        async fn put(
            &self,
            destination: &Destination,
            key: &str,
            message: &[u8],
        ) -> Result<(), Error> {
            if self.failing.contains(&destination.name) {
                return Err(Error::Store("unreachable".to_string()));
            }
            self.uploads.lock().unwrap().push((
                destination.name.clone(),
                key.to_string(),
                message.to_vec(),
            ));
            Ok(())
        }

        async fn account_reachable(&self, destination: &Destination) -> Result<(), Error> {
            if self.failing.contains(&destination.name) {
                return Err(Error::Store("unreachable".to_string()));
            }
            Ok(())
        }
    }
}
