use crate::constants::CONFLICT_RETRY_PAUSE_MS;
use crate::envelope::{BatchMessage, Item};
use crate::error::{IngestError, Result};
use crate::registry::{ProtocolBinding, RegistryStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Classification of what one upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    Noop,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EntityStats {
    pub created: u64,
    pub updated: u64,
    pub noop: u64,
}

impl EntityStats {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::Updated => self.updated += 1,
            Outcome::Noop => self.noop += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemError {
    pub index: usize,
    pub detail: String,
}

/// Aggregate result of applying one batch. Item failures never fail the
/// batch; they are collected here and logged.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchStats {
    pub devices: EntityStats,
    pub protocols: EntityStats,
    pub errors: Vec<ItemError>,
}

/// Applies batches to the registry, one short transaction per item, with
/// last-writer-wins conflict resolution by token recency.
pub struct Reconciler {
    store: Arc<dyn RegistryStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self { store }
    }

    /// Apply every item in the batch. Never fails for business-level item
    /// errors; a uniqueness race between workers gets one retry after a
    /// short pause, anything else is recorded and the batch continues.
    pub async fn apply(&self, batch: &BatchMessage) -> BatchStats {
        let mut stats = BatchStats::default();
        for (index, item) in batch.items.iter().enumerate() {
            let mut attempt = self.apply_item(batch, item).await;
            if let Err(IngestError::Conflict(ref detail)) = attempt {
                warn!(
                    request_id = %batch.request_id,
                    index,
                    detail = %detail,
                    "Uniqueness race; retrying item once"
                );
                tokio::time::sleep(Duration::from_millis(CONFLICT_RETRY_PAUSE_MS)).await;
                attempt = self.apply_item(batch, item).await;
            }
            match attempt {
                Ok((device_outcome, protocol_outcome)) => {
                    stats.devices.record(device_outcome);
                    stats.protocols.record(protocol_outcome);
                }
                Err(e) => {
                    error!(
                        request_id = %batch.request_id,
                        index,
                        serial_number = %item.serial_number,
                        "Item processing failed: {}", e
                    );
                    stats.errors.push(ItemError {
                        index,
                        detail: e.to_string(),
                    });
                }
            }
        }
        info!(
            request_id = %batch.request_id,
            devices_created = stats.devices.created,
            devices_updated = stats.devices.updated,
            devices_noop = stats.devices.noop,
            protocols_created = stats.protocols.created,
            protocols_updated = stats.protocols.updated,
            protocols_noop = stats.protocols.noop,
            item_errors = stats.errors.len(),
            "Batch processed"
        );
        crate::metrics::reconcile::batch_processed(&stats);
        stats
    }

    async fn apply_item(&self, batch: &BatchMessage, item: &Item) -> Result<(Outcome, Outcome)> {
        let location = item.location.as_deref().filter(|l| !l.is_empty());

        let (device, created) = self
            .store
            .get_or_create_device(&item.serial_number, location)
            .await?;
        let device_outcome = if created {
            Outcome::Created
        } else {
            match location {
                Some(loc) if device.location.as_deref() != Some(loc) => {
                    self.store.update_device_location(device.id, loc).await?;
                    Outcome::Updated
                }
                _ => Outcome::Noop,
            }
        };

        let binding = ProtocolBinding {
            mb_ip: batch.mb_ip.clone(),
            token: item.token.clone(),
            token_created_at: item.token_created_at,
        };
        let (protocol, created) = self
            .store
            .get_or_create_protocol(device.id, item.protocol_type, &binding)
            .await?;
        // Arrival order must never dictate stored state; only a strictly
        // newer token wins.
        let protocol_outcome = if created {
            Outcome::Created
        } else if item.token_created_at > protocol.token_created_at {
            self.store
                .update_protocol_binding(protocol.id, &binding)
                .await?;
            Outcome::Updated
        } else {
            Outcome::Noop
        };

        Ok((device_outcome, protocol_outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ProtocolType;
    use crate::registry::{Device, DeviceProtocol, InMemoryRegistry};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex;
    use uuid::Uuid;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    fn item(serial: &str, protocol: ProtocolType, token: &str, token_at: DateTime<Utc>) -> Item {
        Item {
            serial_number: serial.to_string(),
            location: Some("site-a".to_string()),
            protocol_type: protocol,
            token: token.to_string(),
            token_created_at: token_at,
        }
    }

    fn batch_with(items: Vec<Item>) -> BatchMessage {
        BatchMessage {
            request_id: Uuid::new_v4().to_string(),
            client_request_id: String::new(),
            mb_ip: "10.1.2.3".to_string(),
            sent_at: ts(12),
            items,
        }
    }

    #[tokio::test]
    async fn first_sighting_creates_device_and_protocol() {
        let store = Arc::new(InMemoryRegistry::new());
        let reconciler = Reconciler::new(store.clone());
        let batch = batch_with(vec![item("ABCDEFGH12345678", ProtocolType::Rps, "t1", ts(10))]);

        let stats = reconciler.apply(&batch).await;

        assert_eq!(stats.devices.created, 1);
        assert_eq!(stats.protocols.created, 1);
        assert!(stats.errors.is_empty());
        let device = store.get_device("ABCDEFGH12345678").await.unwrap().unwrap();
        let protocol = store
            .get_protocol(device.id, ProtocolType::Rps)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(protocol.token, "t1");
        assert_eq!(protocol.mb_ip, "10.1.2.3");
    }

    #[tokio::test]
    async fn reapplying_a_batch_is_all_noops() {
        let store = Arc::new(InMemoryRegistry::new());
        let reconciler = Reconciler::new(store.clone());
        let batch = batch_with(vec![item("ABCDEFGH12345678", ProtocolType::Rps, "t1", ts(10))]);

        reconciler.apply(&batch).await;
        let stats = reconciler.apply(&batch).await;

        assert_eq!(stats.devices.created, 0);
        assert_eq!(stats.devices.noop, 1);
        assert_eq!(stats.protocols.created, 0);
        assert_eq!(stats.protocols.updated, 0);
        assert_eq!(stats.protocols.noop, 1);
        assert_eq!(store.device_count().await.unwrap(), 1);
        assert_eq!(store.protocol_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stale_token_never_overwrites_newer_one() {
        let store = Arc::new(InMemoryRegistry::new());
        let reconciler = Reconciler::new(store.clone());

        // Newer token arrives first; an older one trails behind.
        reconciler
            .apply(&batch_with(vec![item(
                "ABCDEFGH12345678",
                ProtocolType::Rps,
                "newer",
                ts(11),
            )]))
            .await;
        let stats = reconciler
            .apply(&batch_with(vec![item(
                "ABCDEFGH12345678",
                ProtocolType::Rps,
                "older",
                ts(9),
            )]))
            .await;

        assert_eq!(stats.protocols.noop, 1);
        let device = store.get_device("ABCDEFGH12345678").await.unwrap().unwrap();
        let protocol = store
            .get_protocol(device.id, ProtocolType::Rps)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(protocol.token, "newer");
        assert_eq!(protocol.token_created_at, ts(11));
    }

    #[tokio::test]
    async fn stored_token_is_max_seen_regardless_of_order() {
        let store = Arc::new(InMemoryRegistry::new());
        let reconciler = Reconciler::new(store.clone());
        // Shuffled arrival order of four token generations.
        for hour in [10u32, 8, 11, 9] {
            reconciler
                .apply(&batch_with(vec![item(
                    "ABCDEFGH12345678",
                    ProtocolType::Pms,
                    &format!("t{}", hour),
                    ts(hour),
                )]))
                .await;
        }
        let device = store.get_device("ABCDEFGH12345678").await.unwrap().unwrap();
        let protocol = store
            .get_protocol(device.id, ProtocolType::Pms)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(protocol.token_created_at, ts(11));
        assert_eq!(protocol.token, "t11");
    }

    #[tokio::test]
    async fn location_change_updates_device() {
        let store = Arc::new(InMemoryRegistry::new());
        let reconciler = Reconciler::new(store.clone());
        reconciler
            .apply(&batch_with(vec![item(
                "ABCDEFGH12345678",
                ProtocolType::Rps,
                "t1",
                ts(10),
            )]))
            .await;

        let mut moved = item("ABCDEFGH12345678", ProtocolType::Rps, "t1", ts(10));
        moved.location = Some("site-b".to_string());
        let stats = reconciler.apply(&batch_with(vec![moved])).await;

        assert_eq!(stats.devices.updated, 1);
        let device = store.get_device("ABCDEFGH12345678").await.unwrap().unwrap();
        assert_eq!(device.location.as_deref(), Some("site-b"));
    }

    #[tokio::test]
    async fn empty_location_does_not_clobber_stored_value() {
        let store = Arc::new(InMemoryRegistry::new());
        let reconciler = Reconciler::new(store.clone());
        reconciler
            .apply(&batch_with(vec![item(
                "ABCDEFGH12345678",
                ProtocolType::Rps,
                "t1",
                ts(10),
            )]))
            .await;

        let mut blank = item("ABCDEFGH12345678", ProtocolType::Rps, "t1", ts(10));
        blank.location = Some(String::new());
        let stats = reconciler.apply(&batch_with(vec![blank])).await;

        assert_eq!(stats.devices.noop, 1);
        let device = store.get_device("ABCDEFGH12345678").await.unwrap().unwrap();
        assert_eq!(device.location.as_deref(), Some("site-a"));
    }

    #[tokio::test]
    async fn one_bad_item_does_not_roll_back_siblings() {
        let store = Arc::new(FailOn {
            inner: InMemoryRegistry::new(),
            fail_serial: "FAILFAILFAIL1234".to_string(),
            conflicts_left: Mutex::new(0),
        });
        let reconciler = Reconciler::new(store.clone());
        let batch = batch_with(vec![
            item("ABCDEFGH12345678", ProtocolType::Rps, "t1", ts(10)),
            item("FAILFAILFAIL1234", ProtocolType::Rps, "t1", ts(10)),
            item("ZYXWVUTS87654321", ProtocolType::Css, "t2", ts(10)),
        ]);

        let stats = reconciler.apply(&batch).await;

        assert_eq!(stats.devices.created, 2);
        assert_eq!(stats.errors.len(), 1);
        assert_eq!(stats.errors[0].index, 1);
        assert_eq!(store.inner.device_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn uniqueness_race_is_retried_once_and_succeeds() {
        let store = Arc::new(FailOn {
            inner: InMemoryRegistry::new(),
            fail_serial: String::new(),
            conflicts_left: Mutex::new(1),
        });
        let reconciler = Reconciler::new(store.clone());
        let batch = batch_with(vec![item("ABCDEFGH12345678", ProtocolType::Rps, "t1", ts(10))]);

        let stats = reconciler.apply(&batch).await;

        assert!(stats.errors.is_empty());
        assert_eq!(stats.devices.created, 1);
        assert_eq!(store.inner.device_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn persistent_conflict_becomes_item_error() {
        let store = Arc::new(FailOn {
            inner: InMemoryRegistry::new(),
            fail_serial: String::new(),
            conflicts_left: Mutex::new(2),
        });
        let reconciler = Reconciler::new(store.clone());
        let batch = batch_with(vec![item("ABCDEFGH12345678", ProtocolType::Rps, "t1", ts(10))]);

        let stats = reconciler.apply(&batch).await;

        assert_eq!(stats.errors.len(), 1);
        assert_eq!(stats.devices.created, 0);
    }

    /// Store wrapper that injects failures: a serial that always errors and
    /// a countdown of uniqueness conflicts on device creation.
    struct FailOn {
        inner: InMemoryRegistry,
        fail_serial: String,
        conflicts_left: Mutex<u32>,
    }

    #[async_trait]
    impl RegistryStore for FailOn {
        async fn get_or_create_device(
            &self,
            serial_number: &str,
            location: Option<&str>,
        ) -> crate::error::Result<(Device, bool)> {
            if serial_number == self.fail_serial {
                return Err(IngestError::Storage("simulated storage failure".to_string()));
            }
            {
                let mut left = self.conflicts_left.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return Err(IngestError::Conflict(format!(
                        "duplicate key on device '{}'",
                        serial_number
                    )));
                }
            }
            self.inner.get_or_create_device(serial_number, location).await
        }

        async fn update_device_location(
            &self,
            device_id: Uuid,
            location: &str,
        ) -> crate::error::Result<()> {
            self.inner.update_device_location(device_id, location).await
        }

        async fn get_or_create_protocol(
            &self,
            device_id: Uuid,
            protocol_type: ProtocolType,
            binding: &ProtocolBinding,
        ) -> crate::error::Result<(DeviceProtocol, bool)> {
            self.inner
                .get_or_create_protocol(device_id, protocol_type, binding)
                .await
        }

        async fn update_protocol_binding(
            &self,
            protocol_id: Uuid,
            binding: &ProtocolBinding,
        ) -> crate::error::Result<()> {
            self.inner.update_protocol_binding(protocol_id, binding).await
        }

        async fn get_device(&self, serial_number: &str) -> crate::error::Result<Option<Device>> {
            self.inner.get_device(serial_number).await
        }

        async fn get_protocol(
            &self,
            device_id: Uuid,
            protocol_type: ProtocolType,
        ) -> crate::error::Result<Option<DeviceProtocol>> {
            self.inner.get_protocol(device_id, protocol_type).await
        }

        async fn device_count(&self) -> crate::error::Result<usize> {
            self.inner.device_count().await
        }

        async fn protocol_count(&self) -> crate::error::Result<usize> {
            self.inner.protocol_count().await
        }
    }
}
