//! Gateway auto-registration
//!
//! Any MAC that shows up on a gateway topic becomes a `BleGateway` device.
//! Registration is idempotent: the store enforces one row per canonical MAC
//! and a lost insert race is resolved by re-reading the winner.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::domain::mac;
use crate::domain::types::{Device, DeviceId, DeviceKind, NewDevice};
use crate::infra::metrics::Metrics;
use crate::io::webhook::WebhookSender;
use crate::services::location::{LocationResolver, ResolvedLocation};
use crate::store::{Store, StoreError, StoreResult};

pub const GATEWAY_REGISTERED: &str = "GATEWAY_REGISTERED";

pub struct GatewayRegistry {
    store: Arc<dyn Store>,
    locations: LocationResolver,
    metrics: Arc<Metrics>,
    webhooks: Option<WebhookSender>,
}

impl GatewayRegistry {
    pub fn new(store: Arc<dyn Store>, metrics: Arc<Metrics>) -> Self {
        Self { locations: LocationResolver::new(store.clone()), store, metrics, webhooks: None }
    }

    /// Emit `GATEWAY_REGISTERED` through `sender` when a gateway is created
    pub fn with_webhooks(mut self, sender: WebhookSender) -> Self {
        self.webhooks = Some(sender);
        self
    }

    /// Return the device for `raw_mac`, creating it on first sight.
    ///
    /// `building` and `floor` are topic segments, resolved only when the
    /// gateway is created. An existing device keeps its location; only a
    /// drifted kind is corrected back to `BleGateway`.
    pub async fn resolve_or_create(
        &self,
        raw_mac: &str,
        building: Option<&str>,
        floor: Option<&str>,
    ) -> StoreResult<Device> {
        let candidates = mac::candidates(raw_mac);
        if let Some(device) = self.store.find_device_by_mac(&candidates).await? {
            return self.ensure_gateway_kind(device).await;
        }

        let canonical = mac::normalize(raw_mac)
            .ok_or_else(|| StoreError::InvalidInput(format!("gateway mac {raw_mac:?}")))?;
        let location = match self.locations.resolve(building, floor).await {
            Ok(location) => location,
            Err(e) => {
                warn!(mac = %canonical, error = %e, "gateway_location_resolve_failed");
                ResolvedLocation::default()
            }
        };
        let stored_mac = mac::to_colon(&canonical).unwrap_or_else(|| canonical.clone());

        let draft = NewDevice {
            name: format!("Gateway {stored_mac}"),
            code: Some(format!("GW-{canonical}")),
            mac: stored_mac,
            kind: DeviceKind::BleGateway,
            building_id: location.building_id,
            floor_id: location.floor_id,
            last_seen_at: None,
        };

        match self.store.insert_device(draft).await {
            Ok(device) => {
                self.metrics.record_gateway_registered();
                info!(
                    device_id = %device.id,
                    mac = %device.mac,
                    building_id = ?device.building_id,
                    floor_id = ?device.floor_id,
                    "gateway_registered"
                );
                if let Some(webhooks) = &self.webhooks {
                    webhooks.dispatch(GATEWAY_REGISTERED, registered_payload(&device));
                }
                Ok(device)
            }
            Err(StoreError::UniqueViolation(_)) => {
                debug!(mac = %canonical, "gateway_insert_race_refetch");
                self.store
                    .find_device_by_mac(&candidates)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(format!("gateway {canonical}")))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn touch_last_seen(&self, id: DeviceId, now: DateTime<Utc>) -> StoreResult<()> {
        self.store.touch_device(id, now).await
    }

    async fn ensure_gateway_kind(&self, mut device: Device) -> StoreResult<Device> {
        if !device.kind.is_gateway() {
            warn!(device_id = %device.id, kind = ?device.kind, "gateway_kind_corrected");
            self.store.set_device_kind(device.id, DeviceKind::BleGateway).await?;
            device.kind = DeviceKind::BleGateway;
        }
        Ok(device)
    }
}

fn registered_payload(device: &Device) -> serde_json::Value {
    json!({
        "device_id": device.id.0,
        "mac": device.mac,
        "name": device.name,
        "code": device.code,
        "building_id": device.building_id.map(|v| v.0),
        "floor_id": device.floor_id.map(|v| v.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Building, BuildingId, Floor, FloorId};
    use crate::io::webhook::webhook_channel;
    use crate::store::MemoryStore;

    fn registry(store: Arc<MemoryStore>) -> GatewayRegistry {
        GatewayRegistry::new(store, Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn test_creates_once_for_any_spelling() {
        let store = Arc::new(MemoryStore::new());
        store.add_building(Building {
            id: BuildingId(1),
            name: "Head Office".into(),
            code: Some("HQ".into()),
        });
        store.add_floor(Floor {
            id: FloorId(2),
            building_id: BuildingId(1),
            name: "First".into(),
            level: Some(1),
        });
        let registry = registry(store.clone());

        let first = registry.resolve_or_create("ac233fc0ffee", Some("hq"), Some("1")).await.unwrap();
        assert_eq!(first.mac, "AC:23:3F:C0:FF:EE");
        assert_eq!(first.name, "Gateway AC:23:3F:C0:FF:EE");
        assert_eq!(first.code.as_deref(), Some("GW-AC233FC0FFEE"));
        assert_eq!(first.building_id, Some(BuildingId(1)));
        assert!(first.pos_x.is_none());

        let second = registry.resolve_or_create("AC-23-3F-C0-FF-EE", None, None).await.unwrap();
        assert_eq!(second.id, first.id);
        // location is never rewritten for an existing gateway
        assert_eq!(second.floor_id, Some(FloorId(2)));
        assert_eq!(store.devices().len(), 1);
    }

    #[tokio::test]
    async fn test_kind_drift_is_corrected() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        let device = registry.resolve_or_create("AABBCCDDEEFF", None, None).await.unwrap();
        store.set_device_kind(device.id, DeviceKind::Camera).await.unwrap();

        let again = registry.resolve_or_create("AABBCCDDEEFF", None, None).await.unwrap();
        assert_eq!(again.kind, DeviceKind::BleGateway);
        assert_eq!(store.devices()[0].kind, DeviceKind::BleGateway);
    }

    #[tokio::test]
    async fn test_concurrent_registration_single_row() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(registry(store.clone()));

        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            let spelling = if i % 2 == 0 { "aa:bb:cc:dd:ee:01" } else { "AABBCCDDEE01" };
            handles.push(tokio::spawn(async move {
                registry.resolve_or_create(spelling, None, None).await.unwrap().id
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.devices().len(), 1);
    }

    #[tokio::test]
    async fn test_registration_emits_domain_event() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(Metrics::new());
        let (sender, mut rx) = webhook_channel(8, metrics.clone());
        let registry = GatewayRegistry::new(store, metrics).with_webhooks(sender);

        registry.resolve_or_create("AABBCCDDEE02", None, None).await.unwrap();
        registry.resolve_or_create("AABBCCDDEE02", None, None).await.unwrap();

        let job = rx.try_recv().unwrap();
        assert_eq!(job.event_type, GATEWAY_REGISTERED);
        assert_eq!(job.payload["code"], "GW-AABBCCDDEE02");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rejects_mac_without_hex() {
        let registry = registry(Arc::new(MemoryStore::new()));
        let err = registry.resolve_or_create("zz-zz", None, None).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_touch_last_seen() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        let device = registry.resolve_or_create("AABBCCDDEE03", None, None).await.unwrap();
        let now = Utc::now();
        registry.touch_last_seen(device.id, now).await.unwrap();
        assert_eq!(store.devices()[0].last_seen_at, Some(now));
    }
}
