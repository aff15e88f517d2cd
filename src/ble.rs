//! Bluetooth Low Energy transport built on bluest.
//!
//! The BMS exposes one GATT service with a notify characteristic carrying response
//! frames and a write characteristic accepting command frames.

use bluest::Adapter;
use bluest::AdvertisingDevice;
use bluest::Characteristic;
use bluest::ConnectionEvent;
use bluest::Device;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::config::BleConfig;
use crate::error::{BmsError, Result};
use crate::frame::Frame;
use crate::transport::{Connector, Link, NotificationStream, WriteEndpoint};

fn connect_failure(err: impl std::fmt::Display) -> BmsError {
    BmsError::ConnectFailure(err.to_string())
}

/// Writes command frames to the write characteristic.
#[derive(Debug, Clone)]
pub struct BleWriter {
    characteristic: Characteristic,
}

impl WriteEndpoint for BleWriter {
    async fn write(&mut self, frame: &Frame) -> Result<()> {
        self.characteristic
            .write(frame.as_ref())
            .await
            .map_err(|err| BmsError::TransportWrite(err.to_string()))
    }
}

/// Connects to one discovered BMS. Reconnects reuse the same device handle.
pub struct BleConnector {
    adapter: Adapter,
    device: Device,
    config: BleConfig,
}

impl BleConnector {
    /// Find the BMS, which includes waiting for the adapter and scanning.
    pub async fn discover(config: BleConfig) -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| connect_failure("Default adapter not found"))?;
        adapter.wait_available().await.map_err(connect_failure)?;

        let device = timeout(config.discovery_timeout, Self::discover_device(&adapter, &config))
            .await
            .map_err(|_| connect_failure("Device not found"))??;
        tracing::info!(name = ?config.device_name, id = ?device.device.id(), "found BMS");

        Ok(Self {
            adapter,
            device: device.device,
            config,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    async fn discover_device(adapter: &Adapter, config: &BleConfig) -> Result<AdvertisingDevice> {
        let required_services = [config.service_uuid];
        let mut adapter_events = adapter.scan(&required_services).await.map_err(connect_failure)?;
        while let Some(device) = adapter_events.next().await {
            let Some(wanted) = &config.device_name else {
                return Ok(device);
            };
            match device.device.name_async().await {
                Ok(name) if &name == wanted => return Ok(device),
                Ok(name) => tracing::debug!(%name, "ignoring device"),
                Err(err) => tracing::debug!(%err, "device without name"),
            }
        }

        Err(connect_failure("Device not found"))
    }

    async fn resolve_characteristics(&self) -> Result<(Characteristic, Characteristic)> {
        let service = self
            .device
            .discover_services_with_uuid(self.config.service_uuid)
            .await
            .map_err(connect_failure)?
            .first()
            .ok_or_else(|| connect_failure("The device does not offer the BMS service"))?
            .clone();
        let write = service
            .discover_characteristics_with_uuid(self.config.write_characteristic_uuid)
            .await
            .map_err(connect_failure)?
            .first()
            .ok_or_else(|| connect_failure("The device does not offer the BMS write characteristic"))?
            .clone();
        let notify = service
            .discover_characteristics_with_uuid(self.config.notify_characteristic_uuid)
            .await
            .map_err(connect_failure)?
            .first()
            .ok_or_else(|| connect_failure("The device does not offer the BMS notify characteristic"))?
            .clone();
        Ok((write, notify))
    }
}

impl Connector for BleConnector {
    type Writer = BleWriter;

    async fn connect(&mut self) -> Result<Link<BleWriter>> {
        if !self.device.is_connected().await {
            self.adapter
                .connect_device(&self.device)
                .await
                .map_err(connect_failure)?;
        }
        let (write, notify) = self.resolve_characteristics().await?;

        let (tx, notifications) = NotificationStream::channel(self.config.notification_capacity);
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(forward_notifications(
            self.adapter.clone(),
            self.device.clone(),
            notify,
            ready_tx,
            tx,
        ));
        ready_rx
            .await
            .map_err(|_| connect_failure("notification task ended before subscribing"))??;

        Ok(Link::new(BleWriter { characteristic: write }, notifications))
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.adapter
            .disconnect_device(&self.device)
            .await
            .map_err(connect_failure)
    }
}

/// Subscribe to `notify` and pass every notification on until the device
/// disconnects or the receiving side goes away. Dropping the subscription
/// stream on exit unsubscribes.
async fn forward_notifications(
    adapter: Adapter,
    device: Device,
    notify: Characteristic,
    ready: oneshot::Sender<Result<()>>,
    tx: mpsc::Sender<Result<Vec<u8>>>,
) {
    let mut connection_events = match adapter.device_connection_events(&device).await {
        Ok(events) => events,
        Err(err) => {
            let _ = ready.send(Err(connect_failure(err)));
            return;
        }
    };
    let mut notifications = match notify.notify().await {
        Ok(notifications) => notifications,
        Err(err) => {
            let _ = ready.send(Err(connect_failure(err)));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }

    loop {
        tokio::select! {
            item = notifications.next() => match item {
                Some(Ok(data)) => {
                    if tx.send(Ok(data)).await.is_err() {
                        break;
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(%err, "notification error");
                    let _ = tx.send(Err(BmsError::UnexpectedDisconnect(err.to_string()))).await;
                    break;
                }
                None => break,
            },
            event = connection_events.next() => {
                if matches!(event, Some(ConnectionEvent::Disconnected) | None) {
                    tracing::info!("device disconnected");
                    break;
                }
            }
            _ = tx.closed() => break,
        }
    }
}
