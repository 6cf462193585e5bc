//! BlueZ GATT backend (requires the `bluez` feature).
//!
//! [`BlePumpConnector`] finds the pump by MAC address and hands back a
//! [`BluerTransport`]; the dispatcher drives the actual connection through
//! the [`GattTransport`] trait.

use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic as RemoteCharacteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, Session};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::config::ConnectorConfig;
use crate::errors::{BluetoothError, DriverError, Result};
use crate::protocol::Characteristic;
use crate::transport::{GattTransport, NotificationStream};

const SERVICE_RESOLVE_POLL_MS: u64 = 100;

/// Locates the pump controller through the default BlueZ adapter.
#[derive(Debug, Clone, Default)]
pub struct BlePumpConnector {
    pub config: ConnectorConfig,
}

impl BlePumpConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        Self { config }
    }

    /// Power the adapter and scan until `mac` shows up.
    ///
    /// The returned transport is not connected yet.
    pub async fn find(&self, mac: &str) -> Result<BluerTransport> {
        let address = parse_address(mac)?;
        let session = Session::new().await.map_err(connection_error)?;
        let adapter = session.default_adapter().await.map_err(connection_error)?;
        adapter.set_powered(true).await.map_err(connection_error)?;
        info!("using adapter {}", adapter.name());

        wait_for_device(&adapter, address, self.config.scan_timeout).await?;
        let device = adapter.device(address).map_err(connection_error)?;

        Ok(BluerTransport {
            _session: session,
            device,
            config: self.config.clone(),
            characteristics: tokio::sync::Mutex::new(std::array::from_fn(|_| None)),
        })
    }
}

/// A pump reachable over BlueZ.
pub struct BluerTransport {
    _session: Session,
    device: Device,
    config: ConnectorConfig,
    /// Resolved on connect, indexed by `Characteristic::index`.
    characteristics: tokio::sync::Mutex<[Option<RemoteCharacteristic>; Characteristic::COUNT]>,
}

impl BluerTransport {
    pub fn address(&self) -> Address {
        self.device.address()
    }

    async fn connect_with_retry(&self) -> std::result::Result<(), BluetoothError> {
        let mac = self.device.address();
        let mut last_error = None;
        for attempt in 0..self.config.max_retries.max(1) {
            if attempt > 0 {
                let delay = self.config.retry_delay * (1 << (attempt - 1).min(3));
                warn!(
                    "retrying GATT connection after {:?} (mac={}, attempt={})",
                    delay, mac, attempt
                );
                tokio::time::sleep(delay).await;
            }

            if self.device.is_connected().await.unwrap_or(false) {
                return Ok(());
            }
            match tokio::time::timeout(self.config.connect_timeout, self.device.connect()).await {
                Ok(Ok(())) => {
                    info!("GATT connection established: mac={}", mac);
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(
                        "GATT connection attempt failed: mac={}, attempt={}, error={}",
                        mac, attempt, e
                    );
                    last_error = Some(BluetoothError::Connection(e.to_string()));
                }
                Err(_) => {
                    warn!("GATT connection attempt timed out: mac={}", mac);
                    last_error = Some(BluetoothError::Connection("connect timed out".into()));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| BluetoothError::NotConnected("max retries exceeded".into())))
    }

    async fn resolve_characteristics(
        &self,
    ) -> std::result::Result<[Option<RemoteCharacteristic>; Characteristic::COUNT], BluetoothError>
    {
        let resolved = async {
            while !self.device.is_services_resolved().await.unwrap_or(false) {
                tokio::time::sleep(Duration::from_millis(SERVICE_RESOLVE_POLL_MS)).await;
            }
        };
        tokio::time::timeout(self.config.connect_timeout, resolved)
            .await
            .map_err(|_| BluetoothError::Connection("service discovery timed out".into()))?;

        let mut found: [Option<RemoteCharacteristic>; Characteristic::COUNT] =
            std::array::from_fn(|_| None);
        for service in self.device.services().await.map_err(gatt_error)? {
            for remote in service.characteristics().await.map_err(gatt_error)? {
                let uuid = remote.uuid().await.map_err(gatt_error)?;
                if let Some(characteristic) = Characteristic::from_uuid(uuid) {
                    debug!("resolved {}", characteristic);
                    found[characteristic.index()] = Some(remote);
                }
            }
        }

        if let Some(missing) = Characteristic::ALL
            .into_iter()
            .find(|c| found[c.index()].is_none())
        {
            return Err(BluetoothError::CharacteristicNotFound {
                uuid: missing.uuid(),
            });
        }
        Ok(found)
    }

    async fn remote(
        &self,
        characteristic: Characteristic,
    ) -> std::result::Result<RemoteCharacteristic, BluetoothError> {
        self.characteristics.lock().await[characteristic.index()]
            .clone()
            .ok_or_else(|| BluetoothError::NotConnected(format!("{characteristic} not resolved")))
    }

    /// Classify a failed GATT operation: a dropped link is `NotConnected`.
    async fn operation_error(&self, e: bluer::Error) -> BluetoothError {
        if self.device.is_connected().await.unwrap_or(false) {
            BluetoothError::Gatt(e.to_string())
        } else {
            BluetoothError::NotConnected(e.to_string())
        }
    }
}

#[async_trait]
impl GattTransport for BluerTransport {
    async fn connect(&self) -> std::result::Result<(), BluetoothError> {
        self.connect_with_retry().await?;
        let found = self.resolve_characteristics().await?;
        *self.characteristics.lock().await = found;
        Ok(())
    }

    async fn disconnect(&self) -> std::result::Result<(), BluetoothError> {
        *self.characteristics.lock().await = std::array::from_fn(|_| None);
        self.device
            .disconnect()
            .await
            .map_err(|e| BluetoothError::Connection(e.to_string()))
    }

    async fn write(
        &self,
        characteristic: Characteristic,
        payload: &[u8],
    ) -> std::result::Result<(), BluetoothError> {
        let remote = self.remote(characteristic).await?;
        match remote.write(payload).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.operation_error(e).await),
        }
    }

    async fn subscribe(
        &self,
        characteristic: Characteristic,
    ) -> std::result::Result<NotificationStream, BluetoothError> {
        let remote = self.remote(characteristic).await?;
        let (ready_tx, ready_rx) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel();

        // The notify stream borrows the characteristic, so both live in one task.
        tokio::spawn(async move {
            let stream = match remote.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            futures::pin_mut!(stream);
            while let Some(value) = stream.next().await {
                if tx.send(value).is_err() {
                    return;
                }
            }
            debug!("{} notifications ended", characteristic);
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(Box::pin(UnboundedReceiverStream::new(rx))),
            Ok(Err(e)) => Err(self.operation_error(e).await),
            Err(_) => Err(BluetoothError::NotConnected(format!(
                "{characteristic} subscription dropped"
            ))),
        }
    }
}

async fn wait_for_device(adapter: &Adapter, address: Address, timeout: Duration) -> Result<()> {
    let mut events = adapter.discover_devices().await.map_err(connection_error)?;

    let found = tokio::time::timeout(timeout, async {
        while let Some(evt) = events.next().await {
            if let AdapterEvent::DeviceAdded(addr) = evt {
                if addr == address {
                    info!("device discovered: mac={}", addr);
                    return true;
                }
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    if found {
        Ok(())
    } else {
        Err(DriverError::Bluetooth(BluetoothError::NotFound {
            mac: address.to_string(),
        }))
    }
}

fn parse_address(mac: &str) -> Result<Address> {
    mac.trim().parse().map_err(|_| {
        DriverError::Bluetooth(BluetoothError::Connection(format!("invalid mac '{mac}'")))
    })
}

fn connection_error(e: bluer::Error) -> DriverError {
    DriverError::Bluetooth(BluetoothError::Connection(e.to_string()))
}

fn gatt_error(e: bluer::Error) -> BluetoothError {
    BluetoothError::Gatt(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mac_addresses() {
        let address = parse_address(" 24:0A:C4:12:34:56 ").unwrap();
        assert_eq!(address.to_string(), "24:0A:C4:12:34:56");
        assert!(matches!(
            parse_address("24:0A:C4"),
            Err(DriverError::Bluetooth(BluetoothError::Connection(_)))
        ));
    }
}
