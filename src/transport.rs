//! The BLE stack seen from the driver: write a characteristic, subscribe
//! to notifications. Link-layer concerns (discovery, pairing, MTU) live
//! below this trait.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::errors::BluetoothError;
use crate::protocol::Characteristic;

/// Raw notification payloads. The stream ending means the link dropped.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

#[async_trait]
pub trait GattTransport: Send + Sync {
    /// Bring the link up; returns once characteristics are addressable.
    async fn connect(&self) -> Result<(), BluetoothError>;

    async fn disconnect(&self) -> Result<(), BluetoothError>;

    /// Write with response. May hang if the peripheral goes silent; callers bound it.
    async fn write(&self, characteristic: Characteristic, payload: &[u8])
        -> Result<(), BluetoothError>;

    async fn subscribe(
        &self,
        characteristic: Characteristic,
    ) -> Result<NotificationStream, BluetoothError>;
}
