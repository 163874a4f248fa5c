use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::errors::BluetoothError;

#[cfg(feature = "bluez")]
pub use self::bluez::{BluezConnector, BluezLink};

const SCAN_TIMEOUT_SECS: u64 = 15;
const CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_IO_TIMEOUT_SECS: u64 = 5;
const MAX_CONNECT_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 500;

/// Bluetooth device address, the only thing needed to reach the scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for DeviceAddress {
    type Err = BluetoothError;

    /// Parses `AA:BB:CC:DD:EE:FF` (either case).
    fn from_str(mac: &str) -> Result<Self, Self::Err> {
        let invalid = || BluetoothError::InvalidAddress(mac.to_string());

        let parts: Vec<&str> = mac.trim().split(':').collect();
        if parts.len() != 6 {
            return Err(invalid());
        }

        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(&parts) {
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// Notification payloads in arrival order.
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

/// An open connection to the scale's measurement characteristic.
///
/// Every operation is expected to give up on its own after a transport
/// timeout.
#[async_trait]
pub trait GattLink: Send {
    async fn write(&mut self, data: &[u8], mode: WriteMode) -> Result<(), BluetoothError>;

    /// Start notifications. Dropping the stream stops delivery.
    async fn subscribe(&mut self) -> Result<NotificationStream, BluetoothError>;

    async fn unsubscribe(&mut self) -> Result<(), BluetoothError>;

    /// Direct read of the characteristic value.
    async fn read(&mut self) -> Result<Vec<u8>, BluetoothError>;

    async fn disconnect(&mut self) -> Result<(), BluetoothError>;
}

/// Discovery and connection, provided by the host platform.
#[async_trait]
pub trait Connector: Send + Sync {
    type Peer: Send;
    type Link: GattLink + 'static;

    /// Look the device up. `Ok(None)` means it is not reachable right now.
    async fn resolve(&self, address: &DeviceAddress) -> Result<Option<Self::Peer>, BluetoothError>;

    /// Connect and locate the measurement characteristic. On failure nothing
    /// is left connected.
    async fn connect(&self, peer: Self::Peer) -> Result<Self::Link, BluetoothError>;
}

/// Timeouts and retry policy for [`Connector`] implementations.
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(SCAN_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            io_timeout: Duration::from_secs(DEFAULT_IO_TIMEOUT_SECS),
            max_retries: MAX_CONNECT_RETRIES,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        }
    }
}

impl ConnectorSettings {
    /// Exponential backoff before retry `attempt` (1-based), capped at 8x.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay * (1 << attempt.saturating_sub(1).min(3))
    }
}

#[cfg(feature = "bluez")]
mod bluez {
    use std::future::Future;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest};
    use bluer::gatt::WriteOp;
    use bluer::{Adapter, AdapterEvent, Address, Device, Session};
    use futures::StreamExt;
    use log::{debug, info, warn};

    use super::{Connector, ConnectorSettings, DeviceAddress, GattLink, NotificationStream, WriteMode};
    use crate::errors::BluetoothError;
    use crate::protocol::{MEASUREMENT_CHARACTERISTIC_UUID, SERVICE_UUID};

    const SERVICES_POLL: Duration = Duration::from_millis(100);

    impl From<DeviceAddress> for Address {
        fn from(address: DeviceAddress) -> Self {
            Address::new(address.octets())
        }
    }

    /// BlueZ-backed connector.
    pub struct BluezConnector {
        _session: Session,
        adapter: Adapter,
        pub settings: ConnectorSettings,
    }

    impl BluezConnector {
        /// Open a BlueZ session on the default adapter and power it on.
        pub async fn new(settings: ConnectorSettings) -> Result<Self, BluetoothError> {
            let session = Session::new()
                .await
                .map_err(|e| BluetoothError::Connection(e.to_string()))?;
            let adapter = session
                .default_adapter()
                .await
                .map_err(|e| BluetoothError::Connection(e.to_string()))?;
            adapter
                .set_powered(true)
                .await
                .map_err(|e| BluetoothError::Connection(e.to_string()))?;
            info!("bluez adapter ready: name={}", adapter.name());

            Ok(Self {
                _session: session,
                adapter,
                settings,
            })
        }

        async fn connect_once(&self, device: &Device) -> Result<(), BluetoothError> {
            if device.is_connected().await.unwrap_or(false) {
                return Ok(());
            }
            with_timeout(self.settings.connect_timeout, "connect", device.connect())
                .await
                .map_err(|e| match e {
                    BluetoothError::Gatt(msg) => BluetoothError::Connection(msg),
                    other => other,
                })
        }

        async fn find_characteristic(&self, device: &Device) -> Result<Characteristic, BluetoothError> {
            let deadline = Instant::now() + self.settings.io_timeout;
            while !device.is_services_resolved().await.unwrap_or(false) {
                if Instant::now() > deadline {
                    break;
                }
                tokio::time::sleep(SERVICES_POLL).await;
            }

            let missing = || BluetoothError::CharacteristicMissing {
                uuid: MEASUREMENT_CHARACTERISTIC_UUID,
            };

            let services = device.services().await.map_err(|_| missing())?;
            for service in services {
                if service.uuid().await.ok() != Some(SERVICE_UUID) {
                    continue;
                }
                for characteristic in service.characteristics().await.map_err(|_| missing())? {
                    if characteristic.uuid().await.ok() == Some(MEASUREMENT_CHARACTERISTIC_UUID) {
                        return Ok(characteristic);
                    }
                }
            }
            Err(missing())
        }
    }

    #[async_trait]
    impl Connector for BluezConnector {
        type Peer = Device;
        type Link = BluezLink;

        async fn resolve(&self, address: &DeviceAddress) -> Result<Option<Device>, BluetoothError> {
            let target: Address = (*address).into();
            let known = self
                .adapter
                .device_addresses()
                .await
                .map_err(|e| BluetoothError::Connection(e.to_string()))?;

            if !known.contains(&target) {
                debug!("device not cached, scanning: mac={}", address);
                if !wait_for_device(&self.adapter, target, self.settings.scan_timeout).await? {
                    return Ok(None);
                }
            }

            self.adapter
                .device(target)
                .map(Some)
                .map_err(|e| BluetoothError::Connection(e.to_string()))
        }

        async fn connect(&self, device: Device) -> Result<BluezLink, BluetoothError> {
            let mac = device.address();
            let mut last_error = None;
            for attempt in 0..self.settings.max_retries {
                if attempt > 0 {
                    let delay = self.settings.backoff(attempt);
                    warn!(
                        "retrying connection after {:?} (mac={}, attempt={})",
                        delay, mac, attempt
                    );
                    tokio::time::sleep(delay).await;
                }

                match self.connect_once(&device).await {
                    Ok(()) => {
                        info!("connected: mac={}", mac);
                        last_error = None;
                        break;
                    }
                    Err(e) => {
                        warn!(
                            "connection attempt failed: mac={}, attempt={}, error={}",
                            mac, attempt, e
                        );
                        last_error = Some(e);
                    }
                }
            }
            if let Some(e) = last_error {
                return Err(e);
            }

            match self.find_characteristic(&device).await {
                Ok(characteristic) => Ok(BluezLink {
                    device,
                    characteristic,
                    io_timeout: self.settings.io_timeout,
                }),
                Err(e) => {
                    let _ = device.disconnect().await;
                    Err(e)
                }
            }
        }
    }

    /// Connected device plus its measurement characteristic.
    pub struct BluezLink {
        device: Device,
        characteristic: Characteristic,
        io_timeout: Duration,
    }

    #[async_trait]
    impl GattLink for BluezLink {
        async fn write(&mut self, data: &[u8], mode: WriteMode) -> Result<(), BluetoothError> {
            let request = CharacteristicWriteRequest {
                op_type: match mode {
                    WriteMode::WithResponse => WriteOp::Request,
                    WriteMode::WithoutResponse => WriteOp::Command,
                },
                ..Default::default()
            };
            with_timeout(
                self.io_timeout,
                "write",
                self.characteristic.write_ext(data, &request),
            )
            .await
        }

        async fn subscribe(&mut self) -> Result<NotificationStream, BluetoothError> {
            let stream = with_timeout(self.io_timeout, "notify", self.characteristic.notify())
                .await
                .map_err(|e| BluetoothError::NotifyRegistration(e.to_string()))?;
            Ok(Box::pin(stream))
        }

        async fn unsubscribe(&mut self) -> Result<(), BluetoothError> {
            // bluer stops notifying once the stream returned by subscribe is dropped
            Ok(())
        }

        async fn read(&mut self) -> Result<Vec<u8>, BluetoothError> {
            with_timeout(self.io_timeout, "read", self.characteristic.read()).await
        }

        async fn disconnect(&mut self) -> Result<(), BluetoothError> {
            if !self.device.is_connected().await.unwrap_or(true) {
                return Ok(());
            }
            with_timeout(self.io_timeout, "disconnect", self.device.disconnect()).await
        }
    }

    async fn with_timeout<T>(
        timeout: Duration,
        what: &str,
        fut: impl Future<Output = bluer::Result<T>>,
    ) -> Result<T, BluetoothError> {
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| BluetoothError::Timeout(format!("{what} timed out after {timeout:?}")))?
            .map_err(|e| BluetoothError::Gatt(format!("{what}: {e}")))
    }

    async fn wait_for_device(
        adapter: &Adapter,
        address: Address,
        timeout: Duration,
    ) -> Result<bool, BluetoothError> {
        let events = adapter
            .discover_devices()
            .await
            .map_err(|e| BluetoothError::Connection(e.to_string()))?;
        futures::pin_mut!(events);

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

        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_normalises_addresses() {
        let address: DeviceAddress = "c8:b2:1e:0a:ff:01".parse().unwrap();
        assert_eq!(address.octets(), [0xC8, 0xB2, 0x1E, 0x0A, 0xFF, 0x01]);
        assert_eq!(address.to_string(), "C8:B2:1E:0A:FF:01");
    }

    #[test]
    fn rejects_malformed_addresses() {
        for bad in [
            "",
            "C8:B2:1E:0A:FF",
            "C8:B2:1E:0A:FF:01:02",
            "C8-B2-1E-0A-FF-01",
            "C8:B2:1E:0A:FF:G1",
            "C8:B2:1E:0A:FF:1",
            "C8:B2:1E:0A:FF:+1",
        ] {
            let err = bad.parse::<DeviceAddress>().unwrap_err();
            assert!(matches!(err, BluetoothError::InvalidAddress(_)), "{bad}");
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let settings = ConnectorSettings {
            retry_delay: Duration::from_millis(100),
            ..Default::default()
        };
        assert_eq!(settings.backoff(1), Duration::from_millis(100));
        assert_eq!(settings.backoff(2), Duration::from_millis(200));
        assert_eq!(settings.backoff(3), Duration::from_millis(400));
        assert_eq!(settings.backoff(4), Duration::from_millis(800));
        assert_eq!(settings.backoff(9), Duration::from_millis(800));
    }
}
