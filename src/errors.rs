use std::io;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ScaleError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] BluetoothError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("cycle exceeded its budget of {0:?}")]
    CycleTimeout(Duration),
    #[error("no data received from scale")]
    NoDataReceived,
}

#[derive(Debug, Error)]
pub enum BluetoothError {
    #[error("invalid device address: {0}")]
    InvalidAddress(String),
    #[error("device not reachable: {mac}")]
    Unreachable { mac: String },
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("characteristic {uuid} not found")]
    CharacteristicMissing { uuid: Uuid },
    #[error("notification registration failed: {0}")]
    NotifyRegistration(String),
    #[error("gatt operation failed: {0}")]
    Gatt(String),
}

pub type Result<T> = std::result::Result<T, ScaleError>;
