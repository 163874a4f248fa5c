//! Beurer BF 915 scale driver with optional Python bindings.
//!
//! The scale keeps up to eight user slots. Each update cycle connects over
//! Bluetooth LE, sends an init command and one query per configured user, and
//! decodes whatever notification frames come back into per-user
//! body-composition readings.
//!
//! # Reading the scale
//!
//! ```ignore
//! let config = ScaleConfig::load("scale.toml")?;
//! let connector = BluezConnector::new(ConnectorSettings::default()).await?;
//! let scale = Scale::new(config.device_address()?, config.roster()?, connector)
//!     .with_timing(config.timing.session());
//!
//! let readings = scale.run_cycle().await;
//! println!("user 1 weighs {} kg", readings[&1].weight_kg);
//! ```
//!
//! `run_cycle` never fails. When the scale is asleep or out of range the
//! previous readings come back unchanged and [`Scale::last_error`] says why.
//!
//! # Frame decoding
//!
//! The measurement frame format is not documented by the vendor. The decoder
//! scans a fixed, ordered list of candidate offsets and keeps the first value
//! that falls into a plausible range; see [`decoder`] for the exact policy.

pub mod bluetooth;
pub mod config;
pub mod decoder;
mod errors;
pub mod logging;
pub mod observer;
pub mod protocol;
pub mod scale;
pub mod session;
pub mod store;

#[cfg(feature = "bluez")]
pub use bluetooth::{BluezConnector, BluezLink};
pub use bluetooth::{Connector, ConnectorSettings, DeviceAddress, GattLink, NotificationStream, WriteMode};
pub use config::{Gender, Roster, ScaleConfig, SessionTiming, TimingConfig, UserProfile};
pub use decoder::{decode_frame, Decoded, FieldOutcome, Reading};
pub use errors::*;
pub use observer::{FrameSource, LogObserver, SessionEvent, SessionObserver, SessionPhase};
pub use scale::Scale;
pub use session::{FallbackRead, Session, SessionReport};
pub use store::{MeasurementSnapshot, MeasurementStore, MeasurementUpdate, Measurements};

#[cfg(feature = "python")]
mod python {
    use pyo3::exceptions::{PyConnectionError, PyRuntimeError, PyValueError};
    use pyo3::prelude::*;
    use pyo3::types::PyDict;
    use tokio::runtime::Runtime;

    use crate::config::MAX_USERS;
    use crate::logging;
    use crate::{
        BluezConnector, ConnectorSettings, DeviceAddress, Gender, MeasurementSnapshot,
        Measurements, Roster, Scale, ScaleConfig, SessionTiming, TimingConfig, UserProfile,
    };

    fn value_error(e: impl std::fmt::Display) -> PyErr {
        PyErr::new::<PyValueError, _>(e.to_string())
    }

    fn snapshot_dict<'py>(py: Python<'py>, snap: &MeasurementSnapshot) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        dict.set_item("timestamp", snap.timestamp.map(|t| t.to_rfc3339()))?;
        dict.set_item("weight", snap.weight_kg)?;
        dict.set_item("body_fat", snap.body_fat_pct)?;
        dict.set_item("water", snap.water_pct)?;
        dict.set_item("muscle", snap.muscle_pct)?;
        dict.set_item("bone_mass", snap.bone_mass_kg)?;
        dict.set_item("bmi", snap.bmi)?;
        dict.set_item("bmr", snap.bmr_kcal)?;
        dict.set_item("amr", snap.amr_kcal)?;
        dict.set_item("visceral_fat", snap.visceral_fat)?;
        dict.set_item("metabolic_age", snap.metabolic_age)?;
        dict.set_item("body_type", snap.body_type)?;
        Ok(dict)
    }

    fn measurements_dict<'py>(py: Python<'py>, readings: &Measurements) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        for (user_id, snap) in readings {
            dict.set_item(*user_id, snapshot_dict(py, snap)?)?;
        }
        Ok(dict)
    }

    /// Beurer BF 915 scale.
    ///
    /// Example:
    ///     >>> scale = Scale("C8:B2:1E:00:11:22", [(1, "Pedro", "male", 50, 181)])
    ///     >>> readings = scale.update()
    ///     >>> readings[1]["weight"]
    #[pyclass(name = "Scale", unsendable)]
    struct PyScale {
        runtime: Runtime,
        inner: Scale<BluezConnector>,
    }

    impl PyScale {
        fn build(
            py: Python<'_>,
            address: DeviceAddress,
            roster: Roster,
            timing: SessionTiming,
        ) -> PyResult<Self> {
            let runtime = Runtime::new()
                .map_err(|e| PyErr::new::<PyRuntimeError, _>(format!("tokio runtime init failed: {e}")))?;
            let connector = py
                .detach(|| runtime.block_on(BluezConnector::new(ConnectorSettings::default())))
                .map_err(|e| PyErr::new::<PyConnectionError, _>(e.to_string()))?;
            Ok(PyScale {
                runtime,
                inner: Scale::new(address, roster, connector).with_timing(timing),
            })
        }
    }

    #[pymethods]
    impl PyScale {
        /// Create a scale handle.
        ///
        /// Args:
        ///     address: Bluetooth address of the scale (e.g., "C8:B2:1E:00:11:22")
        ///     users: List of (id, name, gender, age, height_cm) tuples, 1 to 8 entries.
        ///
        /// Raises:
        ///     ValueError: If the address or the user list is invalid
        ///     ConnectionError: If the Bluetooth adapter cannot be opened
        #[new]
        fn new(py: Python<'_>, address: &str, users: Vec<(u8, String, String, u8, u8)>) -> PyResult<Self> {
            let address: DeviceAddress = address.parse().map_err(value_error)?;
            let profiles = users
                .into_iter()
                .map(|(id, name, gender, age, height)| {
                    let gender: Gender = gender.parse().map_err(value_error)?;
                    Ok(UserProfile::new(id, name, gender, age, height))
                })
                .collect::<PyResult<Vec<_>>>()?;
            let roster = Roster::new(profiles).map_err(value_error)?;
            Self::build(py, address, roster, SessionTiming::default())
        }

        /// Create a scale handle from a TOML config file.
        #[staticmethod]
        fn from_config(py: Python<'_>, path: &str) -> PyResult<Self> {
            let config = ScaleConfig::load(path).map_err(value_error)?;
            let address = config.device_address().map_err(value_error)?;
            let roster = config.roster().map_err(value_error)?;
            Self::build(py, address, roster, config.timing.session())
        }

        /// Run one update cycle and return {user_id: {field: value}}.
        ///
        /// Device failures do not raise: the previous readings are returned
        /// and `last_error` describes what went wrong. The GIL is released
        /// while the scale is being talked to.
        fn update<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
            let (runtime, scale) = (&self.runtime, &self.inner);
            let readings = py.detach(|| runtime.block_on(scale.run_cycle()));
            measurements_dict(py, &readings)
        }

        /// Current readings without contacting the scale.
        fn snapshot<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
            measurements_dict(py, &self.inner.snapshot())
        }

        #[getter]
        fn last_error(&self) -> Option<String> {
            self.inner.last_error()
        }

        #[getter]
        fn address(&self) -> String {
            self.inner.address().to_string()
        }

        fn __repr__(&self) -> String {
            format!(
                "Scale(address={}, users={})",
                self.inner.address(),
                self.inner.roster().len()
            )
        }
    }

    /// Set the minimum level of Rust log records forwarded to Python logging.
    #[pyfunction]
    #[pyo3(signature = (level=None))]
    fn set_log_level(level: Option<&str>) {
        logging::set_python_log_level(logging::parse_level_or_env(level));
    }

    /// The Python module definition
    #[pymodule]
    fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
        logging::init_python_logging(m.py())?;
        m.add_class::<PyScale>()?;
        m.add_function(wrap_pyfunction!(set_log_level, m)?)?;

        m.add("MAX_USERS", MAX_USERS)?;
        m.add(
            "DEFAULT_POLL_INTERVAL_SECS",
            TimingConfig::default().poll_interval_secs,
        )?;

        Ok(())
    }
}
