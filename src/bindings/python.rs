use std::collections::HashMap;

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::config::load_config;
use crate::local::SpikeEvent;
use crate::output::transport::open_configured;
use crate::processing::clock::{Clock, StreamClock};
use crate::processing::control_loop::Pipeline;

/// Push-driven controller for acquisition loops written in Python.
///
/// Python owns the event loop: call `push` for every sorted spike and
/// `advance` when time passes without spikes.
#[pyclass]
pub struct PyController {
    pipeline: Pipeline,
    clock: StreamClock,
    stopped: bool,
}

#[pymethods]
impl PyController {
    #[new]
    #[pyo3(signature = (config_path, port=None))]
    pub fn new(config_path: String, port: Option<String>) -> PyResult<Self> {
        let mut config =
            load_config(&config_path).map_err(|e| PyValueError::new_err(e.to_string()))?;
        if port.is_some() {
            config.actuator.port = port;
        }
        let transport = open_configured(&config.actuator);
        let mut pipeline =
            Pipeline::new(&config, transport).map_err(|e| PyValueError::new_err(e.to_string()))?;
        pipeline
            .start()
            .map_err(|e| PyValueError::new_err(e.to_string()))?;
        Ok(PyController {
            pipeline,
            clock: StreamClock::new(),
            stopped: false,
        })
    }

    /// Feeds one spike. Returns whether the actuator is on afterwards.
    pub fn push(&mut self, timestamp: u64, unit_id: u32) -> bool {
        if self.stopped {
            return false;
        }
        self.clock.observe(timestamp);
        self.pipeline
            .step(Some(SpikeEvent::new(timestamp, unit_id)), self.clock.now());
        self.pipeline.link().is_active()
    }

    /// Runs an iteration without a spike at tick `now`.
    pub fn advance(&mut self, now: u64) -> bool {
        if self.stopped {
            return false;
        }
        self.clock.observe(now);
        self.pipeline.step(None, self.clock.now());
        self.pipeline.link().is_active()
    }

    pub fn is_active(&self) -> bool {
        self.pipeline.link().is_active()
    }

    pub fn unit_sums(&self) -> Vec<u32> {
        self.pipeline.binner().sum_by_unit()
    }

    pub fn stats(&self) -> HashMap<String, u64> {
        let stats = self.pipeline.stats();
        HashMap::from([
            ("iterations".to_string(), stats.iterations),
            ("events".to_string(), stats.events),
            ("activations".to_string(), stats.activations),
            ("patterns".to_string(), stats.patterns),
            ("deactivations".to_string(), stats.deactivations),
            ("failed_writes".to_string(), stats.failed_writes),
        ])
    }

    /// Switches the actuator off and disarms it. Further pushes are ignored.
    pub fn shutdown(&mut self) {
        if !self.stopped {
            self.pipeline.shutdown();
            self.stopped = true;
        }
    }
}

/// A Python module implemented in Rust.
#[pymodule]
pub fn nctrl(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyController>()?;
    Ok(())
}
