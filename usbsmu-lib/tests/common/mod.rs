//! Common test utilities and shared imports

// Allow unused imports and dead code since this is a shared module
// used across multiple test files - not all items are used in every test file
#[allow(unused_imports)]
pub use rust_decimal::Decimal;
#[allow(unused_imports)]
pub use std::str::FromStr;
#[allow(unused_imports)]
pub use usbsmu_lib::calibration::{CalibrationOutcome, Operator, RecordSink};
#[allow(unused_imports)]
pub use usbsmu_lib::constants::DEFAULT_DEVICE_PREFIX;
#[allow(unused_imports)]
pub use usbsmu_lib::endpoint::endpoint_name;
#[allow(unused_imports)]
pub use usbsmu_lib::quantity::{Quantity, RangeControl, Service};
#[allow(unused_imports)]
pub use usbsmu_lib::transport::{Reply, Transport};
#[allow(unused_imports)]
pub use usbsmu_lib::{CoefficientSet, DeviceGeneration, Result, Smu, SmuError};

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use usbsmu_lib::quantity::QuantityTable;

/// Parse a decimal literal
#[allow(dead_code)]
pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).expect("valid decimal literal")
}

#[allow(dead_code)]
pub fn ep(quantity: &Quantity) -> String {
    endpoint_name(DEFAULT_DEVICE_PREFIX, quantity.name())
}

/// One request seen by the mock device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: &'static str,
    pub path: String,
}

impl Request {
    #[allow(dead_code)]
    pub fn is_post(&self) -> bool {
        self.method == "POST"
    }
}

/// Entity values the mock device holds, keyed by endpoint name
#[derive(Debug, Default)]
pub struct DeviceState {
    pub numbers: BTreeMap<String, Decimal>,
    pub switches: BTreeMap<String, bool>,
    pub selects: BTreeMap<String, String>,
    pub texts: BTreeMap<String, String>,
}

#[allow(dead_code)]
impl DeviceState {
    pub fn number(&self, quantity: &Quantity) -> Decimal {
        self.numbers.get(&ep(quantity)).copied().unwrap_or_default()
    }

    /// True if any output switch is on
    pub fn output_on(&self) -> bool {
        self.switches.values().any(|on| *on)
    }
}

type SensorFn = Box<dyn Fn(&DeviceState) -> String + Send>;

struct Failure {
    method: &'static str,
    contains: String,
    from_nth: usize,
    seen: usize,
    status: u16,
}

#[derive(Default)]
struct Inner {
    state: DeviceState,
    sensors: BTreeMap<String, SensorFn>,
    samples: VecDeque<Reply>,
    failures: Vec<Failure>,
    requests: Vec<Request>,
}

/// In-memory UsbSMU speaking the REST dialect the accessor expects.
///
/// Cloning yields another handle to the same device, so a test can keep one
/// handle for inspection after moving another into [`Smu`].
#[derive(Clone, Default)]
pub struct MockDevice {
    inner: Arc<Mutex<Inner>>,
}

#[allow(dead_code)]
impl MockDevice {
    /// Device exposing every entity of `generation`.
    ///
    /// Numbers start at zero except calibration factors, which start at one.
    /// Sensors read zero until overridden with [`MockDevice::sensor`].
    pub fn new(generation: DeviceGeneration) -> Self {
        let device = Self::default();
        let table = QuantityTable::for_generation(generation);
        {
            let mut inner = device.inner.lock().unwrap();
            for (quantity, service) in table.entries() {
                let name = ep(quantity);
                match service {
                    Service::Number => {
                        let initial = if table.is_calibration(quantity) && quantity.name().ends_with("Factor") {
                            Decimal::ONE
                        } else {
                            Decimal::ZERO
                        };
                        inner.state.numbers.insert(name, initial);
                    }
                    Service::Sensor => {
                        inner.sensors.insert(name, Box::new(|_| "0".to_string()));
                    }
                    Service::TextSensor => {
                        inner.state.texts.insert(name, "AA:BB:CC:00:11:22".to_string());
                    }
                    Service::Switch => {
                        inner.state.switches.insert(name, false);
                    }
                    Service::Select => {
                        inner.state.selects.insert(name, table.ranges()[0].clone());
                    }
                }
            }
        }
        device
    }

    /// Make a sensor report `f(state)` with a unit suffix
    pub fn sensor<F>(&self, quantity: &Quantity, f: F) -> &Self
    where
        F: Fn(&DeviceState) -> Decimal + Send + 'static,
    {
        self.sensor_state(quantity, move |s| format!("{} V", f(s)))
    }

    /// Make a sensor report a raw `state` string
    pub fn sensor_state<F>(&self, quantity: &Quantity, f: F) -> &Self
    where
        F: Fn(&DeviceState) -> String + Send + 'static,
    {
        self.inner.lock().unwrap().sensors.insert(ep(quantity), Box::new(f));
        self
    }

    pub fn set_number(&self, quantity: &Quantity, value: Decimal) -> &Self {
        self.inner.lock().unwrap().state.numbers.insert(ep(quantity), value);
        self
    }

    pub fn number(&self, quantity: &Quantity) -> Decimal {
        self.inner.lock().unwrap().state.number(quantity)
    }

    pub fn switch(&self, quantity: &Quantity) -> bool {
        self.inner
            .lock()
            .unwrap()
            .state
            .switches
            .get(&ep(quantity))
            .copied()
            .unwrap_or_default()
    }

    pub fn output_on(&self) -> bool {
        self.inner.lock().unwrap().state.output_on()
    }

    /// Queue a response for the next `/samples` request
    pub fn queue_samples(&self, status: u16, body: &str) -> &Self {
        self.inner.lock().unwrap().samples.push_back(Reply {
            status,
            body: body.to_string(),
        });
        self
    }

    /// Answer every `method` request whose path contains `contains` with
    /// `status`, starting from the `from_nth` (1-based) such request
    pub fn fail(&self, method: &'static str, contains: &str, from_nth: usize, status: u16) -> &Self {
        self.inner.lock().unwrap().failures.push(Failure {
            method,
            contains: contains.to_string(),
            from_nth,
            seen: 0,
            status,
        });
        self
    }

    pub fn requests(&self) -> Vec<Request> {
        self.inner.lock().unwrap().requests.clone()
    }

    pub fn posts(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(Request::is_post)
            .map(|r| r.path)
            .collect()
    }

    pub fn clear_requests(&self) {
        self.inner.lock().unwrap().requests.clear();
    }

    fn handle(&self, method: &'static str, path: &str) -> Reply {
        let mut inner = self.inner.lock().unwrap();
        inner.requests.push(Request {
            method,
            path: path.to_string(),
        });

        for failure in inner.failures.iter_mut() {
            if failure.method == method && path.contains(&failure.contains) {
                failure.seen += 1;
                if failure.seen >= failure.from_nth {
                    return reply(failure.status, "");
                }
            }
        }

        let (route, query) = path.split_once('?').unwrap_or((path, ""));
        let parts: Vec<&str> = route.trim_start_matches('/').split('/').collect();
        match (method, parts.as_slice()) {
            ("GET", ["samples"]) => inner.samples.pop_front().unwrap_or_else(|| reply(404, "")),
            ("GET", ["sensor", name]) => match inner.sensors.get(*name) {
                Some(f) => {
                    let state = f(&inner.state);
                    reply(200, &serde_json::json!({ "id": format!("sensor-{name}"), "state": state }).to_string())
                }
                None => reply(404, ""),
            },
            ("GET", ["number", name]) => match inner.state.numbers.get(*name) {
                Some(value) => reply(
                    200,
                    &format!(r#"{{"id":"number-{name}","value":{value},"state":"{value}"}}"#),
                ),
                None => reply(404, ""),
            },
            ("GET", ["text_sensor", name]) => match inner.state.texts.get(*name) {
                Some(text) => reply(
                    200,
                    &serde_json::json!({ "id": format!("text_sensor-{name}"), "value": text, "state": text })
                        .to_string(),
                ),
                None => reply(404, ""),
            },
            ("POST", ["number", name, "set"]) => {
                let value = query.strip_prefix("value=").and_then(|v| Decimal::from_str(v).ok());
                match (inner.state.numbers.get_mut(*name), value) {
                    (Some(slot), Some(value)) => {
                        *slot = value;
                        reply(200, "")
                    }
                    (None, _) => reply(404, ""),
                    (_, None) => reply(400, ""),
                }
            }
            ("POST", ["switch", name, action]) => match inner.state.switches.get_mut(*name) {
                Some(slot) if *action == "turn_on" || *action == "turn_off" => {
                    *slot = *action == "turn_on";
                    reply(200, "")
                }
                Some(_) => reply(400, ""),
                None => reply(404, ""),
            },
            ("POST", ["select", name, "set"]) => {
                let option = query.strip_prefix("option=").map(str::to_string);
                match (inner.state.selects.get_mut(*name), option) {
                    (Some(slot), Some(option)) => {
                        *slot = option;
                        reply(200, "")
                    }
                    (None, _) => reply(404, ""),
                    (_, None) => reply(400, ""),
                }
            }
            _ => reply(404, ""),
        }
    }
}

fn reply(status: u16, body: &str) -> Reply {
    Reply {
        status,
        body: body.to_string(),
    }
}

impl Transport for MockDevice {
    async fn get(&self, path: &str) -> Result<Reply> {
        Ok(self.handle("GET", path))
    }

    async fn post(&self, path: &str) -> Result<Reply> {
        Ok(self.handle("POST", path))
    }
}

/// Operator answering from a script instead of a console
#[derive(Default)]
pub struct ScriptedOperator {
    pub confirms: VecDeque<bool>,
    pub reference: Option<Box<dyn FnMut(&str) -> Decimal + Send>>,
    pub prompts: Vec<String>,
    pub instructions: Vec<String>,
}

#[allow(dead_code)]
impl ScriptedOperator {
    pub fn answering(confirms: &[bool]) -> Self {
        Self {
            confirms: confirms.iter().copied().collect(),
            ..Self::default()
        }
    }

    /// Reference meter readings produced by `f`
    pub fn with_reference<F>(mut self, f: F) -> Self
    where
        F: FnMut(&str) -> Decimal + Send + 'static,
    {
        self.reference = Some(Box::new(f));
        self
    }
}

impl Operator for ScriptedOperator {
    async fn confirm(&mut self, prompt: &str) -> Result<bool> {
        self.prompts.push(prompt.to_string());
        self.confirms
            .pop_front()
            .ok_or_else(|| SmuError::Validation(format!("unexpected prompt: {prompt}")))
    }

    async fn acknowledge(&mut self, instruction: &str) -> Result<()> {
        self.instructions.push(instruction.to_string());
        Ok(())
    }

    async fn read_reference(&mut self, prompt: &str) -> Result<Decimal> {
        self.prompts.push(prompt.to_string());
        match self.reference.as_mut() {
            Some(f) => Ok(f(prompt)),
            None => Err(SmuError::Validation(format!("no reference reading for: {prompt}"))),
        }
    }
}
