//! Identity and declarative shape of a virtual machine instance.
//!
//! Only the parts the console core inspects are modelled here: where the
//! instance is in its lifecycle, and whether it declares a serial console.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConsoleError;

pub const DEFAULT_NAMESPACE: &str = "default";

/// Identity of a virtual machine instance (namespace + name)
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct InstanceRef {
    namespace: String,
    name: String,
}

impl InstanceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Parses `namespace/name`, or a bare `name` in the default namespace.
impl FromStr for InstanceRef {
    type Err = ConsoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, name) = match s.split_once('/') {
            Some((ns, name)) => (ns, name),
            None => (DEFAULT_NAMESPACE, s),
        };
        let valid = |part: &str| {
            !part.is_empty() && !part.contains('/') && part != "." && part != ".."
        };
        if !valid(namespace) || !valid(name) {
            return Err(ConsoleError::Api(format!("invalid instance reference: {:?}", s)));
        }
        Ok(Self::new(namespace, name))
    }
}

/// Observed lifecycle phase of an instance
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstancePhase {
    #[default]
    Pending,
    Scheduling,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl InstancePhase {
    pub fn is_running(self) -> bool {
        matches!(self, InstancePhase::Running)
    }
}

/// Device section of an instance specification
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Attach a serial console automatically. Unset means attached.
    #[serde(default)]
    pub autoattach_serial_console: Option<bool>,
}

/// Declarative instance configuration, opaque apart from its devices
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    #[serde(default)]
    pub devices: DeviceSpec,
}

impl InstanceSpec {
    pub fn without_serial_console() -> Self {
        Self {
            devices: DeviceSpec {
                autoattach_serial_console: Some(false),
            },
        }
    }

    pub fn has_serial_console(&self) -> bool {
        self.devices.autoattach_serial_console.unwrap_or(true)
    }
}

/// What the lifecycle collaborator reports about an instance
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    #[serde(default)]
    pub phase: InstancePhase,
    #[serde(flatten)]
    pub spec: InstanceSpec,
}

impl Instance {
    pub fn new(phase: InstancePhase, spec: InstanceSpec) -> Self {
        Self { phase, spec }
    }
}
