//! The mandatory `devmod` ServiceInfo module.
//!
//! The device publishes its descriptors (`os`, `arch`, `version`, …), then
//! `nummodules`, then a paginated `modules` list. Descriptor emission is
//! table-driven: one row per message with its getter and required flag,
//! emitted in a stable order. The `modules` list starts on a fresh frame
//! (`force_new_message`) and each page is sized by trial encoding so the
//! whole page fits under the MTU.

use std::collections::BTreeMap;

use ciborium::value::Value;
use serde::{Deserialize, Serialize};

use fdo_cbor::CodecError;

use crate::serviceinfo::{ServiceInfoError, ServiceInfoProducer, service_info_key};

/// Module name of the mandatory module.
pub const DEVMOD_MODULE: &str = "devmod";

/// Device descriptors for the `devmod` module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Devmod {
    /// OS name (e.g. `Linux`).
    pub os: String,
    /// Architecture name (e.g. `X86_64`).
    pub arch: String,
    /// OS version.
    pub version: String,
    /// Device model, manufacturer specific.
    pub device: String,
    /// Serial number.
    pub serial: Option<Vec<u8>>,
    /// Path separator between directories.
    pub path_sep: Option<String>,
    /// Filename separator for file lists.
    pub file_sep: String,
    /// Newline sequence.
    pub newline: Option<String>,
    /// Temp directory.
    pub temp: Option<String>,
    /// Suggested install directory.
    pub dir: Option<String>,
    /// Programming environment list.
    pub prog_env: Option<String>,
    /// Interpretable machine formats, `sep`-separated.
    pub bin: String,
    /// Manufacturer Usage Description URL.
    pub mud_url: Option<String>,
}

struct Descriptor {
    message: &'static str,
    required: bool,
    get: fn(&Devmod) -> Option<Value>,
}

fn text(s: &str) -> Option<Value> {
    if s.is_empty() {
        None
    } else {
        Some(Value::Text(s.to_string()))
    }
}

fn opt_text(s: Option<&String>) -> Option<Value> {
    s.filter(|s| !s.is_empty()).map(|s| Value::Text(s.clone()))
}

static DESCRIPTORS: &[Descriptor] = &[
    Descriptor { message: "os", required: true, get: |d| text(&d.os) },
    Descriptor { message: "arch", required: true, get: |d| text(&d.arch) },
    Descriptor { message: "version", required: true, get: |d| text(&d.version) },
    Descriptor { message: "device", required: true, get: |d| text(&d.device) },
    Descriptor {
        message: "sn",
        required: false,
        get: |d| d.serial.clone().map(Value::Bytes),
    },
    Descriptor { message: "pathsep", required: false, get: |d| opt_text(d.path_sep.as_ref()) },
    Descriptor { message: "sep", required: true, get: |d| text(&d.file_sep) },
    Descriptor { message: "nl", required: false, get: |d| opt_text(d.newline.as_ref()) },
    Descriptor { message: "tmp", required: false, get: |d| opt_text(d.temp.as_ref()) },
    Descriptor { message: "dir", required: false, get: |d| opt_text(d.dir.as_ref()) },
    Descriptor { message: "progenv", required: false, get: |d| opt_text(d.prog_env.as_ref()) },
    Descriptor { message: "bin", required: true, get: |d| text(&d.bin) },
    Descriptor { message: "mudurl", required: false, get: |d| opt_text(d.mud_url.as_ref()) },
];

impl Devmod {
    /// Check that every required descriptor is populated.
    ///
    /// # Errors
    /// Returns the name of the first missing descriptor.
    pub fn validate(&self) -> Result<(), String> {
        for descriptor in DESCRIPTORS {
            if descriptor.required && (descriptor.get)(self).is_none() {
                return Err(format!("missing required devmod field: {}", descriptor.message));
            }
        }
        Ok(())
    }

    /// Emit the full devmod stream: `active`, descriptors, `nummodules`,
    /// and the paginated `modules` list. `modules` must contain every
    /// module name the device supports, including `devmod` itself.
    ///
    /// # Errors
    /// Returns a producer error for invalid descriptors or an MTU that
    /// cannot fit a single module name.
    pub fn write(
        &self,
        modules: &[String],
        mtu: u16,
        producer: &ServiceInfoProducer,
    ) -> Result<(), ServiceInfoError> {
        self.validate().map_err(ServiceInfoError::Producer)?;

        producer.next_service_info(DEVMOD_MODULE, "active")?;
        producer.write_value(&true)?;

        for descriptor in DESCRIPTORS {
            if let Some(value) = (descriptor.get)(self) {
                producer.next_service_info(DEVMOD_MODULE, descriptor.message)?;
                producer.write_value(&value)?;
            }
        }

        producer.next_service_info(DEVMOD_MODULE, "nummodules")?;
        producer.write_value(&(modules.len() as u64))?;

        // Start the list on a fresh frame so a full MTU is available and
        // page sizes are predictable.
        producer.force_new_message()?;
        write_module_pages(modules, mtu, producer)
    }
}

/// One page of the `devmod:modules` list: `[start, len, name...]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DevmodModulesChunk {
    /// Index of the first module in this page.
    pub start: u64,
    /// Number of names in this page.
    pub len: u64,
    /// The module names.
    pub modules: Vec<String>,
}

impl DevmodModulesChunk {
    /// The flattened CBOR array value for this page.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut items = vec![
            Value::Integer(self.start.into()),
            Value::Integer(self.len.into()),
        ];
        items.extend(self.modules.iter().map(|m| Value::Text(m.clone())));
        Value::Array(items)
    }

    /// Parse one page from a CBOR array value.
    ///
    /// # Errors
    /// Returns `Malformed` for anything but `[uint, uint, tstr...]`.
    pub fn from_value(value: &Value) -> Result<Self, CodecError> {
        let Value::Array(items) = value else {
            return Err(CodecError::UnexpectedType { expected: "array" });
        };
        if items.len() < 2 {
            return Err(CodecError::Malformed);
        }
        let as_u64 = |v: &Value| -> Result<u64, CodecError> {
            match v {
                Value::Integer(i) => u64::try_from(*i).map_err(|_| CodecError::IntegerOverflow),
                _ => Err(CodecError::UnexpectedType { expected: "uint" }),
            }
        };
        let start = as_u64(&items[0])?;
        let len = as_u64(&items[1])?;
        let mut modules = Vec::with_capacity(items.len() - 2);
        for item in &items[2..] {
            match item {
                Value::Text(name) => modules.push(name.clone()),
                _ => return Err(CodecError::UnexpectedType { expected: "tstr" }),
            }
        }
        Ok(Self { start, len, modules })
    }
}

fn write_module_pages(
    modules: &[String],
    mtu: u16,
    producer: &ServiceInfoProducer,
) -> Result<(), ServiceInfoError> {
    let key = service_info_key(DEVMOD_MODULE, "modules");
    let mut remaining = modules;
    let mut start = 0u64;

    loop {
        let mut chunk = DevmodModulesChunk {
            start,
            ..Default::default()
        };

        while let Some(next) = remaining.first() {
            chunk.len += 1;
            chunk.modules.push(next.clone());

            // Trial-encode the page in message context to measure it.
            let probe = Value::Array(vec![Value::Array(vec![
                Value::Text(key.clone()),
                chunk.to_value(),
            ])]);
            let size = fdo_cbor::to_canonical_cbor(&probe)
                .map_err(|e| ServiceInfoError::Producer(e.to_string()))?
                .len();

            if size <= usize::from(mtu) {
                remaining = &remaining[1..];
                continue;
            }

            // Back out the name that overflowed.
            if chunk.modules.len() == 1 {
                return Err(ServiceInfoError::Producer(
                    "MTU too small to send a devmod module name alone".into(),
                ));
            }
            chunk.len -= 1;
            chunk.modules.pop();
            break;
        }

        producer.next_service_info(DEVMOD_MODULE, "modules")?;
        producer.write_value(&chunk.to_value())?;
        start += chunk.len;

        if remaining.is_empty() {
            return Ok(());
        }
    }
}

/// Owner-side collection of received devmod values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevmodSnapshot {
    /// `devmod:active` value.
    pub active: Option<bool>,
    /// Required descriptor values by message name.
    pub descriptors: BTreeMap<String, String>,
    /// Declared module count.
    pub num_modules: Option<u64>,
    /// Module names received so far, in order.
    pub modules: Vec<String>,
}

impl DevmodSnapshot {
    /// Fold one received `devmod:<message>` value into the snapshot.
    ///
    /// `value` holds one or more concatenated CBOR items; `modules`
    /// pages received back to back are all absorbed.
    ///
    /// # Errors
    /// Returns a codec error for undecodable values.
    pub fn absorb(&mut self, message: &str, value: &[u8]) -> Result<(), CodecError> {
        match message {
            "active" => self.active = Some(fdo_cbor::from_cbor(value)?),
            "nummodules" => self.num_modules = Some(fdo_cbor::from_cbor(value)?),
            "modules" => {
                let mut rest = value;
                while !rest.is_empty() {
                    let item = fdo_cbor::take_item(&mut rest)?;
                    let parsed: Value = fdo_cbor::from_cbor(item)?;
                    let page = DevmodModulesChunk::from_value(&parsed)?;
                    self.modules.extend(page.modules);
                }
            }
            "sn" => {
                let bytes: serde_bytes::ByteBuf = fdo_cbor::from_cbor(value)?;
                self.descriptors
                    .insert(message.to_string(), hex::encode(bytes));
            }
            _ => {
                let text: String = fdo_cbor::from_cbor(value)?;
                self.descriptors.insert(message.to_string(), text);
            }
        }
        Ok(())
    }

    /// Whether the mandatory descriptors and the full module list have
    /// arrived.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.active == Some(true)
            && ["os", "arch", "version", "device", "sep", "bin"]
                .iter()
                .all(|key| self.descriptors.contains_key(*key))
            && self
                .num_modules
                .is_some_and(|n| n == self.modules.len() as u64)
    }
}
