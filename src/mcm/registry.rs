use crate::prelude::*;

use crate::mcm::parameter::{Caps, Parameter, TIME_COMMAND};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CATALOG_VERSION: u32 = 1;

/// The set of parameters the controller is known to speak, in display
/// order. Seeded from the built-in catalog, optionally overlaid from a
/// saved file and refreshed from the device at startup.
pub struct Registry {
    parameters: Vec<Parameter>,
}

impl Registry {
    pub fn with_builtin() -> Self {
        let r = Caps::READ;
        let w = Caps::WRITE;
        let rw = Caps::READ_WRITE;

        let parameters = vec![
            Parameter::new("BATV", "Battery Voltage", "Volts", r | Caps::NUMERIC),
            Parameter::new("OUTC", "Output Current", "Amps", r | Caps::NUMERIC),
            Parameter::new("LODC", "Load Current", "Amps", r | Caps::NUMERIC),
            Parameter::new("IBAT", "Battery Current", "Amps", r | Caps::NUMERIC),
            Parameter::new("TEMP", "Temperature", "°C", r | Caps::NUMERIC),
            Parameter::new("LAH", "Load AmpHours", "AmpHour", r | Caps::NUMERIC),
            Parameter::new("BATH", "Battery AmpHours", "AmpHour", r | Caps::NUMERIC),
            Parameter::new("AHT", "AmpHour Running Time", "HH:MM:SS", r | Caps::STRING),
            Parameter::new("ALM", "Alarms", "", r | Caps::STRING),
            Parameter::new("VER", "Firmware Version", "", r | Caps::STRING),
            Parameter::new("HVER", "Hardware Version", "", r | Caps::STRING),
            Parameter::new("MODEL", "Model", "", r | Caps::STRING),
            Parameter::new(
                "ReadAll",
                "Vbatt, Ibatt, Iload, Temp, Iout, AHload, AHbatt",
                "",
                r | Caps::STRING,
            ),
            Parameter::new("RESET", "Reset MCM", "", w),
            Parameter::new("RTC", "Clears AmpHour Timer and Batt/Load Capacity", "", w),
            Parameter::new("ECHO", "Echo On/Off", "", w),
            Parameter::new_list(
                "RLC",
                "Remote Load Control",
                Caps::STRING | Caps::ON_OFF,
                &["LVD", "DDC", "LSC"],
            ),
            Parameter::new_range(
                "LVD",
                "Low Voltage Disconnect Threshold",
                "Volts",
                rw | Caps::RANGE,
                8.0,
                53.0,
            ),
            Parameter::new_range(
                "DDC",
                "Dawn to Dusk Load Disconnect Time",
                "Hours",
                rw | Caps::RANGE,
                1.0,
                16.0,
            ),
            Parameter::new("LSC", "Direct Control Of Load", "", rw | Caps::ON_OFF),
            Parameter::new(
                "FBR",
                "Flat Battery Recovery Mode Enable/Disable",
                "",
                rw | Caps::NUMERIC | Caps::ON_OFF,
            ),
            Parameter::new_range(
                "OVP",
                "Output Voltage Programming Enable/Disable",
                "V",
                rw | Caps::ON_OFF | Caps::RANGE,
                8.0,
                58.0,
            ),
            Parameter::new_range(
                "OVT",
                "Over Temperature Alarm Threshold",
                "°C",
                rw | Caps::ON_OFF | Caps::RANGE,
                35.0,
                75.0,
            ),
            Parameter::new_range(
                "BUV",
                "Battery Undervoltage Alarm Threshold",
                "Volts",
                rw | Caps::ON_OFF | Caps::RANGE,
                10.0,
                50.0,
            ),
            Parameter::new_range(
                "BAH",
                "Battery AmpHour Alarm Threshold",
                "AmpHours",
                rw | Caps::ON_OFF | Caps::RANGE,
                -50.0,
                -1000.0,
            ),
            Parameter::new(
                TIME_COMMAND,
                "Set/Read System Time (YYYY,MM,DD,HH,MM)",
                "",
                rw | Caps::STRING,
            ),
        ];

        Self { parameters }
    }

    /// Look a parameter up by its exact command token.
    pub fn find(&self, token: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.command() == token)
    }

    pub fn find_mut(&mut self, token: &str) -> Option<&mut Parameter> {
        self.parameters.iter_mut().find(|p| p.command() == token)
    }

    /// Like [`find`](Self::find) but for tokens the caller knows exist.
    pub fn get(&self, token: &str) -> &Parameter {
        self.find(token)
            .unwrap_or_else(|| panic!("unknown parameter {:?}", token))
    }

    pub fn get_mut(&mut self, token: &str) -> &mut Parameter {
        self.find_mut(token)
            .unwrap_or_else(|| panic!("unknown parameter {:?}", token))
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Merge saved parameters over the current set. Known tokens are
    /// replaced in place to preserve display order, new ones are appended.
    pub fn overlay(&mut self, parameters: Vec<Parameter>) {
        for incoming in parameters {
            match self
                .parameters
                .iter_mut()
                .find(|p| p.command() == incoming.command())
            {
                Some(existing) => *existing = incoming,
                None => self.parameters.push(incoming),
            }
        }
    }

    /// Read a saved catalog and overlay it. Returns false when the file
    /// does not exist; anything unreadable or malformed is an error and
    /// leaves the registry untouched.
    pub fn load_catalog(&mut self, path: &str) -> Result<bool> {
        if !Path::new(path).exists() {
            return Ok(false);
        }
        let content = std::fs::read_to_string(path)
            .map_err(|err| anyhow!("error reading {}: {}", path, err))?;
        let file: CatalogFile = serde_json::from_str(&content)
            .map_err(|err| anyhow!("error parsing {}: {}", path, err))?;
        if file.version != CATALOG_VERSION {
            bail!("{} has unsupported catalog version {}", path, file.version);
        }
        let mut loaded = Vec::with_capacity(file.parameters.len());
        for record in file.parameters {
            loaded.push(record.try_into_parameter()?);
        }
        self.overlay(loaded);
        Ok(true)
    }

    pub fn save_catalog(&self, path: &str) -> Result<()> {
        let file = CatalogFile {
            version: CATALOG_VERSION,
            saved_at: chrono::Local::now(),
            parameters: self
                .parameters
                .iter()
                .map(ParameterRecord::from_parameter)
                .collect(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|err| anyhow!("error serialising catalog: {}", err))?;
        std::fs::write(path, json).map_err(|err| anyhow!("error writing {}: {}", path, err))?;
        debug!("saved {} parameters to {}", self.parameters.len(), path);
        Ok(())
    }
}

// CatalogFile {{{
#[derive(Debug, Serialize, Deserialize)]
struct CatalogFile {
    version: u32,
    saved_at: chrono::DateTime<chrono::Local>,
    parameters: Vec<ParameterRecord>,
}
// }}}

// ParameterRecord {{{
/// On-disk form of a parameter. Capabilities are spelled out as individual
/// booleans so the file stays readable and diffable.
#[derive(Debug, Serialize, Deserialize)]
struct ParameterRecord {
    command: String,
    description: String,
    #[serde(default)]
    units: String,
    readable: bool,
    writable: bool,
    supports_on_off: bool,
    supports_range: bool,
    supports_list: bool,
    is_string: bool,
    is_numeric: bool,
    #[serde(default)]
    minimum: f64,
    #[serde(default)]
    maximum: f64,
    #[serde(default)]
    valid_values: Vec<String>,
}

impl ParameterRecord {
    fn from_parameter(parameter: &Parameter) -> Self {
        Self {
            command: parameter.command().to_string(),
            description: parameter.description().to_string(),
            units: parameter.units().to_string(),
            readable: parameter.is_readable(),
            writable: parameter.is_writable(),
            supports_on_off: parameter.supports_on_off(),
            supports_range: parameter.supports_range(),
            supports_list: parameter.supports_list(),
            is_string: parameter.is_string(),
            is_numeric: parameter.is_numeric(),
            minimum: parameter.minimum(),
            maximum: parameter.maximum(),
            valid_values: parameter.valid_values().to_vec(),
        }
    }

    fn try_into_parameter(self) -> Result<Parameter> {
        if self.command.is_empty() {
            bail!("parameter record without a command token");
        }
        if self.is_string && self.is_numeric {
            bail!("{}: cannot be both string and numeric", self.command);
        }
        if self.supports_range && self.supports_list {
            bail!("{}: cannot be both range and list", self.command);
        }
        if self.supports_range && !self.is_numeric {
            bail!("{}: a range parameter must be numeric", self.command);
        }

        let mut caps = Caps::empty();
        caps.set(Caps::READ, self.readable);
        caps.set(Caps::WRITE, self.writable);
        caps.set(Caps::ON_OFF, self.supports_on_off);
        caps.set(Caps::RANGE, self.supports_range);
        caps.set(Caps::LIST, self.supports_list);
        caps.set(Caps::STRING, self.is_string);
        caps.set(Caps::NUMERIC, self.is_numeric);

        Ok(Parameter {
            command: self.command,
            description: self.description,
            units: self.units,
            caps,
            minimum: self.minimum,
            maximum: self.maximum,
            valid_values: self.valid_values,
            value: 0.0,
            text: None,
            enabled: false,
            last_response: None,
        })
    }
}
// }}}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn builtin_catalog_shape() {
        let registry = Registry::with_builtin();
        assert_eq!(registry.parameters().len(), 26);

        let batv = registry.get("BATV");
        assert!(batv.is_readable());
        assert!(!batv.is_writable());
        assert!(batv.is_numeric());

        let reset = registry.get("RESET");
        assert!(reset.is_writable());
        assert!(!reset.is_readable());

        let rlc = registry.get("RLC");
        assert!(rlc.supports_list());
        assert_eq!(rlc.valid_values(), ["LVD", "DDC", "LSC"]);
    }

    #[test]
    fn lookup_is_case_sensitive() {
        let registry = Registry::with_builtin();
        assert!(registry.find("ReadAll").is_some());
        assert!(registry.find("readall").is_none());
    }

    #[test]
    #[should_panic]
    fn get_panics_on_unknown_token() {
        Registry::with_builtin().get("NOPE");
    }

    #[test]
    fn overlay_replaces_in_place_and_appends() {
        let mut registry = Registry::with_builtin();
        let position = registry
            .parameters()
            .iter()
            .position(|p| p.command() == "LVD")
            .unwrap();

        let mut replacement = Parameter::new_range(
            "LVD",
            "Low Voltage Disconnect Threshold",
            "Volts",
            Caps::READ_WRITE | Caps::RANGE,
            9.0,
            42.0,
        );
        replacement.set_value(10.0);
        let extra = Parameter::new("XTRA", "Vendor Extension", "", Caps::READ | Caps::STRING);
        registry.overlay(vec![replacement, extra]);

        assert_eq!(registry.parameters()[position].command(), "LVD");
        assert!((registry.get("LVD").maximum() - 42.0).abs() < f64::EPSILON);
        assert_eq!(registry.parameters().last().unwrap().command(), "XTRA");
        assert_eq!(registry.parameters().len(), 27);
    }

    #[test]
    fn catalog_survives_save_and_load() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let mut registry = Registry::with_builtin();
        assert!(registry.get_mut("LVD").parse_range_response("LVD=(9.50-42.00)"));
        registry.save_catalog(&path).unwrap();

        let mut fresh = Registry::with_builtin();
        assert!(fresh.load_catalog(&path).unwrap());
        assert!((fresh.get("LVD").minimum() - 9.5).abs() < f64::EPSILON);
        assert!((fresh.get("LVD").maximum() - 42.0).abs() < f64::EPSILON);
        assert_eq!(fresh.parameters().len(), 26);
    }

    #[test]
    fn missing_catalog_file_is_not_an_error() {
        let mut registry = Registry::with_builtin();
        assert!(!registry.load_catalog("/nonexistent/parameters.json").unwrap());
    }

    #[test]
    fn malformed_catalog_is_an_error() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "not json at all").unwrap();
        let path = file.path().to_str().unwrap();

        let mut registry = Registry::with_builtin();
        assert!(registry.load_catalog(path).is_err());
        assert_eq!(registry.parameters().len(), 26);
    }

    #[test]
    fn wrong_catalog_version_is_an_error() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            r#"{"version": 99, "saved_at": "2026-08-22T00:00:00+00:00", "parameters": []}"#,
        )
        .unwrap();
        let path = file.path().to_str().unwrap();

        let mut registry = Registry::with_builtin();
        assert!(registry.load_catalog(path).is_err());
    }

    #[test]
    fn illegal_capability_combination_is_rejected() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            r#"{
                "version": 1,
                "saved_at": "2026-08-22T00:00:00+00:00",
                "parameters": [{
                    "command": "BAD",
                    "description": "",
                    "readable": true,
                    "writable": false,
                    "supports_on_off": false,
                    "supports_range": false,
                    "supports_list": false,
                    "is_string": true,
                    "is_numeric": true
                }]
            }"#,
        )
        .unwrap();
        let path = file.path().to_str().unwrap();

        let mut registry = Registry::with_builtin();
        assert!(registry.load_catalog(path).is_err());
    }
}
