use crate::prelude::*;

use bitflags::bitflags;

/// Command token of the parameter holding the controller clock. Its value
/// travels as `YYYY,MM,DD,HH,MM` and gets special display formatting.
pub const TIME_COMMAND: &str = "TIME";

bitflags! {
    /// What a parameter supports on the wire. A parameter is numeric or
    /// string valued, never both, and a range form always implies numeric.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caps: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        const ON_OFF = 0x04;
        const RANGE = 0x08;
        const LIST = 0x10;
        const STRING = 0x20;
        const NUMERIC = 0x40;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// One controller parameter: its command token, capabilities, limits and the
/// last values decoded off the wire.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub(crate) command: String,
    pub(crate) description: String,
    pub(crate) units: String,
    pub(crate) caps: Caps,
    pub(crate) minimum: f64,
    pub(crate) maximum: f64,
    pub(crate) valid_values: Vec<String>,
    pub(crate) value: f64,
    pub(crate) text: Option<String>,
    pub(crate) enabled: bool,
    pub(crate) last_response: Option<String>,
}

impl Parameter {
    pub fn new(command: &str, description: &str, units: &str, caps: Caps) -> Self {
        assert!(
            !caps.contains(Caps::RANGE),
            "{}: range parameters must be built with new_range",
            command
        );
        Self::assemble(command, description, units, caps, 0.0, 0.0, Vec::new())
    }

    pub fn new_range(
        command: &str,
        description: &str,
        units: &str,
        caps: Caps,
        minimum: f64,
        maximum: f64,
    ) -> Self {
        assert!(
            caps.contains(Caps::RANGE),
            "{}: new_range requires the range capability",
            command
        );
        assert!(
            !caps.contains(Caps::LIST),
            "{}: a parameter cannot be both range and list",
            command
        );
        Self::assemble(
            command,
            description,
            units,
            caps | Caps::NUMERIC,
            minimum,
            maximum,
            Vec::new(),
        )
    }

    pub fn new_list(command: &str, description: &str, caps: Caps, valid_values: &[&str]) -> Self {
        assert!(
            !caps.contains(Caps::RANGE),
            "{}: a parameter cannot be both range and list",
            command
        );
        Self::assemble(
            command,
            description,
            "",
            caps | Caps::LIST | Caps::READ_WRITE,
            0.0,
            0.0,
            valid_values.iter().map(|v| v.to_string()).collect(),
        )
    }

    fn assemble(
        command: &str,
        description: &str,
        units: &str,
        caps: Caps,
        minimum: f64,
        maximum: f64,
        valid_values: Vec<String>,
    ) -> Self {
        assert!(!command.is_empty(), "parameter needs a command token");
        assert!(
            !caps.contains(Caps::STRING | Caps::NUMERIC),
            "{}: a parameter is string or numeric, not both",
            command
        );
        Self {
            command: command.to_string(),
            description: description.to_string(),
            units: units.to_string(),
            caps,
            minimum,
            maximum,
            valid_values,
            value: 0.0,
            text: None,
            enabled: false,
            last_response: None,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
    pub fn description(&self) -> &str {
        &self.description
    }
    pub fn units(&self) -> &str {
        &self.units
    }
    pub fn caps(&self) -> Caps {
        self.caps
    }
    pub fn minimum(&self) -> f64 {
        self.minimum
    }
    pub fn maximum(&self) -> f64 {
        self.maximum
    }
    pub fn valid_values(&self) -> &[String] {
        &self.valid_values
    }
    pub fn value(&self) -> f64 {
        self.value
    }
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }
    pub fn enabled(&self) -> bool {
        self.enabled
    }
    pub fn last_response(&self) -> Option<&str> {
        self.last_response.as_deref()
    }

    pub fn is_readable(&self) -> bool {
        self.caps.contains(Caps::READ)
    }
    pub fn is_writable(&self) -> bool {
        self.caps.contains(Caps::WRITE)
    }
    pub fn supports_on_off(&self) -> bool {
        self.caps.contains(Caps::ON_OFF)
    }
    pub fn supports_range(&self) -> bool {
        self.caps.contains(Caps::RANGE)
    }
    pub fn supports_list(&self) -> bool {
        self.caps.contains(Caps::LIST)
    }
    pub fn is_string(&self) -> bool {
        self.caps.contains(Caps::STRING)
    }
    pub fn is_numeric(&self) -> bool {
        self.caps.contains(Caps::NUMERIC)
    }

    /// Store a numeric value. Calling this on a non-numeric parameter is a
    /// programming error.
    pub fn set_value(&mut self, value: f64) {
        assert!(
            self.is_numeric(),
            "{}: not a numeric parameter",
            self.command
        );
        self.value = value;
    }

    /// Store a textual value. For numeric parameters the text must parse as
    /// a number; for string parameters it is kept verbatim.
    pub fn set_text(&mut self, text: &str) -> Result<()> {
        if self.is_numeric() {
            let value = text
                .trim()
                .parse::<f64>()
                .map_err(|_| anyhow!("{}: not a number: {:?}", self.command, text))?;
            self.value = value;
            return Ok(());
        }
        assert!(self.is_string(), "{}: takes no value", self.command);
        self.text = Some(text.to_string());
        Ok(())
    }

    /// Store the on/off flag. Calling this on a parameter without the
    /// on/off capability is a programming error.
    pub fn set_enabled(&mut self, enabled: bool) {
        assert!(
            self.supports_on_off(),
            "{}: has no on/off flag",
            self.command
        );
        self.enabled = enabled;
    }

    /// The value as it is written to the wire: numerics always carry two
    /// decimals, strings go out verbatim.
    pub fn string_value(&self) -> String {
        if self.is_numeric() {
            return format!("{:.2}", self.value);
        }
        assert!(self.is_string(), "{}: has no value form", self.command);
        self.text.clone().unwrap_or_default()
    }

    /// The value as shown to people. The clock parameter is rewritten from
    /// `YYYY,MM,DD,HH,MM` to `DD/MM/YYYY HH:MM`; everything else matches
    /// [`string_value`](Self::string_value).
    pub fn formatted_value(&self) -> String {
        if self.command == TIME_COMMAND {
            let text = match &self.text {
                Some(text) => text,
                None => return String::new(),
            };
            let parts: Vec<&str> = text.split(',').collect();
            if parts.len() < 5 {
                return text.clone();
            }
            return format!(
                "{}/{}/{} {}:{}",
                parts[2], parts[1], parts[0], parts[3], parts[4]
            );
        }
        if self.is_numeric() {
            return format!("{:.2}", self.value);
        }
        self.text.clone().unwrap_or_default()
    }

    /// Decode a `TOKEN=payload` read/write response. Returns true when at
    /// least one facet of the parameter (flag, number or text) was updated.
    pub fn parse_command_response(&mut self, response: &str) -> bool {
        self.last_response = Some(response.to_string());

        let Some((token, rest)) = response.split_once('=') else {
            warn!("{}: no '=' in response {:?}", self.command, response);
            return false;
        };
        if !token.eq_ignore_ascii_case(&self.command) {
            warn!(
                "{}: response {:?} belongs to {:?}",
                self.command, response, token
            );
            return false;
        }

        let mut payload = rest.to_uppercase();
        let mut decoded = false;

        if self.supports_on_off() {
            if payload.starts_with("ON") {
                self.enabled = true;
                decoded = true;
            } else if payload.starts_with("OFF") {
                self.enabled = false;
                decoded = true;
            }
            // A combined payload looks like "ON,25.50"; drop everything
            // through the first comma so the value decode below sees "25.50".
            if let Some(offset) = payload.get(1..).and_then(|rest| rest.find(',')) {
                payload.drain(..offset + 2);
            }
        }

        if self.is_numeric() {
            if let Ok(value) = payload.trim().parse::<f64>() {
                self.value = value;
                decoded = true;
            }
        } else if self.is_string() {
            self.text = Some(payload);
            decoded = true;
        } else if self.supports_on_off() {
            self.enabled = payload.contains("ON");
            decoded = true;
        } else {
            warn!(
                "{}: response {:?} does not fit capabilities {:?}",
                self.command, response, self.caps
            );
        }

        trace!("{}: decoded={} {:?}", self.command, decoded, response);
        decoded
    }

    /// Decode a `TOKEN=?` range query response. Depending on what the
    /// controller reports this may add the on/off capability, numeric
    /// bounds or a list of accepted tokens.
    pub fn parse_range_response(&mut self, response: &str) -> bool {
        self.last_response = Some(response.to_string());

        let Some((token, rest)) = response.split_once('=') else {
            warn!("{}: no '=' in response {:?}", self.command, response);
            return false;
        };
        if !token.eq_ignore_ascii_case(&self.command) {
            warn!(
                "{}: response {:?} belongs to {:?}",
                self.command, response, token
            );
            return false;
        }

        let mut payload = rest.to_uppercase();

        if let Some(pos) = payload.find("ON/OFF") {
            self.caps.insert(Caps::ON_OFF);
            let after = pos + "ON/OFF".len();
            let end = match payload[after..].find(',') {
                Some(comma) => after + comma + 1,
                None => after,
            };
            payload.drain(..end);
        }

        // Bounds and parenthesised enumerations: "(8.00-53.00)", a bare
        // "8.00-53.00", or "(LVD,DDC,LSC)".
        let inner = match (payload.find('('), payload.rfind(')')) {
            (Some(open), Some(close)) if open < close => {
                Some(payload[open + 1..close].to_string())
            }
            _ => find_bound_separator(&payload).map(|_| payload.clone()),
        };

        if let Some(inner) = inner {
            if let Some(dash) = find_bound_separator(&inner) {
                if self.is_string() {
                    warn!(
                        "{}: numeric bounds offered for a text parameter: {:?}",
                        self.command, response
                    );
                    return false;
                }
                let lo = inner[..dash].trim().parse::<f64>();
                let hi = inner[dash + 1..].trim().parse::<f64>();
                let (Ok(lo), Ok(hi)) = (lo, hi) else {
                    warn!("{}: unparseable bounds {:?}", self.command, inner);
                    return false;
                };
                let (minimum, maximum) = if lo <= hi { (lo, hi) } else { (hi, lo) };
                self.minimum = minimum;
                self.maximum = maximum;
                self.caps.insert(Caps::RANGE | Caps::NUMERIC);
                self.caps.remove(Caps::LIST);
                trace!("{}: limits {}..{}", self.command, self.minimum, self.maximum);
                return true;
            }
            return self.store_valid_values(&inner);
        }

        // A bare enumeration without parentheses needs at least three
        // entries to be taken as a list.
        if payload.matches(',').count() >= 2 {
            return self.store_valid_values(&payload);
        }

        warn!(
            "{}: unrecognised range response {:?}",
            self.command, response
        );
        false
    }

    fn store_valid_values(&mut self, list: &str) -> bool {
        let values: Vec<String> = list
            .split(',')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        if values.is_empty() {
            warn!("{}: empty value list", self.command);
            return false;
        }
        trace!("{}: accepts {:?}", self.command, values);
        self.valid_values = values;
        self.caps.insert(Caps::LIST);
        self.caps.remove(Caps::RANGE);
        true
    }
}

/// Position of the '-' separating two bounds, skipping any leading sign. A
/// dash only separates when the character before it belongs to a number, so
/// "-50.0--1000.0" splits after the first bound.
fn find_bound_separator(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    (1..bytes.len())
        .find(|&i| bytes[i] == b'-' && (bytes[i - 1].is_ascii_digit() || bytes[i - 1] == b'.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(caps: Caps) -> Parameter {
        Parameter::new("OVP", "Output Voltage Programming", "V", caps | Caps::NUMERIC)
    }

    #[test]
    fn renders_numbers_with_two_decimals() {
        let mut p = numeric(Caps::READ_WRITE);
        p.set_value(12.3);
        assert_eq!(p.string_value(), "12.30");
        p.set_value(-0.5);
        assert_eq!(p.string_value(), "-0.50");
    }

    #[test]
    fn set_text_round_trips_within_rendering_precision() {
        let mut p = numeric(Caps::READ_WRITE);
        p.set_text("48.5").unwrap();
        let rendered = p.string_value();
        let back: f64 = rendered.parse().unwrap();
        assert!((back - 48.5).abs() < 0.005);
    }

    #[test]
    fn set_text_rejects_garbage_on_numeric() {
        let mut p = numeric(Caps::READ_WRITE);
        assert!(p.set_text("four").is_err());
    }

    #[test]
    #[should_panic]
    fn set_value_requires_numeric() {
        let mut p = Parameter::new("ALM", "Alarms", "", Caps::READ | Caps::STRING);
        p.set_value(1.0);
    }

    #[test]
    #[should_panic]
    fn string_and_numeric_are_exclusive() {
        Parameter::new("BAD", "", "", Caps::STRING | Caps::NUMERIC);
    }

    #[test]
    #[should_panic]
    fn range_parameters_need_the_range_constructor() {
        Parameter::new("BAD", "", "", Caps::READ_WRITE | Caps::RANGE);
    }

    #[test]
    fn decodes_flag_then_number() {
        let mut p = numeric(Caps::READ_WRITE | Caps::ON_OFF);
        assert!(p.parse_command_response("OVP=ON,56.00"));
        assert!(p.enabled());
        assert!((p.value() - 56.0).abs() < f64::EPSILON);

        assert!(p.parse_command_response("OVP=OFF,10.50"));
        assert!(!p.enabled());
        assert!((p.value() - 10.5).abs() < f64::EPSILON);
    }

    #[test]
    fn flag_alone_still_counts_as_decoded() {
        let mut p = numeric(Caps::READ_WRITE | Caps::ON_OFF);
        p.set_value(56.0);
        assert!(p.parse_command_response("OVP=ON,JUNK"));
        assert!(p.enabled());
        assert!((p.value() - 56.0).abs() < f64::EPSILON);
    }

    #[test]
    fn number_alone_still_counts_as_decoded() {
        let mut p = numeric(Caps::READ_WRITE | Caps::ON_OFF);
        assert!(p.parse_command_response("OVP=MAYBE,55.00"));
        assert!((p.value() - 55.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_missing_separator() {
        let mut p = numeric(Caps::READ_WRITE);
        assert!(!p.parse_command_response("OVP 56.00"));
    }

    #[test]
    fn rejects_uncorrelated_token() {
        let mut p = numeric(Caps::READ_WRITE);
        assert!(!p.parse_command_response("LVD=48.00"));
        assert!((p.value() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn token_match_ignores_case() {
        let mut p = numeric(Caps::READ_WRITE);
        assert!(p.parse_command_response("ovp=12.00"));
        assert!((p.value() - 12.0).abs() < f64::EPSILON);
    }

    #[test]
    fn stores_uppercased_text() {
        let mut p = Parameter::new("ALM", "Alarms", "", Caps::READ | Caps::STRING);
        assert!(p.parse_command_response("ALM=Low Battery"));
        assert_eq!(p.text(), Some("LOW BATTERY"));
    }

    #[test]
    fn pure_flag_parameter_decodes_on() {
        let mut p = Parameter::new("LSC", "Load Switch", "", Caps::READ_WRITE | Caps::ON_OFF);
        assert!(p.parse_command_response("LSC=ON"));
        assert!(p.enabled());
        assert!(p.parse_command_response("LSC=OFF"));
        assert!(!p.enabled());
    }

    #[test]
    fn list_parameter_keeps_selection_after_flag() {
        let mut p = Parameter::new_list(
            "RLC",
            "Remote Load Control",
            Caps::STRING | Caps::ON_OFF,
            &["LVD", "DDC", "LSC"],
        );
        assert!(p.parse_command_response("RLC=ON,LVD"));
        assert!(p.enabled());
        assert_eq!(p.text(), Some("LVD"));
    }

    #[test]
    fn range_response_sets_bounds() {
        let mut p = Parameter::new_range(
            "LVD",
            "Low Voltage Disconnect",
            "Volts",
            Caps::READ_WRITE | Caps::RANGE,
            0.0,
            0.0,
        );
        assert!(p.parse_range_response("LVD=(8.00-53.00)"));
        assert!((p.minimum() - 8.0).abs() < f64::EPSILON);
        assert!((p.maximum() - 53.0).abs() < f64::EPSILON);
    }

    #[test]
    fn range_response_with_flag_segment() {
        let mut p = numeric(Caps::READ_WRITE);
        assert!(p.parse_range_response("OVP=ON/OFF,(8.0-58.0)"));
        assert!(p.supports_on_off());
        assert!(p.supports_range());
        assert!((p.minimum() - 8.0).abs() < f64::EPSILON);
        assert!((p.maximum() - 58.0).abs() < f64::EPSILON);
    }

    #[test]
    fn reversed_bounds_are_normalised() {
        let mut p = Parameter::new_range(
            "BAH",
            "Battery AmpHour Alarm",
            "AmpHours",
            Caps::READ_WRITE | Caps::RANGE | Caps::ON_OFF,
            0.0,
            0.0,
        );
        assert!(p.parse_range_response("BAH=(-50.0--1000.0)"));
        assert!((p.minimum() - -1000.0).abs() < f64::EPSILON);
        assert!((p.maximum() - -50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn range_response_may_enumerate_values() {
        let mut p = Parameter::new_list("RLC", "Remote Load Control", Caps::STRING, &[]);
        assert!(p.parse_range_response("RLC=LVD,DDC,LSC"));
        assert!(p.supports_list());
        assert_eq!(p.valid_values(), ["LVD", "DDC", "LSC"]);
    }

    #[test]
    fn unrecognised_range_shape_fails() {
        let mut p = numeric(Caps::READ_WRITE);
        assert!(!p.parse_range_response("OVP=56.00"));
    }

    #[test]
    fn clock_value_is_reformatted_for_display() {
        let mut p = Parameter::new(
            TIME_COMMAND,
            "System Time",
            "",
            Caps::READ_WRITE | Caps::STRING,
        );
        p.set_text("2026,08,22,13,45").unwrap();
        assert_eq!(p.formatted_value(), "22/08/2026 13:45");
    }
}
