use crate::prelude::*;

use crate::mcm::parameter::{Parameter, TIME_COMMAND};
use crate::mcm::registry::Registry;
use crate::transport::Transport;
use chrono::{DateTime, Local};
use std::time::{Duration, Instant};

/// How long to sleep between polls of the receive buffer.
const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Slack added on top of the configured response timeout so a frame that
/// starts arriving right at the deadline still completes.
const RESPONSE_GRACE: Duration = Duration::from_millis(250);

/// Drives the command/response exchange with the controller. The link is
/// half duplex: one command goes out, then the engine polls the transport
/// until a CRLF-terminated response arrives or the timeout passes.
pub struct Engine {
    transport: Box<dyn Transport>,
    registry: Registry,
    response_timeout: Duration,
    responding: bool,
}

impl Engine {
    pub fn new(
        transport: Box<dyn Transport>,
        registry: Registry,
        response_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            registry,
            response_timeout,
            responding: false,
        }
    }

    /// Whether the last exchange got a usable response.
    pub fn responding(&self) -> bool {
        self.responding
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn parameter(&self, token: &str) -> &Parameter {
        self.registry.get(token)
    }

    /// Open the transport and silence command echo so responses come back
    /// clean. Returns whether the transport ended up open.
    pub async fn open(&mut self) -> bool {
        self.responding = false;
        if self.transport.is_open() {
            if let Err(err) = self.transport.close().await {
                debug!("closing {} before reopen: {}", self.transport.describe(), err);
            }
        }

        info!("opening {}", self.transport.describe());
        match self.transport.open().await {
            Ok(()) => {
                if let Err(err) = self.send_command("ECHO=OFF").await {
                    warn!("could not silence echo: {}", err);
                }
            }
            Err(err) => warn!("{}", err),
        }

        self.transport.is_open()
    }

    pub async fn close(&mut self) {
        if self.transport.is_open() {
            debug!("closing {}", self.transport.describe());
            if let Err(err) = self.transport.close().await {
                warn!("could not close {}: {}", self.transport.describe(), err);
            }
        }
    }

    /// Probe the controller by re-silencing echo and reading the firmware
    /// version. Also refreshes the responding flag.
    pub async fn check_connected(&mut self) -> bool {
        self.responding = false;
        if !self.transport.is_open() {
            return false;
        }
        if let Err(err) = self.send_command("ECHO=OFF").await {
            debug!("echo probe failed: {}", err);
            return false;
        }
        let _ = self.registry.get_mut("VER").set_text("");
        self.read_parameter("VER").await
    }

    /// Query one readable parameter and decode the response into it.
    /// Asking for a parameter without the read capability is a programming
    /// error.
    pub async fn read_parameter(&mut self, token: &str) -> bool {
        assert!(
            self.registry.get(token).is_readable(),
            "{} is not readable",
            token
        );

        if let Err(err) = self.send_command(&format!("{}?", token)).await {
            warn!("read {}: {}", token, err);
            self.responding = false;
            return false;
        }

        let ok = match self.wait_for_response().await {
            Some(response) => self.registry.get_mut(token).parse_command_response(&response),
            None => false,
        };
        self.responding = ok;
        ok
    }

    /// Ask the controller what a parameter accepts (`TOKEN=?`) and fold
    /// the reported bounds or value list into the registry.
    pub async fn read_parameter_range(&mut self, token: &str) -> bool {
        {
            let parameter = self.registry.get(token);
            assert!(
                parameter.supports_range() || parameter.supports_list(),
                "{} has no range or list form",
                token
            );
        }

        if let Err(err) = self.send_command(&format!("{}=?", token)).await {
            warn!("range query {}: {}", token, err);
            self.responding = false;
            return false;
        }

        let ok = match self.wait_for_response().await {
            Some(response) => self.registry.get_mut(token).parse_range_response(&response),
            None => false,
        };
        self.responding = ok;
        ok
    }

    /// Write a textual or numeric value. Writing to a parameter without
    /// the write capability is a programming error; an unparseable number
    /// for a numeric parameter is reported as failure.
    pub async fn write_parameter(&mut self, token: &str, value: &str) -> bool {
        let parameter = self.registry.get_mut(token);
        assert!(parameter.is_writable(), "{} is not writable", token);

        if parameter.is_numeric() || parameter.is_string() {
            if let Err(err) = parameter.set_text(value) {
                warn!("write {}: {}", token, err);
                return false;
            }
        } else {
            assert!(value.is_empty(), "{} takes no value", token);
        }

        self.send_current_value(token).await
    }

    /// Write the on/off flag, optionally with a value alongside it.
    pub async fn write_parameter_on_off(
        &mut self,
        token: &str,
        enabled: bool,
        value: Option<&str>,
    ) -> bool {
        let parameter = self.registry.get_mut(token);
        assert!(parameter.is_writable(), "{} is not writable", token);
        parameter.set_enabled(enabled);

        if let Some(value) = value {
            if let Err(err) = parameter.set_text(value) {
                warn!("write {}: {}", token, err);
                return false;
            }
        }

        self.send_current_value(token).await
    }

    /// Set the controller clock. Only valid for the clock parameter.
    pub async fn write_parameter_time(&mut self, token: &str, time: DateTime<Local>) -> bool {
        assert_eq!(
            self.registry.get(token).command(),
            TIME_COMMAND,
            "{} does not hold the controller clock",
            token
        );
        let rendered = time.format("%Y,%m,%d,%H,%M").to_string();
        self.write_parameter(token, &rendered).await
    }

    /// Compose the wire payload from the parameter's stored state, send
    /// it, and confirm via the echoed response when the parameter is
    /// readable. Write-only parameters succeed on transmission.
    async fn send_current_value(&mut self, token: &str) -> bool {
        let (payload, readable) = {
            let parameter = self.registry.get(token);
            let mut payload = String::new();
            if parameter.supports_on_off() {
                payload.push_str(if parameter.enabled() { "ON" } else { "OFF" });
                if parameter.is_numeric() || parameter.is_string() {
                    payload.push(',');
                }
            }
            if parameter.is_numeric() || parameter.is_string() {
                payload.push_str(&parameter.string_value());
            }
            (payload, parameter.is_readable())
        };

        let command = if payload.is_empty() {
            token.to_string()
        } else {
            format!("{}={}", token, payload)
        };
        if let Err(err) = self.send_command(&command).await {
            warn!("write {}: {}", token, err);
            self.responding = false;
            return false;
        }

        if !readable {
            return true;
        }

        let ok = match self.wait_for_response().await {
            Some(response) => self.registry.get_mut(token).parse_command_response(&response),
            None => false,
        };
        self.responding = ok;
        ok
    }

    /// Drain any stale input, then send one CR-terminated command.
    async fn send_command(&mut self, command: &str) -> Result<()> {
        if !self.transport.is_open() {
            bail!("{} is not open", self.transport.describe());
        }
        match self.transport.read_available() {
            Ok(stale) if !stale.is_empty() => trace!("discarding stale input {:?}", stale),
            Ok(_) => {}
            Err(err) => debug!("could not drain stale input: {}", err),
        }
        trace!("TX {:?}", command);
        self.transport.write(&format!("{}\r", command)).await
    }

    /// Poll the transport for a CRLF-terminated response. Leading CRLF
    /// noise ahead of the frame is dropped; on success the returned string
    /// has an `OK:` acknowledgement prefix and all CRLF framing removed.
    async fn wait_for_response(&mut self) -> Option<String> {
        let deadline = Instant::now() + self.response_timeout + RESPONSE_GRACE;
        let mut response = String::new();

        loop {
            if Instant::now() >= deadline {
                trace!("response timeout, buffer so far {:?}", response);
                self.responding = false;
                return None;
            }

            let pending = match self.transport.bytes_available() {
                Ok(pending) => pending,
                Err(err) => {
                    warn!("transport failed while waiting: {}", err);
                    self.responding = false;
                    return None;
                }
            };

            if pending == 0 {
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }

            match self.transport.read_available() {
                Ok(chunk) => response.push_str(&chunk),
                Err(err) => {
                    warn!("transport failed while waiting: {}", err);
                    self.responding = false;
                    return None;
                }
            }

            if response.starts_with("\r\n") {
                response = response.trim_start_matches(['\r', '\n']).to_string();
            }
            if response.contains("\r\n") {
                break;
            }
        }

        let response = strip_framing(&response);
        trace!("RX {:?}", response);
        Some(response)
    }
}

fn strip_framing(response: &str) -> String {
    let response = match response.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("OK:") => &response[3..],
        _ => response,
    };
    response.replace("\r\n", "")
}
