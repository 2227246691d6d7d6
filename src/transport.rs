use crate::prelude::*;

use async_trait::async_trait;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Port name that selects the simulated controller instead of real
/// hardware, for development and tests without a device on the bench.
pub const MOCK_PORT_NAME: &str = "mock";

const READ_TIMEOUT_MS: u64 = 50;

/// Byte pipe to the controller. The protocol is half duplex so the engine
/// polls `bytes_available` between writes rather than blocking on reads.
#[async_trait]
pub trait Transport: Send {
    fn is_open(&self) -> bool;
    async fn open(&mut self) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
    fn bytes_available(&mut self) -> Result<usize>;
    /// Drain whatever the controller has sent so far, possibly nothing.
    fn read_available(&mut self) -> Result<String>;
    async fn write(&mut self, data: &str) -> Result<()>;
    /// Short human description of the endpoint for log lines.
    fn describe(&self) -> String;
}

pub fn from_config(settings: &config::Serial) -> Box<dyn Transport> {
    if settings.port() == MOCK_PORT_NAME {
        Box::new(MockTransport::new())
    } else {
        Box::new(SerialTransport::new(settings.clone()))
    }
}

// SerialTransport {{{
pub struct SerialTransport {
    settings: config::Serial,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn new(settings: config::Serial) -> Self {
        Self {
            settings,
            port: None,
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    async fn open(&mut self) -> Result<()> {
        self.port = None;

        let port = serialport::new(self.settings.port(), self.settings.baud())
            .data_bits(data_bits(self.settings.data_bits())?)
            .parity(parity(self.settings.parity())?)
            .stop_bits(stop_bits(self.settings.stop_bits())?)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(READ_TIMEOUT_MS))
            .open()
            .map_err(|err| anyhow!("could not open {}: {}", self.describe(), err))?;

        self.port = Some(port);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.port = None;
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| anyhow!("{} is not open", self.settings.port()))?;
        Ok(port.bytes_to_read()? as usize)
    }

    fn read_available(&mut self) -> Result<String> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| anyhow!("{} is not open", self.settings.port()))?;
        let pending = port.bytes_to_read()? as usize;
        if pending == 0 {
            return Ok(String::new());
        }
        let mut buffer = vec![0u8; pending];
        port.read_exact(&mut buffer)
            .map_err(|err| anyhow!("read from {} failed: {}", self.settings.port(), err))?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    async fn write(&mut self, data: &str) -> Result<()> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| anyhow!("{} is not open", self.settings.port()))?;
        port.write_all(data.as_bytes())
            .map_err(|err| anyhow!("write to {} failed: {}", self.settings.port(), err))?;
        port.flush()?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "{}:{},{},{},{}",
            self.settings.port(),
            self.settings.baud(),
            self.settings.data_bits(),
            self.settings.parity(),
            self.settings.stop_bits()
        )
    }
}

fn data_bits(bits: u8) -> Result<DataBits> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => bail!("unsupported data bits: {}", bits),
    }
}

fn parity(name: &str) -> Result<Parity> {
    match name.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => bail!("unsupported parity: {}", name),
    }
}

fn stop_bits(bits: u8) -> Result<StopBits> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => bail!("unsupported stop bits: {}", bits),
    }
}
// }}}

// MockTransport {{{
/// Simulated controller. Echo commands are swallowed, VER? and READALL?
/// answer with canned frames, and tests can script anything else.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    open: bool,
    read_buffer: String,
    stubs: Vec<(String, String)>,
    silent: bool,
    max_chunk: Option<usize>,
    sent: Vec<String>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a response for one exact command (without the trailing CR).
    pub fn stub(&self, command: &str, response: &str) {
        let mut state = self.lock();
        state.stubs.push((command.to_string(), response.to_string()));
    }

    /// Swallow all commands without answering, to exercise timeouts.
    pub fn set_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    /// Cap how many characters a single read returns, to exercise
    /// reassembly of responses that arrive in pieces.
    pub fn set_max_chunk(&self, max: usize) {
        self.lock().max_chunk = Some(max);
    }

    /// Append raw bytes to the pending read buffer, as if the controller
    /// had sent them unprompted.
    pub fn inject(&self, data: &str) {
        self.lock().read_buffer.push_str(data);
    }

    /// Everything written so far, trailing CR included.
    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn respond(state: &mut MockState, input: &str) {
    let command = input.trim();
    if let Some(response) = state
        .stubs
        .iter()
        .find(|(c, _)| c.eq_ignore_ascii_case(command))
        .map(|(_, r)| r.clone())
    {
        state.read_buffer.push_str(&response);
        return;
    }

    let head = command
        .split_once('=')
        .map(|(head, _)| head)
        .unwrap_or(command)
        .trim();
    if head.eq_ignore_ascii_case("ECHO") {
        return;
    }

    if command.eq_ignore_ascii_case("VER?") {
        state.read_buffer.push_str("\r\nOK:VER=1.0\r\n");
    } else if command.eq_ignore_ascii_case("READALL?") {
        state
            .read_buffer
            .push_str("\r\nOK:READALL=124,-300,320,18,666,-3,2\r\n");
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn is_open(&self) -> bool {
        self.lock().open
    }

    async fn open(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.open = true;
        state.read_buffer.clear();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.lock().open = false;
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize> {
        let state = self.lock();
        if !state.open {
            bail!("mock port is not open");
        }
        Ok(state.read_buffer.len())
    }

    fn read_available(&mut self) -> Result<String> {
        let mut state = self.lock();
        if !state.open {
            bail!("mock port is not open");
        }
        let available = state.read_buffer.len();
        let take = state.max_chunk.map_or(available, |max| max.min(available));
        Ok(state.read_buffer.drain(..take).collect())
    }

    async fn write(&mut self, data: &str) -> Result<()> {
        let mut state = self.lock();
        if !state.open {
            bail!("mock port is not open");
        }
        state.sent.push(data.to_string());
        if state.silent {
            return Ok(());
        }
        respond(&mut state, data);
        Ok(())
    }

    fn describe(&self) -> String {
        MOCK_PORT_NAME.to_string()
    }
}
// }}}
