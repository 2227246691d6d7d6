use crate::prelude::*;

use crate::datalog_writer::DatalogWriter;
use crate::mcm::protocol::Engine;
use std::time::Duration;

/// One decoded READALL telemetry frame. Fields appear in wire order; the
/// controller reports voltage and currents in tenths, so those are scaled
/// here and everything downstream works in display units.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub battery_volts: f64,
    pub battery_amps: f64,
    pub load_amps: f64,
    pub temperature: f64,
    pub output_amps: f64,
    pub load_amp_hours: f64,
    pub battery_amp_hours: f64,
}

impl Snapshot {
    /// Decode the comma-separated READALL payload. Individual fields that
    /// fail to parse fall back to zero; a frame with the wrong field count
    /// is rejected outright.
    pub fn parse(raw: &str) -> Result<Self> {
        let fields: Vec<f64> = raw
            .split(',')
            .map(|field| field.trim().parse::<f64>().unwrap_or(0.0))
            .collect();
        if fields.len() != 7 {
            bail!("expected 7 telemetry fields in {:?}, got {}", raw, fields.len());
        }
        Ok(Self {
            battery_volts: fields[0] / 10.0,
            battery_amps: fields[1] / 10.0,
            load_amps: fields[2] / 10.0,
            temperature: fields[3],
            output_amps: fields[4] / 10.0,
            load_amp_hours: fields[5],
            battery_amp_hours: fields[6],
        })
    }
}

/// Owns the engine and runs the periodic poll: connection probe, READALL
/// snapshot, run timer and alarm reads, then a console line and a csv row.
pub struct Monitor {
    engine: Engine,
    writer: DatalogWriter,
    config: Config,
}

impl Monitor {
    pub fn new(engine: Engine, writer: DatalogWriter, config: Config) -> Self {
        Self {
            engine,
            writer,
            config,
        }
    }

    pub async fn start(&mut self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.startup().await;

        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms()));
        loop {
            tokio::select! {
                _ = interval.tick() => self.poll().await,
                _ = shutdown_rx.recv() => {
                    info!("monitor received shutdown signal");
                    break;
                }
            }
        }

        self.engine.close().await;
        Ok(())
    }

    /// Open the link, ask the controller for its limits and value lists,
    /// and persist the refreshed catalog for the next run.
    async fn startup(&mut self) {
        if !self.engine.open().await {
            warn!("{} did not open, will keep retrying", self.engine.describe());
            return;
        }

        self.refresh_limits().await;

        if let Err(err) = self
            .engine
            .registry()
            .save_catalog(&self.config.catalog_file())
        {
            warn!("could not save parameter catalog: {}", err);
        }
    }

    async fn refresh_limits(&mut self) {
        let tokens: Vec<String> = self
            .engine
            .registry()
            .parameters()
            .iter()
            .filter(|p| p.supports_range() || p.supports_list())
            .map(|p| p.command().to_string())
            .collect();

        for token in tokens {
            if self.engine.read_parameter_range(&token).await {
                let parameter = self.engine.parameter(&token);
                if parameter.supports_range() {
                    debug!(
                        "{} accepts {:.2} to {:.2} {}",
                        token,
                        parameter.minimum(),
                        parameter.maximum(),
                        parameter.units()
                    );
                } else {
                    debug!("{} accepts {:?}", token, parameter.valid_values());
                }
            } else {
                warn!("could not refresh limits for {}", token);
            }
        }
    }

    async fn poll(&mut self) {
        if !self.engine.is_open() {
            info!("reopening {}", self.engine.describe());
            if !self.engine.open().await {
                return;
            }
        }

        if !self.engine.check_connected().await {
            warn!("{} is not responding", self.engine.describe());
            return;
        }

        let snapshot = match self.read_snapshot().await {
            Some(snapshot) => snapshot,
            None => return,
        };

        let run_timer = if self.engine.read_parameter("AHT").await {
            self.engine.parameter("AHT").formatted_value()
        } else {
            String::new()
        };
        let alarm = if self.engine.read_parameter("ALM").await {
            self.engine.parameter("ALM").string_value()
        } else {
            String::new()
        };

        info!(
            "Volts: {:.1}; Amps: {:.1}; Load Amps: {:.1}; Battery: {:.1} AHr; Load: {:.1} AHr; Temperature: {:.0} C; AHr Run Timer: {}; Alarm: {}",
            snapshot.battery_volts,
            snapshot.battery_amps,
            snapshot.load_amps,
            snapshot.battery_amp_hours,
            snapshot.load_amp_hours,
            snapshot.temperature,
            run_timer,
            alarm
        );

        if let Err(err) = self.writer.write_row(&snapshot, &run_timer, &alarm) {
            warn!("could not append telemetry row: {}", err);
        }
    }

    async fn read_snapshot(&mut self) -> Option<Snapshot> {
        let _ = self.engine.registry_mut().get_mut("ReadAll").set_text("");
        if !self.engine.read_parameter("ReadAll").await {
            warn!("telemetry read failed");
            return None;
        }

        let raw = self.engine.parameter("ReadAll").string_value();
        match Snapshot::parse(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                warn!("bad telemetry frame: {}", err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_the_canonical_frame() {
        let snapshot = Snapshot::parse("124,-300,320,18,666,-3,2").unwrap();
        assert!((snapshot.battery_volts - 12.4).abs() < f64::EPSILON);
        assert!((snapshot.battery_amps - -30.0).abs() < f64::EPSILON);
        assert!((snapshot.load_amps - 32.0).abs() < f64::EPSILON);
        assert!((snapshot.temperature - 18.0).abs() < f64::EPSILON);
        assert!((snapshot.output_amps - 66.6).abs() < f64::EPSILON);
        assert!((snapshot.load_amp_hours - -3.0).abs() < f64::EPSILON);
        assert!((snapshot.battery_amp_hours - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_wrong_field_counts() {
        assert!(Snapshot::parse("124,-300,320").is_err());
        assert!(Snapshot::parse("1,2,3,4,5,6,7,8").is_err());
        assert!(Snapshot::parse("").is_err());
    }

    #[test]
    fn unparseable_fields_fall_back_to_zero() {
        let snapshot = Snapshot::parse("124,xx,320,18,666,-3,2").unwrap();
        assert!((snapshot.battery_amps - 0.0).abs() < f64::EPSILON);
        assert!((snapshot.battery_volts - 12.4).abs() < f64::EPSILON);
    }
}
