use crate::prelude::*;
use crate::monitor::Snapshot;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const CSV_HEADER: &str =
    "Timestamp;Volts;Amps;Load Amps;Battery (AHr);Load (AHr);Temperature (C);AHr Run Timer;Alarm";

/// Appends one semicolon-separated telemetry row per poll. The file is
/// started fresh on every run, header first.
#[derive(Debug, Clone)]
pub struct DatalogWriter {
    file: Arc<Mutex<std::fs::File>>,
    path: String,
    rows_written: Arc<Mutex<u64>>,
}

impl DatalogWriter {
    pub fn new(path: &str) -> Result<Self> {
        info!("Opening telemetry log at {}", path);

        // Ensure the directory exists
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = match std::fs::File::create(path) {
            Ok(f) => f,
            Err(e) => {
                error!("Failed to create telemetry log {}: {}", path, e);
                return Err(e.into());
            }
        };

        // Set file permissions to 0644
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)) {
                error!("Failed to set permissions on telemetry log {}: {}", path, e);
                return Err(e.into());
            }
        }

        writeln!(file, "{}", CSV_HEADER)?;
        file.flush()?;

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            path: path.to_string(),
            rows_written: Arc::new(Mutex::new(0)),
        })
    }

    /// File name used when none is configured, unique per run.
    pub fn default_path() -> String {
        format!(
            "mcm-bridge_{}.csv",
            chrono::Local::now().format("%Y%m%d-%H%M%S")
        )
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Append one row. Fields that could not be read this cycle arrive as
    /// empty strings and stay empty in the file.
    pub fn write_row(&self, snapshot: &Snapshot, run_timer: &str, alarm: &str) -> Result<()> {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let row = format!(
            "{};{:.1};{:.1};{:.1};{:.1};{:.1};{:.0};{};{}",
            timestamp,
            snapshot.battery_volts,
            snapshot.battery_amps,
            snapshot.load_amps,
            snapshot.battery_amp_hours,
            snapshot.load_amp_hours,
            snapshot.temperature,
            run_timer,
            alarm,
        );

        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow!("Failed to lock telemetry log"))?;
        match writeln!(file, "{}", row) {
            Ok(_) => {
                if let Err(e) = file.flush() {
                    error!("Failed to flush telemetry log {}: {}", self.path, e);
                    return Err(e.into());
                }

                let mut rows_written = self
                    .rows_written
                    .lock()
                    .map_err(|_| anyhow!("Failed to lock row counter"))?;
                *rows_written += 1;
                debug!("{} rows written to {}", *rows_written, self.path);

                Ok(())
            }
            Err(e) => {
                error!("Failed to write to telemetry log {}: {}", self.path, e);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn snapshot() -> Snapshot {
        Snapshot {
            battery_volts: 12.4,
            battery_amps: -30.0,
            load_amps: 32.0,
            temperature: 18.0,
            output_amps: 66.6,
            load_amp_hours: -3.0,
            battery_amp_hours: 2.0,
        }
    }

    #[test]
    fn starts_with_the_header() -> Result<()> {
        let temp_file = NamedTempFile::new()?;
        let _writer = DatalogWriter::new(temp_file.path().to_str().unwrap())?;

        let contents = std::fs::read_to_string(temp_file.path())?;
        assert_eq!(contents.lines().next(), Some(CSV_HEADER));
        Ok(())
    }

    #[test]
    fn rows_carry_all_nine_fields() -> Result<()> {
        let temp_file = NamedTempFile::new()?;
        let writer = DatalogWriter::new(temp_file.path().to_str().unwrap())?;

        writer.write_row(&snapshot(), "12:00:00", "NONE")?;

        let contents = std::fs::read_to_string(temp_file.path())?;
        let row = contents.lines().nth(1).unwrap();
        assert_eq!(row.split(';').count(), 9);
        assert!(row.ends_with(";12.4;-30.0;32.0;2.0;-3.0;18;12:00:00;NONE"));
        Ok(())
    }

    #[test]
    fn unavailable_fields_stay_empty() -> Result<()> {
        let temp_file = NamedTempFile::new()?;
        let writer = DatalogWriter::new(temp_file.path().to_str().unwrap())?;

        writer.write_row(&snapshot(), "", "")?;

        let contents = std::fs::read_to_string(temp_file.path())?;
        let row = contents.lines().nth(1).unwrap();
        assert_eq!(row.split(';').count(), 9);
        assert!(row.ends_with(";18;;"));
        Ok(())
    }

    #[test]
    fn reruns_start_the_file_over() -> Result<()> {
        let temp_file = NamedTempFile::new()?;
        let path = temp_file.path().to_str().unwrap().to_string();

        let writer = DatalogWriter::new(&path)?;
        writer.write_row(&snapshot(), "12:00:00", "NONE")?;
        drop(writer);

        let _writer = DatalogWriter::new(&path)?;
        let contents = std::fs::read_to_string(&path)?;
        assert_eq!(contents.lines().count(), 1);
        Ok(())
    }
}
