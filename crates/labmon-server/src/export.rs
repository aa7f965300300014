//! CSV export of readings.
//!
//! One row per measured signal, samples flattened in the order given. The
//! HTTP surface streams the result as `text/csv`.

use labmon_core::model::Sample;
use labmon_core::{MonitorError, MonitorResult};

pub fn readings_to_csv(samples: &[Sample]) -> MonitorResult<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record([
            "timestamp",
            "setup_id",
            "setup_name",
            "instrument_id",
            "instrument_name",
            "mode",
            "signal",
            "value",
            "raw_value",
            "unit",
            "raw_response",
            "error",
        ])
        .map_err(csv_error)?;

    for sample in samples {
        for target in &sample.targets {
            for (signal_name, reading) in &target.signals {
                writer
                    .write_record([
                        sample.timestamp.to_rfc3339().as_str(),
                        sample.setup_id.to_string().as_str(),
                        sample.setup_name.as_str(),
                        target.instrument_id.to_string().as_str(),
                        target.instrument_name.as_str(),
                        target.mode_name.as_str(),
                        signal_name.as_str(),
                        reading
                            .value
                            .map(|v| v.to_string())
                            .unwrap_or_default()
                            .as_str(),
                        reading
                            .raw_value
                            .map(|v| v.to_string())
                            .unwrap_or_default()
                            .as_str(),
                        reading.unit.as_str(),
                        reading.raw_response.as_str(),
                        reading.error.as_deref().unwrap_or(""),
                    ])
                    .map_err(csv_error)?;
            }
        }
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| MonitorError::Internal(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| MonitorError::Internal(e.to_string()))
}

fn csv_error(e: csv::Error) -> MonitorError {
    MonitorError::Internal(e.to_string())
}
