//! Download formats for a finished (or interrupted) session.
//!
//! The average temperature is rendered with one decimal; every other number
//! is a plain integer.

use core::fmt::Write;

extern crate alloc;
use alloc::borrow::Cow;
use alloc::string::String;

use serde::Serialize;

use super::record::{BrewSession, TemperatureSample};

/// Session header as it appears in exports and API payloads
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary<'a> {
    pub id: u32,
    pub name: &'a str,
    pub schedule: &'a str,
    pub start_time: u32,
    pub end_time: u32,
    pub duration_seconds: u32,
    pub data_points: u32,
    pub avg_temperature: f64,
    pub min_temperature: i32,
    pub max_temperature: i32,
    pub completed: bool,
}

impl<'a> From<&'a BrewSession> for SessionSummary<'a> {
    fn from(session: &'a BrewSession) -> Self {
        Self {
            id: session.session_id,
            name: session.name.as_str(),
            schedule: session.schedule_name.as_str(),
            start_time: session.start_time,
            end_time: session.end_time,
            duration_seconds: session.total_duration_secs,
            data_points: session.sample_count,
            avg_temperature: one_decimal(session.avg_temperature),
            min_temperature: session.min_temperature as i32,
            max_temperature: session.max_temperature as i32,
            completed: session.completed,
        }
    }
}

#[derive(Serialize)]
struct SessionExport<'a> {
    session: SessionSummary<'a>,
    data: &'a [TemperatureSample],
}

/// Round half away from zero to one decimal place.
///
/// Widened to f64 first so JSON renders the shortest decimal form.
pub fn one_decimal(value: f32) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    let scaled = f64::from(value) * 10.0;
    let rounded = if scaled >= 0.0 {
        (scaled + 0.5) as i64
    } else {
        (scaled - 0.5) as i64
    };
    rounded as f64 / 10.0
}

pub fn session_to_json(session: &BrewSession, samples: &[TemperatureSample]) -> String {
    let export = SessionExport {
        session: SessionSummary::from(session),
        data: samples,
    };
    serde_json::to_string(&export).unwrap_or_else(|e| {
        log::error!("Failed to render session {} as JSON: {}", session.session_id, e);
        String::from("{}")
    })
}

pub fn session_to_csv(session: &BrewSession, samples: &[TemperatureSample]) -> String {
    let mut out = String::with_capacity(256 + samples.len() * 20);

    // Writing into a String cannot fail
    let _ = writeln!(out, "# session,{}", session.session_id);
    let _ = writeln!(out, "# name,{}", escape_csv(&session.name));
    let _ = writeln!(out, "# schedule,{}", escape_csv(&session.schedule_name));
    let _ = writeln!(out, "# start_time,{}", session.start_time);
    let _ = writeln!(out, "# end_time,{}", session.end_time);
    let _ = writeln!(out, "# duration_seconds,{}", session.total_duration_secs);
    let _ = writeln!(out, "# avg_temperature,{:.1}", one_decimal(session.avg_temperature));
    let _ = writeln!(out, "# min_temperature,{}", session.min_temperature as i32);
    let _ = writeln!(out, "# max_temperature,{}", session.max_temperature as i32);
    let _ = writeln!(out, "# completed,{}", session.completed);
    let _ = writeln!(
        out,
        "timestamp,avg_temperature,target_temperature,output_percent"
    );

    for sample in samples {
        let _ = writeln!(
            out,
            "{},{},{},{}",
            sample.timestamp,
            sample.avg_temperature,
            sample.target_temperature,
            sample.output_percent
        );
    }

    out
}

fn escape_csv(s: &str) -> Cow<'_, str> {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        Cow::Owned(alloc::format!("\"{}\"", s.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    fn mash1() -> (BrewSession, [TemperatureSample; 3]) {
        let samples = [
            TemperatureSample::new(0, 20.0, 65.0, 50),
            TemperatureSample::new(60, 40.0, 65.0, 80),
            TemperatureSample::new(120, 65.0, 65.0, 10),
        ];
        let mut session = BrewSession::begin(3, 0, "Mash1", "Saison, batch 2");
        session.finalize(180, &samples);
        (session, samples)
    }

    #[test]
    fn test_one_decimal() {
        assert_eq!(one_decimal(41.666_67), 41.7);
        assert_eq!(one_decimal(41.64), 41.6);
        assert_eq!(one_decimal(-2.25), -2.3);
        assert_eq!(one_decimal(f32::NAN), 0.0);
    }

    #[test]
    fn test_json_export() {
        let (session, samples) = mash1();
        let json = session_to_json(&session, &samples);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["session"]["id"], 3);
        assert_eq!(value["session"]["schedule"], "Mash1");
        assert_eq!(value["session"]["avgTemperature"].to_string(), "41.7");
        assert_eq!(value["session"]["minTemperature"].to_string(), "20");
        assert_eq!(value["session"]["maxTemperature"].to_string(), "65");
        assert_eq!(value["session"]["dataPoints"], 3);
        assert_eq!(value["data"].as_array().unwrap().len(), 3);
        assert_eq!(value["data"][1]["avgTemperature"], 40);
        assert_eq!(value["data"][2]["outputPercent"], 10);
    }

    #[test]
    fn test_summary_value_keeps_one_decimal() {
        let (session, _) = mash1();
        let value = serde_json::to_value(SessionSummary::from(&session)).unwrap();
        assert_eq!(value["avgTemperature"], 41.7);
        assert_eq!(value["avgTemperature"].to_string(), "41.7");
    }

    #[test]
    fn test_csv_export() {
        let (session, samples) = mash1();
        let csv = session_to_csv(&session, &samples);
        let lines: alloc::vec::Vec<&str> = csv.lines().collect();

        assert!(lines.contains(&"# name,\"Saison, batch 2\""));
        assert!(lines.contains(&"# avg_temperature,41.7"));
        assert!(lines.contains(&"# min_temperature,20"));
        assert!(lines.contains(&"timestamp,avg_temperature,target_temperature,output_percent"));
        assert_eq!(lines[lines.len() - 3..], ["0,20,65,50", "60,40,65,80", "120,65,65,10"]);
    }
}
