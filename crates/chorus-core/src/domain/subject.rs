//! Subjects (recordings) and the deployment metadata derived from them.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use super::ids::SubjectId;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// One recording in the media registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub id: SubjectId,
    /// Object key inside the media source. Unique.
    pub object_name: String,
    /// Recorder / deployment node the file came from.
    pub node_label: String,
    pub recorded_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub sample_rate: u32,
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
}

/// Per-subject location/season context for the class allow-list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeploymentContext {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    /// Season week, 1..=48.
    pub week: u32,
}

impl DeploymentContext {
    pub fn for_subject(subject: &Subject) -> Self {
        Self {
            lat: subject.location.map(|p| p.lat),
            lon: subject.location.map(|p| p.lon),
            week: season_week(subject.recorded_at),
        }
    }
}

/// 48-week year used by the species occurrence model.
pub fn season_week(at: DateTime<Utc>) -> u32 {
    let day = f64::from(at.ordinal() - 1);
    let week = (day / (365.0 / 48.0)).floor() as u32 + 1;
    week.clamp(1, 48)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    #[rstest]
    #[case(2023, 1, 1, 1)]
    #[case(2023, 1, 8, 1)]
    #[case(2023, 1, 9, 2)]
    #[case(2023, 6, 15, 22)]
    #[case(2023, 12, 31, 48)]
    #[case(2024, 12, 31, 48)]
    fn season_week_spans_48_weeks(
        #[case] y: i32,
        #[case] m: u32,
        #[case] d: u32,
        #[case] week: u32,
    ) {
        let at = Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap();
        assert_eq!(season_week(at), week);
    }
}
