//! Class allow-list resolution.

use tracing::{debug, warn};

use super::params::AllowList;
use crate::domain::{ConfigError, DeploymentContext, SpeciesListSource, TaskError};
use crate::ports::Classifier;

/// Resolve the allow-list for one task.
///
/// - `file`: one label per line, blank lines and `#` comments ignored
/// - `static`: taken as is
/// - `auto`: labels whose predicted occurrence at the location reaches
///   `loc_filter_thresh`; the config's coordinates win over the subject's
pub async fn resolve_allow_list(
    source: &SpeciesListSource,
    context: &DeploymentContext,
    classifier: &mut dyn Classifier,
) -> Result<AllowList, TaskError> {
    let list: AllowList = match source {
        SpeciesListSource::File(path) => {
            let text = tokio::fs::read_to_string(path).await.map_err(|e| {
                ConfigError::SpeciesList(format!("{}: {e}", path.display()))
            })?;
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .collect()
        }
        SpeciesListSource::Static(labels) => labels.iter().map(String::as_str).collect(),
        SpeciesListSource::Auto(auto) => {
            let (Some(lat), Some(lon)) = (auto.lat.or(context.lat), auto.lon.or(context.lon))
            else {
                warn!("no location for auto species list, not restricting classes");
                return Ok(AllowList::unrestricted());
            };
            let week = auto.auto_season.then_some(context.week);
            let occurrence = classifier.species_occurrence(lat, lon, week).await?;
            occurrence
                .into_iter()
                .filter(|(_, p)| *p >= auto.loc_filter_thresh)
                .map(|(label, _)| label)
                .collect()
        }
    };
    debug!(classes = list.len(), "resolved allow-list");
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AutoSpeciesList;
    use crate::impls::band_energy::BandEnergyClassifier;
    use std::io::Write;

    fn classifier() -> BandEnergyClassifier {
        BandEnergyClassifier::from_manifest_str(
            r#"
            [model]
            version = "BandEnergy_V1_Goertzel"
            sample_rate = 8000

            [[band]]
            label = "Low tone_Low"
            low_hz = 400
            high_hz = 600
            occurrence = 0.5

            [[band]]
            label = "High tone_High"
            low_hz = 1800
            high_hz = 2200
            occurrence = 0.01
            "#,
        )
        .unwrap()
    }

    fn context() -> DeploymentContext {
        DeploymentContext {
            lat: Some(47.5),
            lon: Some(7.6),
            week: 20,
        }
    }

    #[tokio::test]
    async fn file_list_skips_comments_and_blanks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# species\nLow tone_Low\n\n  High tone_High  ").unwrap();

        let list = resolve_allow_list(
            &SpeciesListSource::File(file.path().to_path_buf()),
            &context(),
            &mut classifier(),
        )
        .await
        .unwrap();

        assert_eq!(list.len(), 2);
        assert!(list.allows("High tone_High"));
    }

    #[tokio::test]
    async fn missing_file_is_a_configuration_error() {
        let err = resolve_allow_list(
            &SpeciesListSource::File("/nonexistent/species.txt".into()),
            &context(),
            &mut classifier(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), crate::domain::ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn auto_list_applies_occurrence_threshold() {
        let source = SpeciesListSource::Auto(AutoSpeciesList {
            lat: None,
            lon: None,
            auto_season: true,
            loc_filter_thresh: 0.03,
        });

        let list = resolve_allow_list(&source, &context(), &mut classifier())
            .await
            .unwrap();

        assert!(list.allows("Low tone_Low"));
        assert!(!list.allows("High tone_High"));
    }

    #[tokio::test]
    async fn auto_list_without_location_is_unrestricted() {
        let source = SpeciesListSource::Auto(AutoSpeciesList {
            lat: None,
            lon: None,
            auto_season: false,
            loc_filter_thresh: 0.03,
        });
        let ctx = DeploymentContext {
            lat: None,
            lon: None,
            week: 1,
        };

        let list = resolve_allow_list(&source, &ctx, &mut classifier())
            .await
            .unwrap();
        assert!(list.is_unrestricted());
    }
}
