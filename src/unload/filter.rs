//! VO filtering and identity withholding
//!
//! Filtering only ever looks at the VO, withholding only ever touches the
//! submitter identity, so the two can run in either order.

use tracing::warn;

use crate::models::UnloadRow;

/// Which VOs may leave the site.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum VoFilter {
    #[default]
    Any,
    Include(Vec<String>),
    Exclude(Vec<String>),
}

impl VoFilter {
    /// Build from the two optional lists. An include list wins outright.
    pub fn from_lists(include: Option<&[String]>, exclude: Option<&[String]>) -> Self {
        match (include, exclude) {
            (Some(include), exclude) => {
                if exclude.is_some_and(|e| !e.is_empty()) {
                    warn!("Both include_vos and exclude_vos configured, ignoring exclude_vos");
                }
                Self::Include(normalise(include))
            }
            (None, Some(exclude)) => Self::Exclude(normalise(exclude)),
            (None, None) => Self::Any,
        }
    }

    pub fn admits(&self, vo: Option<&str>) -> bool {
        match self {
            Self::Any => true,
            Self::Include(list) => vo.is_some_and(|vo| list.iter().any(|v| v == vo)),
            Self::Exclude(list) => vo.map_or(true, |vo| !list.iter().any(|v| v == vo)),
        }
    }
}

fn normalise(list: &[String]) -> Vec<String> {
    list.iter()
        .map(|vo| vo.trim().to_string())
        .filter(|vo| !vo.is_empty())
        .collect()
}

/// Per-run filter applied to every selected row before serialization.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    vos: VoFilter,
    withhold_identity: bool,
}

impl RecordFilter {
    pub fn new(vos: VoFilter, withhold_identity: bool) -> Self {
        Self {
            vos,
            withhold_identity,
        }
    }

    pub fn withholds_identity(&self) -> bool {
        self.withhold_identity
    }

    /// Keep admitted rows (in order) and scrub identities if configured.
    pub fn apply(&self, rows: Vec<UnloadRow>) -> Vec<UnloadRow> {
        rows.into_iter()
            .filter(|row| self.vos.admits(row.vo()))
            .map(|mut row| {
                if self.withhold_identity {
                    row.withhold_identity();
                }
                row
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConsolidatedRecord, Period};
    use chrono::{TimeZone, Utc};

    fn row(id: &str, vo: Option<&str>) -> UnloadRow {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        UnloadRow::Detail(ConsolidatedRecord {
            entity_id: id.into(),
            site: "Site1".into(),
            period: Period::new(2024, 1),
            measurement_time: ts,
            start_time: ts,
            wall_duration: 0,
            cpu_duration: 0,
            status: "completed".into(),
            vo: vo.map(String::from),
            vo_group: None,
            vo_role: None,
            global_user_name: Some("/CN=someone".into()),
            spec_type: None,
            spec_value: None,
            revision: 1,
        })
    }

    fn ids(rows: &[UnloadRow]) -> Vec<&str> {
        rows.iter()
            .map(|r| match r {
                UnloadRow::Detail(d) => d.entity_id.as_str(),
                UnloadRow::Summary(_) => unreachable!(),
            })
            .collect()
    }

    #[test]
    fn test_include_wins_over_exclude() {
        let include = vec!["atlas".to_string()];
        let exclude = vec!["atlas".to_string(), "cms".to_string()];
        let vos = VoFilter::from_lists(Some(include.as_slice()), Some(exclude.as_slice()));
        assert_eq!(vos, VoFilter::Include(vec!["atlas".into()]));

        let filter = RecordFilter::new(vos, false);
        let kept = filter.apply(vec![
            row("1", Some("atlas")),
            row("2", Some("cms")),
            row("3", None),
        ]);
        assert_eq!(ids(&kept), vec!["1"]);
    }

    #[test]
    fn test_exclude_keeps_unowned_rows() {
        let exclude = vec![" cms ".to_string()];
        let filter = RecordFilter::new(VoFilter::from_lists(None, Some(exclude.as_slice())), false);
        let kept = filter.apply(vec![
            row("1", Some("atlas")),
            row("2", Some("cms")),
            row("3", None),
        ]);
        assert_eq!(ids(&kept), vec!["1", "3"]);
    }

    #[test]
    fn test_withholding_scrubs_identity_only() {
        let filter = RecordFilter::new(VoFilter::Any, true);
        let kept = filter.apply(vec![row("1", Some("atlas"))]);
        match &kept[0] {
            UnloadRow::Detail(d) => {
                assert_eq!(d.global_user_name, None);
                assert_eq!(d.vo.as_deref(), Some("atlas"));
            }
            UnloadRow::Summary(_) => unreachable!(),
        }
    }
}
