//! Interval selection
//!
//! Turns the configured interval mode into a [`Selection`] for the store.

use chrono::NaiveDate;

use crate::error::UnloadError;
use crate::store::Selection;

const GAP_DATE_FORMAT: &str = "%Y-%m-%d";

/// Parsed interval mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntervalMode {
    /// Everything not yet published
    Latest,
    /// Records measured between two dates, inclusive
    Gap { start: NaiveDate, end: NaiveDate },
    All,
}

impl IntervalMode {
    /// Parse the `interval` option together with the gap bounds it may need.
    ///
    /// Gap bounds are only read for `gap`; they are ignored otherwise.
    pub fn parse(
        mode: &str,
        gap_start: Option<&str>,
        gap_end: Option<&str>,
    ) -> Result<Self, UnloadError> {
        match mode.trim() {
            "latest" => Ok(Self::Latest),
            "all" => Ok(Self::All),
            "gap" => {
                let start = parse_gap_date("gap_start", gap_start)?;
                let end = parse_gap_date("gap_end", gap_end)?;
                if end < start {
                    return Err(UnloadError::InvalidGap(format!(
                        "gap_end {} is before gap_start {}",
                        end, start
                    )));
                }
                Ok(Self::Gap { start, end })
            }
            other => Err(UnloadError::UnrecognizedInterval(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Latest => "latest",
            Self::Gap { .. } => "gap",
            Self::All => "all",
        }
    }

    /// Whether a successful unload in this mode advances the publication
    /// marker. Only `latest` does; partial or full re-sends leave it alone.
    pub fn advances_marker(&self) -> bool {
        matches!(self, Self::Latest)
    }
}

fn parse_gap_date(key: &str, value: Option<&str>) -> Result<NaiveDate, UnloadError> {
    let value = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| UnloadError::InvalidGap(format!("{} is not set", key)))?;
    NaiveDate::parse_from_str(value, GAP_DATE_FORMAT)
        .map_err(|e| UnloadError::InvalidGap(format!("{} `{}`: {}", key, value, e)))
}

/// Maps an interval mode onto a store selection request.
#[derive(Debug, Clone)]
pub struct IntervalSelector {
    mode: IntervalMode,
}

impl IntervalSelector {
    pub fn new(mode: IntervalMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> &IntervalMode {
        &self.mode
    }

    pub fn selection(&self) -> Selection {
        match &self.mode {
            IntervalMode::Latest => Selection::Unpublished,
            IntervalMode::Gap { start, end } => Selection::Between {
                start: *start,
                end: *end,
            },
            IntervalMode::All => Selection::All,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_modes() {
        assert_eq!(IntervalMode::parse("latest", None, None).unwrap(), IntervalMode::Latest);
        assert_eq!(IntervalMode::parse(" all ", None, None).unwrap(), IntervalMode::All);

        let gap = IntervalMode::parse("gap", Some("2024-01-01"), Some("2024-01-31")).unwrap();
        let selector = IntervalSelector::new(gap);
        assert_eq!(
            selector.selection(),
            Selection::Between {
                start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                end: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            }
        );
        assert!(!selector.mode().advances_marker());
    }

    #[test]
    fn test_unrecognised_mode() {
        let err = IntervalMode::parse("weekly", None, None).unwrap_err();
        assert!(matches!(err, UnloadError::UnrecognizedInterval(m) if m == "weekly"));
    }

    #[test]
    fn test_gap_needs_ordered_bounds() {
        assert!(matches!(
            IntervalMode::parse("gap", Some("2024-01-01"), None),
            Err(UnloadError::InvalidGap(_))
        ));
        assert!(matches!(
            IntervalMode::parse("gap", Some("2024-02-01"), Some("2024-01-01")),
            Err(UnloadError::InvalidGap(_))
        ));
        assert!(matches!(
            IntervalMode::parse("gap", Some("01/02/2024"), Some("2024-03-01")),
            Err(UnloadError::InvalidGap(_))
        ));
    }
}
