//! Raw search item -> [`JobListing`].
//!
//! Pure and total apart from the two required fields. Accepts USAJobs items
//! (`MatchedObjectId` + `MatchedObjectDescriptor`) as well as flat objects
//! using snake_case / short keys.

use chrono::{DateTime, NaiveDate};
use jobetl_core::JobListing;
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("missing required field {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Default)]
pub struct MapOptions {
    /// Location entry to prefer as primary (substring match on the city or
    /// location name). Falls back to the first entry.
    pub preferred_location: Option<String>,
}

impl MapOptions {
    pub fn preferring(location: impl Into<String>) -> Self {
        Self {
            preferred_location: Some(location.into()),
        }
    }
}

const LOCATION_KEYS: &[&str] = &["PositionLocation", "position_location"];
const REMUNERATION_KEYS: &[&str] = &["PositionRemuneration", "position_remuneration"];
const CITY_KEYS: &[&str] = &["CityName", "city"];
const STATE_KEYS: &[&str] = &["CountrySubDivisionCode", "state"];
const MIN_SALARY_KEYS: &[&str] = &["MinimumRange", "min"];
const MAX_SALARY_KEYS: &[&str] = &["MaximumRange", "max"];

pub fn map_listing(raw: &JsonValue, options: &MapOptions) -> Result<JobListing, MappingError> {
    if !raw.is_object() {
        return Err(MappingError::NotAnObject);
    }
    let descriptor = raw
        .get("MatchedObjectDescriptor")
        .filter(|d| d.is_object())
        .unwrap_or(raw);

    let position_id = json_text(raw, &["MatchedObjectId"])
        .or_else(|| json_text(descriptor, &["PositionID"]))
        .or_else(|| json_text(descriptor, &["position_id"]))
        .ok_or(MappingError::MissingField("position_id"))?;
    let position_title = json_text(descriptor, &["PositionTitle"])
        .or_else(|| json_text(descriptor, &["position_title"]))
        .ok_or(MappingError::MissingField("position_title"))?;

    let locations = first_present(descriptor, LOCATION_KEYS);
    let primary = locations.and_then(|l| primary_location(l, options.preferred_location.as_deref()));
    let remunerations = first_present(descriptor, REMUNERATION_KEYS);
    let salary_range = remunerations.and_then(|r| r.as_array()).and_then(|r| r.first());

    Ok(JobListing {
        position_id,
        position_title,
        position_uri: text_any(descriptor, &["PositionURI", "position_uri"]),
        position_location: locations.cloned(),
        city_name: primary.and_then(|loc| text_any(loc, CITY_KEYS)),
        state_code: primary.and_then(|loc| text_any(loc, STATE_KEYS)),
        organization_name: text_any(descriptor, &["OrganizationName", "organization_name"]),
        department_name: text_any(descriptor, &["DepartmentName", "department_name"]),
        position_remuneration: remunerations.cloned(),
        min_salary: salary_range.and_then(|r| int_any(r, MIN_SALARY_KEYS)),
        max_salary: salary_range.and_then(|r| int_any(r, MAX_SALARY_KEYS)),
        position_start_date: date_any(descriptor, &["PositionStartDate", "position_start_date"]),
        position_end_date: date_any(descriptor, &["PositionEndDate", "position_end_date"]),
        publication_start_date: date_any(
            descriptor,
            &["PublicationStartDate", "publication_start_date"],
        ),
        application_close_date: date_any(
            descriptor,
            &["ApplicationCloseDate", "application_close_date"],
        ),
        job_summary: json_text(descriptor, &["UserArea", "Details", "JobSummary"])
            .or_else(|| json_text(descriptor, &["job_summary"])),
        job_category: first_present(descriptor, &["JobCategory", "job_category"]).cloned(),
        job_grade: first_present(descriptor, &["JobGrade", "job_grade"]).cloned(),
    })
}

fn primary_location<'a>(locations: &'a JsonValue, preferred: Option<&str>) -> Option<&'a JsonValue> {
    let entries = locations.as_array()?;
    let preferred = preferred
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty());
    if let Some(needle) = preferred {
        let matched = entries.iter().find(|entry| {
            ["CityName", "LocationName", "city"].iter().any(|key| {
                entry
                    .get(*key)
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            })
        });
        if matched.is_some() {
            return matched;
        }
    }
    entries.first()
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn first_present<'a>(value: &'a JsonValue, keys: &[&str]) -> Option<&'a JsonValue> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find(|v| !v.is_null())
}

/// Non-blank string (or integer id) at `path`, trimmed.
fn json_text(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_at(value, path)? {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text_any(value: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| json_text(value, &[*key]))
}

fn int_any(value: &JsonValue, keys: &[&str]) -> Option<i64> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find(|v| !v.is_null())
        .and_then(coerce_int)
}

/// Numbers and numeric strings, truncated toward zero.
fn coerce_int(value: &JsonValue) -> Option<i64> {
    let number = match value {
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Some(i);
            }
            n.as_f64()?
        }
        JsonValue::String(s) => s.trim().replace(',', "").parse::<f64>().ok()?,
        _ => return None,
    };
    if number.is_finite() && number.abs() < i64::MAX as f64 {
        Some(number.trunc() as i64)
    } else {
        None
    }
}

fn date_any(value: &JsonValue, keys: &[&str]) -> Option<NaiveDate> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find_map(|v| v.as_str())
        .and_then(parse_api_date)
}

/// RFC 3339 timestamps, or `YYYY-MM-DD` optionally followed by `T...`.
pub fn parse_api_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.date_naive());
    }
    let day = text.split('T').next().unwrap_or(text);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn usajobs_item() -> JsonValue {
        json!({
            "MatchedObjectId": "812345600",
            "MatchedObjectDescriptor": {
                "PositionID": "TEST-001",
                "PositionTitle": "  Senior Data Engineer ",
                "PositionURI": "https://www.usajobs.gov/job/812345600",
                "PositionLocation": [
                    {"LocationName": "Denver, Colorado", "CityName": "Denver, Colorado", "CountrySubDivisionCode": "Colorado"},
                    {"LocationName": "Chicago, Illinois", "CityName": "Chicago, Illinois", "CountrySubDivisionCode": "Illinois"}
                ],
                "OrganizationName": "Bureau of Labor Statistics",
                "DepartmentName": "Department of Labor",
                "PositionRemuneration": [
                    {"MinimumRange": "100000.50", "MaximumRange": "150000", "RateIntervalCode": "PA"}
                ],
                "PositionStartDate": "2025-09-01T00:00:00.0000",
                "PositionEndDate": "2025-10-01T23:59:59.9970",
                "PublicationStartDate": "2025-09-01",
                "ApplicationCloseDate": "not a date",
                "JobCategory": [{"Name": "Information Technology Management", "Code": "2210"}],
                "JobGrade": [{"Code": "GS"}],
                "UserArea": {"Details": {"JobSummary": "Build pipelines."}}
            }
        })
    }

    #[test]
    fn usajobs_item_maps_all_fields() {
        let listing = map_listing(&usajobs_item(), &MapOptions::default()).expect("maps");

        assert_eq!(listing.position_id, "812345600");
        assert_eq!(listing.position_title, "Senior Data Engineer");
        assert_eq!(listing.city_name.as_deref(), Some("Denver, Colorado"));
        assert_eq!(listing.state_code.as_deref(), Some("Colorado"));
        assert_eq!(listing.organization_name.as_deref(), Some("Bureau of Labor Statistics"));
        assert_eq!(listing.department_name.as_deref(), Some("Department of Labor"));
        assert_eq!(listing.min_salary, Some(100_000));
        assert_eq!(listing.max_salary, Some(150_000));
        assert_eq!(listing.position_start_date, NaiveDate::from_ymd_opt(2025, 9, 1));
        assert_eq!(listing.position_end_date, NaiveDate::from_ymd_opt(2025, 10, 1));
        assert_eq!(listing.publication_start_date, NaiveDate::from_ymd_opt(2025, 9, 1));
        assert_eq!(listing.application_close_date, None);
        assert_eq!(listing.job_summary.as_deref(), Some("Build pipelines."));
        assert_eq!(
            listing.position_location.as_ref().and_then(|v| v.as_array()).map(Vec::len),
            Some(2)
        );
        assert_eq!(listing.job_grade, Some(json!([{"Code": "GS"}])));
    }

    #[test]
    fn preferred_location_selects_primary_entry() {
        let listing = map_listing(&usajobs_item(), &MapOptions::preferring("chicago")).expect("maps");
        assert_eq!(listing.city_name.as_deref(), Some("Chicago, Illinois"));
        assert_eq!(listing.state_code.as_deref(), Some("Illinois"));

        let listing = map_listing(&usajobs_item(), &MapOptions::preferring("Boston")).expect("maps");
        assert_eq!(listing.city_name.as_deref(), Some("Denver, Colorado"));
    }

    #[test]
    fn flat_location_fields_are_derived() {
        let raw = json!({
            "position_id": "A1",
            "position_title": "Analyst",
            "position_location": [{"city": "Chicago", "state": "IL"}]
        });
        let listing = map_listing(&raw, &MapOptions::default()).expect("maps");
        assert_eq!(listing.city_name.as_deref(), Some("Chicago"));
        assert_eq!(listing.state_code.as_deref(), Some("IL"));
        assert_eq!(listing.position_location, Some(json!([{"city": "Chicago", "state": "IL"}])));
    }

    #[test]
    fn empty_or_incomplete_locations_yield_nulls() {
        let raw = json!({"position_id": "A1", "position_title": "Analyst", "position_location": []});
        let listing = map_listing(&raw, &MapOptions::default()).expect("maps");
        assert_eq!(listing.city_name, None);
        assert_eq!(listing.state_code, None);
        assert_eq!(listing.position_location, Some(json!([])));

        let raw = json!({"position_id": "A1", "position_title": "Analyst", "position_location": [{"LocationName": "Remote"}]});
        let listing = map_listing(&raw, &MapOptions::default()).expect("maps");
        assert_eq!(listing.city_name, None);
        assert_eq!(listing.state_code, None);
    }

    #[test]
    fn salary_bounds_come_from_first_range() {
        let raw = json!({
            "position_id": "A1",
            "position_title": "Analyst",
            "position_remuneration": [{"min": 90000, "max": 120000}, {"min": 1, "max": 2}]
        });
        let listing = map_listing(&raw, &MapOptions::default()).expect("maps");
        assert_eq!(listing.min_salary, Some(90_000));
        assert_eq!(listing.max_salary, Some(120_000));

        let raw = json!({"position_id": "A1", "position_title": "Analyst", "position_remuneration": []});
        let listing = map_listing(&raw, &MapOptions::default()).expect("maps");
        assert_eq!(listing.min_salary, None);
        assert_eq!(listing.max_salary, None);

        let raw = json!({
            "position_id": "A1",
            "position_title": "Analyst",
            "PositionRemuneration": [{"MinimumRange": "DOE", "MaximumRange": 75000.9}]
        });
        let listing = map_listing(&raw, &MapOptions::default()).expect("maps");
        assert_eq!(listing.min_salary, None);
        assert_eq!(listing.max_salary, Some(75_000));
    }

    #[test]
    fn required_fields_are_enforced() {
        let no_title = json!({"MatchedObjectId": "X1", "MatchedObjectDescriptor": {"PositionTitle": "   "}});
        assert_eq!(
            map_listing(&no_title, &MapOptions::default()),
            Err(MappingError::MissingField("position_title"))
        );

        let no_id = json!({"MatchedObjectDescriptor": {"PositionTitle": "Data Engineer"}});
        assert_eq!(
            map_listing(&no_id, &MapOptions::default()),
            Err(MappingError::MissingField("position_id"))
        );

        assert_eq!(
            map_listing(&json!(["not", "an", "object"]), &MapOptions::default()),
            Err(MappingError::NotAnObject)
        );
    }

    #[test]
    fn dates_accept_api_and_rfc3339_formats() {
        assert_eq!(parse_api_date("2025-10-01T00:00:00.0000"), NaiveDate::from_ymd_opt(2025, 10, 1));
        assert_eq!(parse_api_date("2025-10-01T12:30:00Z"), NaiveDate::from_ymd_opt(2025, 10, 1));
        assert_eq!(parse_api_date("2025-10-01"), NaiveDate::from_ymd_opt(2025, 10, 1));
        assert_eq!(parse_api_date("10/01/2025"), None);
        assert_eq!(parse_api_date(""), None);
    }
}
