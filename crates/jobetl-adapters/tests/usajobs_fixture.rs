use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use jobetl_adapters::{map_listing, FixtureJobSource, JobSource, MapOptions, MappingError, SearchQuery};

fn fixture_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/usajobs/search_page.json")
}

#[tokio::test]
async fn recorded_search_page_maps_two_of_three_items() {
    let source = FixtureJobSource::load(fixture_path()).expect("fixture loads");
    let query = SearchQuery {
        keyword: "data engineering".into(),
        location: "Chicago".into(),
    };
    let page = source.fetch_page(&query, 1).await.expect("page 1");
    assert_eq!(page.items.len(), 3);
    assert_eq!(page.total_available, Some(3));

    let options = MapOptions::preferring("Chicago");
    let results = page
        .items
        .iter()
        .map(|item| map_listing(item, &options))
        .collect::<Vec<_>>();

    let first = results[0].as_ref().expect("first maps");
    assert_eq!(first.position_id, "801234500");
    assert_eq!(first.city_name.as_deref(), Some("Chicago, Illinois"));
    assert_eq!(first.state_code.as_deref(), Some("Illinois"));
    assert_eq!(first.min_salary, Some(117_962));
    assert_eq!(first.max_salary, Some(153_354));
    assert_eq!(first.application_close_date, NaiveDate::from_ymd_opt(2025, 9, 30));

    let second = results[1].as_ref().expect("second maps");
    assert_eq!(second.min_salary, Some(90_000));
    assert_eq!(second.max_salary, Some(120_000));

    assert_eq!(results[2], Err(MappingError::MissingField("position_title")));

    assert!(source.fetch_page(&query, 2).await.expect("page 2").is_empty());
}
