mod common;

use common::{Project, TestDb};
use tabula_core::{
    Context, ErrorCode, FieldFilter, Pagination, SearchCondition, SearchParams, SortOrder,
};

fn seeded(count: usize) -> TestDb {
    let db = TestDb::new();
    db.seed_projects(count);
    db
}

#[test]
fn first_page_reports_more_results() {
    let db = seeded(25);
    let store = db.storage.crud::<Project>(&Context::background()).unwrap();

    let page = store
        .search(&SearchParams::paged(Vec::new(), Pagination::page(0, 10)))
        .unwrap();
    let info = page.page.unwrap();
    assert_eq!(page.items.len(), 10);
    assert_eq!(info.total_count, 25);
    assert_eq!(info.elements_count, 10);
    assert!(info.has_more);
    assert!(!info.is_empty);
}

#[test]
fn last_partial_page_has_no_more() {
    let db = seeded(25);
    let store = db.storage.crud::<Project>(&Context::background()).unwrap();

    let page = store
        .search(&SearchParams::paged(Vec::new(), Pagination::page(2, 10)))
        .unwrap();
    let info = page.page.unwrap();
    assert_eq!(page.items.len(), 5);
    assert_eq!(info.elements_count, 5);
    assert!(!info.has_more);
}

#[test]
fn search_without_matches_is_empty() {
    let db = seeded(3);
    let store = db.storage.crud::<Project>(&Context::background()).unwrap();

    let page = store
        .search(&SearchParams::paged(
            vec![FieldFilter::new("owner", SearchCondition::Eq, "nobody")],
            Pagination::default(),
        ))
        .unwrap();
    let info = page.page.unwrap();
    assert!(page.items.is_empty());
    assert!(info.is_empty);
    assert!(!info.has_more);
    assert_eq!(info.total_count, 0);
}

#[test]
fn unknown_order_field_is_invalid_argument() {
    let db = seeded(3);
    let store = db.storage.crud::<Project>(&Context::background()).unwrap();

    let err = store
        .search(&SearchParams::paged(
            Vec::new(),
            Pagination::new("nickname", SortOrder::Asc),
        ))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    assert!(err.message().contains("nickname"));
}

#[test]
fn unknown_filter_field_is_invalid_argument() {
    let db = seeded(3);
    let store = db.storage.crud::<Project>(&Context::background()).unwrap();

    let err = store
        .search(&SearchParams::internal(vec![FieldFilter::new(
            "color",
            SearchCondition::Eq,
            "red",
        )]))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    assert_eq!(err.message(), "invalid field \"color\" for search condition");
}

#[test]
fn ordering_follows_requested_direction() {
    let db = seeded(12);
    let store = db.storage.crud::<Project>(&Context::background()).unwrap();

    let mut pagination = Pagination::new("budget", SortOrder::Desc);
    pagination.page_size = 3;
    let page = store
        .search(&SearchParams::paged(Vec::new(), pagination))
        .unwrap();
    let budgets = page
        .items
        .iter()
        .map(|project| project.budget)
        .collect::<Vec<_>>();
    assert_eq!(budgets, [11, 10, 9]);
    assert!(page.page.unwrap().has_more);
}

#[test]
fn contains_is_case_insensitive_substring_match() {
    let db = seeded(25);
    let store = db.storage.crud::<Project>(&Context::background()).unwrap();

    let page = store
        .search(&SearchParams::paged(
            vec![FieldFilter::new("name", SearchCondition::Contains, "PROJECT-2")],
            Pagination::default(),
        ))
        .unwrap();
    assert_eq!(page.items.len(), 5);
    assert_eq!(page.page.unwrap().total_count, 5);
}

#[test]
fn contains_treats_wildcards_literally() {
    let db = seeded(3);
    let store = db.storage.crud::<Project>(&Context::background()).unwrap();

    let page = store
        .search(&SearchParams::internal(vec![FieldFilter::new(
            "name",
            SearchCondition::Contains,
            "%",
        )]))
        .unwrap();
    assert!(page.items.is_empty());
}

#[test]
fn eq_and_neq_compare_text_forms() {
    let db = seeded(5);
    let store = db.storage.crud::<Project>(&Context::background()).unwrap();

    let eq = store
        .search(&SearchParams::internal(vec![FieldFilter::new(
            "budget",
            SearchCondition::Eq,
            "3",
        )]))
        .unwrap();
    assert_eq!(eq.items.len(), 1);
    assert_eq!(eq.items[0].name, "project-03");

    let neq = store
        .search(&SearchParams::internal(vec![
            FieldFilter::new("budget", SearchCondition::Neq, "3"),
            FieldFilter::new("owner", SearchCondition::Eq, "alice"),
        ]))
        .unwrap();
    assert_eq!(neq.items.len(), 4);
    assert!(neq.items.iter().all(|project| project.budget != 3));
}

#[test]
fn date_columns_match_display_dates() {
    let db = TestDb::new();
    let store = db.storage.crud::<Project>(&Context::background()).unwrap();

    let mut march = Project::new("march", "alice", 1);
    march.created_date = 1_709_596_800;
    let mut april = Project::new("april", "alice", 2);
    april.created_date = 1_712_016_000;
    store.create_many(&mut [march, april]).unwrap();

    let page = store
        .search(&SearchParams::internal(vec![FieldFilter::new(
            "createdDate",
            SearchCondition::Eq,
            "05 Mar, 2024",
        )]))
        .unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].name, "march");

    let page = store
        .search(&SearchParams::internal(vec![FieldFilter::new(
            "createdDate",
            SearchCondition::Contains,
            "apr",
        )]))
        .unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].name, "april");
}

#[test]
fn internal_search_returns_everything_without_page_info() {
    let db = seeded(25);
    let store = db.storage.crud::<Project>(&Context::background()).unwrap();

    let result = store.search(&SearchParams::internal(Vec::new())).unwrap();
    assert_eq!(result.items.len(), 25);
    assert!(result.page.is_none());
}

#[test]
fn request_json_drives_a_search() {
    let db = seeded(25);
    let store = db.storage.crud::<Project>(&Context::background()).unwrap();

    let params: SearchParams = serde_json::from_str(
        r#"{
            "filters": [{"fieldName": "owner", "condition": "eq", "value": "alice"}],
            "pageSize": 4,
            "page": 1,
            "orderBy": "budget",
            "order": "asc"
        }"#,
    )
    .unwrap();
    let page = store.search(&params).unwrap();

    let budgets = page
        .items
        .iter()
        .map(|project| project.budget)
        .collect::<Vec<_>>();
    assert_eq!(budgets, [4, 5, 6, 7]);
    let info = page.page.unwrap();
    assert_eq!(info.total_count, 25);
    assert!(info.has_more);
}
