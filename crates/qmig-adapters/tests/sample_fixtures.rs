use std::path::PathBuf;

use qmig_adapters::{parse_records, FixtureRecordSource, SourceRecord};
use qmig_core::{EntityType, MIGRATION_ORDER};
use qmig_storage::RecordSource;

fn sample_source() -> FixtureRecordSource {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
    FixtureRecordSource::new(root.join("fixtures/sample"))
}

#[tokio::test]
async fn every_sample_fixture_passes_its_schema_except_the_broken_user() {
    let source = sample_source();
    for entity in MIGRATION_ORDER {
        let page = source.fetch_page(entity, 0, 100).await.expect("fixture page");
        assert!(!page.items.is_empty(), "{entity} fixture is empty");
        assert_eq!(page.remaining, 0);

        let batch = parse_records(entity, page.items);
        assert!(batch.accepted.iter().all(|r| r.entity() == entity));
        if entity == EntityType::User {
            assert_eq!(batch.rejected.len(), 1);
            assert_eq!(batch.rejected[0].external_id(), Some("u2"));
        } else {
            assert!(batch.rejected.is_empty(), "{entity}: {:?}", batch.rejected);
        }
    }
}

#[tokio::test]
async fn sample_sheets_carry_revision_links() {
    let source = sample_source();
    let page = source.fetch_page(EntityType::Sheet, 0, 100).await.expect("fixture page");
    let batch = parse_records(EntityType::Sheet, page.items);
    let sheets: Vec<_> = batch
        .accepted
        .into_iter()
        .filter_map(|record| match record {
            SourceRecord::Sheet(sheet) => Some(sheet),
            _ => None,
        })
        .collect();
    assert_eq!(sheets.len(), 3);
    let r1 = sheets.iter().find(|s| s.external_id == "R1").expect("R1");
    assert_eq!(r1.body.company, "c1");
    assert_eq!(r1.body.tags, vec!["t1".to_string()]);
}
