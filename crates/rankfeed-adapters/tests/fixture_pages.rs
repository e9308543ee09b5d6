// Exercises the checked-in ranking fixtures through the offline page source.

use std::path::{Path, PathBuf};

use rankfeed_adapters::{FixturePageSource, PageOutcome, PageSource};
use rankfeed_core::{JobClass, World};
use rankfeed_storage::SessionContext;

fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/ranking")
        .canonicalize()
        .expect("fixtures dir")
}

#[tokio::test]
async fn fixture_pages_parse_until_the_feed_ends() {
    let source = FixturePageSource::new(fixtures_dir());
    let session = SessionContext::default();

    let PageOutcome::Success(first) = source.fetch_page(0, &session).await else {
        panic!("page 0 should parse");
    };
    assert_eq!(first.len(), 5);
    assert_eq!(first[0].name, "Ana");
    assert_eq!(first[0].world, World::Bera);
    assert_eq!(first[0].image_ref, "KLMJ2PNOHBDGAECFI");

    let PageOutcome::Success(second) = source.fetch_page(1, &session).await else {
        panic!("page 1 should parse");
    };
    // The nameless entry is dropped; unknown codes survive with the sentinel label.
    assert_eq!(second.len(), 5);
    let hesper = second.iter().find(|r| r.name == "Hesper").unwrap();
    assert_eq!(hesper.job, JobClass::Unknown(Some(9999)));
    let ivo = second.iter().find(|r| r.name == "Ivo").unwrap();
    assert_eq!(ivo.world.as_str(), "Unknown");

    assert!(matches!(source.fetch_page(2, &session).await, PageOutcome::Empty));
    assert!(matches!(source.fetch_page(3, &session).await, PageOutcome::Empty));
}

#[tokio::test]
async fn fixture_character_lookup_scans_pages() {
    let source = FixturePageSource::new(fixtures_dir());
    let session = SessionContext::default();

    let galen = source.fetch_character("galen", &session).await.unwrap().unwrap();
    assert_eq!(galen.level, 220);
    assert_eq!(galen.world, World::Elysium);

    assert!(source.fetch_character("Nobody", &session).await.unwrap().is_none());
}
