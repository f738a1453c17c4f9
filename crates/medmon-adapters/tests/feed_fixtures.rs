use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use medmon_adapters::{articles_from_feed, parse_feed, AdapterError};

fn fixture(name: &str) -> Vec<u8> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    std::fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

#[test]
fn harbour_rss_fixture_yields_every_item() {
    let now = Utc.with_ymd_and_hms(2026, 6, 3, 0, 0, 0).unwrap();
    let articles = articles_from_feed(&fixture("harbour_rss.xml"), "Harbour Gazette", now).unwrap();

    let titles: Vec<&str> = articles.iter().map(|a| a.title.as_str()).collect();
    assert_eq!(
        titles,
        vec![
            "Ferry timetable changes for winter",
            "Harbour dredging delayed",
            "Cruise season opens"
        ]
    );
    assert_eq!(
        articles[1].published_at,
        Utc.with_ymd_and_hms(2026, 6, 1, 14, 45, 0).unwrap()
    );
    assert_eq!(
        articles[1].summary,
        "Contractor cites weather & equipment issues."
    );
    assert_eq!(articles[2].summary, "First ship <em>arrives</em> Friday.");
    assert_eq!(articles[2].published_at, now);
}

#[test]
fn fleet_atom_fixture_uses_published_then_updated() {
    let now = Utc.with_ymd_and_hms(2026, 6, 3, 0, 0, 0).unwrap();
    let articles = articles_from_feed(&fixture("fleet_atom.xml"), "Fleet", now).unwrap();

    assert_eq!(articles.len(), 2);
    assert_eq!(articles[0].url, "https://fleet.example.net/arctic-survey");
    assert_eq!(
        articles[0].published_at,
        Utc.with_ymd_and_hms(2026, 6, 2, 4, 30, 0).unwrap()
    );
    assert_eq!(articles[1].url, "https://fleet.example.net/hybrid-ferry");
    assert_eq!(articles[1].summary, "Two battery ferries ordered.");
    assert_eq!(
        articles[1].published_at,
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    );
}

#[test]
fn html_page_is_not_accepted_as_a_feed() {
    let err = parse_feed(&fixture("not_a_feed.html")).unwrap_err();
    assert!(matches!(err, AdapterError::Parse(_)));
}

#[test]
fn declared_latin1_encoding_is_decoded() {
    let now = Utc.with_ymd_and_hms(2026, 6, 3, 0, 0, 0).unwrap();
    let articles = articles_from_feed(&fixture("kyst_latin1.xml"), "Kystavisa", now).unwrap();

    let titles: Vec<&str> = articles.iter().map(|a| a.title.as_str()).collect();
    assert_eq!(titles, vec!["Laksepris før helgen", "Åpent møte om havbruk"]);
    assert_eq!(articles[0].summary, "Oppdrett på Træna");
    assert_eq!(
        articles[0].published_at,
        Utc.with_ymd_and_hms(2026, 6, 2, 5, 15, 0).unwrap()
    );
}

#[test]
fn html_entities_do_not_drop_the_feed() {
    let now = Utc.with_ymd_and_hms(2026, 6, 3, 0, 0, 0).unwrap();
    let articles = articles_from_feed(&fixture("fjord_entities.xml"), "Fjord Post", now).unwrap();

    let titles: Vec<&str> = articles.iter().map(|a| a.title.as_str()).collect();
    assert_eq!(
        titles,
        vec![
            "Fish farm licence renewed",
            "Harbour fees &madeup; revised",
            "Tide tables & storm warnings"
        ]
    );
    assert_eq!(articles[0].summary, "Quota talks \u{2013} round two \u{2026}");
}
