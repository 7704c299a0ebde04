use arabica_index::{RecordIndex, SqliteIndex};
use arabica_protocol::{Collection, Did, RecordWrite};
use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use std::path::Path;
use tempfile::TempDir;

fn cli(db: &Path) -> Command {
    let mut cmd = Command::cargo_bin("arabica-indexer").expect("binary");
    cmd.arg("--db-path").arg(db).arg("--quiet");
    cmd
}

async fn seed(db: &Path) {
    let index = SqliteIndex::open(db).expect("open");
    for (owner, rkey, name, seq) in [
        ("did:plc:alice", "r1", "Counter Culture Coffee", 10),
        ("did:plc:bob", "r2", "Counter Culture", 11),
    ] {
        index
            .upsert(RecordWrite {
                did: Did::parse(owner).unwrap(),
                collection: Collection::Roaster,
                rkey: rkey.into(),
                cid: format!("bafy-{rkey}"),
                payload: json!({ "name": name, "location": "Durham, NC" }),
                sequence: seq,
            })
            .await
            .unwrap();
    }
}

fn stdout_json(cmd: &mut Command) -> Value {
    let output = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&output).expect("json output")
}

#[test]
fn stats_on_fresh_index_are_zero() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("index.db");
    let stats = stdout_json(cli(&db).arg("stats"));
    assert_eq!(stats["known_identities"], 0);
    assert_eq!(stats["records"], 0);
}

#[tokio::test]
async fn search_prints_clustered_suggestions() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("index.db");
    seed(&db).await;

    let results = stdout_json(cli(&db).args(["search", "roaster", "counter"]));
    let results = results.as_array().expect("array");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["count"], 2);

    let short = stdout_json(cli(&db).args(["search", "roaster", "c"]));
    assert_eq!(short, json!([]));
}

#[test]
fn brews_cannot_be_searched() {
    let temp = TempDir::new().unwrap();
    cli(&temp.path().join("index.db"))
        .args(["search", "brew", "v60"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No suggestions"));
}

#[tokio::test]
async fn offline_feed_lists_recent_records() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("index.db");
    seed(&db).await;

    let feed = stdout_json(cli(&db).args(["feed", "--offline", "--limit", "1"]));
    let items = feed.as_array().expect("array");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["uri"], "at://did:plc:bob/social.arabica.alpha.roaster/r2");
    assert_eq!(items[0]["author"]["did"], "did:plc:bob");
}

#[tokio::test]
async fn feed_limit_zero_prints_a_full_page() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("index.db");
    seed(&db).await;

    let feed = stdout_json(cli(&db).args(["feed", "--offline", "--limit", "0"]));
    assert_eq!(feed.as_array().expect("array").len(), 2);
}

#[tokio::test]
async fn purge_removes_an_identity() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("index.db");
    seed(&db).await;

    let purged = stdout_json(cli(&db).args(["purge", "did:plc:alice"]));
    assert_eq!(purged["removed"], 1);
    let stats = stdout_json(cli(&db).arg("stats"));
    assert_eq!(stats["records"], 1);
    assert_eq!(stats["known_identities"], 2);
}

#[test]
fn invalid_did_is_rejected() {
    let temp = TempDir::new().unwrap();
    cli(&temp.path().join("index.db"))
        .args(["purge", "alice"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid DID"));
}
