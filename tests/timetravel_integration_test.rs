// Historical reads against the append-only log: projections as of a past
// timestamp, monotonic snapshots, property timelines, and origins.

use rhizomedb::query::TimestampRange;
use rhizomedb::{DatabaseConfig, HyperSchema, RhizomeDb};

async fn db() -> RhizomeDb {
    let db = RhizomeDb::open(DatabaseConfig::memory().with_system_id("sys-a"))
        .await
        .unwrap();
    db.register_schema(HyperSchema::new("person", "Person")).unwrap();
    db
}

#[tokio::test]
async fn test_query_at_around_a_negation() {
    let db = db().await;
    db.persist(
        db.delta("alice")
            .with_id("d-age")
            .with_timestamp(1000)
            .set_property("e1", "age", 30i64)
            .build(),
    )
    .await
    .unwrap();
    db.persist(db.delta("bob").with_id("n-1").with_timestamp(2000).negates("d-age").build())
        .await
        .unwrap();

    let tt = db.time_travel();

    let at_1500 = tt.query_at("e1", "person", 1500).await.unwrap();
    assert_eq!(at_1500.property("age").len(), 1);
    assert_eq!(at_1500.property("age")[0].id, "d-age");

    let at_2500 = tt.query_at("e1", "person", 2500).await.unwrap();
    assert!(!at_2500.has_property("age"));
}

#[tokio::test]
async fn test_snapshot_delta_counts_never_decrease() {
    let db = db().await;
    for i in 1..=5u64 {
        db.persist(
            db.delta("alice")
                .with_id(format!("d-{i}"))
                .with_timestamp(i * 1000)
                .set_property("e1", "age", i as i64)
                .build(),
        )
        .await
        .unwrap();
    }

    let tt = db.time_travel();
    let mut previous = 0;
    for ts in [500u64, 1500, 2500, 3500, 4500, 5500] {
        let snapshot = tt.snapshot(ts).await.unwrap();
        assert!(snapshot.delta_count >= previous);
        previous = snapshot.delta_count;
    }
    assert_eq!(previous, 5);
}

#[tokio::test]
async fn test_timeline_track_changes_and_origin() {
    let db = db().await;
    db.persist(
        db.delta("alice")
            .with_id("d-name")
            .with_timestamp(1000)
            .set_property("e1", "name", "Alice")
            .build(),
    )
    .await
    .unwrap();
    db.persist(
        db.delta("alice")
            .with_id("d-age-1")
            .with_timestamp(2000)
            .set_property("e1", "age", 30i64)
            .build(),
    )
    .await
    .unwrap();
    db.persist(
        db.delta("alice")
            .with_id("d-age-2")
            .with_timestamp(3000)
            .set_property("e1", "age", 31i64)
            .build(),
    )
    .await
    .unwrap();

    let tt = db.time_travel();
    assert_eq!(tt.timeline("e1").await.unwrap(), vec![1000, 2000, 3000]);

    let age_changes = tt.track_changes("e1", "age").await.unwrap();
    let ids: Vec<&str> = age_changes.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["d-age-1", "d-age-2"]);

    assert_eq!(tt.origin("e1").await.unwrap().unwrap().id, "d-name");
}

#[tokio::test]
async fn test_replay_and_compare() {
    let db = db().await;
    for i in 1..=4u64 {
        db.persist(
            db.delta("alice")
                .with_id(format!("d-{i}"))
                .with_timestamp(i * 1000)
                .set_property("e1", "age", i as i64)
                .build(),
        )
        .await
        .unwrap();
    }

    let tt = db.time_travel();
    let frames = tt
        .replay("e1", "person", TimestampRange::default(), 10, None)
        .await
        .unwrap();
    assert_eq!(frames.len(), 4);
    // The projection grows monotonically along the replay.
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.view.property("age").len(), i + 1);
    }

    let cmp = tt.compare("e1", "person", 1500, 3500).await.unwrap();
    assert_eq!(cmp.properties.get("age"), Some(&(1, 3)));
    assert_eq!(cmp.delta_count_change, 2);
}
