//! Unit tests for the reading store.

use chrono::{Duration, TimeZone, Utc};
use rusqlite::Connection;

use crate::error::ReadingError;
use crate::reading::{
    format_timestamp, is_storable_timestamp, parse_timestamp, NewReading, DEFAULT_UNIT,
};
use crate::store::{insert_reading, latest_reading, query_readings, ReadingQuery};

/// Creates an in-memory SQLite database with migrations applied.
fn test_db() -> Connection {
    let conn = Connection::open_in_memory().expect("should open in-memory db");
    speedo_db::run_migrations(&conn).expect("migrations should succeed");
    conn
}

fn new_reading(device_id: &str, speed: f64) -> NewReading {
    NewReading {
        device_id: device_id.to_string(),
        speed,
        unit: DEFAULT_UNIT.to_string(),
        timestamp: None,
    }
}

fn count_rows(conn: &Connection) -> i64 {
    conn.query_row("SELECT COUNT(*) FROM speed_readings", [], |row| row.get(0))
        .expect("should count rows")
}

// ── insert_reading tests ─────────────────────────────────────────────

#[test]
fn insert_reading_stores_one_row() {
    let conn = test_db();

    let stored = insert_reading(&conn, &new_reading("car1", 42.5)).expect("insert should succeed");

    assert!(stored.id > 0, "returned row ID should be positive");
    assert_eq!(stored.device_id, "car1");
    assert_eq!(stored.speed, 42.5);
    assert_eq!(stored.unit, "km/h");
    assert_eq!(count_rows(&conn), 1);

    let (device_id, speed, unit): (String, f64, String) = conn
        .query_row(
            "SELECT device_id, speed, unit FROM speed_readings WHERE id = ?1",
            [stored.id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .expect("should query inserted row");
    assert_eq!(device_id, "car1");
    assert_eq!(speed, 42.5);
    assert_eq!(unit, "km/h");
}

#[test]
fn insert_reading_assigns_timestamp_at_write_time() {
    let conn = test_db();
    let before = Utc::now() - Duration::seconds(1);

    let stored = insert_reading(&conn, &new_reading("car1", 10.0)).expect("insert should succeed");

    let after = Utc::now() + Duration::seconds(1);
    assert!(stored.timestamp >= before && stored.timestamp <= after);
}

#[test]
fn insert_reading_keeps_supplied_timestamp() {
    let conn = test_db();
    let supplied = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();

    let stored = insert_reading(
        &conn,
        &NewReading {
            timestamp: Some(supplied),
            ..new_reading("car1", 10.0)
        },
    )
    .expect("insert should succeed");

    assert_eq!(stored.timestamp, supplied);

    let raw: String = conn
        .query_row(
            "SELECT timestamp FROM speed_readings WHERE id = ?1",
            [stored.id],
            |row| row.get(0),
        )
        .expect("should read raw timestamp");
    assert_eq!(raw, "2024-05-01T12:30:00.000Z");
}

#[test]
fn insert_reading_accepts_negative_speed_as_is() {
    let conn = test_db();

    let stored = insert_reading(&conn, &new_reading("car1", -3.25)).expect("insert should succeed");

    assert_eq!(stored.speed, -3.25);
}

#[test]
fn insert_reading_keeps_custom_unit() {
    let conn = test_db();

    let stored = insert_reading(
        &conn,
        &NewReading {
            unit: "mph".to_string(),
            ..new_reading("car1", 55.0)
        },
    )
    .expect("insert should succeed");

    assert_eq!(stored.unit, "mph");
}

#[test]
fn insert_reading_without_table_is_database_error() {
    let conn = Connection::open_in_memory().expect("should open in-memory db");

    let err = insert_reading(&conn, &new_reading("car1", 1.0)).expect_err("no table, no insert");

    assert!(matches!(err, ReadingError::Database(_)), "got {err:?}");
}

#[test]
fn insert_reading_refuses_years_outside_four_digits_without_writing() {
    let conn = test_db();

    for ts in [
        Utc.with_ymd_and_hms(10_000, 1, 1, 0, 0, 0).unwrap(),
        Utc.timestamp_opt(1_000_000_000_000, 0).unwrap(),
        Utc.with_ymd_and_hms(-1, 12, 31, 23, 59, 59).unwrap(),
    ] {
        let err = insert_reading(
            &conn,
            &NewReading {
                timestamp: Some(ts),
                ..new_reading("car1", 5.0)
            },
        )
        .expect_err("unstorable year must be refused");
        assert!(matches!(err, ReadingError::InvalidTimestamp(_)), "got {err:?}");
    }

    assert_eq!(count_rows(&conn), 0, "nothing is written for a refused timestamp");
    assert!(latest_reading(&conn).expect("latest still readable").is_none());
}

#[test]
fn insert_reading_round_trips_boundary_years() {
    let conn = test_db();
    let earliest = Utc.with_ymd_and_hms(0, 1, 1, 0, 0, 0).unwrap();
    let latest = Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap();

    for ts in [earliest, latest] {
        assert!(is_storable_timestamp(&ts));
        let stored = insert_reading(
            &conn,
            &NewReading {
                timestamp: Some(ts),
                ..new_reading("car1", 1.0)
            },
        )
        .expect("boundary year should be stored");
        assert_eq!(stored.timestamp, ts);
    }

    let newest = latest_reading(&conn)
        .expect("latest should read back")
        .expect("store is not empty");
    assert_eq!(newest.timestamp, latest);
}

#[test]
fn pre_epoch_timestamps_keep_chronological_order() {
    let conn = test_db();
    let before_epoch = Utc.timestamp_opt(-86_400, 0).unwrap();
    let after_epoch = Utc.timestamp_opt(86_400, 0).unwrap();

    for (ts, speed) in [(after_epoch, 2.0), (before_epoch, 1.0)] {
        insert_reading(
            &conn,
            &NewReading {
                timestamp: Some(ts),
                ..new_reading("car1", speed)
            },
        )
        .expect("insert should succeed");
    }

    let readings = query_readings(
        &conn,
        &ReadingQuery {
            since: Utc.with_ymd_and_hms(1969, 1, 1, 0, 0, 0).unwrap(),
            limit: 10,
        },
    )
    .expect("query should succeed");

    let speeds: Vec<f64> = readings.iter().map(|r| r.speed).collect();
    assert_eq!(speeds, vec![2.0, 1.0]);
    assert_eq!(readings[1].timestamp, before_epoch);
}

// ── latest_reading tests ─────────────────────────────────────────────

#[test]
fn latest_reading_on_empty_store_is_none() {
    let conn = test_db();

    let latest = latest_reading(&conn).expect("query should succeed");

    assert!(latest.is_none());
}

#[test]
fn latest_reading_returns_newest_by_timestamp() {
    let conn = test_db();
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    for (offset, speed) in [(2, 20.0), (5, 50.0), (1, 10.0)] {
        insert_reading(
            &conn,
            &NewReading {
                timestamp: Some(base + Duration::seconds(offset)),
                ..new_reading("car1", speed)
            },
        )
        .expect("insert should succeed");
    }

    let latest = latest_reading(&conn)
        .expect("query should succeed")
        .expect("store is not empty");

    assert_eq!(latest.speed, 50.0);
}

#[test]
fn latest_reading_breaks_timestamp_ties_by_insertion_order() {
    let conn = test_db();
    let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    for speed in [1.0, 2.0] {
        insert_reading(
            &conn,
            &NewReading {
                timestamp: Some(ts),
                ..new_reading("car1", speed)
            },
        )
        .expect("insert should succeed");
    }

    let latest = latest_reading(&conn)
        .expect("query should succeed")
        .expect("store is not empty");

    assert_eq!(latest.speed, 2.0);
}

// ── query_readings tests ─────────────────────────────────────────────

#[test]
fn query_readings_filters_by_window_newest_first() {
    let conn = test_db();
    let now = Utc::now();

    for (hours_ago, speed) in [(30, 1.0), (3, 2.0), (1, 3.0)] {
        insert_reading(
            &conn,
            &NewReading {
                timestamp: Some(now - Duration::hours(hours_ago)),
                ..new_reading("car1", speed)
            },
        )
        .expect("insert should succeed");
    }

    let readings = query_readings(
        &conn,
        &ReadingQuery {
            since: now - Duration::hours(24),
            limit: 100,
        },
    )
    .expect("query should succeed");

    let speeds: Vec<f64> = readings.iter().map(|r| r.speed).collect();
    assert_eq!(speeds, vec![3.0, 2.0]);
}

#[test]
fn query_readings_respects_limit() {
    let conn = test_db();

    for i in 0..10 {
        insert_reading(&conn, &new_reading("car1", f64::from(i))).expect("insert should succeed");
    }

    let readings = query_readings(
        &conn,
        &ReadingQuery {
            since: Utc::now() - Duration::hours(1),
            limit: 3,
        },
    )
    .expect("query should succeed");

    assert_eq!(readings.len(), 3);
}

#[test]
fn query_readings_excludes_boundary_instant() {
    let conn = test_db();
    let boundary = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

    insert_reading(
        &conn,
        &NewReading {
            timestamp: Some(boundary),
            ..new_reading("car1", 1.0)
        },
    )
    .expect("insert should succeed");

    let readings = query_readings(
        &conn,
        &ReadingQuery {
            since: boundary,
            limit: 10,
        },
    )
    .expect("query should succeed");

    assert!(readings.is_empty());
}

// ── format / serde tests ─────────────────────────────────────────────

#[test]
fn timestamp_format_matches_sqlite_strftime() {
    let conn = test_db();
    let ts = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap();

    let sqlite_formatted: String = conn
        .query_row(
            "SELECT strftime('%Y-%m-%dT%H:%M:%fZ', ?1)",
            ["2024-12-31 23:59:59"],
            |row| row.get(0),
        )
        .expect("strftime should succeed");

    assert_eq!(format_timestamp(&ts), sqlite_formatted);
    assert_eq!(parse_timestamp(&sqlite_formatted).unwrap(), ts);
}

#[test]
fn parse_timestamp_rejects_garbage() {
    let err = parse_timestamp("yesterday").expect_err("not rfc3339");
    assert!(matches!(err, ReadingError::InvalidTimestamp(_)));
}

#[test]
fn reading_serializes_broadcast_shape_without_id() {
    let conn = test_db();
    let stored = insert_reading(&conn, &new_reading("car1", 42.5)).expect("insert should succeed");

    let json = serde_json::to_value(&stored).expect("serialization should not fail");

    assert_eq!(json["device_id"], "car1");
    assert_eq!(json["speed"], 42.5);
    assert_eq!(json["unit"], "km/h");
    assert!(json["timestamp"].is_string());
    assert!(json.get("id").is_none(), "row id stays internal");
}
