//! End-to-end ETL tests against a real PostgreSQL
//!
//! Each test starts its own container, applies the star schema migrations
//! and runs the pipeline over files on disk. They require Docker:
//!
//! ```bash
//! cargo test -p sparkify-etl --test pipeline_integration_test -- --ignored
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serial_test::serial;
use sparkify_etl::config::{EtlConfig, ParseFailurePolicy};
use sparkify_etl::constraints::ConstraintOutcome;
use sparkify_etl::pipeline::Pipeline;
use sparkify_etl::report::LoadState;
use sparkify_etl::transform::SourceKind;
use sparkify_etl::EtlError;
use sqlx::postgres::PgConnection;
use tempfile::TempDir;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::info;

const SAMPLE_SONG: &str = r#"{"num_songs": 1, "artist_id": "AR7G5I41187FB4CE6C", "artist_latitude": null, "artist_longitude": null, "artist_location": "London, England", "artist_name": "Adam Ant", "song_id": "SOMZWCG12A8C13C480", "title": "I Didn't Mean To", "duration": 218.93179, "year": 0}"#;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sparkify_etl=debug,sqlx=warn")),
        )
        .with_test_writer()
        .try_init();
}

async fn start_postgres() -> Result<(ContainerAsync<Postgres>, String)> {
    let container = Postgres::default().with_tag("16-alpine").start().await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let url = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

    Ok((container, url))
}

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn config(url: &str, song_data: impl Into<PathBuf>, log_data: impl Into<PathBuf>) -> EtlConfig {
    EtlConfig {
        database_url: url.to_string(),
        song_data_dir: song_data.into(),
        log_data_dir: log_data.into(),
        ..EtlConfig::default()
    }
}

async fn migrated_pipeline(config: &EtlConfig) -> Result<Pipeline> {
    let mut pipeline = Pipeline::connect(config).await?;
    pipeline.migrate().await?;
    Ok(pipeline)
}

fn write(root: &Path, relative: &str, content: &str) -> Result<()> {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}

async fn count(conn: &mut PgConnection, table: &str) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {table}");
    Ok(sqlx::query_scalar(&sql).fetch_one(&mut *conn).await?)
}

async fn table_exists(conn: &mut PgConnection, table: &str) -> Result<bool> {
    Ok(sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
        .bind(table)
        .fetch_one(&mut *conn)
        .await?)
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_fixture_load_populates_star_schema() -> Result<()> {
    init_tracing();
    let (_container, url) = start_postgres().await?;
    let config = config(&url, fixtures().join("song_data"), fixtures().join("log_data"));

    let mut pipeline = migrated_pipeline(&config).await?;
    let report = pipeline.run().await?;
    info!("{report}");

    let catalog = report.unit(SourceKind::Catalog).expect("catalog unit");
    assert_eq!(catalog.state, LoadState::Dropped);
    assert_eq!(catalog.files_seen, 3);
    assert_eq!(catalog.files_loaded, 3);
    assert_eq!(catalog.rows_staged, 3);
    assert_eq!(catalog.inserted_into("artists"), Some(3));
    assert_eq!(catalog.inserted_into("songs"), Some(3));

    let events = report.unit(SourceKind::EventLog).expect("event-log unit");
    assert_eq!(events.state, LoadState::Dropped);
    assert_eq!(events.files_loaded, 2);
    // Home page and anonymous plays never reach staging
    assert_eq!(events.rows_staged, 4);
    assert_eq!(events.inserted_into("users"), Some(2));
    assert_eq!(events.inserted_into("time"), Some(4));
    assert_eq!(events.inserted_into("songplays"), Some(4));

    assert_eq!(report.total_songplays, 4);
    assert_eq!(report.resolved_songplays, 3);
    assert_eq!(report.skipped_files().count(), 0);

    let mut conn = pipeline.into_connection();
    assert!(!table_exists(&mut conn, "song_staging").await?);
    assert!(!table_exists(&mut conn, "log_staging").await?);

    // Latest event of the batch wins
    let level: String = sqlx::query_scalar("SELECT level FROM users WHERE user_id = 26")
        .fetch_one(&mut conn)
        .await?;
    assert_eq!(level, "paid");

    let user_agent: String = sqlx::query_scalar(
        "SELECT user_agent FROM songplays WHERE start_time = '2018-11-11 02:33:56'",
    )
    .fetch_one(&mut conn)
    .await?;
    assert!(user_agent.starts_with("Mozilla/5.0"));
    assert!(!user_agent.contains('"'));

    Ok(())
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_single_catalog_file_end_to_end() -> Result<()> {
    init_tracing();
    let (_container, url) = start_postgres().await?;
    let data = TempDir::new()?;
    write(data.path(), "song_data/A/A/A/TRAAAAW128F429D538.json", SAMPLE_SONG)?;
    fs::create_dir_all(data.path().join("log_data"))?;

    let config = config(&url, data.path().join("song_data"), data.path().join("log_data"));
    let mut pipeline = migrated_pipeline(&config).await?;
    pipeline.run().await?;

    // Same keys again: nothing new
    let again = pipeline.run().await?;
    let catalog = again.unit(SourceKind::Catalog).expect("catalog unit");
    assert_eq!(catalog.inserted_into("artists"), Some(0));
    assert_eq!(catalog.inserted_into("songs"), Some(0));

    let mut conn = pipeline.into_connection();
    assert_eq!(count(&mut conn, "artists").await?, 1);
    assert_eq!(count(&mut conn, "songs").await?, 1);

    let artist: (String, String, String, bool, bool) = sqlx::query_as(
        "SELECT artist_id, name, location, latitude IS NULL, longitude IS NULL FROM artists",
    )
    .fetch_one(&mut conn)
    .await?;
    assert_eq!(
        artist,
        (
            "AR7G5I41187FB4CE6C".to_string(),
            "Adam Ant".to_string(),
            "London, England".to_string(),
            true,
            true
        )
    );

    let song: (String, String, String, i16, String) = sqlx::query_as(
        "SELECT song_id, title, artist_id, year, duration::TEXT FROM songs",
    )
    .fetch_one(&mut conn)
    .await?;
    assert_eq!(song.0, "SOMZWCG12A8C13C480");
    assert_eq!(song.1, "I Didn't Mean To");
    assert_eq!(song.2, "AR7G5I41187FB4CE6C");
    assert_eq!(song.3, 0);
    assert_eq!(song.4, "218.93179");

    Ok(())
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_rerun_inserts_nothing() -> Result<()> {
    init_tracing();
    let (_container, url) = start_postgres().await?;
    let config = config(&url, fixtures().join("song_data"), fixtures().join("log_data"));

    let mut pipeline = migrated_pipeline(&config).await?;
    pipeline.run().await?;
    let second = pipeline.run().await?;

    for unit in &second.units {
        assert_eq!(unit.state, LoadState::Dropped);
        for outcome in &unit.inserted {
            assert_eq!(outcome.inserted, 0, "rerun inserted into {}", outcome.target);
        }
    }

    let mut conn = pipeline.into_connection();
    for (table, expected) in [
        ("artists", 3),
        ("songs", 3),
        ("users", 2),
        ("time", 4),
        ("songplays", 4),
    ] {
        assert_eq!(count(&mut conn, table).await?, expected, "{table}");
    }

    Ok(())
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_time_dimension_for_known_timestamp() -> Result<()> {
    init_tracing();
    let (_container, url) = start_postgres().await?;
    let config = config(&url, fixtures().join("song_data"), fixtures().join("log_data"));

    let mut pipeline = migrated_pipeline(&config).await?;
    pipeline.run().await?;

    let mut conn = pipeline.into_connection();
    let row: (i16, i16, i16, i16, i16, bool) = sqlx::query_as(
        "SELECT hour, day, week, month, year, weekday FROM time \
         WHERE start_time = '2018-11-11 02:33:56'",
    )
    .fetch_one(&mut conn)
    .await?;
    assert_eq!(row, (2, 11, 45, 11, 2018, false));

    Ok(())
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_unmatched_plays_keep_null_references() -> Result<()> {
    init_tracing();
    let (_container, url) = start_postgres().await?;
    let config = config(&url, fixtures().join("song_data"), fixtures().join("log_data"));

    let mut pipeline = migrated_pipeline(&config).await?;
    pipeline.run().await?;

    let mut conn = pipeline.into_connection();
    let matched: (Option<String>, Option<String>) = sqlx::query_as(
        "SELECT song_id, artist_id FROM songplays WHERE start_time = '2018-11-11 02:33:56'",
    )
    .fetch_one(&mut conn)
    .await?;
    assert_eq!(
        matched,
        (
            Some("SOMZWCG12A8C13C480".to_string()),
            Some("ARD7TVE1187B99BFB1".to_string())
        )
    );

    // Every resolved reference points at an existing row
    let dangling: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM songplays sp \
         WHERE (sp.song_id IS NOT NULL AND NOT EXISTS (SELECT 1 FROM songs s WHERE s.song_id = sp.song_id)) \
            OR (sp.artist_id IS NOT NULL AND NOT EXISTS (SELECT 1 FROM artists a WHERE a.artist_id = sp.artist_id))",
    )
    .fetch_one(&mut conn)
    .await?;
    assert_eq!(dangling, 0);

    let unmatched: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM songplays WHERE song_id IS NULL AND artist_id IS NULL",
    )
    .fetch_one(&mut conn)
    .await?;
    assert_eq!(unmatched, 1);

    Ok(())
}

fn play(artist: &str, song: &str, ts: i64, user_agent: &str) -> String {
    format!(
        r#"{{"artist":"{artist}","auth":"Logged In","firstName":"Lily","gender":"F","itemInSession":0,"lastName":"Koch","length":200.0,"level":"paid","location":"Chicago-Naperville-Elgin, IL-IN-WI","method":"PUT","page":"NextSong","registration":1541048010796.0,"sessionId":1,"song":"{song}","status":200,"ts":{ts},"userAgent":"{user_agent}","userId":"15"}}"#
    )
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_play_matches_catalog_spelling_of_shared_artist() -> Result<()> {
    init_tracing();
    let (_container, url) = start_postgres().await?;
    let data = TempDir::new()?;
    write(
        data.path(),
        "song_data/A/TRA.json",
        r#"{"num_songs": 1, "artist_id": "ARX", "artist_latitude": null, "artist_longitude": null, "artist_location": "", "artist_name": "Mariah Carey", "song_id": "SO1", "title": "Hero", "duration": 259.0, "year": 1993}"#,
    )?;
    write(
        data.path(),
        "song_data/B/TRB.json",
        r#"{"num_songs": 1, "artist_id": "ARX", "artist_latitude": null, "artist_longitude": null, "artist_location": "", "artist_name": "Mariah Carey featuring Boyz II Men", "song_id": "SO2", "title": "One Sweet Day", "duration": 281.0, "year": 1995}"#,
    )?;
    write(
        data.path(),
        "log_data/events.json",
        &play("Mariah Carey featuring Boyz II Men", "One Sweet Day", 1541903636796, "Mozilla"),
    )?;

    let config = config(&url, data.path().join("song_data"), data.path().join("log_data"));
    let mut pipeline = migrated_pipeline(&config).await?;
    let report = pipeline.run().await?;

    // Only one spelling survives in artists
    let catalog = report.unit(SourceKind::Catalog).expect("catalog unit");
    assert_eq!(catalog.inserted_into("artists"), Some(1));
    assert_eq!(report.resolved_songplays, 1);

    let mut conn = pipeline.into_connection();
    let refs: (Option<String>, Option<String>) =
        sqlx::query_as("SELECT song_id, artist_id FROM songplays")
            .fetch_one(&mut conn)
            .await?;
    assert_eq!(refs, (Some("SO2".to_string()), Some("ARX".to_string())));
    assert!(!table_exists(&mut conn, "song_staging").await?);
    assert!(!table_exists(&mut conn, "log_staging").await?);

    Ok(())
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_play_falls_back_to_catalog_of_earlier_runs() -> Result<()> {
    init_tracing();
    let (_container, url) = start_postgres().await?;
    let data = TempDir::new()?;
    write(data.path(), "song_data/A/TRA.json", SAMPLE_SONG)?;
    fs::create_dir_all(data.path().join("log_data"))?;
    fs::create_dir_all(data.path().join("empty"))?;

    let first = config(&url, data.path().join("song_data"), data.path().join("log_data"));
    migrated_pipeline(&first).await?.run().await?;

    write(
        data.path(),
        "log_data/events.json",
        &play("Adam Ant", "I Didn't Mean To", 1541903636796, "Mozilla"),
    )?;
    let second = config(&url, data.path().join("empty"), data.path().join("log_data"));
    let mut pipeline = migrated_pipeline(&second).await?;
    let report = pipeline.run().await?;
    assert_eq!(report.resolved_songplays, 1);

    let mut conn = pipeline.into_connection();
    let song_id: Option<String> = sqlx::query_scalar("SELECT song_id FROM songplays")
        .fetch_one(&mut conn)
        .await?;
    assert_eq!(song_id.as_deref(), Some("SOMZWCG12A8C13C480"));

    Ok(())
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_nul_text_is_skipped_under_skip_policy() -> Result<()> {
    init_tracing();
    let (_container, url) = start_postgres().await?;
    let data = TempDir::new()?;
    write(data.path(), "song_data/A/TRA.json", SAMPLE_SONG)?;
    write(
        data.path(),
        "log_data/good.json",
        &play("Adam Ant", "I Didn't Mean To", 1541903636796, "Mozilla"),
    )?;
    write(
        data.path(),
        "log_data/nul.json",
        &play("Adam Ant", "I Didn't Mean To", 1541903700000, "Moz\\u0000illa"),
    )?;

    let config = config(&url, data.path().join("song_data"), data.path().join("log_data"));
    let mut pipeline = migrated_pipeline(&config).await?;
    let report = pipeline.run().await?;

    let events = report.unit(SourceKind::EventLog).expect("event-log unit");
    assert_eq!(events.files_loaded, 1);
    assert_eq!(events.skipped.len(), 1);
    assert!(events.skipped[0].path.ends_with("log_data/nul.json"));
    assert!(events.skipped[0].error.contains("user_agent"));

    let mut conn = pipeline.into_connection();
    assert_eq!(count(&mut conn, "songplays").await?, 1);

    Ok(())
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_event_log_failure_drops_catalog_staging() -> Result<()> {
    init_tracing();
    let (_container, url) = start_postgres().await?;
    let data = TempDir::new()?;
    write(data.path(), "song_data/A/TRA.json", SAMPLE_SONG)?;
    write(data.path(), "log_data/bad.json", "not json")?;

    let config = EtlConfig {
        on_parse_error: ParseFailurePolicy::Abort,
        ..config(&url, data.path().join("song_data"), data.path().join("log_data"))
    };
    let mut pipeline = migrated_pipeline(&config).await?;

    let err = pipeline.run().await.expect_err("abort policy must fail the run");
    assert!(matches!(err, EtlError::Parse { .. }), "unexpected error: {err}");

    let mut conn = pipeline.into_connection();
    assert!(!table_exists(&mut conn, "song_staging").await?);
    assert!(!table_exists(&mut conn, "log_staging").await?);
    // The catalog merge had already committed
    assert_eq!(count(&mut conn, "songs").await?, 1);
    assert_eq!(count(&mut conn, "songplays").await?, 0);

    Ok(())
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_skip_policy_records_bad_file() -> Result<()> {
    init_tracing();
    let (_container, url) = start_postgres().await?;
    let data = TempDir::new()?;
    write(data.path(), "song_data/A/good.json", SAMPLE_SONG)?;
    write(data.path(), "song_data/B/bad.json", "{\"artist_id\": \"AR0\", ")?;
    fs::create_dir_all(data.path().join("log_data"))?;

    let config = config(&url, data.path().join("song_data"), data.path().join("log_data"));
    let mut pipeline = migrated_pipeline(&config).await?;
    let report = pipeline.run().await?;

    let catalog = report.unit(SourceKind::Catalog).expect("catalog unit");
    assert_eq!(catalog.files_seen, 2);
    assert_eq!(catalog.files_loaded, 1);
    assert_eq!(catalog.skipped.len(), 1);
    assert!(catalog.skipped[0].path.ends_with("song_data/B/bad.json"));
    assert!(catalog.skipped[0].error.contains("malformed JSON"));

    let mut conn = pipeline.into_connection();
    assert_eq!(count(&mut conn, "songs").await?, 1);

    Ok(())
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_abort_policy_fails_and_drops_staging() -> Result<()> {
    init_tracing();
    let (_container, url) = start_postgres().await?;
    let data = TempDir::new()?;
    write(data.path(), "song_data/A/good.json", SAMPLE_SONG)?;
    write(data.path(), "song_data/B/bad.json", "not json")?;
    fs::create_dir_all(data.path().join("log_data"))?;

    let config = EtlConfig {
        on_parse_error: ParseFailurePolicy::Abort,
        ..config(&url, data.path().join("song_data"), data.path().join("log_data"))
    };
    let mut pipeline = migrated_pipeline(&config).await?;

    let err = pipeline.run().await.expect_err("abort policy must fail the run");
    assert!(matches!(err, EtlError::Parse { .. }), "unexpected error: {err}");

    let mut conn = pipeline.into_connection();
    assert!(!table_exists(&mut conn, "song_staging").await?);
    assert_eq!(count(&mut conn, "artists").await?, 0);
    assert_eq!(count(&mut conn, "songs").await?, 0);

    Ok(())
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_missing_source_tree_is_fatal() -> Result<()> {
    init_tracing();
    let (_container, url) = start_postgres().await?;
    let data = TempDir::new()?;

    let config = config(&url, data.path().join("nowhere"), data.path().join("log_data"));
    let mut pipeline = migrated_pipeline(&config).await?;

    let err = pipeline.run().await.expect_err("missing tree must fail the run");
    assert!(matches!(err, EtlError::Extract(_)), "unexpected error: {err}");

    let mut conn = pipeline.into_connection();
    assert!(!table_exists(&mut conn, "song_staging").await?);

    Ok(())
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_constraints_applied_once() -> Result<()> {
    init_tracing();
    let (_container, url) = start_postgres().await?;
    let config = config(&url, fixtures().join("song_data"), fixtures().join("log_data"));

    let mut pipeline = migrated_pipeline(&config).await?;
    let first = pipeline.run().await?;
    assert_eq!(first.constraints.len(), 10);
    assert!(first
        .constraints
        .iter()
        .all(|c| matches!(c, ConstraintOutcome::Applied { .. })));

    let second = pipeline.run().await?;
    assert!(second
        .constraints
        .iter()
        .all(|c| matches!(c, ConstraintOutcome::AlreadyPresent { .. })));

    Ok(())
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_constraint_failure_is_reported_not_fatal() -> Result<()> {
    init_tracing();
    let (_container, url) = start_postgres().await?;
    let config = config(&url, fixtures().join("song_data"), fixtures().join("log_data"));

    let mut pipeline = migrated_pipeline(&config).await?;
    let mut conn = pipeline.into_connection();
    sqlx::query(
        "INSERT INTO songplays (start_time, user_id, level, session_id) \
         VALUES ('2018-01-01 00:00:00', 999, 'free', 1)",
    )
    .execute(&mut conn)
    .await?;

    let mut pipeline = Pipeline::new(conn, &config)?;
    let report = pipeline.run().await?;

    let failed: Vec<_> = report.failed_constraints().map(|c| c.name()).collect();
    assert!(failed.contains(&"fk__songplays__users"));
    assert!(failed.contains(&"fk__songplays__time"));
    assert!(report
        .constraints
        .iter()
        .any(|c| c.name() == "idx_songplays_user_id" && !c.is_failed()));
    assert_eq!(report.total_songplays, 5);

    Ok(())
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_constraints_can_be_disabled() -> Result<()> {
    init_tracing();
    let (_container, url) = start_postgres().await?;
    let config = EtlConfig {
        apply_constraints: false,
        ..config(&url, fixtures().join("song_data"), fixtures().join("log_data"))
    };

    let mut pipeline = migrated_pipeline(&config).await?;
    let report = pipeline.run().await?;
    assert!(report.constraints.is_empty());

    let mut conn = pipeline.into_connection();
    let foreign_keys: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pg_constraint WHERE contype = 'f'")
            .fetch_one(&mut conn)
            .await?;
    assert_eq!(foreign_keys, 0);

    Ok(())
}
