use catalog_ingest::db;
use catalog_ingest::error::PipelineError;
use catalog_ingest::model::Source;
use catalog_ingest::run::{self, RunOptions};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use tempfile::TempDir;

async fn setup_pool() -> db::Pool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn write_dump(dir: &TempDir, content: &str) -> PathBuf {
    let path = dir.path().join("dump.sql");
    std::fs::write(&path, content).unwrap();
    path
}

fn opts() -> RunOptions {
    RunOptions {
        batch_size: 2,
        dry_run: false,
    }
}

/// Two well-formed articles: ids 101 (category 'News', tags, gallery plus
/// dle_images attachments) and 102 (category 'NEWS ', which must collapse
/// into the same category row).
fn good_dump() -> String {
    [
        "INSERT INTO `dle_category` VALUES (1,0,1,'News','korea-news',0),(2,0,2,'NEWS ','news-alt',0);\n",
        "INSERT INTO `dle_tags` VALUES (1,101,'Hybrid'),(2,101,'Toyota Motors'),(3,102,'bmw');\n",
        "INSERT INTO `dle_images` VALUES (1,'2019-05/a.jpg|||2019-05/b.jpg',101,'admin','1557000000');\n",
        "INSERT INTO `dle_post` VALUES \
         (101,'admin','2015-03-02 12:30:00','Short [b]intro[/b]','Full [b]story[/b] text<br/>line two','brand|Toyota||image1|main.jpg||gallery|g1.jpg, g2.jpg','Toyota Prius',0,0,'1','toyota-prius'),\
         (102,'editor','2016-07-10 09:00:00','','BMW story','','BMW X5',0,0,'2','bmw-x5');\n",
    ]
    .concat()
}

/// Same dump with a malformed row injected between the two good ones.
fn dump_with_malformed_row() -> String {
    good_dump().replace(
        "(102,'editor'",
        "(103,'broken'),(102,'editor'",
    )
}

#[tokio::test]
async fn imports_articles_with_joined_categories_tags_and_media() {
    let pool = setup_pool().await;
    let dir = TempDir::new().unwrap();
    let dump = write_dump(&dir, &good_dump());
    let cancel = AtomicBool::new(false);

    let summary = run::run_dle(&pool, &dump, false, &opts(), &cancel)
        .await
        .unwrap();
    assert_eq!(summary.inserted, 2);
    assert_eq!(summary.failed, 0);

    let body: String = sqlx::query_scalar("SELECT body FROM posts WHERE external_id = '101'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(body, "Full **story** text\nline two");

    // xfields main image first, then gallery, then dle_images rows.
    let locators: Vec<String> = sqlx::query_scalar(
        "SELECT m.locator FROM media m JOIN posts p ON p.id = m.post_id \
         WHERE p.external_id = '101' ORDER BY m.position",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(
        locators,
        vec![
            "posts/main.jpg",
            "posts/g1.jpg",
            "posts/g2.jpg",
            "posts/2019-05/a.jpg",
            "posts/2019-05/b.jpg",
        ]
    );

    let tags: Vec<String> = sqlx::query_scalar(
        "SELECT t.name FROM tags t JOIN post_tags pt ON pt.tag_id = t.id \
         JOIN posts p ON p.id = pt.post_id WHERE p.external_id = '101' ORDER BY t.name",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(tags, vec!["hybrid".to_string(), "toyota motors".to_string()]);
}

#[tokio::test]
async fn equivalent_category_names_collapse_to_one_row() {
    let pool = setup_pool().await;
    let dir = TempDir::new().unwrap();
    let dump = write_dump(&dir, &good_dump());
    let cancel = AtomicBool::new(false);

    run::run_dle(&pool, &dump, false, &opts(), &cancel)
        .await
        .unwrap();

    let categories: Vec<String> = sqlx::query_scalar("SELECT name FROM categories")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(categories, vec!["news".to_string()]);
}

#[tokio::test]
async fn second_run_without_clear_is_idempotent() {
    let pool = setup_pool().await;
    let dir = TempDir::new().unwrap();
    let dump = write_dump(&dir, &good_dump());
    let cancel = AtomicBool::new(false);

    let first = run::run_dle(&pool, &dump, false, &opts(), &cancel)
        .await
        .unwrap();
    assert_eq!(first.inserted, 2);

    let second = run::run_dle(&pool, &dump, false, &opts(), &cancel)
        .await
        .unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.skipped, 2);
    assert_eq!(db::count_posts(&pool, Source::LegacyCms).await.unwrap(), 2);
}

#[tokio::test]
async fn clear_twice_does_not_accumulate() {
    let pool = setup_pool().await;
    let dir = TempDir::new().unwrap();
    let dump = write_dump(&dir, &good_dump());
    let cancel = AtomicBool::new(false);

    run::run_dle(&pool, &dump, true, &opts(), &cancel)
        .await
        .unwrap();
    let after_first = db::count_posts(&pool, Source::LegacyCms).await.unwrap();

    let second = run::run_dle(&pool, &dump, true, &opts(), &cancel)
        .await
        .unwrap();
    assert_eq!(second.inserted, 2);
    assert_eq!(
        db::count_posts(&pool, Source::LegacyCms).await.unwrap(),
        after_first
    );
}

#[tokio::test]
async fn malformed_row_is_contained() {
    let pool = setup_pool().await;
    let dir = TempDir::new().unwrap();
    let dump = write_dump(&dir, &dump_with_malformed_row());
    let cancel = AtomicBool::new(false);

    let summary = run::run_dle(&pool, &dump, false, &opts(), &cancel)
        .await
        .unwrap();
    assert_eq!(summary.inserted, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(db::count_posts(&pool, Source::LegacyCms).await.unwrap(), 2);
}

#[tokio::test]
async fn missing_dump_is_fatal() {
    let pool = setup_pool().await;
    let cancel = AtomicBool::new(false);

    let err = run::run_dle(
        &pool,
        std::path::Path::new("/nonexistent/dump.sql"),
        false,
        &opts(),
        &cancel,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, PipelineError::SourceUnavailable(_)));
}

#[tokio::test]
async fn dry_run_writes_nothing() {
    let pool = setup_pool().await;
    let dir = TempDir::new().unwrap();
    let dump = write_dump(&dir, &good_dump());
    let cancel = AtomicBool::new(false);

    let dry = RunOptions {
        batch_size: 2,
        dry_run: true,
    };
    let summary = run::run_dle(&pool, &dump, false, &dry, &cancel)
        .await
        .unwrap();
    assert_eq!(summary.inserted, 2);
    assert_eq!(db::count_posts(&pool, Source::LegacyCms).await.unwrap(), 0);
}

#[tokio::test]
async fn concurrent_legacy_runs_are_rejected() {
    let pool = setup_pool().await;
    let dir = TempDir::new().unwrap();
    let dump = write_dump(&dir, &good_dump());
    let cancel = AtomicBool::new(false);

    db::acquire_lease(&pool, Source::LegacyCms, "other-run", 3600)
        .await
        .unwrap();
    let err = run::run_dle(&pool, &dump, false, &opts(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::ConcurrentRunDetected { .. }));
    assert_eq!(db::count_posts(&pool, Source::LegacyCms).await.unwrap(), 0);
}
