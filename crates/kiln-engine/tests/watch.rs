//! The notify-backed watcher driving a real engine.

mod common;

use std::thread;
use std::time::{Duration, Instant};

use common::{key, Site};
use kiln_engine::{Engine, FileWatcher, InvalidationReport, QueryContext, QueryError};

fn page(ctx: &QueryContext<'_>) -> Result<String, QueryError> {
    ctx.query(key("page", "a"), |ctx| {
        let body = ctx.read_to_string("a.txt")?;
        let members = ctx.list_dir(".")?.entries.len();
        ctx.store(body.as_bytes())?;
        Ok(format!("{} ({members})", body.trim()))
    })
}

fn pump(engine: &Engine, watcher: &FileWatcher) -> InvalidationReport {
    engine.apply_changes(watcher.drain()).unwrap()
}

#[test]
fn watched_edits_dirty_readers_and_cache_writes_do_not() {
    let site = Site::new(&[("a.txt", "one")]);
    let engine = Engine::open(site.config_in_root()).unwrap();
    assert!(site.path(".kiln").is_dir());
    assert_eq!(engine.request(page).unwrap(), "one (2)");

    let watcher = FileWatcher::watch(site.root()).unwrap();
    site.write("a.txt", "two");

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if pump(&engine, &watcher).contains(&key("page", "a")) {
            break;
        }
        assert!(Instant::now() < deadline, "edit never reached the engine");
        thread::sleep(Duration::from_millis(50));
    }
    // Trailing notifications for the same write.
    thread::sleep(Duration::from_millis(300));
    pump(&engine, &watcher);

    // Recomputing writes the database and a blob inside the root.
    assert_eq!(engine.request(page).unwrap(), "two (2)");
    let settled = engine.db().revision();

    thread::sleep(Duration::from_millis(300));
    let report = pump(&engine, &watcher);
    assert!(report.is_empty());
    assert_eq!(engine.db().revision(), settled);
    assert_eq!(engine.request(page).unwrap(), "two (2)");
    assert_eq!(engine.db().revision(), settled);
}
