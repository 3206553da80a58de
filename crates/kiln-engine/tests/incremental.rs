//! Memoization, dependency recording and invalidation through the public
//! engine API.

mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{key, Site};
use kiln_engine::{ChangeEvent, ContentHash, DepNode, Engine, QueryContext, QueryError};
use kiln_store::PathErrorKind;

fn load(ctx: &QueryContext<'_>, file: &str) -> Result<String, QueryError> {
    ctx.query(key("load", file), |ctx| ctx.read_to_string(file))
}

fn render(ctx: &QueryContext<'_>, page: &str, file: &str) -> Result<String, QueryError> {
    ctx.query(key("render", page), |ctx| {
        Ok(format!("<h1>{}</h1>", load(ctx, file)?.trim()))
    })
}

#[test]
fn second_request_reuses_the_first() {
    let site = Site::new(&[("a.md", "one two three")]);
    let engine = site.in_memory();
    let runs = AtomicUsize::new(0);
    let words = |engine: &Engine| -> usize {
        engine
            .query(key("words", "a.md"), |ctx| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(ctx.read_to_string("a.md")?.split_whitespace().count())
            })
            .unwrap()
    };

    assert_eq!(words(&engine), 3);
    assert_eq!(words(&engine), 3);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let stats = engine.stats();
    assert_eq!(stats.executions, 1);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.disk_reads, 1);
    assert_eq!(stats.requests, 2);
}

#[test]
fn identical_outputs_are_stored_once() {
    let site = Site::new(&[]);
    let engine = site.in_memory();
    let (a, b) = engine
        .request(|ctx| {
            let a = ctx.query(key("emit", "a"), |ctx| ctx.store(b"same bytes"))?;
            let b = ctx.query(key("emit", "b"), |ctx| ctx.store(b"same bytes"))?;
            Ok((a, b))
        })
        .unwrap();

    assert_eq!(a, b);
    assert_eq!(a, ContentHash::of(b"same bytes"));
    assert_eq!(engine.store().blobs().list().unwrap(), vec![a]);
    assert_eq!(engine.fetch(&a).unwrap().bytes(), b"same bytes");
    assert_eq!(engine.db().get(&key("emit", "a")).unwrap().outputs, vec![a]);
}

#[test]
fn rewriting_a_txt_recomputes_only_the_dependent_page() {
    let site = Site::new(&[("a.txt", "v1"), ("b.txt", "other")]);
    let engine = site.in_memory();
    let pages = |engine: &Engine| -> (String, String) {
        engine
            .request(|ctx| Ok((render(ctx, "page1", "a.txt")?, render(ctx, "page2", "b.txt")?)))
            .unwrap()
    };
    let fingerprint = |engine: &Engine| {
        engine.db().get(&key("load", "a.txt")).unwrap().dependencies[0].fingerprint
    };

    assert_eq!(pages(&engine), ("<h1>v1</h1>".into(), "<h1>other</h1>".into()));
    assert_eq!(fingerprint(&engine), ContentHash::of(b"v1"));
    let before = engine.stats().executions;

    site.write("a.txt", "v2");
    let report = engine
        .apply_change(ChangeEvent::Modified(site.path("a.txt")))
        .unwrap();
    assert!(report.contains(&key("render", "page1")));
    assert!(!report.contains(&key("render", "page2")));

    assert_eq!(pages(&engine), ("<h1>v2</h1>".into(), "<h1>other</h1>".into()));
    assert_eq!(engine.stats().executions - before, 2);
    assert_eq!(fingerprint(&engine), ContentHash::of(b"v2"));
}

fn leaf(ctx: &QueryContext<'_>, name: &str, file: &str) -> Result<String, QueryError> {
    ctx.query(key(name, file), |ctx| ctx.read_to_string(file))
}

fn chain(ctx: &QueryContext<'_>) -> Result<String, QueryError> {
    ctx.query(key("a", "site"), |ctx| {
        let b = ctx.query(key("b", "site"), |ctx| {
            Ok(format!("b({})", leaf(ctx, "c", "c.txt")?))
        })?;
        let d = leaf(ctx, "d", "d.txt")?;
        Ok(format!("{b}+{d}"))
    })
}

#[test]
fn invalidation_follows_reverse_edges_only() {
    let site = Site::new(&[("c.txt", "c1"), ("d.txt", "d1")]);
    let engine = site.in_memory();
    assert_eq!(engine.request(chain).unwrap(), "b(c1)+d1");

    site.write("c.txt", "c2");
    let report = engine
        .apply_change(ChangeEvent::Modified(site.path("c.txt")))
        .unwrap();
    let expected: BTreeSet<_> = [key("a", "site"), key("b", "site"), key("c", "c.txt")]
        .into_iter()
        .collect();
    assert_eq!(report.dirtied, expected);
    assert!(engine.db().is_valid(&key("d", "d.txt")));

    let before = engine.stats().executions;
    assert_eq!(engine.request(chain).unwrap(), "b(c2)+d1");
    assert_eq!(engine.stats().executions - before, 3);
}

fn conditional(ctx: &QueryContext<'_>) -> Result<String, QueryError> {
    ctx.query(key("cond", "page"), |ctx| {
        if ctx.read_to_string("flag.txt")?.trim() == "yes" {
            Ok(format!("extra:{}", ctx.read_to_string("extra.txt")?))
        } else {
            Ok("plain".to_string())
        }
    })
}

#[test]
fn dependencies_follow_the_path_taken() {
    let site = Site::new(&[("flag.txt", "no"), ("extra.txt", "e1")]);
    let engine = site.in_memory();
    let deps = |engine: &Engine| engine.db().get(&key("cond", "page")).unwrap().dependencies.len();

    assert_eq!(engine.request(conditional).unwrap(), "plain");
    assert_eq!(deps(&engine), 1);

    // Not read on this path, so not a dependency.
    site.write("extra.txt", "e2");
    let report = engine
        .apply_change(ChangeEvent::Modified(site.path("extra.txt")))
        .unwrap();
    assert!(report.is_empty());

    site.write("flag.txt", "yes");
    engine
        .apply_change(ChangeEvent::Modified(site.path("flag.txt")))
        .unwrap();
    assert_eq!(engine.request(conditional).unwrap(), "extra:e2");
    assert_eq!(deps(&engine), 2);

    site.write("extra.txt", "e3");
    let report = engine
        .apply_change(ChangeEvent::Modified(site.path("extra.txt")))
        .unwrap();
    assert!(report.contains(&key("cond", "page")));
    assert_eq!(engine.request(conditional).unwrap(), "extra:e3");
}

#[test]
fn failed_compute_writes_nothing_and_runs_again() {
    let site = Site::new(&[("a.txt", "v1")]);
    let engine = site.in_memory();
    let attempt = |engine: &Engine, fail: bool| {
        engine.query(key("outer", "x"), |ctx| {
            let inner = ctx.query(key("inner", "x"), |ctx| ctx.read_to_string("a.txt"))?;
            if fail {
                Err(QueryError::msg("broken template"))
            } else {
                Ok(inner.len())
            }
        })
    };

    match attempt(&engine, true).unwrap_err() {
        QueryError::Compute { key: failed, .. } => assert_eq!(failed, Some(key("outer", "x"))),
        other => panic!("unexpected {other:?}"),
    }
    assert!(engine.db().get(&key("outer", "x")).is_none());
    // Completed sub-computations are kept.
    assert!(engine.db().get(&key("inner", "x")).is_some());

    assert_eq!(attempt(&engine, false).unwrap(), 2);
    assert_eq!(engine.stats().executions, 3);
}

#[test]
fn paths_outside_the_root_are_refused() {
    let site = Site::new(&[]);
    let engine = site.in_memory();
    let err = engine
        .query(key("peek", "secret"), |ctx| ctx.read_to_string("../secret.txt"))
        .unwrap_err();
    assert!(matches!(
        err,
        QueryError::Path {
            kind: PathErrorKind::EscapesRoot,
            ..
        }
    ));
}

fn looping(ctx: &QueryContext<'_>) -> Result<u32, QueryError> {
    ctx.query(key("loop", "x"), looping)
}

#[test]
fn self_dependency_is_a_cycle() {
    let site = Site::new(&[]);
    let engine = site.in_memory();
    match engine.request(looping).unwrap_err() {
        QueryError::Cycle { key: at, path } => {
            assert_eq!(at, key("loop", "x"));
            assert_eq!(path, vec![key("loop", "x"), key("loop", "x")]);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(engine.stats().in_flight, 0);
    assert!(engine.db().get(&key("loop", "x")).is_none());
}

#[test]
fn mutual_dependency_reports_the_whole_path() {
    let site = Site::new(&[]);
    let engine = site.in_memory();
    fn a(ctx: &QueryContext<'_>) -> Result<u32, QueryError> {
        ctx.query(key("a", "x"), b)
    }
    fn b(ctx: &QueryContext<'_>) -> Result<u32, QueryError> {
        ctx.query(key("b", "x"), a)
    }
    match engine.request(a).unwrap_err() {
        QueryError::Cycle { path, .. } => {
            assert_eq!(path, vec![key("a", "x"), key("b", "x"), key("a", "x")]);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn forked_thunks_merge_dependencies_in_order() {
    let site = Site::new(&[("a.md", "one"), ("b.md", "two words"), ("c.md", "three more words")]);
    let engine = site.in_memory();
    let files = ["a.md", "b.md", "c.md"];
    let total = |engine: &Engine| -> usize {
        engine
            .query(key("total", "posts"), |ctx| {
                let thunks: Vec<_> = files
                    .iter()
                    .map(|&file| {
                        move |ctx: &QueryContext<'_>| {
                            ctx.query(key("words", file), |ctx| {
                                Ok(ctx.read_to_string(file)?.split_whitespace().count())
                            })
                        }
                    })
                    .collect();
                ctx.fork(thunks).into_iter().sum()
            })
            .unwrap()
    };

    assert_eq!(total(&engine), 6);
    let deps: Vec<DepNode> = engine
        .db()
        .get(&key("total", "posts"))
        .unwrap()
        .dependencies
        .into_iter()
        .map(|dep| dep.node)
        .collect();
    assert_eq!(
        deps,
        files
            .iter()
            .map(|file| DepNode::Query(key("words", file)))
            .collect::<Vec<_>>()
    );

    site.write("b.md", "two");
    let report = engine
        .apply_change(ChangeEvent::Modified(site.path("b.md")))
        .unwrap();
    assert!(report.contains(&key("total", "posts")));
    assert!(!report.contains(&key("words", "a.md")));
    assert_eq!(total(&engine), 5);
}

fn titles(ctx: &QueryContext<'_>) -> Result<Vec<String>, QueryError> {
    ctx.query(key("index", "posts"), |ctx| {
        let listing = ctx.list_dir("posts")?;
        listing
            .with_extension("md")
            .filter_map(|path| path.file_name())
            .map(|name| {
                let file = format!("posts/{name}");
                ctx.query(key("title", &file), |ctx| {
                    let body = ctx.read_to_string(&file)?;
                    Ok(body.lines().next().unwrap_or_default().to_string())
                })
            })
            .collect()
    })
}

#[test]
fn new_listing_members_rebuild_the_collection() {
    let site = Site::new(&[("posts/a.md", "Hello\nbody"), ("posts/b.md", "World\nbody")]);
    let engine = site.in_memory();
    assert_eq!(engine.request(titles).unwrap(), vec!["Hello", "World"]);

    site.write("posts/c.md", "Again");
    site.write("posts/notes.txt", "ignored");
    let report = engine
        .apply_changes([
            ChangeEvent::Created(site.path("posts/c.md")),
            ChangeEvent::Created(site.path("posts/notes.txt")),
        ])
        .unwrap();
    assert!(report.contains(&key("index", "posts")));
    assert!(!report.contains(&key("title", "posts/a.md")));

    let before = engine.stats().executions;
    assert_eq!(engine.request(titles).unwrap(), vec!["Hello", "World", "Again"]);
    // The index and the new member's title.
    assert_eq!(engine.stats().executions - before, 2);

    site.remove("posts/a.md");
    engine
        .apply_change(ChangeEvent::Removed(site.path("posts/a.md")))
        .unwrap();
    assert_eq!(engine.request(titles).unwrap(), vec!["World", "Again"]);
}

#[test]
fn config_inputs_invalidate_their_readers() {
    let site = Site::new(&[]);
    let engine = site.in_memory();
    let heading = |engine: &Engine| -> String {
        engine
            .query(key("heading", "index"), |ctx| {
                Ok(format!("# {}", ctx.input::<String>("title")?))
            })
            .unwrap()
    };

    assert!(engine.set_input("title", &"Blog").unwrap().is_some());
    assert_eq!(heading(&engine), "# Blog");
    assert!(engine.set_input("title", &"Blog").unwrap().is_none());

    let set = engine.set_input("title", &"Notes").unwrap().unwrap();
    assert!(set.contains(&key("heading", "index")));
    assert_eq!(heading(&engine), "# Notes");

    let err = engine
        .query(key("missing", "x"), |ctx| ctx.input::<u32>("nope"))
        .unwrap_err();
    assert!(matches!(err, QueryError::NotFound { .. }));
}

#[test]
fn placeholders_resolve_once_generated() {
    let site = Site::new(&[]);
    let engine = site.in_memory();
    let (image, meta) = engine
        .request(|ctx| {
            let image = ctx.query(key("og", "image"), |ctx| ctx.store_named("og.png", b"png bytes"))?;
            let meta = ctx.query(key("meta", "index"), |ctx| Ok(ctx.placeholder("og.png")?.to_hex()))?;
            Ok((image, meta))
        })
        .unwrap();
    assert_eq!(meta, image.to_hex());

    let err = engine
        .query(key("meta", "other"), |ctx| ctx.placeholder("missing.png"))
        .unwrap_err();
    assert!(matches!(err, QueryError::NotFound { .. }));
}

#[test]
fn rebinding_a_placeholder_dirties_its_resolvers() {
    let site = Site::new(&[("src.txt", "v1")]);
    let engine = site.in_memory();
    let build = |engine: &Engine| {
        engine
            .request(|ctx| {
                let image = ctx.query(key("og", "image"), |ctx| {
                    let body = ctx.read_to_string("src.txt")?;
                    ctx.store_named("og.png", body.as_bytes())
                })?;
                let meta = ctx.query(key("meta", "index"), |ctx| {
                    Ok(ctx.placeholder("og.png")?.to_hex())
                })?;
                Ok((image, meta))
            })
            .unwrap()
    };
    let (first, meta) = build(&engine);
    assert_eq!(meta, first.to_hex());

    site.write("src.txt", "v2");
    let report = engine
        .apply_change(ChangeEvent::Modified(site.path("src.txt")))
        .unwrap();
    assert!(report.contains(&key("og", "image")));
    assert!(!report.contains(&key("meta", "index")));

    let (second, meta) = build(&engine);
    assert_ne!(second, first);
    assert_eq!(meta, second.to_hex());
    assert_eq!(engine.store().placeholder("og.png").unwrap(), second);

    // Nothing changed since; both stay memoized.
    let before = engine.stats().executions;
    assert_eq!(build(&engine), (second, second.to_hex()));
    assert_eq!(engine.stats().executions, before);
}

#[test]
fn garbage_collection_keeps_what_roots_reach() {
    let site = Site::new(&[("a.txt", "draft body")]);
    let engine = site.in_memory();
    let (kept, gone) = engine
        .request(|ctx| {
            let kept = ctx.query(key("page", "keep"), |ctx| ctx.store(b"kept page"))?;
            let gone = ctx.query(key("page", "gone"), |ctx| {
                let body = ctx.read_to_string("a.txt")?;
                ctx.store(body.as_bytes())
            })?;
            Ok((kept, gone))
        })
        .unwrap();
    engine.set_input("theme", &"dark").unwrap();
    assert_eq!(engine.records_named(&["page"]).len(), 2);

    let summary = engine.collect_garbage(&[key("page", "keep")]).unwrap();
    assert_eq!(summary.records, 1);
    assert_eq!(summary.inputs, 1);
    assert_eq!(summary.blobs, 1);

    assert!(engine.fetch(&kept).is_ok());
    assert!(matches!(engine.fetch(&gone), Err(QueryError::NotFound { .. })));
    assert_eq!(engine.stats().db.records, 1);

    // Config values survive collection.
    let theme = engine
        .query(key("theme", "x"), |ctx| ctx.input::<String>("theme"))
        .unwrap();
    assert_eq!(theme, "dark");
}

#[test]
fn dependency_graph_exports_dot() {
    let site = Site::new(&[("c.txt", "c"), ("d.txt", "d")]);
    let engine = site.in_memory();
    engine.request(chain).unwrap();

    let graph = engine.dependency_graph();
    // a, b, c, d, and the two files.
    assert_eq!(graph.node_count(), 6);
    assert_eq!(graph.edge_count(), 5);
    let dot = graph.to_dot();
    assert!(dot.starts_with("digraph"));
    assert!(dot.contains("b(\\\"site\\\")"));
}
