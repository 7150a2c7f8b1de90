//! Optimistic and pessimistic locks, rollback, flush events and commit queueing.

mod common;

use std::sync::Mutex;

use common::{block_on, load, new_entity, session, session_with, unwrap_outcome};
use futures::FutureExt;
use keel::prelude::*;
use keel::{ValidationError, ValidationErrorKind};
use keel_memory::Operation;

fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(err) => err,
        other => std::panic::panic_any(format!("expected an error, got {other:?}")),
    }
}

fn document(uow: &UnitOfWork<keel_memory::MemoryDriver>, version: i32) -> EntityRef {
    load(
        uow,
        "Document",
        &[
            ("id", Value::BigInt(1)),
            ("title", Value::from("Draft")),
            ("version", Value::Int(version)),
        ],
    )
}

#[test]
fn failed_commit_rolls_back_and_can_be_retried() {
    block_on(async {
        let cx = Cx::for_testing();
        let uow = session();
        let rollbacks = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&rollbacks);
        uow.on_after_rollback(move || {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        let author = new_entity(&uow, "Author", &[("name", Value::from("Ada"))]);
        let book = new_entity(&uow, "Book", &[("title", Value::from("Notes"))]);
        author.collection("books").expect("books").add(&book).expect("add");
        uow.persist(&author).expect("persist");
        uow.driver().fail_next(Operation::Insert, Some("book"));

        let err = expect_err(uow.commit(&cx).await);
        assert!(err.to_string().contains("injected"), "{err}");
        assert_eq!(
            uow.driver().statements(),
            vec!["BEGIN", "INSERT author (1)", "INSERT book (1)", "ROLLBACK"]
        );
        assert_eq!(*rollbacks.lock().unwrap(), 1);
        assert!(uow.driver().rows("Author").is_empty());
        assert_eq!(author.get("id"), None);
        assert!(!author.is_managed());
        assert_eq!(uow.pending_counts().persist, 2);

        let stats = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(stats.inserted, 2);
        assert_eq!(author.get("id"), Some(Value::BigInt(1)));
        assert_eq!(uow.driver().rows("Book").len(), 1);
        assert_eq!(*rollbacks.lock().unwrap(), 1);
    });
}

#[test]
fn before_flush_error_aborts_without_statements() {
    block_on(async {
        let cx = Cx::for_testing();
        let uow = session();
        uow.on_before_flush(|| {
            Err(ValidationError::new(ValidationErrorKind::Invalid, "refused").into())
        });
        let author = new_entity(&uow, "Author", &[("name", Value::from("Ada"))]);
        uow.persist(&author).expect("persist");

        let err = expect_err(uow.commit(&cx).await);
        assert_eq!(err.validation_kind(), Some(ValidationErrorKind::Invalid));
        assert!(uow.driver().statements().is_empty());
        assert_eq!(uow.pending_counts().persist, 1);
    });
}

#[test]
fn flush_events_fire_in_order() {
    block_on(async {
        let cx = Cx::for_testing();
        let uow = session();
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        uow.on_before_flush(move || {
            l.lock().unwrap().push("before_flush");
            Ok(())
        });
        let l = Arc::clone(&log);
        uow.on_after_flush(move || {
            l.lock().unwrap().push("after_flush");
            Ok(())
        });
        let l = Arc::clone(&log);
        uow.on_after_commit(move || {
            l.lock().unwrap().push("after_commit");
            Ok(())
        });

        let author = new_entity(&uow, "Author", &[("name", Value::from("Ada"))]);
        uow.persist(&author).expect("persist");
        unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["before_flush", "after_flush", "after_commit"]
        );
    });
}

#[test]
fn stale_version_fails_the_update() {
    block_on(async {
        let cx = Cx::for_testing();
        let uow = session();
        // the stored row moved on to version 3 after this copy was read
        uow.driver().seed(
            "Document",
            vec![common::row(&[
                ("id", Value::BigInt(1)),
                ("title", Value::from("Draft")),
                ("version", Value::Int(3)),
            ])],
        );
        let stale = common::row(&[
            ("id", Value::BigInt(1)),
            ("title", Value::from("Draft")),
            ("version", Value::Int(1)),
        ]);
        let doc = uow.hydrate("Document", &stale, None).expect("hydrate");

        doc.set("title", "Final").expect("set");
        let err = expect_err(uow.commit(&cx).await);
        let lock = match err {
            Error::OptimisticLock(lock) => lock,
            other => {
                std::panic::panic_any(format!("expected an optimistic lock error, got {other:?}"))
            }
        };
        assert_eq!(lock.entity, "Document");
        assert_eq!(lock.expected, Some(Value::Int(1)));
        assert_eq!(lock.actual, Some(Value::Int(3)));
        assert_eq!(doc.get("title"), Some(Value::from("Final")));
        assert_eq!(doc.get("version"), Some(Value::Int(1)));
    });
}

#[test]
fn successful_update_bumps_version() {
    block_on(async {
        let cx = Cx::for_testing();
        let uow = session();
        let doc = document(&uow, 1);
        doc.set("title", "Final").expect("set");

        let stats = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(stats.updated, 1);
        assert_eq!(doc.get("version"), Some(Value::Int(2)));
        assert_eq!(uow.driver().rows("Document")[0].get("version"), Some(&Value::Int(2)));
        assert!(uow.compute_change_set(&doc).expect("compute").is_none());
    });
}

#[test]
fn concurrency_check_field_guards_unversioned_updates() {
    block_on(async {
        let cx = Cx::for_testing();
        let metadata = Arc::new(
            MetadataStorage::new([EntityMetadata::new("Account")
                .property(PropertyMeta::id("id"))
                .property(PropertyMeta::scalar("owner"))
                .property(PropertyMeta::scalar("balance").concurrency_check())])
            .expect("valid metadata"),
        );
        let uow = session_with(metadata, UnitOfWorkConfig::default());
        uow.driver().seed(
            "Account",
            vec![
                common::row(&[
                    ("id", Value::BigInt(1)),
                    ("owner", Value::from("Ada")),
                    ("balance", Value::BigInt(100)),
                ]),
                common::row(&[
                    ("id", Value::BigInt(2)),
                    ("owner", Value::from("Grace")),
                    ("balance", Value::BigInt(50)),
                ]),
            ],
        );

        let current = common::row(&[
            ("id", Value::BigInt(1)),
            ("owner", Value::from("Ada")),
            ("balance", Value::BigInt(100)),
        ]);
        let fresh = uow.hydrate("Account", &current, None).expect("hydrate");
        fresh.set("owner", "Ada L.").expect("set");
        assert_eq!(unwrap_outcome(uow.commit(&cx).await).updated, 1);

        // read before someone else withdrew 30
        let stale = common::row(&[
            ("id", Value::BigInt(2)),
            ("owner", Value::from("Grace")),
            ("balance", Value::BigInt(80)),
        ]);
        let account = uow.hydrate("Account", &stale, None).expect("hydrate");
        account.set("owner", "Grace H.").expect("set");
        let lock = match expect_err(uow.commit(&cx).await) {
            Error::OptimisticLock(lock) => lock,
            other => {
                std::panic::panic_any(format!("expected an optimistic lock error, got {other:?}"))
            }
        };
        assert_eq!(lock.entity, "Account");
        assert_eq!(lock.expected, Some(Value::BigInt(80)));
        assert_eq!(lock.actual, Some(Value::BigInt(50)));
        assert!(lock.message.contains("balance"), "{}", lock.message);
        assert_eq!(
            uow.driver().rows("Account")[1].get("owner"),
            Some(&Value::from("Grace"))
        );
    });
}

#[test]
fn optimistic_lock_checks_loaded_version() {
    block_on(async {
        let cx = Cx::for_testing();
        let uow = session();
        let doc = document(&uow, 1);

        unwrap_outcome(uow.lock(&cx, &doc, LockMode::Optimistic, Some(Value::Int(1))).await);
        let err = expect_err(uow.lock(&cx, &doc, LockMode::Optimistic, Some(Value::Int(2))).await);
        assert!(err.is_optimistic_lock());

        let author = load(
            &uow,
            "Author",
            &[("id", Value::BigInt(1)), ("name", Value::from("Ada"))],
        );
        let err = expect_err(uow.lock(&cx, &author, LockMode::Optimistic, None).await);
        assert_eq!(err.validation_kind(), Some(ValidationErrorKind::NotVersioned));

        let detached = new_entity(&uow, "Document", &[("title", Value::from("Loose"))]);
        let err = expect_err(uow.lock(&cx, &detached, LockMode::Optimistic, None).await);
        assert_eq!(err.validation_kind(), Some(ValidationErrorKind::NotManaged));
    });
}

#[test]
fn pessimistic_lock_needs_a_transaction() {
    block_on(async {
        let cx = Cx::for_testing();
        let uow = session();
        let doc = document(&uow, 1);

        let err = expect_err(uow.lock(&cx, &doc, LockMode::PessimisticWrite, None).await);
        assert_eq!(err.validation_kind(), Some(ValidationErrorKind::TransactionRequired));

        unwrap_outcome(uow.driver().begin(&cx).await);
        unwrap_outcome(uow.lock(&cx, &doc, LockMode::PessimisticWrite, None).await);
        unwrap_outcome(uow.driver().commit(&cx).await);
        assert_eq!(
            uow.driver().statements(),
            vec!["BEGIN", "LOCK document PessimisticWrite in (1)", "COMMIT"]
        );
    });
}

#[test]
fn concurrent_commits_run_in_call_order() {
    block_on(async {
        let cx = Cx::for_testing();
        let uow = session();
        uow.driver().suspend_statements(true);

        let ada = new_entity(&uow, "Author", &[("name", Value::from("Ada"))]);
        uow.persist(&ada).expect("persist");
        let first = uow.commit(&cx);

        let second_uow = uow.clone();
        let grace = new_entity(&uow, "Author", &[("name", Value::from("Grace"))]);
        let second = async {
            second_uow.persist(&grace).expect("persist");
            second_uow.commit(&cx).await
        };

        let (first, second) = futures::join!(first, second);
        let first = unwrap_outcome(first);
        let second = unwrap_outcome(second);
        assert_eq!(first.inserted, 1);
        assert_eq!(second.inserted, 1);
        assert_eq!(ada.get("id"), Some(Value::BigInt(1)));
        assert_eq!(grace.get("id"), Some(Value::BigInt(2)));
        assert_eq!(
            uow.driver().statements(),
            vec![
                "BEGIN",
                "INSERT author (1)",
                "COMMIT",
                "BEGIN",
                "INSERT author (1)",
                "COMMIT"
            ]
        );
        assert!(!uow.is_committing());
        assert_eq!(uow.queued_commits(), 0);
    });
}

#[test]
fn commit_from_a_flush_callback_is_rejected() {
    block_on(async {
        let cx = Cx::for_testing();
        let uow = session();
        let inner = uow.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        uow.on_after_commit(move || {
            let cx = Cx::for_testing();
            if let Some(Outcome::Err(err)) = inner.commit(&cx).now_or_never() {
                sink.lock().unwrap().push(err.validation_kind());
            }
            Ok(())
        });

        let author = new_entity(&uow, "Author", &[("name", Value::from("Ada"))]);
        uow.persist(&author).expect("persist");
        unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Some(ValidationErrorKind::ReentrantCommit)]
        );
        assert!(author.is_managed());
    });
}
