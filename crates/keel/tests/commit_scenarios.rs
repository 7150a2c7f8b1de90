//! End-to-end commits against the in-memory driver.

mod common;

use common::{block_on, load, new_entity, session, unwrap_outcome};
use keel::prelude::*;
use keel::{ChangeSetType, ValidationErrorKind};

#[test]
fn create_assigns_key_and_manages_entity() {
    block_on(async {
        let cx = Cx::for_testing();
        let uow = session();
        let author = new_entity(&uow, "Author", &[("name", Value::from("Ada"))]);
        uow.persist(&author).expect("persist");

        let stats = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(stats.inserted, 1);
        assert!(author.is_managed());
        assert_eq!(author.get("id"), Some(Value::BigInt(1)));

        let summaries = uow.change_sets_of_last_commit();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].kind, ChangeSetType::Create);
        assert_eq!(summaries[0].primary_key.as_deref(), Some("1"));
        assert_eq!(
            summaries[0].payload.keys().collect::<Vec<_>>(),
            vec!["name"]
        );
        assert!(uow.get_by_id("Author", 1_i64, None).expect("lookup").is_some());
        assert_eq!(uow.pending_counts().persist, 0);
    });
}

#[test]
fn update_writes_only_changed_fields() {
    block_on(async {
        let cx = Cx::for_testing();
        let uow = session();
        let author = load(
            &uow,
            "Author",
            &[("id", Value::BigInt(1)), ("name", Value::from("Ada"))],
        );
        author.set("name", "Ada L.").expect("set name");

        let stats = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(stats.updated, 1);

        let summaries = uow.change_sets_of_last_commit();
        assert_eq!(summaries[0].kind, ChangeSetType::Update);
        assert_eq!(summaries[0].payload.len(), 1);
        assert_eq!(summaries[0].payload.get("name"), Some(&Value::from("Ada L.")));
        assert_eq!(
            uow.driver().rows("Author")[0].get("name"),
            Some(&Value::from("Ada L."))
        );
    });
}

#[test]
fn second_commit_without_changes_is_a_no_op() {
    block_on(async {
        let cx = Cx::for_testing();
        let uow = session();
        let author = new_entity(&uow, "Author", &[("name", Value::from("Ada"))]);
        uow.persist(&author).expect("persist");
        unwrap_outcome(uow.commit(&cx).await);
        uow.driver().clear_statements();

        let stats = unwrap_outcome(uow.commit(&cx).await);
        assert!(stats.is_empty());
        assert!(uow.driver().statements().is_empty());
        assert!(uow.compute_change_set(&author).expect("compute").is_none());
    });
}

#[test]
fn cascade_persist_orders_parents_first() {
    block_on(async {
        let cx = Cx::for_testing();
        let uow = session();
        let author = new_entity(&uow, "Author", &[("name", Value::from("Ada"))]);
        let book = new_entity(&uow, "Book", &[("title", Value::from("Notes"))]);
        author.collection("books").expect("books").add(&book).expect("add");
        uow.persist(&author).expect("persist");

        let stats = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(stats.inserted, 2);
        assert_eq!(
            uow.driver().statements(),
            vec!["BEGIN", "INSERT author (1)", "INSERT book (1)", "COMMIT"]
        );

        // the owning side received the parent's generated key
        assert_eq!(
            uow.driver().rows("Book")[0].get("author"),
            Some(&Value::BigInt(1))
        );
        assert!(book.is_managed());
        assert!(!author.collection("books").expect("books").is_dirty());
        assert_eq!(
            author.collection("books").expect("books").snapshot().map(|s| s.len()),
            Some(1)
        );
    });
}

#[test]
fn adding_to_collection_twice_changes_nothing() {
    block_on(async {
        let cx = Cx::for_testing();
        let uow = session();
        let author = new_entity(&uow, "Author", &[("name", Value::from("Ada"))]);
        let book = new_entity(&uow, "Book", &[("title", Value::from("Notes"))]);
        let books = author.collection("books").expect("books");
        books.add(&book).expect("add");
        books.add(&book).expect("add again");
        assert_eq!(books.len(), 1);
        uow.persist(&author).expect("persist");
        unwrap_outcome(uow.commit(&cx).await);

        books.add(&book).expect("add after commit");
        assert!(!books.is_dirty());
        let stats = unwrap_outcome(uow.commit(&cx).await);
        assert!(stats.is_empty());
    });
}

#[test]
fn identity_map_returns_one_instance_per_row() {
    block_on(async {
        let cx = Cx::for_testing();
        let uow = session();
        uow.driver().seed(
            "Author",
            vec![common::row(&[("id", Value::BigInt(7)), ("name", Value::from("Grace"))])],
        );

        let placeholder = uow.reference("Author", 7_i64).expect("reference");
        assert!(!placeholder.is_initialized());

        let found = unwrap_outcome(uow.find_one(&cx, "Author", 7_i64).await).expect("row exists");
        assert_eq!(found, placeholder);
        assert!(placeholder.is_initialized());
        assert_eq!(placeholder.get("name"), Some(Value::from("Grace")));

        let again = unwrap_outcome(uow.find_one(&cx, "Author", 7_i64).await).expect("cached");
        assert_eq!(again, found);
        // the second lookup is served from the identity map
        assert_eq!(
            uow.driver()
                .statements()
                .iter()
                .filter(|s| s.starts_with("FIND"))
                .count(),
            1
        );
        assert!(unwrap_outcome(uow.find_one(&cx, "Author", 8_i64).await).is_none());
    });
}

#[test]
fn hydrated_reference_points_at_managed_instance() {
    let uow = session();
    let author = load(
        &uow,
        "Author",
        &[("id", Value::BigInt(1)), ("name", Value::from("Ada"))],
    );
    let book = load(
        &uow,
        "Book",
        &[
            ("id", Value::BigInt(1)),
            ("title", Value::from("Notes")),
            ("author", Value::BigInt(1)),
        ],
    );
    assert_eq!(book.reference("author"), Some(author));
    assert!(uow.compute_change_set(&book).expect("compute").is_none());
}

#[test]
fn many_to_many_syncs_pivot_rows() {
    block_on(async {
        let cx = Cx::for_testing();
        let uow = session();
        let author = new_entity(&uow, "Author", &[("name", Value::from("Ada"))]);
        let rust = new_entity(&uow, "Tag", &[("label", Value::from("rust"))]);
        let math = new_entity(&uow, "Tag", &[("label", Value::from("math"))]);
        let tags = author.collection("tags").expect("tags");
        tags.add(&rust).expect("add rust");
        tags.add(&math).expect("add math");
        uow.persist(&author).expect("persist");

        let stats = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(stats.inserted, 3);
        assert_eq!(stats.collection_rows, 2);
        assert_eq!(uow.driver().table_rows("author_tags").len(), 2);
        assert!(rust.collection("authors").expect("inverse").contains(&author));

        tags.remove(&rust).expect("remove rust");
        let stats = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(stats.collection_rows, 1);
        let pivot = uow.driver().table_rows("author_tags");
        assert_eq!(pivot.len(), 1);
        assert_eq!(pivot[0].get("tag"), math.get("id").as_ref());
        // the tag itself survives; the relation does not remove
        assert_eq!(uow.driver().rows("Tag").len(), 2);
    });
}

#[test]
fn cascade_remove_deletes_children_first() {
    block_on(async {
        let cx = Cx::for_testing();
        let uow = session();
        let author = new_entity(&uow, "Author", &[("name", Value::from("Ada"))]);
        let book = new_entity(&uow, "Book", &[("title", Value::from("Notes"))]);
        author.collection("books").expect("books").add(&book).expect("add");
        uow.persist(&author).expect("persist");
        unwrap_outcome(uow.commit(&cx).await);
        uow.driver().clear_statements();

        uow.remove(&author).expect("remove");
        let stats = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(stats.deleted, 2);
        assert_eq!(
            uow.driver().statements(),
            vec!["BEGIN", "DELETE book in (1)", "DELETE author in (1)", "COMMIT"]
        );
        assert!(!author.is_managed());
        assert!(!book.is_managed());
        assert_eq!(uow.pending_counts().managed, 0);
    });
}

#[test]
fn removed_rows_pointing_at_each_other_are_unlinked_first() {
    block_on(async {
        let cx = Cx::for_testing();
        let uow = session();
        let author = new_entity(&uow, "Author", &[("name", Value::from("Ada"))]);
        let book = new_entity(&uow, "Book", &[("title", Value::from("Notes"))]);
        author.collection("books").expect("books").add(&book).expect("add");
        author.set_reference("favorite_book", Some(&book)).expect("favourite");
        uow.persist(&author).expect("persist");
        unwrap_outcome(uow.commit(&cx).await);
        uow.driver().clear_statements();

        uow.remove(&author).expect("remove");
        let stats = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(stats.deleted, 2);
        assert_eq!(stats.extra_updates, 1);
        assert_eq!(
            uow.driver().statements(),
            vec![
                "BEGIN",
                "UPDATE author (1)",
                "DELETE book in (1)",
                "DELETE author in (1)",
                "COMMIT"
            ]
        );
        assert!(uow.driver().rows("Author").is_empty());
        assert!(uow.driver().rows("Book").is_empty());
    });
}

#[test]
fn clearing_a_required_reference_needs_orphan_removal() {
    let uow = session();
    let author = load(
        &uow,
        "Author",
        &[("id", Value::BigInt(1)), ("name", Value::from("Ada"))],
    );
    let book = load(
        &uow,
        "Book",
        &[
            ("id", Value::BigInt(1)),
            ("title", Value::from("Notes")),
            ("author", Value::BigInt(1)),
        ],
    );

    let err = book.set_reference("author", None).expect_err("required reference");
    assert_eq!(err.validation_kind(), Some(ValidationErrorKind::OrphanRemovalRequired));
    assert_eq!(book.reference("author"), Some(author));
    assert!(uow.compute_change_set(&book).expect("compute").is_none());

    // the nullable favourite can be cleared freely
    let other = load(
        &uow,
        "Author",
        &[
            ("id", Value::BigInt(2)),
            ("name", Value::from("Grace")),
            ("favorite_book", Value::BigInt(1)),
        ],
    );
    other.set_reference("favorite_book", None).expect("clear favourite");
    assert_eq!(other.reference("favorite_book"), None);
}

#[test]
fn moved_child_is_not_treated_as_orphan() {
    block_on(async {
        let cx = Cx::for_testing();
        let uow = session();
        let ada = new_entity(&uow, "Author", &[("name", Value::from("Ada"))]);
        let grace = new_entity(&uow, "Author", &[("name", Value::from("Grace"))]);
        let book = new_entity(&uow, "Book", &[("title", Value::from("Notes"))]);
        ada.collection("books").expect("books").add(&book).expect("add");
        uow.persist(&ada).expect("persist ada");
        uow.persist(&grace).expect("persist grace");
        unwrap_outcome(uow.commit(&cx).await);

        ada.collection("books").expect("books").remove(&book).expect("remove");
        grace.collection("books").expect("books").add(&book).expect("move");
        let stats = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(stats.deleted, 0);
        assert_eq!(stats.updated, 1);
        let rows = uow.driver().rows("Book");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("author"), grace.get("id").as_ref());
    });
}

#[test]
fn remove_then_persist_keeps_row() {
    block_on(async {
        let cx = Cx::for_testing();
        let uow = session();
        let author = load(
            &uow,
            "Author",
            &[("id", Value::BigInt(1)), ("name", Value::from("Ada"))],
        );
        uow.remove(&author).expect("remove");
        uow.persist(&author).expect("persist again");
        assert_eq!(uow.pending_counts().remove, 0);

        let stats = unwrap_outcome(uow.commit(&cx).await);
        assert!(stats.is_empty());
        assert_eq!(uow.driver().rows("Author").len(), 1);
        assert!(author.is_managed());
    });
}

#[test]
fn merge_returns_managed_copy() {
    block_on(async {
        let cx = Cx::for_testing();
        let uow = session();
        let managed = load(
            &uow,
            "Author",
            &[("id", Value::BigInt(1)), ("name", Value::from("Ada"))],
        );
        let detached = new_entity(
            &uow,
            "Author",
            &[("id", Value::BigInt(1)), ("name", Value::from("Ada Lovelace"))],
        );

        let merged = uow.merge(&detached).expect("merge");
        assert_eq!(merged, managed);
        assert_ne!(merged, detached);
        assert_eq!(managed.get("name"), Some(Value::from("Ada Lovelace")));

        let stats = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(stats.updated, 1);
    });
}

#[test]
fn detached_and_cleared_entities_are_not_written() {
    block_on(async {
        let cx = Cx::for_testing();
        let uow = session();
        let ada = load(
            &uow,
            "Author",
            &[("id", Value::BigInt(1)), ("name", Value::from("Ada"))],
        );
        let grace = load(
            &uow,
            "Author",
            &[("id", Value::BigInt(2)), ("name", Value::from("Grace"))],
        );

        ada.set("name", "Ada L.").expect("set");
        uow.detach(&ada);
        assert!(!ada.is_managed());
        assert!(uow.get_by_id("Author", 1_i64, None).expect("lookup").is_none());
        assert!(unwrap_outcome(uow.commit(&cx).await).is_empty());

        let pending = new_entity(&uow, "Author", &[("name", Value::from("Pending"))]);
        uow.persist(&pending).expect("persist");
        grace.set("name", "Grace H.").expect("set");
        uow.clear();
        assert_eq!(uow.pending_counts().managed, 0);
        assert_eq!(uow.pending_counts().persist, 0);
        assert!(unwrap_outcome(uow.commit(&cx).await).is_empty());
        assert_eq!(uow.driver().rows("Author").len(), 2);
    });
}
