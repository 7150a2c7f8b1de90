//! Shared fixtures: a small library model over the in-memory driver.

#![allow(dead_code)]

use std::future::Future;

use asupersync::runtime::RuntimeBuilder;
use keel::prelude::*;
use keel_memory::MemoryDriver;

pub fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}

/// Run `future` to completion on a fresh current-thread runtime.
pub fn block_on<F: Future>(future: F) -> F::Output {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(future)
}

/// Author 1-n Book (cascade persist + remove), Author n-m Tag, Author -> favourite Book,
/// Tag labels unique, and a versioned Document.
pub fn library() -> Arc<MetadataStorage> {
    Arc::new(
        MetadataStorage::new([
            EntityMetadata::new("Author")
                .property(PropertyMeta::id("id"))
                .property(PropertyMeta::scalar("name"))
                .property(PropertyMeta::scalar("email").unique().nullable())
                .property(
                    PropertyMeta::one_to_many("books", "Book", "author")
                        .cascade(&[Cascade::Persist, Cascade::Remove]),
                )
                .property(PropertyMeta::many_to_one("favorite_book", "Book").nullable())
                .property(PropertyMeta::many_to_many("tags", "Tag").inversed_by("authors")),
            EntityMetadata::new("Book")
                .property(PropertyMeta::id("id"))
                .property(PropertyMeta::scalar("title"))
                .property(PropertyMeta::many_to_one("author", "Author").inversed_by("books")),
            EntityMetadata::new("Tag")
                .property(PropertyMeta::id("id"))
                .property(PropertyMeta::scalar("label").unique())
                .property(PropertyMeta::many_to_many_inverse("authors", "Author", "tags")),
            EntityMetadata::new("Document")
                .property(PropertyMeta::id("id"))
                .property(PropertyMeta::scalar("title"))
                .property(PropertyMeta::scalar("version").version()),
        ])
        .expect("valid library metadata"),
    )
}

pub fn session() -> UnitOfWork<MemoryDriver> {
    session_with(library(), UnitOfWorkConfig::default())
}

pub fn session_with(
    metadata: Arc<MetadataStorage>,
    config: UnitOfWorkConfig,
) -> UnitOfWork<MemoryDriver> {
    UnitOfWork::with_config(MemoryDriver::new(Arc::clone(&metadata)), metadata, config)
}

pub fn row(pairs: &[(&str, Value)]) -> Row {
    pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
}

pub fn new_entity(
    uow: &UnitOfWork<MemoryDriver>,
    entity: &str,
    pairs: &[(&str, Value)],
) -> EntityRef {
    let created = uow.metadata().instantiate(entity).expect("registered entity");
    for (field, value) in pairs {
        created.set(field, value.clone()).expect("settable field");
    }
    created
}

/// Seed a row in the store and load it into the session.
pub fn load(uow: &UnitOfWork<MemoryDriver>, entity: &str, pairs: &[(&str, Value)]) -> EntityRef {
    let data = row(pairs);
    uow.driver().seed(entity, vec![data.clone()]);
    uow.hydrate(entity, &data, None).expect("hydrate row")
}
