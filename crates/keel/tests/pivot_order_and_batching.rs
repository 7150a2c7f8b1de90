//! Fixed-order pivot rewrites and statement batching.

mod common;

use common::{block_on, new_entity, session_with, unwrap_outcome};
use keel::prelude::*;

fn playlists() -> Arc<MetadataStorage> {
    Arc::new(
        MetadataStorage::new([
            EntityMetadata::new("Playlist")
                .property(PropertyMeta::id("id"))
                .property(PropertyMeta::scalar("name"))
                .property(PropertyMeta::many_to_many("tracks", "Track").fixed_order()),
            EntityMetadata::new("Track")
                .property(PropertyMeta::id("id"))
                .property(PropertyMeta::scalar("title")),
        ])
        .expect("valid playlist metadata"),
    )
}

fn track_order(uow: &UnitOfWork<keel_memory::MemoryDriver>) -> Vec<Value> {
    let mut rows = uow.driver().table_rows("playlist_tracks");
    rows.sort_by_key(|r| r.get("position").and_then(Value::as_i64));
    rows.iter().filter_map(|r| r.get("track").cloned()).collect()
}

#[test]
fn reordering_a_fixed_order_collection_rewrites_its_pivot_rows() {
    block_on(async {
        let cx = Cx::for_testing();
        let uow = session_with(playlists(), UnitOfWorkConfig::default());
        let playlist = new_entity(&uow, "Playlist", &[("name", Value::from("Mix"))]);
        let tracks = playlist.collection("tracks").expect("tracks");
        let titles = ["Intro", "Verse", "Outro"];
        let items: Vec<EntityRef> = titles
            .iter()
            .map(|t| new_entity(&uow, "Track", &[("title", Value::from(*t))]))
            .collect();
        for item in &items {
            tracks.add(item).expect("add");
        }
        uow.persist(&playlist).expect("persist");

        let stats = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(stats.collection_rows, 3);
        let ids: Vec<Value> = items.iter().filter_map(|t| t.get("id")).collect();
        assert_eq!(track_order(&uow), ids);

        // appending keeps the existing rows
        let bonus = new_entity(&uow, "Track", &[("title", Value::from("Bonus"))]);
        tracks.add(&bonus).expect("append");
        let stats = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(stats.collection_rows, 1);
        uow.driver().clear_statements();

        // moving the first track to the end changes the order of kept members
        tracks.remove(&items[0]).expect("remove");
        tracks.add(&items[0]).expect("re-add");
        let stats = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(stats.collection_rows, 8);
        let pivot_statements: Vec<String> = uow
            .driver()
            .statements()
            .into_iter()
            .filter(|s| s.contains("playlist_tracks"))
            .collect();
        assert_eq!(pivot_statements.len(), 2);
        assert!(pivot_statements[0].starts_with("DELETE playlist_tracks in"));
        assert_eq!(pivot_statements[1], "INSERT playlist_tracks (4)");

        let expected: Vec<Value> = [&items[1], &items[2], &bonus, &items[0]]
            .iter()
            .filter_map(|t| t.get("id"))
            .collect();
        assert_eq!(track_order(&uow), expected);
        assert!(!tracks.is_dirty());
    });
}

#[test]
fn batch_settings_split_statements() {
    block_on(async {
        let cx = Cx::for_testing();
        let config = UnitOfWorkConfig::new()
            .batch_size(2)
            .use_batch_updates(false)
            .delete_batch_size(2);
        let uow = session_with(common::library(), config);
        let authors: Vec<EntityRef> = ["Ada", "Grace", "Barbara"]
            .iter()
            .map(|name| new_entity(&uow, "Author", &[("name", Value::from(*name))]))
            .collect();
        for author in &authors {
            uow.persist(author).expect("persist");
        }

        let stats = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(stats.inserted, 3);
        assert_eq!(
            uow.driver().statements(),
            vec!["BEGIN", "INSERT author (2)", "INSERT author (1)", "COMMIT"]
        );

        uow.driver().clear_statements();
        for author in &authors {
            let name = author.get("name").and_then(|v| v.as_str().map(str::to_string));
            author.set("name", format!("{} 2nd", name.unwrap_or_default())).expect("rename");
        }
        let stats = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(stats.updated, 3);
        assert_eq!(
            uow.driver().statements(),
            vec![
                "BEGIN",
                "UPDATE author (1)",
                "UPDATE author (1)",
                "UPDATE author (1)",
                "COMMIT"
            ]
        );

        uow.driver().clear_statements();
        for author in &authors {
            uow.remove(author).expect("remove");
        }
        let stats = unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(stats.deleted, 3);
        assert_eq!(
            uow.driver().statements(),
            vec![
                "BEGIN",
                "DELETE author in (1) (2)",
                "DELETE author in (3)",
                "COMMIT"
            ]
        );
        assert!(uow.driver().rows("Author").is_empty());
    });
}
