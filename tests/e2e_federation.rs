//! E2E tests for federation between two instances

mod common;

use chanfed::data::{Actor, FederationStore};
use chanfed::federation::{DeliveryOutcome, Object, builder};
use common::{TestServer, eventually, follow};
use serde_json::json;

async fn stored_board(server: &TestServer, name: &str) -> Actor {
    server
        .state
        .db
        .get_actor_by_id_or_name(name)
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn follow_is_accepted_and_recorded_on_both_sides() {
    let a = TestServer::new().await;
    let b = TestServer::new().await;
    let board_a = a.create_board("a").await;
    let board_b = b.create_board("b").await;

    follow(&a, &board_a, &board_b).await;

    let (status, followers) = b.get_json("/b/followers").await;
    assert_eq!(status, 200);
    assert_eq!(followers["type"], "Collection");
    assert_eq!(followers["totalItems"], 1);
    assert_eq!(followers["items"][0]["id"], board_a.id);

    let (_, following) = a.get_json("/a/following").await;
    assert_eq!(following["items"], json!([{ "id": board_b.id }]));
}

#[tokio::test]
async fn followed_post_is_mirrored_once() {
    let a = TestServer::new().await;
    let b = TestServer::new().await;
    let board_a = a.create_board("a").await;
    let board_b = b.create_board("b").await;
    follow(&a, &board_a, &board_b).await;

    let post = b.publish("b", json!({ "content": "hello from b" })).await;
    let post_id = post["id"].as_str().unwrap().to_string();
    assert!(post_id.starts_with(&board_b.id));

    let db = a.state.db.clone();
    assert!(
        eventually(|| {
            let (db, id) = (db.clone(), post_id.clone());
            async move { db.object_exists(&id).await.unwrap() }
        })
        .await,
        "post never reached the follower"
    );

    let mirrored = a.state.db.get_object(&post_id).await.unwrap().unwrap();
    assert_eq!(mirrored.content, "hello from b");
    assert_eq!(mirrored.actor, board_b.id);

    // Redelivery of the same Create is acknowledged and changes nothing.
    let sender = stored_board(&b, "b").await;
    let object: Object = serde_json::from_value(post).unwrap();
    let mut create = builder::create(&sender, object);
    create.to = vec![board_a.id.clone()];
    let reports = b
        .state
        .federation
        .delivery()
        .deliver(&sender, &create)
        .await
        .unwrap()
        .finished()
        .await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcome, DeliveryOutcome::Delivered { attempts: 1 });
    assert_eq!(
        a.state.db.get_object(&post_id).await.unwrap().unwrap(),
        mirrored
    );
}

#[tokio::test]
async fn post_from_unfollowed_board_is_ignored() {
    let a = TestServer::new().await;
    let b = TestServer::new().await;
    let board_a = a.create_board("a").await;
    b.create_board("b").await;

    let post = b.publish("b", json!({ "content": "nobody asked" })).await;
    let post_id = post["id"].as_str().unwrap().to_string();

    let sender = stored_board(&b, "b").await;
    let mut create = builder::create(&sender, serde_json::from_value(post).unwrap());
    create.to = vec![board_a.id.clone()];
    let reports = b
        .state
        .federation
        .delivery()
        .deliver(&sender, &create)
        .await
        .unwrap()
        .finished()
        .await;

    assert_eq!(reports[0].outcome, DeliveryOutcome::Delivered { attempts: 1 });
    assert!(!a.state.db.object_exists(&post_id).await.unwrap());
}

#[tokio::test]
async fn deleted_post_is_tombstoned_on_the_follower() {
    let a = TestServer::new().await;
    let b = TestServer::new().await;
    let board_a = a.create_board("a").await;
    let board_b = b.create_board("b").await;
    follow(&a, &board_a, &board_b).await;

    let post = b.publish("b", json!({ "content": "short lived" })).await;
    let post_id = post["id"].as_str().unwrap().to_string();

    let db = a.state.db.clone();
    assert!(
        eventually(|| {
            let (db, id) = (db.clone(), post_id.clone());
            async move { db.object_exists(&id).await.unwrap() }
        })
        .await
    );

    let response = b.admin("/delete", json!({ "id": post_id })).await;
    assert_eq!(response.status(), 200);

    assert!(
        eventually(|| {
            let (db, id) = (db.clone(), post_id.clone());
            async move {
                db.get_object(&id)
                    .await
                    .unwrap()
                    .is_some_and(|record| record.kind == "Tombstone")
            }
        })
        .await,
        "delete never reached the follower"
    );
}

#[tokio::test]
async fn main_actor_cannot_follow_remote_boards() {
    let a = TestServer::new().await;
    let b = TestServer::new().await;
    let board_b = b.create_board("b").await;

    let response = a
        .admin("/follow", json!({ "actor": "main", "target": board_b.id }))
        .await;
    assert_eq!(response.status(), 403);
}
