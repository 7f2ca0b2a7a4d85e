use gridflow_core::db::open_db_in_memory;
use gridflow_core::model::grid::{Gridset, ShapeGrid};
use gridflow_core::model::user::User;
use gridflow_core::{
    CatalogError, CatalogRepository, Chain, ChainRepository, Priority, SqliteCatalog, SqliteChainRepository,
    Status,
};
use rusqlite::Connection;
use uuid::Uuid;

fn seeded() -> Connection {
    let conn = open_db_in_memory().unwrap();
    SqliteCatalog::new(&conn)
        .reconcile_user(&User::new("alice", 0))
        .unwrap();
    conn
}

fn insert(repo: &SqliteChainRepository<'_>, priority: i64, submitted_at: i64) -> Uuid {
    repo.insert_chain(&Chain::new("alice", Priority(priority), submitted_at))
        .unwrap()
}

#[test]
fn count_ahead_orders_by_priority_then_submission() {
    let conn = seeded();
    let repo = SqliteChainRepository::new(&conn);
    let c1 = insert(&repo, 5, 1);
    let c2 = insert(&repo, 1, 2);
    let c3 = insert(&repo, 1, 3);
    let c4 = insert(&repo, 3, 4);

    assert_eq!(repo.count_chains_ahead_of(c1).unwrap(), 0);
    assert_eq!(repo.count_chains_ahead_of(c2).unwrap(), 2);
    assert_eq!(repo.count_chains_ahead_of(c3).unwrap(), 3);
    assert_eq!(repo.count_chains_ahead_of(c4).unwrap(), 1);

    repo.update_chain_status(c1, Status::Complete, 10).unwrap();
    assert_eq!(repo.count_chains_ahead_of(c2).unwrap(), 1);
}

#[test]
fn pending_list_follows_run_order() {
    let conn = seeded();
    let repo = SqliteChainRepository::new(&conn);
    let c1 = insert(&repo, 5, 1);
    let c2 = insert(&repo, 1, 2);
    let c3 = insert(&repo, 1, 3);
    let c4 = insert(&repo, 3, 4);
    repo.update_chain_status(c3, Status::FatalError, 5).unwrap();

    let pending: Vec<Uuid> = repo
        .list_pending_chains(10)
        .unwrap()
        .into_iter()
        .map(|summary| summary.id)
        .collect();
    assert_eq!(pending, vec![c1, c4, c2]);
    assert_eq!(repo.list_pending_chains(1).unwrap().len(), 1);
}

#[test]
fn unknown_chain_is_not_found() {
    let conn = seeded();
    let repo = SqliteChainRepository::new(&conn);
    assert!(repo.count_chains_ahead_of(Uuid::new_v4()).is_err());
    assert!(repo.get_chain(Uuid::new_v4()).unwrap().is_none());
}

#[test]
fn chains_round_trip_bookkeeping_and_follow_their_gridset() {
    let conn = seeded();
    let catalog = SqliteCatalog::new(&conn);
    let grid = catalog
        .reconcile_shapegrid(&ShapeGrid::new("alice", "grid10", 4, 1.0, 0))
        .unwrap()
        .entity;
    let mut gridset = Gridset::new("alice", "heuchera", 0);
    gridset.shapegrid_id = grid.id;
    let gridset_id = catalog
        .reconcile_gridset(&gridset)
        .unwrap()
        .entity
        .id
        .unwrap();

    let repo = SqliteChainRepository::new(&conn);
    let mut chain = Chain::new("alice", Priority::REQUESTED, 7).with_description("intersect");
    chain.gridset_id = Some(gridset_id);
    let id = repo.insert_chain(&chain).unwrap();

    chain.id = Some(id);
    chain.dlocation = Some(format!("/data/alice/chain_{id}.dag"));
    chain.status = Status::Initialized;
    repo.update_chain(&chain).unwrap();

    let stored = repo.get_chain(id).unwrap().unwrap();
    assert_eq!(stored, chain);
    assert_eq!(stored.metadata.description.as_deref(), Some("intersect"));

    let document = repo.delete_chain(id).unwrap();
    assert_eq!(document, Some(format!("/data/alice/chain_{id}.dag")));
    assert!(repo.list_chains_for_gridset(gridset_id).unwrap().is_empty());
    assert!(matches!(
        repo.delete_chain(id),
        Err(CatalogError::NotFound { .. })
    ));
}

#[test]
fn preset_chain_id_is_kept() {
    let conn = seeded();
    let repo = SqliteChainRepository::new(&conn);
    let id = Uuid::new_v4();
    let mut chain = Chain::new("alice", Priority::NORMAL, 3);
    chain.id = Some(id);
    chain.dlocation = Some(format!("/data/alice/mf_{id}.mf"));

    assert_eq!(repo.insert_chain(&chain).unwrap(), id);
    assert_eq!(
        repo.get_chain(id).unwrap().unwrap().dlocation,
        chain.dlocation
    );
}
