use std::{rc::Rc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    error::PersistError,
    instant::Instant,
    key::QueryKey,
    mutation::{Mutation, MutationState, MutationStatus},
    notify_manager::notify_manager,
    query::Query,
    query_client::QueryClient,
    query_options::{MutationOptions, QueryOptions},
    query_state::{QueryState, QueryStatus},
};

/// A query snapshot suitable for serialization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DehydratedQuery {
    /// The entry's key.
    pub query_key: QueryKey,
    /// The entry's hash, so hydration does not recompute it.
    pub query_hash: String,
    /// The entry's state at dehydration time.
    pub state: QueryState,
}

/// A mutation snapshot suitable for serialization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DehydratedMutation {
    /// The mutation's key, if it had one.
    pub mutation_key: Option<QueryKey>,
    /// The mutation's state at dehydration time.
    pub state: MutationState,
}

/// A serializable snapshot of a client's caches.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DehydratedState {
    /// Mutations first, mirroring resume-before-refetch on restore.
    pub mutations: Vec<DehydratedMutation>,
    /// Dehydrated queries.
    pub queries: Vec<DehydratedQuery>,
}

/// Which entries a [`dehydrate`] call includes.
#[derive(Clone, Default)]
pub struct DehydrateOptions {
    /// Include a query; defaults to successful queries only.
    pub should_dehydrate_query: Option<Rc<dyn Fn(&Query) -> bool>>,
    /// Include a mutation; defaults to paused mutations only.
    pub should_dehydrate_mutation: Option<Rc<dyn Fn(&Mutation) -> bool>>,
}

fn default_should_dehydrate_query(query: &Query) -> bool {
    query.state().status == QueryStatus::Success
}

fn default_should_dehydrate_mutation(mutation: &Mutation) -> bool {
    mutation.state().is_paused
}

/// Snapshot the client's caches for serialization.
pub fn dehydrate(client: &QueryClient, options: DehydrateOptions) -> DehydratedState {
    let include_query = options
        .should_dehydrate_query
        .unwrap_or_else(|| Rc::new(default_should_dehydrate_query));
    let include_mutation = options
        .should_dehydrate_mutation
        .unwrap_or_else(|| Rc::new(default_should_dehydrate_mutation));

    let queries = client
        .query_cache()
        .get_all()
        .into_iter()
        .filter(|query| include_query(query))
        .map(|query| DehydratedQuery {
            query_key: query.query_key().clone(),
            query_hash: query.query_hash().to_string(),
            state: query.state(),
        })
        .collect();
    let mutations = client
        .mutation_cache()
        .get_all()
        .into_iter()
        .filter(|mutation| include_mutation(mutation))
        .map(|mutation| DehydratedMutation {
            mutation_key: mutation.mutation_key(),
            state: mutation.state(),
        })
        .collect();
    DehydratedState { mutations, queries }
}

/// Load a snapshot into the client's caches.
///
/// A query that already exists with data at least as new as the snapshot is
/// left alone. Hydrated mutations arrive paused; call
/// [`QueryClient::resume_paused_mutations`] to run them (they need their
/// `mutation_fn` registered via
/// [`set_mutation_defaults`](QueryClient::set_mutation_defaults)).
pub fn hydrate(client: &QueryClient, state: DehydratedState) {
    notify_manager().batch(|| {
        for dehydrated in state.mutations {
            let options = client.default_mutation_options(match dehydrated.mutation_key {
                Some(key) => MutationOptions::new().set_mutation_key(key),
                None => MutationOptions::new(),
            });
            client.mutation_cache().build(options, Some(dehydrated.state));
        }
        for dehydrated in state.queries {
            let existing = client.query_cache().get(&dehydrated.query_hash);
            match existing {
                Some(query) => {
                    let current = query.state().data_updated_at;
                    let incoming = dehydrated.state.data_updated_at;
                    if incoming > current {
                        query.set_state(dehydrated.state);
                    }
                }
                None => {
                    let mut options = client.default_query_options(
                        QueryOptions::new().set_query_key(dehydrated.query_key),
                    );
                    options.query_hash = Some(dehydrated.query_hash);
                    client.query_cache().build(options, Some(dehydrated.state));
                }
            }
        }
    });
}

/// A snapshot wrapped with the metadata needed to judge it on restore.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedClient {
    /// Cache-version marker; a mismatch discards the snapshot.
    pub buster: String,
    /// When the snapshot was taken.
    pub timestamp: Instant,
    /// The snapshot itself.
    pub client_state: DehydratedState,
}

/// A storage backend for [`PersistedClient`] snapshots.
#[async_trait(?Send)]
pub trait Persister {
    /// Write a snapshot, replacing any previous one.
    async fn persist_client(&self, client: &PersistedClient) -> Result<(), PersistError>;
    /// Read back the stored snapshot, if one exists.
    async fn restore_client(&self) -> Result<Option<PersistedClient>, PersistError>;
    /// Delete the stored snapshot.
    async fn remove_client(&self) -> Result<(), PersistError>;
}

/// Knobs for [`persist_client_save`] and [`persist_client_restore`].
#[derive(Clone, Debug)]
pub struct PersistOptions {
    /// Stamped into snapshots and checked on restore.
    pub buster: String,
    /// Snapshots older than this are discarded on restore.
    pub max_age: Duration,
}

impl Default for PersistOptions {
    fn default() -> Self {
        Self {
            buster: String::new(),
            max_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Dehydrate the client and hand the snapshot to the persister.
pub async fn persist_client_save(
    client: &QueryClient,
    persister: &dyn Persister,
    options: &PersistOptions,
) -> Result<(), PersistError> {
    let persisted = PersistedClient {
        buster: options.buster.clone(),
        timestamp: Instant::now(),
        client_state: dehydrate(client, DehydrateOptions::default()),
    };
    persister.persist_client(&persisted).await
}

/// Restore a persisted snapshot into the client.
///
/// An expired or version-mismatched snapshot is removed from storage instead
/// of being hydrated.
pub async fn persist_client_restore(
    client: &QueryClient,
    persister: &dyn Persister,
    options: &PersistOptions,
) -> Result<(), PersistError> {
    let Some(persisted) = persister.restore_client().await? else {
        return Ok(());
    };
    let age = Instant::now() - persisted.timestamp;
    if persisted.buster != options.buster || age > options.max_age {
        tracing::debug!(
            buster = %persisted.buster,
            age_ms = age.as_millis() as u64,
            "discarding persisted cache snapshot"
        );
        return persister.remove_client().await;
    }
    hydrate(client, persisted.client_state);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{query_key, QueryFilters};
    use serde_json::json;
    use std::cell::RefCell;

    #[derive(Default)]
    struct MemoryPersister {
        stored: RefCell<Option<PersistedClient>>,
    }

    #[async_trait(?Send)]
    impl Persister for MemoryPersister {
        async fn persist_client(&self, client: &PersistedClient) -> Result<(), PersistError> {
            *self.stored.borrow_mut() = Some(client.clone());
            Ok(())
        }

        async fn restore_client(&self) -> Result<Option<PersistedClient>, PersistError> {
            Ok(self.stored.borrow().clone())
        }

        async fn remove_client(&self) -> Result<(), PersistError> {
            *self.stored.borrow_mut() = None;
            Ok(())
        }
    }

    #[test]
    fn dehydrate_keeps_only_successful_queries_by_default() {
        let client = QueryClient::new();
        client.set_query_data(query_key!["kept"], json!(1));
        client
            .query_cache()
            .build(QueryOptions::new().set_query_key(query_key!["empty"]), None);
        let state = dehydrate(&client, DehydrateOptions::default());
        assert_eq!(state.queries.len(), 1);
        assert_eq!(state.queries[0].query_key, query_key!["kept"]);
        assert!(state.mutations.is_empty());
    }

    #[test]
    fn hydrate_restores_data_into_a_fresh_client() {
        let source = QueryClient::new();
        source.set_query_data(query_key!["todos"], json!([1, 2, 3]));
        let snapshot = dehydrate(&source, DehydrateOptions::default());

        let serialized = serde_json::to_string(&snapshot).expect("serialize");
        let restored: DehydratedState = serde_json::from_str(&serialized).expect("deserialize");

        let target = QueryClient::new();
        hydrate(&target, restored);
        assert_eq!(
            target.get_query_data(&query_key!["todos"]),
            Some(Rc::new(json!([1, 2, 3])))
        );
        let state = target
            .get_query_state(&query_key!["todos"])
            .expect("hydrated entry");
        assert_eq!(state.status, QueryStatus::Success);
    }

    #[test]
    fn hydrate_does_not_clobber_newer_local_data() {
        let source = QueryClient::new();
        source.set_query_data(query_key!["todos"], json!("old"));
        let mut snapshot = dehydrate(&source, DehydrateOptions::default());
        snapshot.queries[0].state.data_updated_at = Some(Instant::from_millis(1));

        let target = QueryClient::new();
        target.set_query_data(query_key!["todos"], json!("newer"));
        hydrate(&target, snapshot);
        assert_eq!(
            target.get_query_data(&query_key!["todos"]),
            Some(Rc::new(json!("newer")))
        );
    }

    #[test]
    fn dehydrate_includes_paused_mutations() {
        let client = QueryClient::new();
        let mutation = client.mutation_cache().build(
            MutationOptions::new().set_mutation_key(query_key!["add-todo"]),
            Some(MutationState {
                is_paused: true,
                status: MutationStatus::Pending,
                variables: Some(Rc::new(json!({ "title": "offline" }))),
                ..Default::default()
            }),
        );
        assert!(mutation.state().is_paused);
        let state = dehydrate(&client, DehydrateOptions::default());
        assert_eq!(state.mutations.len(), 1);

        let target = QueryClient::new();
        hydrate(&target, state);
        let restored = target
            .mutation_cache()
            .find(query_key!["add-todo"].into())
            .expect("hydrated mutation");
        assert!(restored.state().is_paused);
        assert_eq!(
            restored.state().variables,
            Some(Rc::new(json!({ "title": "offline" })))
        );
    }

    #[test]
    fn restore_discards_an_expired_snapshot() {
        crate::util::test::run_local(async {
            let source = QueryClient::new();
            source.set_query_data(query_key!["todos"], json!(1));
            let persister = MemoryPersister::default();
            let options = PersistOptions::default();
            persist_client_save(&source, &persister, &options)
                .await
                .expect("save");

            // Age the stored snapshot past max_age.
            if let Some(stored) = persister.stored.borrow_mut().as_mut() {
                stored.timestamp = Instant::from_millis(0);
            }

            let target = QueryClient::new();
            persist_client_restore(&target, &persister, &options)
                .await
                .expect("restore");
            assert!(target.get_query_data(&query_key!["todos"]).is_none());
            assert!(persister.stored.borrow().is_none());
        });
    }

    #[test]
    fn restore_discards_a_buster_mismatch() {
        crate::util::test::run_local(async {
            let source = QueryClient::new();
            source.set_query_data(query_key!["todos"], json!(1));
            let persister = MemoryPersister::default();
            persist_client_save(
                &source,
                &persister,
                &PersistOptions {
                    buster: "v1".into(),
                    ..Default::default()
                },
            )
            .await
            .expect("save");

            let target = QueryClient::new();
            persist_client_restore(
                &target,
                &persister,
                &PersistOptions {
                    buster: "v2".into(),
                    ..Default::default()
                },
            )
            .await
            .expect("restore");
            assert!(target.get_query_data(&query_key!["todos"]).is_none());
        });
    }

    #[test]
    fn save_and_restore_round_trip() {
        crate::util::test::run_local(async {
            let source = QueryClient::new();
            source.set_query_data(query_key!["todos"], json!([1]));
            let persister = MemoryPersister::default();
            let options = PersistOptions::default();
            persist_client_save(&source, &persister, &options)
                .await
                .expect("save");

            let target = QueryClient::new();
            persist_client_restore(&target, &persister, &options)
                .await
                .expect("restore");
            assert_eq!(
                target.get_query_data(&query_key!["todos"]),
                Some(Rc::new(json!([1])))
            );
            assert_eq!(
                target.query_cache().find_all(QueryFilters::default()).len(),
                1
            );
        });
    }
}
