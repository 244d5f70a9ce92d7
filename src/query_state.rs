use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::FetchError, instant::Instant};

/// Result-oriented status of a query: what the cache knows about its data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    /// Never fetched and no fetch in flight.
    #[default]
    Idle,
    /// First fetch in flight, no data yet.
    Loading,
    /// At least one successful fetch; `data` is present.
    Success,
    /// The most recent fetch failed and no newer success has replaced it.
    Error,
}

/// Activity-oriented status of a query: what its fetcher is doing right now.
/// Orthogonal to [`QueryStatus`]: a query can hold `Success` data while a
/// background refetch is `Fetching`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    /// A fetch is in flight.
    Fetching,
    /// A fetch wants to run but is paused (offline under
    /// [`NetworkMode::Online`](crate::NetworkMode::Online)).
    Paused,
    /// No fetch activity.
    #[default]
    Idle,
}

/// The complete observable state of one query.
///
/// Snapshots of this struct travel through cache events, observer results and
/// dehydrated payloads, so it is plain data: serializable, comparable, and
/// cheap to clone (`data` is shared behind `Rc`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryState {
    /// The last successfully fetched (or manually set) data.
    pub data: Option<Rc<Value>>,
    /// When `data` last changed.
    pub data_updated_at: Option<Instant>,
    /// The terminal error of the most recent failed fetch.
    pub error: Option<FetchError>,
    /// When `error` last changed.
    pub error_updated_at: Option<Instant>,
    /// Failures within the current fetch cycle; reset when a fetch starts.
    pub fetch_failure_count: u32,
    /// The most recent failure within the current fetch cycle, retained
    /// across retries.
    pub fetch_failure_reason: Option<FetchError>,
    /// What the fetcher is doing right now.
    pub fetch_status: FetchStatus,
    /// Marked by `invalidate`; makes the query stale regardless of age.
    pub is_invalidated: bool,
    /// What the cache knows about the data.
    pub status: QueryStatus,
}

impl QueryState {
    /// State for a query seeded with data outside any fetch, e.g. via
    /// `set_query_data` on a key with no cache entry, or hydration.
    pub(crate) fn from_data(data: Rc<Value>, updated_at: Instant) -> Self {
        Self {
            data: Some(data),
            data_updated_at: Some(updated_at),
            status: QueryStatus::Success,
            ..Default::default()
        }
    }
}

/// A transition applied to [`QueryState`] through the single reducer.
#[derive(Clone, Debug)]
pub enum QueryAction {
    /// A fetch cycle began.
    Fetch,
    /// A fetch (or manual write) produced data.
    Success {
        /// The new data, already run through structural sharing.
        data: Rc<Value>,
        /// Timestamp override, used by hydration; `None` means now.
        updated_at: Option<Instant>,
        /// Manual writes do not touch fetch bookkeeping.
        manual: bool,
    },
    /// The fetch cycle ended in an error after exhausting retries.
    Error {
        /// The terminal error.
        error: FetchError,
    },
    /// One attempt inside the fetch cycle failed and a retry follows.
    Failed {
        /// Total failures in this cycle so far.
        failure_count: u32,
        /// The error from this attempt.
        error: FetchError,
    },
    /// The query was marked stale regardless of age.
    Invalidate,
    /// The fetch paused waiting for connectivity.
    Pause,
    /// The paused fetch resumed.
    Continue,
    /// Wholesale state replacement (rollback, hydration).
    SetState {
        /// The replacement state.
        state: QueryState,
    },
}

/// The pure transition function. All query state changes flow through here so
/// that every write produces exactly one cache event carrying the action.
pub(crate) fn reduce(state: &QueryState, action: &QueryAction) -> QueryState {
    match action {
        QueryAction::Fetch => {
            let mut next = QueryState {
                fetch_failure_count: 0,
                fetch_failure_reason: None,
                fetch_status: FetchStatus::Fetching,
                ..state.clone()
            };
            // With no data to show, the new cycle is a first load again,
            // whatever the previous cycle ended as.
            if next.data.is_none() {
                next.status = QueryStatus::Loading;
                next.error = None;
            }
            next
        }
        QueryAction::Success {
            data,
            updated_at,
            manual,
        } => {
            let mut next = QueryState {
                data: Some(data.clone()),
                data_updated_at: Some(updated_at.unwrap_or_else(Instant::now)),
                error: None,
                is_invalidated: false,
                status: QueryStatus::Success,
                ..state.clone()
            };
            if !manual {
                next.fetch_status = FetchStatus::Idle;
                next.fetch_failure_count = 0;
                next.fetch_failure_reason = None;
            }
            next
        }
        QueryAction::Error { error } => QueryState {
            error: Some(error.clone()),
            error_updated_at: Some(Instant::now()),
            fetch_failure_count: state.fetch_failure_count + 1,
            fetch_failure_reason: Some(error.clone()),
            fetch_status: FetchStatus::Idle,
            status: QueryStatus::Error,
            ..state.clone()
        },
        QueryAction::Failed {
            failure_count,
            error,
        } => QueryState {
            fetch_failure_count: *failure_count,
            fetch_failure_reason: Some(error.clone()),
            ..state.clone()
        },
        QueryAction::Invalidate => QueryState {
            is_invalidated: true,
            ..state.clone()
        },
        QueryAction::Pause => QueryState {
            fetch_status: FetchStatus::Paused,
            ..state.clone()
        },
        QueryAction::Continue => QueryState {
            fetch_status: FetchStatus::Fetching,
            ..state.clone()
        },
        QueryAction::SetState { state } => state.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_fetch_moves_idle_to_loading() {
        let state = QueryState::default();
        let next = reduce(&state, &QueryAction::Fetch);
        assert_eq!(next.status, QueryStatus::Loading);
        assert_eq!(next.fetch_status, FetchStatus::Fetching);
    }

    #[test]
    fn background_refetch_keeps_success_status() {
        let state = QueryState::from_data(Rc::new(json!(1)), Instant::from_millis(0));
        let next = reduce(&state, &QueryAction::Fetch);
        assert_eq!(next.status, QueryStatus::Success);
        assert_eq!(next.fetch_status, FetchStatus::Fetching);
        assert_eq!(next.data, state.data);
    }

    #[test]
    fn refetch_after_an_error_returns_to_loading() {
        let mut state = QueryState::default();
        state.status = QueryStatus::Error;
        state.error = Some(FetchError::new("boom"));
        state.error_updated_at = Some(Instant::from_millis(0));
        let next = reduce(&state, &QueryAction::Fetch);
        assert_eq!(next.status, QueryStatus::Loading);
        assert!(next.error.is_none());
    }

    #[test]
    fn fetch_resets_failure_bookkeeping() {
        let mut state = QueryState::default();
        state.fetch_failure_count = 2;
        state.fetch_failure_reason = Some(FetchError::new("old"));
        let next = reduce(&state, &QueryAction::Fetch);
        assert_eq!(next.fetch_failure_count, 0);
        assert!(next.fetch_failure_reason.is_none());
    }

    #[test]
    fn success_clears_error_and_invalidation() {
        let mut state = QueryState::default();
        state.error = Some(FetchError::new("boom"));
        state.is_invalidated = true;
        state.status = QueryStatus::Error;
        let next = reduce(
            &state,
            &QueryAction::Success {
                data: Rc::new(json!("fresh")),
                updated_at: None,
                manual: false,
            },
        );
        assert_eq!(next.status, QueryStatus::Success);
        assert!(next.error.is_none());
        assert!(!next.is_invalidated);
        assert_eq!(next.fetch_status, FetchStatus::Idle);
    }

    #[test]
    fn manual_success_leaves_fetch_status_alone() {
        let mut state = QueryState::default();
        state.fetch_status = FetchStatus::Fetching;
        let next = reduce(
            &state,
            &QueryAction::Success {
                data: Rc::new(json!(1)),
                updated_at: None,
                manual: true,
            },
        );
        assert_eq!(next.fetch_status, FetchStatus::Fetching);
    }

    #[test]
    fn error_keeps_existing_data() {
        let state = QueryState::from_data(Rc::new(json!("kept")), Instant::from_millis(0));
        let next = reduce(
            &state,
            &QueryAction::Error {
                error: FetchError::new("boom"),
            },
        );
        assert_eq!(next.status, QueryStatus::Error);
        assert_eq!(next.data, state.data);
        assert_eq!(next.fetch_failure_count, 1);
    }

    #[test]
    fn failed_records_the_attempt_without_ending_the_cycle() {
        let mut state = QueryState::default();
        state.fetch_status = FetchStatus::Fetching;
        let next = reduce(
            &state,
            &QueryAction::Failed {
                failure_count: 2,
                error: FetchError::new("try again"),
            },
        );
        assert_eq!(next.fetch_failure_count, 2);
        assert_eq!(next.fetch_status, FetchStatus::Fetching);
        assert_eq!(next.status, QueryStatus::Idle);
    }

    #[test]
    fn pause_and_continue_toggle_fetch_status() {
        let mut state = QueryState::default();
        state.fetch_status = FetchStatus::Fetching;
        let paused = reduce(&state, &QueryAction::Pause);
        assert_eq!(paused.fetch_status, FetchStatus::Paused);
        let resumed = reduce(&paused, &QueryAction::Continue);
        assert_eq!(resumed.fetch_status, FetchStatus::Fetching);
    }
}
