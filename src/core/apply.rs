//! Deterministic event application into the row view.
//!
//! Application is idempotent at the row level: re-applying an insert or
//! update converges to the same row state, and deleting an absent row is a
//! no-op. The engine relies on this when replaying buffered events whose
//! changes may already be reflected in the snapshot.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::event::{EventAction, SyncEvent};
use super::row::{RowError, RowId, RowSet};

/// Update merge strategy, selected by collection configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowUpdateMode {
    /// Merge the event's fields into the existing row.
    #[default]
    Partial,
    /// Replace the existing row wholesale with the event's row.
    Full,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub row_id: RowId,
    pub changed: bool,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplyError {
    #[error("event {event_id} carries an unusable row: {source}")]
    BadRow {
        event_id: super::event::EventId,
        source: RowError,
    },
}

/// Apply one event to `view` under the given update strategy.
pub fn apply_event(
    view: &mut RowSet,
    event: &SyncEvent,
    mode: RowUpdateMode,
) -> Result<ApplyOutcome, ApplyError> {
    let row_id = event.row_id().map_err(|source| ApplyError::BadRow {
        event_id: event.id,
        source,
    })?;

    let changed = match event.action {
        EventAction::Insert => upsert(view, &row_id, event),
        EventAction::Update => match mode {
            RowUpdateMode::Full => upsert(view, &row_id, event),
            RowUpdateMode::Partial => merge(view, &row_id, event),
        },
        EventAction::Delete => view.remove(&row_id).is_some(),
    };

    Ok(ApplyOutcome { row_id, changed })
}

fn upsert(view: &mut RowSet, row_id: &RowId, event: &SyncEvent) -> bool {
    let prior = view.insert_at(row_id.clone(), event.data.clone());
    prior.as_ref() != Some(&event.data)
}

fn merge(view: &mut RowSet, row_id: &RowId, event: &SyncEvent) -> bool {
    let Some(existing) = view.get(row_id) else {
        // Nothing to merge into; the event's fields are the whole row.
        view.insert_at(row_id.clone(), event.data.clone());
        return true;
    };

    let mut merged = existing.clone();
    for (key, value) in &event.data {
        merged.insert(key.clone(), value.clone());
    }
    let changed = &merged != existing;
    view.insert_at(row_id.clone(), merged);
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::EventId;
    use serde_json::{Value, json};

    fn event(id: u64, action: EventAction, data: Value) -> SyncEvent {
        SyncEvent {
            id: EventId::from_u64(id).expect("nonzero id"),
            action,
            data: data.as_object().expect("object row").clone(),
            user_id: "u1".to_string(),
        }
    }

    fn view_with(rows: &[Value]) -> RowSet {
        let mut view = RowSet::new();
        for row in rows {
            view.insert(row.as_object().expect("object row").clone())
                .expect("row id");
        }
        view
    }

    #[test]
    fn insert_then_reinsert_converges() {
        let mut view = RowSet::new();
        let ev = event(1, EventAction::Insert, json!({"id": 1, "title": "a"}));

        let first = apply_event(&mut view, &ev, RowUpdateMode::Partial).unwrap();
        let second = apply_event(&mut view, &ev, RowUpdateMode::Partial).unwrap();

        assert!(first.changed);
        assert!(!second.changed);
        assert_eq!(view.rows(), view_with(&[json!({"id": 1, "title": "a"})]).rows());
    }

    #[test]
    fn partial_update_merges_fields() {
        let mut view = view_with(&[json!({"id": 1, "title": "a", "done": false})]);
        let ev = event(2, EventAction::Update, json!({"id": 1, "title": "c"}));

        apply_event(&mut view, &ev, RowUpdateMode::Partial).unwrap();

        assert_eq!(
            view.get(&RowId::Int(1)),
            Some(json!({"id": 1, "title": "c", "done": false}).as_object().unwrap())
        );
    }

    #[test]
    fn full_update_replaces_row() {
        let mut view = view_with(&[json!({"id": 1, "title": "a", "done": false})]);
        let ev = event(2, EventAction::Update, json!({"id": 1, "title": "c"}));

        apply_event(&mut view, &ev, RowUpdateMode::Full).unwrap();

        assert_eq!(
            view.get(&RowId::Int(1)),
            Some(json!({"id": 1, "title": "c"}).as_object().unwrap())
        );
    }

    #[test]
    fn partial_update_of_absent_row_inserts() {
        let mut view = RowSet::new();
        let ev = event(3, EventAction::Update, json!({"id": 4, "title": "n"}));

        let outcome = apply_event(&mut view, &ev, RowUpdateMode::Partial).unwrap();

        assert!(outcome.changed);
        assert!(view.contains(&RowId::Int(4)));
    }

    #[test]
    fn delete_of_absent_row_is_noop() {
        let mut view = view_with(&[json!({"id": 1})]);
        let ev = event(4, EventAction::Delete, json!({"id": 9}));

        let outcome = apply_event(&mut view, &ev, RowUpdateMode::Partial).unwrap();

        assert!(!outcome.changed);
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn bad_row_is_rejected() {
        let mut view = RowSet::new();
        let ev = event(5, EventAction::Insert, json!({"title": "no id"}));

        let err = apply_event(&mut view, &ev, RowUpdateMode::Partial).unwrap_err();
        assert!(matches!(err, ApplyError::BadRow { .. }));
    }
}
