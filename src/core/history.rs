//! History log of a state marked `history`.
//!
//! The log interleaves state markers (which substate became current) with
//! delta records (mutations that happened while a marker was current). A
//! cursor points at the marker the owner is currently "at"; traversal is
//! planned here as a pure function and carried out by the runtime.

use crate::core::delta::Mutation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Record of one activation within the history state.
///
/// # Example
///
/// ```rust
/// use protostate::core::StateMarker;
/// use chrono::Utc;
///
/// let marker = StateMarker {
///     path: "Editing.Draft".to_string(),
///     timestamp: Utc::now(),
/// };
/// let json = serde_json::to_string(&marker).unwrap();
/// assert!(json.contains("Editing.Draft"));
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateMarker {
    /// Path of the newly current state, relative to the history state.
    /// Empty when the history state itself became current.
    pub path: String,
    /// When the state became current
    pub timestamp: DateTime<Utc>,
}

/// Record of a mutation made while a marker was current.
#[derive(Clone, Debug)]
pub struct DeltaRecord {
    /// Path of the mutated state, relative to the history state.
    pub path: Vec<String>,
    pub forward: Mutation,
    pub reverse: Mutation,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub enum HistoryEntry {
    State(StateMarker),
    Delta(DeltaRecord),
}

/// One action of a traversal, by entry index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayStep {
    /// Undo the delta at this index.
    Reverse(usize),
    /// Redo the delta at this index.
    Apply(usize),
    /// Change to the marker at this index.
    Visit(usize),
}

/// Result of planning a traversal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplayPlan {
    pub steps: Vec<ReplayStep>,
    /// Cursor after the traversal.
    pub cursor: Option<usize>,
    /// Markers actually moved, negative for backward.
    pub moved: isize,
}

/// Ordered log of markers and deltas with a cursor.
#[derive(Clone, Debug, Default)]
pub struct StateHistory {
    entries: Vec<HistoryEntry>,
    cursor: Option<usize>,
}

impl StateHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn entry(&self, index: usize) -> Option<&HistoryEntry> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the current marker.
    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub(crate) fn set_cursor(&mut self, cursor: Option<usize>) {
        self.cursor = cursor;
    }

    fn marker_indices(&self) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, HistoryEntry::State(_)))
            .map(|(i, _)| i)
            .collect()
    }

    /// End of the present: the first marker after the cursor.
    fn present_end(&self) -> usize {
        let start = self.cursor.map(|c| c + 1).unwrap_or(0);
        self.entries[start.min(self.entries.len())..]
            .iter()
            .position(|e| matches!(e, HistoryEntry::State(_)))
            .map(|offset| start + offset)
            .unwrap_or(self.entries.len())
    }

    /// Record a newly current state, discarding any entries that lay in the
    /// future of the cursor. Returns false if the marker repeats the current
    /// one with nothing recorded in between.
    pub fn record_state(&mut self, marker: StateMarker) -> bool {
        self.entries.truncate(self.present_end());
        if let (Some(cursor), Some(HistoryEntry::State(last))) = (self.cursor, self.entries.last()) {
            if cursor + 1 == self.entries.len() && last.path == marker.path {
                return false;
            }
        }
        self.entries.push(HistoryEntry::State(marker));
        self.cursor = Some(self.entries.len() - 1);
        true
    }

    /// Record a mutation under the current marker.
    pub fn record_delta(&mut self, delta: DeltaRecord) {
        self.entries.truncate(self.present_end());
        self.entries.push(HistoryEntry::Delta(delta));
    }

    fn trailing_deltas(&self, marker: usize) -> Vec<usize> {
        let mut indices = Vec::new();
        for (i, entry) in self.entries.iter().enumerate().skip(marker + 1) {
            match entry {
                HistoryEntry::Delta(_) => indices.push(i),
                HistoryEntry::State(_) => break,
            }
        }
        indices
    }

    /// Plan a traversal of `steps` markers (negative goes back). The plan
    /// stops early at either end of the log.
    pub fn plan(&self, steps: isize) -> ReplayPlan {
        let markers = self.marker_indices();
        let Some(mut position) = self
            .cursor
            .and_then(|c| markers.iter().position(|&m| m == c))
        else {
            return ReplayPlan {
                steps: Vec::new(),
                cursor: self.cursor,
                moved: 0,
            };
        };

        let mut plan = Vec::new();
        let mut moved = 0isize;

        if steps < 0 {
            while moved > steps && position > 0 {
                for index in self.trailing_deltas(markers[position]).into_iter().rev() {
                    plan.push(ReplayStep::Reverse(index));
                }
                position -= 1;
                plan.push(ReplayStep::Visit(markers[position]));
                moved -= 1;
            }
        } else {
            while moved < steps && position + 1 < markers.len() {
                position += 1;
                plan.push(ReplayStep::Visit(markers[position]));
                for index in self.trailing_deltas(markers[position]) {
                    plan.push(ReplayStep::Apply(index));
                }
                moved += 1;
            }
        }

        ReplayPlan {
            steps: plan,
            cursor: Some(markers[position]),
            moved,
        }
    }

    /// All recorded markers in order.
    pub fn markers(&self) -> Vec<&StateMarker> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                HistoryEntry::State(marker) => Some(marker),
                HistoryEntry::Delta(_) => None,
            })
            .collect()
    }

    /// Paths of the recorded markers in order.
    pub fn get_path(&self) -> Vec<&str> {
        self.markers().into_iter().map(|m| m.path.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(path: &str) -> StateMarker {
        StateMarker {
            path: path.to_string(),
            timestamp: Utc::now(),
        }
    }

    fn delta() -> DeltaRecord {
        DeltaRecord {
            path: Vec::new(),
            forward: Mutation::new(),
            reverse: Mutation::new(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn new_history_is_empty() {
        let history = StateHistory::new();
        assert!(history.is_empty());
        assert!(history.get_path().is_empty());
        assert_eq!(history.cursor(), None);
    }

    #[test]
    fn record_state_moves_cursor() {
        let mut history = StateHistory::new();
        assert!(history.record_state(marker("A")));
        assert!(history.record_state(marker("B")));
        assert_eq!(history.cursor(), Some(1));
        assert_eq!(history.get_path(), vec!["A", "B"]);
    }

    #[test]
    fn repeated_marker_is_skipped() {
        let mut history = StateHistory::new();
        history.record_state(marker("A"));
        assert!(!history.record_state(marker("A")));
        history.record_delta(delta());
        assert!(history.record_state(marker("A")));
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn backward_plan_reverses_trailing_deltas_first() {
        let mut history = StateHistory::new();
        history.record_state(marker("A")); // 0
        history.record_delta(delta()); // 1
        history.record_state(marker("B")); // 2
        history.record_delta(delta()); // 3
        history.record_delta(delta()); // 4

        let plan = history.plan(-1);
        assert_eq!(
            plan.steps,
            vec![
                ReplayStep::Reverse(4),
                ReplayStep::Reverse(3),
                ReplayStep::Visit(0)
            ]
        );
        assert_eq!(plan.cursor, Some(0));
        assert_eq!(plan.moved, -1);
    }

    #[test]
    fn forward_plan_visits_then_applies() {
        let mut history = StateHistory::new();
        history.record_state(marker("A"));
        history.record_delta(delta());
        history.record_state(marker("B"));
        history.record_delta(delta());
        history.set_cursor(Some(0));

        let plan = history.plan(5);
        assert_eq!(plan.steps, vec![ReplayStep::Visit(2), ReplayStep::Apply(3)]);
        assert_eq!(plan.moved, 1);
        assert_eq!(plan.cursor, Some(2));
    }

    #[test]
    fn recording_after_rewind_truncates_future() {
        let mut history = StateHistory::new();
        history.record_state(marker("A"));
        history.record_delta(delta());
        history.record_state(marker("B"));
        history.set_cursor(Some(0));

        history.record_state(marker("C"));
        assert_eq!(history.get_path(), vec!["A", "C"]);
        // the delta trailing A belongs to the present and survives
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn plan_without_markers_is_empty() {
        let mut history = StateHistory::new();
        history.record_delta(delta());
        let plan = history.plan(-3);
        assert!(plan.steps.is_empty());
        assert_eq!(plan.moved, 0);
    }

    #[test]
    fn markers_serialize_correctly() {
        let mut history = StateHistory::new();
        history.record_state(marker("A.B"));

        let json = serde_json::to_string(&history.markers()).unwrap();
        let deserialized: Vec<StateMarker> = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.len(), 1);
        assert_eq!(deserialized[0].path, "A.B");
    }
}
