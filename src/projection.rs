// Sorted view over published connection lists
//
// Columns map to an explicit `SortField`; sorting is stable so rows with equal
// keys keep the order the snapshot produced them in.

use crate::config::Config;
use crate::connection::EnrichedConnection;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Sortable columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
pub enum SortField {
    /// Process name, with the hosted service when there is one
    Name,
    Pid,
    Path,
    LocalAddress,
    LocalPort,
    RemoteAddress,
    RemotePort,
    State,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn reversed(self) -> Self {
        match self {
            SortDirection::Ascending => SortDirection::Descending,
            SortDirection::Descending => SortDirection::Ascending,
        }
    }
}

/// Active sort column and direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortState {
    pub field: SortField,
    pub direction: SortDirection,
}

/// Compare two rows on one field, ascending
pub fn compare(a: &EnrichedConnection, b: &EnrichedConnection, field: SortField) -> Ordering {
    match field {
        SortField::Name => a
            .display_name()
            .to_lowercase()
            .cmp(&b.display_name().to_lowercase()),
        SortField::Pid => a.pid().cmp(&b.pid()),
        SortField::Path => a
            .process_path()
            .to_lowercase()
            .cmp(&b.process_path().to_lowercase()),
        SortField::LocalAddress => a.local_address().cmp(&b.local_address()),
        SortField::LocalPort => a.local_port().cmp(&b.local_port()),
        SortField::RemoteAddress => a.remote_address().cmp(&b.remote_address()),
        SortField::RemotePort => a.remote_port().cmp(&b.remote_port()),
        // By the label shown in the column
        SortField::State => a.state().as_str().cmp(b.state().as_str()),
    }
}

/// Stable in-place sort by one field
pub fn sort_connections(rows: &mut [EnrichedConnection], field: SortField, direction: SortDirection) {
    match direction {
        SortDirection::Ascending => rows.sort_by(|a, b| compare(a, b, field)),
        SortDirection::Descending => rows.sort_by(|a, b| compare(b, a, field)),
    }
}

/// Remembers the active sort and reapplies it to every new list
#[derive(Debug, Clone, Default)]
pub struct SortableProjection {
    active: Option<SortState>,
}

impl SortableProjection {
    pub fn new(active: Option<SortState>) -> Self {
        Self { active }
    }

    /// Restore the last sort saved in the settings file
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.sort)
    }

    /// Write the active sort back to the settings
    pub fn store(&self, config: &mut Config) {
        config.sort = self.active;
    }

    pub fn active(&self) -> Option<SortState> {
        self.active
    }

    pub fn sort_by(&mut self, field: SortField, direction: SortDirection) {
        self.active = Some(SortState { field, direction });
    }

    /// Column-header click: flip direction on the active field, otherwise
    /// switch to the new field ascending
    pub fn toggle(&mut self, field: SortField) -> SortState {
        let next = match self.active {
            Some(state) if state.field == field => SortState {
                field,
                direction: state.direction.reversed(),
            },
            _ => SortState {
                field,
                direction: SortDirection::Ascending,
            },
        };
        self.active = Some(next);
        next
    }

    /// Copy of `rows` in display order
    pub fn apply(&self, rows: &[EnrichedConnection]) -> Vec<EnrichedConnection> {
        let mut sorted = rows.to_vec();
        if let Some(state) = self.active {
            sort_connections(&mut sorted, state.field, state.direction);
        }
        sorted
    }
}
