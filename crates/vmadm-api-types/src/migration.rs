// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::record::VmState;

/// The phase a send/receive migration is in.
///
/// Phases only ever move forward; `Done` and `Failed` are terminal.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    JsonSchema,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MigrationState {
    Idle,
    Exporting,
    Transferred,
    Importing,
    Settling,
    Done,
    Failed,
}

impl MigrationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationState::Done | MigrationState::Failed)
    }
}

/// The status of a migration as published to observers.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct MigrationStatus {
    /// The ID of this migration attempt.
    pub id: Uuid,
    /// The VM being migrated.
    pub vm: Uuid,
    /// The current phase the migration is in.
    pub state: MigrationState,
    /// Incremented on every published change.
    pub gen: u64,
}

/// A field whose value differs between the record a migration started from
/// and the record it produced.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldMismatch {
    /// Present before the migration but absent afterwards.
    Missing { field: String },
    /// Absent before the migration but present afterwards.
    Extra { field: String },
    /// Present on both sides with different values.
    Differs { field: String, before: Value, after: Value },
}

impl FieldMismatch {
    pub fn field(&self) -> &str {
        match self {
            FieldMismatch::Missing { field }
            | FieldMismatch::Extra { field }
            | FieldMismatch::Differs { field, .. } => field,
        }
    }
}

/// The outcome of a completed migration.
///
/// Mismatches are warnings: the destination VM exists and is usable even
/// when it is not field-for-field identical to the source.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct MigrationResult {
    pub id: Uuid,
    pub vm: Uuid,
    /// The settled state the destination VM reached.
    pub final_state: VmState,
    /// Every phase the migration passed through, in order.
    pub phases: Vec<MigrationState>,
    pub mismatches: Vec<FieldMismatch>,
}

impl MigrationResult {
    pub fn is_equivalent(&self) -> bool {
        self.mismatches.is_empty()
    }
}
