// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeSet;

use serde_json::{Map, Value};
use vmadm_api_types::{FieldMismatch, VmRecord};

use crate::bundle::exportable;
use crate::error::Error;

/// Compares two records field by field, ignoring volatile fields.
pub fn compare(
    before: &VmRecord,
    after: &VmRecord,
) -> Result<Vec<FieldMismatch>, Error> {
    Ok(diff(&exportable(before)?, &exportable(after)?))
}

/// Lists the top-level keys on which `before` and `after` disagree, in key
/// order.
pub fn diff(
    before: &Map<String, Value>,
    after: &Map<String, Value>,
) -> Vec<FieldMismatch> {
    let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    keys.into_iter()
        .filter_map(|key| {
            let field = key.clone();
            match (before.get(key), after.get(key)) {
                (Some(_), None) => Some(FieldMismatch::Missing { field }),
                (None, Some(_)) => Some(FieldMismatch::Extra { field }),
                (Some(b), Some(a)) if a != b => Some(FieldMismatch::Differs {
                    field,
                    before: b.clone(),
                    after: a.clone(),
                }),
                _ => None,
            }
        })
        .collect()
}
