//! Point-in-time device -> branch mapping.
//!
//! Absence is data, not an error: a unit with no branch resolves to
//! [`BranchAssignment::Unassigned`], a device with no unit record to
//! [`BranchAssignment::Unknown`].

use std::collections::HashMap;

use rusqlite::Connection;

use crate::error::LedgerError;
use crate::model::{BranchAssignment, Unit};

#[derive(Debug, Clone, Default)]
pub struct DeviceBranchMap {
    assignments: HashMap<String, BranchAssignment>,
}

impl DeviceBranchMap {
    pub fn from_units<'a>(units: impl IntoIterator<Item = &'a Unit>) -> Self {
        let assignments = units
            .into_iter()
            .map(|unit| {
                let assignment = match unit.branch_id.as_deref().map(str::trim) {
                    Some(id) if !id.is_empty() => BranchAssignment::Resolved(id.to_string()),
                    _ => BranchAssignment::Unassigned,
                };
                (unit.device_id.clone(), assignment)
            })
            .collect();
        Self { assignments }
    }

    pub fn resolve(&self, device_id: &str) -> BranchAssignment {
        self.assignments
            .get(device_id)
            .cloned()
            .unwrap_or(BranchAssignment::Unknown)
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

/// Snapshot of the `units` collection.
pub fn load_units(conn: &Connection) -> Result<Vec<Unit>, LedgerError> {
    let mut stmt = conn.prepare("SELECT device_id, branch_id FROM units")?;
    let units = stmt
        .query_map([], |row| {
            Ok(Unit {
                device_id: row.get(0)?,
                branch_id: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(units)
}

pub fn build_device_branch_map(conn: &Connection) -> Result<DeviceBranchMap, LedgerError> {
    let units = load_units(conn)?;
    Ok(DeviceBranchMap::from_units(&units))
}

/// Resolve a single device without building the whole map.
pub fn resolve_device(conn: &Connection, device_id: &str) -> Result<BranchAssignment, LedgerError> {
    let mut stmt = conn.prepare("SELECT branch_id FROM units WHERE device_id = ?1")?;
    let mut rows = stmt.query([device_id])?;
    let Some(row) = rows.next()? else {
        return Ok(BranchAssignment::Unknown);
    };
    let unit = Unit {
        device_id: device_id.to_string(),
        branch_id: row.get(0)?,
    };
    Ok(DeviceBranchMap::from_units([&unit]).resolve(device_id))
}
