//! Handle and table identifiers and their numeric script encoding.
//!
//! Script engines see handles as plain numbers (doubles in V8/JSC). An id
//! crosses the boundary only if it converts back to the exact same integer,
//! so every decode checks sign, fraction and the configured ceiling.

use crate::error::{HandleError, HandleResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest handle id a table hands out by default (2^31 - 1).
///
/// Fits a signed 32-bit integer, so engines that fast-path small integers
/// never see a handle leave that representation.
pub const MAX_SAFE_HANDLE_ID: u32 = i32::MAX as u32;

/// Largest integer a double represents exactly (2^53 - 1).
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Id of a resource inside one handle table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(u32);

impl HandleId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// Script-side representation
    pub fn to_f64(self) -> f64 {
        f64::from(self.0)
    }

    /// Decode a script number, rejecting anything above `ceiling`.
    pub fn from_f64(value: f64, ceiling: u32) -> HandleResult<Self> {
        if !is_exact_index(value) || value > f64::from(ceiling) {
            return Err(HandleError::InvalidEncoding(value));
        }
        Ok(Self(value as u32))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id of a handle table inside a [`crate::HandleRuntime`]
///
/// Table ids are never reused, so a stale id resolves to nothing instead of
/// some unrelated newer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(u64);

impl TableId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64
    }

    pub fn from_f64(value: f64) -> HandleResult<Self> {
        if !is_exact_index(value) || value > MAX_SAFE_INTEGER as f64 {
            return Err(HandleError::InvalidEncoding(value));
        }
        Ok(Self(value as u64))
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fully qualified handle: owning table plus id inside it.
///
/// This is what generated glue stores on the script side and hands back on
/// every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleRef {
    pub table: TableId,
    pub id: HandleId,
}

impl HandleRef {
    pub const fn new(table: TableId, id: HandleId) -> Self {
        Self { table, id }
    }

    /// Encode as `(table, id)` script numbers
    pub fn encode(self) -> (f64, f64) {
        (self.table.to_f64(), self.id.to_f64())
    }

    /// Decode `(table, id)` script numbers
    pub fn decode(table: f64, id: f64, ceiling: u32) -> HandleResult<Self> {
        Ok(Self {
            table: TableId::from_f64(table)?,
            id: HandleId::from_f64(id, ceiling)?,
        })
    }
}

impl fmt::Display for HandleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.id)
    }
}

fn is_exact_index(value: f64) -> bool {
    value.is_finite() && value >= 0.0 && value.fract() == 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_is_exact_as_double() {
        let id = HandleId::new(MAX_SAFE_HANDLE_ID);
        let decoded = HandleId::from_f64(id.to_f64(), MAX_SAFE_HANDLE_ID).unwrap();
        assert_eq!(decoded, id);
    }

    #[test]
    fn test_decode_rejects_inexact_numbers() {
        for bad in [-1.0, 1.5, f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                HandleId::from_f64(bad, MAX_SAFE_HANDLE_ID),
                Err(HandleError::InvalidEncoding(_))
            ));
        }
    }

    #[test]
    fn test_decode_rejects_above_ceiling() {
        assert!(HandleId::from_f64(10.0, 10).is_ok());
        assert!(HandleId::from_f64(11.0, 10).is_err());
    }

    #[test]
    fn test_table_id_limit() {
        assert!(TableId::from_f64(MAX_SAFE_INTEGER as f64).is_ok());
        assert!(TableId::from_f64(2f64.powi(60)).is_err());
    }

    #[test]
    fn test_handle_ref_decode() {
        let r = HandleRef::decode(4.0, 12.0, 100).unwrap();
        assert_eq!(r, HandleRef::new(TableId::new(4), HandleId::new(12)));
        assert_eq!(r.to_string(), "4:12");
        assert!(HandleRef::decode(4.0, 101.0, 100).is_err());
    }
}
