use std::fmt;

use serde::{Deserialize, Serialize};
use stratum_common::{RowKey, TableId};

use crate::mode::Granularity;

/// Something a transaction can lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resource {
    Table(TableId),
    Row(RowKey),
}

impl Resource {
    #[inline]
    pub fn granularity(&self) -> Granularity {
        match self {
            Resource::Table(_) => Granularity::Table,
            Resource::Row(_) => Granularity::Row,
        }
    }

    /// The table this resource belongs to.
    #[inline]
    pub fn table(&self) -> TableId {
        match self {
            Resource::Table(table) => *table,
            Resource::Row(row) => row.table(),
        }
    }
}

impl From<RowKey> for Resource {
    fn from(row: RowKey) -> Self {
        Resource::Row(row)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Table(table) => write!(f, "table({table})"),
            Resource::Row(row) => write!(f, "row({row})"),
        }
    }
}
