//! Seams to the collaborators that own the data: the data source that
//! resolves names to points, the points themselves, and access control.
//!
//! The server never interprets values.  A point converts between its native
//! type and the requested transfer type and hands back bytes in network
//! order; the server only sizes, pads and frames them.

use std::sync::Arc;

use pv_core::protocol::status;
use pv_core::AccessRights;
use thiserror::Error;

/// Transfer type codes.
pub mod dbr {
    use pv_core::protocol::MAX_STRING_SIZE;

    pub const STRING: u16 = 0;
    pub const SHORT: u16 = 1;
    pub const FLOAT: u16 = 2;
    pub const ENUM: u16 = 3;
    pub const CHAR: u16 = 4;
    pub const LONG: u16 = 5;
    pub const DOUBLE: u16 = 6;

    /// Highest type code the server accepts.
    pub const LAST: u16 = DOUBLE;

    pub fn is_valid(data_type: u16) -> bool {
        data_type <= LAST
    }

    /// Bytes per element, `None` for an unknown type.
    pub fn element_size(data_type: u16) -> Option<usize> {
        match data_type {
            STRING => Some(MAX_STRING_SIZE),
            SHORT | ENUM => Some(2),
            CHAR => Some(1),
            FLOAT | LONG => Some(4),
            DOUBLE => Some(8),
            _ => None,
        }
    }

    /// Unpadded payload bytes for `count` elements; `None` for an unknown
    /// type or a size that overflows `usize`.
    pub fn payload_size(data_type: u16, count: u32) -> Option<usize> {
        element_size(data_type).and_then(|size| size.checked_mul(count as usize))
    }

    pub fn name(data_type: u16) -> &'static str {
        match data_type {
            STRING => "STRING",
            SHORT => "SHORT",
            FLOAT => "FLOAT",
            ENUM => "ENUM",
            CHAR => "CHAR",
            LONG => "LONG",
            DOUBLE => "DOUBLE",
            _ => "INVALID",
        }
    }
}

/// Errors a data point reports back to the server.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataSourceError {
    #[error("unsupported transfer type {0}")]
    BadType(u16),

    #[error("bad element count {requested} (point holds {available})")]
    BadCount { requested: u32, available: u32 },

    #[error("point '{0}' is read-only")]
    ReadOnly(String),

    #[error("value conversion failed: {0}")]
    Conversion(String),

    #[error("point is no longer attached")]
    Detached,

    #[error("put cancelled")]
    Cancelled,
}

impl DataSourceError {
    /// Status code reported to a client for a failed get.
    pub fn get_status(&self) -> u32 {
        match self {
            DataSourceError::BadType(_) => status::BADTYPE,
            DataSourceError::BadCount { .. } => status::BADCOUNT,
            _ => status::GETFAIL,
        }
    }

    /// Status code reported to a client for a failed put.
    pub fn put_status(&self) -> u32 {
        match self {
            DataSourceError::BadType(_) => status::BADTYPE,
            DataSourceError::BadCount { .. } => status::BADCOUNT,
            DataSourceError::ReadOnly(_) => status::NOWTACCESS,
            _ => status::PUTFAIL,
        }
    }
}

/// Handle of one subscription on a point.
pub type SubscriptionId = u64;

/// Completion of an asynchronous put, called exactly once.
pub type PutCompletion = Box<dyn FnOnce(Result<(), DataSourceError>) + Send>;

/// Receives change notifications.  Called on the data source's own thread;
/// implementations must not block.
pub trait ChangeListener: Send + Sync {
    fn on_data_changed(&self);
}

/// One named data point.
pub trait DataPoint: Send + Sync {
    fn name(&self) -> &str;

    /// Native transfer type.
    fn native_type(&self) -> u16;

    /// Number of elements the point holds.
    fn element_count(&self) -> u32;

    /// Reads up to `count` elements converted to `data_type`, encoded in
    /// network byte order.  Fewer elements may come back than requested.
    fn read(&self, data_type: u16, count: u32) -> Result<Vec<u8>, DataSourceError>;

    /// Writes `count` elements of `data_type` from network-order `payload`.
    fn write(&self, data_type: u16, count: u32, payload: &[u8]) -> Result<(), DataSourceError>;

    /// Writes and calls `done` once processing finishes.  `done` may run on
    /// any thread, including the caller's.
    fn write_notify(&self, data_type: u16, count: u32, payload: &[u8], done: PutCompletion);

    /// Registers `listener` for changes matching `mask`.
    fn subscribe(&self, mask: u16, listener: Arc<dyn ChangeListener>) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);

    /// Whether the point accepts writes at all, independent of access rights.
    fn is_writable(&self) -> bool {
        true
    }
}

/// Resolves names to points.
pub trait DataSource: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<dyn DataPoint>>;
}

/// Yes/no capability check.
#[cfg_attr(test, mockall::automock)]
pub trait AccessControl: Send + Sync {
    /// Whether rights can change at run time.  When inactive, channels are
    /// put in service straight away.
    fn is_active(&self) -> bool;

    fn rights(&self, point: &str, user: &str, host: &str) -> AccessRights;
}

/// Access control that grants everything and never changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAccess;

impl AccessControl for OpenAccess {
    fn is_active(&self) -> bool {
        false
    }

    fn rights(&self, _point: &str, _user: &str, _host: &str) -> AccessRights {
        AccessRights::READ_WRITE
    }
}

/// Stand-in held by pooled channel records between uses.
#[derive(Debug, Default)]
pub struct DetachedPoint;

impl DataPoint for DetachedPoint {
    fn name(&self) -> &str {
        ""
    }

    fn native_type(&self) -> u16 {
        dbr::STRING
    }

    fn element_count(&self) -> u32 {
        0
    }

    fn read(&self, _data_type: u16, _count: u32) -> Result<Vec<u8>, DataSourceError> {
        Err(DataSourceError::Detached)
    }

    fn write(&self, _data_type: u16, _count: u32, _payload: &[u8]) -> Result<(), DataSourceError> {
        Err(DataSourceError::Detached)
    }

    fn write_notify(&self, _data_type: u16, _count: u32, _payload: &[u8], done: PutCompletion) {
        done(Err(DataSourceError::Detached));
    }

    fn subscribe(&self, _mask: u16, _listener: Arc<dyn ChangeListener>) -> SubscriptionId {
        0
    }

    fn unsubscribe(&self, _id: SubscriptionId) {}

    fn is_writable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(dbr::element_size(dbr::STRING), Some(40));
        assert_eq!(dbr::element_size(dbr::SHORT), Some(2));
        assert_eq!(dbr::element_size(dbr::DOUBLE), Some(8));
        assert_eq!(dbr::element_size(7), None);
        assert_eq!(dbr::payload_size(dbr::LONG, 10), Some(40));
    }

    #[test]
    fn test_open_access_grants_read_write() {
        let access = OpenAccess;
        assert!(!access.is_active());
        assert_eq!(access.rights("pv", "u", "h"), AccessRights::READ_WRITE);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(DataSourceError::BadType(9).get_status(), status::BADTYPE);
        assert_eq!(DataSourceError::Detached.get_status(), status::GETFAIL);
        assert_eq!(
            DataSourceError::ReadOnly("x".into()).put_status(),
            status::NOWTACCESS
        );
        assert_eq!(DataSourceError::Cancelled.put_status(), status::PUTFAIL);
    }

    #[test]
    fn test_detached_point_completes_put_with_error() {
        // Arrange
        let point = DetachedPoint;
        let (tx, rx) = std::sync::mpsc::channel();

        // Act
        point.write_notify(dbr::LONG, 1, &[0; 4], Box::new(move |r| tx.send(r).unwrap()));

        // Assert
        assert_eq!(rx.recv().unwrap(), Err(DataSourceError::Detached));
    }
}
