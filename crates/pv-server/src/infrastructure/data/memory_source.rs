//! In-memory data points, so the server and its tests run without a
//! control process behind them.
//!
//! Each [`MemoryPoint`] holds a fixed-length array of one native type and
//! converts between it and any of the seven transfer types.  Numeric types
//! convert into one another; strings convert to numbers by parsing.
//! Subscribers are notified after the value lock is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use pv_core::protocol::{event_mask, MAX_STRING_SIZE};
use tracing::debug;

use crate::application::data_source::{
    dbr, ChangeListener, DataPoint, DataSource, DataSourceError, PutCompletion, SubscriptionId,
};

/// Value of a point in its native type.
#[derive(Debug, Clone, PartialEq)]
pub enum PointValue {
    String(Vec<String>),
    Short(Vec<i16>),
    Float(Vec<f32>),
    Enum(Vec<u16>),
    Char(Vec<u8>),
    Long(Vec<i32>),
    Double(Vec<f64>),
}

/// One element on its way between two types.
enum Scalar {
    Num(f64),
    Text(String),
}

impl PointValue {
    pub fn native_type(&self) -> u16 {
        match self {
            PointValue::String(_) => dbr::STRING,
            PointValue::Short(_) => dbr::SHORT,
            PointValue::Float(_) => dbr::FLOAT,
            PointValue::Enum(_) => dbr::ENUM,
            PointValue::Char(_) => dbr::CHAR,
            PointValue::Long(_) => dbr::LONG,
            PointValue::Double(_) => dbr::DOUBLE,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PointValue::String(v) => v.len(),
            PointValue::Short(v) => v.len(),
            PointValue::Float(v) => v.len(),
            PointValue::Enum(v) => v.len(),
            PointValue::Char(v) => v.len(),
            PointValue::Long(v) => v.len(),
            PointValue::Double(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, i: usize) -> Scalar {
        match self {
            PointValue::String(v) => Scalar::Text(v[i].clone()),
            PointValue::Short(v) => Scalar::Num(f64::from(v[i])),
            PointValue::Float(v) => Scalar::Num(f64::from(v[i])),
            PointValue::Enum(v) => Scalar::Num(f64::from(v[i])),
            PointValue::Char(v) => Scalar::Num(f64::from(v[i])),
            PointValue::Long(v) => Scalar::Num(f64::from(v[i])),
            PointValue::Double(v) => Scalar::Num(v[i]),
        }
    }

    fn set(&mut self, i: usize, value: Scalar) -> Result<(), DataSourceError> {
        let num = |value: &Scalar| match value {
            Scalar::Num(n) => Ok(*n),
            Scalar::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| DataSourceError::Conversion(format!("'{s}' is not a number"))),
        };
        match self {
            PointValue::String(v) => {
                v[i] = match value {
                    Scalar::Text(s) => s,
                    Scalar::Num(n) => n.to_string(),
                }
            }
            PointValue::Short(v) => v[i] = num(&value)? as i16,
            PointValue::Float(v) => v[i] = num(&value)? as f32,
            PointValue::Enum(v) => v[i] = num(&value)? as u16,
            PointValue::Char(v) => v[i] = num(&value)? as u8,
            PointValue::Long(v) => v[i] = num(&value)? as i32,
            PointValue::Double(v) => v[i] = num(&value)?,
        }
        Ok(())
    }

    /// Encodes up to `count` elements as `data_type` in network order.
    fn encode(&self, data_type: u16, count: usize) -> Result<Vec<u8>, DataSourceError> {
        let size = dbr::element_size(data_type).ok_or(DataSourceError::BadType(data_type))?;
        let n = count.min(self.len());
        let mut out = Vec::with_capacity(n * size);
        for i in 0..n {
            match (self.get(i), data_type) {
                (Scalar::Text(s), dbr::STRING) => push_string(&mut out, &s),
                (Scalar::Num(v), dbr::STRING) => push_string(&mut out, &v.to_string()),
                (value, _) => {
                    let v = match value {
                        Scalar::Num(v) => v,
                        Scalar::Text(s) => s.trim().parse::<f64>().map_err(|_| {
                            DataSourceError::Conversion(format!("'{s}' is not a number"))
                        })?,
                    };
                    match data_type {
                        dbr::SHORT => out.extend_from_slice(&(v as i16).to_be_bytes()),
                        dbr::FLOAT => out.extend_from_slice(&(v as f32).to_be_bytes()),
                        dbr::ENUM => out.extend_from_slice(&(v as u16).to_be_bytes()),
                        dbr::CHAR => out.push(v as u8),
                        dbr::LONG => out.extend_from_slice(&(v as i32).to_be_bytes()),
                        _ => out.extend_from_slice(&v.to_be_bytes()),
                    }
                }
            }
        }
        Ok(out)
    }
}

fn push_string(out: &mut Vec<u8>, s: &str) {
    let mut field = [0u8; MAX_STRING_SIZE];
    let bytes = s.as_bytes();
    let len = bytes.len().min(MAX_STRING_SIZE - 1);
    field[..len].copy_from_slice(&bytes[..len]);
    out.extend_from_slice(&field);
}

/// Decodes element `i` of a `data_type` payload.
fn decode_element(data_type: u16, payload: &[u8], i: usize) -> Scalar {
    let at = |size: usize| &payload[i * size..(i + 1) * size];
    match data_type {
        dbr::STRING => {
            let field = at(MAX_STRING_SIZE);
            let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
            Scalar::Text(String::from_utf8_lossy(&field[..end]).into_owned())
        }
        dbr::SHORT => Scalar::Num(f64::from(i16::from_be_bytes([at(2)[0], at(2)[1]]))),
        dbr::ENUM => Scalar::Num(f64::from(u16::from_be_bytes([at(2)[0], at(2)[1]]))),
        dbr::CHAR => Scalar::Num(f64::from(at(1)[0])),
        dbr::FLOAT => {
            let b = at(4);
            Scalar::Num(f64::from(f32::from_be_bytes([b[0], b[1], b[2], b[3]])))
        }
        dbr::LONG => {
            let b = at(4);
            Scalar::Num(f64::from(i32::from_be_bytes([b[0], b[1], b[2], b[3]])))
        }
        _ => {
            let b = at(8);
            Scalar::Num(f64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
        }
    }
}

// ── Points ────────────────────────────────────────────────────────────────────

struct Subscriber {
    id: SubscriptionId,
    mask: u16,
    listener: Arc<dyn ChangeListener>,
}

pub struct MemoryPoint {
    name: String,
    native_type: u16,
    element_count: u32,
    value: Mutex<PointValue>,
    read_only: AtomicBool,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscription: AtomicU64,
}

impl MemoryPoint {
    pub fn new(name: &str, value: PointValue) -> Self {
        Self {
            name: name.to_string(),
            native_type: value.native_type(),
            element_count: value.len() as u32,
            value: Mutex::new(value),
            read_only: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn value(&self) -> PointValue {
        crate::application::lock(&self.value).clone()
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Relaxed);
    }

    /// Replaces the value from the data-source side, e.g. a simulated
    /// process update.  The type and length must match.
    pub fn store(&self, value: PointValue) -> Result<(), DataSourceError> {
        {
            let mut current = crate::application::lock(&self.value);
            if value.native_type() != self.native_type {
                return Err(DataSourceError::BadType(value.native_type()));
            }
            if value.len() != current.len() {
                return Err(DataSourceError::BadCount {
                    requested: value.len() as u32,
                    available: self.element_count,
                });
            }
            *current = value;
        }
        self.notify(event_mask::VALUE | event_mask::LOG);
        Ok(())
    }

    pub fn subscriber_count(&self) -> usize {
        crate::application::lock(&self.subscribers).len()
    }

    fn notify(&self, mask: u16) {
        let listeners: Vec<Arc<dyn ChangeListener>> = crate::application::lock(&self.subscribers)
            .iter()
            .filter(|s| s.mask & mask != 0)
            .map(|s| Arc::clone(&s.listener))
            .collect();
        for listener in listeners {
            listener.on_data_changed();
        }
    }
}

impl DataPoint for MemoryPoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn native_type(&self) -> u16 {
        self.native_type
    }

    fn element_count(&self) -> u32 {
        self.element_count
    }

    fn read(&self, data_type: u16, count: u32) -> Result<Vec<u8>, DataSourceError> {
        crate::application::lock(&self.value).encode(data_type, count as usize)
    }

    fn write(&self, data_type: u16, count: u32, payload: &[u8]) -> Result<(), DataSourceError> {
        if self.read_only.load(Ordering::Relaxed) {
            return Err(DataSourceError::ReadOnly(self.name.clone()));
        }
        let size = dbr::element_size(data_type).ok_or(DataSourceError::BadType(data_type))?;
        if count == 0 || count > self.element_count {
            return Err(DataSourceError::BadCount {
                requested: count,
                available: self.element_count,
            });
        }
        let count = count as usize;
        if payload.len() < count * size {
            return Err(DataSourceError::Conversion(format!(
                "{} payload bytes for {count} elements of {}",
                payload.len(),
                dbr::name(data_type)
            )));
        }
        {
            let mut value = crate::application::lock(&self.value);
            let mut next = value.clone();
            for i in 0..count {
                next.set(i, decode_element(data_type, payload, i))?;
            }
            *value = next;
        }
        debug!(point = %self.name, count, "value written");
        self.notify(event_mask::VALUE | event_mask::LOG);
        Ok(())
    }

    fn write_notify(&self, data_type: u16, count: u32, payload: &[u8], done: PutCompletion) {
        done(self.write(data_type, count, payload));
    }

    fn subscribe(&self, mask: u16, listener: Arc<dyn ChangeListener>) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        crate::application::lock(&self.subscribers).push(Subscriber { id, mask, listener });
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        crate::application::lock(&self.subscribers).retain(|s| s.id != id);
    }

    fn is_writable(&self) -> bool {
        !self.read_only.load(Ordering::Relaxed)
    }
}

// ── Source ────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryDataSource {
    points: RwLock<HashMap<String, Arc<MemoryPoint>>>,
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source seeded with a few points of every type.
    pub fn with_demo_points() -> Self {
        let source = Self::new();
        source.add_point("demo:temperature", PointValue::Double(vec![21.5]));
        source.add_point("demo:setpoint", PointValue::Double(vec![20.0]));
        source.add_point("demo:counter", PointValue::Long(vec![0]));
        source.add_point("demo:mode", PointValue::Enum(vec![0]));
        source.add_point("demo:status", PointValue::String(vec!["OK".to_string()]));
        source.add_point("demo:gain", PointValue::Float(vec![1.0]));
        source.add_point("demo:flags", PointValue::Short(vec![0]));
        source.add_point("demo:message", PointValue::Char(b"hello\0".to_vec()));
        source.add_point("demo:waveform", PointValue::Double((0..1024).map(f64::from).collect()));
        source.add_point("demo:image", PointValue::Char(vec![0; 65536]));
        source.set_read_only("demo:temperature", true);
        source
    }

    pub fn add_point(&self, name: &str, value: PointValue) -> Arc<MemoryPoint> {
        let point = Arc::new(MemoryPoint::new(name, value));
        self.points
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Arc::clone(&point));
        point
    }

    pub fn point(&self, name: &str) -> Option<Arc<MemoryPoint>> {
        self.points
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Returns `false` when no point has that name.
    pub fn set_read_only(&self, name: &str, read_only: bool) -> bool {
        match self.point(name) {
            Some(point) => {
                point.set_read_only(read_only);
                true
            }
            None => false,
        }
    }

    /// Stores a new value as if the process had changed it.
    pub fn write_value(&self, name: &str, value: PointValue) -> Result<(), DataSourceError> {
        self.point(name).ok_or(DataSourceError::Detached)?.store(value)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .points
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl DataSource for MemoryDataSource {
    fn resolve(&self, name: &str) -> Option<Arc<dyn DataPoint>> {
        self.point(name).map(|p| p as Arc<dyn DataPoint>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingListener {
        calls: AtomicUsize,
    }

    impl ChangeListener for CountingListener {
        fn on_data_changed(&self) {
            self.calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_numeric_conversion_between_types() {
        // Arrange
        let point = MemoryPoint::new("p", PointValue::Double(vec![3.75]));

        // Act
        let as_long = point.read(dbr::LONG, 1).unwrap();
        let as_string = point.read(dbr::STRING, 1).unwrap();

        // Assert
        assert_eq!(as_long, 3i32.to_be_bytes());
        assert_eq!(as_string.len(), 40);
        assert_eq!(&as_string[..4], b"3.75");
        assert_eq!(as_string[4], 0);
    }

    #[test]
    fn test_write_string_into_numeric_point_parses() {
        let point = MemoryPoint::new("p", PointValue::Long(vec![0]));
        let mut field = [0u8; 40];
        field[..3].copy_from_slice(b"-12");

        point.write(dbr::STRING, 1, &field).unwrap();

        assert_eq!(point.value(), PointValue::Long(vec![-12]));
    }

    #[test]
    fn test_unparsable_string_is_conversion_error_and_keeps_value() {
        let point = MemoryPoint::new("p", PointValue::Long(vec![5]));
        let mut field = [0u8; 40];
        field[..3].copy_from_slice(b"abc");

        let err = point.write(dbr::STRING, 1, &field).unwrap_err();

        assert!(matches!(err, DataSourceError::Conversion(_)));
        assert_eq!(point.value(), PointValue::Long(vec![5]));
    }

    #[test]
    fn test_read_returns_at_most_stored_elements() {
        let point = MemoryPoint::new("w", PointValue::Short(vec![1, 2, 3]));

        let bytes = point.read(dbr::SHORT, 10).unwrap();

        assert_eq!(bytes, vec![0, 1, 0, 2, 0, 3]);
    }

    #[test]
    fn test_write_notifies_matching_subscribers_only() {
        // Arrange
        let point = MemoryPoint::new("p", PointValue::Double(vec![0.0]));
        let value_listener = Arc::new(CountingListener::default());
        let alarm_listener = Arc::new(CountingListener::default());
        point.subscribe(event_mask::VALUE, value_listener.clone());
        point.subscribe(event_mask::ALARM, alarm_listener.clone());

        // Act
        point.write(dbr::DOUBLE, 1, &2.0f64.to_be_bytes()).unwrap();

        // Assert
        assert_eq!(value_listener.calls.load(Ordering::Relaxed), 1);
        assert_eq!(alarm_listener.calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let point = MemoryPoint::new("p", PointValue::Double(vec![0.0]));
        let listener = Arc::new(CountingListener::default());
        let id = point.subscribe(event_mask::VALUE, listener.clone());

        point.unsubscribe(id);
        point.store(PointValue::Double(vec![1.0])).unwrap();

        assert_eq!(listener.calls.load(Ordering::Relaxed), 0);
        assert_eq!(point.subscriber_count(), 0);
    }

    #[test]
    fn test_read_only_point_rejects_writes() {
        let source = MemoryDataSource::new();
        source.add_point("ro", PointValue::Long(vec![1]));
        assert!(source.set_read_only("ro", true));

        let point = source.resolve("ro").unwrap();
        let err = point.write(dbr::LONG, 1, &2i32.to_be_bytes()).unwrap_err();

        assert!(matches!(err, DataSourceError::ReadOnly(_)));
        assert!(!point.is_writable());
    }

    #[test]
    fn test_write_notify_completes_synchronously() {
        let point = MemoryPoint::new("p", PointValue::Long(vec![0]));
        let (tx, rx) = std::sync::mpsc::channel();

        point.write_notify(dbr::LONG, 2, &[0; 8], Box::new(move |r| tx.send(r).unwrap()));

        assert!(matches!(rx.try_recv().unwrap(), Err(DataSourceError::BadCount { .. })));
    }

    #[test]
    fn test_demo_points_resolve() {
        let source = MemoryDataSource::with_demo_points();
        assert!(source.resolve("demo:waveform").is_some());
        assert!(source.resolve("missing").is_none());
        assert_eq!(source.point("demo:image").unwrap().element_count(), 65536);
    }
}
