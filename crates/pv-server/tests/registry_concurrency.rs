//! Resource registry under concurrent use.
//!
//! Discovery threads and TCP readers create and release channels at the
//! same time; these tests hammer one registry from several threads and check
//! that server ids stay unique and the channel count stays exact.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::thread;

use pv_core::AccessRights;
use pv_server::application::channel::ChannelInit;
use pv_server::application::data_source::DetachedPoint;
use pv_server::application::registry::{RegistryLimits, ResourceRegistry};

fn init(name: String) -> ChannelInit {
    ChannelInit {
        cid: 1,
        name,
        point: Arc::new(DetachedPoint),
        rights: AccessRights::READ_WRITE,
        origin: None,
        session: Weak::new(),
    }
}

#[test]
fn test_concurrent_creates_get_distinct_ids() {
    // Arrange
    let registry = Arc::new(ResourceRegistry::new(RegistryLimits::default()));

    // Act
    let workers: Vec<_> = (0..8)
        .map(|w| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                (0..250)
                    .map(|n| registry.create_channel(init(format!("pv:{w}:{n}"))).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let channels: Vec<_> = workers.into_iter().flat_map(|w| w.join().unwrap()).collect();

    // Assert
    let ids: HashSet<u32> = channels.iter().map(|c| c.sid()).collect();
    assert_eq!(ids.len(), 2000);
    assert_eq!(registry.channel_count(), 2000);
    assert!(channels
        .iter()
        .all(|c| Arc::ptr_eq(&registry.lookup(c.sid()).unwrap(), c)));
}

#[test]
fn test_interleaved_create_and_release_keeps_count_exact() {
    // Arrange
    let registry = Arc::new(ResourceRegistry::new(RegistryLimits::default()));

    // Act
    let workers: Vec<_> = (0..4)
        .map(|w| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let mut kept = Vec::new();
                for n in 0..500 {
                    let chan = registry.create_channel(init(format!("pv:{w}:{n}"))).unwrap();
                    if n % 2 == 0 {
                        registry.release_channel(chan).unwrap();
                    } else {
                        kept.push(chan);
                    }
                }
                kept
            })
        })
        .collect();
    let kept: Vec<_> = workers.into_iter().flat_map(|w| w.join().unwrap()).collect();

    // Assert
    assert_eq!(kept.len(), 1000);
    assert_eq!(registry.channel_count(), 1000);
    assert_eq!(registry.allocated_ids(), 1000);
}

#[test]
fn test_limit_holds_under_contention() {
    // Arrange
    let registry = Arc::new(ResourceRegistry::new(RegistryLimits {
        max_channels: Some(100),
        ..RegistryLimits::default()
    }));

    // Act
    let workers: Vec<_> = (0..4)
        .map(|w| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                (0..50)
                    .filter_map(|n| registry.create_channel(init(format!("pv:{w}:{n}"))).ok())
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let created: Vec<_> = workers.into_iter().flat_map(|w| w.join().unwrap()).collect();

    // Assert
    assert_eq!(created.len(), 100);
    assert_eq!(registry.channel_count(), 100);
}
