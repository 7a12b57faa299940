//! This module tracks the status of every payload the router has
//! handed out, in test and contract-checking builds.  It catches
//! double allocations and double frees that the release build, by
//! design, does not look for.
use std::collections::HashMap;
use std::sync::Mutex;

struct AllocationInfo {
    live: bool, // True if owned by the mutator.
}

lazy_static::lazy_static! {
    static ref ALLOCATION_STATE_MAP: Mutex<HashMap<usize, AllocationInfo>> = Default::default();
}

/// Marks the payload at `address` as returned to the mutator.
pub fn mark_allocated(address: usize) -> Result<(), &'static str> {
    let mut map = ALLOCATION_STATE_MAP.lock().unwrap();
    let info = map
        .entry(address)
        .or_insert(AllocationInfo { live: false });

    if info.live {
        return Err("double allocation");
    }

    info.live = true;
    Ok(())
}

/// Marks the payload at `address` as released by the mutator.
pub fn mark_released(address: usize) -> Result<(), &'static str> {
    let mut map = ALLOCATION_STATE_MAP.lock().unwrap();
    let info = map.get_mut(&address).ok_or("released unknown address")?;

    if !info.live {
        return Err("double free");
    }

    info.live = false;
    Ok(())
}

#[test]
fn tracks_the_live_flag() {
    // Use an address no allocator will ever return.
    let address = usize::MAX - 63;

    assert!(mark_released(address).is_err());
    assert!(mark_allocated(address).is_ok());
    assert!(mark_allocated(address).is_err());
    assert!(mark_released(address).is_ok());
    assert!(mark_released(address).is_err());
    assert!(mark_allocated(address).is_ok());
    assert!(mark_released(address).is_ok());
}
