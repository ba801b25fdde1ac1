// SPDX-License-Identifier: GPL-3.0-only

//! Per-device commit locks within this process

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

static DEVICE_LOCKS: LazyLock<Mutex<HashMap<String, Arc<Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// The mutex serialising commits to `device_id`
pub(crate) fn device_lock(device_id: &str) -> Arc<Mutex<()>> {
    let mut locks = DEVICE_LOCKS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    locks
        .entry(device_id.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_device_shares_one_lock() {
        let a = device_lock("/dev/lock-test-a");
        let b = device_lock("/dev/lock-test-a");
        let c = device_lock("/dev/lock-test-c");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        let _held = a.lock().unwrap();
        assert!(b.try_lock().is_err());
        assert!(c.try_lock().is_ok());
    }
}
