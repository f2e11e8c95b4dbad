// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

//! The service-wide monotonic clock. All timestamps in the runtime are
//! nanoseconds since the process epoch, which makes them strictly
//! non-negative and immune to wall-clock adjustment.

use std::time;

use lazy_static::lazy_static;

lazy_static! {
    pub static ref EPOCH: time::Instant = time::Instant::now();
}

pub fn now_ns() -> i64 {
    EPOCH.elapsed().as_nanos() as i64
}

/// Sleeps until `deadline_ns`, or returns immediately if it has passed.
pub fn sleep_until(deadline_ns: i64) {
    let now = now_ns();
    if deadline_ns > now {
        std::thread::sleep(time::Duration::from_nanos((deadline_ns - now) as u64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotone() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
        assert!(a >= 0);
    }
}
