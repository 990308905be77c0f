//! Named event counters.
//!
//! Every counter is registered when [`Counters`] is built, so a snapshot
//! always lists the full set even before the first increment. The set is
//! process-scoped state handed to the controller; nothing reaches it through
//! a global.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($variant:ident => $name:literal,)*) => {
        /// One counter per protocol event class.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum Counter {
            $($variant,)*
        }

        impl Counter {
            pub const ALL: &'static [Counter] = &[$(Counter::$variant,)*];

            /// Exported counter name.
            pub fn name(self) -> &'static str {
                match self {
                    $(Counter::$variant => $name,)*
                }
            }
        }
    };
}

counters! {
    SubReqFromXapp => "SubReqFromXapp",
    SubRespToXapp => "SubRespToXapp",
    SubFailToXapp => "SubFailToXapp",
    SubReqToE2 => "SubReqToE2",
    SubReReqToE2 => "SubReReqToE2",
    SubRespFromE2 => "SubRespFromE2",
    SubFailFromE2 => "SubFailFromE2",
    SubReqTimerExpiry => "SubReqTimerExpiry",
    SubDelReqFromXapp => "SubDelReqFromXapp",
    SubDelRespToXapp => "SubDelRespToXapp",
    SubDelFailToXapp => "SubDelFailToXapp",
    SubDelReqToE2 => "SubDelReqToE2",
    SubDelReReqToE2 => "SubDelReReqToE2",
    SubDelRespFromE2 => "SubDelRespFromE2",
    SubDelFailFromE2 => "SubDelFailFromE2",
    SubDelReqTimerExpiry => "SubDelReqTimerExpiry",
    IndicationFromE2 => "IndicationFromE2",
    RouteFailure => "RouteFailure",
    MergedSubscriptions => "MergedSubscriptions",
    UnmergedSubscriptions => "UnmergedSubscriptions",
    DuplicateRequests => "DuplicateRequests",
    StrayMessages => "StrayMessages",
    DecodeFailures => "DecodeFailures",
    SdlWriteFailure => "SDLWriteFailure",
    SdlReadFailure => "SDLReadFailure",
    SdlRemoveFailure => "SDLRemoveFailure",
    RegistryCorruption => "RegistryCorruption",
}

/// Pre-registered counter set.
pub struct Counters {
    values: Vec<AtomicU64>,
}

impl Counters {
    pub fn new() -> Self {
        Self {
            values: Counter::ALL.iter().map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn inc(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.values[counter as usize].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter as usize].load(Ordering::Relaxed)
    }

    /// Current value of every counter by exported name.
    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        Counter::ALL
            .iter()
            .map(|c| (c.name(), self.get(*c)))
            .collect()
    }
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_counters_registered_up_front() {
        let counters = Counters::new();
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.len(), Counter::ALL.len());
        assert!(snapshot.values().all(|v| *v == 0));
        assert_eq!(snapshot.get("SDLWriteFailure"), Some(&0));
    }

    #[test]
    fn test_inc() {
        let counters = Counters::new();
        counters.inc(Counter::SubReqToE2);
        counters.add(Counter::MergedSubscriptions, 3);
        assert_eq!(counters.get(Counter::SubReqToE2), 1);
        assert_eq!(counters.get(Counter::MergedSubscriptions), 3);
        assert_eq!(counters.get(Counter::SubRespToXapp), 0);
    }
}
