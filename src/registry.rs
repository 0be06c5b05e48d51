/// callback registry: pending load requests keyed by cache key
///
use dashmap::DashMap;
use log::*;
use std::time::Instant;

use crate::error::CacheError;

/// the undecoded result handed to a registered callback: the response
/// body bytes, `None` for an explicit "no value", or an error
pub type RawLoadResult = Result<Option<Vec<u8>>, CacheError>;

/// callbacks are plain boxed closures, consumed exactly once; `Sync` so
/// the registry can be shared across monitor and reconciler tasks
pub type RawCallback = Box<dyn FnOnce(RawLoadResult) + Send + Sync + 'static>;

struct Registration {
    callback: RawCallback,
    deadline: Instant,
}

/// Concurrent map from cache key to the callbacks awaiting that key's
/// response.  An entry exists only while at least one load is outstanding;
/// dispatch removes the whole entry atomically, and callbacks are always
/// invoked outside the shard lock so a callback may itself register.
#[derive(Default)]
pub struct CallbackRegistry {
    entries: DashMap<String, Vec<Registration>>,
}

impl CallbackRegistry {
    pub fn new() -> CallbackRegistry {
        CallbackRegistry::default()
    }

    /// append a callback under the key; the deadline is enforced by
    /// [`CallbackRegistry::sweep_expired`]
    pub fn register(&self, key: &str, callback: RawCallback, deadline: Instant) {
        self.entries
            .entry(key.to_string())
            .or_default()
            .push(Registration { callback, deadline });
    }

    /// dispatch a response: remove the entry atomically and invoke every
    /// registered callback once with a clone of the result.  returns the
    /// number of callbacks fired; zero means nothing was waiting.
    pub fn complete(&self, key: &str, result: RawLoadResult) -> usize {
        let regs = match self.entries.remove(key) {
            Some((_, regs)) => regs,
            None => {
                debug!("no callbacks registered for key: {}", key);
                return 0;
            }
        };

        let count = regs.len();
        for reg in regs {
            (reg.callback)(result.clone());
        }

        count
    }

    /// time out registrations past their deadline, firing the error path
    /// once for each; empty entries are removed.  returns the number fired.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut fired = 0;

        for key in keys {
            let mut expired = Vec::new();
            if let Some(mut entry) = self.entries.get_mut(&key) {
                let regs = entry.value_mut();
                let mut i = 0;
                while i < regs.len() {
                    if regs[i].deadline <= now {
                        expired.push(regs.remove(i));
                    } else {
                        i += 1;
                    }
                }
            }
            self.entries.remove_if(&key, |_, regs| regs.is_empty());

            if !expired.is_empty() {
                warn!("load timed out for key: {} ({} waiting)", key, expired.len());
            }
            for reg in expired {
                (reg.callback)(Err(CacheError::Timeout));
                fired += 1;
            }
        }

        fired
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// number of keys with outstanding loads
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
