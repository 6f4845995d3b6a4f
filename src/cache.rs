//! Event streams fetched during one matrix build, keyed by source and selector.

use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::events::{EventSelector, EventStream};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub source: String,
    pub selector: EventSelector,
}

#[derive(Debug, Default)]
pub struct EventCache {
    enabled: bool,
    entries: HashMap<CacheKey, Rc<EventStream>>,
    hits: u64,
    misses: u64,
}

impl EventCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    pub fn get_or_try_insert<E>(
        &mut self,
        key: CacheKey,
        fetch: impl FnOnce() -> Result<EventStream, E>,
    ) -> Result<Rc<EventStream>, E> {
        if !self.enabled {
            self.misses += 1;
            return fetch().map(Rc::new);
        }

        if let Some(stream) = self.entries.get(&key) {
            self.hits += 1;
            debug!(
                component = "cache",
                event = "events.cache.hit",
                source = %key.source,
                selector = key.selector.kind()
            );
            return Ok(Rc::clone(stream));
        }

        self.misses += 1;
        let stream = Rc::new(fetch()?);
        self.entries.insert(key, Rc::clone(&stream));
        Ok(stream)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(names: &[&str]) -> CacheKey {
        CacheKey {
            source: "mem".to_string(),
            selector: EventSelector::Flowsheets {
                names: names.iter().map(|n| n.to_string()).collect(),
            },
        }
    }

    #[test]
    fn second_lookup_reuses_stream() {
        let mut cache = EventCache::new(true);
        let mut fetches = 0;
        for _ in 0..2 {
            cache
                .get_or_try_insert::<()>(key(&["Pulse"]), || {
                    fetches += 1;
                    Ok(EventStream::empty())
                })
                .unwrap();
        }
        assert_eq!(fetches, 1);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distinct_selectors_do_not_collide() {
        let mut cache = EventCache::new(true);
        cache
            .get_or_try_insert::<()>(key(&["Pulse"]), || Ok(EventStream::empty()))
            .unwrap();
        cache
            .get_or_try_insert::<()>(key(&["Resp"]), || Ok(EventStream::empty()))
            .unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.hits(), 0);
    }

    #[test]
    fn disabled_cache_always_fetches_and_propagates_errors() {
        let mut cache = EventCache::new(false);
        let err = cache
            .get_or_try_insert(key(&["Pulse"]), || Err("down"))
            .expect_err("error passes through");
        assert_eq!(err, "down");
        assert!(cache.is_empty());
        assert_eq!(cache.misses(), 1);
    }
}
