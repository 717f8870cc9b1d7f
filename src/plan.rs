//! The query plan used for the very first connect and for reconnects.

use std::sync::Arc;

use rand::Rng;

use crate::host::Host;

/// A consumed-once plan over the initial host set: a random starting index
/// modulo the host count, traversed cyclically for exactly one full pass.
pub struct StartupQueryPlan {
    hosts: Vec<Arc<Host>>,
    index: usize,
    count: usize,
}

impl StartupQueryPlan {
    pub fn new(hosts: Vec<Arc<Host>>, rng: &mut impl Rng) -> Self {
        let index = rng.random_range(0..hosts.len().max(1));
        StartupQueryPlan {
            hosts,
            index,
            count: 0,
        }
    }
}

impl Iterator for StartupQueryPlan {
    type Item = Arc<Host>;

    fn next(&mut self) -> Option<Arc<Host>> {
        let size = self.hosts.len();
        if self.count >= size {
            return None;
        }
        let index = (self.index + self.count) % size;
        self.count += 1;
        Some(Arc::clone(&self.hosts[index]))
    }
}
