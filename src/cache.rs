//! Per-verb-class cache of outbound connections.
//!
//! For every (verb class, peer) at most one live connection exists. An
//! entry whose connection has seen a fatal error is never handed out
//! again; it is removed and a fresh connection takes its place on the next
//! send.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::connection::{ClientConn, Stats};
use crate::verb::VERB_CLASS_COUNT;
use crate::PeerId;

#[derive(Default)]
pub(crate) struct ClientCache {
    tables: [Mutex<HashMap<PeerId, Arc<ClientConn>>>; VERB_CLASS_COUNT],
}

impl ClientCache {
    /// Runs `f` with the class table locked; lookups and inserts made
    /// inside are atomic with respect to other callers.
    pub(crate) fn with_table<R>(
        &self,
        class: usize,
        f: impl FnOnce(&mut HashMap<PeerId, Arc<ClientConn>>) -> R,
    ) -> R {
        f(&mut self.tables[class].lock().unwrap())
    }

    /// Removes the entry for `id` in `class` and hands it back. With
    /// `dead_only`, an entry whose connection is still healthy is left
    /// alone.
    pub(crate) fn remove(
        &self,
        class: usize,
        id: &PeerId,
        dead_only: bool,
    ) -> Option<Arc<ClientConn>> {
        let mut table = self.tables[class].lock().unwrap();
        if dead_only && !table.get(id).is_some_and(|conn| conn.error()) {
            return None;
        }
        table.remove(id)
    }

    pub(crate) fn foreach_client(&self, f: &mut dyn FnMut(&PeerId, Stats)) {
        for table in &self.tables {
            for (id, conn) in table.lock().unwrap().iter() {
                f(id, conn.stats());
            }
        }
    }

    /// Empties every class table, handing the connections back so the
    /// caller can stop them.
    pub(crate) fn drain(&self) -> Vec<Arc<ClientConn>> {
        let mut all = Vec::new();
        for table in &self.tables {
            all.extend(table.lock().unwrap().drain().map(|(_, conn)| conn));
        }
        all
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, class: usize, id: &PeerId) -> bool {
        self.tables[class].lock().unwrap().contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    use crate::connection::ConnectOptions;

    use super::*;

    fn peer() -> PeerId {
        PeerId::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    fn open_conn(port: u16) -> Arc<ClientConn> {
        ClientConn::open(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            ConnectOptions {
                compress: false,
                tls: None,
            },
        )
    }

    async fn wait_for_error(conn: &ClientConn) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !conn.error() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection never became dead");
    }

    #[tokio::test]
    async fn entries_are_separate_per_class() {
        let cache = ClientCache::default();
        let id = peer();
        for class in 0..VERB_CLASS_COUNT {
            cache.with_table(class, |table| table.insert(id, open_conn(1)));
        }

        let mut seen = 0;
        cache.foreach_client(&mut |seen_id, _stats| {
            assert_eq!(*seen_id, id);
            seen += 1;
        });
        assert_eq!(seen, VERB_CLASS_COUNT);

        assert!(cache.remove(0, &id, false).is_some());
        assert!(cache.contains(1, &id));
        assert!(!cache.contains(0, &id));
    }

    #[tokio::test]
    async fn dead_only_removal_spares_healthy_entries() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let healthy = open_conn(listener.local_addr().unwrap().port());

        let cache = ClientCache::default();
        let id = peer();
        cache.with_table(0, |table| table.insert(id, healthy));

        // The connection has seen no error, so the dead-only removal is a
        // no-op.
        assert!(cache.remove(0, &id, true).is_none());
        assert!(cache.contains(0, &id));

        // Nobody listens on port 1; once the dial fails the entry goes.
        let dead = open_conn(1);
        wait_for_error(&dead).await;
        cache.with_table(1, |table| table.insert(id, dead));
        let removed = cache.remove(1, &id, true).expect("dead entry removed");
        removed.stop().await;
        assert!(!cache.contains(1, &id));
    }

    #[tokio::test]
    async fn drain_empties_every_class() {
        let cache = ClientCache::default();
        let id = peer();
        for class in 0..VERB_CLASS_COUNT {
            cache.with_table(class, |table| table.insert(id, open_conn(1)));
        }
        let drained = cache.drain();
        assert_eq!(drained.len(), VERB_CLASS_COUNT);
        for conn in &drained {
            conn.stop().await;
        }
        for class in 0..VERB_CLASS_COUNT {
            assert!(!cache.contains(class, &id));
        }
    }
}
