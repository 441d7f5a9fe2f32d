//! The seam between the discovery spine and the things that own PVs.
//!
//! A [`Source`] is registered on a [`Server`](crate::server::Server) with a
//! `(order, name)` key and gets offered every incoming search. Claiming a
//! name tells the server to include it in the search reply; everything after
//! that (channel creation on the TCP circuit) happens in the layer above.

/// Provides PV names for a server.
///
/// `on_search` is invoked for every incoming search, under the registry's
/// read lock, in registry order. A panicking source is logged and isolated;
/// the remaining sources still see the same operation.
pub trait Source: Send + Sync + 'static {
    /// Claim any of the searched names that this source provides.
    fn on_search(&self, op: &mut SearchOperation);
}

/// One name from a search, claimable by a [`Source`].
#[derive(Debug)]
pub struct SearchName {
    id: u32,
    name: String,
    claimed: bool,
}

impl SearchName {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Claim this name for the replying server.
    pub fn claim(&mut self) {
        self.claimed = true;
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed
    }
}

/// A decoded search being offered to the registered sources.
#[derive(Debug)]
pub struct SearchOperation {
    names: Vec<SearchName>,
}

impl SearchOperation {
    pub(crate) fn new(names: &[(u32, String)]) -> SearchOperation {
        SearchOperation {
            names: names
                .iter()
                .map(|(id, name)| SearchName {
                    id: *id,
                    name: name.clone(),
                    claimed: false,
                })
                .collect(),
        }
    }

    pub fn names_mut(&mut self) -> impl Iterator<Item = &mut SearchName> {
        self.names.iter_mut()
    }

    pub fn names(&self) -> impl Iterator<Item = &SearchName> {
        self.names.iter()
    }

    /// Instance ids of the claimed names, in original request order.
    pub(crate) fn claimed_ids(&self) -> Vec<u32> {
        self.names
            .iter()
            .filter(|n| n.claimed)
            .map(|n| n.id)
            .collect()
    }
}

/// The built-in introspection source, always registered at `(-1, "server")`.
#[derive(Debug, Default)]
pub(crate) struct ServerSource;

impl Source for ServerSource {
    fn on_search(&self, op: &mut SearchOperation) {
        for name in op.names_mut() {
            if name.name() == "server" {
                name.claim();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_are_recorded_in_order() {
        let names = vec![(7, "one".to_string()), (9, "two".to_string())];
        let mut op = SearchOperation::new(&names);
        assert!(op.claimed_ids().is_empty());
        for name in op.names_mut() {
            if name.name() == "two" {
                name.claim();
            }
        }
        assert_eq!(op.claimed_ids(), vec![9]);
        ServerSource.on_search(&mut op);
        assert_eq!(op.claimed_ids(), vec![9]);
    }

    #[test]
    fn server_source_claims_its_name() {
        let names = vec![(1, "server".to_string()), (2, "other".to_string())];
        let mut op = SearchOperation::new(&names);
        ServerSource.on_search(&mut op);
        assert_eq!(op.claimed_ids(), vec![1]);
    }
}
