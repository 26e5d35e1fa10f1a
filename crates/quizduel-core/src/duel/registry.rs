//! Event listener registry
//!
//! Tracks which consumer (the active duel session or the quick match
//! coordinator) is listening for which inbound event kinds. At most one
//! duel registration and one quick match registration exist at a time;
//! registering again replaces the previous set.
//!
//! Each registration carries a [`RegistrationToken`] from a monotonic
//! counter, so a stale holder cannot tear down a newer registration.

use std::collections::BTreeSet;
use std::fmt;

use tracing::debug;

use crate::net::{DuelId, EventKind};

/// Consumer an event is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Duel(DuelId),
    QuickMatch,
}

impl Scope {
    fn same_slot(&self, other: &Scope) -> bool {
        matches!(
            (self, other),
            (Scope::Duel(_), Scope::Duel(_)) | (Scope::QuickMatch, Scope::QuickMatch)
        )
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Duel(id) => write!(f, "duel {}", id),
            Scope::QuickMatch => f.write_str("quick match"),
        }
    }
}

/// Identifies one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationToken(u64);

#[derive(Debug)]
struct Registration {
    scope: Scope,
    token: RegistrationToken,
    kinds: BTreeSet<EventKind>,
}

/// Listener bookkeeping for one engine
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    generation: u64,
    registrations: Vec<Registration>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `scope` for `kinds`, replacing any registration in the same slot
    pub fn subscribe(&mut self, scope: Scope, kinds: &[EventKind]) -> RegistrationToken {
        self.unsubscribe(&scope);

        self.generation += 1;
        let token = RegistrationToken(self.generation);
        self.registrations.push(Registration {
            scope,
            token,
            kinds: kinds.iter().copied().collect(),
        });
        debug!("Registered {} listeners for {}", kinds.len(), scope);
        token
    }

    /// Drop the registration occupying the slot of `scope`
    ///
    /// Returns the number of listeners removed.
    pub fn unsubscribe(&mut self, scope: &Scope) -> usize {
        let before = self.len();
        self.registrations.retain(|r| !r.scope.same_slot(scope));
        let removed = before - self.len();
        if removed > 0 {
            debug!("Removed {} listeners for {}", removed, scope);
        }
        removed
    }

    /// Drop the registration with `token`, if it is still current
    pub fn unsubscribe_token(&mut self, token: RegistrationToken) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.token != token);
        before != self.registrations.len()
    }

    /// The scope listening for `kind`, if any
    pub fn route(&self, kind: EventKind) -> Option<Scope> {
        self.registrations
            .iter()
            .find(|r| r.kinds.contains(&kind))
            .map(|r| r.scope)
    }

    /// Total number of registered listeners
    pub fn len(&self) -> usize {
        self.registrations.iter().map(|r| r.kinds.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}
