//! Realm routing: a compiled, read-only-after-startup table mapping a
//! username pattern to an upstream server peer.
//!
//! The teacher has no equivalent of realm routing (TURN has no concept of
//! multiple upstream domains); this module follows the same "compiled once
//! at startup, `Arc`-shared, read-only thereafter" shape the teacher uses
//! for its interface address list.

use std::sync::Arc;

use regex::RegexBuilder;

use crate::peer::ServerPeer;

pub struct Realm {
    pub name: String,
    pub regex: regex::Regex,
    pub server: Option<Arc<ServerPeer>>,
    pub reject_message: Option<String>,
}

impl Realm {
    /// Compile a realm pattern (spec §6): `/regex/` is used verbatim
    /// case-insensitively; a literal domain name is anchored as `@domain$`
    /// with `.` escaped and `*` expanded to `.*`, matching
    /// `original_source/radsecproxy.c`'s realm-pattern compilation.
    pub fn compile(
        pattern: &str,
        server: Option<Arc<ServerPeer>>,
        reject_message: Option<String>,
    ) -> Result<Self, regex::Error> {
        let source = if let Some(inner) = pattern.strip_prefix('/').and_then(|p| p.strip_suffix('/')) {
            inner.to_string()
        } else {
            let escaped = pattern.replace('.', "\\.").replace('*', ".*");
            format!("@{escaped}$")
        };

        let regex = RegexBuilder::new(&source).case_insensitive(true).build()?;

        Ok(Self { name: pattern.to_string(), regex, server, reject_message })
    }
}

/// First-match-wins realm table, compiled once at startup.
pub struct RealmRouter {
    realms: Vec<Realm>,
}

impl RealmRouter {
    pub fn new(realms: Vec<Realm>) -> Self {
        Self { realms }
    }

    /// Returns the first realm whose regex matches `username`, in insertion
    /// order (spec §8 invariant 6).
    pub fn match_username<'a>(&'a self, username: &str) -> Option<&'a Realm> {
        self.realms.iter().find(|realm| realm.regex.is_match(username))
    }
}
