//! Label classification.
//!
//! Container authors declare two families of labels:
//!
//! * **Routing labels** (`traefik/...`): mirrored into the cache store.
//! * **DNS labels** (`rfc2136/...`): `rfc2136/WAN/...` targets the WAN zone,
//!   anything else the LAN zone.  A key ending in `/server` names the zone
//!   server, `/key` the TSIG key, and every other key is an update
//!   statement such as `update add host.lan 300 A 10.0.0.2`.
//!
//! All matching is ASCII case-insensitive.  Keys matching neither family are
//! ignored.

use std::collections::BTreeMap;

use crate::types::Labels;

const ROUTING_PREFIX: &str = "traefik/";
const DNS_PREFIX: &str = "rfc2136/";
const WAN_PREFIX: &str = "rfc2136/wan/";
const SERVER_SUFFIX: &str = "/server";
const KEY_SUFFIX: &str = "/key";

/// The DNS zone a label targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Wan,
    Lan,
}

impl Zone {
    pub fn as_str(self) -> &'static str {
        match self {
            Zone::Wan => "WAN",
            Zone::Lan => "LAN",
        }
    }
}

/// DNS update statements destined for one zone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZoneBatch {
    pub server: String,
    pub key: String,
    pub commands: Vec<String>,
}

impl ZoneBatch {
    /// Only batches naming a server and a key and carrying at least one
    /// statement may be submitted.
    pub fn is_eligible(&self) -> bool {
        !self.server.is_empty() && !self.key.is_empty() && !self.commands.is_empty()
    }
}

/// Result of classifying one container's labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifiedLabels {
    pub routing: BTreeMap<String, String>,
    /// Every DNS label as declared, before any polarity rewrite.
    pub dns: BTreeMap<String, String>,
    pub wan: ZoneBatch,
    pub lan: ZoneBatch,
}

impl ClassifiedLabels {
    pub fn zone(&self, zone: Zone) -> &ZoneBatch {
        match zone {
            Zone::Wan => &self.wan,
            Zone::Lan => &self.lan,
        }
    }

    fn zone_mut(&mut self, zone: Zone) -> &mut ZoneBatch {
        match zone {
            Zone::Wan => &mut self.wan,
            Zone::Lan => &mut self.lan,
        }
    }

    /// All labels that matched one of the two families.
    pub fn matched(&self) -> BTreeMap<String, String> {
        self.routing
            .iter()
            .chain(self.dns.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Partition a container's labels.  For an inactive container the
/// statements keep their text but `update add` becomes `update delete`, so
/// the records published at start are revoked at teardown.
pub fn classify(labels: &Labels, is_active: bool) -> ClassifiedLabels {
    let mut out = ClassifiedLabels::default();

    for (key, value) in labels {
        if starts_with_ignore_case(key, ROUTING_PREFIX) {
            out.routing.insert(key.clone(), value.clone());
            continue;
        }
        if !starts_with_ignore_case(key, DNS_PREFIX) {
            continue;
        }

        out.dns.insert(key.clone(), value.clone());
        let zone = if starts_with_ignore_case(key, WAN_PREFIX) {
            Zone::Wan
        } else {
            Zone::Lan
        };
        let batch = out.zone_mut(zone);

        if ends_with_ignore_case(key, SERVER_SUFFIX) {
            batch.server = value.clone();
        } else if ends_with_ignore_case(key, KEY_SUFFIX) {
            batch.key = value.clone();
        } else if is_active {
            batch.commands.push(value.clone());
        } else {
            batch.commands.push(revoke(value));
        }
    }

    out
}

/// Rewrite the first `update add` (any case) into `update delete`.
pub fn revoke(statement: &str) -> String {
    const ADD: &str = "update add";
    match statement.to_ascii_lowercase().find(ADD) {
        Some(at) => format!(
            "{}update delete{}",
            &statement[..at],
            &statement[at + ADD.len()..]
        ),
        None => statement.to_string(),
    }
}

fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len()
        && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

fn ends_with_ignore_case(s: &str, suffix: &str) -> bool {
    s.len() >= suffix.len()
        && s.as_bytes()[s.len() - suffix.len()..].eq_ignore_ascii_case(suffix.as_bytes())
}
