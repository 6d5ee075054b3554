//! Per-zone DNS batches.
//!
//! The statements a container declares for one zone are submitted as a
//! single transaction to that zone's server, signed with the zone's key.
//! In verify mode every `update add` statement is first checked against
//! the zone server, and statements whose value is already published are
//! dropped so steady-state sweeps do not re-assert unchanged records.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info};

use crate::error::Result;
use crate::labels::{ClassifiedLabels, Zone, ZoneBatch};

/// Answers `name`/`record_type` queries against a given server.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// The records currently published, rendered as text.  No records is an
    /// empty answer, not an error.
    async fn resolve(&self, server: &str, record_type: &str, name: &str) -> Result<Vec<String>>;
}

/// Applies a signed dynamic update.
#[async_trait]
pub trait Updater: Send + Sync {
    /// Send `statements` to `server` as one transaction signed with `key`.
    async fn apply(&self, server: &str, key: &str, statements: &[String]) -> Result<()>;
}

/// Outcome of submitting one zone batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Missing server, key or statements.
    Skipped,
    /// Verify mode found every statement already in place.
    UpToDate,
    Applied(usize),
    Failed,
}

/// An `update add <name> <ttl> [IN] <type> <value>` statement.
#[derive(Debug, PartialEq, Eq)]
pub struct AddStatement<'a> {
    pub name: &'a str,
    pub record_type: &'a str,
    pub value: String,
}

impl<'a> AddStatement<'a> {
    pub fn parse(statement: &'a str) -> Option<Self> {
        let mut tokens = statement.split_whitespace();
        if !tokens.next()?.eq_ignore_ascii_case("update") || !tokens.next()?.eq_ignore_ascii_case("add") {
            return None;
        }
        let name = tokens.next()?;
        let ttl = tokens.next()?;
        if !ttl.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let mut record_type = tokens.next()?;
        if record_type.eq_ignore_ascii_case("IN") {
            record_type = tokens.next()?;
        }
        let value = tokens.collect::<Vec<_>>().join(" ");
        if value.is_empty() {
            return None;
        }
        Some(Self {
            name,
            record_type,
            value,
        })
    }

    /// Whether `answers` already contain this statement's value.
    pub fn is_answered_by(&self, answers: &[String]) -> bool {
        let wanted = normalize(&self.value);
        answers.iter().any(|answer| normalize(answer) == wanted)
    }
}

fn normalize(value: &str) -> String {
    value
        .trim()
        .trim_matches('"')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

pub struct DnsBatcher {
    resolver: Arc<dyn Resolver>,
    updater: Arc<dyn Updater>,
    verify: bool,
}

impl DnsBatcher {
    pub fn new(resolver: Arc<dyn Resolver>, updater: Arc<dyn Updater>, verify: bool) -> Self {
        Self {
            resolver,
            updater,
            verify,
        }
    }

    /// Submit the WAN and LAN batches independently.
    pub async fn submit_all(&self, labels: &ClassifiedLabels) -> [Submission; 2] {
        let (wan, lan) = tokio::join!(
            self.submit(Zone::Wan, labels.zone(Zone::Wan)),
            self.submit(Zone::Lan, labels.zone(Zone::Lan))
        );
        [wan, lan]
    }

    pub async fn submit(&self, zone: Zone, batch: &ZoneBatch) -> Submission {
        if !batch.is_eligible() {
            if !batch.commands.is_empty() {
                debug!(
                    "{} batch with {} statements lacks server or key, not submitted",
                    zone.as_str(),
                    batch.commands.len()
                );
            }
            return Submission::Skipped;
        }

        let mut commands = Vec::with_capacity(batch.commands.len());
        for command in &batch.commands {
            if self.verify && self.is_published(&batch.server, command).await {
                debug!("{} already current: {}", zone.as_str(), command);
                continue;
            }
            commands.push(command.clone());
        }
        if commands.is_empty() {
            return Submission::UpToDate;
        }

        match self.updater.apply(&batch.server, &batch.key, &commands).await {
            Ok(()) => {
                info!(
                    "{} update applied on [{}]: {} statements",
                    zone.as_str(),
                    batch.server,
                    commands.len()
                );
                Submission::Applied(commands.len())
            }
            Err(e) => {
                error!("{} update on [{}] failed: {}", zone.as_str(), batch.server, e);
                Submission::Failed
            }
        }
    }

    /// A resolver failure counts as "not published" so the statement is
    /// still sent.
    async fn is_published(&self, server: &str, command: &str) -> bool {
        let Some(add) = AddStatement::parse(command) else {
            return false;
        };
        match self.resolver.resolve(server, add.record_type, add.name).await {
            Ok(answers) => add.is_answered_by(&answers),
            Err(e) => {
                debug!("verify lookup of {} {} failed: {}", add.name, add.record_type, e);
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::error::Error;

    /// Resolver answering from a fixed table keyed by `(name, type)`.
    #[derive(Default)]
    pub struct StaticResolver {
        pub records: Mutex<HashMap<(String, String), Vec<String>>>,
        pub unreachable: bool,
    }

    impl StaticResolver {
        pub fn with(name: &str, record_type: &str, answers: &[&str]) -> Self {
            let resolver = Self::default();
            resolver.records.lock().unwrap().insert(
                (name.to_string(), record_type.to_ascii_uppercase()),
                answers.iter().map(|a| a.to_string()).collect(),
            );
            resolver
        }
    }

    #[async_trait]
    impl Resolver for StaticResolver {
        async fn resolve(&self, _server: &str, record_type: &str, name: &str) -> Result<Vec<String>> {
            if self.unreachable {
                return Err(Error::Unavailable("no servers could be reached".into()));
            }
            Ok(self
                .records
                .lock()
                .unwrap()
                .get(&(name.to_string(), record_type.to_ascii_uppercase()))
                .cloned()
                .unwrap_or_default())
        }
    }

    /// Updater recording every transaction it is given.
    #[derive(Default)]
    pub struct RecordingUpdater {
        pub applied: Mutex<Vec<(String, String, Vec<String>)>>,
        pub fail: bool,
    }

    impl RecordingUpdater {
        pub fn transactions(&self) -> Vec<(String, String, Vec<String>)> {
            self.applied.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Updater for RecordingUpdater {
        async fn apply(&self, server: &str, key: &str, statements: &[String]) -> Result<()> {
            if self.fail {
                return Err(Error::Update("REFUSED".into()));
            }
            self.applied
                .lock()
                .unwrap()
                .push((server.to_string(), key.to_string(), statements.to_vec()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{RecordingUpdater, StaticResolver};
    use super::*;

    fn batch(commands: &[&str]) -> ZoneBatch {
        ZoneBatch {
            server: "10.0.0.1".into(),
            key: "abc".into(),
            commands: commands.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn batcher(resolver: StaticResolver, verify: bool) -> (DnsBatcher, Arc<RecordingUpdater>) {
        let updater = Arc::new(RecordingUpdater::default());
        let batcher = DnsBatcher::new(Arc::new(resolver), updater.clone(), verify);
        (batcher, updater)
    }

    #[test]
    fn parses_add_statements() {
        let add = AddStatement::parse("update add host.lan 300 A 10.0.0.2").unwrap();
        assert_eq!(add.name, "host.lan");
        assert_eq!(add.record_type, "A");
        assert_eq!(add.value, "10.0.0.2");

        let add = AddStatement::parse("UPDATE ADD txt.lan 60 IN TXT \"hello world\"").unwrap();
        assert_eq!(add.record_type, "TXT");
        assert_eq!(add.value, "\"hello world\"");

        assert!(AddStatement::parse("update delete host.lan 300 A 10.0.0.2").is_none());
        assert!(AddStatement::parse("update add host.lan A 10.0.0.2").is_none());
        assert!(AddStatement::parse("update add host.lan 300 A").is_none());
    }

    #[test]
    fn answers_are_compared_per_record() {
        let add = AddStatement::parse("update add www.lan 300 CNAME Host.LAN").unwrap();
        assert!(add.is_answered_by(&["host.lan.".to_string()]));

        let add = AddStatement::parse("update add host.lan 300 A 10.0.0.2").unwrap();
        assert!(!add.is_answered_by(&["10.0.0.20".to_string()]));
        assert!(add.is_answered_by(&["10.0.0.9".to_string(), "10.0.0.2".to_string()]));
    }

    #[tokio::test]
    async fn batch_without_server_or_key_is_never_submitted() {
        let (dns, updater) = batcher(StaticResolver::default(), false);
        let mut no_server = batch(&["update add host.lan 300 A 10.0.0.2"]);
        no_server.server.clear();
        let mut no_key = batch(&["update add host.lan 300 A 10.0.0.2"]);
        no_key.key.clear();

        assert_eq!(dns.submit(Zone::Lan, &no_server).await, Submission::Skipped);
        assert_eq!(dns.submit(Zone::Lan, &no_key).await, Submission::Skipped);
        assert_eq!(dns.submit(Zone::Lan, &batch(&[])).await, Submission::Skipped);
        assert!(updater.transactions().is_empty());
    }

    #[tokio::test]
    async fn statements_are_submitted_in_order_as_one_transaction() {
        let (dns, updater) = batcher(StaticResolver::default(), false);
        let b = batch(&[
            "update add host.lan 300 A 10.0.0.2",
            "update add www.lan 300 CNAME host.lan",
        ]);
        assert_eq!(dns.submit(Zone::Lan, &b).await, Submission::Applied(2));
        assert_eq!(
            updater.transactions(),
            vec![("10.0.0.1".to_string(), "abc".to_string(), b.commands.clone())]
        );
    }

    #[tokio::test]
    async fn verify_mode_drops_published_records_only() {
        let resolver = StaticResolver::with("host.lan", "A", &["10.0.0.2"]);
        let (dns, updater) = batcher(resolver, true);
        let b = batch(&[
            "update add host.lan 300 A 10.0.0.2",
            "update add other.lan 300 A 10.0.0.3",
            "update delete gone.lan A",
        ]);

        assert_eq!(dns.submit(Zone::Lan, &b).await, Submission::Applied(2));
        let (_, _, statements) = updater.transactions().remove(0);
        assert_eq!(
            statements,
            vec!["update add other.lan 300 A 10.0.0.3", "update delete gone.lan A"]
        );
    }

    #[tokio::test]
    async fn verify_mode_keeps_statements_when_resolver_is_down() {
        let resolver = StaticResolver {
            unreachable: true,
            ..Default::default()
        };
        let (dns, updater) = batcher(resolver, true);
        let b = batch(&["update add host.lan 300 A 10.0.0.2"]);
        assert_eq!(dns.submit(Zone::Lan, &b).await, Submission::Applied(1));
        assert_eq!(updater.transactions().len(), 1);
    }

    #[tokio::test]
    async fn failed_zone_does_not_affect_the_other() {
        let updater = Arc::new(RecordingUpdater {
            fail: true,
            ..Default::default()
        });
        let dns = DnsBatcher::new(Arc::new(StaticResolver::default()), updater, false);
        let labels = ClassifiedLabels {
            wan: batch(&["update add www.example.com 300 A 1.2.3.4"]),
            ..Default::default()
        };
        assert_eq!(
            dns.submit_all(&labels).await,
            [Submission::Failed, Submission::Skipped]
        );
    }
}
