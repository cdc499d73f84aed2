use std::{
    collections::{BTreeSet, HashMap},
    net::{IpAddr, SocketAddr},
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use chrono::{DateTime, Duration, Utc};
use hickory_proto::{
    op::{Message, MessageType},
    rr::{RData, RecordType},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use super::{
    IpVersion,
    selector::{FqdnSelector, to_fqdn},
};
use crate::error::NftwallError;

const SET_NAME_PREFIX: &str = "fqdn_";
const MAX_SET_LABEL_LEN: usize = 48;

/// A named nftables set backing one (FQDN, IP version) pair, as published in policy status
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpSet {
    pub fqdn: String,
    pub set_name: String,
    pub ips: Vec<IpAddr>,
    pub expiration_time: DateTime<Utc>,
    pub version: IpVersion,
}

/// DNS cache abstraction consumed by the rule compiler and the DNS proxy
#[cfg_attr(test, automock)]
pub trait FqdnCache: Send + Sync {
    /// Record the answers of an observed DNS response; returns whether any set changed
    fn update(&self, observed_at: DateTime<Utc>, response: &Message) -> Result<bool, NftwallError>;

    /// Sets currently backing the names matched by `selector`
    fn get_sets_for_fqdn(&self, selector: &FqdnSelector, for_persist: bool) -> Vec<IpSet>;

    /// Every live set, for the set declarations of the rendered ruleset
    fn get_sets_for_rendering(&self) -> Vec<IpSet>;

    fn update_dns_server_addr(&self, addr: SocketAddr);

    fn dns_server_addr(&self) -> SocketAddr;
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct SetRecord {
    set_name: String,
    ips: BTreeSet<IpAddr>,
    expiration: DateTime<Utc>,
}

impl SetRecord {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expiration > now
    }

    fn to_ip_set(&self, fqdn: &str, version: IpVersion) -> IpSet {
        IpSet {
            fqdn: fqdn.to_string(),
            set_name: self.set_name.clone(),
            ips: self.ips.iter().copied().collect(),
            expiration_time: self.expiration,
            version,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct CacheEntry {
    v4: Option<SetRecord>,
    v6: Option<SetRecord>,
}

impl CacheEntry {
    fn record(&self, version: IpVersion) -> Option<&SetRecord> {
        match version {
            IpVersion::V4 => self.v4.as_ref(),
            IpVersion::V6 => self.v6.as_ref(),
        }
    }

    fn record_mut(&mut self, version: IpVersion) -> &mut Option<SetRecord> {
        match version {
            IpVersion::V4 => &mut self.v4,
            IpVersion::V6 => &mut self.v6,
        }
    }

    fn live_sets(&self, fqdn: &str, now: DateTime<Utc>) -> impl Iterator<Item = IpSet> {
        [(IpVersion::V4, &self.v4), (IpVersion::V6, &self.v6)]
            .into_iter()
            .filter_map(move |(version, record)| {
                record
                    .as_ref()
                    .filter(|record| record.is_live(now))
                    .map(|record| record.to_ip_set(fqdn, version))
            })
    }

    fn is_empty(&self) -> bool {
        self.v4.is_none() && self.v6.is_none()
    }
}

/// Registry of allocated set names; a name is owned by exactly one (FQDN, version)
#[derive(Debug, Default)]
struct SetNames {
    by_owner: HashMap<(String, IpVersion), String>,
    owners: HashMap<String, (String, IpVersion)>,
}

impl SetNames {
    /// Return the name owned by the pair, allocating a fresh one on first use
    fn register(&mut self, fqdn: &str, version: IpVersion) -> String {
        let owner = (fqdn.to_string(), version);
        if let Some(name) = self.by_owner.get(&owner) {
            return name.clone();
        }

        let base = derive_set_name(fqdn, version);
        let mut candidate = base.clone();
        let mut suffix = 1;
        while self.owners.contains_key(&candidate) {
            candidate = format!("{base}_{suffix}");
            suffix += 1;
        }

        self.owners.insert(candidate.clone(), owner.clone());
        self.by_owner.insert(owner, candidate.clone());
        candidate
    }

    /// Release every pair for which `keep` returns false; returns the number released
    fn retain<F: Fn(&str, IpVersion) -> bool>(&mut self, keep: F) -> usize {
        let before = self.by_owner.len();
        self.by_owner.retain(|(fqdn, version), _| keep(fqdn, *version));
        self.owners.retain(|_, (fqdn, version)| keep(fqdn, *version));
        before - self.by_owner.len()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.by_owner.len()
    }

    /// Claim an existing name for a pair; fails if another pair already owns it
    fn adopt(&mut self, name: &str, fqdn: &str, version: IpVersion) -> bool {
        let owner = (fqdn.to_string(), version);
        match self.owners.get(name) {
            Some(existing) => *existing == owner,
            None => {
                if self.by_owner.contains_key(&owner) {
                    return false;
                }
                self.owners.insert(name.to_string(), owner.clone());
                self.by_owner.insert(owner, name.to_string());
                true
            }
        }
    }
}

/// Base set name for a pair: "fqdn_<label>_<v4|v6>" with non-alphanumerics replaced by '_'
fn derive_set_name(fqdn: &str, version: IpVersion) -> String {
    let label: String = fqdn
        .trim_end_matches('.')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .take(MAX_SET_LABEL_LEN)
        .collect();
    format!("{SET_NAME_PREFIX}{label}_{}", version.suffix())
}

enum NameMatcher {
    Exact(String),
    Pattern(Regex),
}

impl NameMatcher {
    fn new(selector: &FqdnSelector) -> Result<Self, NftwallError> {
        if selector.is_exact() {
            Ok(Self::Exact(to_fqdn(selector.get_name())))
        } else {
            selector.get_regex().map(Self::Pattern)
        }
    }

    fn matches(&self, fqdn: &str) -> bool {
        match self {
            Self::Exact(name) => name == fqdn,
            Self::Pattern(regex) => regex.is_match(fqdn),
        }
    }
}

/// Answers extracted from one DNS response
struct Observation {
    name: String,
    question_type: Option<RecordType>,
    v4: Vec<(IpAddr, u32)>,
    v6: Vec<(IpAddr, u32)>,
}

impl Observation {
    fn from_message(response: &Message) -> Result<Self, NftwallError> {
        if response.message_type() != MessageType::Response {
            return Err(NftwallError::MalformedResponse {
                reason: "message is not a response".to_string(),
            });
        }
        if response.answers().is_empty() {
            return Err(NftwallError::MalformedResponse {
                reason: "no answer records".to_string(),
            });
        }

        let question = response.queries().first();
        let owner = question
            .map(|query| query.name())
            .unwrap_or_else(|| response.answers()[0].name());
        let name = to_fqdn(&owner.to_ascii());
        if name == "." {
            return Err(NftwallError::MalformedResponse {
                reason: "answered name is empty".to_string(),
            });
        }

        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        for record in response.answers() {
            match record.data() {
                RData::A(a) => v4.push((IpAddr::V4(a.0), record.ttl())),
                RData::AAAA(aaaa) => v6.push((IpAddr::V6(aaaa.0), record.ttl())),
                _ => {}
            }
        }

        Ok(Self {
            name,
            question_type: question.map(|query| query.query_type()),
            v4,
            v6,
        })
    }

    fn answers(&self, version: IpVersion) -> &[(IpAddr, u32)] {
        match version {
            IpVersion::V4 => &self.v4,
            IpVersion::V6 => &self.v6,
        }
    }

    fn asked_for(&self, version: IpVersion) -> bool {
        matches!(
            (self.question_type, version),
            (Some(RecordType::A), IpVersion::V4) | (Some(RecordType::AAAA), IpVersion::V6)
        )
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    names: SetNames,
    restored: Vec<IpSet>,
}

impl CacheState {
    fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            for version in [IpVersion::V4, IpVersion::V6] {
                let slot = entry.record_mut(version);
                if slot.as_ref().is_some_and(|record| !record.is_live(now)) {
                    *slot = None;
                    removed += 1;
                }
            }
            !entry.is_empty()
        });

        let before = self.restored.len();
        self.restored.retain(|set| set.expiration_time > now);
        removed += before - self.restored.len();

        // Names are only pinned while a record or restored set still declares them
        let entries = &self.entries;
        let restored = &self.restored;
        let released = self.names.retain(|fqdn, version| {
            entries
                .get(fqdn)
                .is_some_and(|entry| entry.record(version).is_some())
                || restored
                    .iter()
                    .any(|set| set.fqdn == fqdn && set.version == version)
        });
        if released > 0 {
            log::debug!("Released {released} unused set names");
        }
        removed
    }
}

/// In-memory FQDN to address-set cache shared by the DNS proxy and the rule compiler
///
/// All map state sits behind one `RwLock`: updates take the write guard,
/// lookups take the read guard. Expired records are filtered on read and
/// purged on write.
#[derive(Debug)]
pub struct DnsCache {
    state: RwLock<CacheState>,
    dns_server_addr: RwLock<SocketAddr>,
}

impl DnsCache {
    pub fn new(dns_server_addr: SocketAddr) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            dns_server_addr: RwLock::new(dns_server_addr),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed the cache with sets persisted by a previous run
    ///
    /// Restored set names are claimed in the registry so a later DNS answer
    /// for the same (FQDN, version) keeps the name the kernel already knows.
    /// Sets whose name is owned by another pair are skipped. Returns the
    /// number of sets restored.
    pub fn restore<I: IntoIterator<Item = IpSet>>(&self, sets: I) -> usize {
        let mut state = self.write();
        let mut restored = 0;
        for mut set in sets {
            set.fqdn = to_fqdn(&set.fqdn);
            if !state.names.adopt(&set.set_name, &set.fqdn, set.version) {
                log::warn!(
                    "Skipping restored set {} for {}: name already in use",
                    set.set_name,
                    set.fqdn
                );
                continue;
            }
            let duplicate = state
                .restored
                .iter()
                .any(|existing| existing.set_name == set.set_name);
            if !duplicate {
                state.restored.push(set);
                restored += 1;
            }
        }
        restored
    }

    /// Apply a DNS response observed at `observed_at`
    ///
    /// # Behavior
    /// 1. Rejects non-responses and responses without answers, leaving the cache untouched
    /// 2. Keys the entry by the question name (fully qualified, lower-cased)
    /// 3. For each IP version with addresses, reuses or allocates the set name,
    ///    replaces the members and sets the expiration to
    ///    `observed_at + min(TTL)` of that version's records
    /// 4. A version that was asked for but came back without addresses has its
    ///    members cleared; the record itself lives until its TTL lapses
    ///
    /// Returns `true` when a record was created or its members changed.
    pub fn apply_response(
        &self,
        observed_at: DateTime<Utc>,
        response: &Message,
    ) -> Result<bool, NftwallError> {
        let observation = Observation::from_message(response)?;

        let mut guard = self.write();
        let state = &mut *guard;
        state.purge_expired(observed_at);

        let mut changed = false;
        for version in [IpVersion::V4, IpVersion::V6] {
            let answers = observation.answers(version);

            if answers.is_empty() {
                if observation.asked_for(version)
                    && let Some(record) = state
                        .entries
                        .get_mut(&observation.name)
                        .and_then(|entry| entry.record_mut(version).as_mut())
                    && !record.ips.is_empty()
                {
                    record.ips.clear();
                    changed = true;
                }
                continue;
            }

            let ttl = answers.iter().map(|(_, ttl)| *ttl).min().unwrap_or_default();
            let expiration = observed_at + Duration::seconds(i64::from(ttl));
            let ips: BTreeSet<IpAddr> = answers.iter().map(|(ip, _)| *ip).collect();

            let set_name = state.names.register(&observation.name, version);
            state
                .restored
                .retain(|set| !(set.fqdn == observation.name && set.version == version));

            let slot = state
                .entries
                .entry(observation.name.clone())
                .or_default()
                .record_mut(version);
            if let Some(record) = slot.as_mut() {
                if record.ips != ips {
                    record.ips = ips;
                    changed = true;
                }
                record.expiration = expiration;
            } else {
                *slot = Some(SetRecord {
                    set_name,
                    ips,
                    expiration,
                });
                changed = true;
            }
        }

        if changed {
            log::debug!("DNS cache updated for {}", observation.name);
        }
        Ok(changed)
    }

    /// Sets backing the names matched by `selector` that are still live at `now`
    ///
    /// Exact names are looked up directly; patterns scan every cached name.
    /// With `for_persist`, still-valid restored sets fill in pairs the live
    /// cache has not seen again yet. Sorted by (FQDN, version).
    pub fn sets_for_fqdn_at(
        &self,
        selector: &FqdnSelector,
        for_persist: bool,
        now: DateTime<Utc>,
    ) -> Vec<IpSet> {
        let matcher = match NameMatcher::new(selector) {
            Ok(matcher) => matcher,
            Err(err) => {
                log::warn!("Ignoring FQDN selector {}: {err}", selector.get_name());
                return Vec::new();
            }
        };

        let state = self.read();
        let mut sets: Vec<IpSet> = match &matcher {
            NameMatcher::Exact(fqdn) => state
                .entries
                .get(fqdn)
                .map(|entry| entry.live_sets(fqdn, now).collect())
                .unwrap_or_default(),
            NameMatcher::Pattern(_) => state
                .entries
                .iter()
                .filter(|(fqdn, _)| matcher.matches(fqdn))
                .flat_map(|(fqdn, entry)| entry.live_sets(fqdn, now))
                .collect(),
        };

        if for_persist {
            for restored in &state.restored {
                if restored.expiration_time <= now || !matcher.matches(&restored.fqdn) {
                    continue;
                }
                let shadowed = sets
                    .iter()
                    .any(|set| set.fqdn == restored.fqdn && set.version == restored.version);
                if !shadowed {
                    sets.push(restored.clone());
                }
            }
        }

        sets.sort_by(|a, b| (&a.fqdn, a.version).cmp(&(&b.fqdn, b.version)));
        sets
    }

    /// Every set live at `now`, sorted and deduplicated by set name
    pub fn sets_for_rendering_at(&self, now: DateTime<Utc>) -> Vec<IpSet> {
        let state = self.read();
        let mut sets: Vec<IpSet> = state
            .entries
            .iter()
            .flat_map(|(fqdn, entry)| entry.live_sets(fqdn, now))
            .collect();
        sets.extend(
            state
                .restored
                .iter()
                .filter(|set| set.expiration_time > now)
                .cloned(),
        );

        sets.sort_by(|a, b| a.set_name.cmp(&b.set_name));
        sets.dedup_by(|a, b| a.set_name == b.set_name);
        sets
    }

    /// Read view with the clock pinned to `now`
    pub fn at(&self, now: DateTime<Utc>) -> CacheAt<'_> {
        CacheAt { cache: self, now }
    }

    /// Drop records whose TTL has lapsed and release the set names nothing declares anymore
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        self.write().purge_expired(now)
    }
}

impl FqdnCache for DnsCache {
    fn update(&self, observed_at: DateTime<Utc>, response: &Message) -> Result<bool, NftwallError> {
        self.apply_response(observed_at, response)
    }

    fn get_sets_for_fqdn(&self, selector: &FqdnSelector, for_persist: bool) -> Vec<IpSet> {
        self.sets_for_fqdn_at(selector, for_persist, Utc::now())
    }

    fn get_sets_for_rendering(&self) -> Vec<IpSet> {
        self.sets_for_rendering_at(Utc::now())
    }

    fn update_dns_server_addr(&self, addr: SocketAddr) {
        let mut current = self
            .dns_server_addr
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if *current != addr {
            log::info!("DNS upstream changed from {} to {}", *current, addr);
            *current = addr;
        }
    }

    fn dns_server_addr(&self) -> SocketAddr {
        *self
            .dns_server_addr
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A [`DnsCache`] whose lookups all use one instant
///
/// Compiling and rendering through the same view see the same live records,
/// so every set a rule references is also declared.
#[derive(Debug, Clone, Copy)]
pub struct CacheAt<'a> {
    cache: &'a DnsCache,
    now: DateTime<Utc>,
}

impl FqdnCache for CacheAt<'_> {
    fn update(&self, observed_at: DateTime<Utc>, response: &Message) -> Result<bool, NftwallError> {
        self.cache.apply_response(observed_at, response)
    }

    fn get_sets_for_fqdn(&self, selector: &FqdnSelector, for_persist: bool) -> Vec<IpSet> {
        self.cache.sets_for_fqdn_at(selector, for_persist, self.now)
    }

    fn get_sets_for_rendering(&self) -> Vec<IpSet> {
        self.cache.sets_for_rendering_at(self.now)
    }

    fn update_dns_server_addr(&self, addr: SocketAddr) {
        self.cache.update_dns_server_addr(addr);
    }

    fn dns_server_addr(&self) -> SocketAddr {
        self.cache.dns_server_addr()
    }
}
