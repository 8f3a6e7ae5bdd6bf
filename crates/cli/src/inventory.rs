//! Appliance listing, live stats, primary-controller lookup and selection filters.

use std::collections::{BTreeMap, HashMap};

use ::common::api::{Appliance, ApplianceFunction, ApplianceStat, ListResponse};
use regex::{Regex, RegexBuilder};
use semver::Version;
use uuid::Uuid;

use crate::error::{ApiError, Classify, ErrorKind};
use crate::transport::ApiClient;

pub const MIN_BACKUP_VERSION: Version = Version::new(5, 5, 0);

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("no controller matches the configured host '{0}'")]
    PrimaryNotFound(String),
    #[error("no appliance matches the local host '{0}'")]
    CurrentNotFound(String),
    #[error("unknown appliance id {0}")]
    UnknownId(Uuid),
    #[error("invalid filter '{0}': {1}")]
    InvalidFilter(String, String),
    #[error("No appliances matched the selection")]
    EmptySelection,
    #[error("primary controller runs {found}; backup requires {minimum} or newer")]
    VersionTooOld { found: String, minimum: Version },
    #[error("could not determine the primary controller version")]
    VersionUnknown,
    #[error("{0}")]
    Api(#[from] ApiError),
}

impl Classify for InventoryError {
    fn kind(&self) -> ErrorKind {
        match self {
            InventoryError::PrimaryNotFound(_)
            | InventoryError::CurrentNotFound(_)
            | InventoryError::UnknownId(_) => ErrorKind::NotFound,
            InventoryError::Api(err) => err.kind(),
            _ => ErrorKind::Validation,
        }
    }
}

/// An appliance joined with its stat entry, when the stats call reported one.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub appliance: Appliance,
    pub stat: Option<ApplianceStat>,
}

impl Member {
    pub fn id(&self) -> Uuid {
        self.appliance.id
    }

    pub fn name(&self) -> &str {
        &self.appliance.name
    }

    pub fn is_online(&self) -> bool {
        self.appliance.activated && self.stat.as_ref().is_some_and(ApplianceStat::is_online)
    }

    pub fn version(&self) -> Option<&str> {
        self.stat.as_ref().and_then(|s| s.version.as_deref())
    }

    /// Appliances without an admin interface fall back to the peer interface.
    pub fn is_legacy(&self) -> bool {
        self.appliance.admin_interface.is_none()
    }
}

#[derive(Clone)]
pub struct Inventory {
    api: ApiClient,
}

impl Inventory {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    pub async fn list(&self) -> Result<Vec<Appliance>, ApiError> {
        let res: ListResponse<Appliance> = self.api.get("/appliances").await?;
        Ok(res.data)
    }

    pub async fn stats(&self) -> Result<Vec<ApplianceStat>, ApiError> {
        let res: ListResponse<ApplianceStat> = self.api.get("/stats/appliances").await?;
        Ok(res.data)
    }

    /// `list ⨝ stats` by appliance id; appliances without stats keep `stat = None`.
    pub async fn joined(&self) -> Result<Vec<Member>, ApiError> {
        let (appliances, stats) = tokio::try_join!(self.list(), self.stats())?;
        Ok(join(appliances, stats))
    }
}

pub fn join(appliances: Vec<Appliance>, stats: Vec<ApplianceStat>) -> Vec<Member> {
    let mut by_id: HashMap<Uuid, ApplianceStat> = stats.into_iter().map(|s| (s.id, s)).collect();
    appliances
        .into_iter()
        .map(|appliance| {
            let stat = by_id.remove(&appliance.id);
            Member { appliance, stat }
        })
        .collect()
}

/// The enabled controller whose admin hostname (or, for legacy appliances, peer or
/// plain hostname) matches the configured host.
pub fn find_primary<'a>(members: &'a [Member], host: &str) -> Result<&'a Member, InventoryError> {
    let controllers = members.iter().filter(|m| m.appliance.is_controller());
    let mut fallback = None;
    for member in controllers {
        let appliance = &member.appliance;
        if let Some(admin) = &appliance.admin_interface {
            if admin.hostname.eq_ignore_ascii_case(host) {
                return Ok(member);
            }
            continue;
        }
        let peer = appliance
            .peer_interface
            .as_ref()
            .map(|p| p.hostname.as_str())
            .unwrap_or_default();
        if fallback.is_none()
            && (peer.eq_ignore_ascii_case(host) || appliance.hostname.eq_ignore_ascii_case(host))
        {
            fallback = Some(member);
        }
    }
    fallback.ok_or_else(|| InventoryError::PrimaryNotFound(host.to_string()))
}

/// The appliance this process runs next to, matched by hostname or admin hostname.
pub fn find_current<'a>(
    members: &'a [Member],
    local_host: &str,
) -> Result<&'a Member, InventoryError> {
    members
        .iter()
        .find(|m| {
            m.appliance.hostname.eq_ignore_ascii_case(local_host)
                || m.appliance
                    .admin_interface
                    .as_ref()
                    .is_some_and(|a| a.hostname.eq_ignore_ascii_case(local_host))
        })
        .ok_or_else(|| InventoryError::CurrentNotFound(local_host.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FilterKey {
    Name,
    Id,
    Tag,
    Hostname,
    Function,
    Version,
}

impl FilterKey {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "name" => Some(FilterKey::Name),
            "id" => Some(FilterKey::Id),
            "tag" | "tags" => Some(FilterKey::Tag),
            "hostname" | "host" => Some(FilterKey::Hostname),
            "function" | "role" => Some(FilterKey::Function),
            "version" => Some(FilterKey::Version),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Pattern(Regex),
    Exact(String),
    Function(ApplianceFunction),
}

impl Matcher {
    fn is_match(&self, candidate: &str) -> bool {
        match self {
            Matcher::Pattern(re) => re.is_match(candidate),
            Matcher::Exact(value) => value.eq_ignore_ascii_case(candidate),
            Matcher::Function(_) => false,
        }
    }
}

/// Conjunction of `key=value[,value]` clauses. Values of one key are alternatives.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    clauses: BTreeMap<FilterKey, Vec<Matcher>>,
}

impl Filter {
    /// Parses expressions such as `name=gw-.*&tag=prod` or `function=gateway,portal`.
    pub fn parse<S: AsRef<str>>(exprs: &[S]) -> Result<Self, InventoryError> {
        let mut filter = Filter::default();
        for expr in exprs {
            for clause in expr.as_ref().split('&').filter(|c| !c.trim().is_empty()) {
                let invalid = |why: &str| InventoryError::InvalidFilter(clause.to_string(), why.into());
                let (key, values) = clause
                    .split_once('=')
                    .ok_or_else(|| invalid("expected key=value"))?;
                let key = FilterKey::parse(key).ok_or_else(|| {
                    invalid("key must be one of name, id, tag, hostname, function, version")
                })?;
                for value in values.split(',').map(str::trim).filter(|v| !v.is_empty()) {
                    let matcher = match key {
                        FilterKey::Tag => Matcher::Exact(value.to_string()),
                        FilterKey::Function => Matcher::Function(
                            ApplianceFunction::parse(value)
                                .ok_or_else(|| invalid("unknown appliance function"))?,
                        ),
                        _ => Matcher::Pattern(
                            RegexBuilder::new(value)
                                .case_insensitive(true)
                                .build()
                                .map_err(|err| invalid(&err.to_string()))?,
                        ),
                    };
                    filter.clauses.entry(key).or_default().push(matcher);
                }
            }
        }
        Ok(filter)
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches(&self, member: &Member) -> bool {
        self.clauses
            .iter()
            .all(|(key, matchers)| matchers.iter().any(|m| clause_matches(*key, m, member)))
    }
}

fn clause_matches(key: FilterKey, matcher: &Matcher, member: &Member) -> bool {
    let appliance = &member.appliance;
    match key {
        FilterKey::Name => matcher.is_match(&appliance.name),
        FilterKey::Id => matcher.is_match(&appliance.id.to_string()),
        FilterKey::Tag => appliance.tags.iter().any(|t| matcher.is_match(t)),
        FilterKey::Hostname => {
            matcher.is_match(&appliance.hostname)
                || appliance
                    .admin_interface
                    .as_ref()
                    .is_some_and(|a| matcher.is_match(&a.hostname))
        }
        FilterKey::Function => match matcher {
            Matcher::Function(f) => appliance.functions().contains(f),
            _ => false,
        },
        FilterKey::Version => member.version().is_some_and(|v| matcher.is_match(v)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    PrimaryOnly,
    CurrentOnly,
    ExplicitIds(Vec<Uuid>),
}

/// What the operator asked for. `scope = None` with no include filter means "nothing chosen".
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub scope: Option<Scope>,
    pub include: Filter,
    pub exclude: Filter,
}

impl Selection {
    pub fn is_unspecified(&self) -> bool {
        self.scope.is_none() && self.include.is_empty()
    }

    /// Resolves the selection against the joined inventory.
    pub fn resolve(
        &self,
        members: &[Member],
        primary_host: &str,
        local_host: &str,
    ) -> Result<Vec<Member>, InventoryError> {
        let scoped: Vec<&Member> = match self.scope.as_ref().unwrap_or(&Scope::All) {
            Scope::All => members.iter().collect(),
            Scope::PrimaryOnly => vec![find_primary(members, primary_host)?],
            Scope::CurrentOnly => vec![find_current(members, local_host)?],
            Scope::ExplicitIds(ids) => ids
                .iter()
                .map(|id| {
                    members
                        .iter()
                        .find(|m| m.id() == *id)
                        .ok_or(InventoryError::UnknownId(*id))
                })
                .collect::<Result<_, _>>()?,
        };

        let selected: Vec<Member> = scoped
            .into_iter()
            .filter(|m| self.include.is_empty() || self.include.matches(m))
            .filter(|m| self.exclude.is_empty() || !self.exclude.matches(m))
            .cloned()
            .collect();
        if selected.is_empty() {
            return Err(InventoryError::EmptySelection);
        }
        Ok(selected)
    }
}

/// Splits members into (online, skipped).
pub fn partition_online(members: Vec<Member>) -> (Vec<Member>, Vec<Member>) {
    members.into_iter().partition(Member::is_online)
}

/// Parses appliance version strings such as `6.2.1-31234-release` or `6.1`.
pub fn parse_version(raw: &str) -> Option<Version> {
    let numeric: String = raw
        .trim()
        .trim_start_matches('v')
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts = numeric.split('.').filter(|p| !p.is_empty());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().map_or(Some(0), |p| p.parse().ok())?;
    let patch = parts.next().map_or(Some(0), |p| p.parse().ok())?;
    Some(Version::new(major, minor, patch))
}

/// Refuses orchestration when the primary controller is older than `minimum`.
pub fn check_min_version(raw: Option<&str>, minimum: &Version) -> Result<Version, InventoryError> {
    let raw = raw.ok_or(InventoryError::VersionUnknown)?;
    let found = parse_version(raw).ok_or(InventoryError::VersionUnknown)?;
    if found < *minimum {
        return Err(InventoryError::VersionTooOld {
            found: raw.to_string(),
            minimum: minimum.clone(),
        });
    }
    Ok(found)
}
