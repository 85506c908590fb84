/**
 * TOPOLOGY STORE - Failover segments and their member hosts
 *
 * ROLE:
 * Read access to the cluster topology the recovery decisions depend on: which
 * segment a failed host belongs to and which recovery method that segment uses.
 *
 * QUERIES:
 * - `HostQuery::from_params` / `SegmentQuery::from_params` turn raw API parameters
 *   into a validated query (filters, sort keys/dirs, limit, marker) before any
 *   store access
 * - `id` is the registration order; hosts default to `id asc`, segments to `name asc`
 * - Paging is keyset-style: the marker is the uuid of the last entry already seen
 * - Results are always totally ordered (uuid is the final tie-breaker)
 */

use crate::config::SegmentConfig;
use crate::models::{FailoverSegment, Host, RecoveryMethod};
use parking_lot::RwLock;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

pub const DEFAULT_PAGE_LIMIT: usize = 1000;
pub const MAX_PAGE_LIMIT: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("marker {0} could not be found")]
    MarkerNotFound(String),
    #[error("failover segment {0} could not be found")]
    SegmentNotFound(Uuid),
    #[error("host {0} could not be found")]
    HostNotFound(Uuid),
    #[error("failover segment {0} already exists")]
    SegmentExists(Uuid),
    #[error("host '{name}' already exists in segment {segment}")]
    HostExists { name: String, segment: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    /// Registration order
    Id,
    Uuid,
    Name,
    Type,
    Reserved,
    OnMaintenance,
}

impl FromStr for SortKey {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "id" => Ok(SortKey::Id),
            "uuid" => Ok(SortKey::Uuid),
            "name" => Ok(SortKey::Name),
            "type" => Ok(SortKey::Type),
            "reserved" => Ok(SortKey::Reserved),
            "on_maintenance" => Ok(SortKey::OnMaintenance),
            other => Err(TopologyError::InvalidInput(format!("unknown sort key '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentSortKey {
    /// Registration order
    Id,
    Uuid,
    Name,
    ServiceType,
    RecoveryMethod,
}

impl FromStr for SegmentSortKey {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "id" => Ok(SegmentSortKey::Id),
            "uuid" => Ok(SegmentSortKey::Uuid),
            "name" => Ok(SegmentSortKey::Name),
            "service_type" => Ok(SegmentSortKey::ServiceType),
            "recovery_method" => Ok(SegmentSortKey::RecoveryMethod),
            other => Err(TopologyError::InvalidInput(format!("unknown sort key '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

impl SortDir {
    fn apply(self, ord: Ordering) -> Ordering {
        match self {
            SortDir::Asc => ord,
            SortDir::Desc => ord.reverse(),
        }
    }
}

impl FromStr for SortDir {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asc" => Ok(SortDir::Asc),
            "desc" => Ok(SortDir::Desc),
            other => Err(TopologyError::InvalidInput(format!(
                "sort direction must be 'asc' or 'desc', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostFilters {
    pub host_type: Option<String>,
    pub reserved: Option<bool>,
    pub on_maintenance: Option<bool>,
}

impl HostFilters {
    fn matches(&self, host: &Host) -> bool {
        self.host_type.as_deref().map_or(true, |t| host.host_type == t)
            && self.reserved.map_or(true, |r| host.reserved == r)
            && self.on_maintenance.map_or(true, |m| host.on_maintenance == m)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostQuery {
    pub filters: HostFilters,
    pub sort: Vec<(SortKey, SortDir)>,
    pub limit: usize,
    pub marker: Option<String>,
}

impl Default for HostQuery {
    fn default() -> Self {
        Self {
            filters: HostFilters::default(),
            sort: vec![(SortKey::Id, SortDir::Asc)],
            limit: DEFAULT_PAGE_LIMIT,
            marker: None,
        }
    }
}

impl HostQuery {
    /// Validates raw query parameters. `sort_key` and `sort_dir` take comma separated
    /// lists; missing directions default to `asc`.
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, TopologyError> {
        Ok(Self {
            limit: parse_limit(params)?,
            sort: parse_sort(params, SortKey::Id)?,
            filters: HostFilters {
                host_type: params.get("type").cloned(),
                reserved: parse_bool(params, "reserved")?,
                on_maintenance: parse_bool(params, "on_maintenance")?,
            },
            marker: params.get("marker").cloned(),
        })
    }

    fn compare(&self, (ia, a): (usize, &Host), (ib, b): (usize, &Host)) -> Ordering {
        for (key, dir) in &self.sort {
            let ord = match key {
                SortKey::Id => ia.cmp(&ib),
                SortKey::Uuid => a.uuid.cmp(&b.uuid),
                SortKey::Name => a.name.cmp(&b.name),
                SortKey::Type => a.host_type.cmp(&b.host_type),
                SortKey::Reserved => a.reserved.cmp(&b.reserved),
                SortKey::OnMaintenance => a.on_maintenance.cmp(&b.on_maintenance),
            };
            let ord = dir.apply(ord);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.uuid.cmp(&b.uuid)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentFilters {
    pub recovery_method: Option<RecoveryMethod>,
    pub service_type: Option<String>,
}

impl SegmentFilters {
    fn matches(&self, segment: &FailoverSegment) -> bool {
        self.recovery_method.map_or(true, |m| segment.recovery_method == m)
            && self.service_type.as_deref().map_or(true, |t| segment.service_type == t)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentQuery {
    pub filters: SegmentFilters,
    pub sort: Vec<(SegmentSortKey, SortDir)>,
    pub limit: usize,
    pub marker: Option<String>,
}

impl Default for SegmentQuery {
    fn default() -> Self {
        Self {
            filters: SegmentFilters::default(),
            sort: vec![(SegmentSortKey::Name, SortDir::Asc)],
            limit: DEFAULT_PAGE_LIMIT,
            marker: None,
        }
    }
}

impl SegmentQuery {
    /// Same rules as [`HostQuery::from_params`], with segment filters and sort keys
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, TopologyError> {
        let recovery_method = params
            .get("recovery_method")
            .map(|raw| raw.parse::<RecoveryMethod>())
            .transpose()
            .map_err(|e| TopologyError::InvalidInput(e.to_string()))?;

        Ok(Self {
            limit: parse_limit(params)?,
            sort: parse_sort(params, SegmentSortKey::Name)?,
            filters: SegmentFilters { recovery_method, service_type: params.get("service_type").cloned() },
            marker: params.get("marker").cloned(),
        })
    }

    fn compare(&self, (ia, a): (usize, &FailoverSegment), (ib, b): (usize, &FailoverSegment)) -> Ordering {
        for (key, dir) in &self.sort {
            let ord = match key {
                SegmentSortKey::Id => ia.cmp(&ib),
                SegmentSortKey::Uuid => a.uuid.cmp(&b.uuid),
                SegmentSortKey::Name => a.name.cmp(&b.name),
                SegmentSortKey::ServiceType => a.service_type.cmp(&b.service_type),
                SegmentSortKey::RecoveryMethod => a.recovery_method.as_str().cmp(b.recovery_method.as_str()),
            };
            let ord = dir.apply(ord);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.uuid.cmp(&b.uuid)
    }
}

fn parse_limit(params: &HashMap<String, String>) -> Result<usize, TopologyError> {
    let Some(raw) = params.get("limit") else { return Ok(DEFAULT_PAGE_LIMIT) };
    let limit: i64 = raw
        .trim()
        .parse()
        .map_err(|_| TopologyError::InvalidInput(format!("limit must be an integer, got '{raw}'")))?;
    if limit < 0 {
        return Err(TopologyError::InvalidInput("limit must be >= 0".into()));
    }
    Ok(usize::try_from(limit).unwrap_or(MAX_PAGE_LIMIT).min(MAX_PAGE_LIMIT))
}

/// A lone `sort_dir` applies to `default`
fn parse_sort<K>(params: &HashMap<String, String>, default: K) -> Result<Vec<(K, SortDir)>, TopologyError>
where
    K: FromStr<Err = TopologyError> + Copy,
{
    let keys = split_list(params.get("sort_key"))
        .map(|k| k.parse::<K>())
        .collect::<Result<Vec<_>, _>>()?;
    let dirs = split_list(params.get("sort_dir"))
        .map(|d| d.parse::<SortDir>())
        .collect::<Result<Vec<_>, _>>()?;
    if dirs.len() > keys.len().max(1) {
        return Err(TopologyError::InvalidInput("more sort directions than sort keys".into()));
    }
    if keys.is_empty() {
        return Ok(vec![(default, dirs.first().copied().unwrap_or(SortDir::Asc))]);
    }
    Ok(keys
        .into_iter()
        .enumerate()
        .map(|(i, key)| (key, dirs.get(i).copied().unwrap_or(SortDir::Asc)))
        .collect())
}

fn split_list(raw: Option<&String>) -> impl Iterator<Item = &str> {
    raw.map(String::as_str)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn parse_bool(params: &HashMap<String, String>, name: &str) -> Result<Option<bool>, TopologyError> {
    params
        .get(name)
        .map(|raw| match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(TopologyError::InvalidInput(format!("{name} must be a boolean, got '{raw}'"))),
        })
        .transpose()
}

/// Cuts one page out of an already sorted list
fn paginate<T: Clone>(
    sorted: &[&T],
    marker: Option<&String>,
    limit: usize,
    uuid_of: impl Fn(&T) -> Uuid,
) -> Result<(Vec<T>, Option<Uuid>), TopologyError> {
    let start = match marker {
        None => 0,
        Some(marker) => {
            let position = Uuid::parse_str(marker)
                .ok()
                .and_then(|m| sorted.iter().position(|item| uuid_of(*item) == m))
                .ok_or_else(|| TopologyError::MarkerNotFound(marker.clone()))?;
            position + 1
        }
    };

    let remaining = &sorted[start..];
    let page: Vec<T> = remaining.iter().take(limit).map(|item| (*item).clone()).collect();
    let next_marker = if remaining.len() > page.len() { page.last().map(&uuid_of) } else { None };
    Ok((page, next_marker))
}

#[derive(Debug, Clone, Serialize)]
pub struct HostPage {
    pub hosts: Vec<Host>,
    /// Pass back as `marker` to fetch the next page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_marker: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentPage {
    pub segments: Vec<FailoverSegment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_marker: Option<Uuid>,
}

pub trait TopologyStore: Send + Sync {
    fn get_segment(&self, uuid: Uuid) -> Result<FailoverSegment, TopologyError>;

    fn list_segments(&self, query: &SegmentQuery) -> Result<SegmentPage, TopologyError>;

    fn segment_count(&self) -> usize;

    /// A host of `segment`; a host registered in another segment is not found
    fn get_host(&self, segment: Uuid, host: Uuid) -> Result<Host, TopologyError>;

    fn list_hosts(&self, segment: Uuid, query: &HostQuery) -> Result<HostPage, TopologyError>;

    /// Every host registered under `name`, one per segment, in registration order
    fn hosts_named(&self, name: &str) -> Vec<Host>;
}

/// Validates `params` and lists the hosts of `segment`
pub fn query_hosts(
    store: &dyn TopologyStore,
    segment: Uuid,
    params: &HashMap<String, String>,
) -> Result<HostPage, TopologyError> {
    let query = HostQuery::from_params(params)?;
    store.list_hosts(segment, &query)
}

/// Validates `params` and lists the segments
pub fn query_segments(
    store: &dyn TopologyStore,
    params: &HashMap<String, String>,
) -> Result<SegmentPage, TopologyError> {
    let query = SegmentQuery::from_params(params)?;
    store.list_segments(&query)
}

/// Both lists are in registration order; the index is the `id` sort key
#[derive(Default)]
struct Topology {
    segments: Vec<FailoverSegment>,
    hosts: Vec<Host>,
}

impl Topology {
    fn segment(&self, uuid: Uuid) -> Option<&FailoverSegment> {
        self.segments.iter().find(|s| s.uuid == uuid)
    }
}

#[derive(Default)]
pub struct MemoryTopologyStore {
    inner: RwLock<Topology>,
}

impl MemoryTopologyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(segments: &[SegmentConfig]) -> Result<Self, TopologyError> {
        let store = Self::new();
        for config in segments {
            let segment = config.to_segment();
            let segment_id = segment.uuid;
            store.insert_segment(segment)?;
            for host in &config.hosts {
                store.insert_host(host.to_host(segment_id))?;
            }
        }
        Ok(store)
    }

    pub fn insert_segment(&self, segment: FailoverSegment) -> Result<(), TopologyError> {
        let mut topology = self.inner.write();
        if topology.segment(segment.uuid).is_some() {
            return Err(TopologyError::SegmentExists(segment.uuid));
        }
        topology.segments.push(segment);
        Ok(())
    }

    pub fn insert_host(&self, host: Host) -> Result<(), TopologyError> {
        let mut topology = self.inner.write();
        if topology.segment(host.failover_segment_id).is_none() {
            return Err(TopologyError::SegmentNotFound(host.failover_segment_id));
        }
        let taken = topology
            .hosts
            .iter()
            .any(|h| h.name == host.name && h.failover_segment_id == host.failover_segment_id);
        if taken {
            return Err(TopologyError::HostExists { name: host.name, segment: host.failover_segment_id });
        }
        topology.hosts.push(host);
        Ok(())
    }

    pub fn set_on_maintenance(&self, name: &str, on_maintenance: bool) -> usize {
        let mut topology = self.inner.write();
        let mut changed = 0;
        for host in topology.hosts.iter_mut().filter(|h| h.name == name) {
            host.on_maintenance = on_maintenance;
            changed += 1;
        }
        changed
    }

    pub fn host_count(&self) -> usize {
        self.inner.read().hosts.len()
    }
}

impl TopologyStore for MemoryTopologyStore {
    fn get_segment(&self, uuid: Uuid) -> Result<FailoverSegment, TopologyError> {
        self.inner.read().segment(uuid).cloned().ok_or(TopologyError::SegmentNotFound(uuid))
    }

    fn list_segments(&self, query: &SegmentQuery) -> Result<SegmentPage, TopologyError> {
        let topology = self.inner.read();
        let mut matching: Vec<(usize, &FailoverSegment)> = topology
            .segments
            .iter()
            .enumerate()
            .filter(|(_, s)| query.filters.matches(s))
            .collect();
        matching.sort_by(|a, b| query.compare(*a, *b));

        let sorted: Vec<&FailoverSegment> = matching.into_iter().map(|(_, s)| s).collect();
        let (segments, next_marker) = paginate(&sorted, query.marker.as_ref(), query.limit, |s| s.uuid)?;
        Ok(SegmentPage { segments, next_marker })
    }

    fn segment_count(&self) -> usize {
        self.inner.read().segments.len()
    }

    fn get_host(&self, segment: Uuid, host: Uuid) -> Result<Host, TopologyError> {
        let topology = self.inner.read();
        if topology.segment(segment).is_none() {
            return Err(TopologyError::SegmentNotFound(segment));
        }
        topology
            .hosts
            .iter()
            .find(|h| h.uuid == host && h.failover_segment_id == segment)
            .cloned()
            .ok_or(TopologyError::HostNotFound(host))
    }

    fn list_hosts(&self, segment: Uuid, query: &HostQuery) -> Result<HostPage, TopologyError> {
        let topology = self.inner.read();
        if topology.segment(segment).is_none() {
            return Err(TopologyError::SegmentNotFound(segment));
        }

        let mut matching: Vec<(usize, &Host)> = topology
            .hosts
            .iter()
            .enumerate()
            .filter(|(_, h)| h.failover_segment_id == segment && query.filters.matches(h))
            .collect();
        matching.sort_by(|a, b| query.compare(*a, *b));

        let sorted: Vec<&Host> = matching.into_iter().map(|(_, h)| h).collect();
        let (hosts, next_marker) = paginate(&sorted, query.marker.as_ref(), query.limit, |h| h.uuid)?;
        Ok(HostPage { hosts, next_marker })
    }

    fn hosts_named(&self, name: &str) -> Vec<Host> {
        self.inner.read().hosts.iter().filter(|h| h.name == name).cloned().collect()
    }
}
