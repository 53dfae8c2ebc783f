use anyhow::{Context, Result};
use dashmap::DashSet;
use std::{
    collections::HashSet,
    fmt,
    io::Read,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::{model::Record, storage::Source};

/// Result of running one top-level object through its gate and extractor.
#[derive(Debug)]
pub enum Extraction {
    Accepted(Vec<Record>),
    Rejected(Rejection),
}

/// Why a gate dropped an object. Not an error: the object and its whole
/// subtree simply produce no records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    ServiceNotListed {
        billing_code_type: String,
        billing_code: String,
    },
    ProviderGroupNotReferenced {
        provider_group_id: String,
    },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::ServiceNotListed {
                billing_code_type,
                billing_code,
            } => write!(
                f,
                "{billing_code_type} {billing_code} is not in the service list"
            ),
            Rejection::ProviderGroupNotReferenced { provider_group_id } => write!(
                f,
                "provider group {provider_group_id} is not referenced by any in-network rate"
            ),
        }
    }
}

/// Billing codes that may pass the in-network gate. Built once before any
/// extraction, read-only afterwards.
#[derive(Debug, Default, Clone)]
pub struct ServiceAllowList {
    codes: HashSet<String>,
}

impl ServiceAllowList {
    /// Loads a services CSV. The header row is skipped and the first column
    /// of every remaining row is an allowed billing code.
    pub async fn load(source: &Source) -> Result<Self> {
        let data = source.read_all().await?;
        Self::from_reader(data.as_slice())
            .with_context(|| format!("Failed loading services CSV {source}"))
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let mut codes = HashSet::new();
        for row in csv_reader.records() {
            let row = row.context("Failed reading services CSV record")?;
            let code = row.get(0).unwrap_or("").trim();
            if !code.is_empty() {
                codes.insert(code.to_string());
            }
        }
        Ok(Self { codes })
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn contains(&self, code: &str) -> bool {
        self.codes.contains(code)
    }

    /// The in-network gate: only HCPCS/CPT codes on the list survive.
    pub fn admits(&self, billing_code_type: &str, billing_code: &str) -> bool {
        matches!(billing_code_type, "HCPCS" | "CPT") && self.contains(billing_code)
    }
}

impl<S: Into<String>> FromIterator<S> for ServiceAllowList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            codes: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Provider references seen while scanning in-network rates. Written
/// concurrently by every phase-1 extraction task.
#[derive(Debug, Default)]
pub struct ProviderReferenceCollector {
    references: DashSet<String>,
}

impl ProviderReferenceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, reference: &str) {
        if !self.references.contains(reference) {
            self.references.insert(reference.to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    /// Ends phase 1. Fails if any task still holds a handle to the
    /// collector, i.e. the phase-1 barrier has not been passed.
    pub fn freeze(self: Arc<Self>) -> Result<ProviderReferenceFilter> {
        let collector = Arc::try_unwrap(self).map_err(|still_shared| {
            anyhow::anyhow!(
                "provider reference collector still has {} live handles; phase 1 has not drained",
                Arc::strong_count(&still_shared) - 1
            )
        })?;
        Ok(ProviderReferenceFilter {
            references: collector.references.into_iter().collect(),
        })
    }
}

/// Read-only provider-reference set consulted by phase 2.
#[derive(Debug, Default, Clone)]
pub struct ProviderReferenceFilter {
    references: HashSet<String>,
}

impl ProviderReferenceFilter {
    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn contains(&self, provider_group_id: &str) -> bool {
        self.references.contains(provider_group_id)
    }
}

impl<S: Into<String>> FromIterator<S> for ProviderReferenceFilter {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            references: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Counters updated from many extraction tasks at once.
#[derive(Debug, Default)]
pub struct RunCounters {
    pub lines_read: AtomicU64,
    pub in_network_scanned: AtomicU64,
    pub in_network_matched: AtomicU64,
    pub provider_groups_scanned: AtomicU64,
    pub provider_groups_matched: AtomicU64,
    pub records_emitted: AtomicU64,
}

impl RunCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            lines_read: self.lines_read.load(Ordering::Relaxed),
            in_network_scanned: self.in_network_scanned.load(Ordering::Relaxed),
            in_network_matched: self.in_network_matched.load(Ordering::Relaxed),
            provider_groups_scanned: self.provider_groups_scanned.load(Ordering::Relaxed),
            provider_groups_matched: self.provider_groups_matched.load(Ordering::Relaxed),
            records_emitted: self.records_emitted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub lines_read: u64,
    pub in_network_scanned: u64,
    pub in_network_matched: u64,
    pub provider_groups_scanned: u64,
    pub provider_groups_matched: u64,
    pub records_emitted: u64,
}
