// =============================================================================
// Evidence packaging — auditable exports of the decision trail
// =============================================================================
//
// A package is a set of hashed evidence items plus a manifest, a README, and
// an integrity file. The package hash is SHA-256 over the sorted
// concatenation of item hashes, so item order never changes the fingerprint.
// The bundle is a deterministic list of named entries, writable as a
// directory tree or shippable as one JSON document.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::decision::Decision;
use crate::model::{SystemEvent, TradeRecord};
use crate::provenance::{hash_value, DecisionChain};

// =============================================================================
// Items
// =============================================================================

/// Categories of evidence the package can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    DecisionChains,
    SignalHistory,
    TradeHistory,
    RiskAlerts,
}

impl EvidenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DecisionChains => "decision_chains",
            Self::SignalHistory => "signal_history",
            Self::TradeHistory => "trade_history",
            Self::RiskAlerts => "risk_alerts",
        }
    }
}

/// One hashed piece of evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub item_id: String,
    pub kind: EvidenceKind,
    pub title: String,
    pub description: String,
    pub collected_at: DateTime<Utc>,
    pub data: serde_json::Value,
    pub metadata: serde_json::Value,
    pub hash: String,
}

impl EvidenceItem {
    pub fn new(
        id: Uuid,
        kind: EvidenceKind,
        title: impl Into<String>,
        description: impl Into<String>,
        collected_at: DateTime<Utc>,
        data: serde_json::Value,
        metadata: serde_json::Value,
    ) -> Self {
        let hash = hash_value(&data);
        Self {
            item_id: format!("evi_{}", &id.simple().to_string()[..12]),
            kind,
            title: title.into(),
            description: description.into(),
            collected_at,
            data,
            metadata,
            hash,
        }
    }

    /// Verify the data has not been modified since collection.
    pub fn verify(&self) -> bool {
        self.hash == hash_value(&self.data)
    }
}

// =============================================================================
// Package
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidencePackage {
    pub package_id: String,
    pub title: String,
    pub purpose: String,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub classification: String,
    pub items: Vec<EvidenceItem>,
    pub package_hash: String,
}

/// Result of verifying a package and all of its items.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub package_id: String,
    pub verified: bool,
    pub package_hash_valid: bool,
    pub items: Vec<ItemVerification>,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemVerification {
    pub item_id: String,
    pub hash: String,
    pub valid: bool,
}

impl EvidencePackage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Uuid,
        title: impl Into<String>,
        purpose: impl Into<String>,
        requested_by: impl Into<String>,
        requested_at: DateTime<Utc>,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Self {
        Self {
            package_id: format!("pkg_{}", &id.simple().to_string()[..12]),
            title: title.into(),
            purpose: purpose.into(),
            requested_by: requested_by.into(),
            requested_at,
            period_start,
            period_end,
            classification: "CONFIDENTIAL".to_string(),
            items: Vec::new(),
            package_hash: String::new(),
        }
    }

    /// Package hash: SHA-256 over the sorted, '|'-joined item hashes.
    pub fn compute_package_hash(items: &[EvidenceItem]) -> String {
        let mut hashes: Vec<&str> = items.iter().map(|i| i.hash.as_str()).collect();
        hashes.sort_unstable();
        hex::encode(Sha256::digest(hashes.join("|").as_bytes()))
    }

    pub fn add_item(&mut self, item: EvidenceItem) {
        self.items.push(item);
        self.package_hash = Self::compute_package_hash(&self.items);
    }

    pub fn verify(&self) -> IntegrityReport {
        let mut report = IntegrityReport {
            package_id: self.package_id.clone(),
            verified: true,
            package_hash_valid: true,
            items: Vec::with_capacity(self.items.len()),
            issues: Vec::new(),
        };
        for item in &self.items {
            let valid = item.verify();
            if !valid {
                report.verified = false;
                report
                    .issues
                    .push(format!("item {} failed integrity check", item.item_id));
            }
            report.items.push(ItemVerification {
                item_id: item.item_id.clone(),
                hash: item.hash.clone(),
                valid,
            });
        }
        if self.package_hash != Self::compute_package_hash(&self.items) {
            report.verified = false;
            report.package_hash_valid = false;
            report.issues.push("package hash mismatch".to_string());
        }
        report
    }

    pub fn manifest(&self) -> serde_json::Value {
        json!({
            "package_id": self.package_id,
            "title": self.title,
            "purpose": self.purpose,
            "requested_by": self.requested_by,
            "requested_at": self.requested_at,
            "period_start": self.period_start,
            "period_end": self.period_end,
            "classification": self.classification,
            "item_count": self.items.len(),
            "evidence_kinds": self
                .items
                .iter()
                .map(|i| i.kind.as_str())
                .collect::<std::collections::BTreeSet<_>>(),
            "package_hash": self.package_hash,
        })
    }

    // -------------------------------------------------------------------------
    // Collectors
    // -------------------------------------------------------------------------

    pub fn collect_decision_chains(
        &mut self,
        id: Uuid,
        chains: &[DecisionChain],
        collected_at: DateTime<Utc>,
    ) {
        let mut outcomes = std::collections::BTreeMap::new();
        for chain in chains {
            *outcomes.entry(chain.outcome.clone()).or_insert(0usize) += 1;
        }
        self.add_item(EvidenceItem::new(
            id,
            EvidenceKind::DecisionChains,
            "Decision Provenance Chains",
            format!(
                "Complete decision chains from {} to {}",
                self.period_start.date_naive(),
                self.period_end.date_naive()
            ),
            collected_at,
            serde_json::to_value(chains).unwrap_or_default(),
            json!({ "chain_count": chains.len(), "outcomes": outcomes }),
        ));
    }

    pub fn collect_signal_history(
        &mut self,
        id: Uuid,
        decisions: &[Decision],
        collected_at: DateTime<Utc>,
    ) {
        let approved = decisions
            .iter()
            .filter(|d| d.decision == crate::types::DecisionStatus::Approved)
            .count();
        self.add_item(EvidenceItem::new(
            id,
            EvidenceKind::SignalHistory,
            "Signal Gate History",
            format!(
                "All signals processed from {} to {}",
                self.period_start.date_naive(),
                self.period_end.date_naive()
            ),
            collected_at,
            serde_json::to_value(decisions).unwrap_or_default(),
            json!({
                "total_signals": decisions.len(),
                "approved": approved,
                "blocked": decisions.len() - approved,
            }),
        ));
    }

    pub fn collect_trade_history(
        &mut self,
        id: Uuid,
        trades: &[TradeRecord],
        collected_at: DateTime<Utc>,
    ) {
        let total_pnl: f64 = trades.iter().map(|t| t.profit).sum();
        let symbols: std::collections::BTreeSet<&str> =
            trades.iter().map(|t| t.symbol.as_str()).collect();
        self.add_item(EvidenceItem::new(
            id,
            EvidenceKind::TradeHistory,
            "Trade Execution History",
            format!(
                "All closed trades from {} to {}",
                self.period_start.date_naive(),
                self.period_end.date_naive()
            ),
            collected_at,
            serde_json::to_value(trades).unwrap_or_default(),
            json!({
                "total_trades": trades.len(),
                "total_pnl": total_pnl,
                "symbols_traded": symbols,
            }),
        ));
    }

    pub fn collect_risk_alerts(
        &mut self,
        id: Uuid,
        alerts: &[SystemEvent],
        collected_at: DateTime<Utc>,
    ) {
        let mut by_severity = std::collections::BTreeMap::new();
        for alert in alerts {
            *by_severity
                .entry(alert.severity.to_string())
                .or_insert(0usize) += 1;
        }
        self.add_item(EvidenceItem::new(
            id,
            EvidenceKind::RiskAlerts,
            "Risk Alert Log",
            format!(
                "All risk alerts from {} to {}",
                self.period_start.date_naive(),
                self.period_end.date_naive()
            ),
            collected_at,
            serde_json::to_value(alerts).unwrap_or_default(),
            json!({
                "total_alerts": alerts.len(),
                "by_severity": by_severity,
                "acknowledged": alerts.iter().filter(|a| a.acknowledged).count(),
            }),
        ));
    }
}

// =============================================================================
// Bundle export
// =============================================================================

/// One named file in the exported bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleEntry {
    pub path: String,
    pub content: String,
}

/// Render the package as its bundle entries: manifest, README, one JSON file
/// per evidence item in a per-kind directory, and the integrity file.
pub fn bundle(package: &EvidencePackage) -> Vec<BundleEntry> {
    let mut entries = Vec::with_capacity(package.items.len() + 3);

    entries.push(BundleEntry {
        path: "MANIFEST.json".to_string(),
        content: serde_json::to_string_pretty(&package.manifest()).unwrap_or_default(),
    });
    entries.push(BundleEntry {
        path: "README.md".to_string(),
        content: readme(package),
    });
    for item in &package.items {
        entries.push(BundleEntry {
            path: format!("evidence/{}/{}.json", item.kind.as_str(), item.item_id),
            content: serde_json::to_string_pretty(item).unwrap_or_default(),
        });
    }
    entries.push(BundleEntry {
        path: "INTEGRITY.json".to_string(),
        content: serde_json::to_string_pretty(&package.verify()).unwrap_or_default(),
    });

    entries
}

/// Write the bundle as a directory tree under `dir`.
pub fn write_bundle_to_dir(package: &EvidencePackage, dir: &std::path::Path) -> Result<()> {
    for entry in bundle(package) {
        let path = dir.join(&entry.path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, entry.content.as_bytes())
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}

fn readme(package: &EvidencePackage) -> String {
    let mut table = String::new();
    for item in &package.items {
        table.push_str(&format!(
            "| {} | {} | {}... |\n",
            item.kind.as_str(),
            item.title,
            &item.hash[..16.min(item.hash.len())]
        ));
    }
    format!(
        "# Evidence Package: {title}\n\n\
         ## Package Information\n\n\
         - **Package ID:** {id}\n\
         - **Purpose:** {purpose}\n\
         - **Requested By:** {requested_by}\n\
         - **Requested At:** {requested_at}\n\
         - **Classification:** {classification}\n\n\
         ## Evidence Period\n\n\
         - **Start:** {start}\n\
         - **End:** {end}\n\n\
         ## Contents\n\n\
         This package contains {count} evidence items:\n\n\
         | Kind | Title | Hash |\n\
         |------|-------|------|\n\
         {table}\n\
         ## Integrity Verification\n\n\
         Package Hash: `{hash}`\n\n\
         Compare the hashes in INTEGRITY.json with the recomputed hashes of\n\
         each evidence item to verify this package.\n",
        title = package.title,
        id = package.package_id,
        purpose = package.purpose,
        requested_by = package.requested_by,
        requested_at = package.requested_at.to_rfc3339(),
        classification = package.classification,
        start = package.period_start.to_rfc3339(),
        end = package.period_end.to_rfc3339(),
        count = package.items.len(),
        table = table,
        hash = package.package_hash,
    )
}
