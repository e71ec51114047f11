// =============================================================================
// Decision provenance — chain-of-custody for every gate verdict
// =============================================================================
//
// Each submission builds a chain: a root `signal.validated` node, one node
// per gate check, and a terminal `risk.approved` / `risk.rejected` node.
// Nodes are never mutated after append; the chain is sealed atomically with
// the Decision write. Hashes make tampering detectable:
//   node hash  = SHA-256 of the canonical JSON of the node's hashed fields
//   chain hash = SHA-256 of the sorted, '|'-joined node hashes
// =============================================================================

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// =============================================================================
// Canonical JSON
// =============================================================================

/// Serialise a JSON value deterministically: object keys sorted recursively,
/// no insignificant whitespace. Open-schema blobs (feature bags, details)
/// must go through this before hashing.
pub fn canonical_json(value: &serde_json::Value) -> String {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// SHA-256 hex digest of the canonical form of a JSON value.
pub fn hash_value(value: &serde_json::Value) -> String {
    hex::encode(Sha256::digest(canonical_json(value).as_bytes()))
}

// =============================================================================
// Node & chain types
// =============================================================================

/// Kind of a decision-chain node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    #[serde(rename = "signal.validated")]
    SignalValidated,
    #[serde(rename = "signal.expired")]
    SignalExpired,
    #[serde(rename = "gate.passed")]
    GatePassed,
    #[serde(rename = "gate.blocked")]
    GateBlocked,
    #[serde(rename = "risk.approved")]
    RiskApproved,
    #[serde(rename = "risk.rejected")]
    RiskRejected,
    #[serde(rename = "emergency.kill_switch")]
    KillSwitch,
    #[serde(rename = "emergency.panic_hedge")]
    PanicHedge,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SignalValidated => "signal.validated",
            Self::SignalExpired => "signal.expired",
            Self::GatePassed => "gate.passed",
            Self::GateBlocked => "gate.blocked",
            Self::RiskApproved => "risk.approved",
            Self::RiskRejected => "risk.rejected",
            Self::KillSwitch => "emergency.kill_switch",
            Self::PanicHedge => "emergency.panic_hedge",
        }
    }
}

/// Which component produced a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeSource {
    SignalGate,
    RiskEngine,
    AdminUser,
    SystemAuto,
    ExternalSignal,
}

impl NodeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SignalGate => "signal_gate",
            Self::RiskEngine => "risk_engine",
            Self::AdminUser => "admin_user",
            Self::SystemAuto => "system_auto",
            Self::ExternalSignal => "external_signal",
        }
    }
}

/// A single immutable node in a decision chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionNode {
    pub node_id: String,
    pub kind: NodeKind,
    pub source: NodeSource,
    pub timestamp: DateTime<Utc>,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub rationale: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub hash: String,
}

impl DecisionNode {
    /// Build a node and seal its hash.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Uuid,
        kind: NodeKind,
        source: NodeSource,
        timestamp: DateTime<Utc>,
        input: serde_json::Value,
        output: serde_json::Value,
        rationale: impl Into<String>,
        parent_id: Option<String>,
    ) -> Self {
        let mut node = Self {
            node_id: format!("node_{}", &id.simple().to_string()[..12]),
            kind,
            source,
            timestamp,
            input,
            output,
            rationale: rationale.into(),
            parent_id,
            hash: String::new(),
        };
        node.hash = node.compute_hash();
        node
    }

    fn compute_hash(&self) -> String {
        let hashed = serde_json::json!({
            "node_id": self.node_id,
            "kind": self.kind.as_str(),
            "source": self.source.as_str(),
            "timestamp": self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            "input": self.input,
            "output": self.output,
            "rationale": self.rationale,
            "parent_id": self.parent_id,
        });
        hash_value(&hashed)
    }

    /// Verify the node has not been tampered with.
    pub fn verify(&self) -> bool {
        self.hash == self.compute_hash()
    }
}

/// One entry of a chain's chronological timeline projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub timestamp: DateTime<Utc>,
    pub decision: String,
    pub source: String,
    pub rationale: String,
}

/// A sealed chain of decisions leading to one outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionChain {
    pub chain_id: String,
    pub root_id: String,
    pub terminal_id: String,
    pub outcome: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub nodes: Vec<DecisionNode>,
    pub chain_hash: String,
}

impl DecisionChain {
    /// Chain hash: SHA-256 of the sorted concatenation of node hashes.
    pub fn compute_chain_hash(nodes: &[DecisionNode]) -> String {
        let mut hashes: Vec<&str> = nodes.iter().map(|n| n.hash.as_str()).collect();
        hashes.sort_unstable();
        hex::encode(Sha256::digest(hashes.join("|").as_bytes()))
    }

    /// Verify every node plus the chain hash.
    pub fn verify(&self) -> bool {
        self.nodes.iter().all(DecisionNode::verify)
            && self.chain_hash == Self::compute_chain_hash(&self.nodes)
    }

    /// Chronological projection of the chain.
    pub fn timeline(&self) -> Vec<TimelineEntry> {
        let mut sorted: Vec<&DecisionNode> = self.nodes.iter().collect();
        sorted.sort_by_key(|n| n.timestamp);
        sorted
            .into_iter()
            .map(|n| TimelineEntry {
                timestamp: n.timestamp,
                decision: n.kind.as_str().to_string(),
                source: n.source.as_str().to_string(),
                rationale: n.rationale.clone(),
            })
            .collect()
    }
}

// =============================================================================
// ChainBuilder
// =============================================================================

/// Append-only builder used by the ingress pipeline. Nodes link to their
/// parent as they are added; `seal` fixes the outcome and the chain hash.
pub struct ChainBuilder {
    chain_id: String,
    created_at: DateTime<Utc>,
    nodes: Vec<DecisionNode>,
}

impl ChainBuilder {
    /// Open a chain with its root node.
    pub fn open(
        chain_uuid: Uuid,
        root: DecisionNode,
    ) -> Self {
        Self {
            chain_id: format!("chain_{}", &chain_uuid.simple().to_string()[..12]),
            created_at: root.timestamp,
            nodes: vec![root],
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// Id of the current terminal node, used as the next node's parent.
    pub fn tip(&self) -> String {
        self.nodes
            .last()
            .map(|n| n.node_id.clone())
            .unwrap_or_default()
    }

    pub fn push(&mut self, node: DecisionNode) {
        self.nodes.push(node);
    }

    /// Seal the chain with its outcome. The chain is immutable afterwards.
    pub fn seal(self, outcome: impl Into<String>, completed_at: DateTime<Utc>) -> DecisionChain {
        let chain_hash = DecisionChain::compute_chain_hash(&self.nodes);
        DecisionChain {
            chain_id: self.chain_id,
            root_id: self.nodes.first().map(|n| n.node_id.clone()).unwrap_or_default(),
            terminal_id: self.nodes.last().map(|n| n.node_id.clone()).unwrap_or_default(),
            outcome: outcome.into(),
            created_at: self.created_at,
            completed_at,
            nodes: self.nodes,
            chain_hash,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn node(kind: NodeKind, rationale: &str, parent: Option<String>) -> DecisionNode {
        DecisionNode::new(
            Uuid::new_v4(),
            kind,
            NodeSource::SignalGate,
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            serde_json::json!({"symbol": "EURUSD"}),
            serde_json::json!({"passed": true}),
            rationale,
            parent,
        )
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let v = serde_json::json!({"b": 1, "a": {"z": true, "m": [3, {"y": 1, "x": 2}]}});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":{"m":[3,{"x":2,"y":1}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn canonical_json_is_order_insensitive() {
        let a: serde_json::Value = serde_json::from_str(r#"{"x": 1, "y": 2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"y": 2, "x": 1}"#).unwrap();
        assert_eq!(hash_value(&a), hash_value(&b));
    }

    #[test]
    fn node_hash_detects_tampering() {
        let mut n = node(NodeKind::GatePassed, "confidence ok", None);
        assert!(n.verify());
        n.rationale = "edited".to_string();
        assert!(!n.verify());
    }

    #[test]
    fn chain_builds_links_and_verifies() {
        let root = node(NodeKind::SignalValidated, "validated", None);
        let mut builder = ChainBuilder::open(Uuid::new_v4(), root);

        let gate = node(NodeKind::GatePassed, "confidence ok", Some(builder.tip()));
        builder.push(gate);
        let terminal = node(NodeKind::RiskApproved, "all passed", Some(builder.tip()));
        builder.push(terminal);

        let chain = builder.seal("approved", Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 1).unwrap());
        assert_eq!(chain.nodes.len(), 3);
        assert_eq!(chain.outcome, "approved");
        assert!(chain.verify());

        // Parent pointers form a line from root to terminal.
        assert!(chain.nodes[0].parent_id.is_none());
        assert_eq!(chain.nodes[1].parent_id.as_deref(), Some(chain.root_id.as_str()));
        assert_eq!(
            chain.nodes[2].parent_id.as_deref(),
            Some(chain.nodes[1].node_id.as_str())
        );
    }

    #[test]
    fn chain_hash_is_order_independent_but_content_sensitive() {
        let a = node(NodeKind::GatePassed, "a", None);
        let b = node(NodeKind::GateBlocked, "b", None);

        let forward = DecisionChain::compute_chain_hash(&[a.clone(), b.clone()]);
        let reverse = DecisionChain::compute_chain_hash(&[b.clone(), a.clone()]);
        assert_eq!(forward, reverse);

        let c = node(NodeKind::GateBlocked, "c", None);
        assert_ne!(forward, DecisionChain::compute_chain_hash(&[a, c]));
    }

    #[test]
    fn timeline_rebuild_preserves_hashes() {
        let root = node(NodeKind::SignalValidated, "validated", None);
        let mut builder = ChainBuilder::open(Uuid::new_v4(), root);
        builder.push(node(NodeKind::GatePassed, "ok", Some(builder.tip())));
        let chain = builder.seal("approved", Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 1).unwrap());

        let timeline = chain.timeline();
        assert_eq!(timeline.len(), chain.nodes.len());
        assert_eq!(timeline[0].decision, "signal.validated");

        // A JSON round-trip of the chain still verifies.
        let json = serde_json::to_string(&chain).unwrap();
        let parsed: DecisionChain = serde_json::from_str(&json).unwrap();
        assert!(parsed.verify());
        assert_eq!(parsed.chain_hash, chain.chain_hash);
    }
}
