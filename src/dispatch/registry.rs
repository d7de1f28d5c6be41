//! Tool registry: maps free-form tool hints to a concrete `(server, tool)`.
//!
//! Resolution runs an ordered list of strategies; the first one that yields
//! a result wins:
//! 1. **Exact:** canonical name, or qualified `server.tool` / `server:tool`.
//! 2. **Synonym:** normalised hint found in the synonym table.
//! 3. **Keyword:** a keyword rule matches a token of the hint; shell rules
//!    also inject a `command` argument built from the hint.
//! 4. **Substring:** hint contains, or is contained in, a canonical name.
//!
//! When nothing matches, `NotFound` carries up to three suggestions ranked by
//! edit distance.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{Map, Value};

use super::schema::{KeywordRule, ToolSchema, ToolTable};
use crate::mcp_client::types::McpToolDefinition;

/// Hints shorter than this never match by substring.
const MIN_SUBSTRING_LEN: usize = 3;

const MAX_SUGGESTIONS: usize = 3;

/// Verbs that turn a noun keyword match into a guess about a write. Routing
/// rules (those not building a shell command) are skipped when one appears.
const MUTATING_VERBS: &[&str] = &[
    "add", "append", "clear", "create", "delete", "drop", "erase", "forget", "insert",
    "move", "post", "purge", "remove", "reset", "save", "send", "set", "update", "wipe",
    "write",
];

// ─── Resolution ──────────────────────────────────────────────────────────────

/// How a hint was matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    Exact,
    Synonym,
    Keyword,
    Substring,
}

impl ResolutionStrategy {
    /// Default strategy order.
    pub const ORDERED: [ResolutionStrategy; 4] =
        [Self::Exact, Self::Synonym, Self::Keyword, Self::Substring];
}

/// Result of resolving a tool hint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    Found {
        server: String,
        /// Canonical tool name.
        tool: String,
        strategy: ResolutionStrategy,
        /// Arguments derived from the hint itself; never override caller args.
        injected_args: Map<String, Value>,
    },

    /// Unqualified name advertised by several servers. Candidates are
    /// `server.tool` names.
    Ambiguous { hint: String, candidates: Vec<String> },

    NotFound { hint: String, suggestions: Vec<String> },
}

impl Resolution {
    /// The canonical tool name, if resolution succeeded.
    pub fn resolved_name(&self) -> Option<&str> {
        match self {
            Self::Found { tool, .. } => Some(tool),
            _ => None,
        }
    }

}

/// Lowercase and fold `-` and spaces to `_`.
pub fn normalize_hint(hint: &str) -> String {
    hint.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == '-' || c.is_whitespace() { '_' } else { c })
        .collect()
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Immutable after construction; share behind an `Arc`.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    /// Registration order; earlier entries win ties.
    schemas: Vec<ToolSchema>,
    /// `canonical name → index into schemas`.
    by_name: HashMap<String, usize>,
    /// `normalised synonym → canonical name`.
    synonyms: HashMap<String, String>,
    keywords: Vec<KeywordRule>,
    /// `advertised name → ["server.tool", ...]` for names offered by several
    /// servers and unknown to the static table.
    ambiguous: HashMap<String, Vec<String>>,
    strategies: Vec<ResolutionStrategy>,
    min_similarity: f64,
}

impl ToolRegistry {
    /// Registry over a static table only.
    pub fn new(table: ToolTable) -> Self {
        RegistryBuilder::new(table).build()
    }

    pub fn builder(table: ToolTable) -> RegistryBuilder {
        RegistryBuilder::new(table)
    }

    pub fn schema(&self, tool: &str) -> Option<&ToolSchema> {
        self.by_name.get(tool).map(|&idx| &self.schemas[idx])
    }

    /// `(synonym, canonical)` pairs, sorted by synonym.
    pub fn synonyms(&self) -> Vec<(&str, &str)> {
        let mut pairs: Vec<(&str, &str)> = self
            .synonyms
            .iter()
            .map(|(s, t)| (s.as_str(), t.as_str()))
            .collect();
        pairs.sort();
        pairs
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Resolve a hint. Pure; no I/O.
    pub fn resolve(&self, hint: &str) -> Resolution {
        let normalized = normalize_hint(hint);
        if normalized.is_empty() {
            return Resolution::NotFound {
                hint: hint.to_string(),
                suggestions: Vec::new(),
            };
        }

        for strategy in &self.strategies {
            let found = match strategy {
                ResolutionStrategy::Exact => self.resolve_exact(hint.trim(), &normalized),
                ResolutionStrategy::Synonym => self.resolve_synonym(&normalized),
                ResolutionStrategy::Keyword => self.resolve_keyword(&normalized),
                ResolutionStrategy::Substring => self.resolve_substring(&normalized),
            };
            if let Some(resolution) = found {
                tracing::debug!(
                    hint,
                    ?strategy,
                    resolved = ?resolution.resolved_name(),
                    "resolved tool hint"
                );
                return resolution;
            }
        }

        Resolution::NotFound {
            hint: hint.to_string(),
            suggestions: self.find_similar(&normalized, MAX_SUGGESTIONS),
        }
    }

    fn found(&self, schema: &ToolSchema, strategy: ResolutionStrategy) -> Resolution {
        Resolution::Found {
            server: schema.server.clone(),
            tool: schema.name.clone(),
            strategy,
            injected_args: Map::new(),
        }
    }

    fn resolve_exact(&self, raw: &str, normalized: &str) -> Option<Resolution> {
        if let Some(schema) = self.schema(raw).or_else(|| self.schema(normalized)) {
            return Some(self.found(schema, ResolutionStrategy::Exact));
        }

        if let Some(candidates) = self.ambiguous.get(normalized) {
            return Some(Resolution::Ambiguous {
                hint: raw.to_string(),
                candidates: candidates.clone(),
            });
        }

        // `server.tool` or `server:tool`; the tool part may be the remote name
        let (server, tool) = raw.split_once(|c: char| c == '.' || c == ':')?;
        let tool_norm = normalize_hint(tool);
        self.schemas
            .iter()
            .find(|s| {
                s.server == server
                    && (s.name == tool || s.name == tool_norm || s.remote() == tool)
            })
            .map(|schema| self.found(schema, ResolutionStrategy::Exact))
    }

    fn resolve_synonym(&self, normalized: &str) -> Option<Resolution> {
        let canonical = self.synonyms.get(normalized)?;
        self.schema(canonical)
            .map(|schema| self.found(schema, ResolutionStrategy::Synonym))
    }

    fn resolve_keyword(&self, normalized: &str) -> Option<Resolution> {
        let tokens: Vec<&str> = normalized
            .split(|c: char| c == '_' || c == '.' || c == ':')
            .filter(|t| !t.is_empty())
            .collect();

        let mutating = tokens.iter().any(|t| MUTATING_VERBS.contains(t));

        for rule in &self.keywords {
            if mutating && !rule.command_from_hint {
                continue;
            }
            let Some(pos) = tokens.iter().position(|t| *t == rule.keyword) else {
                continue;
            };
            let Some(schema) = self.schema(&rule.tool) else {
                continue;
            };
            let mut injected_args = Map::new();
            if rule.command_from_hint {
                injected_args.insert("command".into(), Value::String(tokens[pos..].join(" ")));
            }
            return Some(Resolution::Found {
                server: schema.server.clone(),
                tool: schema.name.clone(),
                strategy: ResolutionStrategy::Keyword,
                injected_args,
            });
        }
        None
    }

    fn resolve_substring(&self, normalized: &str) -> Option<Resolution> {
        if normalized.len() < MIN_SUBSTRING_LEN {
            return None;
        }
        self.schemas
            .iter()
            .find(|s| s.name.contains(normalized) || normalized.contains(s.name.as_str()))
            .map(|schema| self.found(schema, ResolutionStrategy::Substring))
    }

    /// Up to `max_results` canonical names most similar to `hint`, best first.
    pub fn find_similar(&self, hint: &str, max_results: usize) -> Vec<String> {
        let query = hint.rsplit(|c: char| c == '.' || c == ':').next().unwrap_or(hint);

        let mut scored: Vec<(&str, f64)> = self
            .schemas
            .iter()
            .map(|s| {
                let name = s.name.rsplit('.').next().unwrap_or(&s.name);
                (s.name.as_str(), similarity(query, name))
            })
            .filter(|(_, score)| *score >= self.min_similarity)
            .collect();

        // stable sort keeps registration order among equal scores
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_results);
        scored.into_iter().map(|(name, _)| name.to_string()).collect()
    }
}

// ─── RegistryBuilder ─────────────────────────────────────────────────────────

/// Builds a `ToolRegistry` from a static table plus server-advertised tools.
pub struct RegistryBuilder {
    table: ToolTable,
    advertised: Vec<(String, Vec<McpToolDefinition>)>,
    strategies: Vec<ResolutionStrategy>,
    min_similarity: f64,
}

impl RegistryBuilder {
    pub fn new(table: ToolTable) -> Self {
        Self {
            table,
            advertised: Vec::new(),
            strategies: ResolutionStrategy::ORDERED.to_vec(),
            min_similarity: 0.5,
        }
    }

    /// Fold in tools a server advertised via `tools/list`.
    pub fn with_advertised(mut self, server: &str, tools: Vec<McpToolDefinition>) -> Self {
        self.advertised.push((server.to_string(), tools));
        self
    }

    /// Floor for NotFound suggestions (0.0-1.0).
    pub fn min_similarity(mut self, floor: f64) -> Self {
        self.min_similarity = floor.clamp(0.0, 1.0);
        self
    }

    /// Replace the strategy order. Duplicates are dropped.
    pub fn strategies(mut self, order: &[ResolutionStrategy]) -> Self {
        let mut strategies = Vec::new();
        for s in order {
            if !strategies.contains(s) {
                strategies.push(*s);
            }
        }
        self.strategies = strategies;
        self
    }

    pub fn build(self) -> ToolRegistry {
        let mut schemas: Vec<ToolSchema> = Vec::new();
        let mut by_name: HashMap<String, usize> = HashMap::new();

        // static table: first registration of a name wins
        for schema in self.table.tools {
            if by_name.contains_key(&schema.name) {
                tracing::warn!(
                    tool = %schema.name,
                    server = %schema.server,
                    "duplicate tool in table, keeping first"
                );
                continue;
            }
            by_name.insert(schema.name.clone(), schemas.len());
            schemas.push(schema);
        }

        let mut synonyms = HashMap::new();
        for (synonym, target) in self.table.synonyms {
            let key = normalize_hint(&synonym);
            if by_name.contains_key(&key) {
                tracing::warn!(%synonym, "synonym shadows a tool name, dropped");
                continue;
            }
            if !by_name.contains_key(&target) {
                tracing::warn!(%synonym, %target, "synonym targets unknown tool, dropped");
                continue;
            }
            synonyms.insert(key, target);
        }

        let keywords: Vec<KeywordRule> = self
            .table
            .keywords
            .into_iter()
            .filter(|rule| {
                let known = by_name.contains_key(&rule.tool);
                if !known {
                    tracing::warn!(
                        keyword = %rule.keyword,
                        tool = %rule.tool,
                        "keyword rule targets unknown tool, dropped"
                    );
                }
                known
            })
            .map(|rule| KeywordRule {
                keyword: normalize_hint(&rule.keyword),
                ..rule
            })
            .collect();

        // advertised tools not already covered by the static table
        let mut offered: Vec<(String, Vec<(String, McpToolDefinition)>)> = Vec::new();
        for (server, tools) in self.advertised {
            for def in tools {
                let covered = schemas
                    .iter()
                    .any(|s| s.server == server && (s.name == def.name || s.remote() == def.name));
                if covered {
                    continue;
                }
                match offered.iter_mut().find(|(name, _)| *name == def.name) {
                    Some((_, servers)) => servers.push((server.clone(), def)),
                    None => offered.push((def.name.clone(), vec![(server.clone(), def)])),
                }
            }
        }

        let mut ambiguous = HashMap::new();
        for (name, servers) in offered {
            if servers.len() == 1 && !by_name.contains_key(&name) && !synonyms.contains_key(&name) {
                let (server, def) = &servers[0];
                by_name.insert(name.clone(), schemas.len());
                schemas.push(ToolSchema::from_advertised(server, &name, def));
                continue;
            }

            // register each under its qualified name so `server.tool` resolves
            let mut candidates = Vec::new();
            for (server, def) in &servers {
                let qualified = format!("{server}.{name}");
                if !by_name.contains_key(&qualified) {
                    by_name.insert(qualified.clone(), schemas.len());
                    schemas.push(ToolSchema::from_advertised(server, &qualified, def));
                }
                candidates.push(qualified);
            }
            if servers.len() > 1 && !by_name.contains_key(&name) && !synonyms.contains_key(&name) {
                ambiguous.insert(normalize_hint(&name), candidates);
            }
        }

        tracing::debug!(
            tools = schemas.len(),
            synonyms = synonyms.len(),
            keywords = keywords.len(),
            ambiguous = ambiguous.len(),
            "built tool registry"
        );

        ToolRegistry {
            schemas,
            by_name,
            synonyms,
            keywords,
            ambiguous,
            strategies: self.strategies,
            min_similarity: self.min_similarity,
        }
    }
}

// ─── Edit Distance ──────────────────────────────────────────────────────────

/// Levenshtein edit distance over bytes.
fn levenshtein(a: &str, b: &str) -> usize {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    let n = b_bytes.len();

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for (i, ca) in a_bytes.iter().enumerate() {
        curr[0] = i + 1;
        for j in 1..=n {
            let cost = usize::from(*ca != b_bytes[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// Normalised similarity, 0.0 (different) to 1.0 (identical).
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
