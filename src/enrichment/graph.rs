use crate::enrichment::models::{EnricherConfig, EnricherPriority, EnrichmentStage};
use crate::error::{ContextError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;

/// Static description of one enricher used to build the graph
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub enricher_id: String,
    pub config: EnricherConfig,
    pub provided_keys: Vec<String>,
    pub required_keys: Vec<String>,
}

/// Scheduling unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyGraphNode {
    pub enricher_id: String,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
    pub stage: EnrichmentStage,
    pub priority: EnricherPriority,
    /// Position at registration, the final tie-break
    pub registration_index: usize,
    /// No same-stage dependencies: eligible as soon as its stage starts
    pub can_run_in_parallel: bool,
    pub enabled: bool,
    pub provided_keys: Vec<String>,
    pub required_keys: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Validated enricher dependency DAG with a deterministic execution order
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<DependencyGraphNode>,
    index: HashMap<String, usize>,
    stage_order: BTreeMap<EnrichmentStage, Vec<String>>,
}

impl DependencyGraph {
    /// Build and validate; failures are fatal configuration errors
    pub fn build(specs: Vec<NodeSpec>) -> Result<Self> {
        let mut index = HashMap::new();
        for (i, spec) in specs.iter().enumerate() {
            if index.insert(spec.enricher_id.clone(), i).is_some() {
                return Err(ContextError::Configuration(format!(
                    "enricher '{}' registered twice",
                    spec.enricher_id
                )));
            }
        }

        for spec in &specs {
            for dep in &spec.config.depends_on {
                if !index.contains_key(dep) {
                    return Err(ContextError::EnricherNotFound(format!(
                        "'{}' (dependency of '{}')",
                        dep, spec.enricher_id
                    )));
                }
            }
        }

        let mut nodes: Vec<DependencyGraphNode> = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| DependencyGraphNode {
                enricher_id: spec.enricher_id.clone(),
                dependencies: spec.config.depends_on.clone(),
                dependents: Vec::new(),
                stage: spec.config.stage,
                priority: spec.config.priority,
                registration_index: i,
                can_run_in_parallel: true,
                enabled: spec.config.enabled,
                provided_keys: spec.provided_keys.clone(),
                required_keys: spec.required_keys.clone(),
            })
            .collect();

        Self::detect_cycles(&nodes, &index)?;

        for i in 0..nodes.len() {
            let deps = nodes[i].dependencies.clone();
            for dep in deps {
                let d = index[&dep];
                if nodes[d].stage > nodes[i].stage {
                    return Err(ContextError::Configuration(format!(
                        "enricher '{}' ({}) depends on '{}' in later stage {}",
                        nodes[i].enricher_id, nodes[i].stage, dep, nodes[d].stage
                    )));
                }
                if nodes[d].stage == nodes[i].stage {
                    nodes[i].can_run_in_parallel = false;
                }
                let id = nodes[i].enricher_id.clone();
                nodes[d].dependents.push(id);
            }
        }

        let mut graph = Self {
            nodes,
            index,
            stage_order: BTreeMap::new(),
        };

        graph.validate_key_contract()?;
        graph.stage_order = graph.order_stages();

        Ok(graph)
    }

    /// Three-color DFS in registration order
    fn detect_cycles(nodes: &[DependencyGraphNode], index: &HashMap<String, usize>) -> Result<()> {
        let mut colors = vec![Color::White; nodes.len()];
        let mut stack: Vec<usize> = Vec::new();

        fn visit(
            node: usize,
            nodes: &[DependencyGraphNode],
            index: &HashMap<String, usize>,
            colors: &mut [Color],
            stack: &mut Vec<usize>,
        ) -> Result<()> {
            colors[node] = Color::Gray;
            stack.push(node);

            for dep in &nodes[node].dependencies {
                let d = index[dep];
                match colors[d] {
                    Color::White => visit(d, nodes, index, colors, stack)?,
                    Color::Gray => {
                        let start = stack.iter().position(|&n| n == d).unwrap_or(0);
                        let mut cycle: Vec<String> = stack[start..]
                            .iter()
                            .map(|&n| nodes[n].enricher_id.clone())
                            .collect();
                        cycle.push(nodes[d].enricher_id.clone());
                        return Err(ContextError::CircularDependency { cycle });
                    }
                    Color::Black => {}
                }
            }

            stack.pop();
            colors[node] = Color::Black;
            Ok(())
        }

        for node in 0..nodes.len() {
            if colors[node] == Color::White {
                visit(node, nodes, index, &mut colors, &mut stack)?;
            }
        }
        Ok(())
    }

    /// A required key produced by another enricher must come from a transitive dependency
    fn validate_key_contract(&self) -> Result<()> {
        let mut providers: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in &self.nodes {
            for key in &node.provided_keys {
                providers
                    .entry(key.as_str())
                    .or_default()
                    .push(node.enricher_id.as_str());
            }
        }

        for (key, writers) in &providers {
            if writers.len() > 1 {
                warn!(
                    key = %key,
                    writers = ?writers,
                    "Multiple enrichers provide the same key; last writer in execution order wins"
                );
            }
        }

        for node in &self.nodes {
            let upstream = self.transitive_dependencies(&node.enricher_id);
            for key in &node.required_keys {
                let Some(writers) = providers.get(key.as_str()) else {
                    continue;
                };
                let others: Vec<&str> = writers
                    .iter()
                    .copied()
                    .filter(|w| *w != node.enricher_id)
                    .collect();
                if others.is_empty() {
                    continue;
                }
                if !others.iter().any(|w| upstream.contains(*w)) {
                    return Err(ContextError::Configuration(format!(
                        "enricher '{}' requires key '{}' provided by {:?} but does not depend on any of them",
                        node.enricher_id, key, others
                    )));
                }
            }
        }

        Ok(())
    }

    /// Per stage: topological order, ties by priority (high first) then registration
    fn order_stages(&self) -> BTreeMap<EnrichmentStage, Vec<String>> {
        let mut order = BTreeMap::new();

        for stage in EnrichmentStage::ALL {
            let members: Vec<usize> = self
                .nodes
                .iter()
                .filter(|n| n.stage == stage)
                .map(|n| n.registration_index)
                .collect();
            if members.is_empty() {
                continue;
            }

            let mut in_degree: HashMap<usize, usize> = members
                .iter()
                .map(|&m| {
                    let same_stage = self.nodes[m]
                        .dependencies
                        .iter()
                        .filter(|d| self.nodes[self.index[*d]].stage == stage)
                        .count();
                    (m, same_stage)
                })
                .collect();

            let mut ready: Vec<usize> = members
                .iter()
                .copied()
                .filter(|m| in_degree[m] == 0)
                .collect();
            let mut sorted = Vec::with_capacity(members.len());

            while !ready.is_empty() {
                ready.sort_by(|a, b| {
                    self.nodes[*b]
                        .priority
                        .cmp(&self.nodes[*a].priority)
                        .then_with(|| a.cmp(b))
                });
                let next = ready.remove(0);
                sorted.push(self.nodes[next].enricher_id.clone());

                for dependent in &self.nodes[next].dependents {
                    let d = self.index[dependent];
                    if self.nodes[d].stage != stage {
                        continue;
                    }
                    if let Some(deg) = in_degree.get_mut(&d) {
                        *deg -= 1;
                        if *deg == 0 {
                            ready.push(d);
                        }
                    }
                }
            }

            order.insert(stage, sorted);
        }

        order
    }

    pub fn node(&self, enricher_id: &str) -> Option<&DependencyGraphNode> {
        self.index.get(enricher_id).map(|&i| &self.nodes[i])
    }

    pub fn nodes(&self) -> &[DependencyGraphNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, enricher_id: &str) -> bool {
        self.index.contains_key(enricher_id)
    }

    /// Ordered members of one stage
    pub fn stage_order(&self, stage: EnrichmentStage) -> &[String] {
        self.stage_order.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Canonical execution order: stage, then topological/priority/registration
    pub fn execution_order(&self) -> Vec<String> {
        self.stage_order.values().flatten().cloned().collect()
    }

    /// Position in the canonical execution order
    pub fn rank(&self, enricher_id: &str) -> Option<usize> {
        self.execution_order().iter().position(|id| id == enricher_id)
    }

    pub fn transitive_dependencies(&self, enricher_id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut pending: Vec<&str> = self
            .node(enricher_id)
            .map(|n| n.dependencies.iter().map(String::as_str).collect())
            .unwrap_or_default();

        while let Some(id) = pending.pop() {
            if seen.insert(id.to_string()) {
                if let Some(node) = self.node(id) {
                    pending.extend(node.dependencies.iter().map(String::as_str));
                }
            }
        }
        seen
    }

    /// (dependency, dependent) pairs
    pub fn edges(&self) -> Vec<(String, String)> {
        self.nodes
            .iter()
            .flat_map(|n| {
                n.dependencies
                    .iter()
                    .map(move |d| (d.clone(), n.enricher_id.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, stage: EnrichmentStage, priority: EnricherPriority, deps: &[&str]) -> NodeSpec {
        NodeSpec {
            enricher_id: id.to_string(),
            config: EnricherConfig::new(stage, priority).with_dependencies(deps.iter().copied()),
            provided_keys: vec![format!("{}Context", id)],
            required_keys: Vec::new(),
        }
    }

    #[test]
    fn test_two_node_cycle_detected() {
        let err = DependencyGraph::build(vec![
            spec("a", EnrichmentStage::CoreEnrichment, EnricherPriority::Medium, &["b"]),
            spec("b", EnrichmentStage::CoreEnrichment, EnricherPriority::Medium, &["a"]),
        ])
        .unwrap_err();

        match err {
            ContextError::CircularDependency { cycle } => {
                assert_eq!(cycle, vec!["a", "b", "a"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cycle_across_stages_reported_as_cycle() {
        let err = DependencyGraph::build(vec![
            spec("a", EnrichmentStage::PreProcessing, EnricherPriority::Medium, &["c"]),
            spec("b", EnrichmentStage::CoreEnrichment, EnricherPriority::Medium, &["a"]),
            spec("c", EnrichmentStage::PostProcessing, EnricherPriority::Medium, &["b"]),
        ])
        .unwrap_err();
        assert_eq!(err.error_code(), "CIRCULAR_DEPENDENCY");
        assert!(err.to_string().contains("a -> c -> b -> a"));
    }

    #[test]
    fn test_unknown_dependency() {
        let err = DependencyGraph::build(vec![spec(
            "a",
            EnrichmentStage::CoreEnrichment,
            EnricherPriority::Medium,
            &["ghost"],
        )])
        .unwrap_err();
        assert_eq!(err.error_code(), "ENRICHER_NOT_FOUND");
    }

    #[test]
    fn test_dependency_on_later_stage_rejected() {
        let err = DependencyGraph::build(vec![
            spec("a", EnrichmentStage::PreProcessing, EnricherPriority::Medium, &["b"]),
            spec("b", EnrichmentStage::Finalization, EnricherPriority::Medium, &[]),
        ])
        .unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let err = DependencyGraph::build(vec![
            spec("a", EnrichmentStage::CoreEnrichment, EnricherPriority::Medium, &[]),
            spec("a", EnrichmentStage::CoreEnrichment, EnricherPriority::Medium, &[]),
        ])
        .unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn test_deterministic_order() {
        let graph = DependencyGraph::build(vec![
            spec("low", EnrichmentStage::CoreEnrichment, EnricherPriority::Low, &[]),
            spec("crit", EnrichmentStage::CoreEnrichment, EnricherPriority::Critical, &["dep"]),
            spec("dep", EnrichmentStage::CoreEnrichment, EnricherPriority::Low, &[]),
            spec("high_a", EnrichmentStage::CoreEnrichment, EnricherPriority::High, &[]),
            spec("high_b", EnrichmentStage::CoreEnrichment, EnricherPriority::High, &[]),
            spec("pre", EnrichmentStage::PreProcessing, EnricherPriority::Low, &[]),
        ])
        .unwrap();

        assert_eq!(
            graph.execution_order(),
            vec!["pre", "high_a", "high_b", "low", "dep", "crit"]
        );
        assert!(!graph.node("crit").unwrap().can_run_in_parallel);
        assert_eq!(graph.node("dep").unwrap().dependents, vec!["crit"]);
        assert_eq!(graph.rank("pre"), Some(0));
    }

    #[test]
    fn test_required_key_must_come_from_dependency() {
        let mut consumer = spec("consumer", EnrichmentStage::PostProcessing, EnricherPriority::Medium, &[]);
        consumer.required_keys = vec!["producerContext".to_string()];

        let err = DependencyGraph::build(vec![
            spec("producer", EnrichmentStage::CoreEnrichment, EnricherPriority::Medium, &[]),
            consumer.clone(),
        ])
        .unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");

        consumer.config.depends_on = vec!["producer".to_string()];
        let graph = DependencyGraph::build(vec![
            spec("producer", EnrichmentStage::CoreEnrichment, EnricherPriority::Medium, &[]),
            consumer,
        ])
        .unwrap();
        assert!(graph.transitive_dependencies("consumer").contains("producer"));
        assert_eq!(graph.edges(), vec![("producer".to_string(), "consumer".to_string())]);
    }

    #[test]
    fn test_required_key_from_request_input_is_allowed() {
        let mut social = spec("social", EnrichmentStage::CoreEnrichment, EnricherPriority::Medium, &[]);
        social.required_keys = vec!["userId".to_string()];
        assert!(DependencyGraph::build(vec![social]).is_ok());
    }
}
