//! 规则图编译器与缓存
//!
//! 将 `graph_json` 解析并校验为可执行的 `CompiledRule`，按规则 ID 缓存，
//! 规则的 `updated_at` 变化时缓存失效重编译。每次求值不再触碰 JSON。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, instrument};

use crate::error::{EngineError, Result};
use crate::model::{GraphEdge, GraphRule, NodeDef, NodeKind, RuleGraph};

/// 编译后的规则
///
/// 持有原始规则行 + 解析后的图 + 邻接索引。
#[derive(Debug)]
pub struct CompiledRule {
    pub rule: GraphRule,
    pub graph: RuleGraph,
    node_index: HashMap<String, usize>,
    out_edges: HashMap<String, Vec<GraphEdge>>,
}

impl CompiledRule {
    pub fn id(&self) -> i64 {
        self.rule.id
    }

    pub fn name(&self) -> &str {
        &self.rule.name
    }

    pub fn start_node(&self) -> &NodeDef {
        // 编译时已校验 start 节点存在
        &self.graph.nodes[self.node_index[&self.graph.start]]
    }

    pub fn node(&self, id: &str) -> Option<&NodeDef> {
        self.node_index.get(id).map(|&i| &self.graph.nodes[i])
    }

    /// 节点的全部出边，保持定义顺序
    pub fn edges_from(&self, id: &str) -> &[GraphEdge] {
        self.out_edges.get(id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// 规则编译器
pub struct RuleCompiler;

impl RuleCompiler {
    /// 编译规则
    #[instrument(skip(rule), fields(rule_id = rule.id, rule_name = %rule.name))]
    pub fn compile(rule: &GraphRule) -> Result<CompiledRule> {
        let graph: RuleGraph = serde_json::from_value(rule.graph_json.clone())
            .map_err(|e| EngineError::ParseError(format!("rule_id={} 图解析失败: {e}", rule.id)))?;

        Self::validate(rule.id, &graph)?;

        let node_index: HashMap<String, usize> = graph
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();

        let mut out_edges: HashMap<String, Vec<GraphEdge>> = HashMap::new();
        for edge in &graph.edges {
            out_edges
                .entry(edge.from.clone())
                .or_default()
                .push(edge.clone());
        }

        debug!(nodes = graph.nodes.len(), edges = graph.edges.len(), "规则已编译");

        Ok(CompiledRule {
            rule: rule.clone(),
            graph,
            node_index,
            out_edges,
        })
    }

    /// 结构校验
    ///
    /// 发布时的无环校验是管理面的职责，这里只校验执行期依赖的结构不变式。
    fn validate(rule_id: i64, graph: &RuleGraph) -> Result<()> {
        if graph.nodes.is_empty() {
            return Err(EngineError::ParseError(format!(
                "rule_id={rule_id} 图没有任何节点"
            )));
        }

        let mut ids = HashSet::new();
        for node in &graph.nodes {
            if node.id.is_empty() {
                return Err(EngineError::ParseError(format!(
                    "rule_id={rule_id} 存在空节点 ID"
                )));
            }
            if !ids.insert(node.id.as_str()) {
                return Err(EngineError::ParseError(format!(
                    "rule_id={rule_id} 节点 ID 重复: {}",
                    node.id
                )));
            }
        }

        if !ids.contains(graph.start.as_str()) {
            return Err(EngineError::ParseError(format!(
                "rule_id={rule_id} 起始节点不存在: {}",
                graph.start
            )));
        }

        for edge in &graph.edges {
            if !ids.contains(edge.from.as_str()) || !ids.contains(edge.to.as_str()) {
                return Err(EngineError::ParseError(format!(
                    "rule_id={rule_id} 边引用了未知节点: {} -> {}",
                    edge.from, edge.to
                )));
            }
        }

        // range_switch 必须恰好有 true/false 两条守卫出边
        for node in &graph.nodes {
            if matches!(node.behavior, NodeKind::RangeSwitch { .. }) {
                let guards: Vec<Option<bool>> = graph
                    .edges
                    .iter()
                    .filter(|e| e.from == node.id)
                    .map(|e| e.when)
                    .collect();
                if guards.len() != 2
                    || !guards.contains(&Some(true))
                    || !guards.contains(&Some(false))
                {
                    return Err(EngineError::ParseError(format!(
                        "rule_id={rule_id} range_switch 节点 {} 必须恰好有 when=true/false 两条出边",
                        node.id
                    )));
                }
            }
        }

        Ok(())
    }
}

/// 进程内编译缓存
///
/// 以规则 ID 为键；命中时比对 `updated_at`，规则被管理面更新后
/// 第一次使用即重编译。
#[derive(Default)]
pub struct GraphCache {
    inner: DashMap<i64, Arc<CompiledRule>>,
}

impl GraphCache {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// 取缓存或编译
    pub fn get_or_compile(&self, rule: &GraphRule) -> Result<Arc<CompiledRule>> {
        if let Some(cached) = self.inner.get(&rule.id)
            && cached.rule.updated_at == rule.updated_at
        {
            return Ok(cached.clone());
        }

        let compiled = Arc::new(RuleCompiler::compile(rule)?);
        self.inner.insert(rule.id, compiled.clone());
        Ok(compiled)
    }
}
