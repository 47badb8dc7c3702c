//! サービス間の依存グラフ
//!
//! `depends_on` の各エッジは依存条件を持つ。`volumes_from` と
//! `network_mode: service:<name>` は `service_started` の暗黙エッジになる。

use crate::error::{ComposeError, Result};
use crate::model::{DependencyCondition, Project};
use std::collections::{BTreeMap, BTreeSet};

/// 依存エッジ（このサービス → 依存先）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub target: String,
    pub condition: DependencyCondition,
}

/// 隣接リスト表現の依存グラフ
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    dependencies: BTreeMap<String, Vec<Edge>>,
    dependents: BTreeMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// プロジェクトからグラフを構築し、循環を検出する
    ///
    /// プロジェクト内に存在しない参照先は無視する（参照の検証は validate が行う）。
    pub fn from_project(project: &Project) -> Result<Self> {
        let mut graph = DependencyGraph::default();

        for (name, service) in &project.services {
            graph.dependencies.entry(name.clone()).or_default();
            graph.dependents.entry(name.clone()).or_default();

            let mut edges: Vec<Edge> = service
                .depends_on
                .iter()
                .map(|(target, dep)| Edge {
                    target: target.clone(),
                    condition: dep.condition,
                })
                .collect();

            let implicit = service
                .volumes_from_services()
                .chain(service.network_mode_service());
            for target in implicit {
                if !edges.iter().any(|e| e.target == target) {
                    edges.push(Edge {
                        target: target.to_string(),
                        condition: DependencyCondition::ServiceStarted,
                    });
                }
            }

            edges.retain(|e| project.services.contains_key(&e.target));
            graph.dependencies.insert(name.clone(), edges);
        }

        for (name, edges) in &graph.dependencies {
            for edge in edges {
                if let Some(list) = graph.dependents.get_mut(&edge.target) {
                    list.push(name.clone());
                }
            }
        }

        if let Some(cycle) = graph.find_cycle() {
            return Err(ComposeError::CyclicDependency { cycle });
        }
        Ok(graph)
    }

    /// グラフに含まれる全サービス（名前順）
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.dependencies.keys().map(String::as_str)
    }

    pub fn contains(&self, service: &str) -> bool {
        self.dependencies.contains_key(service)
    }

    /// 直接の依存先
    pub fn dependencies(&self, service: &str) -> &[Edge] {
        self.dependencies
            .get(service)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// 直接の被依存サービス
    pub fn dependents(&self, service: &str) -> &[String] {
        self.dependents
            .get(service)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// 深さ優先探索で循環を探し、見つかれば `a -> b -> a` 形式の経路を返す
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            graph: &'a DependencyGraph,
            node: &'a str,
            marks: &mut BTreeMap<&'a str, Mark>,
            stack: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            match marks.get(node) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    // バックエッジ: スタック上の node から現在位置までが循環
                    let start = stack.iter().position(|n| *n == node).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(node.to_string());
                    return Some(cycle);
                }
                None => {}
            }

            marks.insert(node, Mark::Visiting);
            stack.push(node);
            for edge in graph.dependencies(node) {
                if let Some(cycle) = visit(graph, &edge.target, marks, stack) {
                    return Some(cycle);
                }
            }
            stack.pop();
            marks.insert(node, Mark::Done);
            None
        }

        let mut marks = BTreeMap::new();
        let mut stack = Vec::new();
        for node in self.dependencies.keys() {
            if let Some(cycle) = visit(self, node, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
        None
    }

    /// 依存先が先に来るトポロジカル順
    ///
    /// 同じ段にあるサービスは名前順になるため、結果は決定的。
    pub fn topological_order(&self) -> Vec<String> {
        let mut remaining: BTreeMap<&str, usize> = self
            .dependencies
            .iter()
            .map(|(name, edges)| (name.as_str(), edges.len()))
            .collect();
        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(remaining.len());

        while let Some(name) = ready.pop_first() {
            remaining.remove(name);
            order.push(name.to_string());
            for dependent in self.dependents(name) {
                if let Some(count) = remaining.get_mut(dependent.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent.as_str());
                    }
                }
            }
        }
        order
    }

    /// 指定サービスとその推移的な依存先
    pub fn closure(&self, roots: &BTreeSet<String>) -> BTreeSet<String> {
        let mut result = BTreeSet::new();
        let mut stack: Vec<&str> = roots.iter().map(String::as_str).collect();
        while let Some(name) = stack.pop() {
            if !self.contains(name) || !result.insert(name.to_string()) {
                continue;
            }
            stack.extend(self.dependencies(name).iter().map(|e| e.target.as_str()));
        }
        result
    }

    /// 指定サービスとその推移的な被依存サービス
    pub fn dependents_closure(&self, roots: &BTreeSet<String>) -> BTreeSet<String> {
        let mut result = BTreeSet::new();
        let mut stack: Vec<&str> = roots.iter().map(String::as_str).collect();
        while let Some(name) = stack.pop() {
            if !self.contains(name) || !result.insert(name.to_string()) {
                continue;
            }
            stack.extend(self.dependents(name).iter().map(String::as_str));
        }
        result
    }
}
