//! 依存関係に沿ったサービス単位の並列実行
//!
//! 各サービスはラッチ（完了状態）を持ち、依存先すべてのラッチが開いた時点で
//! コールバックが呼ばれる。依存条件（healthy など）の待機はコールバック側で行う。

use fleetcompose_core::{AggregateError, ComposeError, DependencyGraph, Result};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 走査方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// 依存先が先（起動系）
    Forward,
    /// 被依存サービスが先（停止系）
    Reverse,
}

/// 失敗時の振る舞い
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// 新規の開始を止め、実行中のものは完了まで待つ
    #[default]
    Abort,
    /// 実行中のものも即座に取り消す
    CascadeStop,
    /// 失敗したサービスの後続だけを飛ばし、他は続ける（停止系では後続も続ける）
    KeepGoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Latch {
    Waiting,
    Running,
    Done,
    Failed,
    Skipped,
}

/// 依存順スケジューラ
#[derive(Debug, Clone)]
pub struct DependencyScheduler<'g> {
    graph: &'g DependencyGraph,
    direction: Direction,
    parallelism: Option<usize>,
    failure: FailurePolicy,
}

impl<'g> DependencyScheduler<'g> {
    pub fn new(graph: &'g DependencyGraph, direction: Direction) -> Self {
        Self {
            graph,
            direction,
            parallelism: None,
            failure: FailurePolicy::default(),
        }
    }

    /// 同時実行数の上限（None はサービス数）
    pub fn with_parallelism(mut self, limit: Option<usize>) -> Self {
        self.parallelism = limit.filter(|l| *l > 0);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure = policy;
        self
    }

    /// `name` より先に完了している必要があるサービス（対象集合内のみ）
    fn predecessors(&self, name: &str, targets: &BTreeSet<String>) -> Vec<String> {
        match self.direction {
            Direction::Forward => self
                .graph
                .dependencies(name)
                .iter()
                .map(|e| e.target.clone())
                .filter(|t| targets.contains(t))
                .collect(),
            Direction::Reverse => self
                .graph
                .dependents(name)
                .iter()
                .filter(|t| targets.contains(*t))
                .cloned()
                .collect(),
        }
    }

    fn successors(&self, name: &str, targets: &BTreeSet<String>) -> Vec<String> {
        match self.direction {
            Direction::Forward => self
                .graph
                .dependents(name)
                .iter()
                .filter(|t| targets.contains(*t))
                .cloned()
                .collect(),
            Direction::Reverse => self
                .graph
                .dependencies(name)
                .iter()
                .map(|e| e.target.clone())
                .filter(|t| targets.contains(t))
                .collect(),
        }
    }

    /// 対象サービスそれぞれについて `f` を依存順に実行する
    ///
    /// 失敗はサービス名付きで集約される。取り消された場合、実行中だったサービスは
    /// `Canceled` として記録され、未開始のサービスは開始されない。
    pub async fn run<F, Fut>(
        &self,
        targets: &BTreeSet<String>,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<()>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let targets: BTreeSet<String> = targets
            .iter()
            .filter(|t| self.graph.contains(t))
            .cloned()
            .collect();
        let limit = self.parallelism.unwrap_or(targets.len()).max(1);

        let mut latches: BTreeMap<String, Latch> = targets
            .iter()
            .map(|t| (t.clone(), Latch::Waiting))
            .collect();
        let mut remaining: BTreeMap<String, usize> = targets
            .iter()
            .map(|t| (t.clone(), self.predecessors(t, &targets).len()))
            .collect();
        let mut ready: BTreeSet<String> = remaining
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(t, _)| t.clone())
            .collect();

        let mut errors = AggregateError::new();
        let mut in_flight = FuturesUnordered::new();
        let mut halted = false;

        loop {
            while !halted && !cancel.is_cancelled() && in_flight.len() < limit {
                let Some(name) = ready.pop_first() else {
                    break;
                };
                debug!(service = %name, "Scheduling service");
                latches.insert(name.clone(), Latch::Running);
                let fut = f(name.clone());
                in_flight.push(async move { (name, fut.await) });
            }

            if in_flight.is_empty() {
                break;
            }

            let finished = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                Some(done) = in_flight.next() => Some(done),
            };

            let Some((name, result)) = finished else {
                // 実行中のものは破棄して取り消し扱い
                for (service, _) in latches.iter().filter(|(_, l)| **l == Latch::Running) {
                    debug!(service = %service, "Canceled in flight");
                    errors.push(service.clone(), ComposeError::Canceled);
                }
                in_flight.clear();
                break;
            };

            match result {
                Ok(()) => {
                    latches.insert(name.clone(), Latch::Done);
                    self.release(&name, &targets, &mut remaining, &mut ready);
                }
                Err(err) => {
                    debug!(service = %name, error = %err, "Service failed");
                    latches.insert(name.clone(), Latch::Failed);
                    errors.push(name.clone(), err);
                    match self.failure {
                        FailurePolicy::Abort => halted = true,
                        FailurePolicy::CascadeStop => {
                            for (service, _) in
                                latches.iter().filter(|(_, l)| **l == Latch::Running)
                            {
                                errors.push(service.clone(), ComposeError::Canceled);
                            }
                            in_flight.clear();
                            break;
                        }
                        FailurePolicy::KeepGoing => match self.direction {
                            Direction::Forward => {
                                self.skip_successors(&name, &targets, &mut latches)
                            }
                            Direction::Reverse => {
                                self.release(&name, &targets, &mut remaining, &mut ready)
                            }
                        },
                    }
                }
            }
        }

        let unfinished = latches.values().any(|l| *l == Latch::Waiting);
        if errors.is_empty() && unfinished && cancel.is_cancelled() {
            return Err(ComposeError::Canceled);
        }
        errors.into_result()
    }

    fn release(
        &self,
        name: &str,
        targets: &BTreeSet<String>,
        remaining: &mut BTreeMap<String, usize>,
        ready: &mut BTreeSet<String>,
    ) {
        for next in self.successors(name, targets) {
            if let Some(count) = remaining.get_mut(&next) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    ready.insert(next);
                }
            }
        }
    }

    fn skip_successors(
        &self,
        name: &str,
        targets: &BTreeSet<String>,
        latches: &mut BTreeMap<String, Latch>,
    ) {
        let mut stack = self.successors(name, targets);
        while let Some(next) = stack.pop() {
            if latches.get(&next) == Some(&Latch::Waiting) {
                debug!(service = %next, failed = %name, "Skipping dependent of failed service");
                latches.insert(next.clone(), Latch::Skipped);
                stack.extend(self.successors(&next, targets));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetcompose_core::{ErrorKind, load_project_from_str};
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const YAML: &str = r#"
services:
  db:
    image: postgres
  cache:
    image: redis
  api:
    image: api
    depends_on: [db, cache]
  web:
    image: nginx
    depends_on: [api]
"#;

    fn graph() -> DependencyGraph {
        let project = load_project_from_str(YAML, Path::new("/tmp/demo"), Some("demo")).unwrap();
        DependencyGraph::from_project(&project).unwrap()
    }

    fn all(graph: &DependencyGraph) -> BTreeSet<String> {
        graph.services().map(str::to_string).collect()
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|s| s == name).unwrap()
    }

    #[tokio::test]
    async fn test_forward_order() {
        let graph = graph();
        let order = Arc::new(Mutex::new(Vec::new()));
        DependencyScheduler::new(&graph, Direction::Forward)
            .run(&all(&graph), &CancellationToken::new(), |name| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(name);
                    Ok(())
                }
            })
            .await
            .unwrap();

        let order = order.lock().unwrap().clone();
        assert_eq!(order.len(), 4);
        assert!(position(&order, "db") < position(&order, "api"));
        assert!(position(&order, "cache") < position(&order, "api"));
        assert!(position(&order, "api") < position(&order, "web"));
    }

    #[tokio::test]
    async fn test_reverse_order() {
        let graph = graph();
        let order = Arc::new(Mutex::new(Vec::new()));
        DependencyScheduler::new(&graph, Direction::Reverse)
            .run(&all(&graph), &CancellationToken::new(), |name| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(name);
                    Ok(())
                }
            })
            .await
            .unwrap();

        let order = order.lock().unwrap().clone();
        assert_eq!(order.first().map(String::as_str), Some("web"));
        assert!(position(&order, "api") < position(&order, "db"));
    }

    #[tokio::test]
    async fn test_parallelism_limit() {
        let graph = graph();
        let active = Arc::new(Mutex::new((0usize, 0usize)));
        DependencyScheduler::new(&graph, Direction::Forward)
            .with_parallelism(Some(1))
            .run(&all(&graph), &CancellationToken::new(), |_| {
                let active = active.clone();
                async move {
                    {
                        let mut a = active.lock().unwrap();
                        a.0 += 1;
                        a.1 = a.1.max(a.0);
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.lock().unwrap().0 -= 1;
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(active.lock().unwrap().1, 1);
    }

    #[tokio::test]
    async fn test_failure_blocks_dependents_and_lets_siblings_finish() {
        let graph = graph();
        let ran = Arc::new(Mutex::new(Vec::new()));
        let err = DependencyScheduler::new(&graph, Direction::Forward)
            .run(&all(&graph), &CancellationToken::new(), |name| {
                let ran = ran.clone();
                async move {
                    if name == "db" {
                        return Err(ComposeError::runtime("db failed"));
                    }
                    // cache は db の失敗後に完了する
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    ran.lock().unwrap().push(name);
                    Ok(())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Runtime);
        let ran = ran.lock().unwrap().clone();
        assert_eq!(ran, vec!["cache".to_string()]);
    }

    #[tokio::test]
    async fn test_cascade_stop_cancels_siblings() {
        let graph = graph();
        let err = DependencyScheduler::new(&graph, Direction::Forward)
            .with_failure_policy(FailurePolicy::CascadeStop)
            .run(&all(&graph), &CancellationToken::new(), |name| async move {
                if name == "db" {
                    return Err(ComposeError::runtime("db failed"));
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        let ComposeError::Aggregate(agg) = err else {
            panic!("expected aggregate");
        };
        let cache = agg.iter().find(|f| f.service == "cache").unwrap();
        assert!(cache.error.is_canceled());
    }

    #[tokio::test]
    async fn test_keep_going_skips_only_dependents() {
        let graph = graph();
        let ran = Arc::new(Mutex::new(BTreeSet::new()));
        let result = DependencyScheduler::new(&graph, Direction::Forward)
            .with_failure_policy(FailurePolicy::KeepGoing)
            .run(&all(&graph), &CancellationToken::new(), |name| {
                let ran = ran.clone();
                async move {
                    if name == "cache" {
                        return Err(ComposeError::runtime("cache failed"));
                    }
                    ran.lock().unwrap().insert(name);
                    Ok(())
                }
            })
            .await;
        assert!(result.is_err());
        let ran = ran.lock().unwrap().clone();
        assert!(ran.contains("db"));
        assert!(!ran.contains("api"));
        assert!(!ran.contains("web"));
    }

    #[tokio::test]
    async fn test_cancel_stops_new_work() {
        let graph = graph();
        let cancel = CancellationToken::new();
        let ran = Arc::new(Mutex::new(Vec::new()));
        let err = DependencyScheduler::new(&graph, Direction::Forward)
            .run(&all(&graph), &cancel, |name| {
                let ran = ran.clone();
                let cancel = cancel.clone();
                async move {
                    ran.lock().unwrap().push(name.clone());
                    if name == "db" {
                        cancel.cancel();
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok(())
                }
            })
            .await
            .unwrap_err();

        assert!(err.is_canceled());
        assert!(!ran.lock().unwrap().contains(&"web".to_string()));
    }

    #[tokio::test]
    async fn test_subset_ignores_outside_edges() {
        let graph = graph();
        let subset: BTreeSet<String> = ["web".to_string()].into();
        let ran = Arc::new(Mutex::new(Vec::new()));
        DependencyScheduler::new(&graph, Direction::Forward)
            .run(&subset, &CancellationToken::new(), |name| {
                let ran = ran.clone();
                async move {
                    ran.lock().unwrap().push(name);
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(ran.lock().unwrap().clone(), vec!["web".to_string()]);
    }
}
