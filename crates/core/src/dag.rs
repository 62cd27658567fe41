use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{SchedError, SchedResult};
use crate::models::SchedWorkflow;

/// DAG 起始虚拟节点
pub const START_NODE: &str = "Start";
/// DAG 结束虚拟节点
pub const END_NODE: &str = "End";

pub fn is_start(node: &str) -> bool {
    node == START_NODE
}

pub fn is_end(node: &str) -> bool {
    node == END_NODE
}

/// DAG 中的一条有向边
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DagEdge {
    pub source: String,
    pub target: String,
}

impl DagEdge {
    pub fn new<S: Into<String>, T: Into<String>>(source: S, target: T) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// 解析 DAG 表达式为边集合
///
/// 表达式形如 `"A -> B; A -> C; B -> D; C -> D"`，分号分隔边，`->` 连接节点名。
/// 无前驱的节点自动补 `Start -> X`，无后继的节点自动补 `X -> End`。
/// 单节点表达式 `"A"` 等价于 `Start -> A -> End`。
pub fn parse_dag(expr: &str) -> SchedResult<Vec<DagEdge>> {
    let invalid = |msg: &str| SchedError::InvalidDag(format!("{msg}: {expr}"));

    let mut edges: Vec<DagEdge> = Vec::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();
    for part in expr.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let nodes: Vec<&str> = part.split("->").map(str::trim).collect();
        if nodes.iter().any(|n| n.is_empty()) {
            return Err(invalid("节点名为空"));
        }
        if nodes.iter().any(|n| is_start(n) || is_end(n)) {
            return Err(invalid("节点名不能使用保留名 Start/End"));
        }
        if nodes.len() == 1 {
            // 单节点，仅在独立出现时有效，由后面的补边逻辑接入 Start/End
            seen.insert((nodes[0].to_string(), nodes[0].to_string()));
            continue;
        }
        for pair in nodes.windows(2) {
            let (source, target) = (pair[0], pair[1]);
            if source == target {
                return Err(invalid("存在自环"));
            }
            if seen.insert((source.to_string(), target.to_string())) {
                edges.push(DagEdge::new(source, target));
            }
        }
    }

    let mut all_nodes: Vec<String> = Vec::new();
    let mut known: HashSet<&str> = HashSet::new();
    for (a, b) in &seen {
        for n in [a.as_str(), b.as_str()] {
            if known.insert(n) {
                all_nodes.push(n.to_string());
            }
        }
    }
    if all_nodes.is_empty() {
        return Err(invalid("表达式为空"));
    }

    let sources: HashSet<String> = edges.iter().map(|e| e.source.clone()).collect();
    let targets: HashSet<String> = edges.iter().map(|e| e.target.clone()).collect();

    let mut result: Vec<DagEdge> = Vec::new();
    for node in &all_nodes {
        if !targets.contains(node.as_str()) {
            result.push(DagEdge::new(START_NODE, node.clone()));
        }
    }
    result.extend(edges);
    for node in &all_nodes {
        if !sources.contains(node.as_str()) {
            result.push(DagEdge::new(node.clone(), END_NODE));
        }
    }

    check_acyclic(&result).map_err(|_| invalid("存在环路"))?;
    Ok(result)
}

/// Kahn 拓扑排序检测环
fn check_acyclic(edges: &[DagEdge]) -> Result<(), ()> {
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for e in edges {
        indegree.entry(e.source.as_str()).or_insert(0);
        *indegree.entry(e.target.as_str()).or_insert(0) += 1;
        adjacency.entry(e.source.as_str()).or_default().push(e.target.as_str());
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut visited = 0;
    while let Some(node) = queue.pop_front() {
        visited += 1;
        for next in adjacency.get(node).into_iter().flatten() {
            let d = indegree.get_mut(next).ok_or(())?;
            *d -= 1;
            if *d == 0 {
                queue.push_back(next);
            }
        }
    }
    if visited == indegree.len() {
        Ok(())
    } else {
        Err(())
    }
}

/// 工作流边集合的图视图，提供前驱/后继查询与状态折叠
pub struct WorkflowGraph {
    workflows: Vec<SchedWorkflow>,
}

impl WorkflowGraph {
    pub fn new(workflows: Vec<SchedWorkflow>) -> Self {
        Self { workflows }
    }

    pub fn edges(&self) -> &[SchedWorkflow] {
        &self.workflows
    }

    /// 指向 node 的边
    pub fn predecessors(&self, node: &str) -> Vec<&SchedWorkflow> {
        self.workflows.iter().filter(|w| w.cur_node == node).collect()
    }

    /// 自 node 出发的边
    pub fn successors(&self, node: &str) -> Vec<&SchedWorkflow> {
        self.workflows.iter().filter(|w| w.pre_node == node).collect()
    }

    pub fn get(&self, pre_node: &str, cur_node: &str) -> Option<&SchedWorkflow> {
        self.workflows
            .iter()
            .find(|w| w.pre_node == pre_node && w.cur_node == cur_node)
    }

    pub fn any_match<F: Fn(&SchedWorkflow) -> bool>(&self, predicate: F) -> bool {
        self.workflows.iter().any(|w| predicate(w))
    }

    pub fn all_match<F: Fn(&SchedWorkflow) -> bool>(&self, predicate: F) -> bool {
        self.workflows.iter().all(|w| predicate(w))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::RunState;

    #[test]
    fn test_parse_diamond() {
        let edges = parse_dag("A -> B; A -> C; B -> D; C -> D").unwrap();
        assert!(edges.contains(&DagEdge::new(START_NODE, "A")));
        assert!(edges.contains(&DagEdge::new("A", "B")));
        assert!(edges.contains(&DagEdge::new("A", "C")));
        assert!(edges.contains(&DagEdge::new("B", "D")));
        assert!(edges.contains(&DagEdge::new("C", "D")));
        assert!(edges.contains(&DagEdge::new("D", END_NODE)));
        assert_eq!(edges.len(), 6);
    }

    #[test]
    fn test_parse_single_node() {
        let edges = parse_dag("A").unwrap();
        assert_eq!(edges, vec![
            DagEdge::new(START_NODE, "A"),
            DagEdge::new("A", END_NODE),
        ]);
    }

    #[test]
    fn test_parse_chained_arrow() {
        let edges = parse_dag("A -> B -> C").unwrap();
        assert!(edges.contains(&DagEdge::new("A", "B")));
        assert!(edges.contains(&DagEdge::new("B", "C")));
        assert!(edges.contains(&DagEdge::new(START_NODE, "A")));
        assert!(edges.contains(&DagEdge::new("C", END_NODE)));
    }

    #[test]
    fn test_parse_rejects_cycle_and_self_loop() {
        assert!(parse_dag("A -> B; B -> A").is_err());
        assert!(parse_dag("A -> A").is_err());
        assert!(parse_dag("").is_err());
        assert!(parse_dag("Start -> A").is_err());
    }

    fn wf(pre: &str, cur: &str, state: RunState) -> SchedWorkflow {
        let mut w = SchedWorkflow::new(1, pre, cur, 0);
        w.run_state = state;
        w
    }

    #[test]
    fn test_graph_queries() {
        let graph = WorkflowGraph::new(vec![
            wf(START_NODE, "A", RunState::Finished),
            wf("A", "B", RunState::Running),
            wf("A", "C", RunState::Waiting),
            wf("B", "D", RunState::Waiting),
            wf("C", "D", RunState::Waiting),
            wf("D", END_NODE, RunState::Waiting),
        ]);

        assert_eq!(graph.predecessors("D").len(), 2);
        assert_eq!(graph.successors("A").len(), 2);
        assert!(graph.get("A", "B").is_some());
        assert!(graph.get("B", "A").is_none());
        assert!(graph.any_match(|w| w.run_state == RunState::Running));
        assert!(!graph.all_match(|w| w.is_terminal()));
    }
}
