use std::collections::{HashMap, HashSet, VecDeque};

use crate::model::definition::{Edge, WorkflowDefinition};
use crate::runtime::context::WorkflowContext;

/// 从 Definition 派生的导航结构 (邻接表 + 反向邻接表)
/// 每次执行尝试重建一次，构建后不再修改。允许环：
/// 终止性由边条件负责，validate 不做环检测。
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    step_names: HashSet<String>,
    adjacency: HashMap<String, Vec<Edge>>,
    reverse: HashMap<String, Vec<String>>,
    initial_step: String,
    terminal_steps: HashSet<String>,
}

impl WorkflowGraph {
    pub fn new(definition: &WorkflowDefinition) -> Self {
        let mut adjacency: HashMap<String, Vec<Edge>> = HashMap::new();
        let mut reverse: HashMap<String, Vec<String>> = HashMap::new();

        for edge in &definition.edges {
            adjacency
                .entry(edge.source.clone())
                .or_default()
                .push(edge.clone());
            reverse
                .entry(edge.target.clone())
                .or_default()
                .push(edge.source.clone());
        }

        Self {
            step_names: definition.steps.keys().cloned().collect(),
            adjacency,
            reverse,
            initial_step: definition.initial_step.clone(),
            terminal_steps: definition.terminal_steps.clone(),
        }
    }

    pub fn outgoing(&self, step: &str) -> &[Edge] {
        self.adjacency.get(step).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn predecessors(&self, step: &str) -> &[String] {
        self.reverse.get(step).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 求值所有出边，返回条件为真的全部目标。
    /// 零个 ⇒ 视为完成；一个 ⇒ 顺序推进；多个 ⇒ 并行扇出。
    /// 没有隐式默认边：无条件边和条件边可以同时命中。
    pub fn get_next_steps(&self, current: &str, ctx: &WorkflowContext) -> Vec<String> {
        let mut targets = Vec::new();
        for edge in self.outgoing(current) {
            let passes = match &edge.condition {
                None => true,
                Some(cond) => cond.evaluate(ctx),
            };
            if passes {
                targets.push(edge.target.clone());
            }
        }
        targets
    }

    /// 终点判定：显式声明为 terminal，或者没有任何出边 (隐式终点)。
    pub fn is_terminal(&self, step: &str) -> bool {
        self.terminal_steps.contains(step) || self.outgoing(step).is_empty()
    }

    /// 结构校验。返回人类可读的问题列表；空列表表示通过。
    /// 不检测环 —— 环是允许的。
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        // (a) initial step must exist
        if self.initial_step.is_empty() {
            errors.push("no initial step declared".to_string());
        } else if !self.step_names.contains(&self.initial_step) {
            errors.push(format!(
                "initial step '{}' is not a declared step",
                self.initial_step
            ));
        }

        // (b) every edge endpoint must resolve to a declared step
        for (source, edges) in &self.adjacency {
            if !self.step_names.contains(source) {
                errors.push(format!("edge source '{}' is not a declared step", source));
            }
            for edge in edges {
                if !self.step_names.contains(&edge.target) {
                    errors.push(format!(
                        "edge target '{}' (from '{}') is not a declared step",
                        edge.target, edge.source
                    ));
                }
            }
        }

        // terminal declarations must also resolve
        for terminal in &self.terminal_steps {
            if !self.step_names.contains(terminal) {
                errors.push(format!(
                    "terminal step '{}' is not a declared step",
                    terminal
                ));
            }
        }

        // (c) reachability from the initial step (terminal steps exempted)
        let reachable = self.reachable_from_initial();
        let mut unreachable: Vec<&String> = self
            .step_names
            .iter()
            .filter(|name| !reachable.contains(*name) && !self.terminal_steps.contains(*name))
            .collect();
        unreachable.sort();
        for name in unreachable {
            errors.push(format!(
                "step '{}' is not reachable from initial step '{}'",
                name, self.initial_step
            ));
        }

        // (d) every non-terminal step needs at least one outgoing edge
        let mut dead_ends: Vec<&String> = self
            .step_names
            .iter()
            .filter(|name| !self.terminal_steps.contains(*name) && self.outgoing(name).is_empty())
            .collect();
        dead_ends.sort();
        for name in dead_ends {
            errors.push(format!(
                "step '{}' has no outgoing edges and is not declared terminal",
                name
            ));
        }

        errors
    }

    fn reachable_from_initial(&self) -> HashSet<String> {
        let mut visited = HashSet::new();
        if !self.step_names.contains(&self.initial_step) {
            return visited;
        }
        let mut queue = VecDeque::new();
        visited.insert(self.initial_step.clone());
        queue.push_back(self.initial_step.clone());
        while let Some(current) = queue.pop_front() {
            for edge in self.outgoing(&current) {
                if visited.insert(edge.target.clone()) {
                    queue.push_back(edge.target.clone());
                }
            }
        }
        visited
    }

    /// 诊断工具：枚举 start→end 的路径 (DFS，路径内去重防环，上限 max_paths)。
    /// 运行循环不使用它。
    pub fn get_all_paths(&self, start: &str, end: &str, max_paths: usize) -> Vec<Vec<String>> {
        let mut paths = Vec::new();
        let mut current_path = vec![start.to_string()];
        let mut in_path: HashSet<String> = current_path.iter().cloned().collect();
        self.dfs_paths(start, end, max_paths, &mut current_path, &mut in_path, &mut paths);
        paths
    }

    fn dfs_paths(
        &self,
        current: &str,
        end: &str,
        max_paths: usize,
        current_path: &mut Vec<String>,
        in_path: &mut HashSet<String>,
        paths: &mut Vec<Vec<String>>,
    ) {
        if paths.len() >= max_paths {
            return;
        }
        if current == end {
            paths.push(current_path.clone());
            return;
        }
        for edge in self.outgoing(current) {
            if in_path.contains(&edge.target) {
                continue; // cycle guard
            }
            current_path.push(edge.target.clone());
            in_path.insert(edge.target.clone());
            self.dfs_paths(&edge.target, end, max_paths, current_path, in_path, paths);
            in_path.remove(&edge.target);
            current_path.pop();
        }
    }

    /// BFS 最短路径深度；从初始步骤不可达时返回 -1。
    pub fn get_step_depth(&self, step: &str) -> i64 {
        if step == self.initial_step {
            return 0;
        }
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(self.initial_step.clone());
        queue.push_back((self.initial_step.clone(), 0i64));
        while let Some((current, depth)) = queue.pop_front() {
            for edge in self.outgoing(&current) {
                if edge.target == step {
                    return depth + 1;
                }
                if visited.insert(edge.target.clone()) {
                    queue.push_back((edge.target.clone(), depth + 1));
                }
            }
        }
        -1
    }
}
