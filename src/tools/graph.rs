//! 批次依赖图
//!
//! 只在同一批次的 Action 之间建边：若 Action j 的契约依赖工具 T，则批次内所有调用 T 的 Action i
//! 都是 j 的上游。用入度表做拓扑分层（Kahn），剩余节点即构成环。

/// 图节点：工具名 + 其契约声明的依赖（未知工具没有契约，依赖为空）
pub struct BatchNode<'a> {
    pub tool: &'a str,
    pub dependencies: Vec<&'a str>,
}

pub struct BatchGraph {
    /// 邻接表：节点 -> 依赖它的节点
    dependents: Vec<Vec<usize>>,
    /// 反向邻接：节点 -> 它的上游节点
    upstream: Vec<Vec<usize>>,
}

impl BatchGraph {
    pub fn new(nodes: &[BatchNode<'_>]) -> Self {
        let mut dependents = vec![Vec::new(); nodes.len()];
        let mut upstream = vec![Vec::new(); nodes.len()];

        for (j, node) in nodes.iter().enumerate() {
            for dep in &node.dependencies {
                for (i, candidate) in nodes.iter().enumerate() {
                    if i != j && candidate.tool == *dep {
                        dependents[i].push(j);
                        upstream[j].push(i);
                    }
                }
            }
        }

        Self {
            dependents,
            upstream,
        }
    }

    pub fn len(&self) -> usize {
        self.upstream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstream.is_empty()
    }

    pub fn upstream(&self, node: usize) -> &[usize] {
        &self.upstream[node]
    }

    /// 拓扑分层：同层节点彼此无依赖；存在环时返回环上（及其下游）的节点
    pub fn waves(&self) -> Result<Vec<Vec<usize>>, Vec<usize>> {
        let mut in_degree: Vec<usize> = self.upstream.iter().map(Vec::len).collect();
        let mut current: Vec<usize> = (0..self.len()).filter(|&n| in_degree[n] == 0).collect();
        let mut waves = Vec::new();
        let mut visited = 0;

        while !current.is_empty() {
            visited += current.len();
            let mut next = Vec::new();
            for &node in &current {
                for &dependent in &self.dependents[node] {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            next.sort_unstable();
            waves.push(std::mem::replace(&mut current, next));
        }

        if visited < self.len() {
            let stuck = (0..self.len()).filter(|&n| in_degree[n] > 0).collect();
            return Err(stuck);
        }
        Ok(waves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node<'a>(tool: &'a str, deps: &[&'a str]) -> BatchNode<'a> {
        BatchNode {
            tool,
            dependencies: deps.to_vec(),
        }
    }

    #[test]
    fn test_independent_nodes_share_one_wave() {
        let graph = BatchGraph::new(&[node("a", &[]), node("b", &[]), node("c", &[])]);
        assert_eq!(graph.waves().unwrap(), vec![vec![0, 1, 2]]);
    }

    #[test]
    fn test_chain_orders_waves() {
        let graph = BatchGraph::new(&[node("c", &["b"]), node("b", &["a"]), node("a", &[])]);
        assert_eq!(graph.waves().unwrap(), vec![vec![2], vec![1], vec![0]]);
        assert_eq!(graph.upstream(0), &[1]);
    }

    #[test]
    fn test_dependency_outside_batch_is_ignored() {
        let graph = BatchGraph::new(&[node("b", &["a"])]);
        assert_eq!(graph.waves().unwrap(), vec![vec![0]]);
    }

    #[test]
    fn test_repeated_tool_fans_in() {
        let graph = BatchGraph::new(&[node("fetch", &[]), node("fetch", &[]), node("merge", &["fetch"])]);
        assert_eq!(graph.upstream(2), &[0, 1]);
        assert_eq!(graph.waves().unwrap(), vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn test_cycle_detected() {
        let graph = BatchGraph::new(&[node("a", &["b"]), node("b", &["a"]), node("c", &[])]);
        assert_eq!(graph.waves().unwrap_err(), vec![0, 1]);
    }
}
