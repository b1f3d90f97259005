//! Dependency analysis and wave planning.
//!
//! The analyzer is a pure function from a task list to an `ExecutionPlan`:
//! an ordered list of waves where every task's dependencies live in a
//! strictly earlier wave. Cyclic inputs are rejected before any wave is
//! computed; the error names the full cycle path.

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A batch of tasks whose dependencies are all satisfied by earlier waves.
///
/// Wave numbers are 1-based and strictly increasing across a plan. Task
/// order within a wave is input order; consumers get no further guarantee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wave {
    pub number: usize,
    pub tasks: Vec<Task>,
}

impl Wave {
    pub fn task_ids(&self) -> Vec<&TaskId> {
        self.tasks.iter().map(|t| &t.id).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Derived scheduling artifact. Immutable once produced; a changed task
/// set requires a fresh `DependencyAnalyzer::analyze` run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub waves: Vec<Wave>,
    pub total_tasks: usize,
    /// `max(1, max over waves of min(wave len, max_parallel))`.
    pub estimated_parallelism: usize,
}

impl ExecutionPlan {
    pub fn wave_count(&self) -> usize {
        self.waves.len()
    }

    /// Tasks assigned to the 1-based wave `number`, if such a wave exists.
    pub fn tasks_in_wave(&self, number: usize) -> Option<&[Task]> {
        self.waves
            .iter()
            .find(|w| w.number == number)
            .map(|w| w.tasks.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }
}

/// Node coloring for the cycle-detection DFS.
#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InStack,
    Done,
}

/// Pure planner: task list in, wave plan (or cycle error) out.
pub struct DependencyAnalyzer;

impl DependencyAnalyzer {
    /// Compute an execution plan for `tasks` under the given parallelism
    /// ceiling.
    ///
    /// Dependency ids that don't correspond to any task in the input are
    /// silently dropped and treated as already satisfied. `max_parallel`
    /// is clamped to at least 1.
    ///
    /// # Errors
    ///
    /// `DependencyCycle` for any direct or transitive cycle (including a
    /// self-dependency); no partial plan is ever returned for cyclic
    /// input. `PlanValidation` if a wave pass makes no progress, which is
    /// unreachable once cycles are excluded.
    pub fn analyze(tasks: &[Task], max_parallel: usize) -> Result<ExecutionPlan> {
        let max_parallel = max_parallel.max(1);

        // First occurrence wins; identity is the id.
        let mut seen = HashSet::new();
        let unique: Vec<&Task> = tasks.iter().filter(|t| seen.insert(&t.id)).collect();
        let known: HashSet<&TaskId> = unique.iter().map(|t| &t.id).collect();

        // Dependency edges point from dependency to dependent.
        let mut graph: DiGraph<TaskId, ()> = DiGraph::new();
        let mut index: HashMap<&TaskId, NodeIndex> = HashMap::new();
        for task in &unique {
            let ix = graph.add_node(task.id.clone());
            index.insert(&task.id, ix);
        }
        for task in &unique {
            for dep in &task.dependencies {
                if let Some(&dep_ix) = index.get(dep) {
                    graph.add_edge(dep_ix, index[&task.id], ());
                }
            }
        }

        if let Some(cycle) = find_cycle(&graph) {
            return Err(Error::DependencyCycle { cycle });
        }

        // Greedy wave assignment: each pass collects every unassigned task
        // whose known dependencies already sit in an earlier wave.
        let mut assigned: HashMap<&TaskId, usize> = HashMap::new();
        let mut waves: Vec<Wave> = Vec::new();
        while assigned.len() < unique.len() {
            let number = waves.len() + 1;
            let mut wave_tasks: Vec<Task> = Vec::new();
            for task in &unique {
                if assigned.contains_key(&task.id) {
                    continue;
                }
                let ready = task
                    .dependencies
                    .iter()
                    .filter(|d| known.contains(d))
                    .all(|d| assigned.contains_key(d));
                if ready {
                    wave_tasks.push((*task).clone());
                }
            }
            if wave_tasks.is_empty() {
                return Err(Error::PlanValidation(format!(
                    "wave {} made no progress with {} tasks unassigned",
                    number,
                    unique.len() - assigned.len()
                )));
            }
            for task in &wave_tasks {
                let id = known.get(&task.id).copied();
                if let Some(id) = id {
                    assigned.insert(id, number);
                }
            }
            waves.push(Wave {
                number,
                tasks: wave_tasks,
            });
        }

        let estimated_parallelism = waves
            .iter()
            .map(|w| w.len().min(max_parallel))
            .max()
            .unwrap_or(1)
            .max(1);

        Ok(ExecutionPlan {
            total_tasks: unique.len(),
            estimated_parallelism,
            waves,
        })
    }

    /// True iff no other task in the same wave is a dependency of `task_id`.
    ///
    /// Always true for waves produced by `analyze`; exposed as an
    /// assertion hook for plan consumers.
    pub fn can_run_concurrently(task_id: &TaskId, wave: &Wave) -> bool {
        let Some(task) = wave.tasks.iter().find(|t| &t.id == task_id) else {
            return false;
        };
        !wave
            .tasks
            .iter()
            .any(|other| other.id != *task_id && task.dependencies.contains(&other.id))
    }

    /// Assert structural soundness of a plan against its source task list.
    ///
    /// Checks full coverage, no duplicate assignment, and that every known
    /// dependency sits in a strictly lower-numbered wave. A failure here
    /// indicates a programming error in plan construction, not a
    /// user-facing condition.
    pub fn validate_plan(plan: &ExecutionPlan, tasks: &[Task]) -> Result<()> {
        let mut seen = HashSet::new();
        let unique: Vec<&Task> = tasks.iter().filter(|t| seen.insert(&t.id)).collect();
        let known: HashSet<&TaskId> = unique.iter().map(|t| &t.id).collect();

        let mut wave_of: HashMap<&TaskId, usize> = HashMap::new();
        for wave in &plan.waves {
            for task in &wave.tasks {
                if !known.contains(&task.id) {
                    return Err(Error::PlanValidation(format!(
                        "plan contains unknown task {}",
                        task.id
                    )));
                }
                if wave_of.insert(&task.id, wave.number).is_some() {
                    return Err(Error::PlanValidation(format!(
                        "task {} assigned to more than one wave",
                        task.id
                    )));
                }
            }
        }

        for task in &unique {
            let Some(&own_wave) = wave_of.get(&task.id) else {
                return Err(Error::PlanValidation(format!(
                    "task {} missing from plan",
                    task.id
                )));
            };
            for dep in &task.dependencies {
                if let Some(&dep_wave) = wave_of.get(dep) {
                    if dep_wave >= own_wave {
                        return Err(Error::PlanValidation(format!(
                            "dependency {} of {} is in wave {} but dependent is in wave {}",
                            dep, task.id, dep_wave, own_wave
                        )));
                    }
                }
            }
        }

        if plan.total_tasks != unique.len() {
            return Err(Error::PlanValidation(format!(
                "plan claims {} tasks but input has {}",
                plan.total_tasks,
                unique.len()
            )));
        }

        Ok(())
    }
}

/// Depth-first search with a recursion stack. Returns the ordered cycle
/// path when one exists; a self-dependency yields a single-element path.
fn find_cycle(graph: &DiGraph<TaskId, ()>) -> Option<Vec<TaskId>> {
    let mut marks = vec![Mark::Unvisited; graph.node_count()];
    let mut stack: Vec<NodeIndex> = Vec::new();
    for start in graph.node_indices() {
        if marks[start.index()] == Mark::Unvisited {
            if let Some(cycle) = dfs(graph, start, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn dfs(
    graph: &DiGraph<TaskId, ()>,
    node: NodeIndex,
    marks: &mut [Mark],
    stack: &mut Vec<NodeIndex>,
) -> Option<Vec<TaskId>> {
    marks[node.index()] = Mark::InStack;
    stack.push(node);

    for next in graph.neighbors(node) {
        match marks[next.index()] {
            Mark::InStack => {
                // Everything from the first occurrence of `next` onward
                // forms the cycle, in traversal order.
                let pos = stack
                    .iter()
                    .position(|&n| n == next)
                    .unwrap_or(stack.len() - 1);
                return Some(stack[pos..].iter().map(|&n| graph[n].clone()).collect());
            }
            Mark::Unvisited => {
                if let Some(cycle) = dfs(graph, next, marks, stack) {
                    return Some(cycle);
                }
            }
            Mark::Done => {}
        }
    }

    stack.pop();
    marks[node.index()] = Mark::Done;
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(wave: &Wave) -> HashSet<&str> {
        wave.tasks.iter().map(|t| t.id.as_str()).collect()
    }

    // ========== Wave assignment ==========

    #[test]
    fn test_no_dependencies_single_wave() {
        let tasks = vec![
            Task::new("a", "A"),
            Task::new("b", "B"),
            Task::new("c", "C"),
        ];
        let plan = DependencyAnalyzer::analyze(&tasks, 10).unwrap();
        assert_eq!(plan.wave_count(), 1);
        assert_eq!(plan.waves[0].number, 1);
        assert_eq!(ids(&plan.waves[0]), ["a", "b", "c"].into_iter().collect());
        assert_eq!(plan.total_tasks, 3);
    }

    #[test]
    fn test_chain_one_task_per_wave() {
        let tasks = vec![
            Task::new("a", "A"),
            Task::new("b", "B").depends_on("a"),
            Task::new("c", "C").depends_on("b"),
        ];
        let plan = DependencyAnalyzer::analyze(&tasks, 10).unwrap();
        assert_eq!(plan.wave_count(), 3);
        assert_eq!(ids(&plan.waves[0]), ["a"].into_iter().collect());
        assert_eq!(ids(&plan.waves[1]), ["b"].into_iter().collect());
        assert_eq!(ids(&plan.waves[2]), ["c"].into_iter().collect());
    }

    #[test]
    fn test_diamond() {
        let tasks = vec![
            Task::new("a", "A"),
            Task::new("b", "B").depends_on("a"),
            Task::new("c", "C").depends_on("a"),
            Task::new("d", "D").depends_on("b").depends_on("c"),
        ];
        let plan = DependencyAnalyzer::analyze(&tasks, 10).unwrap();
        assert_eq!(plan.wave_count(), 3);
        assert_eq!(ids(&plan.waves[0]), ["a"].into_iter().collect());
        assert_eq!(ids(&plan.waves[1]), ["b", "c"].into_iter().collect());
        assert_eq!(ids(&plan.waves[2]), ["d"].into_iter().collect());
    }

    #[test]
    fn test_wave_numbers_are_one_based_and_increasing() {
        let tasks = vec![
            Task::new("a", "A"),
            Task::new("b", "B").depends_on("a"),
            Task::new("c", "C").depends_on("b"),
        ];
        let plan = DependencyAnalyzer::analyze(&tasks, 10).unwrap();
        let numbers: Vec<usize> = plan.waves.iter().map(|w| w.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn test_wave_preserves_input_order() {
        let tasks = vec![
            Task::new("z", "Z"),
            Task::new("m", "M"),
            Task::new("a", "A"),
        ];
        let plan = DependencyAnalyzer::analyze(&tasks, 10).unwrap();
        let order: Vec<&str> = plan.waves[0].tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(order, vec!["z", "m", "a"]);
    }

    #[test]
    fn test_empty_input() {
        let plan = DependencyAnalyzer::analyze(&[], 10).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.total_tasks, 0);
        assert_eq!(plan.estimated_parallelism, 1);
    }

    #[test]
    fn test_independent_chains() {
        let tasks = vec![
            Task::new("a", "A"),
            Task::new("b", "B").depends_on("a"),
            Task::new("c", "C"),
            Task::new("d", "D").depends_on("c"),
        ];
        let plan = DependencyAnalyzer::analyze(&tasks, 10).unwrap();
        assert_eq!(plan.wave_count(), 2);
        assert_eq!(ids(&plan.waves[0]), ["a", "c"].into_iter().collect());
        assert_eq!(ids(&plan.waves[1]), ["b", "d"].into_iter().collect());
    }

    // ========== Unknown dependencies ==========

    #[test]
    fn test_unknown_dependency_treated_as_satisfied() {
        let tasks = vec![Task::new("a", "A").depends_on("ghost")];
        let plan = DependencyAnalyzer::analyze(&tasks, 10).unwrap();
        assert_eq!(plan.wave_count(), 1);
        assert_eq!(ids(&plan.waves[0]), ["a"].into_iter().collect());
    }

    #[test]
    fn test_unknown_dependency_mixed_with_known() {
        let tasks = vec![
            Task::new("a", "A"),
            Task::new("b", "B").depends_on("a").depends_on("ghost"),
        ];
        let plan = DependencyAnalyzer::analyze(&tasks, 10).unwrap();
        assert_eq!(plan.wave_count(), 2);
        assert_eq!(ids(&plan.waves[1]), ["b"].into_iter().collect());
    }

    // ========== Cycle detection ==========

    #[test]
    fn test_self_dependency_is_cycle() {
        let tasks = vec![Task::new("a", "A").depends_on("a")];
        let err = DependencyAnalyzer::analyze(&tasks, 10).unwrap_err();
        match err {
            Error::DependencyCycle { cycle } => {
                assert_eq!(cycle, vec![TaskId::from("a")]);
            }
            other => panic!("expected DependencyCycle, got {:?}", other),
        }
    }

    #[test]
    fn test_two_task_cycle() {
        let tasks = vec![
            Task::new("a", "A").depends_on("b"),
            Task::new("b", "B").depends_on("a"),
        ];
        let err = DependencyAnalyzer::analyze(&tasks, 10).unwrap_err();
        match err {
            Error::DependencyCycle { cycle } => {
                assert_eq!(cycle.len(), 2);
                assert!(cycle.contains(&TaskId::from("a")));
                assert!(cycle.contains(&TaskId::from("b")));
            }
            other => panic!("expected DependencyCycle, got {:?}", other),
        }
    }

    #[test]
    fn test_transitive_cycle() {
        let tasks = vec![
            Task::new("a", "A").depends_on("c"),
            Task::new("b", "B").depends_on("a"),
            Task::new("c", "C").depends_on("b"),
        ];
        let err = DependencyAnalyzer::analyze(&tasks, 10).unwrap_err();
        match err {
            Error::DependencyCycle { cycle } => {
                assert_eq!(cycle.len(), 3);
            }
            other => panic!("expected DependencyCycle, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_aborts_even_with_valid_subgraph() {
        // Acyclic tasks alongside a cycle: no partial plan is returned.
        let tasks = vec![
            Task::new("ok-1", "Fine"),
            Task::new("ok-2", "Fine").depends_on("ok-1"),
            Task::new("x", "X").depends_on("y"),
            Task::new("y", "Y").depends_on("x"),
        ];
        let result = DependencyAnalyzer::analyze(&tasks, 10);
        assert!(matches!(result, Err(Error::DependencyCycle { .. })));
    }

    // ========== Parallelism estimate ==========

    #[test]
    fn test_estimated_parallelism_wide_wave() {
        let tasks: Vec<Task> = (0..7).map(|i| Task::new(format!("t{}", i), "T")).collect();
        let plan = DependencyAnalyzer::analyze(&tasks, 10).unwrap();
        assert_eq!(plan.estimated_parallelism, 7);
    }

    #[test]
    fn test_estimated_parallelism_clamped_by_max_parallel() {
        let tasks: Vec<Task> = (0..20).map(|i| Task::new(format!("t{}", i), "T")).collect();
        let plan = DependencyAnalyzer::analyze(&tasks, 4).unwrap();
        assert_eq!(plan.estimated_parallelism, 4);
    }

    #[test]
    fn test_estimated_parallelism_never_below_one() {
        let tasks = vec![Task::new("a", "A")];
        let plan = DependencyAnalyzer::analyze(&tasks, 10).unwrap();
        assert_eq!(plan.estimated_parallelism, 1);
    }

    #[test]
    fn test_max_parallel_zero_clamped_to_one() {
        let tasks = vec![Task::new("a", "A"), Task::new("b", "B")];
        let plan = DependencyAnalyzer::analyze(&tasks, 0).unwrap();
        assert_eq!(plan.estimated_parallelism, 1);
    }

    // ========== Plan accessors ==========

    #[test]
    fn test_tasks_in_wave() {
        let tasks = vec![Task::new("a", "A"), Task::new("b", "B").depends_on("a")];
        let plan = DependencyAnalyzer::analyze(&tasks, 10).unwrap();
        assert_eq!(plan.tasks_in_wave(1).unwrap().len(), 1);
        assert_eq!(plan.tasks_in_wave(2).unwrap()[0].id, TaskId::from("b"));
        assert!(plan.tasks_in_wave(3).is_none());
        assert!(plan.tasks_in_wave(0).is_none());
    }

    #[test]
    fn test_can_run_concurrently() {
        let tasks = vec![
            Task::new("a", "A"),
            Task::new("b", "B").depends_on("a"),
            Task::new("c", "C").depends_on("a"),
        ];
        let plan = DependencyAnalyzer::analyze(&tasks, 10).unwrap();
        let wave2 = &plan.waves[1];
        assert!(DependencyAnalyzer::can_run_concurrently(
            &TaskId::from("b"),
            wave2
        ));
        assert!(DependencyAnalyzer::can_run_concurrently(
            &TaskId::from("c"),
            wave2
        ));
        // A task outside the wave can't be vouched for.
        assert!(!DependencyAnalyzer::can_run_concurrently(
            &TaskId::from("a"),
            wave2
        ));

        // Hand-built wave violating the invariant.
        let bad_wave = Wave {
            number: 1,
            tasks: vec![Task::new("a", "A"), Task::new("b", "B").depends_on("a")],
        };
        assert!(!DependencyAnalyzer::can_run_concurrently(
            &TaskId::from("b"),
            &bad_wave
        ));
    }

    // ========== validate_plan ==========

    #[test]
    fn test_validate_plan_accepts_analyzer_output() {
        let tasks = vec![
            Task::new("a", "A"),
            Task::new("b", "B").depends_on("a"),
            Task::new("c", "C").depends_on("a"),
            Task::new("d", "D").depends_on("b").depends_on("c"),
        ];
        let plan = DependencyAnalyzer::analyze(&tasks, 10).unwrap();
        DependencyAnalyzer::validate_plan(&plan, &tasks).unwrap();
    }

    #[test]
    fn test_validate_plan_rejects_missing_task() {
        let tasks = vec![Task::new("a", "A"), Task::new("b", "B")];
        let mut plan = DependencyAnalyzer::analyze(&tasks, 10).unwrap();
        plan.waves[0].tasks.pop();
        let err = DependencyAnalyzer::validate_plan(&plan, &tasks).unwrap_err();
        assert!(matches!(err, Error::PlanValidation(_)));
    }

    #[test]
    fn test_validate_plan_rejects_duplicate_assignment() {
        let tasks = vec![Task::new("a", "A")];
        let mut plan = DependencyAnalyzer::analyze(&tasks, 10).unwrap();
        let dup = plan.waves[0].tasks[0].clone();
        plan.waves.push(Wave {
            number: 2,
            tasks: vec![dup],
        });
        let err = DependencyAnalyzer::validate_plan(&plan, &tasks).unwrap_err();
        assert!(matches!(err, Error::PlanValidation(_)));
    }

    #[test]
    fn test_validate_plan_rejects_dependency_ordering_violation() {
        let tasks = vec![Task::new("a", "A"), Task::new("b", "B").depends_on("a")];
        let plan = ExecutionPlan {
            waves: vec![Wave {
                number: 1,
                tasks: vec![tasks[0].clone(), tasks[1].clone()],
            }],
            total_tasks: 2,
            estimated_parallelism: 2,
        };
        let err = DependencyAnalyzer::validate_plan(&plan, &tasks).unwrap_err();
        assert!(matches!(err, Error::PlanValidation(_)));
    }

    // ========== Misc ==========

    #[test]
    fn test_duplicate_task_ids_first_occurrence_wins() {
        let tasks = vec![
            Task::new("a", "first"),
            Task::new("a", "second"),
            Task::new("b", "B").depends_on("a"),
        ];
        let plan = DependencyAnalyzer::analyze(&tasks, 10).unwrap();
        assert_eq!(plan.total_tasks, 2);
        assert_eq!(plan.waves[0].tasks[0].title, "first");
    }

    #[test]
    fn test_plan_serialization_roundtrip() {
        let tasks = vec![Task::new("a", "A"), Task::new("b", "B").depends_on("a")];
        let plan = DependencyAnalyzer::analyze(&tasks, 10).unwrap();
        let json = serde_json::to_string(&plan).unwrap();
        let parsed: ExecutionPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.wave_count(), 2);
        assert_eq!(parsed.total_tasks, 2);
    }
}
