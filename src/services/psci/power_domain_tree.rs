// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The power domain tree: one root (the whole SoC), one non-CPU node per cluster, and one
//! CPU node per core. Local states are coordinated bottom-up by min-folding each node's
//! descendant requests, so a cluster or the system root can only go as deep as its shallowest
//! running descendant allows.

use crate::platform::{Platform, PlatformImpl};
use arm_psci::{AffinityInfo, EntryPoint};
use arrayvec::ArrayVec;
use core::{
    fmt::{self, Debug, Formatter},
    ops::Range,
    slice::{Iter, IterMut},
};
use spin::mutex::{SpinMutex, SpinMutexGuard};

/// The local power state of a single power domain node.
///
/// Ordered from shallowest to deepest so that folding a set of requested states down to their
/// minimum (via `Ord::min`) always yields the shallowest state that satisfies every requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LocalPowerState {
    #[default]
    On,
    IdleStandby,
    Off,
}

/// The CPU power level, the lowest level in the tree.
pub const CPU_POWER_LEVEL: usize = 0;
/// The cluster power level.
pub const CLUSTER_POWER_LEVEL: usize = 1;
/// The system power level, the highest level in the tree.
pub const MAX_POWER_LEVEL: usize = 2;

/// The local state of a CPU and all of its ancestor non-CPU nodes, indexed by power level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositePowerState {
    pub states: [LocalPowerState; MAX_POWER_LEVEL + 1],
}

impl CompositePowerState {
    pub const OFF: Self = Self {
        states: [LocalPowerState::Off; MAX_POWER_LEVEL + 1],
    };

    pub const ON: Self = Self {
        states: [LocalPowerState::On; MAX_POWER_LEVEL + 1],
    };

    pub fn cpu_level_state(&self) -> LocalPowerState {
        self.states[CPU_POWER_LEVEL]
    }

    /// Finds the highest power level that is not fully running.
    pub fn find_highest_non_run_level(&self) -> Option<usize> {
        self.states.iter().rposition(|state| *state != LocalPowerState::On)
    }

    /// Finds the highest power level requesting a power-down (`Off`) state.
    pub fn find_highest_power_down_level(&self) -> Option<usize> {
        self.states
            .iter()
            .rposition(|state| *state == LocalPowerState::Off)
    }

    /// Requests this state for each ancestor node and folds the requested state down to the
    /// minimal value permitted by every descendant's request, level by level.
    pub fn coordinate_state(&mut self, cpu_index: usize, ancestors: &mut AncestorPowerDomains) {
        let mut higher_levels_are_run = false;

        for (node, state) in ancestors
            .iter_mut()
            .zip(&mut self.states[CPU_POWER_LEVEL + 1..])
        {
            node.set_requested_power_state(cpu_index, *state);

            if !higher_levels_are_run {
                node.set_minimal_allowed_state();
                *state = node.local_state();

                if *state == LocalPowerState::On {
                    higher_levels_are_run = true;
                }
            } else {
                *state = LocalPowerState::On;
            }
        }
    }

    /// Checks that the composite state does not violate the tree's coordination rules: there
    /// must be a non-running level, and levels must be monotonically non-increasing from the
    /// root down (an ancestor can never be deeper than one of its descendants).
    pub fn is_valid_suspend_request(&self, is_power_down_state: bool) -> bool {
        if self.find_highest_non_run_level().is_none() {
            return false;
        }

        if !self.states.is_sorted_by(|a, b| a >= b) {
            return false;
        }

        if is_power_down_state {
            self.find_highest_power_down_level().is_some()
        } else {
            self.find_highest_power_down_level().is_none()
        }
    }
}

/// A non-CPU (cluster or system root) power domain node.
#[derive(Debug)]
pub struct NonCpuPowerNode {
    parent: Option<usize>,
    local_state: LocalPowerState,
    cpu_range: Range<usize>,
    requested_states: ArrayVec<LocalPowerState, { PowerDomainTree::CPU_DOMAIN_COUNT }>,
}

impl NonCpuPowerNode {
    pub fn new(parent: Option<usize>) -> Self {
        Self {
            parent,
            local_state: LocalPowerState::Off,
            cpu_range: 0..0,
            requested_states: ArrayVec::new(),
        }
    }

    fn assign_cpu(&mut self, cpu_index: usize) {
        if self.cpu_range.is_empty() {
            self.cpu_range = cpu_index..cpu_index + 1;
        } else {
            debug_assert_eq!(self.cpu_range.end, cpu_index);
            self.cpu_range.end += 1;
        }

        self.requested_states.push(LocalPowerState::Off);
    }

    pub fn set_requested_power_state(&mut self, cpu_index: usize, state: LocalPowerState) {
        assert!(self.cpu_range.contains(&cpu_index));
        self.requested_states[cpu_index - self.cpu_range.start] = state;
    }

    /// True if every descendant CPU other than `cpu_index` has requested a non-running state.
    pub fn is_last_cpu_to_idle(&self, cpu_index: usize) -> bool {
        let local_cpu_index = cpu_index - self.cpu_range.start;
        self.requested_states
            .iter()
            .enumerate()
            .filter(|&(i, state)| {
                if i == local_cpu_index {
                    assert_eq!(*state, LocalPowerState::On);
                    false
                } else {
                    true
                }
            })
            .all(|(_, state)| *state != LocalPowerState::On)
    }

    /// Sets the local state to the shallowest state permitted by all descendant requests.
    pub fn set_minimal_allowed_state(&mut self) {
        self.local_state = *self.requested_states.iter().min().unwrap();
    }

    pub fn local_state(&self) -> LocalPowerState {
        self.local_state
    }

    pub fn set_local_state(&mut self, local_state: LocalPowerState) {
        self.local_state = local_state;
    }
}

/// A CPU power domain node, the leaf level of the tree.
#[derive(Debug)]
pub struct CpuPowerNode {
    parent: usize,
    affinity_info: AffinityInfo,
    local_state: LocalPowerState,
    entry_point: Option<EntryPoint>,
}

impl CpuPowerNode {
    pub fn new(parent: usize) -> Self {
        Self {
            parent,
            affinity_info: AffinityInfo::Off,
            local_state: LocalPowerState::Off,
            entry_point: None,
        }
    }

    pub fn affinity_info(&self) -> AffinityInfo {
        self.affinity_info
    }

    pub fn set_affinity_info(&mut self, affinity_info: AffinityInfo) {
        self.affinity_info = affinity_info;
    }

    pub fn local_state(&self) -> LocalPowerState {
        self.local_state
    }

    pub fn set_local_state(&mut self, local_state: LocalPowerState) {
        self.local_state = local_state;
    }

    /// Writes the spintable entry for this CPU, overwriting any previous value the way a real
    /// spintable slot would.
    pub fn set_entry_point(&mut self, entry_point: EntryPoint) {
        self.entry_point = Some(entry_point);
    }

    pub fn pop_entry_point(&mut self) -> Option<EntryPoint> {
        self.entry_point.take()
    }
}

/// A lock-guarded list of a CPU's ancestor non-CPU nodes, from the CPU's immediate parent up to
/// (at most) the system root. Locked lowest-level first; released in reverse order on drop, to
/// keep a single consistent lock order across the whole tree.
#[derive(Debug)]
pub struct AncestorPowerDomains<'a> {
    list: ArrayVec<SpinMutexGuard<'a, NonCpuPowerNode>, MAX_POWER_LEVEL>,
}

impl<'a> AncestorPowerDomains<'a> {
    fn new_with_max_level(
        index: usize,
        max_level: usize,
        mutexes: &'a [SpinMutex<NonCpuPowerNode>],
    ) -> Self {
        let mut list = ArrayVec::new();
        let mut parent = Some(index);
        let mut level = CPU_POWER_LEVEL + 1;

        while let Some(index) = parent {
            assert!(level <= MAX_POWER_LEVEL);
            if level > max_level {
                break;
            }

            let locked = mutexes[index].lock();
            parent = locked.parent;
            list.push(locked);
            level += 1;
        }

        Self { list }
    }

    pub fn iter(&self) -> Iter<'_, SpinMutexGuard<'a, NonCpuPowerNode>> {
        self.list.iter()
    }

    pub fn iter_mut(&mut self) -> IterMut<'_, SpinMutexGuard<'a, NonCpuPowerNode>> {
        self.list.iter_mut()
    }

    /// True if every other CPU under the node at `end_power_level` has already idled.
    pub fn is_last_cpu_to_idle_at_power_level(&self, cpu_index: usize, end_power_level: usize) -> bool {
        if end_power_level == CPU_POWER_LEVEL {
            return true;
        }

        self.list[end_power_level - 1].is_last_cpu_to_idle(cpu_index)
    }
}

impl Drop for AncestorPowerDomains<'_> {
    fn drop(&mut self) {
        while let Some(guard) = self.list.pop() {
            drop(guard);
        }
    }
}

/// Stores every non-CPU and CPU power domain node and provides safe, deadlock-free access to
/// them by always locking from the CPU level up toward the root.
pub struct PowerDomainTree {
    non_cpu_power_nodes: ArrayVec<SpinMutex<NonCpuPowerNode>, { Self::NON_CPU_DOMAIN_COUNT }>,
    cpu_power_nodes: ArrayVec<SpinMutex<CpuPowerNode>, { Self::CPU_DOMAIN_COUNT }>,
}

impl PowerDomainTree {
    pub const CPU_DOMAIN_COUNT: usize = PlatformImpl::CORE_COUNT;
    const NON_CPU_DOMAIN_COUNT: usize = PlatformImpl::TOPOLOGY.num_clusters() + 1;

    /// Builds the tree from a breadth-first child-count table (see [`Topology`](super::topology::Topology)).
    pub fn new(topology: super::topology::Topology) -> Self {
        let topology = topology.0;

        let mut non_cpu_power_nodes: ArrayVec<
            SpinMutex<NonCpuPowerNode>,
            { Self::NON_CPU_DOMAIN_COUNT },
        > = ArrayVec::new();
        let mut node_index = 0..Self::NON_CPU_DOMAIN_COUNT;
        let mut node_count: usize = 1;
        let mut parent_node_index: usize = 0;
        let mut parent_node = None;

        for _ in CPU_POWER_LEVEL + 1..=MAX_POWER_LEVEL {
            let mut next_level_node_count = 0;

            for _ in 0..node_count {
                let child_count = topology[parent_node_index];

                for _ in (&mut node_index).take(child_count) {
                    non_cpu_power_nodes.push(SpinMutex::new(NonCpuPowerNode::new(parent_node)));
                }

                parent_node = Some(parent_node_index);
                next_level_node_count += child_count;
                parent_node_index += 1;
            }

            node_count = next_level_node_count;
        }

        debug_assert!(node_index.is_empty());

        let mut cpu_power_nodes = ArrayVec::new();
        let mut node_index = 0..Self::CPU_DOMAIN_COUNT;
        for num_children in &topology[parent_node_index..] {
            for cpu_index in (&mut node_index).take(*num_children) {
                cpu_power_nodes.push(SpinMutex::new(CpuPowerNode::new(parent_node_index - 1)));
                Self::assign_cpu(&non_cpu_power_nodes, parent_node_index - 1, cpu_index);
            }

            parent_node_index += 1;
        }

        debug_assert!(node_index.is_empty());

        PowerDomainTree {
            non_cpu_power_nodes,
            cpu_power_nodes,
        }
    }

    fn assign_cpu(non_cpu_power_nodes: &[SpinMutex<NonCpuPowerNode>], parent_index: usize, cpu_index: usize) {
        let mut node = non_cpu_power_nodes[parent_index].lock();
        node.assign_cpu(cpu_index);
        if let Some(parent_index) = node.parent {
            Self::assign_cpu(non_cpu_power_nodes, parent_index, cpu_index);
        }
    }

    /// True if `cpu_index` is on and every other CPU in the system is off.
    pub fn is_last_cpu(&self, cpu_index: usize) -> bool {
        self.cpu_power_nodes.iter().enumerate().all(|(index, cpu)| {
            let locked_cpu = cpu.lock();
            if index == cpu_index {
                assert_eq!(locked_cpu.affinity_info(), AffinityInfo::On);
                true
            } else {
                locked_cpu.affinity_info() == AffinityInfo::Off
            }
        })
    }

    pub fn locked_cpu_node(&self, cpu_index: usize) -> SpinMutexGuard<'_, CpuPowerNode> {
        self.cpu_power_nodes[cpu_index].lock()
    }

    pub fn with_ancestors_locked<F, T>(&self, cpu: &mut CpuPowerNode, f: F) -> T
    where
        F: FnOnce(&mut CpuPowerNode, AncestorPowerDomains<'_>) -> T,
    {
        self.with_ancestors_locked_to_max_level(cpu, MAX_POWER_LEVEL, f)
    }

    pub fn with_ancestors_locked_to_max_level<F, T>(&self, cpu: &mut CpuPowerNode, max_level: usize, f: F) -> T
    where
        F: FnOnce(&mut CpuPowerNode, AncestorPowerDomains<'_>) -> T,
    {
        let lock_list =
            AncestorPowerDomains::new_with_max_level(cpu.parent, max_level, &self.non_cpu_power_nodes);
        f(cpu, lock_list)
    }

    pub fn are_all_cpus_on(&self) -> bool {
        self.cpu_power_nodes
            .iter()
            .all(|core| core.lock().affinity_info() == AffinityInfo::On)
    }
}

impl Debug for PowerDomainTree {
    /// Outputs the tree in Graphviz DOT format.
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        writeln!(f, "digraph {{")?;
        for (index, ncpu) in self.non_cpu_power_nodes.iter().enumerate() {
            if let Some(nc) = ncpu.try_lock() {
                writeln!(f, "NC{index} [label=\"{nc:#?}\"]")?;
                if let Some(parent) = nc.parent {
                    writeln!(f, "NC{parent} -> NC{index}")?;
                }
            } else {
                writeln!(f, "NC{index} [label=\"NonCpuPowerNode is locked\"]")?;
            }
        }

        for (index, cpu) in self.cpu_power_nodes.iter().enumerate() {
            if let Some(c) = cpu.try_lock() {
                writeln!(f, "C{index} [label=\"{c:#?}\"]")?;
                writeln!(f, "NC{} -> C{}", c.parent, index)?;
            } else {
                writeln!(f, "C{index} [label=\"CpuPowerNode is locked\"]")?;
            }
        }

        writeln!(f, "}}")?;

        Ok(())
    }
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;

    /// Sets a CPU's local and requested state, propagated up through its ancestors.
    pub fn set_cpu_power_state_by_index(tree: &PowerDomainTree, cpu_index: usize, state: LocalPowerState) {
        let mut cpu = tree.locked_cpu_node(cpu_index);
        tree.with_ancestors_locked(&mut cpu, |cpu, mut ancestors| {
            cpu.set_local_state(state);
            for node in ancestors.iter_mut() {
                node.set_requested_power_state(cpu_index, state);
                node.set_local_state(state);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::test_helpers::*;
    use super::*;
    use crate::platform::PlatformImpl;

    fn is_last_cpu_to_idle_at_power_level_helper(tree: &PowerDomainTree, cpu_index: usize, end_power_level: usize) -> bool {
        let mut cpu = tree.locked_cpu_node(cpu_index);
        tree.with_ancestors_locked_to_max_level(&mut cpu, end_power_level, |_cpu, ancestors| {
            ancestors.is_last_cpu_to_idle_at_power_level(cpu_index, end_power_level)
        })
    }

    #[test]
    fn non_cpu_power_node() {
        let mut node = NonCpuPowerNode::new(Some(1));
        assert_eq!(node.parent, Some(1));
        assert_eq!(LocalPowerState::Off, node.local_state);
        assert!(node.cpu_range.is_empty());
        assert!(node.requested_states.is_empty());

        node.assign_cpu(2);
        node.assign_cpu(3);
        assert_eq!(2..4, node.cpu_range);

        node.set_requested_power_state(3, LocalPowerState::On);
        node.set_minimal_allowed_state();
        assert_eq!(LocalPowerState::Off, node.local_state());

        node.set_requested_power_state(2, LocalPowerState::On);
        node.set_minimal_allowed_state();
        assert_eq!(LocalPowerState::On, node.local_state());
    }

    #[test]
    #[should_panic]
    fn non_cpu_power_node_invalid_cpu_request() {
        let mut node = NonCpuPowerNode::new(Some(1));
        node.assign_cpu(2);
        node.assign_cpu(3);
        node.set_requested_power_state(4, LocalPowerState::On);
    }

    #[test]
    fn cpu_power_node() {
        let mut node = CpuPowerNode::new(3);
        assert_eq!(3, node.parent);
        assert_eq!(AffinityInfo::Off, node.affinity_info());
        assert_eq!(LocalPowerState::Off, node.local_state());
        assert_eq!(None, node.pop_entry_point());

        node.set_affinity_info(AffinityInfo::On);
        node.set_local_state(LocalPowerState::On);
        assert_eq!(LocalPowerState::On, node.local_state());

        node.set_entry_point(EntryPoint::Entry64 {
            entry_point_address: 0x1000,
            context_id: 0,
        });
        assert_eq!(
            Some(EntryPoint::Entry64 {
                entry_point_address: 0x1000,
                context_id: 0,
            }),
            node.pop_entry_point()
        );
        assert_eq!(None, node.pop_entry_point());
    }

    #[test]
    fn cpu_power_node_overwrite_entry() {
        let mut node = CpuPowerNode::new(3);
        let first = EntryPoint::Entry64 {
            entry_point_address: 0x1000,
            context_id: 0,
        };
        let second = EntryPoint::Entry64 {
            entry_point_address: 0x2000,
            context_id: 1,
        };
        node.set_entry_point(first);
        node.set_entry_point(second);
        assert_eq!(node.pop_entry_point(), Some(second));
    }

    #[test]
    fn power_domain_tree_create() {
        let tree = PowerDomainTree::new(PlatformImpl::TOPOLOGY);
        assert_eq!(tree.cpu_power_nodes.len(), PlatformImpl::CORE_COUNT);
        assert_eq!(tree.non_cpu_power_nodes.len(), PlatformImpl::TOPOLOGY.num_clusters() + 1);
    }

    #[test]
    fn power_domain_tree_is_last_cpu() {
        let tree = PowerDomainTree::new(PlatformImpl::TOPOLOGY);

        tree.locked_cpu_node(0).set_affinity_info(AffinityInfo::On);
        assert!(tree.is_last_cpu(0));

        tree.locked_cpu_node(1).set_affinity_info(AffinityInfo::On);
        assert!(!tree.is_last_cpu(0));
    }

    #[test]
    fn power_domain_tree_with_ancestors_locked() {
        let tree = PowerDomainTree::new(PlatformImpl::TOPOLOGY);

        let mut cpu = tree.locked_cpu_node(0);
        tree.with_ancestors_locked_to_max_level(&mut cpu, CLUSTER_POWER_LEVEL, |_cpu, ancestors| {
            assert_eq!(1, ancestors.iter().len());
        });

        let mut cpu = tree.locked_cpu_node(0);
        tree.with_ancestors_locked(&mut cpu, |_cpu, ancestors| {
            assert_eq!(2, ancestors.iter().len());
        });
    }

    #[test]
    fn power_domain_tree_all_cpus_on() {
        let tree = PowerDomainTree::new(PlatformImpl::TOPOLOGY);
        for cpu in &tree.cpu_power_nodes {
            cpu.lock().set_affinity_info(AffinityInfo::On);
        }
        assert!(tree.are_all_cpus_on());

        tree.cpu_power_nodes[0].lock().set_affinity_info(AffinityInfo::Off);
        assert!(!tree.are_all_cpus_on());
    }

    #[test]
    fn power_domain_tree_last_cpu_idled_at_cpu_level_always_true() {
        let tree = PowerDomainTree::new(PlatformImpl::TOPOLOGY);
        assert!(is_last_cpu_to_idle_at_power_level_helper(&tree, 0, CPU_POWER_LEVEL));
    }

    #[test]
    fn power_domain_tree_last_cpu_idled_at_cluster_level() {
        let tree = PowerDomainTree::new(PlatformImpl::TOPOLOGY);
        set_cpu_power_state_by_index(&tree, 0, LocalPowerState::On);
        assert!(is_last_cpu_to_idle_at_power_level_helper(&tree, 0, CLUSTER_POWER_LEVEL));

        set_cpu_power_state_by_index(&tree, 1, LocalPowerState::On);
        assert!(!is_last_cpu_to_idle_at_power_level_helper(&tree, 0, CLUSTER_POWER_LEVEL));
    }

    #[test]
    fn composite_power_state_coordinate() {
        let tree = PowerDomainTree::new(PlatformImpl::TOPOLOGY);
        let mut cpu = tree.locked_cpu_node(0);
        let mut composite = CompositePowerState::OFF;

        tree.with_ancestors_locked(&mut cpu, |_cpu, mut ancestors| {
            composite.coordinate_state(0, &mut ancestors);
        });

        assert_eq!(composite.find_highest_power_down_level(), Some(MAX_POWER_LEVEL));
        assert!(composite.is_valid_suspend_request(true));
    }
}
