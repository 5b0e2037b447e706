//! Path grouping engine
//!
//! Partitions a map's path list into ordered path groups according to the
//! configured policy, optionally segregating marginal paths into their own
//! trailing groups, and keeps the group list sorted by
//! (marginal ascending, priority descending, enabled paths descending).

use log::debug;

use crate::error::{CoreError, CoreResult};
use crate::structs::{move_up, Multipath, Path, PathGroup, PathRef};

/// The five grouping policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgPolicy {
    /// One group per path
    Failover,
    /// One group with all paths
    Multibus,
    /// One group per distinct serial number
    GroupBySerial,
    /// One group per distinct priority value
    GroupByPrio,
    /// One group per distinct target node name
    GroupByNodeName,
}

impl PgPolicy {
    pub fn name(self) -> &'static str {
        match self {
            PgPolicy::Failover => "failover",
            PgPolicy::Multibus => "multibus",
            PgPolicy::GroupBySerial => "group_by_serial",
            PgPolicy::GroupByPrio => "group_by_prio",
            PgPolicy::GroupByNodeName => "group_by_node_name",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "failover" => Some(PgPolicy::Failover),
            "multibus" => Some(PgPolicy::Multibus),
            "group_by_serial" => Some(PgPolicy::GroupBySerial),
            "group_by_prio" => Some(PgPolicy::GroupByPrio),
            "group_by_node_name" => Some(PgPolicy::GroupByNodeName),
            _ => None,
        }
    }
}

/// Sort the map's groups with a stable insertion sort on
/// (marginal ascending, priority descending, enabled_paths descending).
/// Group priorities are refreshed as the sort walks the list.
pub fn sort_pathgroups(mp: &mut Multipath) {
    let mut i = 0;
    while i < mp.groups.len() {
        mp.groups[i].prio_update();
        let mut j = i as isize - 1;
        let mut placed = false;
        while j >= 0 {
            let g2 = &mp.groups[j as usize];
            let g1 = &mp.groups[i];
            if g2.marginal < g1.marginal
                || (g2.marginal == g1.marginal
                    && (g2.priority > g1.priority
                        || (g2.priority == g1.priority
                            && g2.enabled_paths >= g1.enabled_paths)))
            {
                move_up(&mut mp.groups, i, (j + 1) as usize);
                placed = true;
                break;
            }
            j -= 1;
        }
        if !placed && i != 0 {
            move_up(&mut mp.groups, i, 0);
        }
        i += 1;
    }
}

/// Split into (normal, marginal) sub-sequences preserving order; None when
/// the input is uniform and the policy should run unsplit.
fn split_marginal_paths(paths: &[PathRef]) -> Option<(Vec<PathRef>, Vec<PathRef>)> {
    let mut has_marginal = false;
    let mut has_normal = false;
    for pp in paths {
        if pp.read().marginal {
            has_marginal = true;
        } else {
            has_normal = true;
        }
    }
    if !has_marginal || !has_normal {
        return None;
    }
    let mut normal = Vec::new();
    let mut marginal = Vec::new();
    for pp in paths {
        if pp.read().marginal {
            marginal.push(pp.clone());
        } else {
            normal.push(pp.clone());
        }
    }
    Some((normal, marginal))
}

fn one_group(groups: &mut Vec<PathGroup>, paths: &[PathRef]) {
    let mut pg = PathGroup::new();
    pg.paths = paths.to_vec();
    groups.push(pg);
}

fn one_path_per_group(groups: &mut Vec<PathGroup>, paths: &[PathRef]) {
    for pp in paths {
        let mut pg = PathGroup::new();
        pg.paths.push(pp.clone());
        groups.push(pg);
    }
}

/// Shared algorithm of the group-by-X policies: a bitfield over the input;
/// for each untaken index open a new group, then take every later index
/// whose key matches. Preserves input order within and between groups.
fn group_by_key<K: PartialEq>(
    groups: &mut Vec<PathGroup>,
    paths: &[PathRef],
    key: impl Fn(&Path) -> K,
) {
    let keys: Vec<K> = paths.iter().map(|pp| key(&pp.read())).collect();
    let mut taken = vec![false; paths.len()];

    for i in 0..paths.len() {
        if taken[i] {
            continue;
        }
        let mut pg = PathGroup::new();
        pg.paths.push(paths[i].clone());
        taken[i] = true;
        for j in (i + 1)..paths.len() {
            if taken[j] {
                continue;
            }
            if keys[j] == keys[i] {
                pg.paths.push(paths[j].clone());
                taken[j] = true;
            }
        }
        groups.push(pg);
    }
}

fn apply_policy(groups: &mut Vec<PathGroup>, policy: PgPolicy, paths: &[PathRef]) {
    match policy {
        PgPolicy::Multibus => one_group(groups, paths),
        PgPolicy::Failover => one_path_per_group(groups, paths),
        PgPolicy::GroupBySerial => group_by_key(groups, paths, |pp| pp.serial.clone()),
        PgPolicy::GroupByPrio => group_by_key(groups, paths, |pp| pp.priority),
        PgPolicy::GroupByNodeName => {
            group_by_key(groups, paths, |pp| pp.tgt_node_name.clone())
        }
    }
}

/// Partition the map's path list into groups. The path list is drained;
/// afterwards the paths live only in the groups until the next sync
/// rebuilds the flattened list.
pub fn group_paths(mp: &mut Multipath, marginal_pathgroups: bool) -> CoreResult<()> {
    let paths = std::mem::take(&mut mp.paths);
    mp.groups = Vec::new();
    if paths.is_empty() {
        return Ok(());
    }

    let split = if marginal_pathgroups {
        split_marginal_paths(&paths)
    } else {
        None
    };
    match split {
        Some((normal, marginal)) => {
            debug!(
                "{}: splitting {} normal / {} marginal paths",
                mp.alias,
                normal.len(),
                marginal.len()
            );
            apply_policy(&mut mp.groups, mp.pgpolicy, &normal);
            apply_policy(&mut mp.groups, mp.pgpolicy, &marginal);
        }
        None => apply_policy(&mut mp.groups, mp.pgpolicy, &paths),
    }
    if mp.groups.is_empty() {
        return Err(CoreError::PolicyViolation {
            object: mp.alias.clone(),
            reason: format!("policy {} produced no groups", mp.pgpolicy.name()),
        });
    }
    sort_pathgroups(mp);
    Ok(())
}
