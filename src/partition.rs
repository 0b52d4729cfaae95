//! Partitions the ranks of a job into worker groups.
use crate::error::PoolError;

/// One worker group: its index (the group's color is `index + 1`) and the
/// world ranks of its members, lowest first.
pub type WorkerGroup = (usize, Vec<usize>);

/// Divides ranks `1..total_processes` into consecutive groups of
/// `group_size` ranks. Rank 0 is the coordinator and never joins a group.
///
/// When `total_processes - 1` is not a multiple of `group_size`, the
/// remainder is either left without work (`include_remainder == false`), or
/// handed out one rank at a time to the earliest groups, no group getting
/// more than one extra rank. Remainder ranks that are not handed out stay
/// idle; the caller is expected to warn about them.
///
/// ## Errors
/// `PoolError::Configuration` if `group_size` is zero, or if not a single
/// group can be formed although there are ranks to do work.
pub fn split_ranks(
    total_processes: usize,
    group_size: usize,
    include_remainder: bool,
) -> Result<Vec<WorkerGroup>, PoolError> {
    if group_size == 0 {
        return Err(PoolError::Configuration(
            "the number of ranks per worker group must be positive".to_string(),
        ));
    }
    let available = total_processes.saturating_sub(1);
    let num_groups = available / group_size;
    if num_groups == 0 && total_processes >= 2 {
        return Err(PoolError::Configuration(format!(
            "only {} rank(s) available to do work; need at least {} for one worker group",
            available, group_size
        )));
    }

    let mut extra = if include_remainder {
        available % group_size
    } else {
        0
    };
    let mut groups = Vec::with_capacity(num_groups);
    let mut start = 1;
    for i in 0..num_groups {
        let mut stop = start + group_size;
        if extra > 0 {
            stop += 1;
            extra -= 1;
        }
        groups.push((i, (start..stop).collect()));
        start = stop;
    }
    Ok(groups)
}

/// The number of ranks, other than the coordinator, that are in none of the
/// `groups`
pub fn leftover(total_processes: usize, groups: &[WorkerGroup]) -> usize {
    let grouped: usize = groups.iter().map(|(_, ranks)| ranks.len()).sum();
    total_processes.saturating_sub(1) - grouped
}
