//! Dispatch geometry: global and work-group extents over an index space.

use crate::error::{Error, Result};

/// Highest dimensionality an index space may have.
pub const MAX_DIMS: usize = 3;

/// Global and local extents of an NDRange dispatch.
///
/// Construction checks shape: dimensionality, non-zero extents, and that
/// both the item count and the group size fit a `usize`. Whether each local
/// extent divides its global extent is left to the platform, which rejects
/// the dispatch at submission time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkSpace {
    global: Vec<usize>,
    local: Vec<usize>,
}

impl WorkSpace {
    pub fn new(global: &[usize], local: &[usize]) -> Result<Self> {
        if global.is_empty() || global.len() > MAX_DIMS {
            return Err(Error::config(format!(
                "work space must have 1 to {} dimensions, got {}",
                MAX_DIMS,
                global.len()
            )));
        }
        if local.len() != global.len() {
            return Err(Error::config(format!(
                "local extent has {} dimensions, global has {}",
                local.len(),
                global.len()
            )));
        }
        if global.iter().chain(local).any(|&extent| extent == 0) {
            return Err(Error::config("work space extents must be > 0"));
        }
        if extent_product(global).is_none() || extent_product(local).is_none() {
            return Err(Error::config(format!(
                "work space {:?} / {:?} has more items than fit in a usize",
                global, local
            )));
        }

        Ok(Self {
            global: global.to_vec(),
            local: local.to_vec(),
        })
    }

    /// A two-dimensional work space.
    pub fn new_2d(global: [usize; 2], local: [usize; 2]) -> Result<Self> {
        Self::new(&global, &local)
    }

    pub fn dims(&self) -> usize {
        self.global.len()
    }

    pub fn global(&self) -> &[usize] {
        &self.global
    }

    pub fn local(&self) -> &[usize] {
        &self.local
    }

    /// Whether every local extent evenly divides its global extent.
    pub fn divides_evenly(&self) -> bool {
        divides_evenly(&self.global, &self.local)
    }

    /// Total number of work items. Construction guarantees it fits.
    pub fn work_items(&self) -> usize {
        extent_product(&self.global).unwrap_or(usize::MAX)
    }
}

/// Product of `extents`, or `None` on overflow.
pub fn extent_product(extents: &[usize]) -> Option<usize> {
    extents.iter().try_fold(1usize, |acc, &e| acc.checked_mul(e))
}

/// Whether every `local[d]` evenly divides `global[d]`.
pub fn divides_evenly(global: &[usize], local: &[usize]) -> bool {
    global.len() == local.len()
        && global
            .iter()
            .zip(local)
            .all(|(&g, &l)| l != 0 && g % l == 0)
}

/// One work item's position in the index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    global_id: [usize; MAX_DIMS],
    local_id: [usize; MAX_DIMS],
    group_id: [usize; MAX_DIMS],
}

impl WorkItem {
    /// Global id in `dim`; 0 beyond the dispatch's dimensionality.
    pub fn global_id(&self, dim: usize) -> usize {
        self.global_id.get(dim).copied().unwrap_or(0)
    }

    pub fn local_id(&self, dim: usize) -> usize {
        self.local_id.get(dim).copied().unwrap_or(0)
    }

    pub fn group_id(&self, dim: usize) -> usize {
        self.group_id.get(dim).copied().unwrap_or(0)
    }
}

/// Visit every work item, group by group, each group in local-id order.
///
/// Dimension 0 varies fastest at both levels. `global` and `local` must have
/// the same length and the partition must be exact.
pub fn for_each_work_item<F, E>(
    global: &[usize],
    local: &[usize],
    mut f: F,
) -> std::result::Result<(), E>
where
    F: FnMut(&WorkItem) -> std::result::Result<(), E>,
{
    debug_assert!(divides_evenly(global, local));

    let mut groups = [1usize; MAX_DIMS];
    let mut sizes = [1usize; MAX_DIMS];
    for d in 0..global.len().min(MAX_DIMS) {
        groups[d] = global[d] / local[d];
        sizes[d] = local[d];
    }

    for gz in 0..groups[2] {
        for gy in 0..groups[1] {
            for gx in 0..groups[0] {
                let group_id = [gx, gy, gz];
                for lz in 0..sizes[2] {
                    for ly in 0..sizes[1] {
                        for lx in 0..sizes[0] {
                            let local_id = [lx, ly, lz];
                            let mut global_id = [0; MAX_DIMS];
                            for d in 0..MAX_DIMS {
                                global_id[d] = group_id[d] * sizes[d] + local_id[d];
                            }
                            f(&WorkItem {
                                global_id,
                                local_id,
                                group_id,
                            })?;
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_shape_validation() {
        assert!(WorkSpace::new(&[], &[]).is_err());
        assert!(WorkSpace::new(&[8, 8], &[2]).is_err());
        assert!(WorkSpace::new(&[8, 0], &[2, 2]).is_err());
        assert!(WorkSpace::new(&[1, 1, 1, 1], &[1, 1, 1, 1]).is_err());
        assert!(WorkSpace::new_2d([usize::MAX, 2], [1, 1]).is_err());
        assert!(WorkSpace::new_2d([8, 8], [usize::MAX, 2]).is_err());
        // Divisibility is not a construction error.
        assert!(WorkSpace::new_2d([8, 8], [3, 3]).is_ok());
    }

    #[test]
    fn test_divisibility() {
        let ws = WorkSpace::new_2d([8, 8], [2, 2]).unwrap();
        assert!(ws.divides_evenly());
        assert_eq!(ws.work_items(), 64);

        let ws = WorkSpace::new_2d([8, 8], [3, 3]).unwrap();
        assert!(!ws.divides_evenly());
        assert_eq!(extent_product(&[usize::MAX, 2]), None);
    }

    #[test]
    fn test_every_work_item_visited_once() {
        let mut seen = HashSet::new();
        for_each_work_item::<_, ()>(&[8, 8], &[2, 2], |item| {
            assert_eq!(
                item.global_id(0),
                item.group_id(0) * 2 + item.local_id(0)
            );
            assert!(item.local_id(1) < 2);
            assert_eq!(item.global_id(2), 0);
            assert!(seen.insert((item.global_id(0), item.global_id(1))));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen.len(), 64);
    }

    #[test]
    fn test_visit_stops_on_error() {
        let mut visited = 0;
        let result = for_each_work_item(&[4], &[2], |_| {
            visited += 1;
            if visited == 3 {
                Err("stop")
            } else {
                Ok(())
            }
        });
        assert_eq!(result, Err("stop"));
        assert_eq!(visited, 3);
    }
}
