//! The cache decision engine.
//!
//! Every operation asks for a plan: an ordered list of primitive opcodes
//! derived from whether the path is cached, whether policy wants it
//! cached, whether the upstream is reachable and — for fresh reads —
//! whether the upstream copy moved out from under the cached one.

/// Primitive actions an operation plan is built from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Opcode {
    /// Fail the operation with not-found.
    Enoent,
    /// Resolve the operation against the upstream path.
    UseUpstream,
    /// Resolve the operation against the cache path.
    UseCache,
    /// Mirror the upstream copy into the cache before resolving.
    Fetch,
    /// Remove the cached copy before resolving.
    Evict,
    /// The cached copy and the upstream have diverged while local changes
    /// are queued. Never surfaced to the host; the replay worker owns it.
    Conflict,
}

/// Everything the planner looks at.
#[derive(Debug, Copy, Clone)]
pub struct PlanInputs {
    pub cached: bool,
    pub should_cache: bool,
    pub upstream_up: bool,
    pub upstream_changed: bool,
    pub log_dirty: bool,
    /// Metadata-only request: prefer statting the upstream over fetching
    /// file contents just to answer a stat.
    pub for_stat: bool,
}

/// Produce the opcode plan for one request.
pub fn plan(inputs: PlanInputs) -> Vec<Opcode> {
    let PlanInputs { cached, should_cache, upstream_up, upstream_changed, log_dirty, for_stat } =
        inputs;

    if !cached {
        return match (should_cache, upstream_up) {
            (_, false) => vec![Opcode::Enoent],
            (false, true) => vec![Opcode::UseUpstream],
            (true, true) if for_stat => vec![Opcode::UseUpstream],
            (true, true) => vec![Opcode::Fetch, Opcode::UseCache],
        };
    }

    if !should_cache {
        return if upstream_up {
            vec![Opcode::Evict, Opcode::UseUpstream]
        } else {
            vec![Opcode::Evict, Opcode::Enoent]
        };
    }

    if upstream_up && upstream_changed {
        return if log_dirty {
            vec![Opcode::Conflict]
        } else if for_stat {
            vec![Opcode::UseUpstream]
        } else {
            vec![Opcode::Fetch, Opcode::UseCache]
        };
    }

    vec![Opcode::UseCache]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> PlanInputs {
        PlanInputs {
            cached: false,
            should_cache: true,
            upstream_up: true,
            upstream_changed: false,
            log_dirty: false,
            for_stat: false,
        }
    }

    #[test]
    fn uncached_paths() {
        assert_eq!(
            plan(PlanInputs { upstream_up: false, ..inputs() }),
            vec![Opcode::Enoent]
        );
        assert_eq!(
            plan(PlanInputs { should_cache: false, ..inputs() }),
            vec![Opcode::UseUpstream]
        );
        assert_eq!(
            plan(PlanInputs { for_stat: true, ..inputs() }),
            vec![Opcode::UseUpstream]
        );
        assert_eq!(plan(inputs()), vec![Opcode::Fetch, Opcode::UseCache]);
        assert_eq!(
            plan(PlanInputs { should_cache: false, upstream_up: false, ..inputs() }),
            vec![Opcode::Enoent]
        );
    }

    #[test]
    fn cached_but_unwanted_paths_evict() {
        let cached = PlanInputs { cached: true, should_cache: false, ..inputs() };
        assert_eq!(plan(cached), vec![Opcode::Evict, Opcode::UseUpstream]);
        assert_eq!(
            plan(PlanInputs { upstream_up: false, ..cached }),
            vec![Opcode::Evict, Opcode::Enoent]
        );
    }

    #[test]
    fn upstream_divergence() {
        let diverged = PlanInputs { cached: true, upstream_changed: true, ..inputs() };
        assert_eq!(
            plan(PlanInputs { log_dirty: true, ..diverged }),
            vec![Opcode::Conflict]
        );
        assert_eq!(
            plan(PlanInputs { for_stat: true, ..diverged }),
            vec![Opcode::UseUpstream]
        );
        assert_eq!(plan(diverged), vec![Opcode::Fetch, Opcode::UseCache]);
    }

    #[test]
    fn clean_cache_is_used_in_either_mode() {
        let clean = PlanInputs { cached: true, ..inputs() };
        assert_eq!(plan(clean), vec![Opcode::UseCache]);
        assert_eq!(
            plan(PlanInputs { upstream_up: false, ..clean }),
            vec![Opcode::UseCache]
        );
        // Dirty but unchanged upstream: still the cache.
        assert_eq!(
            plan(PlanInputs { log_dirty: true, ..clean }),
            vec![Opcode::UseCache]
        );
    }
}
