//! Tracing lifecycle: start, stop, dump.
//!
//! Starting is a bootstrap with a fixed order, because the code doing it runs
//! on memory it is about to protect:
//!
//! 1. install the alternate signal stack and the passive handler, so any
//!    incidental touch of an already protected page is simply undone;
//! 2. read and classify the memory map (this allocates, so it happens before
//!    anything is protected);
//! 3. protect every eligible region execute-only, using only data on the
//!    stack and skipping the cache, the signal stack and the handler state,
//!    which the handler needs the moment anything faults;
//! 4. make those three read-write (the signal stack also executable);
//! 5. swap in the active handler;
//! 6. protect the stack, which from now on faults into the active handler.
//!
//! Stopping swaps the passive handler back in and nothing else. Pages keep
//! whatever protection tracing left them with.

use std::path::Path;

use crate::cache::{CacheArena, CacheSnapshot};
use crate::config::TraceConfig;
use crate::error::{ProtectError, TraceError};
use crate::handler::{Dispatcher, HandlerMode, SignalDispatcher};
use crate::maps::Classifier;
use crate::persist;
use crate::protect::{Mprotect, Protection, Protector};
use crate::{page_size, round_to_page, round_up_to_page, PageRange};

/// Most regions a single start will protect.
pub const MAX_PLANNED_REGIONS: usize = 2047;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingState {
    Inactive,
    Active,
}

/// Bulk-protection work list, kept on the stack so protecting the heap
/// cannot pull it out from under the loop.
struct FixedPlan {
    ranges: [PageRange; MAX_PLANNED_REGIONS],
    len: usize,
}

impl FixedPlan {
    /// Copy `regions`, cutting `keep` out of them.
    ///
    /// `keep` must be page aligned. Those pages are never protected, so the
    /// handler can run at any point of the bulk loop.
    fn new(regions: &[PageRange], keep: &[PageRange]) -> Result<FixedPlan, TraceError> {
        let mut keep = keep.to_vec();
        keep.sort_by_key(|r| r.start);
        let mut plan = FixedPlan {
            ranges: [PageRange::default(); MAX_PLANNED_REGIONS],
            len: 0,
        };
        for region in regions {
            let mut start = region.start;
            for hole in &keep {
                if hole.end <= start || hole.start >= region.end {
                    continue;
                }
                if hole.start > start {
                    plan.push(PageRange::new(start, hole.start))?;
                }
                start = hole.end;
            }
            if start < region.end {
                plan.push(PageRange::new(start, region.end))?;
            }
        }
        Ok(plan)
    }

    fn push(&mut self, range: PageRange) -> Result<(), TraceError> {
        if self.len == MAX_PLANNED_REGIONS {
            return Err(TraceError::TooManyRegions(MAX_PLANNED_REGIONS));
        }
        self.ranges[self.len] = range;
        self.len += 1;
        Ok(())
    }

    fn ranges(&self) -> &[PageRange] {
        &self.ranges[..self.len]
    }
}

/// Whole pages covering `range`.
fn page_span(range: PageRange, page_size: usize) -> PageRange {
    PageRange::new(
        round_to_page(range.start, page_size),
        round_up_to_page(range.end, page_size),
    )
}

/// The process's page tracer.
///
/// `P` changes page protections and `D` owns the signal handler; the
/// defaults are the live implementations.
pub struct Tracer<P: Protector = Mprotect, D: Dispatcher = SignalDispatcher> {
    config: TraceConfig,
    classifier: Classifier,
    protector: P,
    // Dropped before `arena` so the handler forgets the cache before it is unmapped.
    dispatcher: D,
    arena: Option<CacheArena>,
    state: TracingState,
}

impl Tracer {
    /// Claim the process's fault handler. Fails if another tracer holds it.
    pub fn new(config: TraceConfig) -> Result<Tracer, TraceError> {
        let dispatcher = SignalDispatcher::claim()?;
        Ok(Tracer::with_parts(config, Mprotect::new(), dispatcher))
    }
}

impl<P, D> Tracer<P, D>
where
    P: Protector + Clone,
    D: Dispatcher,
{
    pub fn with_parts(config: TraceConfig, protector: P, dispatcher: D) -> Tracer<P, D> {
        Tracer {
            classifier: Classifier::new(&config),
            config,
            protector,
            dispatcher,
            arena: None,
            state: TracingState::Inactive,
        }
    }

    pub fn state(&self) -> TracingState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TracingState::Active
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    /// Begin tracing with a cache of `capacity` pages.
    ///
    /// On error the tracer stays inactive with the passive handler in place;
    /// regions protected before the failure stay protected.
    pub fn start(&mut self, capacity: usize) -> Result<(), TraceError> {
        if self.is_active() {
            return Err(TraceError::AlreadyActive);
        }
        let arena = CacheArena::new(capacity)?;
        let signal_stack = self
            .dispatcher
            .install_signal_stack(self.config.signal_stack_size())?;
        self.dispatcher.install(HandlerMode::Passive)?;

        let plan = self.classifier.plan_from_path(&self.config.maps_path)?;
        info!(
            "Protecting {} regions with a {} page cache, stack {:?}",
            plan.regions.len(),
            capacity,
            plan.stack
        );
        let page_size = page_size();
        let own_pages = [
            (page_span(arena.range(), page_size), Protection::ReadWrite),
            (page_span(signal_stack, page_size), Protection::ReadWriteExec),
            (page_span(self.dispatcher.state_range(), page_size), Protection::ReadWrite),
        ];
        let keep = [own_pages[0].0, own_pages[1].0, own_pages[2].0];
        let fixed = FixedPlan::new(&plan.regions, &keep)?;
        let stack = plan.stack;
        drop(plan);

        self.dispatcher.publish(arena.as_ptr());
        self.arena = Some(arena);
        let mut protector = self.protector.clone();

        // Until `unprotect_all` returns nothing here may allocate or log: the
        // heap and every anonymous mapping outside `keep` may be protected.
        let bulk = protect_all(&mut protector, fixed.ranges());
        let restored = unprotect_all(&mut protector, &own_pages);
        bulk?;
        restored?;

        self.state = TracingState::Active;
        if let Err(e) = self.dispatcher.install(HandlerMode::Active) {
            self.state = TracingState::Inactive;
            return Err(e);
        }
        // Now protect the stack, from here on its faults are traced too.
        if let Some(stack) = stack {
            if let Err(e) = self.protector.protect(stack, Protection::ExecOnly) {
                self.abandon();
                return Err(e.into());
            }
        }
        debug!("Tracing active");
        Ok(())
    }

    /// End tracing. Protections are left as they are.
    pub fn stop(&mut self) -> Result<(), TraceError> {
        if !self.is_active() {
            return Err(TraceError::NotActive);
        }
        self.dispatcher.install(HandlerMode::Passive)?;
        self.state = TracingState::Inactive;
        info!("Tracing stopped");
        Ok(())
    }

    /// Cache contents, oldest first. Empty before the first start.
    pub fn snapshot(&self) -> Result<CacheSnapshot, TraceError> {
        if self.is_active() {
            return Err(TraceError::StillActive);
        }
        Ok(self
            .arena
            .as_ref()
            .map(|arena| arena.cache().snapshot())
            .unwrap_or_default())
    }

    /// Write the cache to `path`, one hex page address per line.
    pub fn dump<Q: AsRef<Path>>(&self, path: Q) -> Result<(), TraceError> {
        let snapshot = self.snapshot()?;
        persist::write_dump(path.as_ref(), &snapshot)
    }

    fn abandon(&mut self) {
        if let Err(e) = self.dispatcher.install(HandlerMode::Passive) {
            error!("Unable to fall back to the passive handler: {}", e);
        }
        self.state = TracingState::Inactive;
    }
}

impl<P: Protector, D: Dispatcher> Drop for Tracer<P, D> {
    fn drop(&mut self) {
        if self.state == TracingState::Active {
            // Protected pages remain, so a handler must stay behind.
            if let Err(e) = self.dispatcher.install(HandlerMode::Passive) {
                error!("Unable to fall back to the passive handler: {}", e);
            }
            self.state = TracingState::Inactive;
        }
    }
}

/// Protect `ranges` last to first, stopping at the first failure.
fn protect_all<P: Protector>(protector: &mut P, ranges: &[PageRange]) -> Result<(), ProtectError> {
    for range in ranges.iter().rev() {
        protector.protect(*range, Protection::ExecOnly)?;
    }
    Ok(())
}

/// Apply every protection in `pages`, reporting the first failure but
/// attempting all of them.
fn unprotect_all<P: Protector>(
    protector: &mut P,
    pages: &[(PageRange, Protection)],
) -> Result<(), ProtectError> {
    let mut result = Ok(());
    for (range, mode) in pages {
        if let Err(e) = protector.protect(*range, *mode) {
            if result.is_ok() {
                result = Err(e);
            }
        }
    }
    result
}
