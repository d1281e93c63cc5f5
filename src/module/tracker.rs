//! Tracks which module files realize which qualifiers, and folds
//! filesystem events into a structured module-update stream.
//!
//! Two parallel tables are maintained. The explicit table maps a qualifier
//! to the non-empty, priority-sorted list of files realizing it; the head
//! of the list wins. The implicit table maps a qualifier to the raw paths
//! of its explicit children; a qualifier with a non-empty set is importable
//! as a namespace package.
//!
//! The tracker is single-writer: `process_events` is called by the owning
//! driver, while readers consult lookups in between update batches.

use crate::{
    config::PathsConfig,
    error::{Result, SourceDbError},
    module::{
        finder::{find_all_module_paths, LazyFinder},
        ModulePath, PathEvent, PathEventKind, Qualifier, RawModulePath,
    },
    store::SharedStore,
};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs,
    sync::Arc,
};

/// Result of resolving a qualifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModuleLookup {
    /// Backed by at least one file; carries the winner.
    Explicit(ModulePath),
    /// A namespace package: backed only by a directory with explicit
    /// descendants.
    Implicit,
    NotFound,
}

/// One element of the update stream handed to analysis after an event
/// batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModuleUpdate {
    /// The qualifier became resolvable; carries the winner.
    New(ModulePath),
    /// The qualifier resolves to different content than before; carries
    /// the (possibly unchanged) winner.
    Changed(ModulePath),
    /// The qualifier is gone, explicit or implicit.
    Delete(Qualifier),
    /// The qualifier became importable as a namespace package.
    NewImplicit(Qualifier),
}

impl ModuleUpdate {
    pub fn qualifier(&self) -> &Qualifier {
        match self {
            ModuleUpdate::New(module_path) | ModuleUpdate::Changed(module_path) => {
                module_path.qualifier()
            }
            ModuleUpdate::Delete(qualifier) | ModuleUpdate::NewImplicit(qualifier) => qualifier,
        }
    }
}

/// Read access to a tracker, implemented by the tracker itself and by
/// overlays stacked on top of it.
pub trait ModuleView {
    fn look_up_qualifier(&self, qualifier: &Qualifier) -> ModuleLookup;
    fn code_of_module_path(&self, module_path: &ModulePath) -> Result<String>;
}

/// Maps dotted qualifiers to prioritized module paths across the
/// configured search roots.
///
/// Constructed either eagerly (one crawl up front, table-backed lookups)
/// or lazily (no crawl, on-demand probing with a shared-store cache); both
/// flavors answer the same queries identically.
#[derive(Debug)]
pub struct ModuleTracker {
    config: PathsConfig,
    overrides: HashMap<RawModulePath, String>,
    state: TrackerState,
}

#[derive(Debug)]
enum TrackerState {
    Eager(EagerState),
    Lazy(LazyState),
}

#[derive(Debug, Default)]
struct EagerState {
    explicit: HashMap<Qualifier, Vec<ModulePath>>,
    implicit: HashMap<Qualifier, HashSet<RawModulePath>>,
}

#[derive(Debug)]
struct LazyState {
    finder: LazyFinder,
}

impl ModuleTracker {
    /// Crawls every search root once and indexes all modules up front.
    pub fn eager(config: PathsConfig) -> Self {
        let mut state = EagerState::default();
        for module_path in find_all_module_paths(&config) {
            apply_new_or_changed(&mut state.explicit, module_path.clone());
            record_implicit_child(&mut state.implicit, &module_path, true);
        }
        debug!(qualifiers = state.explicit.len(), "eager module tracker ready");
        Self { config, overrides: HashMap::new(), state: TrackerState::Eager(state) }
    }

    /// Discovers modules on demand, caching listings in the given store.
    pub fn lazy(config: PathsConfig, store: Arc<SharedStore>) -> Self {
        Self {
            config,
            overrides: HashMap::new(),
            state: TrackerState::Lazy(LazyState { finder: LazyFinder::new(store) }),
        }
    }

    /// Registers in-memory code served instead of the on-disk contents.
    #[must_use]
    pub fn with_in_memory_sources(
        mut self,
        sources: impl IntoIterator<Item = (ModulePath, String)>,
    ) -> Self {
        self.overrides
            .extend(sources.into_iter().map(|(module_path, code)| (module_path.raw().clone(), code)));
        self
    }

    pub fn config(&self) -> &PathsConfig {
        &self.config
    }

    /// Every module path currently known to the tracker, sorted by
    /// qualifier then priority. For the lazy flavor this covers only
    /// qualifiers that have been asked about.
    pub fn all_module_paths(&self) -> Vec<ModulePath> {
        match &self.state {
            TrackerState::Eager(state) => {
                let mut qualifiers: Vec<_> = state.explicit.keys().collect();
                qualifiers.sort();
                qualifiers
                    .into_iter()
                    .flat_map(|qualifier| state.explicit[qualifier].iter().cloned())
                    .collect()
            }
            TrackerState::Lazy(_) => Vec::new(),
        }
    }

    /// Folds a batch of filesystem events into the tables and returns the
    /// net module updates, explicit updates first.
    pub fn process_events(&mut self, events: &[PathEvent]) -> Vec<ModuleUpdate> {
        match &mut self.state {
            TrackerState::Eager(state) => process_eager_events(&self.config, state, events),
            TrackerState::Lazy(state) => process_lazy_events(&self.config, state, events),
        }
    }
}

impl ModuleView for ModuleTracker {
    fn look_up_qualifier(&self, qualifier: &Qualifier) -> ModuleLookup {
        match &self.state {
            TrackerState::Eager(state) => {
                if let Some(winner) =
                    state.explicit.get(qualifier).and_then(|list| list.first())
                {
                    return ModuleLookup::Explicit(winner.clone());
                }
                match state.implicit.get(qualifier) {
                    Some(children) if !children.is_empty() => ModuleLookup::Implicit,
                    _ => ModuleLookup::NotFound,
                }
            }
            TrackerState::Lazy(state) => {
                if let Some(winner) =
                    state.finder.find_module_paths(&self.config, qualifier).into_iter().next()
                {
                    return ModuleLookup::Explicit(winner);
                }
                if state.finder.is_namespace_package(&self.config, qualifier) {
                    ModuleLookup::Implicit
                } else {
                    ModuleLookup::NotFound
                }
            }
        }
    }

    fn code_of_module_path(&self, module_path: &ModulePath) -> Result<String> {
        if let Some(code) = self.overrides.get(module_path.raw()) {
            return Ok(code.clone());
        }
        let path = self.config.absolute_path_of(module_path);
        fs::read_to_string(&path).map_err(|err| SourceDbError::io(err, path))
    }
}

/// Inserts or refreshes a module path in the explicit table, returning the
/// observable update if any.
fn apply_new_or_changed(
    explicit: &mut HashMap<Qualifier, Vec<ModulePath>>,
    module_path: ModulePath,
) -> Option<ModuleUpdate> {
    let qualifier = module_path.qualifier().clone();
    match explicit.entry(qualifier) {
        std::collections::hash_map::Entry::Vacant(entry) => {
            entry.insert(vec![module_path.clone()]);
            Some(ModuleUpdate::New(module_path))
        }
        std::collections::hash_map::Entry::Occupied(mut entry) => {
            let list = entry.get_mut();
            if let Some(index) =
                list.iter().position(|existing| existing.raw().same_file(module_path.raw()))
            {
                list[index] = module_path.clone();
                // a shadowed file changed, nothing observable
                (index == 0).then_some(ModuleUpdate::Changed(module_path))
            } else {
                let index = list
                    .partition_point(|existing| existing.priority_cmp(&module_path).is_lt());
                list.insert(index, module_path.clone());
                (index == 0).then_some(ModuleUpdate::Changed(module_path))
            }
        }
    }
}

/// Removes a module path from the explicit table, returning the observable
/// update if any.
fn apply_remove(
    explicit: &mut HashMap<Qualifier, Vec<ModulePath>>,
    module_path: &ModulePath,
) -> Option<ModuleUpdate> {
    let qualifier = module_path.qualifier();
    let list = explicit.get_mut(qualifier)?;
    let index =
        list.iter().position(|existing| existing.raw().same_file(module_path.raw()))?;
    if list[index].raw().should_type_check != module_path.raw().should_type_check {
        // a dropped symlink cannot be re-classified, so the flag on the
        // removal request is allowed to disagree with the stored entry
        trace!(
            qualifier = %qualifier,
            "removing module path whose type-check flag differs from the stored entry"
        );
    }
    list.remove(index);
    if list.is_empty() {
        explicit.remove(qualifier);
        Some(ModuleUpdate::Delete(qualifier.clone()))
    } else if index == 0 {
        Some(ModuleUpdate::Changed(list[0].clone()))
    } else {
        None
    }
}

/// The parent qualifier whose implicit set a module contributes to.
///
/// Top-level modules are excluded: they never make the root importable.
fn implicit_parent(module_path: &ModulePath) -> Option<Qualifier> {
    module_path.qualifier().parent().filter(|parent| !parent.is_root())
}

fn record_implicit_child(
    implicit: &mut HashMap<Qualifier, HashSet<RawModulePath>>,
    module_path: &ModulePath,
    present: bool,
) {
    let Some(parent) = implicit_parent(module_path) else {
        return;
    };
    if present {
        implicit.entry(parent).or_default().insert(module_path.raw().clone());
    } else if let Some(children) = implicit.get_mut(&parent) {
        children.retain(|raw| !raw.same_file(module_path.raw()));
        if children.is_empty() {
            implicit.remove(&parent);
        }
    }
}

/// Folds a later per-qualifier update into an earlier one.
///
/// The legal collapses form a small lattice; an illegal pair means the
/// event source violated its ordering contract, which is a bug.
fn combine_updates(earlier: ModuleUpdate, later: ModuleUpdate) -> ModuleUpdate {
    use ModuleUpdate::*;
    let qualifier = earlier.qualifier().clone();
    match (earlier, later) {
        (New(_), Changed(winner)) => New(winner),
        (New(stale), Delete(_)) => Changed(stale),
        (Changed(_), Changed(winner)) => Changed(winner),
        (Changed(_), Delete(qualifier)) => Delete(qualifier),
        (Delete(_), New(winner)) => Changed(winner),
        (New(_), New(_)) => {
            panic!("illegal update pair for {qualifier}: New followed by New")
        }
        (Changed(_), New(_)) => {
            panic!("illegal update pair for {qualifier}: New after Changed")
        }
        (Delete(_), Delete(_)) => {
            panic!("illegal update pair for {qualifier}: Delete followed by Delete")
        }
        (Delete(_), Changed(_)) => {
            panic!("illegal update pair for {qualifier}: Changed after Delete")
        }
        (earlier, later) => {
            panic!("illegal update pair for {qualifier}: {earlier:?} followed by {later:?}")
        }
    }
}

fn fold_update(folded: &mut BTreeMap<Qualifier, ModuleUpdate>, update: ModuleUpdate) {
    let qualifier = update.qualifier().clone();
    match folded.remove(&qualifier) {
        Some(earlier) => {
            folded.insert(qualifier, combine_updates(earlier, update));
        }
        None => {
            folded.insert(qualifier, update);
        }
    }
}

fn process_eager_events(
    config: &PathsConfig,
    state: &mut EagerState,
    events: &[PathEvent],
) -> Vec<ModuleUpdate> {
    let mut folded: BTreeMap<Qualifier, ModuleUpdate> = BTreeMap::new();
    // parent qualifier -> whether it was importable before this batch
    let mut implicit_before: BTreeMap<Qualifier, bool> = BTreeMap::new();

    for event in events {
        let Some(module_path) = ModulePath::classify(config, &event.path) else {
            continue;
        };
        if let Some(parent) = implicit_parent(&module_path) {
            implicit_before.entry(parent.clone()).or_insert_with(|| {
                state.implicit.get(&parent).is_some_and(|children| !children.is_empty())
            });
        }
        let update = match event.kind {
            PathEventKind::CreatedOrChanged => {
                record_implicit_child(&mut state.implicit, &module_path, true);
                apply_new_or_changed(&mut state.explicit, module_path)
            }
            PathEventKind::Removed => {
                record_implicit_child(&mut state.implicit, &module_path, false);
                apply_remove(&mut state.explicit, &module_path)
            }
        };
        if let Some(update) = update {
            fold_update(&mut folded, update);
        }
    }

    let mut updates: Vec<ModuleUpdate> = folded.values().cloned().collect();
    for (parent, was_importable) in implicit_before {
        if folded.contains_key(&parent) {
            // an explicit event on the same qualifier takes precedence
            continue;
        }
        let is_importable =
            state.implicit.get(&parent).is_some_and(|children| !children.is_empty());
        match (was_importable, is_importable) {
            (false, true) => updates.push(ModuleUpdate::NewImplicit(parent)),
            (true, false) => updates.push(ModuleUpdate::Delete(parent)),
            _ => {}
        }
    }
    updates
}

fn process_lazy_events(
    config: &PathsConfig,
    state: &mut LazyState,
    events: &[PathEvent],
) -> Vec<ModuleUpdate> {
    let mut folded: BTreeMap<Qualifier, ModuleUpdate> = BTreeMap::new();

    for event in events {
        let Some(module_path) = ModulePath::classify(config, &event.path) else {
            continue;
        };
        let qualifier = module_path.qualifier().clone();
        let skip = !state.finder.is_cached(&qualifier);
        let old_winner = state.finder.cached_winner(&qualifier);
        // ancestors always invalidate so future lookups see fresh listings
        state.finder.invalidate_with_ancestors(&qualifier);
        if skip {
            trace!(%qualifier, "skipping update for a qualifier never asked about");
            continue;
        }

        let new_winner =
            state.finder.find_module_paths(config, &qualifier).into_iter().next();
        let update = match (old_winner, new_winner) {
            (None, Some(winner)) => Some(ModuleUpdate::New(winner)),
            (Some(_), None) => Some(ModuleUpdate::Delete(qualifier)),
            (Some(old), Some(new)) => {
                if old != new {
                    Some(ModuleUpdate::Changed(new))
                } else if event.kind == PathEventKind::CreatedOrChanged
                    && new.raw().same_file(module_path.raw())
                {
                    // the winning file itself changed in place
                    Some(ModuleUpdate::Changed(new))
                } else {
                    None
                }
            }
            (None, None) => None,
        };
        if let Some(update) = update {
            fold_update(&mut folded, update);
        }
    }

    folded.into_values().collect()
}
