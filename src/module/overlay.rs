//! In-memory source overrides stacked over a read-only tracker, serving
//! unsaved editor state without mutating the underlying tables.

use crate::{
    error::{Result, SourceDbError},
    module::{
        tracker::{ModuleLookup, ModuleTracker, ModuleUpdate, ModuleView},
        ModulePath, Qualifier, RawModulePath,
    },
};
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
};

/// How one overlaid artifact path changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodeUpdate {
    /// Serve this code instead of the on-disk contents.
    NewCode(String),
    /// Drop the override and fall back to disk.
    ResetCode,
}

/// A set of in-memory code overrides on top of a read-only tracker.
///
/// Reads check the override table first and fall through to the parent on
/// a miss. The overlay remembers every qualifier it has made a claim on,
/// so the query layer can route requests for owned qualifiers here.
#[derive(Debug)]
pub struct Overlay<'a> {
    parent: &'a ModuleTracker,
    overrides: HashMap<RawModulePath, String>,
    owned: HashSet<Qualifier>,
}

impl<'a> Overlay<'a> {
    pub fn new(parent: &'a ModuleTracker) -> Self {
        Self { parent, overrides: HashMap::new(), owned: HashSet::new() }
    }

    /// Applies a batch of code updates keyed by artifact path.
    ///
    /// Each artifact path is converted to a module path through the
    /// parent's configuration; unknown paths fail with `ModuleNotTracked`.
    /// Returns one update record per converted path, in input order.
    pub fn update_overlaid_code(
        &mut self,
        updates: impl IntoIterator<Item = (PathBuf, CodeUpdate)>,
    ) -> Result<Vec<ModuleUpdate>> {
        let mut emitted = Vec::new();
        for (artifact_path, update) in updates {
            let module_path = ModulePath::classify(self.parent.config(), &artifact_path)
                .ok_or(SourceDbError::ModuleNotTracked(artifact_path))?;
            match update {
                CodeUpdate::NewCode(code) => {
                    self.overrides.insert(module_path.raw().clone(), code);
                }
                CodeUpdate::ResetCode => {
                    self.overrides.remove(module_path.raw());
                }
            }
            self.owned.insert(module_path.qualifier().clone());
            emitted.push(ModuleUpdate::New(module_path));
        }
        Ok(emitted)
    }

    /// Whether the overlay has made any claim on the qualifier.
    pub fn owns_qualifier(&self, qualifier: &Qualifier) -> bool {
        self.owned.contains(qualifier)
    }
}

impl ModuleView for Overlay<'_> {
    fn look_up_qualifier(&self, qualifier: &Qualifier) -> ModuleLookup {
        self.parent.look_up_qualifier(qualifier)
    }

    fn code_of_module_path(&self, module_path: &ModulePath) -> Result<String> {
        if let Some(code) = self.overrides.get(module_path.raw()) {
            return Ok(code.clone());
        }
        self.parent.code_of_module_path(module_path)
    }
}
