#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{
    ArtifactError, MergeConflict, Result, SourceDbError, SourceDbIoError, ToolError,
};

pub mod buildmap;
pub use buildmap::{BuildMap, BuildMapDifference, DifferenceKind, IndexedBuildMap};

pub mod artifacts;

pub mod buck;
pub use buck::{BuildOutcome, Builder, LazyBuilder, Target};

pub mod module;
pub use module::{
    overlay::{CodeUpdate, Overlay},
    tracker::{ModuleLookup, ModuleTracker, ModuleUpdate, ModuleView},
    ModulePath, PathEvent, PathEventKind, Qualifier, RawModulePath,
};

mod config;
pub use config::{PathsConfig, PathsConfigBuilder, SearchRoot, DEFAULT_EXCLUDES};

mod project;
pub use project::{is_recipe_file, BuildSystem, BuildSystemBuilder};

pub mod state;
pub use state::SavedState;

pub mod store;
pub use store::{LoadOutcome, SharedStore, UnusedReason};

pub mod utils;
