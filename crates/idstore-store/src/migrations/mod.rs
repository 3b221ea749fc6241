//! Versioned schema migrations for the accounts and roles collections.
//!
//! Each [`MigrationStep`] is a named, idempotent bulk transformation
//! identified by the schema version it introduces.  The built-in steps are
//! listed in [`BUILTIN_STEPS`]; their versions are checked for strict
//! ascending order at compile time, so a duplicated or misplaced
//! registration fails the build.  [`MigrationRegistry`] is the value the
//! host constructs once at startup and hands to the [`MigrationEngine`].

mod engine;
pub mod v001_authenticator_key;
pub mod v002_recovery_codes;
pub mod v003_drop_legacy_fields;
pub mod v004_normalized_names;
pub mod v005_role_ids;
pub mod v006_stamps;

use std::fmt;

use crate::collection::DocumentCollection;
use crate::error::{MigrationError, Result};

pub use engine::{MigrationEngine, MigrationPlan};

/// Body of a migration step: `(accounts, roles)`.
pub type ApplyFn = fn(&dyn DocumentCollection, &dyn DocumentCollection) -> Result<()>;

/// One versioned transformation over the accounts and roles collections.
///
/// Bodies must be idempotent: the engine re-applies the step whose version
/// equals the recorded one, and a crash between applying a step and
/// recording it replays the step on the next run.
#[derive(Clone, Copy)]
pub struct MigrationStep {
    version: u32,
    name: &'static str,
    apply: ApplyFn,
}

impl MigrationStep {
    pub const fn new(version: u32, name: &'static str, apply: ApplyFn) -> Self {
        Self {
            version,
            name,
            apply,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn apply(
        &self,
        accounts: &dyn DocumentCollection,
        roles: &dyn DocumentCollection,
    ) -> Result<()> {
        (self.apply)(accounts, roles)
    }
}

impl fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationStep")
            .field("version", &self.version)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Every step compiled into this build, in application order.
pub const BUILTIN_STEPS: &[MigrationStep] = &[
    v001_authenticator_key::STEP,
    v002_recovery_codes::STEP,
    v003_drop_legacy_fields::STEP,
    v004_normalized_names::STEP,
    v005_role_ids::STEP,
    v006_stamps::STEP,
];

const _: () = assert!(
    strictly_ascending(BUILTIN_STEPS),
    "BUILTIN_STEPS versions must be unique and listed in ascending order"
);

const fn strictly_ascending(steps: &[MigrationStep]) -> bool {
    let mut i = 1;
    while i < steps.len() {
        if steps[i - 1].version >= steps[i].version {
            return false;
        }
        i += 1;
    }
    true
}

/// The ordered set of known migration steps.
#[derive(Debug, Clone)]
pub struct MigrationRegistry {
    steps: Vec<MigrationStep>,
}

impl MigrationRegistry {
    /// Registry of the built-in steps.
    pub fn discover() -> std::result::Result<Self, MigrationError> {
        Self::from_steps(BUILTIN_STEPS.to_vec())
    }

    /// Build a registry from an arbitrary step list, sorting it by version.
    pub fn from_steps(mut steps: Vec<MigrationStep>) -> std::result::Result<Self, MigrationError> {
        steps.sort_by_key(|s| s.version);

        if let Some(pair) = steps.windows(2).find(|w| w[0].version == w[1].version) {
            return Err(MigrationError::DuplicateVersion {
                version: pair[0].version,
                first: pair[0].name,
                second: pair[1].name,
            });
        }

        tracing::debug!(
            steps = steps.len(),
            latest = steps.last().map(|s| s.version),
            "migration registry built"
        );
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    pub fn max_version(&self) -> Option<u32> {
        self.steps.last().map(|s| s.version)
    }

    /// Steps to run when the history records `current_version`.
    ///
    /// The boundary is inclusive: the step whose version equals the recorded
    /// one is selected again.
    pub fn pending(&self, current_version: u32) -> impl Iterator<Item = &MigrationStep> {
        self.steps
            .iter()
            .filter(move |s| s.version >= current_version)
    }
}
