//! Migration runner.
//!
//! The installed schema version is the highest `database_version` in the
//! history collection (0 when it is empty).  Every registered step whose
//! version is at least that value is applied in ascending order against the
//! full accounts and roles collections, and one history record per applied
//! step is inserted as a single batch once all of them succeeded.
//!
//! There is no lock around a run: two processes starting together may both
//! apply the same steps.  Step idempotence is what makes that, and a crash
//! before the history batch lands, safe to replay.

use chrono::Utc;

use super::{MigrationRegistry, MigrationStep};
use crate::collection::DocumentCollection;
use crate::error::{MigrationError, StoreError};
use crate::filter::Filter;
use crate::models::HistoryRecord;

type Result<T> = std::result::Result<T, MigrationError>;

/// What a run would do, without doing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPlan {
    pub current_version: u32,
    /// Versions of the steps that would be applied, ascending.
    pub pending: Vec<u32>,
}

impl MigrationPlan {
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Applies the steps of a [`MigrationRegistry`].
#[derive(Debug, Clone, Copy)]
pub struct MigrationEngine<'r> {
    registry: &'r MigrationRegistry,
}

impl<'r> MigrationEngine<'r> {
    pub fn new(registry: &'r MigrationRegistry) -> Self {
        Self { registry }
    }

    /// Highest recorded schema version, or 0 for an empty history.
    pub fn installed_version(history: &dyn DocumentCollection) -> Result<u32> {
        let records = history.find(&Filter::All).map_err(MigrationError::History)?;

        let mut current = 0;
        for document in records {
            let record: HistoryRecord = serde_json::from_value(document)
                .map_err(|e| MigrationError::History(StoreError::Json(e)))?;
            current = current.max(record.database_version);
        }
        Ok(current)
    }

    pub fn plan(&self, history: &dyn DocumentCollection) -> Result<MigrationPlan> {
        let current_version = Self::installed_version(history)?;
        Ok(MigrationPlan {
            current_version,
            pending: self
                .registry
                .pending(current_version)
                .map(MigrationStep::version)
                .collect(),
        })
    }

    /// Run every pending step, then record them in `history`.
    ///
    /// The first failing step aborts the run; nothing is recorded for the
    /// steps that did succeed, so the next run replays them.
    pub fn apply(
        &self,
        history: &dyn DocumentCollection,
        accounts: &dyn DocumentCollection,
        roles: &dyn DocumentCollection,
    ) -> Result<Vec<HistoryRecord>> {
        let current_version = Self::installed_version(history)?;
        let pending: Vec<&MigrationStep> = self.registry.pending(current_version).collect();

        tracing::info!(
            current_version,
            target_version = self.registry.max_version().map(|v| v + 1),
            pending = pending.len(),
            "checking schema migrations"
        );

        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let mut applied = Vec::with_capacity(pending.len());
        for step in pending {
            tracing::info!(version = step.version(), name = step.name(), "applying migration");

            step.apply(accounts, roles).map_err(|source| {
                tracing::error!(
                    version = step.version(),
                    name = step.name(),
                    error = %source,
                    "migration failed, aborting remaining steps"
                );
                MigrationError::Failed {
                    version: step.version(),
                    name: step.name(),
                    source,
                }
            })?;

            applied.push(HistoryRecord::new(step.version() + 1, Utc::now()));
        }

        let documents = applied
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| MigrationError::History(StoreError::Json(e)))?;
        let ids = history
            .insert_many(documents)
            .map_err(MigrationError::History)?;
        for (record, id) in applied.iter_mut().zip(ids) {
            record.id = id;
        }

        tracing::info!(
            installed_version = applied.last().map(|r| r.database_version),
            recorded = applied.len(),
            "schema migrations complete"
        );
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::SqliteCollection;
    use crate::database::{Database, StoreConfig};
    use crate::field::FieldPath;
    use crate::models::{AccountRecord, RoleRecord};
    use crate::update::FieldUpdate;
    use serde_json::{json, Value};

    fn path(p: &str) -> FieldPath {
        FieldPath::parse(p).unwrap()
    }

    fn bump(accounts: &dyn DocumentCollection, counter: &str) -> crate::error::Result<()> {
        let counter = path(counter);
        accounts.update_each(&Filter::All, &mut |_| {
            Ok(vec![FieldUpdate::increment(counter.clone(), 1)])
        })?;
        Ok(())
    }

    fn run_v1(a: &dyn DocumentCollection, _: &dyn DocumentCollection) -> crate::error::Result<()> {
        bump(a, "runs_v1")
    }
    fn run_v2(a: &dyn DocumentCollection, _: &dyn DocumentCollection) -> crate::error::Result<()> {
        bump(a, "runs_v2")
    }
    fn run_v3(a: &dyn DocumentCollection, _: &dyn DocumentCollection) -> crate::error::Result<()> {
        bump(a, "runs_v3")
    }
    fn run_v4(a: &dyn DocumentCollection, _: &dyn DocumentCollection) -> crate::error::Result<()> {
        // Idempotent: sets a marker.
        let marker = path("shape_v4");
        a.update_each(&Filter::All, &mut |_| {
            Ok(vec![FieldUpdate::set(marker.clone(), json!(true))])
        })?;
        Ok(())
    }
    fn run_v5(a: &dyn DocumentCollection, _: &dyn DocumentCollection) -> crate::error::Result<()> {
        bump(a, "runs_v5")
    }
    fn run_v6(a: &dyn DocumentCollection, _: &dyn DocumentCollection) -> crate::error::Result<()> {
        bump(a, "runs_v6")
    }
    fn fail(_: &dyn DocumentCollection, _: &dyn DocumentCollection) -> crate::error::Result<()> {
        Err(StoreError::InvalidDocument("corrupt account".into()))
    }

    /// Reads `seed`, which only the lower-versioned step writes.
    fn derive_from_seed(
        a: &dyn DocumentCollection,
        _: &dyn DocumentCollection,
    ) -> crate::error::Result<()> {
        let seed = path("seed");
        let derived = path("derived");
        a.update_each(&Filter::All, &mut |doc| {
            let seed = seed
                .lookup(doc)
                .and_then(Value::as_i64)
                .ok_or_else(|| StoreError::InvalidDocument("seed missing".into()))?;
            Ok(vec![FieldUpdate::set(derived.clone(), json!(seed + 1))])
        })?;
        Ok(())
    }
    fn write_seed(
        a: &dyn DocumentCollection,
        _: &dyn DocumentCollection,
    ) -> crate::error::Result<()> {
        let seed = path("seed");
        a.update_each(&Filter::All, &mut |_| Ok(vec![FieldUpdate::set(seed.clone(), json!(41))]))?;
        Ok(())
    }

    struct Fixture {
        db: Database,
    }

    impl Fixture {
        fn new() -> Self {
            let db = Database::open_in_memory(StoreConfig::default()).unwrap();
            db.accounts().unwrap().insert_one(json!({ "id": "u-1", "user_name": "ada" })).unwrap();
            Self { db }
        }

        fn collections(
            &self) -> (SqliteCollection<'_>, SqliteCollection<'_>, SqliteCollection<'_>,
        ) {
            (
                self.db.history().unwrap(),
                self.db.accounts().unwrap(),
                self.db.roles().unwrap(),
            )
        }

        fn apply(&self, registry: &MigrationRegistry) -> Result<Vec<HistoryRecord>> {
            let (history, accounts, roles) = self.collections();
            MigrationEngine::new(registry).apply(&history, &accounts, &roles)
        }

        fn record_version(&self, version: u32) {
            let record = serde_json::to_value(HistoryRecord::new(version, Utc::now())).unwrap();
            self.db.history().unwrap().insert_one(record).unwrap();
        }

        fn account(&self) -> Value {
            self.db.accounts().unwrap().find_by_id("u-1").unwrap().unwrap()
        }

        fn history_versions(&self) -> Vec<u32> {
            let mut records: Vec<HistoryRecord> = self
                .db
                .history()
                .unwrap()
                .find(&Filter::All)
                .unwrap()
                .into_iter()
                .map(|d| serde_json::from_value(d).unwrap())
                .collect();
            records.sort();
            records.iter().map(|r| r.database_version).collect()
        }
    }

    fn counting_registry() -> MigrationRegistry {
        MigrationRegistry::from_steps(vec![
            MigrationStep::new(1, "v1", run_v1),
            MigrationStep::new(2, "v2", run_v2),
            MigrationStep::new(3, "v3", run_v3),
            MigrationStep::new(4, "v4", run_v4),
            MigrationStep::new(5, "v5", run_v5),
            MigrationStep::new(6, "v6", run_v6),
        ])
        .unwrap()
    }

    #[test]
    fn fresh_install_records_contiguous_versions() {
        let fixture = Fixture::new();
        let registry = MigrationRegistry::discover().unwrap();

        let applied = fixture.apply(&registry).unwrap();

        let max = registry.max_version().unwrap();
        assert_eq!(applied.len(), registry.steps().len());
        assert!(applied.iter().all(|r| !r.id.is_empty()));
        assert_eq!(fixture.history_versions(), (2..=max + 1).collect::<Vec<_>>());
    }

    #[test]
    fn empty_history_means_version_zero() {
        let fixture = Fixture::new();
        let registry = counting_registry();
        let (history, _, _) = fixture.collections();

        let plan = MigrationEngine::new(&registry).plan(&history).unwrap();
        assert_eq!(plan.current_version, 0);
        assert_eq!(plan.pending, [1, 2, 3, 4, 5, 6]);
        assert!(!plan.is_up_to_date());
    }

    #[test]
    fn second_run_changes_nothing() {
        let fixture = Fixture::new();
        let accounts = fixture.db.accounts().unwrap();
        accounts
            .insert_one(json!({ "id": "legacy", "user_name": "bob", "authenticator_key": "K",
                                "recovery_codes": ["a", "b"], "roles": ["admin"] }))
            .unwrap();
        fixture
            .db
            .roles()
            .unwrap()
            .insert_one(json!({ "id": "r-1", "name": "admin" }))
            .unwrap();
        let registry = MigrationRegistry::discover().unwrap();

        fixture.apply(&registry).unwrap();
        let accounts_after_first = accounts.find(&Filter::All).unwrap();
        let roles_after_first = fixture.db.roles().unwrap().find(&Filter::All).unwrap();
        let versions_after_first = fixture.history_versions();

        let second = fixture.apply(&registry).unwrap();

        assert!(second.is_empty());
        assert_eq!(accounts.find(&Filter::All).unwrap(), accounts_after_first);
        assert_eq!(fixture.db.roles().unwrap().find(&Filter::All).unwrap(), roles_after_first);
        assert_eq!(fixture.history_versions().last(), versions_after_first.last());

        // The migrated legacy document deserializes into the current shape.
        let account: AccountRecord =
            serde_json::from_value(accounts.find_by_id("legacy").unwrap().unwrap()).unwrap();
        assert_eq!(account.roles, ["r-1"]);
        assert_eq!(account.tokens.len(), 2);
        let role_doc = fixture.db.roles().unwrap().find_by_id("r-1").unwrap().unwrap();
        let role: RoleRecord = serde_json::from_value(role_doc).unwrap();
        assert_eq!(role.normalized_name.as_deref(), Some("ADMIN"));
    }

    #[test]
    fn steps_run_in_ascending_version_order() {
        let fixture = Fixture::new();
        // Registered out of order; the reader must still see the writer's field.
        let registry = MigrationRegistry::from_steps(vec![
            MigrationStep::new(2, "derive_from_seed", derive_from_seed),
            MigrationStep::new(1, "write_seed", write_seed),
        ])
        .unwrap();

        fixture.apply(&registry).unwrap();
        assert_eq!(fixture.account()["derived"], 42);
    }

    #[test]
    fn partial_upgrade_reapplies_boundary_step_only() {
        let fixture = Fixture::new();
        fixture.record_version(4);
        let registry = MigrationRegistry::from_steps(vec![
            MigrationStep::new(4, "v4", run_v4),
            MigrationStep::new(5, "v5", run_v5),
            MigrationStep::new(6, "v6", run_v6),
        ])
        .unwrap();

        let applied = fixture.apply(&registry).unwrap();

        let versions: Vec<u32> = applied.iter().map(|r| r.database_version).collect();
        assert_eq!(versions, [5, 6, 7]);
        assert_eq!(fixture.history_versions(), [4, 5, 6, 7]);
        let account = fixture.account();
        assert_eq!(account["shape_v4"], true);
        assert_eq!(account["runs_v5"], 1);
        assert_eq!(account["runs_v6"], 1);
    }

    #[test]
    fn never_reapplies_steps_below_recorded_version() {
        let fixture = Fixture::new();
        fixture.record_version(5);

        fixture.apply(&counting_registry()).unwrap();

        let account = fixture.account();
        for older in ["runs_v1", "runs_v2", "runs_v3"] {
            assert!(account.get(older).is_none(), "{older} should not have run");
        }
        assert!(account.get("shape_v4").is_none());
        assert_eq!(account["runs_v5"], 1);
        assert_eq!(account["runs_v6"], 1);
    }

    #[test]
    fn failing_step_aborts_run_and_records_nothing() {
        let fixture = Fixture::new();
        let registry = MigrationRegistry::from_steps(vec![
            MigrationStep::new(1, "v1", run_v1),
            MigrationStep::new(2, "broken", fail),
            MigrationStep::new(3, "v3", run_v3),
        ])
        .unwrap();

        let err = fixture.apply(&registry).unwrap_err();

        assert!(matches!(err, MigrationError::Failed { version: 2, name: "broken", .. }));
        let account = fixture.account();
        assert_eq!(account["runs_v1"], 1);
        assert!(account.get("runs_v3").is_none());
        assert!(fixture.history_versions().is_empty());
    }

    #[test]
    fn up_to_date_history_applies_nothing() {
        let fixture = Fixture::new();
        fixture.record_version(7);

        let applied = fixture.apply(&counting_registry()).unwrap();

        assert!(applied.is_empty());
        assert_eq!(fixture.account(), json!({ "id": "u-1", "user_name": "ada" }));
    }

    #[test]
    fn legacy_install_without_history_leaves_migrated_documents_alone() {
        let fixture = Fixture::new();
        let accounts = fixture.db.accounts().unwrap();
        let already_current = json!({
            "id": "current",
            "user_name": "carol",
            "normalized_user_name": "CAROL",
            "security_stamp": "s",
            "concurrency_stamp": "c",
            "roles": [],
            "tokens": [{
                "login_provider": "[AccountStore]",
                "name": "AuthenticatorKey",
                "value": "K",
            }],
        });
        accounts.insert_one(already_current.clone()).unwrap();

        fixture.apply(&MigrationRegistry::discover().unwrap()).unwrap();

        assert_eq!(accounts.find_by_id("current").unwrap().unwrap(), already_current);
    }
}
