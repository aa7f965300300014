//! Instrument and setup CRUD on top of the JSON files.
//!
//! Ids are assigned as `max existing + 1`, tracked against an in-memory
//! high-water mark so an id freed by a delete is not handed out again within
//! the process. Name uniqueness and the referential invariants are enforced
//! on every create/update; deleting an instrument still referenced by a
//! setup is a conflict.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

use labmon_core::error::{MonitorError, MonitorResult};
use labmon_core::model::{
    Instrument, InstrumentUpdate, MonitoringSetup, MonitoringSetupUpdate, NewInstrument,
    NewMonitoringSetup,
};
use labmon_core::validate;

use crate::json_file::JsonFile;

pub struct ConfigStore {
    instruments: JsonFile<Instrument>,
    setups: JsonFile<MonitoringSetup>,
    // Per-file mutation locks; readers go straight to the file.
    instruments_lock: Mutex<()>,
    setups_lock: Mutex<()>,
    next_instrument_id: AtomicU64,
    next_setup_id: AtomicU64,
}

impl ConfigStore {
    /// Open (or create) `instruments.json` and `setups.json` under the data
    /// directory. Corrupt files fail here, before anything starts.
    pub async fn open(data_dir: impl AsRef<Path>) -> MonitorResult<Self> {
        let data_dir = data_dir.as_ref();
        let instruments = JsonFile::open(data_dir.join("instruments.json")).await?;
        let setups = JsonFile::open(data_dir.join("setups.json")).await?;

        let instrument_high = instruments
            .load()
            .await?
            .iter()
            .map(|i: &Instrument| i.id)
            .max()
            .unwrap_or(0);
        let setup_high = setups
            .load()
            .await?
            .iter()
            .map(|s: &MonitoringSetup| s.id)
            .max()
            .unwrap_or(0);

        Ok(Self {
            instruments,
            setups,
            instruments_lock: Mutex::new(()),
            setups_lock: Mutex::new(()),
            next_instrument_id: AtomicU64::new(instrument_high + 1),
            next_setup_id: AtomicU64::new(setup_high + 1),
        })
    }

    // =========================================================================
    // Instruments
    // =========================================================================

    pub async fn list_instruments(&self) -> MonitorResult<Vec<Instrument>> {
        self.instruments.load().await
    }

    pub async fn get_instrument(&self, id: u64) -> MonitorResult<Instrument> {
        self.instruments
            .load()
            .await?
            .into_iter()
            .find(|i| i.id == id)
            .ok_or_else(|| MonitorError::not_found("instrument", id))
    }

    pub async fn create_instrument(&self, new: NewInstrument) -> MonitorResult<Instrument> {
        let _guard = self.instruments_lock.lock().await;
        let mut instruments = self.instruments.load().await?;

        validate::validate_instrument(&new.name, &new.address, &new.description)?;
        validate::check_name_unique(
            &new.name,
            instruments.iter().map(|i| (i.id, i.name.as_str())),
            None,
        )?;

        let id = self.next_instrument_id.fetch_add(1, Ordering::SeqCst);
        let instrument = Instrument {
            id,
            name: new.name,
            address: new.address,
            description: new.description,
            is_active: new.is_active,
        };
        instruments.push(instrument.clone());
        self.instruments.save(&instruments).await?;
        tracing::info!(id, name = %instrument.name, "instrument created");
        Ok(instrument)
    }

    pub async fn update_instrument(
        &self,
        id: u64,
        update: InstrumentUpdate,
    ) -> MonitorResult<Instrument> {
        let _guard = self.instruments_lock.lock().await;
        let mut instruments = self.instruments.load().await?;

        if let Some(name) = &update.name {
            validate::check_name_unique(
                name,
                instruments.iter().map(|i| (i.id, i.name.as_str())),
                Some(id),
            )?;
        }

        let instrument = instruments
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| MonitorError::not_found("instrument", id))?;

        if let Some(name) = update.name {
            instrument.name = name;
        }
        if let Some(address) = update.address {
            instrument.address = address;
        }
        if let Some(description) = update.description {
            instrument.description = description;
        }
        if let Some(is_active) = update.is_active {
            instrument.is_active = is_active;
        }
        validate::validate_instrument(
            &instrument.name,
            &instrument.address,
            &instrument.description,
        )?;

        let updated = instrument.clone();
        self.instruments.save(&instruments).await?;
        Ok(updated)
    }

    /// Delete an instrument. Fails with `Conflict` while any setup still
    /// references it, either as a target or from a state's settings.
    pub async fn delete_instrument(&self, id: u64) -> MonitorResult<()> {
        let _guard = self.instruments_lock.lock().await;
        let mut instruments = self.instruments.load().await?;

        if !instruments.iter().any(|i| i.id == id) {
            return Err(MonitorError::not_found("instrument", id));
        }

        let setups = self.setups.load().await?;
        let referenced = setups.iter().find(|s| {
            s.instruments.iter().any(|t| t.instrument_id == id)
                || s.states
                    .iter()
                    .any(|st| st.instrument_settings.contains_key(&id))
        });
        if let Some(setup) = referenced {
            return Err(MonitorError::Conflict(format!(
                "instrument {} is referenced by setup '{}'",
                id, setup.name
            )));
        }

        instruments.retain(|i| i.id != id);
        self.instruments.save(&instruments).await?;
        tracing::info!(id, "instrument deleted");
        Ok(())
    }

    // =========================================================================
    // Monitoring setups
    // =========================================================================

    pub async fn list_setups(&self) -> MonitorResult<Vec<MonitoringSetup>> {
        self.setups.load().await
    }

    pub async fn get_setup(&self, id: u64) -> MonitorResult<MonitoringSetup> {
        self.setups
            .load()
            .await?
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| MonitorError::not_found("setup", id))
    }

    pub async fn create_setup(&self, new: NewMonitoringSetup) -> MonitorResult<MonitoringSetup> {
        let _guard = self.setups_lock.lock().await;
        let mut setups = self.setups.load().await?;
        let instruments = self.instruments.load().await?;

        validate::check_name_unique(
            &new.name,
            setups.iter().map(|s| (s.id, s.name.as_str())),
            None,
        )?;

        let id = self.next_setup_id.fetch_add(1, Ordering::SeqCst);
        let setup = MonitoringSetup {
            id,
            name: new.name,
            frequency_hz: new.frequency_hz,
            instruments: new.instruments,
            states: new.states,
            transitions: new.transitions,
            initial_state_id: new.initial_state_id,
        };
        validate::validate_setup(&setup, &instruments)?;

        setups.push(setup.clone());
        self.setups.save(&setups).await?;
        tracing::info!(id, name = %setup.name, "setup created");
        Ok(setup)
    }

    pub async fn update_setup(
        &self,
        id: u64,
        update: MonitoringSetupUpdate,
    ) -> MonitorResult<MonitoringSetup> {
        let _guard = self.setups_lock.lock().await;
        let mut setups = self.setups.load().await?;
        let instruments = self.instruments.load().await?;

        if let Some(name) = &update.name {
            validate::check_name_unique(
                name,
                setups.iter().map(|s| (s.id, s.name.as_str())),
                Some(id),
            )?;
        }

        let setup = setups
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| MonitorError::not_found("setup", id))?;

        if let Some(name) = update.name {
            setup.name = name;
        }
        if let Some(frequency_hz) = update.frequency_hz {
            setup.frequency_hz = frequency_hz;
        }
        if let Some(targets) = update.instruments {
            setup.instruments = targets;
        }
        if let Some(states) = update.states {
            setup.states = states;
        }
        if let Some(transitions) = update.transitions {
            setup.transitions = transitions;
        }
        if let Some(initial) = update.initial_state_id {
            setup.initial_state_id = Some(initial);
        }
        validate::validate_setup(setup, &instruments)?;

        let updated = setup.clone();
        self.setups.save(&setups).await?;
        Ok(updated)
    }

    pub async fn delete_setup(&self, id: u64) -> MonitorResult<()> {
        let _guard = self.setups_lock.lock().await;
        let mut setups = self.setups.load().await?;
        let before = setups.len();
        setups.retain(|s| s.id != id);
        if setups.len() == before {
            return Err(MonitorError::not_found("setup", id));
        }
        self.setups.save(&setups).await?;
        tracing::info!(id, "setup deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labmon_core::capability::single_mode_capability;
    use labmon_core::model::{Target, TargetParameters};

    fn new_instrument(name: &str) -> NewInstrument {
        let capability = single_mode_capability("run", &[("v", "MEAS:V?", "V", 1.0)]);
        NewInstrument {
            name: name.into(),
            address: "psu.lab/inst0".into(),
            description: capability.to_description().unwrap(),
            is_active: true,
        }
    }

    fn new_setup(name: &str, instrument_id: u64) -> NewMonitoringSetup {
        NewMonitoringSetup {
            name: name.into(),
            frequency_hz: 5.0,
            instruments: vec![Target {
                instrument_id,
                parameters: TargetParameters {
                    mode_id: Some("run".into()),
                    mode_params: Default::default(),
                },
            }],
            states: Vec::new(),
            transitions: Vec::new(),
            initial_state_id: None,
        }
    }

    #[tokio::test]
    async fn create_assigns_increasing_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).await.unwrap();

        let a = store.create_instrument(new_instrument("a")).await.unwrap();
        let b = store.create_instrument(new_instrument("b")).await.unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);

        // Deleting the newest does not free its id for reuse.
        store.delete_instrument(b.id).await.unwrap();
        let c = store.create_instrument(new_instrument("c")).await.unwrap();
        assert_eq!(c.id, 3);
    }

    #[tokio::test]
    async fn duplicate_name_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).await.unwrap();

        store.create_instrument(new_instrument("psu")).await.unwrap();
        let err = store
            .create_instrument(new_instrument("psu"))
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::NameTaken(_)));
    }

    #[tokio::test]
    async fn update_rejects_name_collision_but_allows_self() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).await.unwrap();
        let a = store.create_instrument(new_instrument("a")).await.unwrap();
        store.create_instrument(new_instrument("b")).await.unwrap();

        // Renaming a onto itself is fine.
        store
            .update_instrument(
                a.id,
                InstrumentUpdate {
                    name: Some("a".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = store
            .update_instrument(
                a.id,
                InstrumentUpdate {
                    name: Some("b".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::NameTaken(_)));
    }

    #[tokio::test]
    async fn delete_referenced_instrument_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).await.unwrap();
        let instrument = store.create_instrument(new_instrument("psu")).await.unwrap();
        store
            .create_setup(new_setup("bake", instrument.id))
            .await
            .unwrap();

        let err = store.delete_instrument(instrument.id).await.unwrap_err();
        assert!(matches!(err, MonitorError::Conflict(_)));
    }

    #[tokio::test]
    async fn setup_referencing_missing_instrument_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).await.unwrap();
        let err = store.create_setup(new_setup("bake", 42)).await.unwrap_err();
        assert!(matches!(err, MonitorError::Validation { .. }));
    }

    #[tokio::test]
    async fn definitions_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ConfigStore::open(dir.path()).await.unwrap();
            let i = store.create_instrument(new_instrument("psu")).await.unwrap();
            store.create_setup(new_setup("bake", i.id)).await.unwrap();
        }
        let store = ConfigStore::open(dir.path()).await.unwrap();
        let instruments = store.list_instruments().await.unwrap();
        let setups = store.list_setups().await.unwrap();
        assert_eq!(instruments.len(), 1);
        assert_eq!(setups.len(), 1);
        assert_eq!(setups[0].name, "bake");

        // Ids continue past what the files contain.
        let next = store.create_instrument(new_instrument("dmm")).await.unwrap();
        assert_eq!(next.id, 2);
    }

    #[tokio::test]
    async fn partial_update_merges_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).await.unwrap();
        let i = store.create_instrument(new_instrument("psu")).await.unwrap();
        let s = store.create_setup(new_setup("bake", i.id)).await.unwrap();

        let updated = store
            .update_setup(
                s.id,
                MonitoringSetupUpdate {
                    frequency_hz: Some(10.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.frequency_hz, 10.0);
        assert_eq!(updated.name, "bake");
        assert_eq!(updated.instruments.len(), 1);
    }
}
