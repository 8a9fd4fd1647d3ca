//! Model instance tying together variable storage, the step channel and the
//! optional data channel.
//!
//! Locking order is channels first, registries second. Registry locks are
//! never held across network I/O: values travelling to or from the worker
//! are copied out, and results are written back with
//! [`VariableRegistry::try_set`] so that host writes made in the meantime
//! win over stale worker data.

use std::convert::TryFrom;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use fnv::FnvHashMap;

use fmubridge_core::arraystring;
use fmubridge_core::util;
use fmubridge_core::{
    AddressResolver, BridgeConfig, Causality, ModelDescription, ModelState, Value, ValueKind,
    VariableRegistry, VariableSlot,
};

use crate::bridge::BridgeProtocol;
use crate::cancel::CancelToken;
use crate::exchange::DataExchange;
use crate::{Error, Result};

const INITIALIZATION_ALLOWED: u32 = ModelState::Instantiated as u32;
const EXIT_INITIALIZATION_ALLOWED: u32 = ModelState::InitializationMode as u32;
const STEP_ALLOWED: u32 = ModelState::StepComplete as u32;
const TERMINATE_ALLOWED: u32 = ModelState::InitializationMode as u32
    | ModelState::StepComplete as u32
    | ModelState::StepFailed as u32
    | ModelState::StepCanceled as u32
    | ModelState::Error as u32;
const RESET_ALLOWED: u32 = !(ModelState::Fatal as u32 | ModelState::StepInProgress as u32);

struct Channels {
    bridge: BridgeProtocol,
    data: Option<DataExchange>,
    time: f64,
}

/// Single co-simulation instance.
pub struct ModelInstance {
    name: String,
    root: PathBuf,
    config: BridgeConfig,
    description: ModelDescription,
    state: Mutex<ModelState>,
    registries: Mutex<FnvHashMap<ValueKind, VariableRegistry>>,
    channels: Mutex<Channels>,
    cancel: CancelToken,
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| Error::Other(format!("{} lock poisoned", what)))
}

impl ModelInstance {
    /// Creates an instance for the model located at `root`.
    ///
    /// Loads the model description and all address documents. Variables
    /// whose names don't resolve stay unbound and are reported in the log.
    pub fn instantiate(name: &str, root: &Path, config: BridgeConfig) -> Result<Self> {
        let description = ModelDescription::from_path(&ModelDescription::locate(root)?)?;
        info!(
            "{}: model `{}` with {} variables",
            name,
            description.model_name,
            description.variables.len()
        );

        let resources = if config.model.resources.is_absolute() {
            config.model.resources.clone()
        } else {
            root.join(&config.model.resources)
        };
        let mut resolver = AddressResolver::new();
        resolver.set_multiple(config.model.multiple_address_files);
        resolver.load_dir(&util::normalize_path(&resources))?;

        let mut registries = ValueKind::ALL
            .iter()
            .map(|kind| (*kind, VariableRegistry::new(*kind)))
            .collect::<FnvHashMap<_, _>>();
        for decl in description.declarations() {
            let (reference, index, var_name) = (decl.reference, decl.index, decl.name.clone());
            let registry = registries
                .get_mut(&decl.start.kind())
                .ok_or_else(|| Error::Other(format!("no registry for `{}`", var_name)))?;
            registry.declare(decl)?;
            match resolver.resolve(&var_name) {
                Some(location) => registry.update(reference, index, |slot| {
                    slot.location = Some(location);
                    Ok(())
                })?,
                None => match resolver.suggest(&var_name) {
                    Some(hint) => warn!(
                        "{}: `{}` not found in address documents, did you mean `{}`?",
                        name, var_name, hint
                    ),
                    None => warn!("{}: `{}` not found in address documents", name, var_name),
                },
            }
        }

        let cancel = CancelToken::new();
        let channels = Channels {
            bridge: BridgeProtocol::from_config(&config.bridge, cancel.clone()),
            data: config
                .data
                .as_ref()
                .map(|data| DataExchange::from_config(data, cancel.clone())),
            time: 0.,
        };

        Ok(ModelInstance {
            name: name.to_string(),
            root: root.to_path_buf(),
            config,
            description,
            state: Mutex::new(ModelState::Instantiated),
            registries: Mutex::new(registries),
            channels: Mutex::new(channels),
            cancel,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn description(&self) -> &ModelDescription {
        &self.description
    }

    /// Token aborting a step blocked in a reconnect loop.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Simulation time reached by the last completed step.
    pub fn current_time(&self) -> Result<f64> {
        Ok(lock(&self.channels, "channels")?.time)
    }

    fn transition(&self, mask: u32, op: &str, next: ModelState) -> Result<()> {
        let mut state = lock(&self.state, "state")?;
        if !state.is_in(mask) {
            return Err(Error::InvalidState(format!(
                "{} not allowed in state {:?}",
                op, *state
            )));
        }
        *state = next;
        Ok(())
    }

    fn set_model_state(&self, next: ModelState) -> Result<()> {
        *lock(&self.state, "state")? = next;
        Ok(())
    }

    pub fn enter_initialization_mode(&self) -> Result<()> {
        self.transition(
            INITIALIZATION_ALLOWED,
            "entering initialization mode",
            ModelState::InitializationMode,
        )
    }

    /// Connects to the worker and makes the instance ready for stepping.
    pub fn exit_initialization_mode(&self) -> Result<()> {
        self.transition(
            EXIT_INITIALIZATION_ALLOWED,
            "exiting initialization mode",
            ModelState::InitializationMode,
        )?;
        let mut channels = lock(&self.channels, "channels")?;
        let endpoint = &self.config.bridge;
        let mut result = channels.bridge.initialize(&endpoint.host, &endpoint.port);
        if result.is_ok() {
            if let Some(data) = channels.data.as_mut() {
                result = data.open();
            }
        }
        match result {
            Ok(()) => self.set_model_state(ModelState::StepComplete),
            Err(e) => {
                error!("{}: failed connecting to worker: {}", self.name, e);
                self.set_model_state(ModelState::Error)?;
                Err(e)
            }
        }
    }

    /// Advances the worker by `step_size` seconds.
    ///
    /// A negative or non-finite step size puts the instance into the error
    /// state.
    pub fn do_step(&self, current_time: f64, step_size: f64) -> Result<()> {
        {
            let mut state = lock(&self.state, "state")?;
            if !state.is_in(STEP_ALLOWED) {
                return Err(Error::InvalidState(format!(
                    "stepping not allowed in state {:?}",
                    *state
                )));
            }
            if !(step_size >= 0.) || !step_size.is_finite() {
                error!("{}: invalid step size {}", self.name, step_size);
                *state = ModelState::Error;
                return Err(Error::InvalidStepSize(step_size));
            }
            *state = ModelState::StepInProgress;
        }
        let micros = (step_size * 1e6).round() as u64;

        let mut channels = match lock(&self.channels, "channels") {
            Ok(c) => c,
            Err(e) => {
                self.set_model_state(ModelState::Error)?;
                return Err(e);
            }
        };
        let result = self.step_channels(&mut channels, micros);
        match result {
            Ok(()) => {
                channels.time = current_time + step_size;
                self.set_model_state(ModelState::StepComplete)
            }
            Err(e) => {
                let next = match e {
                    Error::StepFailed(_) => ModelState::StepFailed,
                    Error::Cancelled => ModelState::StepCanceled,
                    _ => ModelState::Error,
                };
                error!("{}: step at t={} failed: {}", self.name, current_time, e);
                self.set_model_state(next)?;
                Err(e)
            }
        }
    }

    fn step_channels(&self, channels: &mut Channels, micros: u64) -> Result<()> {
        if let Some(data) = channels.data.as_mut() {
            self.push_inputs(data)?;
        }
        channels.bridge.step(micros)?;
        if let Some(data) = channels.data.as_mut() {
            self.fetch_outputs(data)?;
        }
        Ok(())
    }

    fn collect_slots<F>(&self, filter: F) -> Result<Vec<VariableSlot>>
    where
        F: Fn(&VariableSlot) -> bool,
    {
        let registries = lock(&self.registries, "registries")?;
        Ok(registries
            .values()
            .flat_map(|r| r.slots())
            .filter(|s| s.location.is_some() && filter(*s))
            .cloned()
            .collect())
    }

    /// Writes back copies, counting those the registry accepted.
    fn commit(&self, slots: Vec<VariableSlot>) -> Result<usize> {
        let mut registries = lock(&self.registries, "registries")?;
        let mut accepted = 0;
        for slot in slots {
            let reference = slot.reference;
            let name = slot.name.clone();
            let stored = registries
                .get_mut(&slot.kind())
                .map_or(false, |registry| registry.try_set(reference, slot));
            if stored {
                accepted += 1;
            } else {
                debug!("{}: `{}` changed meanwhile, update dropped", self.name, name);
            }
        }
        Ok(accepted)
    }

    fn push_inputs(&self, data: &mut DataExchange) -> Result<()> {
        let dirty =
            self.collect_slots(|s| s.causality.is_host_written() && !s.previously_updated)?;
        if dirty.is_empty() {
            return Ok(());
        }
        data.push(&dirty)?;
        let sent = dirty
            .into_iter()
            .map(|mut s| {
                s.previously_updated = true;
                s
            })
            .collect();
        self.commit(sent)?;
        Ok(())
    }

    fn fetch_outputs(&self, data: &mut DataExchange) -> Result<()> {
        let outputs = self.collect_slots(|s| s.causality == Causality::Output)?;
        if outputs.is_empty() {
            return Ok(());
        }
        let fetched = data.fetch(&outputs)?;
        let total = fetched.len();
        let accepted = self.commit(fetched)?;
        trace!("{}: fetched {} outputs, {} stored", self.name, total, accepted);
        Ok(())
    }

    /// Disconnects from the worker.
    pub fn terminate(&self) -> Result<()> {
        self.transition(TERMINATE_ALLOWED, "terminating", ModelState::Terminated)?;
        let mut channels = lock(&self.channels, "channels")?;
        channels.bridge.close();
        if let Some(data) = channels.data.as_mut() {
            data.close();
        }
        info!("{}: terminated at t={}", self.name, channels.time);
        Ok(())
    }

    /// Drops the worker connection and restores all variables to their
    /// start values. The instance is left in the instantiated state.
    pub fn reset(&self) -> Result<()> {
        self.transition(RESET_ALLOWED, "resetting", ModelState::Instantiated)?;
        let mut channels = lock(&self.channels, "channels")?;
        channels.bridge.close();
        if let Some(data) = channels.data.as_mut() {
            data.close();
        }
        self.cancel.reset();
        *channels = Channels {
            bridge: BridgeProtocol::from_config(&self.config.bridge, self.cancel.clone()),
            data: self
                .config
                .data
                .as_ref()
                .map(|data| DataExchange::from_config(data, self.cancel.clone())),
            time: 0.,
        };

        let mut registries = lock(&self.registries, "registries")?;
        for registry in registries.values_mut() {
            let coords = registry
                .slots()
                .map(|s| (s.reference, s.index))
                .collect::<Vec<_>>();
            for (reference, index) in coords {
                registry.update(reference, index, |slot| {
                    slot.value = slot.start.clone();
                    slot.previously_updated = true;
                    slot.invalidate();
                    Ok(())
                })?;
            }
        }
        debug!("{}: reset", self.name);
        Ok(())
    }

    /// Reads index 0 of each referenced group.
    fn get_values<T, F>(&self, kind: ValueKind, refs: &[u32], f: F) -> Result<Vec<T>>
    where
        F: Fn(&Value) -> fmubridge_core::Result<T>,
    {
        let registries = lock(&self.registries, "registries")?;
        let registry = registries
            .get(&kind)
            .ok_or_else(|| Error::Other(format!("no {} registry", kind)))?;
        refs.iter()
            .map(|r| -> Result<T> {
                let slot = registry
                    .get(*r, 0)
                    .ok_or(fmubridge_core::Error::UnknownReference(*r))?;
                Ok(f(&slot.value)?)
            })
            .collect()
    }

    /// Writes index 0 of each referenced group. Nothing is written unless
    /// every reference is known.
    fn set_values(&self, kind: ValueKind, refs: &[u32], values: Vec<Value>) -> Result<()> {
        if refs.len() != values.len() {
            return Err(Error::ArgumentMismatch {
                refs: refs.len(),
                values: values.len(),
            });
        }
        let mut registries = lock(&self.registries, "registries")?;
        let registry = registries
            .get_mut(&kind)
            .ok_or_else(|| Error::Other(format!("no {} registry", kind)))?;
        if let Some(unknown) = refs.iter().find(|r| registry.get(**r, 0).is_none()) {
            return Err(fmubridge_core::Error::UnknownReference(*unknown).into());
        }
        for (reference, value) in refs.iter().zip(values) {
            registry.update(*reference, 0, |slot| {
                slot.set_value(value)?;
                slot.previously_updated = false;
                Ok(())
            })?;
        }
        Ok(())
    }

    pub fn get_real(&self, refs: &[u32]) -> Result<Vec<f64>> {
        self.get_values(ValueKind::Real, refs, Value::as_real)
    }

    pub fn set_real(&self, refs: &[u32], values: &[f64]) -> Result<()> {
        let values = values.iter().map(|v| Value::Real(*v)).collect();
        self.set_values(ValueKind::Real, refs, values)
    }

    pub fn get_integer(&self, refs: &[u32]) -> Result<Vec<i32>> {
        self.get_values(ValueKind::Integer, refs, |v| {
            let wide = v.as_integer()?;
            i32::try_from(wide).map_err(|_| {
                fmubridge_core::Error::TypeMismatch(format!("{} doesn't fit into i32", wide))
            })
        })
    }

    pub fn set_integer(&self, refs: &[u32], values: &[i32]) -> Result<()> {
        let values = values.iter().map(|v| Value::Integer(*v as i64)).collect();
        self.set_values(ValueKind::Integer, refs, values)
    }

    pub fn get_boolean(&self, refs: &[u32]) -> Result<Vec<bool>> {
        self.get_values(ValueKind::Boolean, refs, Value::as_boolean)
    }

    pub fn set_boolean(&self, refs: &[u32], values: &[bool]) -> Result<()> {
        let values = values.iter().map(|v| Value::Boolean(*v)).collect();
        self.set_values(ValueKind::Boolean, refs, values)
    }

    pub fn get_string(&self, refs: &[u32]) -> Result<Vec<String>> {
        self.get_values(ValueKind::String, refs, |v| v.as_str().map(|s| s.to_string()))
    }

    /// Fails without writing anything if one of the strings is too long.
    pub fn set_string<S: AsRef<str>>(&self, refs: &[u32], values: &[S]) -> Result<()> {
        let values = values
            .iter()
            .map(|v| -> Result<Value> { Ok(Value::String(arraystring::new(v.as_ref())?)) })
            .collect::<Result<Vec<_>>>()?;
        self.set_values(ValueKind::String, refs, values)
    }

    pub fn get_binary(&self, refs: &[u32]) -> Result<Vec<Vec<u8>>> {
        self.get_values(ValueKind::Binary, refs, |v| v.as_binary().map(|b| b.to_vec()))
    }

    pub fn set_binary(&self, refs: &[u32], values: &[Vec<u8>]) -> Result<()> {
        let values = values.iter().map(|v| Value::Binary(v.clone())).collect();
        self.set_values(ValueKind::Binary, refs, values)
    }

    /// Copy of the slot at the given position.
    pub fn slot(&self, kind: ValueKind, reference: u32, index: u32) -> Result<VariableSlot> {
        let registries = lock(&self.registries, "registries")?;
        registries
            .get(&kind)
            .and_then(|r| r.get(reference, index))
            .cloned()
            .ok_or_else(|| fmubridge_core::Error::UnknownReference(reference).into())
    }

    pub fn get_state(&self) -> Result<ModelState> {
        Ok(*lock(&self.state, "state")?)
    }

    pub fn set_state(&self, state: ModelState) -> Result<()> {
        debug!("{}: state set to {:?}", self.name, state);
        self.set_model_state(state)
    }

    pub fn serialized_state_size(&self) -> Result<usize> {
        Ok(self.get_state()?.serialized_size())
    }

    /// Writes the current state into `buf`, which must be exactly
    /// [`serialized_state_size`](Self::serialized_state_size) bytes long.
    pub fn serialize_state(&self, buf: &mut [u8]) -> Result<()> {
        Ok(self.get_state()?.serialize_into(buf)?)
    }

    /// Parses a serialized state. The instance itself is not changed, use
    /// [`set_state`](Self::set_state) to apply it.
    pub fn deserialize_state(&self, bytes: &[u8], size: usize) -> Result<ModelState> {
        Ok(ModelState::deserialize(bytes, size)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const MODEL: &str = r#"<?xml version="1.0"?>
<fmiModelDescription modelName="ecu" guid="{1}">
  <ModelVariables>
    <ScalarVariable name="speed" valueReference="1" causality="input" declaredType="float32">
      <Real start="2.5"/>
    </ScalarVariable>
    <ScalarVariable name="gear" valueReference="2" causality="output" declaredType="sint8">
      <Integer start="1"/>
    </ScalarVariable>
    <ScalarVariable name="label" valueReference="3" causality="input">
      <String start="idle"/>
    </ScalarVariable>
    <ScalarVariable name="ghost" valueReference="4" causality="output">
      <Boolean/>
    </ScalarVariable>
  </ModelVariables>
</fmiModelDescription>
"#;

    const ADDRESSES: &str = r#"<?xml version="1.0"?>
<ADDRESS-CALCULATOR>
  <MEMORY-ELEMENT><LABEL-NAME>speed</LABEL-NAME><ABSOLUTE-ADDRESS>0x1000</ABSOLUTE-ADDRESS>
    <ROOT-OFFSET>0</ROOT-OFFSET><SIZE>4</SIZE></MEMORY-ELEMENT>
  <MEMORY-ELEMENT><LABEL-NAME>gear</LABEL-NAME><ABSOLUTE-ADDRESS>0x1004</ABSOLUTE-ADDRESS>
    <ROOT-OFFSET>4</ROOT-OFFSET><SIZE>1</SIZE></MEMORY-ELEMENT>
  <MEMORY-ELEMENT><LABEL-NAME>label</LABEL-NAME><ABSOLUTE-ADDRESS>0x1008</ABSOLUTE-ADDRESS>
    <ROOT-OFFSET>8</ROOT-OFFSET><SIZE>16</SIZE></MEMORY-ELEMENT>
</ADDRESS-CALCULATOR>
"#;

    fn model_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("modelDescription.xml"), MODEL).unwrap();
        fs::create_dir(dir.path().join("resources")).unwrap();
        fs::write(dir.path().join("resources").join("ecu.adx"), ADDRESSES).unwrap();
        dir
    }

    #[test]
    fn instantiate_binds_variables() {
        let dir = model_dir();
        let instance =
            ModelInstance::instantiate("ecu1", dir.path(), BridgeConfig::default()).unwrap();
        assert_eq!(instance.get_state().unwrap(), ModelState::Instantiated);
        assert_eq!(instance.get_real(&[1]).unwrap(), vec![2.5]);
        assert_eq!(instance.get_integer(&[2]).unwrap(), vec![1]);
        assert_eq!(instance.get_string(&[3]).unwrap(), vec!["idle".to_string()]);

        let speed = instance.slot(ValueKind::Real, 1, 0).unwrap();
        assert_eq!(speed.location.unwrap().address, 0x1000);
        let ghost = instance.slot(ValueKind::Boolean, 4, 0).unwrap();
        assert!(ghost.location.is_none());
    }

    #[test]
    fn missing_documents_fail_instantiation() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("modelDescription.xml"), MODEL).unwrap();
        assert!(ModelInstance::instantiate("ecu1", dir.path(), BridgeConfig::default()).is_err());
    }

    #[test]
    fn setters_validate_references_first() {
        let dir = model_dir();
        let instance =
            ModelInstance::instantiate("ecu1", dir.path(), BridgeConfig::default()).unwrap();
        assert!(matches!(
            instance.set_real(&[1, 99], &[1.0, 2.0]),
            Err(Error::CoreError(fmubridge_core::Error::UnknownReference(99)))
        ));
        assert_eq!(instance.get_real(&[1]).unwrap(), vec![2.5]);
        assert!(matches!(
            instance.set_real(&[1], &[1.0, 2.0]),
            Err(Error::ArgumentMismatch { refs: 1, values: 2 })
        ));

        instance.set_real(&[1], &[7.0]).unwrap();
        assert_eq!(instance.get_real(&[1]).unwrap(), vec![7.0]);
        assert!(!instance.slot(ValueKind::Real, 1, 0).unwrap().previously_updated);

        let long = "x".repeat(300);
        assert!(instance.set_string(&[3], &[long.as_str()]).is_err());
        assert_eq!(instance.get_string(&[3]).unwrap(), vec!["idle".to_string()]);
    }

    #[test]
    fn lifecycle_order_is_enforced() {
        let dir = model_dir();
        let instance =
            ModelInstance::instantiate("ecu1", dir.path(), BridgeConfig::default()).unwrap();
        assert!(matches!(
            instance.do_step(0., 0.1),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            instance.do_step(0., -0.1),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(instance.get_state().unwrap(), ModelState::Instantiated);
        assert!(instance.exit_initialization_mode().is_err());
        instance.enter_initialization_mode().unwrap();
        assert_eq!(instance.get_state().unwrap(), ModelState::InitializationMode);
        instance.terminate().unwrap();
        assert_eq!(instance.get_state().unwrap(), ModelState::Terminated);
    }

    #[test]
    fn invalid_step_size_is_an_error() {
        let dir = model_dir();
        let instance =
            ModelInstance::instantiate("ecu1", dir.path(), BridgeConfig::default()).unwrap();
        instance.set_state(ModelState::StepComplete).unwrap();
        assert!(matches!(
            instance.do_step(0., std::f64::NAN),
            Err(Error::InvalidStepSize(_))
        ));
        assert_eq!(instance.get_state().unwrap(), ModelState::Error);
        assert!(matches!(instance.do_step(0., 0.1), Err(Error::InvalidState(_))));

        instance.reset().unwrap();
        assert_eq!(instance.get_state().unwrap(), ModelState::Instantiated);
    }

    #[test]
    fn reset_is_refused_mid_step() {
        let dir = model_dir();
        let instance =
            ModelInstance::instantiate("ecu1", dir.path(), BridgeConfig::default()).unwrap();
        instance.set_state(ModelState::StepInProgress).unwrap();
        assert!(matches!(instance.reset(), Err(Error::InvalidState(_))));
        assert_eq!(instance.get_state().unwrap(), ModelState::StepInProgress);
    }

    #[test]
    fn reset_restores_start_values() {
        let dir = model_dir();
        let instance =
            ModelInstance::instantiate("ecu1", dir.path(), BridgeConfig::default()).unwrap();
        instance.set_real(&[1], &[9.0]).unwrap();
        instance.set_integer(&[2], &[4]).unwrap();
        instance.reset().unwrap();
        assert_eq!(instance.get_real(&[1]).unwrap(), vec![2.5]);
        assert_eq!(instance.get_integer(&[2]).unwrap(), vec![1]);
        assert!(instance.slot(ValueKind::Real, 1, 0).unwrap().previously_updated);
        assert_eq!(instance.get_state().unwrap(), ModelState::Instantiated);
    }

    #[test]
    fn state_blob() {
        let dir = model_dir();
        let instance =
            ModelInstance::instantiate("ecu1", dir.path(), BridgeConfig::default()).unwrap();
        let size = instance.serialized_state_size().unwrap();
        let mut buf = vec![0; size];
        instance.serialize_state(&mut buf).unwrap();
        assert_eq!(&buf, b"2");
        assert_eq!(
            instance.deserialize_state(&buf, size).unwrap(),
            ModelState::Instantiated
        );
        assert!(instance.deserialize_state(&buf, size + 1).is_err());
        instance.set_state(ModelState::StepComplete).unwrap();
        assert_eq!(instance.get_state().unwrap(), ModelState::StepComplete);
    }
}
