//! Typed storage for model variables.
//!
//! A [`VariableRegistry`] holds all variables of one value kind for a single
//! model instance. Variables are addressed by their value reference and an
//! index inside the group of slots sharing that reference (a reference
//! standing for an array maps to several slots).
//!
//! Slots handed out by the registry are copies. Writing a modified copy
//! back with [`VariableRegistry::try_set`] only succeeds if the copy was
//! taken from the slot currently stored at the same position and nothing
//! has replaced that slot in the meantime.

use std::collections::BTreeMap;
use std::sync::Arc;

use id_pool::IdPool;

use crate::address::AddressEntry;
use crate::arraystring;
use crate::error::{Error, Result};
use crate::var::{Causality, ElementType, Quantization, Value, ValueKind};

/// Registry-assigned slot identity.
pub type SlotId = u32;

/// Declaration of a single variable slot.
#[derive(Debug, Clone)]
pub struct SlotDecl {
    pub reference: u32,
    pub index: u32,
    pub name: String,
    pub element_type: ElementType,
    pub causality: Causality,
    pub variability: String,
    pub quantization: Quantization,
    pub start: Value,
}

/// One typed model variable.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableSlot {
    id: SlotId,
    version: u64,
    pub reference: u32,
    pub index: u32,
    pub name: String,
    pub element_type: ElementType,
    pub causality: Causality,
    pub variability: String,
    pub quantization: Quantization,
    pub value: Value,
    pub start: Value,
    /// Set when the worker was the last one to write the value
    pub previously_updated: bool,
    /// Set once a value was received since creation or last invalidation
    pub data_fetched: bool,
    /// Location in worker memory, if the name resolved
    pub location: Option<Arc<AddressEntry>>,
}

impl VariableSlot {
    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn kind(&self) -> ValueKind {
        self.value.kind()
    }

    /// Replaces the current value. The new value must be of the slot's kind.
    pub fn set_value(&mut self, value: Value) -> Result<()> {
        if value.kind() != self.kind() {
            return Err(Error::TypeMismatch(format!(
                "`{}` holds {}, got {}",
                self.name,
                self.kind(),
                value.kind()
            )));
        }
        self.value = value;
        self.data_fetched = true;
        Ok(())
    }

    /// Decodes a raw buffer laid out as the slot's element type.
    pub fn set_from_wire(&mut self, bytes: &[u8]) -> Result<()> {
        let value = Value::decode(self.kind(), self.element_type, &self.quantization, bytes)?;
        self.set_value(value)
    }

    /// Encodes the current value into the worker's memory layout.
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        self.value.encode(self.element_type, &self.quantization)
    }

    pub fn set_real(&mut self, value: f64) -> Result<()> {
        self.set_value(Value::Real(value))
    }

    pub fn set_integer(&mut self, value: i64) -> Result<()> {
        self.set_value(Value::Integer(value))
    }

    pub fn set_boolean(&mut self, value: bool) -> Result<()> {
        self.set_value(Value::Boolean(value))
    }

    /// Fails without touching the slot if `value` exceeds the string
    /// capacity.
    pub fn set_string(&mut self, value: &str) -> Result<()> {
        self.set_value(Value::String(arraystring::new(value)?))
    }

    pub fn set_binary(&mut self, value: Vec<u8>) -> Result<()> {
        self.set_value(Value::Binary(value))
    }

    /// Marks the value as not yet received.
    pub fn invalidate(&mut self) {
        self.data_fetched = false;
    }
}

/// Slots of one value kind, keyed by value reference.
pub struct VariableRegistry {
    kind: ValueKind,
    groups: BTreeMap<u32, Vec<VariableSlot>>,
    id_pool: IdPool,
}

impl VariableRegistry {
    pub fn new(kind: ValueKind) -> Self {
        Self {
            kind,
            groups: BTreeMap::new(),
            id_pool: IdPool::new(),
        }
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Adds a new slot. Indices within a group must be declared in order.
    pub fn declare(&mut self, decl: SlotDecl) -> Result<()> {
        if decl.start.kind() != self.kind {
            return Err(Error::TypeMismatch(format!(
                "`{}`: {} start value in {} registry",
                decl.name,
                decl.start.kind(),
                self.kind
            )));
        }
        let len = self.group(decl.reference).map(|g| g.len()).unwrap_or(0) as u32;
        if decl.index < len {
            return Err(Error::DuplicateSlot {
                reference: decl.reference,
                index: decl.index,
            });
        } else if decl.index > len {
            return Err(Error::SlotIndexOutOfRange {
                reference: decl.reference,
                index: decl.index,
            });
        }
        let id = self.id_pool.request_id().ok_or(Error::RequestIdError)?;
        trace!(
            "declared {} slot `{}` ({}/{}) with id {}",
            self.kind,
            decl.name,
            decl.reference,
            decl.index,
            id
        );
        let group = self.groups.entry(decl.reference).or_insert_with(Vec::new);
        group.push(VariableSlot {
            id,
            version: 0,
            reference: decl.reference,
            index: decl.index,
            name: decl.name,
            element_type: decl.element_type,
            causality: decl.causality,
            variability: decl.variability,
            quantization: decl.quantization,
            value: decl.start.clone(),
            start: decl.start,
            previously_updated: true,
            data_fetched: false,
            location: None,
        });
        Ok(())
    }

    pub fn get(&self, reference: u32, index: u32) -> Option<&VariableSlot> {
        self.groups.get(&reference)?.get(index as usize)
    }

    pub fn group(&self, reference: u32) -> Option<&[VariableSlot]> {
        self.groups.get(&reference).map(|g| g.as_slice())
    }

    pub fn contains(&self, reference: u32) -> bool {
        self.groups.contains_key(&reference)
    }

    /// Writes back a copy of a stored slot.
    ///
    /// Returns `false` and leaves the registry untouched when the index is
    /// out of bounds for the group, or when the stored slot is a different
    /// slot or has been replaced since the copy was taken.
    pub fn try_set(&mut self, reference: u32, slot: VariableSlot) -> bool {
        let stored = match self
            .groups
            .get_mut(&reference)
            .and_then(|g| g.get_mut(slot.index as usize))
        {
            Some(s) => s,
            None => return false,
        };
        if slot.reference != reference || stored.id != slot.id || stored.version != slot.version {
            debug!(
                "rejected update of `{}` ({}/{}): stale or foreign slot",
                stored.name, reference, slot.index
            );
            return false;
        }
        *stored = VariableSlot {
            version: slot.version + 1,
            ..slot
        };
        true
    }

    /// Applies `f` to the slot at the given position. On error the stored
    /// slot is left unchanged.
    pub fn update<F>(&mut self, reference: u32, index: u32, f: F) -> Result<()>
    where
        F: FnOnce(&mut VariableSlot) -> Result<()>,
    {
        let stored = self
            .groups
            .get_mut(&reference)
            .ok_or(Error::UnknownReference(reference))?
            .get_mut(index as usize)
            .ok_or(Error::SlotIndexOutOfRange { reference, index })?;
        let mut copy = stored.clone();
        f(&mut copy)?;
        copy.version = stored.version + 1;
        *stored = copy;
        Ok(())
    }

    /// Iterates all slots in reference order.
    pub fn slots(&self) -> impl Iterator<Item = &VariableSlot> {
        self.groups.values().flat_map(|g| g.iter())
    }

    pub fn len(&self) -> usize {
        self.groups.values().map(|g| g.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
