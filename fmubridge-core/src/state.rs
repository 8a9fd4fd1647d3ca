//! Instance lifecycle states and their serialized form.

use std::fmt;

use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::error::{Error, Result};

/// Lifecycle state of a model instance.
///
/// Values are distinct bits so that sets of allowed states can be expressed
/// as masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u32)]
pub enum ModelState {
    StartAndEnd = 1 << 0,
    Instantiated = 1 << 1,
    InitializationMode = 1 << 2,
    ContinuousTimeMode = 1 << 3,
    EventMode = 1 << 4,
    StepComplete = 1 << 5,
    StepInProgress = 1 << 6,
    StepFailed = 1 << 7,
    StepCanceled = 1 << 8,
    Terminated = 1 << 9,
    Error = 1 << 10,
    Fatal = 1 << 11,
}

const ALL_STATES: [ModelState; 12] = [
    ModelState::StartAndEnd,
    ModelState::Instantiated,
    ModelState::InitializationMode,
    ModelState::ContinuousTimeMode,
    ModelState::EventMode,
    ModelState::StepComplete,
    ModelState::StepInProgress,
    ModelState::StepFailed,
    ModelState::StepCanceled,
    ModelState::Terminated,
    ModelState::Error,
    ModelState::Fatal,
];

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", *self as u32)
    }
}

impl ModelState {
    pub fn from_bits(bits: u32) -> Option<ModelState> {
        ALL_STATES.iter().copied().find(|s| *s as u32 == bits)
    }

    /// Whether the state is part of `mask`.
    pub fn is_in(&self, mask: u32) -> bool {
        *self as u32 & mask != 0
    }

    /// Length of the serialized form in bytes.
    pub fn serialized_size(&self) -> usize {
        self.to_string().len()
    }

    /// Writes the serialized form into `buf`, which must be exactly
    /// [`serialized_size`](Self::serialized_size) bytes long.
    pub fn serialize_into(&self, buf: &mut [u8]) -> Result<()> {
        let text = self.to_string();
        if buf.len() != text.len() {
            return Err(Error::InvalidState(format!(
                "serialized state is {} bytes, buffer holds {}",
                text.len(),
                buf.len()
            )));
        }
        buf.copy_from_slice(text.as_bytes());
        Ok(())
    }

    /// Reads a state serialized with [`serialize_into`](Self::serialize_into).
    ///
    /// The text runs up to the first NUL byte or the end of `bytes` and must
    /// be exactly `size` bytes long.
    pub fn deserialize(bytes: &[u8], size: usize) -> Result<ModelState> {
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        if end != size {
            return Err(Error::InvalidState(format!(
                "actual and received serialized state size mismatch: {} != {}",
                end, size
            )));
        }
        let text = std::str::from_utf8(&bytes[..end])
            .map_err(|e| Error::InvalidState(e.to_string()))?;
        let bits = text.trim().parse::<u32>()?;
        ModelState::from_bits(bits)
            .ok_or_else(|| Error::InvalidState(format!("unknown state value: {}", bits)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_form_is_decimal_text() {
        let state = ModelState::StepComplete;
        assert_eq!(state.serialized_size(), 2);
        let mut buf = vec![0; state.serialized_size()];
        state.serialize_into(&mut buf).unwrap();
        assert_eq!(&buf, b"32");
        assert_eq!(ModelState::deserialize(&buf, 2).unwrap(), state);
    }

    #[test]
    fn size_must_match_exactly() {
        let mut short = vec![0; 1];
        assert!(ModelState::Terminated.serialize_into(&mut short).is_err());
        assert!(ModelState::deserialize(b"512", 2).is_err());
        assert!(ModelState::deserialize(b"512\0\0", 5).is_err());
        assert_eq!(
            ModelState::deserialize(b"512\0\0", 3).unwrap(),
            ModelState::Terminated
        );
    }

    #[test]
    fn unknown_values_are_rejected() {
        assert!(ModelState::deserialize(b"3", 1).is_err());
        assert!(ModelState::deserialize(b"ab", 2).is_err());
    }
}
