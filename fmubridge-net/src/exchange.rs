//! Value exchange with the worker over the data channel.

use std::convert::TryFrom;

use fmubridge_core::{ElementType, EndpointConfig, ValueKind, VariableSlot};

use crate::cancel::CancelToken;
use crate::msg::{DataRecord, RecordOp};
use crate::socket::{Socket, SocketConfig};
use crate::{Error, Result};

/// Data channel to the worker.
pub struct DataExchange {
    socket: Socket,
    config: EndpointConfig,
    cancel: CancelToken,
}

impl DataExchange {
    pub fn from_config(config: &EndpointConfig, cancel: CancelToken) -> Self {
        let mut socket = Socket::new_with_config(config.transport, SocketConfig::default());
        socket.configure(&config.port, &config.host);
        Self {
            socket,
            config: config.clone(),
            cancel,
        }
    }

    pub fn open(&mut self) -> Result<()> {
        self.socket.open(&self.config.retry.policy(), &self.cancel)
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_connected()
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Writes the values of `slots` into worker memory. Returns the number
    /// of records sent.
    pub fn push(&mut self, slots: &[VariableSlot]) -> Result<usize> {
        let mut buf = Vec::new();
        let mut count = 0;
        for slot in slots {
            if let Some(record) = write_record(slot)? {
                record.encode_into(&mut buf);
                count += 1;
            }
        }
        if count > 0 {
            self.socket.write(&buf)?;
            trace!("pushed {} values ({} bytes)", count, buf.len());
        }
        Ok(count)
    }

    /// Reads the current values of `slots` from worker memory.
    ///
    /// Returns updated copies of the slots that could be fetched, ready to
    /// be written back to their registry.
    pub fn fetch(&mut self, slots: &[VariableSlot]) -> Result<Vec<VariableSlot>> {
        let requests = slots
            .iter()
            .filter_map(|slot| read_record(slot).map(|r| (slot, r)))
            .collect::<Vec<_>>();
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let mut buf = Vec::new();
        for (_, record) in &requests {
            record.encode_into(&mut buf);
        }
        self.socket.write(&buf)?;

        let mut fetched = Vec::with_capacity(requests.len());
        for (slot, record) in requests {
            let mut payload = vec![0; record.size as usize];
            self.socket.read_exact(&mut payload)?;
            let mut copy = slot.clone();
            match copy.set_from_wire(&payload) {
                Ok(()) => {
                    copy.previously_updated = true;
                    fetched.push(copy);
                }
                Err(e) => warn!("dropping value fetched for `{}`: {}", slot.name, e),
            }
        }
        Ok(fetched)
    }

    pub fn close(&mut self) {
        self.socket.close();
    }
}

/// Number of bytes the slot occupies in worker memory, if known.
fn record_size(slot: &VariableSlot) -> Option<u32> {
    let location = slot.location.as_ref()?;
    let size = match slot.kind() {
        ValueKind::String | ValueKind::Binary => location.size as usize,
        _ => slot.element_type.wire_size()?,
    };
    if size == 0 {
        return None;
    }
    u32::try_from(size).ok()
}

fn header(slot: &VariableSlot, op: RecordOp) -> Option<DataRecord> {
    let location = match &slot.location {
        Some(l) => l,
        None => {
            debug!("`{}` has no location, skipping", slot.name);
            return None;
        }
    };
    if slot.element_type == ElementType::Unset {
        debug!("`{}` has no element type, skipping", slot.name);
        return None;
    }
    let size = match record_size(slot) {
        Some(s) => s,
        None => {
            debug!("`{}` has no usable size, skipping", slot.name);
            return None;
        }
    };
    Some(DataRecord {
        op,
        reference: slot.reference,
        index: slot.index,
        address: location.address,
        offset: location.offset,
        size,
        payload: Vec::new(),
    })
}

fn read_record(slot: &VariableSlot) -> Option<DataRecord> {
    header(slot, RecordOp::Read)
}

fn write_record(slot: &VariableSlot) -> Result<Option<DataRecord>> {
    let mut record = match header(slot, RecordOp::Write) {
        Some(r) => r,
        None => return Ok(None),
    };
    let mut payload = slot.to_wire()?;
    let size = record.size as usize;
    match slot.kind() {
        // keep the terminator inside the target buffer
        ValueKind::String => {
            payload.resize(size, 0);
            payload[size - 1] = 0;
        }
        ValueKind::Binary => payload.resize(size, 0),
        _ => {
            if payload.len() != size {
                return Err(Error::MalformedRecord(format!(
                    "`{}` encodes to {} bytes, expected {}",
                    slot.name,
                    payload.len(),
                    size
                )));
            }
        }
    }
    record.payload = payload;
    Ok(Some(record))
}
