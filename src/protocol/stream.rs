//! Tor stream handles
//!
//! A [`TorStream`] is returned once BEGIN or BEGIN_DIR has been answered with
//! CONNECTED. Data goes out through the circuit's DATA fragmentation and
//! comes back from the circuit's pending queue; SENDME windows are kept by
//! the circuit (`flow_control::StreamFlowControl`, 500-cell window, 50-cell
//! increments).

use super::circuit::Circuit;
use super::relay_cell::ConnectedAddress;
use crate::error::{Result, TorError};

/// A stream multiplexed over a circuit
#[derive(Debug)]
pub struct TorStream {
    /// The circuit this stream uses
    circuit: Circuit,

    /// Stream ID
    stream_id: u16,

    /// Address reported in CONNECTED
    address: ConnectedAddress,

    /// END seen or sent
    closed: bool,
}

impl TorStream {
    pub(crate) fn new(circuit: Circuit, stream_id: u16, address: ConnectedAddress) -> Self {
        Self {
            circuit,
            stream_id,
            address,
            closed: false,
        }
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    pub fn circuit_id(&self) -> u32 {
        self.circuit.id()
    }

    pub fn circuit(&self) -> &Circuit {
        &self.circuit
    }

    pub fn connected_address(&self) -> &ConnectedAddress {
        &self.address
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Send bytes, split into DATA cells of at most 498 bytes
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(TorError::Stream(format!("Stream {} is closed", self.stream_id)));
        }
        self.circuit.send_data(self.stream_id, data).await
    }

    /// Next received payload, `None` after END
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        if self.closed {
            return Ok(None);
        }
        let data = self.circuit.receive_data(self.stream_id).await?;
        if data.is_none() {
            log::debug!("Stream {} reached END", self.stream_id);
            self.closed = true;
        }
        Ok(data)
    }

    /// Collect payloads until END
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.recv().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Send END and release the stream id
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        log::debug!("Closing stream {}", self.stream_id);
        self.circuit.close_stream(self.stream_id)
    }
}

impl Drop for TorStream {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}
