//! Tunable connection parameters.
//!
//! Every constant the engine depends on is a field of [`Config`] so it can be
//! set from the command line or by an embedding application.  The defaults
//! match what an IrCOMM client over TinyTP expects.

use thiserror::Error;

use crate::flow::{DEFAULT_LOW_REMOTE_CREDIT, DEFAULT_SEND_CREDIT_CEILING, DEFAULT_SURPLUS_CREDIT};
use crate::pdu::MAX_CREDIT;
use crate::work_queue::DEFAULT_QUEUE_LIMIT;

/// Discovery hint bit advertised by IrCOMM-capable devices.
pub const HINT_IRCOMM: u16 = 0x0004;

/// Rejected configuration values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("initial credit {0} exceeds the 7-bit credit field")]
    InitialCredit(u32),
    #[error("send credit ceiling must be at least 1")]
    SendCreditCeiling,
    #[error("{0} queue limit must be at least 1")]
    QueueLimit(&'static str),
    #[error("read buffer of {0} byte(s) cannot hold a data PDU")]
    ReadBuffer(usize),
    #[error("{0} must not be empty")]
    EmptyName(&'static str),
}

/// Per-connection tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Receive buffers granted to the peer at connect time.
    pub initial_credit: u32,
    /// Upper bound on credit the peer may grant us.
    pub send_credit_ceiling: u32,
    /// Largest SDU we reassemble; `0` disables inbound segmentation.
    pub rx_max_sdu_size: u32,
    /// Size of every read buffer handed to the link.
    pub max_rx_packet_size: usize,
    /// Link-layer header bytes inside the negotiated data size.
    pub link_header_len: usize,
    /// Bound on queued outbound work items.
    pub tx_queue_limit: usize,
    /// Bound on queued inbound work items.
    pub rx_queue_limit: usize,
    /// Send a dataless credit PDU once the peer holds this much credit or less.
    pub low_remote_credit: u32,
    /// Send a dataless credit PDU once more than this much credit is unadvertised.
    pub surplus_credit: u32,
    /// Discovery hint bits that identify a usable peer.
    pub service_hints: u16,
    /// IAS class queried after discovery.
    pub class_name: String,
    /// IAS attribute holding the peer's LSAP selector.
    pub attr_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_credit: 7,
            send_credit_ceiling: DEFAULT_SEND_CREDIT_CEILING,
            rx_max_sdu_size: 0,
            max_rx_packet_size: 2048,
            link_header_len: 2,
            tx_queue_limit: DEFAULT_QUEUE_LIMIT,
            rx_queue_limit: DEFAULT_QUEUE_LIMIT,
            low_remote_credit: DEFAULT_LOW_REMOTE_CREDIT,
            surplus_credit: DEFAULT_SURPLUS_CREDIT,
            service_hints: HINT_IRCOMM,
            class_name: "IrDA:IrCOMM".to_string(),
            attr_name: "IrDA:TinyTP:LsapSel".to_string(),
        }
    }
}

impl Config {
    /// Check every field for a usable value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_credit > u32::from(MAX_CREDIT) {
            return Err(ConfigError::InitialCredit(self.initial_credit));
        }
        if self.send_credit_ceiling == 0 {
            return Err(ConfigError::SendCreditCeiling);
        }
        if self.tx_queue_limit == 0 {
            return Err(ConfigError::QueueLimit("transmit"));
        }
        if self.rx_queue_limit == 0 {
            return Err(ConfigError::QueueLimit("receive"));
        }
        if self.max_rx_packet_size < 2 {
            return Err(ConfigError::ReadBuffer(self.max_rx_packet_size));
        }
        if self.class_name.is_empty() {
            return Err(ConfigError::EmptyName("class name"));
        }
        if self.attr_name.is_empty() {
            return Err(ConfigError::EmptyName("attribute name"));
        }
        Ok(())
    }
}
