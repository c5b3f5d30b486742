//! Inbox message and sequencer batch carriers.
//!
//! The validator treats message payloads as opaque: they are handed to the
//! recorder and the replay machine untouched. Only the metadata the pipeline
//! itself steers by (delayed-message counts, batch numbers) is interpreted.

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

/// Header of a message delivered through the L1 inbox.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct L1IncomingMessageHeader {
    /// Message kind discriminant.
    pub kind: u8,
    /// Address that posted the message on L1.
    pub poster: Address,
    /// L1 block number the message was posted in.
    pub block_number: u64,
    /// L1 timestamp of the posting block.
    pub timestamp: u64,
    /// Request id, present for delayed messages.
    pub request_id: Option<B256>,
    /// L1 base fee observed at posting time.
    pub base_fee_l1: U256,
}

/// A single message as delivered by the L1 inbox.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct L1IncomingMessage {
    /// The message header.
    pub header: L1IncomingMessageHeader,
    /// Opaque L2 payload.
    pub l2_msg: Bytes,
}

/// An inbox message together with the delayed-message cursor after it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageWithMetadata {
    /// The sequenced message.
    pub message: L1IncomingMessage,
    /// Total delayed messages read after processing this message.
    pub delayed_messages_read: u64,
}

/// A sequencer batch the replay machine may need to read.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInfo {
    /// The batch sequence number.
    pub number: u64,
    /// Raw sequencer message bytes.
    pub data: Bytes,
}
