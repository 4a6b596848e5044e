//! Event decoding for watched contract kinds.
//!
//! Each watched address carries an [`AbiKind`] that selects the set of event
//! signatures we can decode for it. Decoding is generic over the parsed ABI
//! declarations, so logs come back as an ordered name -> value map rather
//! than per-event structs. A log whose topic0 matches none of the kind's
//! signatures is routine and decodes to `None`, never an error.

use alloy::dyn_abi::{DynSolValue, EventExt};
use alloy::json_abi::Event;
use alloy::primitives::B256;
use serde_json::{Map, Value};
use std::sync::OnceLock;

use crate::error::{Result, SentryError};

const TIMELOCK_EVENTS: &[&str] = &[
    "event CallScheduled(bytes32 indexed id, uint256 indexed index, address target, uint256 value, bytes data, bytes32 predecessor, uint256 delay)",
    "event CallExecuted(bytes32 indexed id, uint256 indexed index, address target, uint256 value, bytes data)",
    "event Cancelled(bytes32 indexed id)",
];

const SAFE_EVENTS: &[&str] = &[
    "event ExecutionSuccess(bytes32 indexed txHash, uint256 payment)",
    "event ExecutionFailure(bytes32 indexed txHash, uint256 payment)",
    "event ApproveHash(bytes32 indexed approvedHash, address indexed owner)",
];

const GOVERNOR_EVENTS: &[&str] = &[
    "event ProposalCreated(uint256 proposalId, address proposer, address[] targets, uint256[] values, string[] signatures, bytes[] calldatas, uint256 startBlock, uint256 endBlock, string description)",
    "event ProposalExecuted(uint256 indexed proposalId)",
    "event ProposalCanceled(uint256 indexed proposalId)",
];

/// Classification of a watched contract's event interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbiKind {
    Timelock,
    Safe,
    Governor,
}

impl AbiKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AbiKind::Timelock => "timelock",
            AbiKind::Safe => "safe",
            AbiKind::Governor => "governor",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "timelock" => Some(Self::Timelock),
            "safe" => Some(Self::Safe),
            "governor" => Some(Self::Governor),
            _ => None,
        }
    }

    /// Human-readable declarations of the decodable events for this kind,
    /// in decode-priority order.
    pub fn event_signatures(self) -> &'static [&'static str] {
        match self {
            AbiKind::Timelock => TIMELOCK_EVENTS,
            AbiKind::Safe => SAFE_EVENTS,
            AbiKind::Governor => GOVERNOR_EVENTS,
        }
    }

    /// Parsed signature set for this kind. Parsed once per process.
    pub fn event_set(self) -> &'static EventSet {
        static TIMELOCK: OnceLock<EventSet> = OnceLock::new();
        static SAFE: OnceLock<EventSet> = OnceLock::new();
        static GOVERNOR: OnceLock<EventSet> = OnceLock::new();
        let cell = match self {
            AbiKind::Timelock => &TIMELOCK,
            AbiKind::Safe => &SAFE,
            AbiKind::Governor => &GOVERNOR,
        };
        cell.get_or_init(|| EventSet::parse(self.event_signatures()))
    }
}

impl serde::Serialize for AbiKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for AbiKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        AbiKind::from_db(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown abi kind `{raw}`")))
    }
}

/// A successfully decoded log: event name plus an ordered argument map.
///
/// Integers of 64 bits or wider are rendered as decimal strings so the JSON
/// persisted form never loses precision; narrower integers stay numeric.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub name: String,
    pub args: Map<String, Value>,
}

/// The decodable signatures for one [`AbiKind`], keyed by topic0.
pub struct EventSet {
    events: Vec<Event>,
}

impl EventSet {
    fn parse(signatures: &[&str]) -> Self {
        let events = signatures
            .iter()
            .map(|sig| {
                Event::parse(sig).unwrap_or_else(|e| panic!("invalid builtin event `{sig}`: {e}"))
            })
            .collect();
        Self { events }
    }

    /// Attempt to decode a raw log against this signature set.
    ///
    /// `Ok(None)` means the topic0 matched nothing we know, which callers
    /// must treat as routine. An `Err` means a matched signature failed to
    /// decode, which is worth a (debug) log line but not an abort.
    pub fn decode(&self, topics: &[B256], data: &[u8]) -> Result<Option<DecodedEvent>> {
        let Some(topic0) = topics.first() else {
            return Ok(None);
        };
        let Some(event) = self.events.iter().find(|e| e.selector() == *topic0) else {
            return Ok(None);
        };

        let decoded = event
            .decode_log_parts(topics.iter().copied(), data, true)
            .map_err(|e| SentryError::Decode(format!("{}: {e}", event.name)))?;

        let mut indexed = decoded.indexed.into_iter();
        let mut body = decoded.body.into_iter();
        let mut args = Map::with_capacity(event.inputs.len());
        for (position, input) in event.inputs.iter().enumerate() {
            let value = if input.indexed {
                indexed.next()
            } else {
                body.next()
            };
            let Some(value) = value else {
                return Err(SentryError::Decode(format!(
                    "{}: missing decoded value for parameter {position}",
                    event.name
                )));
            };
            let key = if input.name.is_empty() {
                format!("arg{position}")
            } else {
                input.name.clone()
            };
            args.insert(key, sol_value_to_json(&value));
        }

        Ok(Some(DecodedEvent {
            name: event.name.clone(),
            args,
        }))
    }
}

fn sol_value_to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::Uint(v, bits) => {
            if *bits < 64 {
                u64::try_from(*v)
                    .map(Value::from)
                    .unwrap_or_else(|_| Value::String(v.to_string()))
            } else {
                Value::String(v.to_string())
            }
        }
        DynSolValue::Int(v, bits) => {
            if *bits < 64 {
                i64::try_from(*v)
                    .map(Value::from)
                    .unwrap_or_else(|_| Value::String(v.to_string()))
            } else {
                Value::String(v.to_string())
            }
        }
        DynSolValue::Address(a) => Value::String(a.to_string()),
        DynSolValue::FixedBytes(word, size) => {
            Value::String(format!("0x{}", alloy::hex::encode(&word[..*size])))
        }
        DynSolValue::Bytes(bytes) => Value::String(format!("0x{}", alloy::hex::encode(bytes))),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            Value::Array(items.iter().map(sol_value_to_json).collect())
        }
        other => Value::String(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, Bytes, B256, U256};
    use alloy::sol_types::SolEvent;
    use proptest::prelude::*;

    alloy::sol! {
        event CallScheduled(bytes32 indexed id, uint256 indexed index, address target, uint256 value, bytes data, bytes32 predecessor, uint256 delay);
        event ExecutionSuccess(bytes32 indexed txHash, uint256 payment);
        event ProposalExecuted(uint256 indexed proposalId);
    }

    fn scheduled_log(delay: u64) -> alloy::primitives::LogData {
        CallScheduled {
            id: B256::repeat_byte(0x11),
            index: U256::ZERO,
            target: Address::repeat_byte(0x22),
            value: U256::ZERO,
            data: Bytes::from(vec![0xde, 0xad]),
            predecessor: B256::ZERO,
            delay: U256::from(delay),
        }
        .encode_log_data()
    }

    #[test]
    fn test_decodes_call_scheduled_with_named_args() {
        let log = scheduled_log(3_600);
        let decoded = AbiKind::Timelock
            .event_set()
            .decode(log.topics(), &log.data)
            .expect("decode")
            .expect("matched");

        assert_eq!(decoded.name, "CallScheduled");
        assert_eq!(decoded.args["delay"], Value::String("3600".into()));
        assert_eq!(
            decoded.args["target"],
            Value::String(Address::repeat_byte(0x22).to_string())
        );
        assert_eq!(decoded.args["data"], Value::String("0xdead".into()));
        // Declaration order is preserved.
        let keys: Vec<&str> = decoded.args.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            ["id", "index", "target", "value", "data", "predecessor", "delay"]
        );
    }

    #[test]
    fn test_decodes_safe_execution_success() {
        let log = ExecutionSuccess {
            txHash: B256::repeat_byte(0x33),
            payment: U256::from(5u64),
        }
        .encode_log_data();
        let decoded = AbiKind::Safe
            .event_set()
            .decode(log.topics(), &log.data)
            .expect("decode")
            .expect("matched");
        assert_eq!(decoded.name, "ExecutionSuccess");
        assert_eq!(decoded.args["payment"], Value::String("5".into()));
    }

    #[test]
    fn test_governor_events_do_not_match_timelock_set() {
        let log = ProposalExecuted {
            proposalId: U256::from(7u64),
        }
        .encode_log_data();
        let timelock = AbiKind::Timelock
            .event_set()
            .decode(log.topics(), &log.data)
            .expect("decode");
        assert!(timelock.is_none());
        let governor = AbiKind::Governor
            .event_set()
            .decode(log.topics(), &log.data)
            .expect("decode")
            .expect("matched");
        assert_eq!(governor.name, "ProposalExecuted");
        assert_eq!(governor.args["proposalId"], Value::String("7".into()));
    }

    #[test]
    fn test_unknown_topic0_is_no_match_not_error() {
        let topics = [B256::repeat_byte(0xab)];
        for kind in [AbiKind::Timelock, AbiKind::Safe, AbiKind::Governor] {
            let decoded = kind.event_set().decode(&topics, &[]).expect("decode");
            assert!(decoded.is_none());
        }
    }

    #[test]
    fn test_empty_topics_is_no_match() {
        let decoded = AbiKind::Safe.event_set().decode(&[], &[]).expect("decode");
        assert!(decoded.is_none());
    }

    #[test]
    fn test_abi_kind_round_trips_through_db_strings() {
        for kind in [AbiKind::Timelock, AbiKind::Safe, AbiKind::Governor] {
            assert_eq!(AbiKind::from_db(kind.as_str()), Some(kind));
        }
        assert_eq!(AbiKind::from_db("multisig"), None);
    }

    proptest! {
        // Wide integers must survive the JSON round trip as exact decimal
        // strings, regardless of magnitude.
        #[test]
        fn test_delay_persists_as_exact_decimal_string(delay in any::<u64>()) {
            let log = scheduled_log(delay);
            let decoded = AbiKind::Timelock
                .event_set()
                .decode(log.topics(), &log.data)
                .unwrap()
                .unwrap();
            prop_assert_eq!(&decoded.args["delay"], &Value::String(delay.to_string()));
        }
    }
}
