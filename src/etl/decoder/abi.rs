//! ABI helpers on top of `ethabi`: event definitions, log parsing and the
//! `supportsInterface` call.

use ethabi::{Event, EventParam, Log, LogParam, ParamType, Token};

use crate::etl::event::{Address, RawLog, U256};

/// Declares a non-anonymous event from `(name, type, indexed)` inputs.
pub fn event(name: &str, inputs: &[(&str, ParamType, bool)]) -> Event {
    Event {
        name: name.to_string(),
        inputs: inputs
            .iter()
            .map(|(name, kind, indexed)| EventParam {
                name: (*name).to_string(),
                kind: kind.clone(),
                indexed: *indexed,
            })
            .collect(),
        anonymous: false,
    }
}

pub fn uint256_array() -> ParamType {
    ParamType::Array(Box::new(ParamType::Uint(256)))
}

/// Parses `log` against `event`.
///
/// Fails when topic 0 is not the event's signature, when the topic count does
/// not match the indexed inputs, or when the data does not decode.
pub fn parse_log(event: &Event, log: &RawLog) -> Result<Log, ethabi::Error> {
    event.parse_log(ethabi::RawLog {
        topics: log.topics.clone(),
        data: log.data.clone(),
    })
}

fn param<'a>(log: &'a Log, name: &str) -> Option<&'a LogParam> {
    log.params.iter().find(|param| param.name == name)
}

pub fn address(log: &Log, name: &str) -> Option<Address> {
    param(log, name)?.value.clone().into_address()
}

pub fn uint(log: &Log, name: &str) -> Option<U256> {
    param(log, name)?.value.clone().into_uint()
}

pub fn uint_array(log: &Log, name: &str) -> Option<Vec<U256>> {
    param(log, name)?
        .value
        .clone()
        .into_array()?
        .into_iter()
        .map(Token::into_uint)
        .collect()
}

/// Calldata for `supportsInterface(bytes4)`.
pub fn supports_interface_calldata(interface_id: [u8; 4]) -> Vec<u8> {
    let mut calldata = ethabi::short_signature("supportsInterface", &[ParamType::FixedBytes(4)]).to_vec();
    calldata.extend(ethabi::encode(&[Token::FixedBytes(interface_id.to_vec())]));
    calldata
}

/// Return data of a function returning a single `bool`.
pub fn decode_bool(output: &[u8]) -> Result<bool, ethabi::Error> {
    match ethabi::decode(&[ParamType::Bool], output)?.pop() {
        Some(Token::Bool(value)) => Ok(value),
        _ => Err(ethabi::Error::InvalidData),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::event::{H256, TRANSFER_SINGLE_SIGNATURE};

    fn transfer_single() -> Event {
        event(
            "TransferSingle",
            &[
                ("operator", ParamType::Address, true),
                ("from", ParamType::Address, true),
                ("to", ParamType::Address, true),
                ("id", ParamType::Uint(256), false),
                ("value", ParamType::Uint(256), false),
            ],
        )
    }

    fn address_topic(byte: u8) -> H256 {
        H256::from(Address::repeat_byte(byte))
    }

    fn log(topics: Vec<H256>, data: Vec<u8>) -> RawLog {
        RawLog {
            address: Address::repeat_byte(0xbb),
            topics,
            data,
            block_number: 1,
            transaction_hash: H256::zero(),
            log_index: 0,
        }
    }

    #[test]
    fn test_event_signature() {
        assert_eq!(transfer_single().signature(), TRANSFER_SINGLE_SIGNATURE);
    }

    #[test]
    fn test_parse_log_params() {
        let data = ethabi::encode(&[Token::Uint(U256::from(7)), Token::Uint(U256::from(25))]);
        let raw = log(
            vec![TRANSFER_SINGLE_SIGNATURE, address_topic(0x0f), address_topic(0x01), address_topic(0x02)],
            data,
        );

        let parsed = parse_log(&transfer_single(), &raw).unwrap();
        assert_eq!(address(&parsed, "operator"), Some(Address::repeat_byte(0x0f)));
        assert_eq!(address(&parsed, "to"), Some(Address::repeat_byte(0x02)));
        assert_eq!(uint(&parsed, "id"), Some(U256::from(7)));
        assert_eq!(uint(&parsed, "value"), Some(U256::from(25)));
        // Wrong type or unknown name.
        assert_eq!(uint(&parsed, "from"), None);
        assert_eq!(address(&parsed, "missing"), None);
    }

    #[test]
    fn test_parse_log_rejects_shape_mismatch() {
        let data = ethabi::encode(&[Token::Uint(U256::from(7)), Token::Uint(U256::from(25))]);

        let missing_topic = log(vec![TRANSFER_SINGLE_SIGNATURE, address_topic(0x0f), address_topic(0x01)], data.clone());
        assert!(parse_log(&transfer_single(), &missing_topic).is_err());

        let wrong_signature = log(
            vec![H256::zero(), address_topic(0x0f), address_topic(0x01), address_topic(0x02)],
            data.clone(),
        );
        assert!(parse_log(&transfer_single(), &wrong_signature).is_err());

        let short_data = log(
            vec![TRANSFER_SINGLE_SIGNATURE, address_topic(0x0f), address_topic(0x01), address_topic(0x02)],
            data[..32].to_vec(),
        );
        assert!(parse_log(&transfer_single(), &short_data).is_err());
    }

    #[test]
    fn test_uint_array() {
        let batch = event(
            "Amounts",
            &[("ids", uint256_array(), false), ("values", uint256_array(), false)],
        );
        let data = ethabi::encode(&[
            Token::Array(vec![Token::Uint(U256::from(1)), Token::Uint(U256::from(2))]),
            Token::Array(vec![Token::Uint(U256::from(10)), Token::Uint(U256::from(20))]),
        ]);

        let parsed = parse_log(&batch, &log(vec![batch.signature()], data)).unwrap();
        assert_eq!(uint_array(&parsed, "ids"), Some(vec![U256::from(1), U256::from(2)]));
        assert_eq!(uint_array(&parsed, "values"), Some(vec![U256::from(10), U256::from(20)]));
    }

    #[test]
    fn test_supports_interface_calldata() {
        let data = supports_interface_calldata([0x80, 0xac, 0x58, 0xcd]);
        assert_eq!(data.len(), 36);
        assert_eq!(hex::encode(&data[..8]), "01ffc9a780ac58cd");
        assert!(data[8..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_decode_bool() {
        assert!(decode_bool(&ethabi::encode(&[Token::Bool(true)])).unwrap());
        assert!(!decode_bool(&ethabi::encode(&[Token::Bool(false)])).unwrap());
        assert!(decode_bool(&[1]).is_err());
    }
}
