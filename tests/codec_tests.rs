//! Wire-format tests for the SmartPort command codec and SLIP framing.

use smartport_relay::constants::{
    BLOCK_SIZE, SP_CMD_CLOSE, SP_CMD_INIT, SP_CMD_READ_BLOCK, SP_CMD_STATUS, SP_CMD_WRITE_BLOCK,
};
use smartport_relay::smartport::frame::empty_block;
use smartport_relay::smartport::slip::{slip_encode, SlipDecoder, SLIP_END, SLIP_ESC};
use smartport_relay::{
    BlockNumber, CloseRequest, Command, DeviceInfo, InitRequest, ReadBlockRequest,
    ReadBlockResponse, RelayError, Request, Response, StatusRequest, StatusResponse,
    WriteBlockRequest, WriteBlockResponse,
};

/// Tests the exact byte layout of a WriteBlock request.
#[test]
fn test_write_block_layout() {
    let request = WriteBlockRequest::new(7, 5, BlockNumber::from_bytes(0x01, 0x02, 0x03), empty_block());
    let frame = request.encode();

    assert_eq!(frame.len(), 3 + 2 + 3 + BLOCK_SIZE);
    assert_eq!(&frame[..5], &[7, SP_CMD_WRITE_BLOCK, 5, 0x00, 0x02]);
    assert_eq!(&frame[5..8], &[0x01, 0x02, 0x03]);
    assert!(frame[8..].iter().all(|&b| b == 0));
}

/// Tests decoding a successful ReadBlock response.
#[test]
fn test_read_block_response_decode() {
    let data: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
    let mut frame = vec![7, 0];
    frame.extend_from_slice(&data);

    let request = ReadBlockRequest::new(7, 1, BlockNumber::new(0).unwrap());
    let response = request.decode_response(&frame).unwrap();
    assert_eq!(response.sequence_number, 7);
    assert!(response.is_ok());
    assert_eq!(&response.block_data[..], &data[..]);
}

/// Tests that a short ReadBlock response is rejected.
#[test]
fn test_read_block_response_too_short() {
    let frame = vec![7, 0, 0xAA, 0xBB];
    assert!(matches!(
        ReadBlockResponse::decode(&frame),
        Err(RelayError::MalformedFrame(_))
    ));
}

/// Tests that every response needs at least a header.
#[test]
fn test_responses_need_header() {
    assert!(StatusResponse::decode(&[1]).is_err());
    assert!(WriteBlockResponse::decode(&[]).is_err());
}

/// Tests that a nonzero status still decodes.
#[test]
fn test_device_failure_is_not_an_error() {
    let response = WriteBlockResponse::decode(&[3, 0x2B]).unwrap();
    assert!(!response.is_ok());
    assert_eq!(response.status, 0x2B);
}

/// Tests command codes on the wire.
#[test]
fn test_command_codes() {
    let block = BlockNumber::default();
    assert_eq!(StatusRequest::new(1, 1, 0).encode()[1], SP_CMD_STATUS);
    assert_eq!(ReadBlockRequest::new(1, 1, block).encode()[1], SP_CMD_READ_BLOCK);
    assert_eq!(InitRequest::new(1, 1).encode()[1], SP_CMD_INIT);
    assert_eq!(CloseRequest::new(1, 1).encode()[1], SP_CMD_CLOSE);
}

/// Tests the 24-bit block number bounds.
#[test]
fn test_block_number_bounds() {
    assert_eq!(BlockNumber::new(0x00FF_FFFF).unwrap().to_bytes(), [0xFF, 0xFF, 0xFF]);
    assert!(matches!(
        BlockNumber::new(0x0100_0000),
        Err(RelayError::InvalidBlockNumber(0x0100_0000))
    ));
    assert_eq!(BlockNumber::from_bytes(0x34, 0x12, 0x00).value(), 0x1234);
}

/// Tests that a DIB round trips through a Status response.
#[test]
fn test_status_response_carries_dib() {
    let info = DeviceInfo::disk("ProDOS Vol", 65535);
    let frame = StatusResponse::new(2, 0, info.encode()).encode();

    let response = StatusResponse::decode(&frame).unwrap();
    assert!(response.is_online_disk());
    assert_eq!(response.device_info().unwrap(), info);
}

/// Tests that SLIP escapes both special bytes and frames with END.
#[test]
fn test_slip_escapes_special_bytes() {
    let encoded = slip_encode(&[0x01, SLIP_END, SLIP_ESC, 0x02]);
    assert_eq!(
        &encoded[..],
        &[SLIP_END, 0x01, SLIP_ESC, 0xDC, SLIP_ESC, 0xDD, 0x02, SLIP_END]
    );

    let mut decoder = SlipDecoder::new();
    let frames = decoder.feed(&encoded);
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0].as_ref().unwrap()[..], &[0x01, SLIP_END, SLIP_ESC, 0x02]);
}

/// Tests that a frame split across reads is reassembled.
#[test]
fn test_slip_partial_reads() {
    let request = ReadBlockRequest::new(9, 2, BlockNumber::new(0xC0DB).unwrap()).encode();
    let encoded = slip_encode(&request);

    let mut decoder = SlipDecoder::new();
    let mut frames = Vec::new();
    for byte in encoded.iter() {
        frames.extend(decoder.feed(std::slice::from_ref(byte)));
    }
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0].as_ref().unwrap()[..], &request[..]);
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn block_number() -> impl Strategy<Value = BlockNumber> {
        (0u32..=0x00FF_FFFF).prop_map(|n| BlockNumber::new(n).unwrap())
    }

    fn command() -> impl Strategy<Value = Command> {
        let ids = (any::<u8>(), any::<u8>());
        prop_oneof![
            (ids.clone(), any::<u8>())
                .prop_map(|((seq, dev), code)| Command::Status(StatusRequest::new(seq, dev, code))),
            (ids.clone(), block_number())
                .prop_map(|((seq, dev), block)| Command::ReadBlock(ReadBlockRequest::new(seq, dev, block))),
            (ids.clone(), block_number(), proptest::collection::vec(any::<u8>(), BLOCK_SIZE)).prop_map(
                |((seq, dev), block, data)| {
                    Command::WriteBlock(WriteBlockRequest::from_slice(seq, dev, block, &data).unwrap())
                }
            ),
            ids.clone().prop_map(|(seq, dev)| Command::Init(InitRequest::new(seq, dev))),
            ids.prop_map(|(seq, dev)| Command::Close(CloseRequest::new(seq, dev))),
        ]
    }

    proptest! {
        #[test]
        fn prop_request_round_trip(command in command()) {
            let decoded = Command::decode(&command.encode()).unwrap();
            prop_assert_eq!(decoded, command);
        }

        #[test]
        fn prop_slip_round_trip(frame in proptest::collection::vec(any::<u8>(), 1..600)) {
            let mut decoder = SlipDecoder::new();
            let frames = decoder.feed(&slip_encode(&frame));
            prop_assert_eq!(frames.len(), 1);
            prop_assert_eq!(&frames[0].as_ref().unwrap()[..], &frame[..]);
        }
    }
}
