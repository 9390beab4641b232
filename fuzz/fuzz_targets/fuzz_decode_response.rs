#![no_main]

use libfuzzer_sys::fuzz_target;
use smartport_relay::{
    CloseResponse, Command, InitResponse, ReadBlockResponse, Response, StatusResponse,
    WriteBlockResponse,
};

fuzz_target!(|data: &[u8]| {
    // Every decoder must reject bad input with an error, never panic
    let _ = InitResponse::decode(data);
    let _ = CloseResponse::decode(data);
    let _ = WriteBlockResponse::decode(data);
    let _ = ReadBlockResponse::decode(data);

    if let Ok(status) = StatusResponse::decode(data) {
        let _ = status.is_online_disk();
        let _ = status.device_info();
    }

    // Device side of the link
    if let Ok(command) = Command::decode(data) {
        // Re-encoding a decoded request must reproduce its prefix
        let encoded = command.encode();
        assert_eq!(&data[..encoded.len()], &encoded[..]);
    }
});
