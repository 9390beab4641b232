#![no_main]

use libfuzzer_sys::fuzz_target;
use smartport_relay::smartport::slip::{slip_encode, SlipDecoder, MAX_FRAME_SIZE};

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes, fed in uneven chunks
    let mut decoder = SlipDecoder::new();
    for chunk in data.chunks(7) {
        for frame in decoder.feed(chunk).into_iter().flatten() {
            assert!(!frame.is_empty());
            assert!(frame.len() <= MAX_FRAME_SIZE);
        }
    }

    // Anything encoded must come back unchanged
    if !data.is_empty() && data.len() <= MAX_FRAME_SIZE {
        let mut decoder = SlipDecoder::new();
        let frames = decoder.feed(&slip_encode(data));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().map(|f| &f[..]).ok(), Some(data));
    }
});
