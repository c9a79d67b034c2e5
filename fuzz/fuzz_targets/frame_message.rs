#![no_main]

use beatmaker_midi::packet::frame_message;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for packet in frame_message(data) {
        assert!(packet.cable == 0);
        assert!(packet.message_bytes().len() <= 3);
    }
});
