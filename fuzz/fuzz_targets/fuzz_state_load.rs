#![no_main]

use libfuzzer_sys::fuzz_target;
use tg_persist::{STATE_VERSION, parse_state};

fuzz_target!(|data: &[u8]| {
    let Ok(state) = parse_state(data) else {
        return;
    };
    assert_eq!(state.version, STATE_VERSION);

    // Whatever parsed must survive its own round trip.
    let Ok(encoded) = serde_json::to_vec(&state) else {
        return;
    };
    if let Ok(reparsed) = parse_state(&encoded) {
        assert_eq!(reparsed.field_id, state.field_id);
        assert_eq!(reparsed.saved_at_ms, state.saved_at_ms);
    }
});
