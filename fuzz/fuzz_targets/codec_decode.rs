#![no_main]

use libfuzzer_sys::fuzz_target;
use fedlink_codec::object::decode_object_cbor;

fuzz_target!(|data: &[u8]| {
    if let Ok(object) = decode_object_cbor(data) {
        let _ = object.validate();
    }
});
