#![no_main]

use std::collections::HashMap;

use bytes::Bytes;
use fedlink_codec::inflate_message;
use fedlink_core::hash::object_id_of;
use libfuzzer_sys::fuzz_target;

// Input is split into objects on 0xFF separators; the first one is the root.
fuzz_target!(|data: &[u8]| {
    let mut contents = HashMap::new();
    let mut root = None;
    for part in data.split(|b| *b == 0xFF) {
        let id = object_id_of(part);
        root.get_or_insert(id);
        contents.insert(id, Bytes::copy_from_slice(part));
    }
    if let Some(root) = root {
        let _ = inflate_message(root, &contents);
    }
});
