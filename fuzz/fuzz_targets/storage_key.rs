//! Fuzz target for durable buffer naming
//!
//! Keys derived from peer-supplied names must stay inside the buffer
//! directory.

#![no_main]

use flightline_files::buffer::storage_key;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|name: String| {
    let key = storage_key(&name);
    assert!(!key.is_empty());
    assert!(!key.contains('/'));
    assert!(!key.contains('\\'));
    assert!(key != "." && key != "..");
});
