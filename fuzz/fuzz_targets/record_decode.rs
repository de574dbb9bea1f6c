//! Fuzz harness for the record size check and `decode`.
//!
//! Feeds arbitrary bytes through the same path the receiver uses: the first
//! four bytes are the size prefix, the rest is the record body. Neither step
//! may panic, and a decoded record must stage to a header block with one
//! line per registered header.

#![no_main]
use libfuzzer_sys::fuzz_target;
use telemd_core::record::{HeaderRegistry, RecordLimits, decode};

fuzz_target!(|data: &[u8]| {
    let registry = HeaderRegistry::new(["Machine-ID", "App"], "Machine-ID").unwrap();
    let limits = RecordLimits::for_registry(&registry, 256);

    if let Some((prefix, body)) = data.split_first_chunk::<4>() {
        let _ = limits.check_record_size(u32::from_ne_bytes(*prefix));
        if let Ok(mut record) = decode(body, &registry) {
            record.headers.rewrite_identity("0123456789abcdef0123456789abcdef");
            assert_eq!(record.headers.len(), registry.len());
            assert_eq!(
                record.headers.identity().line(),
                b"Machine-ID: 0123456789abcdef0123456789abcdef"
            );
        }
    }

    let default_registry = HeaderRegistry::default();
    let _ = decode(data, &default_registry);
});
