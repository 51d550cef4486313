#![no_main]
#[macro_use] extern crate libfuzzer_sys;
extern crate xbdm_dyndxt_loader;

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = xbdm_dyndxt_loader::pe::parse_portable_executable(data, "fuzz");
});
