#![no_main]
use binquery::store::script::Script;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() > 8192 { return; }
    if let Ok(s) = std::str::from_utf8(data) {
        // Parsing and evaluating arbitrary text must not panic
        if let Ok(script) = Script::parse(s) {
            let bins = bson::doc! {"age": 28, "name": "blue", "score": 1.5};
            let _ = script.selects(&bins);
        }
    }
});
