#![no_main]

use libfuzzer_sys::fuzz_target;
use pisk::parser::h1::ResponseParser;
use pisk::parser::ResponseSink;

struct NullSink;

impl ResponseSink for NullSink {
    fn on_header_field(&mut self, _data: &[u8]) {}
    fn on_header_value(&mut self, _data: &[u8]) {}
    fn on_body(&mut self, _data: &[u8]) {}
    fn on_message_complete(&mut self, _status: u16, _keep_alive: bool) {}
}

fuzz_target!(|data: &[u8]| {
    let mut parser = ResponseParser::new();
    let mut sink = NullSink;
    let _ = parser.advance(data, &mut sink);
});
