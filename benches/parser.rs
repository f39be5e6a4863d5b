use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pisk::parser::h1::ResponseParser;
use pisk::parser::ResponseSink;

const RES: &[u8] = b"\
HTTP/1.1 200 OK\r\n\
Content-Length: 2\r\n\r\nok";

const RES_MED: &[u8] = b"\
HTTP/1.1 200 OK\r\n\
Date: Tue, 24 Jan 2023 14:00:00 GMT\r\n\
Server: nginx/1.22.1\r\n\
Content-Type: text/html; charset=utf-8\r\n\
Content-Length: 13\r\n\
Cache-Control: no-cache\r\n\
Connection: keep-alive\r\n\r\n\
Hello, World!";

const RES_CHUNKED: &[u8] = b"\
HTTP/1.1 200 OK\r\n\
Date: Tue, 24 Jan 2023 14:00:00 GMT\r\n\
Server: nginx/1.22.1\r\n\
Content-Type: application/json\r\n\
Transfer-Encoding: chunked\r\n\r\n\
1a\r\n{\"status\":\"ok\",\"items\":[]}\r\n\
4\r\nnull\r\n\
0\r\n\r\n";

struct NullSink;

impl ResponseSink for NullSink {
    fn on_header_field(&mut self, _data: &[u8]) {}
    fn on_header_value(&mut self, _data: &[u8]) {}
    fn on_body(&mut self, _data: &[u8]) {}
    fn on_message_complete(&mut self, _status: u16, _keep_alive: bool) {}
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_response");

    for (name, input) in [("small", RES), ("medium", RES_MED), ("chunked", RES_CHUNKED)] {
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), input, |b, input| {
            b.iter(|| {
                let mut parser = ResponseParser::new();
                let mut sink = NullSink;
                parser.advance(input, &mut sink).unwrap();
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_parse);
criterion_main!(benches);
