//! Benchmarks for the descriptor codec
//!
//! Measures decoding cost of:
//! - Device descriptors
//! - Configuration descriptors of growing size
//! - Control setup packets

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use protocol::{
    ConfigDescriptor, ControlPayload, ControlSetup, DeviceDescriptor, EndpointDescriptor,
    Interface, InterfaceDescriptor, encode_control_transfer, parse_descriptor,
};

fn make_config(interfaces: u8) -> Vec<u8> {
    let config = ConfigDescriptor {
        length: 9,
        descriptor_type: 2,
        total_length: 0,
        num_interfaces: interfaces,
        configuration_value: 1,
        configuration_index: 0,
        attributes: 0x80,
        max_power: 50,
        extra: Vec::new(),
        interfaces: (0..interfaces)
            .map(|n| Interface {
                alt_settings: vec![InterfaceDescriptor {
                    length: 9,
                    descriptor_type: 4,
                    interface_number: n,
                    alternate_setting: 0,
                    num_endpoints: 2,
                    interface_class: 0xff,
                    interface_sub_class: 0,
                    interface_protocol: 0,
                    interface_index: 0,
                    extra: Vec::new(),
                    endpoints: vec![
                        EndpointDescriptor {
                            length: 7,
                            descriptor_type: 5,
                            endpoint_address: 0x81 + (n % 14),
                            attributes: 0x02,
                            max_packet_size: 512,
                            interval: 0,
                            refresh: None,
                            synch_address: None,
                            extra: Vec::new(),
                        },
                        EndpointDescriptor {
                            length: 7,
                            descriptor_type: 5,
                            endpoint_address: 0x01 + (n % 14),
                            attributes: 0x02,
                            max_packet_size: 512,
                            interval: 0,
                            refresh: None,
                            synch_address: None,
                            extra: Vec::new(),
                        },
                    ],
                }],
            })
            .collect(),
    };
    config.to_bytes()
}

fn benchmark_device_descriptor(c: &mut Criterion) {
    let mut group = c.benchmark_group("device_descriptor");

    let raw = [
        0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01, 0x01,
        0x02, 0x03, 0x01,
    ];

    group.throughput(Throughput::Bytes(raw.len() as u64));
    group.bench_function("parse", |b| {
        b.iter(|| DeviceDescriptor::parse(black_box(&raw)))
    });
    group.bench_function("parse_any", |b| {
        b.iter(|| parse_descriptor(black_box(&raw)))
    });

    group.finish();
}

fn benchmark_config_descriptor(c: &mut Criterion) {
    let mut group = c.benchmark_group("config_descriptor");

    for interfaces in [1u8, 4, 16].iter() {
        let raw = make_config(*interfaces);
        group.throughput(Throughput::Bytes(raw.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(interfaces),
            &raw,
            |b, raw| b.iter(|| ConfigDescriptor::parse(black_box(raw))),
        );
    }

    group.finish();
}

fn benchmark_setup_packet(c: &mut Criterion) {
    let mut group = c.benchmark_group("setup_packet");

    group.throughput(Throughput::Bytes(8));
    group.bench_function("encode_get_descriptor", |b| {
        b.iter(|| {
            encode_control_transfer(
                black_box(0x80),
                0x06,
                0x0100,
                0,
                ControlPayload::Length(18),
            )
        })
    });

    let setup = ControlSetup::get_descriptor(1, 0, 0, 18).encode();
    group.bench_function("decode", |b| {
        b.iter(|| ControlSetup::decode(black_box(&setup)))
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_device_descriptor,
    benchmark_config_descriptor,
    benchmark_setup_packet
);
criterion_main!(benches);
