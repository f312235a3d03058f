use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ntp_core::ident::RefId;
use ntp_core::packet::{AuthTrailer, LeapIndicator, Mode, NtpHeader, NtpPacket};
use ntp_core::timestamp::{NtpShort, NtpTimestamp, Seconds};

fn sample_packet() -> NtpPacket {
    NtpPacket {
        header: NtpHeader {
            leap: LeapIndicator::NoWarning,
            version: 4,
            mode: Mode::Client,
            stratum: 2,
            poll: 6,
            precision: -20,
            root_delay: NtpShort::from_seconds(Seconds(0.01)),
            root_dispersion: NtpShort::from_seconds(Seconds(0.001)),
            ref_id: RefId(0x7f00_0001),
            reference_timestamp: NtpTimestamp::new(3_900_000_000, 0),
            originate_timestamp: NtpTimestamp::new(3_900_000_010, 0),
            receive_timestamp: NtpTimestamp::new(3_900_000_011, 0),
            transmit_timestamp: NtpTimestamp::new(3_900_000_012, 0),
        },
        extensions: Vec::new(),
        trailer: AuthTrailer::None,
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    let packet = sample_packet();
    let bytes = packet.serialize();

    c.bench_function("packet_serialize", |b| {
        b.iter(|| black_box(packet.serialize()));
    });

    c.bench_function("packet_parse", |b| {
        b.iter(|| black_box(NtpPacket::parse(&bytes).unwrap()));
    });
}

criterion_group!(codec_benches, criterion_benchmark);
criterion_main!(codec_benches);
