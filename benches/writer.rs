use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use bcf_writer::record::{Genotype, LazyGenotypes, VariantRecord};
use bcf_writer::types::{FieldType, Header, HeaderFormat, HeaderInfo, InfoNumber};
use bcf_writer::writer::{BcfWriter, VariantWriter};

fn bench_header() -> Header {
    Header::new()
        .with_contig("1", Some(249_250_621))
        .with_info(HeaderInfo::new(
            "DP",
            InfoNumber::Count(1),
            FieldType::Integer,
            "Total depth",
        ))
        .with_format(HeaderFormat::new(
            "GT",
            InfoNumber::Count(1),
            FieldType::String,
            "Genotype",
        ))
        .with_format(HeaderFormat::new(
            "PL",
            InfoNumber::Genotypes,
            FieldType::Integer,
            "Phred-scaled likelihoods",
        ))
        .with_sample("S1")
        .with_sample("S2")
}

fn record(start: i64) -> VariantRecord {
    VariantRecord::new("1", start, vec!["A".into(), "C".into()])
        .with_qual(30.0)
        .with_info("DP", 14)
        .with_genotypes(vec![
            Genotype::new("S1", vec![Some(0), Some(1)], false).with_attribute("PL", vec![40, 0, 38]),
            Genotype::new("S2", vec![Some(1), Some(1)], false).with_attribute("PL", vec![70, 12, 0]),
        ])
}

fn write_records(n: usize) -> Vec<u8> {
    let mut writer = BcfWriter::new(Vec::new());
    writer.write_header(&bench_header()).unwrap();
    for i in 0..n {
        writer.add(record((i as i64 + 1) * 10)).unwrap();
    }
    writer.close().unwrap();
    writer.into_inner()
}

fn write_records_lazy(n: usize, payload: &LazyGenotypes) -> Vec<u8> {
    let mut writer = BcfWriter::new(Vec::new());
    writer.write_header(&bench_header()).unwrap();
    for i in 0..n {
        let mut r = record((i as i64 + 1) * 10);
        r.genotypes = Some(bcf_writer::record::GenotypesView::Lazy(payload.clone()));
        writer.add(r).unwrap();
    }
    writer.close().unwrap();
    writer.into_inner()
}

fn benchmark_encode(c: &mut Criterion) {
    let n = 1_000usize;
    let mut group = c.benchmark_group("ENCODE");
    group.bench_with_input(BenchmarkId::new("DECODED", n), &n, |b, &n| {
        b.iter(|| black_box(write_records(n)))
    });

    // carve one record's genotype block out of a reference run
    let bytes = write_records(1);
    let header_len = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
    let at = 9 + header_len;
    let site_len =
        u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]) as usize;
    let gt_len = u32::from_le_bytes([
        bytes[at + 4],
        bytes[at + 5],
        bytes[at + 6],
        bytes[at + 7],
    ]) as usize;
    let gt_start = at + 8 + site_len;
    let payload = LazyGenotypes::new(
        bytes[gt_start..gt_start + gt_len].to_vec(),
        2,
        Arc::new(bench_header()),
    )
    .unwrap();

    group.bench_with_input(BenchmarkId::new("LAZY", n), &n, |b, &n| {
        b.iter(|| black_box(write_records_lazy(n, &payload)))
    });
    group.finish();
}

criterion_group!(benches, benchmark_encode);
criterion_main!(benches);
