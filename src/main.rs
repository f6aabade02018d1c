use std::time::Instant;

use anyhow::Result;
use itertools::Itertools;

use bcf_writer::builder::{WriterBuilder, WriterOption};
use bcf_writer::reader::BcfRecords;
use bcf_writer::record::{Genotype, VariantRecord};
use bcf_writer::types::{FieldType, Header, HeaderFormat, HeaderInfo, InfoNumber};
use bcf_writer::writer::VariantWriter;

/// Writes a synthetic single-sample BCF to the given path, reads it
/// back, and prints per-contig record counts with timings.
fn main() -> Result<()> {
    env_logger::init();
    let args = std::env::args().collect_vec();
    let path = args
        .get(1)
        .map(String::as_str)
        .unwrap_or("synthetic.bcf")
        .to_owned();
    let n_records: usize = args.get(2).map(|n| n.parse()).transpose()?.unwrap_or(10_000);

    let header = Header::new()
        .with_contig("1", Some(249_250_621))
        .with_contig("2", Some(243_199_373))
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
            "DP",
            InfoNumber::Count(1),
            FieldType::Integer,
            "Read depth",
        ))
        .with_sample("SAMPLE");

    let mut now = Instant::now();
    let (mut writer, md5) = WriterBuilder::new()
        .option(WriterOption::ComputeMd5)
        .option(WriterOption::UseAsyncIo)
        .build_path(&path)?;
    writer.write_header(&header)?;
    for i in 0..n_records {
        let contig = if i % 2 == 0 { "1" } else { "2" };
        let start = (i as i64 / 2) * 100 + 1;
        let record = VariantRecord::new(contig, start, vec!["A".into(), "C".into()])
            .with_qual(30.0 + (i % 40) as f64)
            .with_info("DP", (10 + i % 50) as i32)
            .with_genotypes(vec![Genotype::new(
                "SAMPLE",
                vec![Some(0), Some((i % 2) as i32)],
                false,
            )
            .with_attribute("DP", (10 + i % 50) as i32)]);
        writer.add(record)?;
    }
    writer.close()?;
    println!("wrote {} records to {} in {:?}", n_records, path, now.elapsed());
    if let Some(md5) = md5 {
        println!("md5: {}", md5.hex());
    }

    now = Instant::now();
    let records = BcfRecords::from_path(&path)?;
    let counts = records
        .map(|record| record.map(|r| r.chrom))
        .collect::<bcf_writer::error::Result<Vec<_>>>()?
        .into_iter()
        .counts();
    println!("read back {:?} in {:?}", counts, now.elapsed());

    Ok(())
}
